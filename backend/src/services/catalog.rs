//! Catalog reference data: units, products, unit factors, sectors, locations,
//! categories and users

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{
    validate_factor, validator_non_negative, validator_not_blank, Actor, LocationStatus, UserRole,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use validator::Validate;

use crate::db;
use crate::error::{AppError, AppResult, ValidationExt};

#[derive(Clone)]
pub struct CatalogService {
    db: SqlitePool,
}

/// Unit of measure
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Unit {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    pub allows_decimal: bool,
}

/// A catalog product
#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub standard_unit_id: i64,
    /// Catalog cost per standard unit
    pub standard_cost: Decimal,
    pub active: bool,
    /// Products that do not track inventory never touch positions or the ledger
    pub tracks_inventory: bool,
}

impl<'r> FromRow<'r, SqliteRow> for Product {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            standard_unit_id: row.try_get("standard_unit_id")?,
            standard_cost: db::decimal(row, "standard_cost")?,
            active: row.try_get("active")?,
            tracks_inventory: row.try_get("tracks_inventory")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Sector {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub id: i64,
    pub sector_id: i64,
    pub name: String,
    pub status: LocationStatus,
}

impl<'r> FromRow<'r, SqliteRow> for Location {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: i64 = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            sector_id: row.try_get("sector_id")?,
            name: row.try_get("name")?,
            status: LocationStatus::from_code(status).map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?,
        })
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

/// Input for creating a product
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewProduct {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub standard_unit_id: i64,
    #[validate(custom = "validator_non_negative")]
    pub standard_cost: Decimal,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub tracks_inventory: bool,
}

fn default_true() -> bool {
    true
}

impl NewProduct {
    pub fn new(name: &str, standard_unit_id: i64, standard_cost: Decimal) -> Self {
        Self {
            name: name.to_string(),
            standard_unit_id,
            standard_cost,
            active: true,
            tracks_inventory: true,
        }
    }
}

/// Input for creating a unit of measure
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewUnit {
    #[validate(length(min = 1, max = 10))]
    pub symbol: String,
    #[validate(custom = "validator_not_blank")]
    pub name: String,
    pub allows_decimal: bool,
}

// ============================================================================
// Connection-level lookups shared by the stock services
// ============================================================================

pub(crate) async fn product(conn: &mut SqliteConnection, product_id: i64) -> AppResult<Product> {
    sqlx::query_as::<_, Product>(
        r#"
        SELECT id, name, standard_unit_id, standard_cost, active, tracks_inventory
        FROM products
        WHERE id = ?
        "#,
    )
    .bind(product_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Product {}", product_id)))
}

pub(crate) async fn unit(conn: &mut SqliteConnection, unit_id: i64) -> AppResult<Unit> {
    sqlx::query_as::<_, Unit>("SELECT id, symbol, name, allows_decimal FROM units WHERE id = ?")
        .bind(unit_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Unit {}", unit_id)))
}

pub(crate) async fn location(conn: &mut SqliteConnection, location_id: i64) -> AppResult<Location> {
    sqlx::query_as::<_, Location>("SELECT id, sector_id, name, status FROM locations WHERE id = ?")
        .bind(location_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Location {}", location_id)))
}

pub(crate) async fn sector_exists(conn: &mut SqliteConnection, sector_id: i64) -> AppResult<bool> {
    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM sectors WHERE id = ?)")
        .bind(sector_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(exists)
}

pub(crate) async fn category_exists(
    conn: &mut SqliteConnection,
    category_id: i64,
) -> AppResult<bool> {
    let exists =
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?)")
            .bind(category_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(exists)
}

/// The internal actor automatic adjustments are posted as
pub(crate) async fn system_actor(conn: &mut SqliteConnection) -> AppResult<Actor> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM users WHERE role = 'system' ORDER BY id LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::DataIntegrity("System user is missing".to_string()))?;

    Ok(Actor::new(id, UserRole::System))
}

pub(crate) async fn insert_product(
    conn: &mut SqliteConnection,
    input: &NewProduct,
) -> AppResult<Product> {
    input.validate()?;
    unit(conn, input.standard_unit_id).await?;

    let product = sqlx::query_as::<_, Product>(
        r#"
        INSERT INTO products (name, standard_unit_id, standard_cost, active, tracks_inventory)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id, name, standard_unit_id, standard_cost, active, tracks_inventory
        "#,
    )
    .bind(input.name.trim())
    .bind(input.standard_unit_id)
    .bind(db::text(input.standard_cost))
    .bind(input.active)
    .bind(input.tracks_inventory)
    .fetch_one(&mut *conn)
    .await?;

    Ok(product)
}

impl CatalogService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create a unit of measure with a unique symbol
    pub async fn create_unit(&self, input: NewUnit) -> AppResult<Unit> {
        input.validate()?;
        let symbol = input.symbol.trim().to_uppercase();

        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM units WHERE symbol = ?)")
            .bind(&symbol)
            .fetch_one(&self.db)
            .await?;
        if exists {
            return Err(AppError::validation("symbol", format!("Unit {} already exists", symbol)));
        }

        let unit = sqlx::query_as::<_, Unit>(
            r#"
            INSERT INTO units (symbol, name, allows_decimal)
            VALUES (?, ?, ?)
            RETURNING id, symbol, name, allows_decimal
            "#,
        )
        .bind(&symbol)
        .bind(input.name.trim())
        .bind(input.allows_decimal)
        .fetch_one(&self.db)
        .await?;

        Ok(unit)
    }

    pub async fn unit_by_symbol(&self, symbol: &str) -> AppResult<Unit> {
        sqlx::query_as::<_, Unit>(
            "SELECT id, symbol, name, allows_decimal FROM units WHERE symbol = ?",
        )
        .bind(symbol.trim().to_uppercase())
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Unit {}", symbol)))
    }

    pub async fn create_product(&self, input: NewProduct) -> AppResult<Product> {
        let mut conn = self.db.acquire().await?;
        insert_product(&mut conn, &input).await
    }

    pub async fn get_product(&self, product_id: i64) -> AppResult<Product> {
        let mut conn = self.db.acquire().await?;
        product(&mut conn, product_id).await
    }

    /// Update the catalog cost used for entries without an explicit cost
    pub async fn set_standard_cost(&self, product_id: i64, cost: Decimal) -> AppResult<()> {
        shared::validate_unit_cost(cost).for_field("standard_cost")?;
        let result = sqlx::query("UPDATE products SET standard_cost = ? WHERE id = ?")
            .bind(db::text(cost))
            .bind(product_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Product {}", product_id)));
        }
        Ok(())
    }

    /// Register or replace the factor converting `unit_id` into the product's standard unit
    pub async fn set_unit_factor(
        &self,
        product_id: i64,
        unit_id: i64,
        factor: Decimal,
    ) -> AppResult<()> {
        validate_factor(factor).for_field("factor")?;

        let mut conn = self.db.acquire().await?;
        let product = product(&mut conn, product_id).await?;
        unit(&mut conn, unit_id).await?;
        if product.standard_unit_id == unit_id && factor != Decimal::ONE {
            return Err(AppError::validation(
                "factor",
                "The standard unit always converts with factor 1",
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO product_units (product_id, unit_id, factor) VALUES (?, ?, ?)
            ON CONFLICT(product_id, unit_id) DO UPDATE SET factor = excluded.factor
            "#,
        )
        .bind(product_id)
        .bind(unit_id)
        .bind(db::text(factor))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn create_sector(&self, name: &str) -> AppResult<Sector> {
        validator_not_blank(name).map_err(|_| AppError::validation("name", "Sector name is required"))?;
        let sector = sqlx::query_as::<_, Sector>(
            "INSERT INTO sectors (name) VALUES (?) RETURNING id, name",
        )
        .bind(name.trim())
        .fetch_one(&self.db)
        .await?;
        Ok(sector)
    }

    pub async fn create_location(&self, sector_id: i64, name: &str) -> AppResult<Location> {
        validator_not_blank(name)
            .map_err(|_| AppError::validation("name", "Location name is required"))?;

        let mut conn = self.db.acquire().await?;
        if !sector_exists(&mut conn, sector_id).await? {
            return Err(AppError::NotFound(format!("Sector {}", sector_id)));
        }

        let location = sqlx::query_as::<_, Location>(
            r#"
            INSERT INTO locations (sector_id, name, status) VALUES (?, ?, 0)
            RETURNING id, sector_id, name, status
            "#,
        )
        .bind(sector_id)
        .bind(name.trim())
        .fetch_one(&mut *conn)
        .await?;
        Ok(location)
    }

    pub async fn get_location(&self, location_id: i64) -> AppResult<Location> {
        let mut conn = self.db.acquire().await?;
        location(&mut conn, location_id).await
    }

    pub async fn list_locations(&self) -> AppResult<Vec<Location>> {
        let locations = sqlx::query_as::<_, Location>(
            "SELECT id, sector_id, name, status FROM locations ORDER BY sector_id, name",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(locations)
    }

    pub async fn create_category(&self, name: &str) -> AppResult<Category> {
        validator_not_blank(name)
            .map_err(|_| AppError::validation("name", "Category name is required"))?;
        let category = sqlx::query_as::<_, Category>(
            "INSERT INTO categories (name) VALUES (?) RETURNING id, name",
        )
        .bind(name.trim())
        .fetch_one(&self.db)
        .await?;
        Ok(category)
    }

    pub async fn link_category(&self, product_id: i64, category_id: i64) -> AppResult<()> {
        let mut conn = self.db.acquire().await?;
        product(&mut conn, product_id).await?;
        if !category_exists(&mut conn, category_id).await? {
            return Err(AppError::NotFound(format!("Category {}", category_id)));
        }
        sqlx::query(
            "INSERT OR IGNORE INTO product_categories (product_id, category_id) VALUES (?, ?)",
        )
        .bind(product_id)
        .bind(category_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Register a user and return the actor handle used by the services
    pub async fn create_user(&self, name: &str, role: UserRole) -> AppResult<Actor> {
        validator_not_blank(name).map_err(|_| AppError::validation("name", "User name is required"))?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (name, role) VALUES (?, ?) RETURNING id",
        )
        .bind(name.trim())
        .bind(role.as_str())
        .fetch_one(&self.db)
        .await?;
        Ok(Actor::new(id, role))
    }

    pub async fn system_actor(&self) -> AppResult<Actor> {
        let mut conn = self.db.acquire().await?;
        system_actor(&mut conn).await
    }
}
