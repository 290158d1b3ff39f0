//! Append-only movement ledger
//!
//! Rows are inserted once and never updated or deleted; the schema enforces
//! this with triggers. Positions are derived from this log.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use shared::{MovementType, StockScope};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};

use super::audit::{self, AuditAction};
use crate::db;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct LedgerService {
    db: SqlitePool,
}

/// A committed ledger entry
#[derive(Debug, Clone, Serialize)]
pub struct Movement {
    pub id: i64,
    pub product_id: i64,
    pub movement_type: MovementType,
    pub reason: String,
    /// Standard-unit quantity, always positive
    pub quantity: Decimal,
    pub entered_quantity: Decimal,
    pub entered_unit: String,
    pub entered_factor: Decimal,
    pub unit_cost: Decimal,
    /// Negative for exits
    pub total_value: Decimal,
    pub origin_sector_id: Option<i64>,
    pub origin_location_id: Option<i64>,
    pub destination_sector_id: Option<i64>,
    pub destination_location_id: Option<i64>,
    pub batch_id: Option<i64>,
    pub user_id: Option<i64>,
    pub origin: Option<String>,
    pub observation: Option<String>,
    pub moved_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Movement {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            movement_type: db::code(row, "movement_type")?,
            reason: row.try_get("reason")?,
            quantity: db::decimal(row, "quantity")?,
            entered_quantity: db::decimal(row, "entered_quantity")?,
            entered_unit: row.try_get("entered_unit")?,
            entered_factor: db::decimal(row, "entered_factor")?,
            unit_cost: db::decimal(row, "unit_cost")?,
            total_value: db::decimal(row, "total_value")?,
            origin_sector_id: row.try_get("origin_sector_id")?,
            origin_location_id: row.try_get("origin_location_id")?,
            destination_sector_id: row.try_get("destination_sector_id")?,
            destination_location_id: row.try_get("destination_location_id")?,
            batch_id: row.try_get("batch_id")?,
            user_id: row.try_get("user_id")?,
            origin: row.try_get("origin")?,
            observation: row.try_get("observation")?,
            moved_at: row.try_get("moved_at")?,
        })
    }
}

impl Movement {
    pub fn origin_scope(&self) -> StockScope {
        StockScope {
            sector_id: self.origin_sector_id,
            location_id: self.origin_location_id,
        }
    }

    pub fn destination_scope(&self) -> StockScope {
        StockScope {
            sector_id: self.destination_sector_id,
            location_id: self.destination_location_id,
        }
    }

    /// Quantity with the direction applied
    pub fn signed_quantity(&self) -> Decimal {
        self.movement_type.signed(self.quantity)
    }
}

/// A ledger entry about to be appended
#[derive(Debug, Clone)]
pub struct NewMovement {
    pub product_id: i64,
    pub movement_type: MovementType,
    pub reason: String,
    pub quantity: Decimal,
    pub entered_quantity: Decimal,
    pub entered_unit: String,
    pub entered_factor: Decimal,
    pub unit_cost: Decimal,
    pub origin: StockScope,
    pub destination: StockScope,
    pub batch_id: Option<i64>,
    pub user_id: Option<i64>,
    pub origin_label: Option<String>,
    pub observation: Option<String>,
}

impl NewMovement {
    /// Signed value of the entry: negative for exits
    pub fn total_value(&self) -> Decimal {
        self.movement_type.signed(self.quantity * self.unit_cost)
    }
}

const MOVEMENT_COLUMNS: &str = r#"
    id, product_id, movement_type, reason, quantity, entered_quantity, entered_unit,
    entered_factor, unit_cost, total_value, origin_sector_id, origin_location_id,
    destination_sector_id, destination_location_id, batch_id, user_id, origin,
    observation, moved_at
"#;

/// Append one entry and return its id
pub async fn append(conn: &mut SqliteConnection, movement: &NewMovement) -> AppResult<i64> {
    if movement.reason.trim().is_empty() {
        return Err(AppError::validation("reason", "Movement reason is required"));
    }

    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO movements (
            product_id, movement_type, reason, quantity, entered_quantity, entered_unit,
            entered_factor, unit_cost, total_value, origin_sector_id, origin_location_id,
            destination_sector_id, destination_location_id, batch_id, user_id, origin,
            observation, moved_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(movement.product_id)
    .bind(movement.movement_type.as_str())
    .bind(&movement.reason)
    .bind(db::text(movement.quantity))
    .bind(db::text(movement.entered_quantity))
    .bind(&movement.entered_unit)
    .bind(db::text(movement.entered_factor))
    .bind(db::text(movement.unit_cost))
    .bind(db::text(movement.total_value()))
    .bind(movement.origin.sector_id)
    .bind(movement.origin.location_id)
    .bind(movement.destination.sector_id)
    .bind(movement.destination.location_id)
    .bind(movement.batch_id)
    .bind(movement.user_id)
    .bind(&movement.origin_label)
    .bind(&movement.observation)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    audit::record(
        conn,
        AuditAction::MovementRecorded,
        &format!(
            "{} {} x{} of product {} ({})",
            movement.movement_type.as_str(),
            movement.reason,
            movement.quantity.normalize(),
            movement.product_id,
            movement.origin_label.as_deref().unwrap_or("manual")
        ),
    )
    .await?;

    Ok(id)
}

/// Every entry, oldest first
pub(crate) async fn all_in_order(conn: &mut SqliteConnection) -> AppResult<Vec<Movement>> {
    let movements = sqlx::query_as::<_, Movement>(&format!(
        "SELECT {} FROM movements ORDER BY moved_at ASC, id ASC",
        MOVEMENT_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(movements)
}

/// Entries of one product, oldest first
pub(crate) async fn for_product(
    conn: &mut SqliteConnection,
    product_id: i64,
) -> AppResult<Vec<Movement>> {
    let movements = sqlx::query_as::<_, Movement>(&format!(
        "SELECT {} FROM movements WHERE product_id = ? ORDER BY moved_at ASC, id ASC",
        MOVEMENT_COLUMNS
    ))
    .bind(product_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(movements)
}

/// Entries dated within `[start, end]` (calendar days, UTC), optionally
/// restricted to products of a category
pub(crate) async fn in_period(
    conn: &mut SqliteConnection,
    start: NaiveDate,
    end: NaiveDate,
    category_id: Option<i64>,
) -> AppResult<Vec<Movement>> {
    let movements = sqlx::query_as::<_, Movement>(&format!(
        r#"
        SELECT {}
        FROM movements
        WHERE DATE(moved_at) BETWEEN ? AND ?
          AND (? IS NULL OR product_id IN (
                SELECT product_id FROM product_categories WHERE category_id = ?))
        ORDER BY moved_at ASC, id ASC
        "#,
        MOVEMENT_COLUMNS
    ))
    .bind(start)
    .bind(end)
    .bind(category_id)
    .bind(category_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(movements)
}

impl LedgerService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Append an entry in its own unit of work
    pub async fn append(&self, movement: &NewMovement) -> AppResult<i64> {
        let mut tx = db::begin_write(&self.db).await?;
        let id = append(&mut tx, movement).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn get(&self, movement_id: i64) -> AppResult<Movement> {
        sqlx::query_as::<_, Movement>(&format!(
            "SELECT {} FROM movements WHERE id = ?",
            MOVEMENT_COLUMNS
        ))
        .bind(movement_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Movement {}", movement_id)))
    }

    /// Entries posted by one batch, in posting order
    pub async fn for_batch(&self, batch_id: i64) -> AppResult<Vec<Movement>> {
        let movements = sqlx::query_as::<_, Movement>(&format!(
            "SELECT {} FROM movements WHERE batch_id = ? ORDER BY id ASC",
            MOVEMENT_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.db)
        .await?;
        Ok(movements)
    }

    pub async fn for_product(&self, product_id: i64) -> AppResult<Vec<Movement>> {
        let mut conn = self.db.acquire().await?;
        for_product(&mut conn, product_id).await
    }

    pub async fn count(&self) -> AppResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM movements")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }
}
