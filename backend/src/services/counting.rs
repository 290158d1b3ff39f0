//! Physical counting: count rows, location progress and occurrences
//!
//! Every count stores a snapshot of the conversion factor, the standard
//! quantity and the catalog cost at the moment it is written, so later catalog
//! changes never rewrite history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{validate_quantity, validator_positive, Actor, LocationStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use validator::Validate;

use super::audit::{self, AuditAction};
use super::catalog::{self, NewProduct, Product};
use super::conversion;
use super::cycle;
use crate::db;
use crate::error::{AppError, AppResult, ValidationExt};

#[derive(Clone)]
pub struct CountingService {
    db: SqlitePool,
}

/// One counted quantity with its snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Count {
    pub id: i64,
    pub cycle_id: i64,
    pub product_id: i64,
    pub location_id: i64,
    pub user_id: i64,
    pub quantity: Decimal,
    pub unit_id: i64,
    pub factor: Decimal,
    pub standard_quantity: Decimal,
    pub unit_cost_snapshot: Decimal,
    pub standard_unit_symbol: String,
    pub counted_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Count {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            cycle_id: row.try_get("cycle_id")?,
            product_id: row.try_get("product_id")?,
            location_id: row.try_get("location_id")?,
            user_id: row.try_get("user_id")?,
            quantity: db::decimal(row, "quantity")?,
            unit_id: row.try_get("unit_id")?,
            factor: db::decimal(row, "factor")?,
            standard_quantity: db::decimal(row, "standard_quantity")?,
            unit_cost_snapshot: db::decimal(row, "unit_cost_snapshot")?,
            standard_unit_symbol: row.try_get("standard_unit_symbol")?,
            counted_at: row.try_get("counted_at")?,
        })
    }
}

impl Count {
    /// Value of the counted stock at the snapshot cost
    pub fn value(&self) -> Decimal {
        self.standard_quantity * self.unit_cost_snapshot
    }
}

/// An item counted that matches no catalog product
#[derive(Debug, Clone, Serialize)]
pub struct Occurrence {
    pub id: i64,
    pub cycle_id: i64,
    pub location_id: i64,
    pub user_id: Option<i64>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_id: i64,
    pub resolved: bool,
    pub note: Option<String>,
    pub reported_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Occurrence {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            cycle_id: row.try_get("cycle_id")?,
            location_id: row.try_get("location_id")?,
            user_id: row.try_get("user_id")?,
            description: row.try_get("description")?,
            quantity: db::decimal(row, "quantity")?,
            unit_id: row.try_get("unit_id")?,
            resolved: row.try_get("resolved")?,
            note: row.try_get("note")?,
            reported_at: row.try_get("reported_at")?,
        })
    }
}

/// Input for recording a count
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RecordCountInput {
    pub location_id: i64,
    pub product_id: i64,
    /// Defaults to the product's standard unit
    pub unit_id: Option<i64>,
    #[validate(custom = "validator_positive")]
    pub quantity: Decimal,
}

/// Input for reporting an occurrence
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReportOccurrenceInput {
    pub location_id: i64,
    #[validate(length(min = 1, max = 500))]
    pub description: String,
    #[validate(custom = "validator_positive")]
    pub quantity: Decimal,
    pub unit_id: i64,
}

const COUNT_COLUMNS: &str = r#"
    id, cycle_id, product_id, location_id, user_id, quantity, unit_id, factor,
    standard_quantity, unit_cost_snapshot, standard_unit_symbol, counted_at
"#;

const OCCURRENCE_COLUMNS: &str =
    "id, cycle_id, location_id, user_id, description, quantity, unit_id, resolved, note, reported_at";

/// Write a count row with its snapshot and mark the location in progress
pub(crate) async fn insert_count(
    conn: &mut SqliteConnection,
    cycle_id: i64,
    location_id: i64,
    product: &Product,
    unit_id: i64,
    quantity: Decimal,
    actor: &Actor,
) -> AppResult<Count> {
    validate_quantity(quantity).for_field("quantity")?;
    if !product.active {
        return Err(AppError::validation(
            "product_id",
            format!("{} is inactive", product.name),
        ));
    }

    catalog::location(conn, location_id).await?;
    catalog::unit(conn, unit_id).await?;
    let factor = conversion::resolve_factor(conn, product, unit_id).await?;
    let standard_unit = catalog::unit(conn, product.standard_unit_id).await?;

    let count = sqlx::query_as::<_, Count>(&format!(
        r#"
        INSERT INTO counts (
            cycle_id, product_id, location_id, user_id, quantity, unit_id, factor,
            standard_quantity, unit_cost_snapshot, standard_unit_symbol, counted_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {}
        "#,
        COUNT_COLUMNS
    ))
    .bind(cycle_id)
    .bind(product.id)
    .bind(location_id)
    .bind(actor.user_id)
    .bind(db::text(quantity))
    .bind(unit_id)
    .bind(db::text(factor))
    .bind(db::text(quantity * factor))
    .bind(db::text(product.standard_cost))
    .bind(&standard_unit.symbol)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE locations SET status = ? WHERE id = ? AND status = ?")
        .bind(LocationStatus::InProgress.code())
        .bind(location_id)
        .bind(LocationStatus::Pending.code())
        .execute(&mut *conn)
        .await?;

    Ok(count)
}

async fn load_count(conn: &mut SqliteConnection, count_id: i64) -> AppResult<Count> {
    sqlx::query_as::<_, Count>(&format!("SELECT {} FROM counts WHERE id = ?", COUNT_COLUMNS))
        .bind(count_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Count {}", count_id)))
}

async fn load_occurrence(conn: &mut SqliteConnection, occurrence_id: i64) -> AppResult<Occurrence> {
    sqlx::query_as::<_, Occurrence>(&format!(
        "SELECT {} FROM occurrences WHERE id = ?",
        OCCURRENCE_COLUMNS
    ))
    .bind(occurrence_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Occurrence {}", occurrence_id)))
}

/// Unresolved occurrences blocking the close of a cycle
pub(crate) async fn pending_occurrence_count(
    conn: &mut SqliteConnection,
    cycle_id: i64,
) -> AppResult<i64> {
    let pending = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM occurrences WHERE cycle_id = ? AND resolved = 0",
    )
    .bind(cycle_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(pending)
}

pub(crate) async fn counts_for_cycle(
    conn: &mut SqliteConnection,
    cycle_id: i64,
) -> AppResult<Vec<Count>> {
    let counts = sqlx::query_as::<_, Count>(&format!(
        "SELECT {} FROM counts WHERE cycle_id = ? ORDER BY product_id, id",
        COUNT_COLUMNS
    ))
    .bind(cycle_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(counts)
}

/// Resolve an occurrence into a count for `product`
async fn link(
    conn: &mut SqliteConnection,
    occurrence_id: i64,
    product: &Product,
    actor: &Actor,
) -> AppResult<Count> {
    let occurrence = load_occurrence(conn, occurrence_id).await?;
    if occurrence.resolved {
        return Err(AppError::InvalidStateTransition(format!(
            "Occurrence {} is already resolved",
            occurrence_id
        )));
    }
    let cycle = cycle::load_cycle(conn, occurrence.cycle_id).await?;
    cycle::ensure_open(&cycle)?;

    let count = insert_count(
        conn,
        cycle.id,
        occurrence.location_id,
        product,
        occurrence.unit_id,
        occurrence.quantity,
        actor,
    )
    .await?;

    sqlx::query("UPDATE occurrences SET resolved = 1, note = ? WHERE id = ?")
        .bind(format!("Linked to product {} (count {})", product.name, count.id))
        .bind(occurrence_id)
        .execute(&mut *conn)
        .await?;
    audit::record(
        conn,
        AuditAction::OccurrenceLinked,
        &format!(
            "Occurrence {} '{}' linked to {}",
            occurrence_id, occurrence.description, product.name
        ),
    )
    .await?;

    Ok(count)
}

impl CountingService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Record a count against the open cycle
    pub async fn record_count(&self, input: RecordCountInput, actor: &Actor) -> AppResult<Count> {
        input.validate()?;

        let mut tx = db::begin_write(&self.db).await?;
        let cycle = cycle::require_open(&mut tx).await?;
        let product = catalog::product(&mut tx, input.product_id).await?;
        let unit_id = input.unit_id.unwrap_or(product.standard_unit_id);
        let count = insert_count(
            &mut tx,
            cycle.id,
            input.location_id,
            &product,
            unit_id,
            input.quantity,
            actor,
        )
        .await?;
        tx.commit().await?;

        tracing::debug!(
            "Counted {} x{} ({} standard) at location {}",
            product.name,
            count.quantity,
            count.standard_quantity,
            count.location_id
        );
        Ok(count)
    }

    pub async fn get_count(&self, count_id: i64) -> AppResult<Count> {
        let mut conn = self.db.acquire().await?;
        load_count(&mut conn, count_id).await
    }

    pub async fn counts_for_cycle(&self, cycle_id: i64) -> AppResult<Vec<Count>> {
        let mut conn = self.db.acquire().await?;
        counts_for_cycle(&mut conn, cycle_id).await
    }

    /// Replace the entered quantity, keeping the stored factor and cost snapshot
    pub async fn correct_count(
        &self,
        count_id: i64,
        quantity: Decimal,
        actor: &Actor,
    ) -> AppResult<Count> {
        if !actor.can_manage() {
            return Err(AppError::InsufficientPermissions);
        }
        validate_quantity(quantity).for_field("quantity")?;

        let mut tx = db::begin_write(&self.db).await?;
        let current = load_count(&mut tx, count_id).await?;
        let count = sqlx::query_as::<_, Count>(&format!(
            "UPDATE counts SET quantity = ?, standard_quantity = ? WHERE id = ? RETURNING {}",
            COUNT_COLUMNS
        ))
        .bind(db::text(quantity))
        .bind(db::text(quantity * current.factor))
        .bind(count_id)
        .fetch_one(&mut *tx)
        .await?;
        audit::record(
            &mut tx,
            AuditAction::CountCorrected,
            &format!(
                "Count {} corrected from {} to {} by user {}",
                count_id,
                current.quantity.normalize(),
                quantity.normalize(),
                actor.user_id
            ),
        )
        .await?;
        tx.commit().await?;

        Ok(count)
    }

    /// Remove a count while its cycle is still open
    pub async fn delete_count(&self, count_id: i64, actor: &Actor) -> AppResult<()> {
        if !actor.can_manage() {
            return Err(AppError::InsufficientPermissions);
        }

        let mut tx = db::begin_write(&self.db).await?;
        let count = load_count(&mut tx, count_id).await?;
        let cycle = cycle::load_cycle(&mut tx, count.cycle_id).await?;
        cycle::ensure_open(&cycle)?;

        sqlx::query("DELETE FROM counts WHERE id = ?")
            .bind(count_id)
            .execute(&mut *tx)
            .await?;
        audit::record(
            &mut tx,
            AuditAction::CountDeleted,
            &format!(
                "Count {} of product {} ({}) deleted by user {}",
                count_id,
                count.product_id,
                count.quantity.normalize(),
                actor.user_id
            ),
        )
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Mark a location as fully counted
    pub async fn finish_location(&self, location_id: i64) -> AppResult<()> {
        let result = sqlx::query("UPDATE locations SET status = ? WHERE id = ?")
            .bind(LocationStatus::Done.code())
            .bind(location_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Location {}", location_id)));
        }
        Ok(())
    }

    /// Report something counted that matches no catalog product
    pub async fn report_occurrence(
        &self,
        input: ReportOccurrenceInput,
        actor: &Actor,
    ) -> AppResult<Occurrence> {
        input.validate()?;

        let mut tx = db::begin_write(&self.db).await?;
        let cycle = cycle::require_open(&mut tx).await?;
        catalog::location(&mut tx, input.location_id).await?;
        catalog::unit(&mut tx, input.unit_id).await?;

        let occurrence = sqlx::query_as::<_, Occurrence>(&format!(
            r#"
            INSERT INTO occurrences (cycle_id, location_id, user_id, description, quantity, unit_id, reported_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            OCCURRENCE_COLUMNS
        ))
        .bind(cycle.id)
        .bind(input.location_id)
        .bind(actor.user_id)
        .bind(input.description.trim())
        .bind(db::text(input.quantity))
        .bind(input.unit_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            "Occurrence {} reported in cycle #{}",
            occurrence.id,
            occurrence.cycle_id
        );
        Ok(occurrence)
    }

    /// Resolve an occurrence by counting it as an existing product
    pub async fn link_occurrence(
        &self,
        occurrence_id: i64,
        product_id: i64,
        actor: &Actor,
    ) -> AppResult<Count> {
        let mut tx = db::begin_write(&self.db).await?;
        let product = catalog::product(&mut tx, product_id).await?;
        let count = link(&mut tx, occurrence_id, &product, actor).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Create the product an occurrence describes, then link it
    pub async fn register_product_from_occurrence(
        &self,
        occurrence_id: i64,
        input: NewProduct,
        actor: &Actor,
    ) -> AppResult<(Product, Count)> {
        let mut tx = db::begin_write(&self.db).await?;
        let product = catalog::insert_product(&mut tx, &input).await?;
        let count = link(&mut tx, occurrence_id, &product, actor).await?;
        tx.commit().await?;

        tracing::info!(
            "Product {} registered from occurrence {}",
            product.id,
            occurrence_id
        );
        Ok((product, count))
    }

    /// Resolve an occurrence without counting anything
    pub async fn reject_occurrence(
        &self,
        occurrence_id: i64,
        note: &str,
        actor: &Actor,
    ) -> AppResult<Occurrence> {
        if note.trim().is_empty() {
            return Err(AppError::validation("note", "A note is required to reject an occurrence"));
        }

        let mut tx = db::begin_write(&self.db).await?;
        let occurrence = load_occurrence(&mut tx, occurrence_id).await?;
        if occurrence.resolved {
            return Err(AppError::InvalidStateTransition(format!(
                "Occurrence {} is already resolved",
                occurrence_id
            )));
        }

        let occurrence = sqlx::query_as::<_, Occurrence>(&format!(
            "UPDATE occurrences SET resolved = 1, note = ? WHERE id = ? RETURNING {}",
            OCCURRENCE_COLUMNS
        ))
        .bind(format!("Rejected: {}", note.trim()))
        .bind(occurrence_id)
        .fetch_one(&mut *tx)
        .await?;
        audit::record(
            &mut tx,
            AuditAction::OccurrenceRejected,
            &format!(
                "Occurrence {} rejected by user {}: {}",
                occurrence_id,
                actor.user_id,
                note.trim()
            ),
        )
        .await?;
        tx.commit().await?;

        Ok(occurrence)
    }

    /// Unresolved occurrences of a cycle, oldest first
    pub async fn pending_occurrences(&self, cycle_id: i64) -> AppResult<Vec<Occurrence>> {
        let occurrences = sqlx::query_as::<_, Occurrence>(&format!(
            "SELECT {} FROM occurrences WHERE cycle_id = ? AND resolved = 0 ORDER BY reported_at, id",
            OCCURRENCE_COLUMNS
        ))
        .bind(cycle_id)
        .fetch_all(&self.db)
        .await?;
        Ok(occurrences)
    }
}
