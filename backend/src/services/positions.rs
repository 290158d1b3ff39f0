//! Stock position store
//!
//! One row per (product, sector, location) key holding balance, total value and
//! moving-average cost. Scope fields are normalized to the active granularity
//! before every read and write. Under central control, reads sum every row of
//! the product and writes land on the scope-less row.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use shared::{MovementType, PositionChange, PositionValue, StockGranularity, StockScope, StockSettings};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};

use super::audit::{self, AuditAction};
use super::ledger::{self, Movement};
use crate::db;
use crate::error::AppResult;

#[derive(Clone)]
pub struct PositionService {
    db: SqlitePool,
}

/// A stored stock position row
#[derive(Debug, Clone, Serialize)]
pub struct StockPosition {
    pub id: i64,
    pub product_id: i64,
    pub sector_id: Option<i64>,
    pub location_id: Option<i64>,
    pub balance: Decimal,
    pub total_value: Decimal,
    pub average_cost: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for StockPosition {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            sector_id: row.try_get("sector_id")?,
            location_id: row.try_get("location_id")?,
            balance: db::decimal(row, "balance")?,
            total_value: db::decimal(row, "total_value")?,
            average_cost: db::decimal(row, "average_cost")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StockPosition {
    pub fn scope(&self) -> StockScope {
        StockScope {
            sector_id: self.sector_id,
            location_id: self.location_id,
        }
    }

    pub fn value(&self) -> PositionValue {
        PositionValue {
            balance: self.balance,
            total_value: self.total_value,
            average_cost: self.average_cost,
        }
    }
}

/// Summary of a ledger replay
#[derive(Debug, Clone, Serialize)]
pub struct RebuildSummary {
    pub movements_replayed: usize,
    pub positions_touched: usize,
}

const POSITION_COLUMNS: &str =
    "id, product_id, sector_id, location_id, balance, total_value, average_cost, updated_at";

async fn rows_for_product(
    conn: &mut SqliteConnection,
    product_id: i64,
) -> AppResult<Vec<StockPosition>> {
    let rows = sqlx::query_as::<_, StockPosition>(&format!(
        "SELECT {} FROM stock_positions WHERE product_id = ? ORDER BY id",
        POSITION_COLUMNS
    ))
    .bind(product_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

async fn row_at(
    conn: &mut SqliteConnection,
    product_id: i64,
    key: StockScope,
) -> AppResult<Option<StockPosition>> {
    let row = sqlx::query_as::<_, StockPosition>(&format!(
        "SELECT {} FROM stock_positions WHERE product_id = ? AND sector_id IS ? AND location_id IS ?",
        POSITION_COLUMNS
    ))
    .bind(product_id)
    .bind(key.sector_id)
    .bind(key.location_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn write_row(
    conn: &mut SqliteConnection,
    product_id: i64,
    key: StockScope,
    existing: Option<i64>,
    value: PositionValue,
) -> AppResult<()> {
    match existing {
        Some(id) => {
            sqlx::query(
                r#"
                UPDATE stock_positions
                SET balance = ?, total_value = ?, average_cost = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(db::text(value.balance))
            .bind(db::text(value.total_value))
            .bind(db::text(value.average_cost))
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO stock_positions
                    (product_id, sector_id, location_id, balance, total_value, average_cost, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(product_id)
            .bind(key.sector_id)
            .bind(key.location_id)
            .bind(db::text(value.balance))
            .bind(db::text(value.total_value))
            .bind(db::text(value.average_cost))
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Position at the scope resolved for `granularity`, zero if none exists yet
pub async fn position_value(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    product_id: i64,
    scope: StockScope,
) -> AppResult<PositionValue> {
    if granularity == StockGranularity::Central {
        let rows = rows_for_product(conn, product_id).await?;
        return Ok(PositionValue::aggregate(rows.iter().map(StockPosition::value)));
    }

    let key = granularity.normalize(scope);
    Ok(row_at(conn, product_id, key)
        .await?
        .map(|row| row.value())
        .unwrap_or_default())
}

pub async fn balance(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    product_id: i64,
    scope: StockScope,
) -> AppResult<Decimal> {
    Ok(position_value(conn, granularity, product_id, scope)
        .await?
        .balance)
}

pub async fn average_cost(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    product_id: i64,
    scope: StockScope,
) -> AppResult<Decimal> {
    Ok(position_value(conn, granularity, product_id, scope)
        .await?
        .average_cost)
}

/// Fold scoped rows left over from a finer granularity into the scope-less row.
///
/// The product's total balance and value are unchanged; afterwards the
/// scope-less row alone carries them.
async fn consolidate(conn: &mut SqliteConnection, product_id: i64) -> AppResult<Option<StockPosition>> {
    let rows = rows_for_product(conn, product_id).await?;
    let company = rows.iter().find(|r| r.scope().is_empty()).cloned();
    let scoped: Vec<&StockPosition> = rows
        .iter()
        .filter(|r| !r.scope().is_empty() && (!r.balance.is_zero() || !r.total_value.is_zero()))
        .collect();

    if scoped.is_empty() {
        return Ok(company);
    }

    let merged = PositionValue::aggregate(rows.iter().map(StockPosition::value));
    for row in &scoped {
        write_row(conn, product_id, row.scope(), Some(row.id), PositionValue::default()).await?;
    }
    write_row(
        conn,
        product_id,
        StockScope::company(),
        company.as_ref().map(|c| c.id),
        merged,
    )
    .await?;
    tracing::debug!(
        "Consolidated {} scoped position(s) of product {} into the central row",
        scoped.len(),
        product_id
    );

    row_at(conn, product_id, StockScope::company()).await
}

/// Apply a signed standard-unit quantity to a position.
///
/// Incoming stock is valued at `unit_cost` (or the current average when
/// absent); outgoing stock always at the current average. Never fails on
/// insufficient stock: callers check sufficiency first.
pub async fn apply_delta(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    product_id: i64,
    quantity: Decimal,
    scope: StockScope,
    unit_cost: Option<Decimal>,
) -> AppResult<PositionChange> {
    let key = granularity.normalize(scope);

    let existing = if granularity == StockGranularity::Central {
        consolidate(conn, product_id).await?
    } else {
        row_at(conn, product_id, key).await?
    };

    let current = existing.as_ref().map(|r| r.value()).unwrap_or_default();
    let change = current.apply(quantity, unit_cost);
    write_row(conn, product_id, key, existing.map(|r| r.id), change.after).await?;

    tracing::debug!(
        "Position of product {} at {:?}: {} -> {} (value {})",
        product_id,
        key,
        current.balance,
        change.after.balance,
        change.after.total_value
    );

    Ok(change)
}

/// Split a company-wide outgoing quantity across the rows holding stock.
///
/// Shares are proportional to each row's balance, so valuing every share at
/// its row's average removes `quantity` times the company-wide average. Only
/// rows addressable under `granularity` take part; anything they cannot cover
/// falls to the scope-less row.
pub(crate) async fn exit_shares(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    product_id: i64,
    quantity: Decimal,
) -> AppResult<Vec<(StockScope, Decimal)>> {
    if granularity == StockGranularity::Central {
        return Ok(vec![(StockScope::company(), quantity)]);
    }

    let stocked: Vec<StockPosition> = rows_for_product(conn, product_id)
        .await?
        .into_iter()
        .filter(|r| r.balance > Decimal::ZERO && granularity.normalize(r.scope()) == r.scope())
        .collect();
    let available = stocked
        .iter()
        .fold(Decimal::ZERO, |total, row| total + row.balance);

    let mut shares = Vec::new();
    if available <= quantity {
        shares.extend(stocked.iter().map(|row| (row.scope(), row.balance)));
        let uncovered = quantity - available;
        if uncovered > Decimal::ZERO {
            shares.push((StockScope::company(), uncovered));
        }
        return Ok(shares);
    }

    let mut remaining = quantity;
    for (i, row) in stocked.iter().enumerate() {
        let share = if i + 1 == stocked.len() {
            remaining
        } else {
            (quantity * row.balance / available).round_dp(10)
        }
        .min(remaining)
        .min(row.balance);
        if share > Decimal::ZERO {
            shares.push((row.scope(), share));
            remaining -= share;
        }
    }
    Ok(shares)
}

/// Replay one ledger row onto the positions
async fn replay(
    conn: &mut SqliteConnection,
    granularity: StockGranularity,
    movement: &Movement,
) -> AppResult<()> {
    match movement.movement_type {
        MovementType::Entry => {
            apply_delta(
                conn,
                granularity,
                movement.product_id,
                movement.quantity,
                movement.destination_scope(),
                Some(movement.unit_cost),
            )
            .await?;
        }
        MovementType::Exit => {
            apply_delta(
                conn,
                granularity,
                movement.product_id,
                -movement.quantity,
                movement.origin_scope(),
                None,
            )
            .await?;
        }
    }
    Ok(())
}

impl PositionService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get_balance(
        &self,
        product_id: i64,
        scope: StockScope,
        settings: &StockSettings,
    ) -> AppResult<Decimal> {
        let mut conn = self.db.acquire().await?;
        balance(&mut conn, settings.granularity, product_id, scope).await
    }

    pub async fn get_average_cost(
        &self,
        product_id: i64,
        scope: StockScope,
        settings: &StockSettings,
    ) -> AppResult<Decimal> {
        let mut conn = self.db.acquire().await?;
        average_cost(&mut conn, settings.granularity, product_id, scope).await
    }

    pub async fn get_position(
        &self,
        product_id: i64,
        scope: StockScope,
        settings: &StockSettings,
    ) -> AppResult<PositionValue> {
        let mut conn = self.db.acquire().await?;
        position_value(&mut conn, settings.granularity, product_id, scope).await
    }

    /// Every stored row of a product
    pub async fn list_for_product(&self, product_id: i64) -> AppResult<Vec<StockPosition>> {
        let mut conn = self.db.acquire().await?;
        rows_for_product(&mut conn, product_id).await
    }

    /// Apply a delta outside any batch, in its own unit of work
    pub async fn apply_delta(
        &self,
        product_id: i64,
        quantity: Decimal,
        scope: StockScope,
        unit_cost: Option<Decimal>,
        settings: &StockSettings,
    ) -> AppResult<PositionChange> {
        let mut tx = db::begin_write(&self.db).await?;
        let change = apply_delta(
            &mut tx,
            settings.granularity,
            product_id,
            quantity,
            scope,
            unit_cost,
        )
        .await?;
        tx.commit().await?;
        Ok(change)
    }

    /// Zero every position and replay the whole ledger oldest-first
    pub async fn rebuild(&self, settings: &StockSettings) -> AppResult<RebuildSummary> {
        let mut tx = db::begin_write(&self.db).await?;

        sqlx::query(
            "UPDATE stock_positions SET balance = '0', total_value = '0', average_cost = '0', updated_at = ?",
        )
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let movements = ledger::all_in_order(&mut tx).await?;
        for movement in &movements {
            replay(&mut tx, settings.granularity, movement).await?;
        }

        let positions_touched: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM stock_positions WHERE balance <> '0' OR total_value <> '0'",
        )
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditAction::PositionsRebuilt,
            &format!(
                "Replayed {} movement(s) under {} control",
                movements.len(),
                settings.granularity.as_str()
            ),
        )
        .await?;
        tx.commit().await?;

        tracing::info!("Rebuilt positions from {} movement(s)", movements.len());
        Ok(RebuildSummary {
            movements_replayed: movements.len(),
            positions_touched: positions_touched as usize,
        })
    }
}
