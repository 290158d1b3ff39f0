//! Daily balance snapshots used as valuation anchors by the CMV report

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use shared::{StockGranularity, StockScope};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};

use super::audit::{self, AuditAction};
use super::catalog::Product;
use super::positions;
use crate::db;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct SnapshotService {
    db: SqlitePool,
}

/// Stock of one product at the end of a day
#[derive(Debug, Clone, Serialize)]
pub struct BalanceSnapshot {
    pub snapshot_date: NaiveDate,
    pub product_id: i64,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub total_value: Decimal,
}

impl<'r> FromRow<'r, SqliteRow> for BalanceSnapshot {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            snapshot_date: row.try_get("snapshot_date")?,
            product_id: row.try_get("product_id")?,
            quantity: db::decimal(row, "quantity")?,
            unit_cost: db::decimal(row, "unit_cost")?,
            total_value: db::decimal(row, "total_value")?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotSummary {
    pub days_generated: usize,
    pub rows_written: u64,
}

fn parse_date(raw: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::DataIntegrity(format!("Unreadable snapshot date '{}'", raw)))
}

async fn latest_date(conn: &mut SqliteConnection) -> AppResult<Option<NaiveDate>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT MAX(snapshot_date) FROM balance_snapshots")
        .fetch_one(&mut *conn)
        .await?;
    raw.as_deref().map(parse_date).transpose()
}

async fn snapshots_on(
    conn: &mut SqliteConnection,
    date: NaiveDate,
    category_id: Option<i64>,
) -> AppResult<Vec<BalanceSnapshot>> {
    let rows = sqlx::query_as::<_, BalanceSnapshot>(
        r#"
        SELECT snapshot_date, product_id, quantity, unit_cost, total_value
        FROM balance_snapshots
        WHERE snapshot_date = ?
          AND (? IS NULL OR product_id IN (
                SELECT product_id FROM product_categories WHERE category_id = ?))
        ORDER BY product_id
        "#,
    )
    .bind(date)
    .bind(category_id)
    .bind(category_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Total snapshot value on `date`, zero when nothing was stored that day
pub(crate) async fn total_on(
    conn: &mut SqliteConnection,
    date: NaiveDate,
    category_id: Option<i64>,
) -> AppResult<Decimal> {
    Ok(snapshots_on(conn, date, category_id)
        .await?
        .iter()
        .map(|s| s.total_value)
        .sum())
}

/// Latest date within `[start, end]` that has any snapshot
pub(crate) async fn last_date_within(
    conn: &mut SqliteConnection,
    start: NaiveDate,
    end: NaiveDate,
) -> AppResult<Option<NaiveDate>> {
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT MAX(snapshot_date) FROM balance_snapshots WHERE snapshot_date BETWEEN ? AND ?",
    )
    .bind(start)
    .bind(end)
    .fetch_one(&mut *conn)
    .await?;
    raw.as_deref().map(parse_date).transpose()
}

/// Days that still need a snapshot, oldest first
fn missing_days(latest: Option<NaiveDate>, through: NaiveDate) -> Vec<NaiveDate> {
    let Some(latest) = latest else {
        return vec![through];
    };
    let mut days = Vec::new();
    let mut day = latest + Duration::days(1);
    while day <= through {
        days.push(day);
        day += Duration::days(1);
    }
    days
}

impl SnapshotService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Fill every day after the last stored snapshot up to `through`.
    ///
    /// Each day gets one row per active tracked product with a positive
    /// company-wide balance, valued at the catalog cost. Existing rows are kept.
    pub async fn generate_missing_snapshots(&self, through: NaiveDate) -> AppResult<SnapshotSummary> {
        let mut tx = db::begin_write(&self.db).await?;
        let days = missing_days(latest_date(&mut tx).await?, through);
        if days.is_empty() {
            tracing::debug!("Snapshots already cover {}", through);
            return Ok(SnapshotSummary::default());
        }

        let products = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, name, standard_unit_id, standard_cost, active, tracks_inventory
            FROM products
            WHERE active = 1 AND tracks_inventory = 1
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut stocked = Vec::new();
        for product in products {
            let balance = positions::balance(
                &mut tx,
                StockGranularity::Central,
                product.id,
                StockScope::company(),
            )
            .await?;
            if balance > Decimal::ZERO {
                stocked.push((product, balance));
            }
        }

        let mut summary = SnapshotSummary::default();
        for day in &days {
            let mut written = 0;
            for (product, balance) in &stocked {
                written += sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO balance_snapshots
                        (snapshot_date, product_id, quantity, unit_cost, total_value)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(day)
                .bind(product.id)
                .bind(db::text(*balance))
                .bind(db::text(product.standard_cost))
                .bind(db::text(*balance * product.standard_cost))
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            audit::record(
                &mut tx,
                AuditAction::BalanceSnapshot,
                &format!("Balance snapshot for {}: {} product(s)", day, written),
            )
            .await?;
            summary.days_generated += 1;
            summary.rows_written += written;
        }
        tx.commit().await?;

        tracing::info!(
            "Generated {} daily snapshot(s) through {}",
            summary.days_generated,
            through
        );
        Ok(summary)
    }

    pub async fn for_date(&self, date: NaiveDate) -> AppResult<Vec<BalanceSnapshot>> {
        let mut conn = self.db.acquire().await?;
        snapshots_on(&mut conn, date, None).await
    }

    pub async fn latest_date(&self) -> AppResult<Option<NaiveDate>> {
        let mut conn = self.db.acquire().await?;
        latest_date(&mut conn).await
    }
}
