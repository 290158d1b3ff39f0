//! Read-only reports over the ledger, counts and snapshots
//!
//! Provides the kardex extract, consolidated cycle counts and the CMV
//! (cost of goods sold) report with its valuation series.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{period_buckets, CmvFigures, DateRange, MovementType, SeriesInterval};
use sqlx::{SqliteConnection, SqlitePool};

use super::catalog;
use super::counting::{self, Count};
use super::cycle;
use super::ledger;
use super::snapshots;
use crate::error::{AppResult, ValidationExt};

/// Reporting service
#[derive(Clone)]
pub struct ReportingService {
    db: SqlitePool,
}

/// One kardex line
#[derive(Debug, Clone, Serialize)]
pub struct KardexLine {
    pub movement_id: i64,
    pub moved_at: DateTime<Utc>,
    pub movement_type: MovementType,
    pub reason: String,
    /// Signed standard-unit quantity
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub total_value: Decimal,
    pub running_balance: Decimal,
    pub origin: Option<String>,
    pub observation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KardexTotals {
    pub entries_quantity: Decimal,
    pub entries_value: Decimal,
    pub exits_quantity: Decimal,
    pub exits_value: Decimal,
    pub movement_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub closing_balance: Decimal,
}

/// Chronological extract of one product
#[derive(Debug, Clone, Serialize)]
pub struct Kardex {
    pub product_id: i64,
    pub product_name: String,
    pub range: DateRange,
    pub opening_balance: Decimal,
    pub lines: Vec<KardexLine>,
    pub totals: KardexTotals,
}

/// Counted totals of one product in a cycle
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidatedCount {
    pub product_id: i64,
    pub product_name: String,
    pub standard_unit_symbol: String,
    pub total_quantity: Decimal,
    pub total_value: Decimal,
    pub count_entries: usize,
}

/// Parameters of a CMV report
#[derive(Debug, Clone, Deserialize)]
pub struct CmvQuery {
    pub range: DateRange,
    pub category_id: Option<i64>,
    /// Value the opening stock from this cycle's counts instead of snapshots
    pub opening_cycle_id: Option<i64>,
    /// Value the closing stock from this cycle's counts instead of snapshots
    pub closing_cycle_id: Option<i64>,
}

impl CmvQuery {
    pub fn new(range: DateRange) -> Self {
        Self {
            range,
            category_id: None,
            opening_cycle_id: None,
            closing_cycle_id: None,
        }
    }
}

/// Where a valuation figure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValuationSource {
    Cycle { cycle_id: i64 },
    Snapshot { date: NaiveDate },
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct CmvReport {
    pub range: DateRange,
    pub category_id: Option<i64>,
    pub figures: CmvFigures,
    pub opening_source: ValuationSource,
    pub closing_source: ValuationSource,
}

/// Stock value at the last snapshot of a period
#[derive(Debug, Clone, Serialize)]
pub struct ValuationPoint {
    pub period: DateRange,
    pub snapshot_date: Option<NaiveDate>,
    pub total_value: Decimal,
}

/// Value of a cycle's counts at their snapshot costs.
///
/// Only counts of active products that track inventory are valued.
async fn cycle_valuation(
    conn: &mut SqliteConnection,
    cycle_id: i64,
    category_id: Option<i64>,
) -> AppResult<Decimal> {
    cycle::load_cycle(conn, cycle_id).await?;
    let counts = counting::counts_for_cycle(conn, cycle_id).await?;

    let valued: HashSet<i64> = match category_id {
        Some(category_id) => {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT p.id
                FROM products p
                JOIN product_categories pc ON pc.product_id = p.id
                WHERE pc.category_id = ? AND p.active = 1 AND p.tracks_inventory = 1
                "#,
            )
            .bind(category_id)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_scalar::<_, i64>("SELECT id FROM products WHERE active = 1 AND tracks_inventory = 1")
                .fetch_all(&mut *conn)
                .await?
        }
    }
    .into_iter()
    .collect();

    Ok(counts
        .iter()
        .filter(|c| valued.contains(&c.product_id))
        .map(Count::value)
        .sum())
}

impl ReportingService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Movements of a product in a date range with running balance
    pub async fn kardex(&self, product_id: i64, range: DateRange) -> AppResult<Kardex> {
        let mut conn = self.db.acquire().await?;
        let product = catalog::product(&mut conn, product_id).await?;
        let movements = ledger::for_product(&mut conn, product_id).await?;

        let mut opening_balance = Decimal::ZERO;
        let mut totals = KardexTotals::default();
        let mut lines = Vec::new();
        let mut running = Decimal::ZERO;

        for movement in movements {
            let day = movement.moved_at.date_naive();
            if day < range.start {
                opening_balance += movement.signed_quantity();
                running = opening_balance;
                continue;
            }
            if day > range.end {
                break;
            }

            let signed = movement.signed_quantity();
            running += signed;
            match movement.movement_type {
                MovementType::Entry => {
                    totals.entries_quantity += movement.quantity;
                    totals.entries_value += movement.total_value;
                }
                MovementType::Exit => {
                    totals.exits_quantity += movement.quantity;
                    totals.exits_value += movement.total_value.abs();
                }
            }
            totals.first_date.get_or_insert(day);
            totals.last_date = Some(day);

            lines.push(KardexLine {
                movement_id: movement.id,
                moved_at: movement.moved_at,
                movement_type: movement.movement_type,
                reason: movement.reason,
                quantity: signed,
                unit_cost: movement.unit_cost,
                total_value: movement.total_value,
                running_balance: running,
                origin: movement.origin,
                observation: movement.observation,
            });
        }
        totals.movement_count = lines.len();
        totals.closing_balance = running;

        Ok(Kardex {
            product_id,
            product_name: product.name,
            range,
            opening_balance,
            lines,
            totals,
        })
    }

    /// Counted quantity and value per product for a cycle
    pub async fn consolidated_counts(&self, cycle_id: i64) -> AppResult<Vec<ConsolidatedCount>> {
        let mut conn = self.db.acquire().await?;
        cycle::load_cycle(&mut conn, cycle_id).await?;
        let counts = counting::counts_for_cycle(&mut conn, cycle_id).await?;

        let mut consolidated: Vec<ConsolidatedCount> = Vec::new();
        for count in counts {
            // counts arrive ordered by product
            match consolidated.last_mut() {
                Some(last) if last.product_id == count.product_id => {
                    last.total_quantity += count.standard_quantity;
                    last.total_value += count.value();
                    last.count_entries += 1;
                }
                _ => {
                    let product = catalog::product(&mut conn, count.product_id).await?;
                    consolidated.push(ConsolidatedCount {
                        product_id: count.product_id,
                        product_name: product.name,
                        standard_unit_symbol: count.standard_unit_symbol.clone(),
                        total_quantity: count.standard_quantity,
                        total_value: count.value(),
                        count_entries: 1,
                    });
                }
            }
        }
        Ok(consolidated)
    }

    /// Cost of goods sold for a period
    pub async fn cmv_report(&self, query: CmvQuery) -> AppResult<CmvReport> {
        let range = query.range;
        DateRange::new(range.start, range.end).for_field("range")?;
        let mut conn = self.db.acquire().await?;

        let (opening_value, opening_source) = match query.opening_cycle_id {
            Some(cycle_id) => (
                cycle_valuation(&mut conn, cycle_id, query.category_id).await?,
                ValuationSource::Cycle { cycle_id },
            ),
            None => {
                let date = range.start - Duration::days(1);
                (
                    snapshots::total_on(&mut conn, date, query.category_id).await?,
                    ValuationSource::Snapshot { date },
                )
            }
        };

        let (closing_value, closing_source) = match query.closing_cycle_id {
            Some(cycle_id) => (
                cycle_valuation(&mut conn, cycle_id, query.category_id).await?,
                ValuationSource::Cycle { cycle_id },
            ),
            None => match snapshots::last_date_within(&mut conn, range.start, range.end).await? {
                Some(date) => (
                    snapshots::total_on(&mut conn, date, query.category_id).await?,
                    ValuationSource::Snapshot { date },
                ),
                None => (Decimal::ZERO, ValuationSource::None),
            },
        };

        let movements =
            ledger::in_period(&mut conn, range.start, range.end, query.category_id).await?;
        let (purchases, movement_cogs) =
            movements
                .iter()
                .fold((Decimal::ZERO, Decimal::ZERO), |(p, c), m| match m.movement_type {
                    MovementType::Entry => (p + m.total_value, c),
                    MovementType::Exit => (p, c + m.total_value.abs()),
                });

        Ok(CmvReport {
            range,
            category_id: query.category_id,
            figures: CmvFigures::compute(opening_value, purchases, closing_value, movement_cogs),
            opening_source,
            closing_source,
        })
    }

    /// Stock value at the last snapshot of each week or month in the range
    pub async fn valuation_series(
        &self,
        range: DateRange,
        interval: SeriesInterval,
        category_id: Option<i64>,
    ) -> AppResult<Vec<ValuationPoint>> {
        let mut conn = self.db.acquire().await?;
        let mut points = Vec::new();

        for period in period_buckets(range, interval) {
            let point = match snapshots::last_date_within(&mut conn, period.start, period.end).await? {
                Some(date) => ValuationPoint {
                    period,
                    snapshot_date: Some(date),
                    total_value: snapshots::total_on(&mut conn, date, category_id).await?,
                },
                None => ValuationPoint {
                    period,
                    snapshot_date: None,
                    total_value: Decimal::ZERO,
                },
            };
            points.push(point);
        }
        Ok(points)
    }
}
