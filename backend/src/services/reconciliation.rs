//! Physical count reconciliation and cycle close
//!
//! Counted totals are compared with the company-wide position of every
//! in-scope product. Each difference beyond the tolerance is posted through
//! the normal batch path as the system user. A shortage under sector or local
//! control is shared out over the rows that hold the stock.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;
use shared::{
    adjustment_note, reconcile, Adjustment, CycleScope, CycleStatus, MovementType,
    StockGranularity, StockScope, StockSettings,
};
use sqlx::{SqliteConnection, SqlitePool};

use super::audit::{self, AuditAction};
use super::batch;
use super::catalog::{self, Product};
use super::counting;
use super::cycle::{self, InventoryCycle};
use super::positions;
use crate::db;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct ReconciliationService {
    db: SqlitePool,
}

/// Result of closing a cycle
#[derive(Debug, Clone, Serialize)]
pub struct CloseSummary {
    pub cycle_id: i64,
    pub adjustments: usize,
    pub entries: usize,
    pub exits: usize,
}

/// Dry-run figures for one in-scope product
#[derive(Debug, Clone, Serialize)]
pub struct PreviewLine {
    pub product_id: i64,
    pub product_name: String,
    pub counted: Decimal,
    pub system: Decimal,
    pub delta: Decimal,
    /// `None` when the difference is within tolerance
    pub direction: Option<MovementType>,
    /// |delta| at the product's standard cost
    pub adjustment_value: Decimal,
    pub was_counted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreviewTotals {
    pub products: usize,
    pub divergent: usize,
    pub entries: usize,
    pub exits: usize,
    pub matching: usize,
    pub not_counted: usize,
    pub adjustment_value: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClosePreview {
    pub cycle_id: i64,
    pub lines: Vec<PreviewLine>,
    pub totals: PreviewTotals,
}

/// Counted and system figures for one product
struct ProductReconciliation {
    product: Product,
    counted: Decimal,
    system: Decimal,
    was_counted: bool,
    adjustment: Option<Adjustment>,
}

/// Active, tracked products the cycle covers
async fn products_in_scope(
    conn: &mut SqliteConnection,
    cycle: &InventoryCycle,
) -> AppResult<Vec<Product>> {
    let products = match (cycle.scope, cycle.category_id) {
        (CycleScope::Partial, Some(category_id)) => {
            sqlx::query_as::<_, Product>(
                r#"
                SELECT p.id, p.name, p.standard_unit_id, p.standard_cost, p.active, p.tracks_inventory
                FROM products p
                JOIN product_categories pc ON pc.product_id = p.id
                WHERE pc.category_id = ? AND p.active = 1 AND p.tracks_inventory = 1
                ORDER BY p.id
                "#,
            )
            .bind(category_id)
            .fetch_all(&mut *conn)
            .await?
        }
        (CycleScope::Partial, None) => {
            return Err(AppError::DataIntegrity(format!(
                "Partial cycle #{} has no category",
                cycle.id
            )))
        }
        (CycleScope::Full, _) => {
            sqlx::query_as::<_, Product>(
                r#"
                SELECT id, name, standard_unit_id, standard_cost, active, tracks_inventory
                FROM products
                WHERE active = 1 AND tracks_inventory = 1
                ORDER BY id
                "#,
            )
            .fetch_all(&mut *conn)
            .await?
        }
    };
    Ok(products)
}

async fn reconcile_cycle(
    conn: &mut SqliteConnection,
    cycle: &InventoryCycle,
) -> AppResult<Vec<ProductReconciliation>> {
    let mut counted: HashMap<i64, Decimal> = HashMap::new();
    for count in counting::counts_for_cycle(conn, cycle.id).await? {
        *counted.entry(count.product_id).or_insert(Decimal::ZERO) += count.standard_quantity;
    }

    let mut lines = Vec::new();
    for product in products_in_scope(conn, cycle).await? {
        let was_counted = counted.contains_key(&product.id);
        let counted_total = counted.get(&product.id).copied().unwrap_or(Decimal::ZERO);
        let system = positions::balance(
            conn,
            StockGranularity::Central,
            product.id,
            StockScope::company(),
        )
        .await?;

        lines.push(ProductReconciliation {
            adjustment: reconcile(counted_total, system),
            product,
            counted: counted_total,
            system,
            was_counted,
        });
    }
    Ok(lines)
}

async fn ensure_no_pending_occurrences(
    conn: &mut SqliteConnection,
    cycle_id: i64,
) -> AppResult<()> {
    let pending = counting::pending_occurrence_count(conn, cycle_id).await?;
    if pending > 0 {
        tracing::warn!(
            "Cycle #{} has {} unresolved occurrence(s)",
            cycle_id,
            pending
        );
        return Err(AppError::OccurrencesPending(pending));
    }
    Ok(())
}

impl ReconciliationService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// What closing the cycle now would post, without posting it
    pub async fn preview_close(&self, cycle_id: i64) -> AppResult<ClosePreview> {
        let mut conn = self.db.acquire().await?;
        let cycle = cycle::load_cycle(&mut conn, cycle_id).await?;
        cycle::ensure_open(&cycle)?;
        ensure_no_pending_occurrences(&mut conn, cycle_id).await?;

        let mut totals = PreviewTotals::default();
        let mut lines = Vec::new();
        for rec in reconcile_cycle(&mut conn, &cycle).await? {
            let adjustment_value = rec
                .adjustment
                .map(|a| a.quantity * rec.product.standard_cost)
                .unwrap_or(Decimal::ZERO);

            totals.products += 1;
            if !rec.was_counted {
                totals.not_counted += 1;
            }
            match rec.adjustment.map(|a| a.direction) {
                Some(MovementType::Entry) => {
                    totals.divergent += 1;
                    totals.entries += 1;
                }
                Some(MovementType::Exit) => {
                    totals.divergent += 1;
                    totals.exits += 1;
                }
                None => totals.matching += 1,
            }
            totals.adjustment_value += adjustment_value;

            lines.push(PreviewLine {
                product_id: rec.product.id,
                product_name: rec.product.name,
                counted: rec.counted,
                system: rec.system,
                delta: rec.counted - rec.system,
                direction: rec.adjustment.map(|a| a.direction),
                adjustment_value,
                was_counted: rec.was_counted,
            });
        }

        Ok(ClosePreview {
            cycle_id,
            lines,
            totals,
        })
    }

    /// Post every adjustment and close the cycle, all in one unit of work
    #[tracing::instrument(skip(self, settings))]
    pub async fn close_cycle(
        &self,
        cycle_id: i64,
        settings: &StockSettings,
    ) -> AppResult<CloseSummary> {
        let mut tx = db::begin_write(&self.db).await?;
        let cycle = cycle::load_cycle(&mut tx, cycle_id).await?;
        cycle::ensure_open(&cycle)?;
        ensure_no_pending_occurrences(&mut tx, cycle_id).await?;

        let system_actor = catalog::system_actor(&mut tx).await?;
        let label = format!(
            "Inventory cycle #{} close - automatic adjustment",
            cycle_id
        );

        let mut summary = CloseSummary {
            cycle_id,
            adjustments: 0,
            entries: 0,
            exits: 0,
        };
        for rec in reconcile_cycle(&mut tx, &cycle).await? {
            let Some(adjustment) = rec.adjustment else {
                continue;
            };
            batch::post_adjustment(
                &mut tx,
                settings.granularity,
                &rec.product,
                adjustment.direction,
                adjustment.quantity,
                &adjustment_note(rec.counted, rec.system),
                &label,
                &system_actor,
            )
            .await?;

            summary.adjustments += 1;
            match adjustment.direction {
                MovementType::Entry => summary.entries += 1,
                MovementType::Exit => summary.exits += 1,
            }
            tracing::debug!(
                "{}: counted {}, system {}, {} {}",
                rec.product.name,
                rec.counted,
                rec.system,
                adjustment.direction.as_str(),
                adjustment.quantity
            );
        }

        cycle::snapshot_locations(&mut tx, cycle_id).await?;
        cycle::reset_locations(&mut tx).await?;
        sqlx::query("UPDATE inventory_cycles SET status = ?, closed_at = ? WHERE id = ?")
            .bind(CycleStatus::Closed.as_str())
            .bind(chrono::Utc::now())
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?;
        audit::record(
            &mut tx,
            AuditAction::CycleClosed,
            &format!(
                "Inventory cycle #{} closed: {} adjustment(s) ({} in, {} out)",
                cycle_id, summary.adjustments, summary.entries, summary.exits
            ),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            "Inventory cycle #{} closed with {} adjustment(s)",
            cycle_id,
            summary.adjustments
        );
        Ok(summary)
    }
}
