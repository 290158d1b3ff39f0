//! Inventory cycle lifecycle: open, cancel and reopen
//!
//! Closing a cycle is reconciliation's job; see [`super::reconciliation`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{Actor, CycleScope, CycleStatus, LocationStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};

use super::audit::{self, AuditAction};
use super::catalog;
use crate::db;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct CycleService {
    db: SqlitePool,
}

/// A counting period
#[derive(Debug, Clone, Serialize)]
pub struct InventoryCycle {
    pub id: i64,
    pub status: CycleStatus,
    pub scope: CycleScope,
    /// Only set for partial cycles
    pub category_id: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, SqliteRow> for InventoryCycle {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            status: db::code(row, "status")?,
            scope: db::code(row, "scope")?,
            category_id: row.try_get("category_id")?,
            opened_at: row.try_get("opened_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }
}

impl InventoryCycle {
    pub fn is_open(&self) -> bool {
        self.status == CycleStatus::Open
    }
}

const CYCLE_COLUMNS: &str = "id, status, scope, category_id, opened_at, closed_at";

pub(crate) async fn load_cycle(
    conn: &mut SqliteConnection,
    cycle_id: i64,
) -> AppResult<InventoryCycle> {
    sqlx::query_as::<_, InventoryCycle>(&format!(
        "SELECT {} FROM inventory_cycles WHERE id = ?",
        CYCLE_COLUMNS
    ))
    .bind(cycle_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Inventory cycle {}", cycle_id)))
}

pub(crate) async fn open_cycle(conn: &mut SqliteConnection) -> AppResult<Option<InventoryCycle>> {
    let cycle = sqlx::query_as::<_, InventoryCycle>(&format!(
        "SELECT {} FROM inventory_cycles WHERE status = 'OPEN'",
        CYCLE_COLUMNS
    ))
    .fetch_optional(&mut *conn)
    .await?;
    Ok(cycle)
}

/// The open cycle, or a business-rule error when counting is closed
pub(crate) async fn require_open(conn: &mut SqliteConnection) -> AppResult<InventoryCycle> {
    open_cycle(conn).await?.ok_or_else(|| {
        AppError::InvalidStateTransition("No inventory cycle is open".to_string())
    })
}

pub(crate) fn ensure_open(cycle: &InventoryCycle) -> AppResult<()> {
    if !cycle.is_open() {
        return Err(AppError::InvalidStateTransition(format!(
            "Inventory cycle #{} is {}",
            cycle.id,
            cycle.status.as_str()
        )));
    }
    Ok(())
}

/// Put every location back to pending
pub(crate) async fn reset_locations(conn: &mut SqliteConnection) -> AppResult<()> {
    sqlx::query("UPDATE locations SET status = ?")
        .bind(LocationStatus::Pending.code())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record the status of every location against a cycle
pub(crate) async fn snapshot_locations(conn: &mut SqliteConnection, cycle_id: i64) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO location_status_history (cycle_id, location_id, status, recorded_at)
        SELECT ?, id, status, ? FROM locations
        "#,
    )
    .bind(cycle_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

impl CycleService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Open a new cycle. Partial cycles are restricted to one category.
    pub async fn open_cycle(
        &self,
        scope: CycleScope,
        category_id: Option<i64>,
        actor: &Actor,
    ) -> AppResult<InventoryCycle> {
        if !actor.can_manage() {
            return Err(AppError::InsufficientPermissions);
        }

        let mut tx = db::begin_write(&self.db).await?;
        if let Some(open) = open_cycle(&mut tx).await? {
            return Err(AppError::CycleAlreadyOpen(open.id));
        }

        let category_id = match scope {
            CycleScope::Full => None,
            CycleScope::Partial => {
                let category_id = category_id.ok_or_else(|| {
                    AppError::validation("category_id", "A partial cycle needs a category")
                })?;
                if !catalog::category_exists(&mut tx, category_id).await? {
                    return Err(AppError::NotFound(format!("Category {}", category_id)));
                }
                Some(category_id)
            }
        };

        let cycle = sqlx::query_as::<_, InventoryCycle>(&format!(
            r#"
            INSERT INTO inventory_cycles (status, scope, category_id, opened_at)
            VALUES (?, ?, ?, ?)
            RETURNING {}
            "#,
            CYCLE_COLUMNS
        ))
        .bind(CycleStatus::Open.as_str())
        .bind(scope.as_str())
        .bind(category_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditAction::CycleOpened,
            &format!("Inventory cycle #{} opened ({})", cycle.id, scope.as_str()),
        )
        .await?;
        tx.commit().await?;

        tracing::info!("Inventory cycle #{} opened", cycle.id);
        Ok(cycle)
    }

    pub async fn current_cycle(&self) -> AppResult<Option<InventoryCycle>> {
        let mut conn = self.db.acquire().await?;
        open_cycle(&mut conn).await
    }

    pub async fn get_cycle(&self, cycle_id: i64) -> AppResult<InventoryCycle> {
        let mut conn = self.db.acquire().await?;
        load_cycle(&mut conn, cycle_id).await
    }

    /// Cycles newest first
    pub async fn list_cycles(&self) -> AppResult<Vec<InventoryCycle>> {
        let cycles = sqlx::query_as::<_, InventoryCycle>(&format!(
            "SELECT {} FROM inventory_cycles ORDER BY opened_at DESC, id DESC",
            CYCLE_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(cycles)
    }

    /// Discard an open cycle with everything counted in it. Stock is untouched.
    pub async fn cancel_cycle(&self, cycle_id: i64, actor: &Actor) -> AppResult<()> {
        if !actor.can_manage() {
            return Err(AppError::InsufficientPermissions);
        }

        let mut tx = db::begin_write(&self.db).await?;
        let cycle = load_cycle(&mut tx, cycle_id).await?;
        ensure_open(&cycle)?;

        let counts = sqlx::query("DELETE FROM counts WHERE cycle_id = ?")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM occurrences WHERE cycle_id = ?")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM location_status_history WHERE cycle_id = ?")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM inventory_cycles WHERE id = ?")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?;
        reset_locations(&mut tx).await?;

        audit::record(
            &mut tx,
            AuditAction::CycleCancelled,
            &format!("Inventory cycle #{} cancelled, {} count(s) discarded", cycle_id, counts),
        )
        .await?;
        tx.commit().await?;

        tracing::info!("Inventory cycle #{} cancelled", cycle_id);
        Ok(())
    }

    /// Reopen the most recently closed cycle and restore the location
    /// statuses captured when it closed. Posted adjustments stay in the ledger.
    pub async fn reopen_last_cycle(&self, actor: &Actor) -> AppResult<InventoryCycle> {
        if !actor.can_manage() {
            return Err(AppError::InsufficientPermissions);
        }

        let mut tx = db::begin_write(&self.db).await?;
        if let Some(open) = open_cycle(&mut tx).await? {
            return Err(AppError::CycleAlreadyOpen(open.id));
        }

        let last = sqlx::query_as::<_, InventoryCycle>(&format!(
            r#"
            SELECT {} FROM inventory_cycles
            WHERE status = 'CLOSED'
            ORDER BY closed_at DESC, id DESC
            LIMIT 1
            "#,
            CYCLE_COLUMNS
        ))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Closed inventory cycle".to_string()))?;

        let history: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT location_id, status FROM location_status_history
            WHERE cycle_id = ?
            ORDER BY id
            "#,
        )
        .bind(last.id)
        .fetch_all(&mut *tx)
        .await?;

        for (location_id, status) in &history {
            let status = LocationStatus::from_code(*status)?;
            sqlx::query("UPDATE locations SET status = ? WHERE id = ?")
                .bind(status.code())
                .bind(location_id)
                .execute(&mut *tx)
                .await?;
        }
        // the next close writes a fresh snapshot
        sqlx::query("DELETE FROM location_status_history WHERE cycle_id = ?")
            .bind(last.id)
            .execute(&mut *tx)
            .await?;

        let cycle = sqlx::query_as::<_, InventoryCycle>(&format!(
            "UPDATE inventory_cycles SET status = 'OPEN', closed_at = NULL WHERE id = ? RETURNING {}",
            CYCLE_COLUMNS
        ))
        .bind(last.id)
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditAction::CycleReopened,
            &format!(
                "Inventory cycle #{} reopened, {} location status(es) restored",
                cycle.id,
                history.len()
            ),
        )
        .await?;
        tx.commit().await?;

        tracing::info!("Inventory cycle #{} reopened", cycle.id);
        Ok(cycle)
    }
}
