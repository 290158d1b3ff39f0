//! Audit trail of state-changing operations

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::error::AppResult;

#[derive(Clone)]
pub struct AuditService {
    db: SqlitePool,
}

/// Actions recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    MovementRecorded,
    BatchPending,
    BatchFinalized,
    BatchApproved,
    BatchRejected,
    CycleOpened,
    CycleClosed,
    CycleCancelled,
    CycleReopened,
    CountCorrected,
    CountDeleted,
    OccurrenceLinked,
    OccurrenceRejected,
    BalanceSnapshot,
    PositionsRebuilt,
    SettingChanged,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::MovementRecorded => "MOVEMENT_RECORDED",
            AuditAction::BatchPending => "BATCH_PENDING",
            AuditAction::BatchFinalized => "BATCH_FINALIZED",
            AuditAction::BatchApproved => "BATCH_APPROVED",
            AuditAction::BatchRejected => "BATCH_REJECTED",
            AuditAction::CycleOpened => "CYCLE_OPENED",
            AuditAction::CycleClosed => "CYCLE_CLOSED",
            AuditAction::CycleCancelled => "CYCLE_CANCELLED",
            AuditAction::CycleReopened => "CYCLE_REOPENED",
            AuditAction::CountCorrected => "COUNT_CORRECTED",
            AuditAction::CountDeleted => "COUNT_DELETED",
            AuditAction::OccurrenceLinked => "OCCURRENCE_LINKED",
            AuditAction::OccurrenceRejected => "OCCURRENCE_REJECTED",
            AuditAction::BalanceSnapshot => "BALANCE_SNAPSHOT",
            AuditAction::PositionsRebuilt => "POSITIONS_REBUILT",
            AuditAction::SettingChanged => "SETTING_CHANGED",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub description: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// Append one audit row inside the caller's unit of work
pub async fn record(
    conn: &mut SqliteConnection,
    action: AuditAction,
    description: &str,
) -> AppResult<()> {
    sqlx::query("INSERT INTO audit_log (action, description, logged_at) VALUES (?, ?, ?)")
        .bind(action.as_str())
        .bind(description)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl AuditService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Most recent entries first
    pub async fn recent(&self, limit: i64) -> AppResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, action, description, logged_at
            FROM audit_log
            ORDER BY logged_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }

    /// Entries for one action, most recent first
    pub async fn by_action(&self, action: AuditAction) -> AppResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, action, description, logged_at
            FROM audit_log
            WHERE action = ?
            ORDER BY logged_at DESC, id DESC
            "#,
        )
        .bind(action.as_str())
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }
}
