//! Resolution of the runtime stock switches
//!
//! Values are read from the settings table on every call so a change takes
//! effect on the next operation. Deployment overrides from [`Config`] win.
//!
//! [`Config`]: crate::config::Config

use shared::{parse_switch, setting_keys, StockGranularity, StockSettings};
use sqlx::{FromRow, SqlitePool};

use super::audit::{self, AuditAction};
use crate::config::StockOverrides;
use crate::db;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct SettingsService {
    db: SqlitePool,
    overrides: StockOverrides,
}

#[derive(Debug, FromRow)]
struct SettingRow {
    key: String,
    value: String,
}

impl SettingsService {
    pub fn new(db: SqlitePool, overrides: StockOverrides) -> Self {
        Self { db, overrides }
    }

    /// Read the current stock switches
    pub async fn resolve(&self) -> AppResult<StockSettings> {
        let rows = sqlx::query_as::<_, SettingRow>(
            "SELECT key, value FROM settings WHERE key IN (?, ?, ?)",
        )
        .bind(setting_keys::GRANULARITY)
        .bind(setting_keys::ALLOW_NEGATIVE_STOCK)
        .bind(setting_keys::REQUIRES_APPROVAL)
        .fetch_all(&self.db)
        .await?;

        let mut settings = StockSettings::default();
        for row in rows {
            match row.key.as_str() {
                setting_keys::GRANULARITY => match row.value.parse::<StockGranularity>() {
                    Ok(granularity) => settings.granularity = granularity,
                    Err(e) => tracing::warn!("Ignoring stored granularity: {}", e),
                },
                setting_keys::ALLOW_NEGATIVE_STOCK => match parse_switch(&row.value) {
                    Some(allow) => settings.allow_negative_stock = allow,
                    None => tracing::warn!("Ignoring stored negative stock switch: {}", row.value),
                },
                setting_keys::REQUIRES_APPROVAL => match parse_switch(&row.value) {
                    Some(required) => settings.requires_approval = required,
                    None => tracing::warn!("Ignoring stored approval switch: {}", row.value),
                },
                _ => {}
            }
        }

        if let Some(granularity) = self.overrides.granularity {
            settings.granularity = granularity;
        }
        if let Some(allow) = self.overrides.allow_negative_stock {
            settings.allow_negative_stock = allow;
        }
        if let Some(required) = self.overrides.requires_approval {
            settings.requires_approval = required;
        }

        Ok(settings)
    }

    /// Store one switch
    pub async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let valid = match key {
            setting_keys::GRANULARITY => value.parse::<StockGranularity>().is_ok(),
            setting_keys::ALLOW_NEGATIVE_STOCK | setting_keys::REQUIRES_APPROVAL => {
                parse_switch(value).is_some()
            }
            _ => return Err(AppError::NotFound(format!("Setting {}", key))),
        };
        if !valid {
            return Err(AppError::validation(key, format!("Invalid value: {}", value)));
        }

        let mut tx = db::begin_write(&self.db).await?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        audit::record(&mut tx, AuditAction::SettingChanged, &format!("{} = {}", key, value)).await?;
        tx.commit().await?;

        tracing::info!("Setting {} changed to {}", key, value);
        Ok(())
    }

    /// Store all three switches at once
    pub async fn store(&self, settings: &StockSettings) -> AppResult<()> {
        self.set(setting_keys::GRANULARITY, settings.granularity.as_str())
            .await?;
        self.set(
            setting_keys::ALLOW_NEGATIVE_STOCK,
            if settings.allow_negative_stock { "true" } else { "false" },
        )
        .await?;
        self.set(
            setting_keys::REQUIRES_APPROVAL,
            if settings.requires_approval { "true" } else { "false" },
        )
        .await
    }
}
