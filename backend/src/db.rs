//! SQLite store access: pool setup, migrations, units of work and decimal columns

use rust_decimal::Decimal;
use shared::ParseEnumError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::AppResult;

/// A transaction wrapping one multi-step mutation.
///
/// Dropping it without `commit()` rolls every statement back.
pub type UnitOfWork = Transaction<'static, Sqlite>;

/// Open the configured store
pub async fn connect(config: &DatabaseConfig) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open a private in-memory store with the schema applied
pub async fn connect_in_memory() -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    // every connection to :memory: is a separate database, so keep exactly one alive
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Apply pending schema migrations
pub async fn migrate(pool: &SqlitePool) -> AppResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Begin a unit of work holding the database write lock.
///
/// The lock is taken before the first read so a balance check and the update
/// that depends on it cannot interleave with another writer.
pub async fn begin_write(pool: &SqlitePool) -> AppResult<UnitOfWork> {
    let mut tx = pool.begin().await?;
    // a no-op write takes the RESERVED lock now, as BEGIN IMMEDIATE would
    sqlx::query("UPDATE settings SET value = value WHERE 0")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Canonical text form of a decimal column value
pub fn text(value: Decimal) -> String {
    value.normalize().to_string()
}

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal, sqlx::Error> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
}

/// Read a decimal stored as text
pub fn decimal(row: &SqliteRow, column: &str) -> Result<Decimal, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    parse_decimal(column, &raw)
}

pub fn optional_decimal(row: &SqliteRow, column: &str) -> Result<Option<Decimal>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|r| parse_decimal(column, &r)).transpose()
}

/// Read a text code column into one of the shared enums
pub fn code<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}
