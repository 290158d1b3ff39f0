//! Unit conversion resolver
//!
//! Converts a unit a user entered into the product's standard unit. A missing
//! mapping resolves to 1.0 instead of failing, so an unexpected unit never
//! scales stock by a wrong factor.

use rust_decimal::Decimal;
use sqlx::{SqliteConnection, SqlitePool};

use super::catalog::{self, Product};
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct ConversionService {
    db: SqlitePool,
}

/// Resolve the factor from `unit_id` to the product's standard unit
pub async fn resolve_factor(
    conn: &mut SqliteConnection,
    product: &Product,
    unit_id: i64,
) -> AppResult<Decimal> {
    if unit_id == product.standard_unit_id {
        return Ok(Decimal::ONE);
    }

    let stored: Option<String> = sqlx::query_scalar(
        "SELECT factor FROM product_units WHERE product_id = ? AND unit_id = ?",
    )
    .bind(product.id)
    .bind(unit_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(raw) = stored else {
        tracing::debug!(
            "No factor for product {} in unit {}; using 1.0",
            product.id,
            unit_id
        );
        return Ok(Decimal::ONE);
    };

    let factor: Decimal = raw.trim().parse().map_err(|_| {
        AppError::DataIntegrity(format!(
            "Unreadable factor '{}' for product {} unit {}",
            raw, product.id, unit_id
        ))
    })?;
    if factor <= Decimal::ZERO {
        return Err(AppError::DataIntegrity(format!(
            "Non-positive factor {} for product {} unit {}",
            factor, product.id, unit_id
        )));
    }

    Ok(factor)
}

impl ConversionService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Factor from `unit_id` to the standard unit of `product_id`
    pub async fn resolve_factor(&self, product_id: i64, unit_id: i64) -> AppResult<Decimal> {
        let mut conn = self.db.acquire().await?;
        let product = catalog::product(&mut conn, product_id).await?;
        resolve_factor(&mut conn, &product, unit_id).await
    }

    /// Convert an entered quantity into standard units
    pub async fn to_standard(
        &self,
        product_id: i64,
        unit_id: i64,
        quantity: Decimal,
    ) -> AppResult<Decimal> {
        let factor = self.resolve_factor(product_id, unit_id).await?;
        Ok(quantity * factor)
    }

    /// Every alternate unit registered for a product, as (symbol, factor)
    pub async fn alternate_units(&self, product_id: i64) -> AppResult<Vec<(String, Decimal)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT u.symbol, pu.factor
            FROM product_units pu
            JOIN units u ON u.id = pu.unit_id
            WHERE pu.product_id = ?
            ORDER BY u.symbol
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(symbol, raw)| {
                let factor = raw.parse::<Decimal>().map_err(|_| {
                    AppError::DataIntegrity(format!("Unreadable factor for unit {}", symbol))
                })?;
                Ok((symbol, factor))
            })
            .collect()
    }
}
