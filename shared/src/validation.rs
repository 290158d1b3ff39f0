//! Validation utilities for the Stock Count Ledger
//!
//! Plain checks return `Result<(), &'static str>`; the `validator_*` functions
//! plug the same rules into `#[derive(Validate)]` input structs.

use rust_decimal::Decimal;
use validator::ValidationError;

use crate::models::{BatchType, StockGranularity, StockScope};

// ============================================================================
// Quantity Validations
// ============================================================================

/// Validate that a user-entered quantity is strictly positive
pub fn validate_quantity(quantity: Decimal) -> Result<(), &'static str> {
    if quantity <= Decimal::ZERO {
        return Err("Quantity must be greater than zero");
    }
    Ok(())
}

/// Validate that a conversion factor is strictly positive
pub fn validate_factor(factor: Decimal) -> Result<(), &'static str> {
    if factor <= Decimal::ZERO {
        return Err("Conversion factor must be greater than zero");
    }
    Ok(())
}

/// Validate a unit cost (zero is allowed for free goods)
pub fn validate_unit_cost(cost: Decimal) -> Result<(), &'static str> {
    if cost < Decimal::ZERO {
        return Err("Unit cost cannot be negative");
    }
    Ok(())
}

pub fn validator_positive(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        let mut err = ValidationError::new("positive");
        err.message = Some("must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

pub fn validator_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("cannot be negative".into());
        return Err(err);
    }
    Ok(())
}

pub fn validator_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("not_blank");
        err.message = Some("is required".into());
        return Err(err);
    }
    Ok(())
}

// ============================================================================
// Scope Validations
// ============================================================================

/// Check that one side of a batch carries exactly the fields the granularity tracks
fn validate_side(
    granularity: StockGranularity,
    scope: &StockScope,
    used: bool,
) -> Result<(), &'static str> {
    if !used {
        if !scope.is_empty() {
            return Err("Scope supplied for a side this operation does not use");
        }
        return Ok(());
    }

    match granularity {
        StockGranularity::Central => {
            if !scope.is_empty() {
                return Err("Sector and location are not tracked under central stock control");
            }
        }
        StockGranularity::Sector => {
            if scope.sector_id.is_none() {
                return Err("Sector is required under sector stock control");
            }
            if scope.location_id.is_some() {
                return Err("Location is not tracked under sector stock control");
            }
        }
        StockGranularity::Local => {
            if scope.sector_id.is_none() || scope.location_id.is_none() {
                return Err("Sector and location are required under local stock control");
            }
        }
    }
    Ok(())
}

/// Validate batch origin/destination against the active granularity
pub fn validate_batch_scopes(
    batch_type: BatchType,
    granularity: StockGranularity,
    origin: &StockScope,
    destination: &StockScope,
) -> Result<(), &'static str> {
    if batch_type == BatchType::Transfer && granularity == StockGranularity::Central {
        return Err("Transfers require sector or local stock control");
    }

    validate_side(granularity, origin, batch_type.uses_origin())?;
    validate_side(granularity, destination, batch_type.uses_destination())?;

    if batch_type == BatchType::Transfer && origin == destination {
        return Err("Transfer origin and destination must differ");
    }
    Ok(())
}

// ============================================================================
// Text Validations
// ============================================================================

/// Validate a required free-text reason
pub fn validate_reason(reason: &str) -> Result<(), &'static str> {
    if reason.trim().is_empty() {
        return Err("A reason is required");
    }
    if reason.len() > 500 {
        return Err("Reason must be at most 500 characters");
    }
    Ok(())
}
