//! Inventory cycle, physical count and reconciliation models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::MovementType;
use crate::types::ParseEnumError;

/// Differences smaller than this (0.001) are treated as rounding noise
pub fn reconciliation_tolerance() -> Decimal {
    Decimal::new(1, 3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Open,
    Closed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Open => "OPEN",
            CycleStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for CycleStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(CycleStatus::Open),
            "CLOSED" => Ok(CycleStatus::Closed),
            _ => Err(ParseEnumError::new("cycle status", s)),
        }
    }
}

/// Which products a cycle counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleScope {
    /// Every active product that tracks inventory
    Full,
    /// Only products linked to the cycle's category
    Partial,
}

impl CycleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleScope::Full => "FULL",
            CycleScope::Partial => "PARTIAL",
        }
    }
}

impl FromStr for CycleScope {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL" => Ok(CycleScope::Full),
            "PARTIAL" => Ok(CycleScope::Partial),
            _ => Err(ParseEnumError::new("cycle scope", s)),
        }
    }
}

/// Counting progress of a location within the open cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    Pending,
    InProgress,
    Done,
}

impl LocationStatus {
    pub fn code(&self) -> i64 {
        match self {
            LocationStatus::Pending => 0,
            LocationStatus::InProgress => 1,
            LocationStatus::Done => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, ParseEnumError> {
        match code {
            0 => Ok(LocationStatus::Pending),
            1 => Ok(LocationStatus::InProgress),
            2 => Ok(LocationStatus::Done),
            _ => Err(ParseEnumError::new("location status", &code.to_string())),
        }
    }
}

/// Adjustment needed to bring the ledger in line with a physical count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub direction: MovementType,
    /// Standard-unit quantity, always positive
    pub quantity: Decimal,
}

/// Compare a counted total with the system balance.
///
/// Returns `None` when the difference is within [`reconciliation_tolerance`].
pub fn reconcile(counted: Decimal, system: Decimal) -> Option<Adjustment> {
    let delta = counted - system;
    if delta.abs() < reconciliation_tolerance() {
        return None;
    }
    let direction = if delta > Decimal::ZERO {
        MovementType::Entry
    } else {
        MovementType::Exit
    };
    Some(Adjustment {
        direction,
        quantity: delta.abs(),
    })
}

/// Observation text attached to an automatic adjustment
pub fn adjustment_note(counted: Decimal, system: Decimal) -> String {
    let delta = counted - system;
    let sign = if delta >= Decimal::ZERO { "+" } else { "" };
    format!(
        "Counted: {} | System: {} | Difference: {}{}",
        counted.normalize(),
        system.normalize(),
        sign,
        delta.normalize()
    )
}
