//! Stock position and movement ledger models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::ParseEnumError;

/// Spatial granularity at which stock positions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockGranularity {
    /// One company-wide position per product
    #[default]
    Central,
    /// One position per product and sector
    Sector,
    /// One position per product, sector and location
    Local,
}

impl StockGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockGranularity::Central => "CENTRAL",
            StockGranularity::Sector => "SECTOR",
            StockGranularity::Local => "LOCAL",
        }
    }

    /// Drop the scope fields this granularity does not track.
    pub fn normalize(&self, scope: StockScope) -> StockScope {
        match self {
            StockGranularity::Central => StockScope::company(),
            StockGranularity::Sector => StockScope {
                sector_id: scope.sector_id,
                location_id: None,
            },
            StockGranularity::Local => scope,
        }
    }
}

impl FromStr for StockGranularity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CENTRAL" => Ok(StockGranularity::Central),
            "SECTOR" => Ok(StockGranularity::Sector),
            "LOCAL" => Ok(StockGranularity::Local),
            _ => Err(ParseEnumError::new("stock granularity", s)),
        }
    }
}

/// Optional sector/location key of a stock position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StockScope {
    pub sector_id: Option<i64>,
    pub location_id: Option<i64>,
}

impl StockScope {
    /// The scope-less, company-wide key
    pub fn company() -> Self {
        Self::default()
    }

    pub fn sector(sector_id: i64) -> Self {
        Self {
            sector_id: Some(sector_id),
            location_id: None,
        }
    }

    pub fn location(sector_id: i64, location_id: i64) -> Self {
        Self {
            sector_id: Some(sector_id),
            location_id: Some(location_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sector_id.is_none() && self.location_id.is_none()
    }
}

/// Balance, value and moving-average cost of one stock position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PositionValue {
    pub balance: Decimal,
    pub total_value: Decimal,
    pub average_cost: Decimal,
}

/// Result of applying a signed quantity to a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionChange {
    pub after: PositionValue,
    /// Unit cost the quantity was valued at
    pub unit_cost: Decimal,
}

impl PositionValue {
    /// Build a position from its totals, deriving the average cost.
    ///
    /// A balance at or below zero carries no value.
    pub fn from_totals(balance: Decimal, total_value: Decimal) -> Self {
        if balance <= Decimal::ZERO {
            return Self {
                balance,
                total_value: Decimal::ZERO,
                average_cost: Decimal::ZERO,
            };
        }
        Self {
            balance,
            total_value,
            average_cost: total_value / balance,
        }
    }

    /// Sum several positions into one aggregate (used for company-wide reads)
    pub fn aggregate<I>(positions: I) -> Self
    where
        I: IntoIterator<Item = PositionValue>,
    {
        let (balance, total_value) = positions
            .into_iter()
            .fold((Decimal::ZERO, Decimal::ZERO), |(b, v), p| {
                (b + p.balance, v + p.total_value)
            });
        Self::from_totals(balance, total_value)
    }

    /// Apply a signed quantity using the moving-average costing rule.
    ///
    /// Incoming stock is valued at `unit_cost` when given, otherwise at the
    /// current average. Outgoing stock is always valued at the current average.
    pub fn apply(&self, quantity: Decimal, unit_cost: Option<Decimal>) -> PositionChange {
        let cost = if quantity > Decimal::ZERO {
            unit_cost.unwrap_or(self.average_cost)
        } else {
            self.average_cost
        };

        let after = Self::from_totals(
            self.balance + quantity,
            self.total_value + quantity * cost,
        );

        PositionChange {
            after,
            unit_cost: cost,
        }
    }

    pub fn receive(&self, quantity: Decimal, unit_cost: Decimal) -> PositionChange {
        self.apply(quantity, Some(unit_cost))
    }

    pub fn issue(&self, quantity: Decimal) -> PositionChange {
        self.apply(-quantity, None)
    }
}

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Entry,
    Exit,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Entry => "ENTRY",
            MovementType::Exit => "EXIT",
        }
    }

    /// Apply the direction to an unsigned quantity
    pub fn signed(&self, quantity: Decimal) -> Decimal {
        match self {
            MovementType::Entry => quantity,
            MovementType::Exit => -quantity,
        }
    }
}

impl FromStr for MovementType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(MovementType::Entry),
            "EXIT" => Ok(MovementType::Exit),
            _ => Err(ParseEnumError::new("movement type", s)),
        }
    }
}

/// Common business reason codes carried by movements and batches
pub mod reasons {
    pub const PURCHASE: &str = "PURCHASE";
    pub const SALE: &str = "SALE";
    pub const BREAKAGE: &str = "BREAKAGE";
    pub const TRANSFER: &str = "TRANSFER";
    pub const INVENTORY_ADJUSTMENT: &str = "INVENTORY_ADJUSTMENT";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_central_normalization_drops_scope() {
        let scope = StockScope::location(3, 7);
        assert_eq!(StockGranularity::Central.normalize(scope), StockScope::company());
        assert_eq!(StockGranularity::Sector.normalize(scope), StockScope::sector(3));
        assert_eq!(StockGranularity::Local.normalize(scope), scope);
    }

    #[test]
    fn test_granularity_parsing() {
        assert_eq!("sector".parse::<StockGranularity>().unwrap(), StockGranularity::Sector);
        assert_eq!(" LOCAL ".parse::<StockGranularity>().unwrap(), StockGranularity::Local);
        assert!("regional".parse::<StockGranularity>().is_err());
    }

    #[test]
    fn test_entry_then_exit_keeps_average() {
        let empty = PositionValue::default();
        let received = empty.receive(dec("10"), dec("2.00")).after;
        assert_eq!(received.balance, dec("10"));
        assert_eq!(received.total_value, dec("20.00"));
        assert_eq!(received.average_cost, dec("2"));

        let issued = received.issue(dec("4"));
        assert_eq!(issued.unit_cost, dec("2"));
        assert_eq!(issued.after.balance, dec("6"));
        assert_eq!(issued.after.total_value, dec("12"));
        assert_eq!(issued.after.average_cost, dec("2"));
    }

    #[test]
    fn test_exit_ignores_caller_cost() {
        let position = PositionValue::from_totals(dec("10"), dec("30"));
        let change = position.apply(dec("-5"), Some(dec("99")));
        assert_eq!(change.unit_cost, dec("3"));
        assert_eq!(change.after.total_value, dec("15"));
    }

    #[test]
    fn test_negative_balance_carries_no_value() {
        let position = PositionValue::from_totals(dec("2"), dec("8"));
        let change = position.issue(dec("5"));
        assert_eq!(change.after.balance, dec("-3"));
        assert_eq!(change.after.total_value, Decimal::ZERO);
        assert_eq!(change.after.average_cost, Decimal::ZERO);
    }

    #[test]
    fn test_entry_without_cost_uses_average() {
        let position = PositionValue::from_totals(dec("4"), dec("10"));
        let change = position.apply(dec("4"), None);
        assert_eq!(change.unit_cost, dec("2.5"));
        assert_eq!(change.after.average_cost, dec("2.5"));
    }

    #[test]
    fn test_aggregate_sums_rows() {
        let rows = vec![
            PositionValue::from_totals(dec("5"), dec("10")),
            PositionValue::from_totals(dec("15"), dec("50")),
        ];
        let total = PositionValue::aggregate(rows);
        assert_eq!(total.balance, dec("20"));
        assert_eq!(total.total_value, dec("60"));
        assert_eq!(total.average_cost, dec("3"));
    }

    #[test]
    fn test_signed_quantity() {
        assert_eq!(MovementType::Entry.signed(dec("3")), dec("3"));
        assert_eq!(MovementType::Exit.signed(dec("3")), dec("-3"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn signed_quantity() -> impl Strategy<Value = Decimal> {
            (-5000i64..=5000i64).prop_map(|n| Decimal::new(n, 1))
        }

        fn unit_cost() -> impl Strategy<Value = Decimal> {
            (0i64..=10000i64).prop_map(|n| Decimal::new(n, 2))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            /// A position at or below zero never carries value
            #[test]
            fn prop_zero_floor(steps in prop::collection::vec((signed_quantity(), unit_cost()), 1..30)) {
                let mut position = PositionValue::default();
                for (quantity, cost) in steps {
                    position = position.apply(quantity, Some(cost)).after;
                    if position.balance <= Decimal::ZERO {
                        prop_assert_eq!(position.total_value, Decimal::ZERO);
                        prop_assert_eq!(position.average_cost, Decimal::ZERO);
                    }
                }
            }

            /// An exit changes balance and value but never the average cost
            #[test]
            fn prop_exit_keeps_average(
                received in (1i64..=1000i64).prop_map(|n| Decimal::new(n, 0)),
                cost in unit_cost(),
                fraction in 1i64..100i64,
            ) {
                let position = PositionValue::default().receive(received, cost).after;
                let issued = received * Decimal::new(fraction, 2);
                let change = position.issue(issued);
                prop_assert_eq!(change.unit_cost, position.average_cost);
                prop_assert_eq!(change.after.balance, received - issued);
                let drift = (change.after.average_cost - position.average_cost).abs();
                prop_assert!(drift < Decimal::new(1, 20));
            }
        }
    }
}
