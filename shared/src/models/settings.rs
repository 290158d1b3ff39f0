//! Runtime stock control switches

use serde::{Deserialize, Serialize};

use super::StockGranularity;

/// Stock switches resolved once per operation and passed into the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StockSettings {
    pub granularity: StockGranularity,
    pub allow_negative_stock: bool,
    pub requires_approval: bool,
}

impl StockSettings {
    pub fn with_granularity(mut self, granularity: StockGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_negative_stock(mut self, allow: bool) -> Self {
        self.allow_negative_stock = allow;
        self
    }

    pub fn with_approval(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }
}

/// Keys of the stock switches in the settings table
pub mod setting_keys {
    pub const GRANULARITY: &str = "stock_granularity";
    pub const ALLOW_NEGATIVE_STOCK: &str = "allow_negative_stock";
    pub const REQUIRES_APPROVAL: &str = "requires_approval";
}

/// Interpret a stored boolean switch
pub fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
