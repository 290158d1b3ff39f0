//! Acting users and roles

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::ParseEnumError;

/// Role of the user performing an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Manager,
    StockKeeper,
    HeadStockKeeper,
    /// Internal actor used for automatic adjustments
    System,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Manager => "manager",
            UserRole::StockKeeper => "stock_keeper",
            UserRole::HeadStockKeeper => "head_stock_keeper",
            UserRole::System => "system",
        }
    }
}

impl FromStr for UserRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manager" => Ok(UserRole::Manager),
            "stock_keeper" => Ok(UserRole::StockKeeper),
            "head_stock_keeper" => Ok(UserRole::HeadStockKeeper),
            "system" => Ok(UserRole::System),
            _ => Err(ParseEnumError::new("user role", s)),
        }
    }
}

/// The authenticated user on whose behalf an operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: i64,
    pub role: UserRole,
}

impl Actor {
    pub fn new(user_id: i64, role: UserRole) -> Self {
        Self { user_id, role }
    }

    /// Managers and the system actor may approve, reject and correct
    pub fn can_manage(&self) -> bool {
        matches!(self.role, UserRole::Manager | UserRole::System)
    }
}
