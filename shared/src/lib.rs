//! Shared types and models for the Stock Count Ledger
//!
//! This crate contains the storage-free part of the stock engine: scope and
//! granularity rules, batch state machine enums, the moving-average position
//! arithmetic and input validation. The backend persists what it computes here.

pub mod models;
pub mod types;
pub mod validation;

pub use models::*;
pub use types::*;
pub use validation::*;
