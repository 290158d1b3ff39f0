//! Stock Count Ledger - backend library
//!
//! Stock positions, the append-only movement ledger, the batch approval
//! workflow, physical count reconciliation and the reports built on them,
//! persisted in an embedded SQLite store.

pub mod config;
pub mod db;
pub mod error;
pub mod services;

pub use config::Config;
pub use error::{AppError, AppResult};
