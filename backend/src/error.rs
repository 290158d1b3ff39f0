//! Error handling for the Stock Count Ledger
//!
//! Every failure carries a stable code and a class so the calling layer can
//! decide how to present it.

use rust_decimal::Decimal;
use serde::Serialize;
use shared::ParseEnumError;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation error: {message}")]
    Validation { field: String, message: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    // Business rule errors
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Insufficient stock for {product}. Available: {available}, requested: {requested}")]
    InsufficientStock {
        product: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Cannot close cycle: {0} occurrence(s) still pending")]
    OccurrencesPending(i64),

    #[error("Inventory cycle #{0} is already open")]
    CycleAlreadyOpen(i64),

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    // Integrity errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Internal errors
    #[error("Internal error")]
    InternalError(#[from] anyhow::Error),
}

/// Broad class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input, rejected before any state change
    Validation,
    /// Input was well-formed but the current state forbids the operation
    BusinessRule,
    /// A referenced record is missing or inconsistent
    Integrity,
    /// Storage or programming failure; the unit of work was rolled back
    Unexpected,
}

/// Serializable error payload for the calling layer
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl AppError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation { .. } | AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            AppError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            AppError::OccurrencesPending(_) => "OCCURRENCES_PENDING",
            AppError::CycleAlreadyOpen(_) => "CYCLE_ALREADY_OPEN",
            AppError::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::DataIntegrity(_) => "DATA_INTEGRITY",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::Migration(_) => "MIGRATION_ERROR",
            AppError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation { .. } | AppError::ValidationError(_) => ErrorKind::Validation,
            AppError::InvalidStateTransition(_)
            | AppError::InsufficientStock { .. }
            | AppError::OccurrencesPending(_)
            | AppError::CycleAlreadyOpen(_)
            | AppError::InsufficientPermissions => ErrorKind::BusinessRule,
            AppError::NotFound(_) | AppError::DataIntegrity(_) => ErrorKind::Integrity,
            AppError::DatabaseError(_) | AppError::Migration(_) | AppError::InternalError(_) => {
                ErrorKind::Unexpected
            }
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        let field = match self {
            AppError::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        let message = match self {
            // storage details stay in the logs
            AppError::DatabaseError(_) => "A database error occurred".to_string(),
            AppError::InternalError(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };
        ErrorDetail {
            code: self.code(),
            kind: self.kind(),
            message,
            field,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, errs)| {
                let reasons: Vec<String> = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{} {}", field, reasons.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");
        AppError::ValidationError(message)
    }
}

impl From<ParseEnumError> for AppError {
    fn from(err: ParseEnumError) -> Self {
        AppError::DataIntegrity(err.to_string())
    }
}

/// Result type alias for services
pub type AppResult<T> = Result<T, AppError>;

/// Lift a shared `&'static str` validation failure into an [`AppError`]
pub trait ValidationExt<T> {
    fn for_field(self, field: &str) -> AppResult<T>;
}

impl<T> ValidationExt<T> for Result<T, &'static str> {
    fn for_field(self, field: &str) -> AppResult<T> {
        self.map_err(|message| AppError::validation(field, message))
    }
}
