//! Movement batch ("lot") models

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::MovementType;
use crate::types::ParseEnumError;

/// Kind of operation a batch stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchType {
    Entry,
    Exit,
    Transfer,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Entry => "ENTRY",
            BatchType::Exit => "EXIT",
            BatchType::Transfer => "TRANSFER",
        }
    }

    /// Whether stock leaves an origin scope
    pub fn uses_origin(&self) -> bool {
        matches!(self, BatchType::Exit | BatchType::Transfer)
    }

    /// Whether stock arrives at a destination scope
    pub fn uses_destination(&self) -> bool {
        matches!(self, BatchType::Entry | BatchType::Transfer)
    }

    /// Ledger directions produced by one item of this batch, in posting order
    pub fn movement_legs(&self) -> &'static [MovementType] {
        match self {
            BatchType::Entry => &[MovementType::Entry],
            BatchType::Exit => &[MovementType::Exit],
            BatchType::Transfer => &[MovementType::Exit, MovementType::Entry],
        }
    }
}

impl FromStr for BatchType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(BatchType::Entry),
            "EXIT" => Ok(BatchType::Exit),
            "TRANSFER" => Ok(BatchType::Transfer),
            _ => Err(ParseEnumError::new("batch type", s)),
        }
    }
}

/// Lifecycle status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Draft,
    PendingApproval,
    Approved,
    Finalized,
    Rejected,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Draft => "DRAFT",
            BatchStatus::PendingApproval => "PENDING_APPROVAL",
            BatchStatus::Approved => "APPROVED",
            BatchStatus::Finalized => "FINALIZED",
            BatchStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Approved | BatchStatus::Finalized | BatchStatus::Rejected
        )
    }

    /// Items may be added, edited or removed until a manager acts on the batch
    pub fn accepts_item_changes(&self) -> bool {
        matches!(self, BatchStatus::Draft | BatchStatus::PendingApproval)
    }

    /// Check a transition against the batch state machine
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Draft, BatchStatus::PendingApproval)
                | (BatchStatus::Draft, BatchStatus::Finalized)
                | (BatchStatus::PendingApproval, BatchStatus::Approved)
                | (BatchStatus::PendingApproval, BatchStatus::Rejected)
        )
    }
}

impl FromStr for BatchStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(BatchStatus::Draft),
            "PENDING_APPROVAL" => Ok(BatchStatus::PendingApproval),
            "APPROVED" => Ok(BatchStatus::Approved),
            "FINALIZED" => Ok(BatchStatus::Finalized),
            "REJECTED" => Ok(BatchStatus::Rejected),
            _ => Err(ParseEnumError::new("batch status", s)),
        }
    }
}
