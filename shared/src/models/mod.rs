//! Domain models for the Stock Count Ledger

mod batch;
mod cycle;
mod report;
mod settings;
mod stock;
mod user;

pub use batch::*;
pub use cycle::*;
pub use report::*;
pub use settings::*;
pub use stock::*;
pub use user::*;
