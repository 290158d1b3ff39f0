//! Business logic services for the Stock Count Ledger

pub mod audit;
pub mod batch;
pub mod catalog;
pub mod conversion;
pub mod counting;
pub mod cycle;
pub mod ledger;
pub mod positions;
pub mod reconciliation;
pub mod reporting;
pub mod settings;
pub mod snapshots;

pub use audit::AuditService;
pub use batch::BatchService;
pub use catalog::CatalogService;
pub use conversion::ConversionService;
pub use counting::CountingService;
pub use cycle::CycleService;
pub use ledger::LedgerService;
pub use positions::PositionService;
pub use reconciliation::ReconciliationService;
pub use reporting::ReportingService;
pub use settings::SettingsService;
pub use snapshots::SnapshotService;

use sqlx::SqlitePool;

use crate::config::StockOverrides;

/// Every service over one pool
#[derive(Clone)]
pub struct Services {
    pub audit: AuditService,
    pub batches: BatchService,
    pub catalog: CatalogService,
    pub conversion: ConversionService,
    pub counting: CountingService,
    pub cycles: CycleService,
    pub ledger: LedgerService,
    pub positions: PositionService,
    pub reconciliation: ReconciliationService,
    pub reporting: ReportingService,
    pub settings: SettingsService,
    pub snapshots: SnapshotService,
}

impl Services {
    pub fn new(db: SqlitePool, overrides: StockOverrides) -> Self {
        Self {
            audit: AuditService::new(db.clone()),
            batches: BatchService::new(db.clone()),
            catalog: CatalogService::new(db.clone()),
            conversion: ConversionService::new(db.clone()),
            counting: CountingService::new(db.clone()),
            cycles: CycleService::new(db.clone()),
            ledger: LedgerService::new(db.clone()),
            positions: PositionService::new(db.clone()),
            reconciliation: ReconciliationService::new(db.clone()),
            reporting: ReportingService::new(db.clone()),
            settings: SettingsService::new(db.clone(), overrides),
            snapshots: SnapshotService::new(db),
        }
    }
}
