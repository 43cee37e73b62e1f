pub mod analytics;
pub mod bulk_import;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod geocode;
pub mod ledger;
pub mod models;
pub mod population;
pub mod rate_limit;
pub mod repair;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod update;

pub use analytics::AnalyticsService;
pub use bulk_import::{BatchReport, BulkImportService};
pub use cache::AsyncCache;
pub use client::{BrregClient, RegistryClient, create_brreg_client};
pub use config::RegistrySyncConfig;
pub use error::{RegistrySyncError, RegistrySyncResult};
pub use ledger::SyncErrorLedger;
pub use models::{Fetched, OrgNumber, UpdateSince, UpdateStream};
pub use rate_limit::RateLimiter;
pub use repair::{RepairMode, RepairReport, RepairService};
pub use scheduler::{JobKind, JobReport, JobRunner, SyncScheduler};
pub use store::{MemoryStore, PgStore, Store};
pub use update::{CycleReport, StreamFailure, UpdateReport, UpdateService};
