//! Storage contracts used by the sync services.
//!
//! The services only see these traits. [`PgStore`] is the production
//! implementation; [`MemoryStore`] keeps everything in process and is used
//! by tests and offline dry runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::RegistrySyncResult;
use crate::models::{
    Company, Coordinates, CountyStat, EntityType, FinancialStatement, GeocodeCandidate,
    ImportQueueEntry, ImportResult, ImportStatusCount, IndustryStat, OrgNumber, PopulateReport,
    PopulationRecord, Role, SubUnit, SyncErrorCount, SyncErrorRecord
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_company(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<Company>>;
    async fn get_subunit(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<SubUnit>>;

    /// Inserts or updates companies in one batch.
    async fn upsert_companies(&self, companies: &[Company]) -> RegistrySyncResult<u64>;

    /// Inserts or updates subunits in one batch.
    async fn upsert_subunits(&self, subunits: &[SubUnit]) -> RegistrySyncResult<u64>;

    /// Stores statements and advances the owners' financials poll time.
    async fn upsert_financials(
        &self,
        orgnr: &OrgNumber,
        statements: &[FinancialStatement],
        polled_at: DateTime<Utc>
    ) -> RegistrySyncResult<u64>;

    /// Parent numbers referenced by subunits that have no company row and
    /// were not already confirmed gone. Parents with an open company ledger
    /// row are left to the ledger retry.
    async fn orphaned_parents(&self, limit: usize) -> RegistrySyncResult<Vec<OrgNumber>>;

    /// Flags the subunits of a parent the registry reports as gone.
    async fn mark_parent_gone(&self, parent: &OrgNumber) -> RegistrySyncResult<u64>;

    /// Companies ordered by employee count, largest first.
    async fn largest_companies(&self, limit: usize) -> RegistrySyncResult<Vec<OrgNumber>>;

    async fn subunits_of(&self, parent: &OrgNumber) -> RegistrySyncResult<HashSet<OrgNumber>>;

    /// Companies never role-polled or polled before `stale_before`, skipping
    /// those with an open role ledger row.
    async fn companies_needing_roles(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize
    ) -> RegistrySyncResult<Vec<OrgNumber>>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Replaces the full role set of every entity in `batch` atomically.
    async fn replace_roles(
        &self,
        batch: &[(OrgNumber, Vec<Role>)],
        polled_at: DateTime<Utc>
    ) -> RegistrySyncResult<u64>;

    async fn get_roles(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Vec<Role>>;
}

#[async_trait]
pub trait SyncErrorStore: Send + Sync {
    /// Records a failure, reusing the open row for the same key if any.
    async fn report_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType,
        message: &str
    ) -> RegistrySyncResult<SyncErrorRecord>;

    async fn resolve_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType
    ) -> RegistrySyncResult<bool>;

    async fn open_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType
    ) -> RegistrySyncResult<Option<SyncErrorRecord>>;

    /// Open, non-permanent rows with fewer than `max_attempts` attempts.
    async fn retryable_sync_errors(
        &self,
        max_attempts: u32,
        limit: usize
    ) -> RegistrySyncResult<Vec<SyncErrorRecord>>;

    async fn mark_permanent_failures(&self, max_attempts: u32) -> RegistrySyncResult<u64>;

    async fn sync_error_summary(&self) -> RegistrySyncResult<Vec<SyncErrorCount>>;
}

#[async_trait]
pub trait ImportQueueStore: Send + Sync {
    /// Inserts `pending` rows for numbers not yet queued in any status.
    async fn enqueue(&self, orgnrs: &[OrgNumber], priority: i32)
    -> RegistrySyncResult<PopulateReport>;

    /// Moves up to `limit` pending rows to `in_progress`, highest priority
    /// first, and returns them.
    async fn claim_pending(&self, limit: usize) -> RegistrySyncResult<Vec<ImportQueueEntry>>;

    async fn finish_import(&self, result: &ImportResult) -> RegistrySyncResult<()>;

    async fn reset_failed(
        &self,
        max_attempts: Option<i32>,
        failed_before: Option<DateTime<Utc>>
    ) -> RegistrySyncResult<u64>;

    /// Returns `in_progress` rows started before `started_before` to `pending`.
    async fn requeue_stale(&self, started_before: DateTime<Utc>) -> RegistrySyncResult<u64>;

    async fn queue_entry(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<ImportQueueEntry>>;

    async fn queue_summary(&self) -> RegistrySyncResult<Vec<ImportStatusCount>>;
}

#[async_trait]
pub trait SystemStateStore: Send + Sync {
    async fn get_state(&self, key: &str) -> RegistrySyncResult<Option<String>>;
    async fn set_state(&self, key: &str, value: &str) -> RegistrySyncResult<()>;
}

#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    async fn refresh_materialized_views(&self, views: &[String]) -> RegistrySyncResult<()>;

    async fn pending_geocodes(
        &self,
        limit: usize,
        max_attempts: i32
    ) -> RegistrySyncResult<Vec<GeocodeCandidate>>;

    /// Counts one geocoding attempt and stores the coordinates when found.
    async fn save_geocode(
        &self,
        orgnr: &OrgNumber,
        coordinates: Option<Coordinates>
    ) -> RegistrySyncResult<()>;

    async fn upsert_population(&self, records: &[PopulationRecord]) -> RegistrySyncResult<u64>;

    async fn industry_stats(&self, limit: usize) -> RegistrySyncResult<Vec<IndustryStat>>;

    async fn county_stats(&self) -> RegistrySyncResult<Vec<CountyStat>>;
}

/// Everything the engine needs from storage, as one handle.
pub trait Store:
    EntityStore + RoleStore + SyncErrorStore + ImportQueueStore + SystemStateStore + MaintenanceStore
{
}

impl<T> Store for T where
    T: EntityStore
        + RoleStore
        + SyncErrorStore
        + ImportQueueStore
        + SystemStateStore
        + MaintenanceStore
{
}

/// Materialized view names are interpolated into SQL, so only plain
/// lowercase identifiers are accepted.
pub(crate) fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_check() {
        assert!(is_safe_identifier("mv_industry_stats"));
        assert!(is_safe_identifier("_x1"));
        assert!(!is_safe_identifier("mv; DROP TABLE companies"));
        assert!(!is_safe_identifier("1abc"));
        assert!(!is_safe_identifier(""));
    }
}
