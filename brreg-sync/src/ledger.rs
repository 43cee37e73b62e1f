use crate::error::RegistrySyncResult;
use crate::models::{EntityType, OrgNumber, SyncErrorCount, SyncErrorRecord, SyncErrorStatus};
use crate::store::Store;
use crate::telemetry::Telemetry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable record of entity syncs that failed after client retries.
#[derive(Clone)]
pub struct SyncErrorLedger {
    store: Arc<dyn Store>
}

impl SyncErrorLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn report(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType,
        message: &str
    ) -> RegistrySyncResult<SyncErrorRecord> {
        let record = self
            .store
            .report_sync_error(orgnr, entity_type, message)
            .await?;
        Telemetry::record_sync_error(entity_type.as_str());
        warn!(
            orgnr = %orgnr,
            entity_type = %entity_type,
            attempt = record.attempt_count,
            status = record.status.as_str(),
            error = message,
            "Sync error recorded"
        );
        Ok(record)
    }

    /// Closes the open row for this key, if any.
    pub async fn resolve(&self, orgnr: &OrgNumber, entity_type: EntityType) -> RegistrySyncResult<bool> {
        let resolved = self.store.resolve_sync_error(orgnr, entity_type).await?;
        if resolved {
            debug!(orgnr = %orgnr, entity_type = %entity_type, "Sync error resolved");
        }
        Ok(resolved)
    }

    pub async fn mark_permanent_failures(&self, ceiling: u32) -> RegistrySyncResult<u64> {
        let marked = self.store.mark_permanent_failures(ceiling).await?;
        if marked > 0 {
            warn!(count = marked, ceiling, "Sync errors promoted to permanent failure");
        }
        Ok(marked)
    }

    pub async fn retryable(&self, limit: usize, ceiling: u32) -> RegistrySyncResult<Vec<SyncErrorRecord>> {
        self.store.retryable_sync_errors(ceiling, limit).await
    }

    pub async fn open(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType
    ) -> RegistrySyncResult<Option<SyncErrorRecord>> {
        self.store.open_sync_error(orgnr, entity_type).await
    }

    pub async fn summary(&self) -> RegistrySyncResult<Vec<SyncErrorCount>> {
        self.store.sync_error_summary().await
    }

    /// Open rows across all entity types.
    pub async fn open_count(&self) -> RegistrySyncResult<i64> {
        Ok(self
            .summary()
            .await?
            .iter()
            .filter(|c| c.status != SyncErrorStatus::Resolved)
            .map(|c| c.count)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn orgnr(raw: &str) -> OrgNumber {
        OrgNumber::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_repeated_reports_share_one_row() {
        let ledger = SyncErrorLedger::new(Arc::new(MemoryStore::new()));
        let id = orgnr("923609016");

        let first = ledger.report(&id, EntityType::Company, "timeout").await.unwrap();
        assert_eq!(first.status, SyncErrorStatus::Pending);
        assert_eq!(first.attempt_count, 1);
        assert!(first.last_retry_at.is_none());

        let second = ledger.report(&id, EntityType::Company, "502").await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt_count, 2);
        assert_eq!(second.status, SyncErrorStatus::Retrying);
        assert_eq!(second.message, "502");
        assert!(second.last_retry_at.is_some());

        // Different entity type is a different key.
        let roles = ledger.report(&id, EntityType::Role, "timeout").await.unwrap();
        assert_ne!(roles.id, first.id);
        assert_eq!(ledger.open_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resolve_then_report_opens_new_row() {
        let ledger = SyncErrorLedger::new(Arc::new(MemoryStore::new()));
        let id = orgnr("923609016");

        let first = ledger.report(&id, EntityType::Subunit, "boom").await.unwrap();
        assert!(ledger.resolve(&id, EntityType::Subunit).await.unwrap());
        assert!(!ledger.resolve(&id, EntityType::Subunit).await.unwrap());
        assert!(ledger.open(&id, EntityType::Subunit).await.unwrap().is_none());

        let reopened = ledger.report(&id, EntityType::Subunit, "boom").await.unwrap();
        assert_ne!(reopened.id, first.id);
        assert_eq!(reopened.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_sticky() {
        let ledger = SyncErrorLedger::new(Arc::new(MemoryStore::new()));
        let id = orgnr("923609016");

        for _ in 0..3 {
            ledger.report(&id, EntityType::Financials, "500").await.unwrap();
        }
        assert_eq!(ledger.mark_permanent_failures(3).await.unwrap(), 1);
        assert!(ledger.retryable(10, 3).await.unwrap().is_empty());

        let again = ledger.report(&id, EntityType::Financials, "500").await.unwrap();
        assert_eq!(again.status, SyncErrorStatus::PermanentFailure);
        assert_eq!(again.attempt_count, 4);
    }
}
