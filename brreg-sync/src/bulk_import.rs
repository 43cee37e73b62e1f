use crate::client::RegistryClient;
use crate::config::BulkImportConfig;
use crate::error::RegistrySyncResult;
use crate::models::{
    Fetched, ImportResult, ImportStatus, ImportStatusCount, OrgNumber, PopulateReport
};
use crate::store::Store;
use crate::telemetry::{OperationTimer, Telemetry};
use chrono::{Duration, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub financials: u64
}

impl BatchReport {
    fn absorb(&mut self, other: &BatchReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.financials += other.financials;
    }
}

/// Persistent first-time ingestion queue.
pub struct BulkImportService {
    client: Arc<dyn RegistryClient>,
    store: Arc<dyn Store>,
    config: BulkImportConfig
}

impl BulkImportService {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        store: Arc<dyn Store>,
        config: BulkImportConfig
    ) -> Self {
        Self {
            client,
            store,
            config
        }
    }

    /// Validates and enqueues organization numbers. Numbers already queued
    /// in any status, including completed, are skipped.
    pub async fn populate_queue<S: AsRef<str>>(
        &self,
        ids: &[S],
        priority: i32
    ) -> RegistrySyncResult<PopulateReport> {
        let orgnrs = ids
            .iter()
            .map(|id| OrgNumber::parse(id.as_ref()))
            .collect::<RegistrySyncResult<Vec<_>>>()?;
        let report = self.store.enqueue(&orgnrs, priority).await?;
        info!(added = report.added, skipped = report.skipped, priority, "Import queue populated");
        Ok(report)
    }

    /// Fetches one company and its financial statements. Failures are
    /// captured in the result, never returned.
    pub async fn process_single_company(&self, orgnr: &OrgNumber) -> ImportResult {
        let mut result = ImportResult::new(orgnr.clone());

        match self.client.fetch_entity(orgnr).await {
            Ok(Fetched::Found(company)) => {
                if let Err(e) = self.store.upsert_companies(&[company]).await {
                    result.error = Some(e.to_string());
                    return result;
                }
                result.company_fetched = true;
            }
            Ok(Fetched::Gone) => {
                Telemetry::record_gone("company");
                result.gone = true;
                return result;
            }
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        }

        match self.client.fetch_financials(orgnr).await {
            Ok(Fetched::Found(statements)) => {
                match self
                    .store
                    .upsert_financials(orgnr, &statements, Utc::now())
                    .await
                {
                    Ok(_) => result.financials_count = statements.len(),
                    Err(e) => result.error = Some(format!("financials: {e}"))
                }
            }
            Ok(Fetched::Gone) => {}
            Err(e) => result.error = Some(format!("financials: {e}"))
        }

        result
    }

    /// Claims up to `size` pending rows and processes them concurrently.
    ///
    /// Rows are marked `in_progress` before any registry call, so a crash
    /// leaves them for [`reap_stale`](Self::reap_stale) instead of running
    /// them twice in parallel.
    pub async fn process_batch(&self, size: usize) -> RegistrySyncResult<BatchReport> {
        let timer = OperationTimer::new("bulk_import.batch");
        let claimed = self.store.claim_pending(size).await?;
        let mut report = BatchReport {
            claimed: claimed.len() as u64,
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(claimed = claimed.len(), "Import batch claimed");

        let outcomes: Vec<RegistrySyncResult<ImportResult>> = stream::iter(claimed)
            .map(|entry| async move {
                let result = self.process_single_company(&entry.orgnr).await;
                self.store.finish_import(&result).await.map(|()| result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            let result = outcome?;
            match result.status() {
                ImportStatus::Completed => report.completed += 1,
                ImportStatus::Skipped => report.skipped += 1,
                _ => {
                    warn!(
                        orgnr = %result.orgnr,
                        error = result.error.as_deref().unwrap_or_default(),
                        "Import failed"
                    );
                    report.failed += 1;
                }
            }
            report.financials += result.financials_count as u64;
        }
        Telemetry::record_applied("company", report.completed);
        timer.finish();

        info!(
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "Import batch finished"
        );
        Ok(report)
    }

    /// Processes batches until the queue has no pending rows or
    /// `max_batches` is reached.
    pub async fn drain(&self, max_batches: Option<usize>) -> RegistrySyncResult<BatchReport> {
        let mut total = BatchReport::default();
        let mut batches = 0;
        loop {
            if max_batches.is_some_and(|max| batches >= max) {
                break;
            }
            let report = self.process_batch(self.config.batch_size).await?;
            batches += 1;
            if report.claimed == 0 {
                break;
            }
            total.absorb(&report);
        }
        Ok(total)
    }

    /// Returns failed rows to `pending`.
    pub async fn retry_failed(
        &self,
        max_attempts: Option<i32>,
        failed_before: Option<chrono::DateTime<Utc>>
    ) -> RegistrySyncResult<u64> {
        let reset = self.store.reset_failed(max_attempts, failed_before).await?;
        info!(reset, "Failed imports requeued");
        Ok(reset)
    }

    /// Returns rows stuck `in_progress` longer than `timeout` (or the
    /// configured default) to `pending`.
    pub async fn reap_stale(&self, timeout: Option<Duration>) -> RegistrySyncResult<u64> {
        let timeout =
            timeout.unwrap_or_else(|| Duration::minutes(self.config.in_progress_timeout_minutes));
        let requeued = self.store.requeue_stale(Utc::now() - timeout).await?;
        if requeued > 0 {
            warn!(requeued, timeout_minutes = timeout.num_minutes(), "Stale imports requeued");
        }
        Ok(requeued)
    }

    pub async fn summary(&self) -> RegistrySyncResult<Vec<ImportStatusCount>> {
        self.store.queue_summary().await
    }
}
