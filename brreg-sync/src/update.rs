use crate::client::RegistryClient;
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::ledger::SyncErrorLedger;
use crate::models::{Fetched, OrgNumber, PageCursor, UpdateEvent, UpdateSince, UpdateStream};
use crate::store::Store;
use crate::telemetry::{OperationTimer, Telemetry};
use chrono::{DateTime, Days, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReport {
    pub stream: UpdateStream,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub entities_updated: u64,
    pub gone_skipped: u64,
    pub failed: u64,
    pub pages: u32,
    pub latest_oppdateringsid: Option<i64>
}

impl UpdateReport {
    fn new(stream: UpdateStream) -> Self {
        Self {
            stream,
            started_at: Utc::now(),
            completed_at: None,
            entities_updated: 0,
            gone_skipped: 0,
            failed: 0,
            pages: 0,
            latest_oppdateringsid: None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub reports: Vec<UpdateReport>,
    pub failures: Vec<StreamFailure>
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFailure {
    pub stream: UpdateStream,
    pub error: String
}

impl CycleReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Consumes the registry's update streams and applies the changes locally.
pub struct UpdateService {
    client: Arc<dyn RegistryClient>,
    store: Arc<dyn Store>,
    ledger: SyncErrorLedger,
    concurrency: usize
}

impl UpdateService {
    pub fn new(client: Arc<dyn RegistryClient>, store: Arc<dyn Store>, concurrency: usize) -> Self {
        Self {
            ledger: SyncErrorLedger::new(store.clone()),
            client,
            store,
            concurrency: concurrency.max(1)
        }
    }

    pub async fn fetch_company_updates(
        &self,
        since: Option<UpdateSince>
    ) -> RegistrySyncResult<UpdateReport> {
        self.fetch_updates(UpdateStream::Companies, since).await
    }

    pub async fn fetch_subunit_updates(
        &self,
        since: Option<UpdateSince>
    ) -> RegistrySyncResult<UpdateReport> {
        self.fetch_updates(UpdateStream::Subunits, since).await
    }

    pub async fn fetch_role_updates(
        &self,
        since: Option<UpdateSince>
    ) -> RegistrySyncResult<UpdateReport> {
        self.fetch_updates(UpdateStream::Roles, since).await
    }

    /// Runs every stream from its persisted cursor. A failing stream is
    /// logged and recorded; the others still run.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut cycle = CycleReport::default();
        for stream in [
            UpdateStream::Companies,
            UpdateStream::Subunits,
            UpdateStream::Roles
        ] {
            match self.fetch_updates(stream, None).await {
                Ok(report) => cycle.reports.push(report),
                Err(e) => {
                    error!(stream = stream.as_str(), error = %e, "Update stream failed");
                    cycle.failures.push(StreamFailure {
                        stream,
                        error: e.to_string()
                    });
                }
            }
        }
        cycle
    }

    /// Last update id durably applied for `stream`.
    pub async fn cursor(&self, stream: UpdateStream) -> RegistrySyncResult<Option<i64>> {
        match self.store.get_state(&stream.cursor_key()).await? {
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                RegistrySyncError::ValidationError(format!(
                    "stored cursor {:?} for {} is not an update id",
                    raw,
                    stream.as_str()
                ))
            }),
            None => Ok(None)
        }
    }

    async fn resolve_since(&self, stream: UpdateStream) -> RegistrySyncResult<UpdateSince> {
        match self.cursor(stream).await {
            Ok(Some(id)) => return Ok(UpdateSince::After(id)),
            Ok(None) => {}
            Err(e) => warn!(stream = stream.as_str(), error = %e, "Ignoring unreadable cursor")
        }
        if let Some(raw) = self.store.get_state(&stream.sync_date_key()).await? {
            match UpdateSince::parse_date(&raw) {
                Ok(since) => return Ok(since),
                Err(e) => warn!(stream = stream.as_str(), error = %e, "Ignoring unreadable sync date")
            }
        }
        let today = Utc::now().date_naive();
        Ok(UpdateSince::Date(today.checked_sub_days(Days::new(1)).unwrap_or(today)))
    }

    async fn fetch_updates(
        &self,
        stream: UpdateStream,
        since: Option<UpdateSince>
    ) -> RegistrySyncResult<UpdateReport> {
        let timer = OperationTimer::new(&format!("updates.{}", stream.as_str()));
        let mut report = UpdateReport::new(stream);
        let since = match since {
            Some(since) => since,
            None => self.resolve_since(stream).await?
        };
        info!(stream = stream.as_str(), since = ?since, "Fetching registry updates");

        // Events at or below the starting id were applied by an earlier run.
        let mut floor = match since {
            UpdateSince::After(id) => Some(id),
            UpdateSince::Date(_) => None
        };
        let persisted = self.cursor(stream).await.ok().flatten();
        let mut cursor = PageCursor::Start(since);

        loop {
            let page = self.client.fetch_update_page(stream, &cursor).await?;
            report.pages += 1;

            let fresh = dedupe_events(&page.events, floor);
            let page_max = fresh.values().copied().max();
            debug!(
                stream = stream.as_str(),
                page = report.pages,
                events = page.events.len(),
                fresh = fresh.len(),
                "Update page received"
            );

            if !fresh.is_empty() {
                let mut orgnrs: Vec<OrgNumber> = fresh.into_keys().collect();
                orgnrs.sort();
                self.apply_page(stream, orgnrs, &mut report).await?;
            }

            // Persist only after the page's writes committed.
            if let Some(max) = page_max {
                floor = Some(floor.map_or(max, |f| f.max(max)));
                let durable = persisted.map_or(max, |p| p.max(max));
                self.store
                    .set_state(&stream.cursor_key(), &durable.to_string())
                    .await?;
                report.latest_oppdateringsid = Some(durable);
            }

            match page.next {
                Some(href) if !page.events.is_empty() => cursor = PageCursor::Next(href),
                _ => break
            }
        }

        self.store
            .set_state(
                &stream.sync_date_key(),
                &Utc::now().date_naive().format("%Y-%m-%d").to_string()
            )
            .await?;
        if report.latest_oppdateringsid.is_none() {
            report.latest_oppdateringsid = persisted;
        }
        report.completed_at = Some(Utc::now());
        timer.finish();

        info!(
            stream = stream.as_str(),
            pages = report.pages,
            entities_updated = report.entities_updated,
            gone_skipped = report.gone_skipped,
            failed = report.failed,
            latest_oppdateringsid = report.latest_oppdateringsid,
            "Update stream processed"
        );
        Ok(report)
    }

    async fn apply_page(
        &self,
        stream: UpdateStream,
        orgnrs: Vec<OrgNumber>,
        report: &mut UpdateReport
    ) -> RegistrySyncResult<()> {
        let applied = match stream {
            UpdateStream::Companies => {
                let staged = self
                    .fetch_each(stream, orgnrs, report, |id| async move {
                        let result = self.client.fetch_entity(&id).await;
                        (id, result)
                    })
                    .await?;
                let companies: Vec<_> = staged.iter().map(|(_, c)| c.clone()).collect();
                self.store.upsert_companies(&companies).await?;
                staged.into_iter().map(|(id, _)| id).collect::<Vec<_>>()
            }
            UpdateStream::Subunits => {
                let staged = self
                    .fetch_each(stream, orgnrs, report, |id| async move {
                        let result = self.client.fetch_subunit(&id).await;
                        (id, result)
                    })
                    .await?;
                let subunits: Vec<_> = staged.iter().map(|(_, s)| s.clone()).collect();
                self.store.upsert_subunits(&subunits).await?;
                staged.into_iter().map(|(id, _)| id).collect::<Vec<_>>()
            }
            UpdateStream::Roles => {
                let staged = self
                    .fetch_each(stream, orgnrs, report, |id| async move {
                        let result = self.client.fetch_roles(&id).await;
                        (id, result)
                    })
                    .await?;
                // One transaction for every entity touched by this page.
                self.store.replace_roles(&staged, Utc::now()).await?;
                staged.into_iter().map(|(id, _)| id).collect::<Vec<_>>()
            }
        };

        let entity_type = stream.entity_type();
        for orgnr in &applied {
            self.ledger.resolve(orgnr, entity_type).await?;
        }
        report.entities_updated += applied.len() as u64;
        Telemetry::record_applied(entity_type.as_str(), applied.len() as u64);
        Ok(())
    }

    /// Fetches every id with bounded concurrency. Gone ids are counted and
    /// dropped; failures go to the ledger and never abort the page.
    async fn fetch_each<T, F, Fut>(
        &self,
        stream: UpdateStream,
        orgnrs: Vec<OrgNumber>,
        report: &mut UpdateReport,
        fetch: F
    ) -> RegistrySyncResult<Vec<(OrgNumber, T)>>
    where
        F: Fn(OrgNumber) -> Fut,
        Fut: Future<Output = (OrgNumber, RegistrySyncResult<Fetched<T>>)>
    {
        let results: Vec<_> = stream::iter(orgnrs)
            .map(fetch)
            .buffered(self.concurrency)
            .collect()
            .await;

        let entity_type = stream.entity_type();
        let mut staged = Vec::with_capacity(results.len());
        for (orgnr, result) in results {
            match result {
                Ok(Fetched::Found(value)) => staged.push((orgnr, value)),
                Ok(Fetched::Gone) => {
                    debug!(orgnr = %orgnr, entity_type = %entity_type, "Gone upstream, skipping");
                    Telemetry::record_gone(entity_type.as_str());
                    report.gone_skipped += 1;
                }
                Err(e) => {
                    self.ledger
                        .report(&orgnr, entity_type, &e.to_string())
                        .await?;
                    report.failed += 1;
                }
            }
        }
        Ok(staged)
    }
}

/// Fresh events of a page keyed by orgnr, each with its highest update id.
fn dedupe_events(events: &[UpdateEvent], floor: Option<i64>) -> HashMap<OrgNumber, i64> {
    let mut fresh: HashMap<OrgNumber, i64> = HashMap::new();
    for event in events {
        if floor.is_some_and(|f| event.update_id <= f) {
            continue;
        }
        fresh
            .entry(event.orgnr.clone())
            .and_modify(|id| *id = (*id).max(event.update_id))
            .or_insert(event.update_id);
    }
    fresh
}
