use super::{
    EntityStore, ImportQueueStore, MaintenanceStore, RoleStore, SyncErrorStore, SystemStateStore,
    is_safe_identifier
};
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::models::{
    Company, Coordinates, CountyStat, EntityType, FinancialStatement, GeocodeCandidate,
    ImportQueueEntry, ImportResult, ImportStatus, ImportStatusCount, IndustryStat, OrgNumber,
    PopulateReport, PopulationRecord, Role, SubUnit, SyncErrorCount, SyncErrorRecord,
    SyncErrorStatus
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// In-process [`Store`](super::Store).
///
/// Every call runs under one lock, so multi-row operations are atomic with
/// respect to concurrent readers. Writes to the entity tables (companies,
/// subunits, roles, financials) are counted.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    entity_writes: AtomicU64
}

#[derive(Default)]
struct MemoryState {
    companies: BTreeMap<OrgNumber, StoredCompany>,
    subunits: BTreeMap<OrgNumber, StoredSubunit>,
    roles: HashMap<OrgNumber, Vec<Role>>,
    financials: BTreeMap<(OrgNumber, i32), FinancialStatement>,
    sync_errors: Vec<SyncErrorRecord>,
    next_error_id: i64,
    queue: BTreeMap<OrgNumber, ImportQueueEntry>,
    system_state: HashMap<String, (String, DateTime<Utc>)>,
    population: BTreeMap<(String, i32), PopulationRecord>,
    refreshed_views: Vec<String>
}

struct StoredCompany {
    company: Company,
    roles_polled_at: Option<DateTime<Utc>>,
    financials_polled_at: Option<DateTime<Utc>>,
    coordinates: Option<Coordinates>,
    geocode_attempts: i32
}

struct StoredSubunit {
    subunit: SubUnit,
    parent_gone_at: Option<DateTime<Utc>>
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write operations issued against the entity tables.
    pub fn entity_write_count(&self) -> u64 {
        self.entity_writes.load(Ordering::SeqCst)
    }

    pub async fn subunit_count(&self) -> usize {
        self.state.read().await.subunits.len()
    }

    pub async fn is_parent_marked_gone(&self, parent: &OrgNumber) -> bool {
        self.state.read().await.subunits.values().any(|s| {
            s.subunit.parent_orgnr.as_ref() == Some(parent) && s.parent_gone_at.is_some()
        })
    }

    pub async fn coordinates(&self, orgnr: &OrgNumber) -> Option<Coordinates> {
        self.state
            .read()
            .await
            .companies
            .get(orgnr)
            .and_then(|c| c.coordinates)
    }

    pub async fn roles_polled_at(&self, orgnr: &OrgNumber) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .companies
            .get(orgnr)
            .and_then(|c| c.roles_polled_at)
    }

    pub async fn refreshed_views(&self) -> Vec<String> {
        self.state.read().await.refreshed_views.clone()
    }

    pub async fn population(&self) -> Vec<PopulationRecord> {
        self.state.read().await.population.values().cloned().collect()
    }

    pub async fn sync_errors(&self) -> Vec<SyncErrorRecord> {
        self.state.read().await.sync_errors.clone()
    }

    fn count_write(&self) {
        self.entity_writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn advance(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(candidate, |c| c.max(candidate)))
}

impl MemoryState {
    fn has_open_error(&self, orgnr: &OrgNumber, entity_type: EntityType) -> bool {
        self.sync_errors
            .iter()
            .any(|e| &e.orgnr == orgnr && e.entity_type == entity_type && e.status.is_open())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_company(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<Company>> {
        Ok(self
            .state
            .read()
            .await
            .companies
            .get(orgnr)
            .map(|c| c.company.clone()))
    }

    async fn get_subunit(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<SubUnit>> {
        Ok(self
            .state
            .read()
            .await
            .subunits
            .get(orgnr)
            .map(|s| s.subunit.clone()))
    }

    async fn upsert_companies(&self, companies: &[Company]) -> RegistrySyncResult<u64> {
        if companies.is_empty() {
            return Ok(0);
        }
        self.count_write();
        let mut state = self.state.write().await;
        for company in companies {
            state
                .companies
                .entry(company.orgnr.clone())
                .and_modify(|stored| {
                    let street = |c: &Company| c.address.as_ref().and_then(|a| a.street.clone());
                    if street(&stored.company) != street(company) {
                        stored.coordinates = None;
                        stored.geocode_attempts = 0;
                    }
                    stored.company = company.clone();
                })
                .or_insert_with(|| StoredCompany {
                    company: company.clone(),
                    roles_polled_at: None,
                    financials_polled_at: None,
                    coordinates: None,
                    geocode_attempts: 0
                });
        }
        Ok(companies.len() as u64)
    }

    async fn upsert_subunits(&self, subunits: &[SubUnit]) -> RegistrySyncResult<u64> {
        if subunits.is_empty() {
            return Ok(0);
        }
        self.count_write();
        let mut state = self.state.write().await;
        for subunit in subunits {
            let parent_gone_at = state
                .subunits
                .get(&subunit.orgnr)
                .filter(|s| s.subunit.parent_orgnr == subunit.parent_orgnr)
                .and_then(|s| s.parent_gone_at);
            state.subunits.insert(
                subunit.orgnr.clone(),
                StoredSubunit {
                    subunit: subunit.clone(),
                    parent_gone_at
                }
            );
        }
        Ok(subunits.len() as u64)
    }

    async fn upsert_financials(
        &self,
        orgnr: &OrgNumber,
        statements: &[FinancialStatement],
        polled_at: DateTime<Utc>
    ) -> RegistrySyncResult<u64> {
        self.count_write();
        let mut state = self.state.write().await;
        for statement in statements {
            state
                .financials
                .insert((statement.orgnr.clone(), statement.year), statement.clone());
        }
        if let Some(stored) = state.companies.get_mut(orgnr) {
            stored.financials_polled_at = advance(stored.financials_polled_at, polled_at);
        }
        Ok(statements.len() as u64)
    }

    async fn orphaned_parents(&self, limit: usize) -> RegistrySyncResult<Vec<OrgNumber>> {
        let state = self.state.read().await;
        let mut parents: Vec<OrgNumber> = state
            .subunits
            .values()
            .filter(|s| s.parent_gone_at.is_none())
            .filter_map(|s| s.subunit.parent_orgnr.clone())
            .filter(|parent| !state.companies.contains_key(parent))
            .filter(|parent| !state.has_open_error(parent, EntityType::Company))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        parents.sort();
        parents.truncate(limit);
        Ok(parents)
    }

    async fn mark_parent_gone(&self, parent: &OrgNumber) -> RegistrySyncResult<u64> {
        self.count_write();
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut marked = 0;
        for stored in state.subunits.values_mut() {
            if stored.subunit.parent_orgnr.as_ref() == Some(parent) && stored.parent_gone_at.is_none()
            {
                stored.parent_gone_at = Some(now);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn largest_companies(&self, limit: usize) -> RegistrySyncResult<Vec<OrgNumber>> {
        let state = self.state.read().await;
        let mut companies: Vec<&StoredCompany> = state.companies.values().collect();
        companies.sort_by(|a, b| {
            b.company
                .employees
                .unwrap_or(0)
                .cmp(&a.company.employees.unwrap_or(0))
                .then_with(|| a.company.orgnr.cmp(&b.company.orgnr))
        });
        Ok(companies
            .into_iter()
            .take(limit)
            .map(|c| c.company.orgnr.clone())
            .collect())
    }

    async fn subunits_of(&self, parent: &OrgNumber) -> RegistrySyncResult<HashSet<OrgNumber>> {
        Ok(self
            .state
            .read()
            .await
            .subunits
            .values()
            .filter(|s| s.subunit.parent_orgnr.as_ref() == Some(parent))
            .map(|s| s.subunit.orgnr.clone())
            .collect())
    }

    async fn companies_needing_roles(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize
    ) -> RegistrySyncResult<Vec<OrgNumber>> {
        let state = self.state.read().await;
        let mut candidates: Vec<(Option<DateTime<Utc>>, OrgNumber)> = state
            .companies
            .values()
            .filter(|c| c.roles_polled_at.is_none_or(|at| at < stale_before))
            .filter(|c| !state.has_open_error(&c.company.orgnr, EntityType::Role))
            .map(|c| (c.roles_polled_at, c.company.orgnr.clone()))
            .collect();
        // Never-polled first, then oldest.
        candidates.sort();
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, orgnr)| orgnr)
            .collect())
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn replace_roles(
        &self,
        batch: &[(OrgNumber, Vec<Role>)],
        polled_at: DateTime<Utc>
    ) -> RegistrySyncResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.count_write();
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for (orgnr, roles) in batch {
            inserted += roles.len() as u64;
            state.roles.insert(orgnr.clone(), roles.clone());
            if let Some(stored) = state.companies.get_mut(orgnr) {
                stored.roles_polled_at = advance(stored.roles_polled_at, polled_at);
            }
        }
        Ok(inserted)
    }

    async fn get_roles(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Vec<Role>> {
        Ok(self
            .state
            .read()
            .await
            .roles
            .get(orgnr)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SyncErrorStore for MemoryStore {
    async fn report_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType,
        message: &str
    ) -> RegistrySyncResult<SyncErrorRecord> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        if let Some(existing) = state.sync_errors.iter_mut().find(|e| {
            &e.orgnr == orgnr && e.entity_type == entity_type && e.status.is_open()
        }) {
            existing.message = message.to_string();
            existing.attempt_count += 1;
            existing.last_retry_at = Some(now);
            if existing.status != SyncErrorStatus::PermanentFailure {
                existing.status = SyncErrorStatus::Retrying;
            }
            return Ok(existing.clone());
        }

        state.next_error_id += 1;
        let record = SyncErrorRecord {
            id: state.next_error_id,
            orgnr: orgnr.clone(),
            entity_type,
            message: message.to_string(),
            status: SyncErrorStatus::Pending,
            attempt_count: 1,
            created_at: now,
            last_retry_at: None,
            resolved_at: None
        };
        state.sync_errors.push(record.clone());
        Ok(record)
    }

    async fn resolve_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType
    ) -> RegistrySyncResult<bool> {
        let mut state = self.state.write().await;
        match state.sync_errors.iter_mut().find(|e| {
            &e.orgnr == orgnr && e.entity_type == entity_type && e.status.is_open()
        }) {
            Some(record) => {
                record.status = SyncErrorStatus::Resolved;
                record.resolved_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false)
        }
    }

    async fn open_sync_error(
        &self,
        orgnr: &OrgNumber,
        entity_type: EntityType
    ) -> RegistrySyncResult<Option<SyncErrorRecord>> {
        Ok(self
            .state
            .read()
            .await
            .sync_errors
            .iter()
            .find(|e| &e.orgnr == orgnr && e.entity_type == entity_type && e.status.is_open())
            .cloned())
    }

    async fn retryable_sync_errors(
        &self,
        max_attempts: u32,
        limit: usize
    ) -> RegistrySyncResult<Vec<SyncErrorRecord>> {
        let state = self.state.read().await;
        let mut rows: Vec<SyncErrorRecord> = state
            .sync_errors
            .iter()
            .filter(|e| {
                matches!(e.status, SyncErrorStatus::Pending | SyncErrorStatus::Retrying)
                    && (e.attempt_count as u32) < max_attempts
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.last_retry_at.unwrap_or(e.created_at), e.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_permanent_failures(&self, max_attempts: u32) -> RegistrySyncResult<u64> {
        let mut state = self.state.write().await;
        let mut marked = 0;
        for record in state.sync_errors.iter_mut() {
            if matches!(record.status, SyncErrorStatus::Pending | SyncErrorStatus::Retrying)
                && record.attempt_count as u32 >= max_attempts
            {
                record.status = SyncErrorStatus::PermanentFailure;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn sync_error_summary(&self) -> RegistrySyncResult<Vec<SyncErrorCount>> {
        let state = self.state.read().await;
        let mut counts: BTreeMap<(&'static str, &'static str), SyncErrorCount> = BTreeMap::new();
        for record in &state.sync_errors {
            counts
                .entry((record.entity_type.as_str(), record.status.as_str()))
                .or_insert_with(|| SyncErrorCount {
                    entity_type: record.entity_type,
                    status: record.status,
                    count: 0
                })
                .count += 1;
        }
        Ok(counts.into_values().collect())
    }
}

#[async_trait]
impl ImportQueueStore for MemoryStore {
    async fn enqueue(
        &self,
        orgnrs: &[OrgNumber],
        priority: i32
    ) -> RegistrySyncResult<PopulateReport> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut report = PopulateReport::default();
        let mut seen = HashSet::new();

        for orgnr in orgnrs {
            if !seen.insert(orgnr) {
                continue;
            }
            if state.queue.contains_key(orgnr) {
                report.skipped += 1;
                continue;
            }
            state.queue.insert(
                orgnr.clone(),
                ImportQueueEntry {
                    orgnr: orgnr.clone(),
                    status: ImportStatus::Pending,
                    priority,
                    attempt_count: 0,
                    last_error: None,
                    company_fetched: false,
                    financials_count: 0,
                    created_at: now,
                    started_at: None,
                    finished_at: None
                }
            );
            report.added += 1;
        }
        Ok(report)
    }

    async fn claim_pending(&self, limit: usize) -> RegistrySyncResult<Vec<ImportQueueEntry>> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut pending: Vec<(i32, DateTime<Utc>, OrgNumber)> = state
            .queue
            .values()
            .filter(|e| e.status == ImportStatus::Pending)
            .map(|e| (-e.priority, e.created_at, e.orgnr.clone()))
            .collect();
        pending.sort();

        let mut claimed = Vec::new();
        for (_, _, orgnr) in pending.into_iter().take(limit) {
            if let Some(entry) = state.queue.get_mut(&orgnr) {
                entry.status = ImportStatus::InProgress;
                entry.attempt_count += 1;
                entry.started_at = Some(now);
                entry.finished_at = None;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn finish_import(&self, result: &ImportResult) -> RegistrySyncResult<()> {
        let mut state = self.state.write().await;
        let entry = state.queue.get_mut(&result.orgnr).ok_or_else(|| {
            RegistrySyncError::ValidationError(format!("{} is not queued", result.orgnr))
        })?;
        entry.status = result.status();
        entry.company_fetched = result.company_fetched;
        entry.financials_count = result.financials_count as i32;
        entry.last_error = result.error.clone();
        entry.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn reset_failed(
        &self,
        max_attempts: Option<i32>,
        failed_before: Option<DateTime<Utc>>
    ) -> RegistrySyncResult<u64> {
        let mut state = self.state.write().await;
        let mut reset = 0;
        for entry in state.queue.values_mut() {
            if entry.status != ImportStatus::Failed {
                continue;
            }
            if max_attempts.is_some_and(|max| entry.attempt_count >= max) {
                continue;
            }
            if let Some(cutoff) = failed_before {
                if !entry.finished_at.is_some_and(|at| at < cutoff) {
                    continue;
                }
            }
            entry.status = ImportStatus::Pending;
            entry.started_at = None;
            entry.finished_at = None;
            reset += 1;
        }
        Ok(reset)
    }

    async fn requeue_stale(&self, started_before: DateTime<Utc>) -> RegistrySyncResult<u64> {
        let mut state = self.state.write().await;
        let mut requeued = 0;
        for entry in state.queue.values_mut() {
            if entry.status == ImportStatus::InProgress
                && entry.started_at.is_none_or(|at| at < started_before)
            {
                entry.status = ImportStatus::Pending;
                entry.started_at = None;
                entry.last_error = Some("requeued after worker timeout".to_string());
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn queue_entry(&self, orgnr: &OrgNumber) -> RegistrySyncResult<Option<ImportQueueEntry>> {
        Ok(self.state.read().await.queue.get(orgnr).cloned())
    }

    async fn queue_summary(&self) -> RegistrySyncResult<Vec<ImportStatusCount>> {
        let state = self.state.read().await;
        let mut counts: BTreeMap<&'static str, ImportStatusCount> = BTreeMap::new();
        for entry in state.queue.values() {
            counts
                .entry(entry.status.as_str())
                .or_insert_with(|| ImportStatusCount {
                    status: entry.status,
                    count: 0
                })
                .count += 1;
        }
        Ok(counts.into_values().collect())
    }
}

#[async_trait]
impl SystemStateStore for MemoryStore {
    async fn get_state(&self, key: &str) -> RegistrySyncResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .system_state
            .get(key)
            .map(|(value, _)| value.clone()))
    }

    async fn set_state(&self, key: &str, value: &str) -> RegistrySyncResult<()> {
        self.state
            .write()
            .await
            .system_state
            .insert(key.to_string(), (value.to_string(), Utc::now()));
        Ok(())
    }
}

#[async_trait]
impl MaintenanceStore for MemoryStore {
    async fn refresh_materialized_views(&self, views: &[String]) -> RegistrySyncResult<()> {
        if let Some(bad) = views.iter().find(|v| !is_safe_identifier(v)) {
            return Err(RegistrySyncError::ValidationError(format!(
                "invalid materialized view name: {bad}"
            )));
        }
        self.state
            .write()
            .await
            .refreshed_views
            .extend(views.iter().cloned());
        Ok(())
    }

    async fn pending_geocodes(
        &self,
        limit: usize,
        max_attempts: i32
    ) -> RegistrySyncResult<Vec<GeocodeCandidate>> {
        let state = self.state.read().await;
        Ok(state
            .companies
            .values()
            .filter(|c| c.coordinates.is_none() && c.geocode_attempts < max_attempts)
            .filter_map(|c| {
                let address = c.company.address.clone()?;
                address.search_text()?;
                Some(GeocodeCandidate {
                    orgnr: c.company.orgnr.clone(),
                    address,
                    attempts: c.geocode_attempts
                })
            })
            .take(limit)
            .collect())
    }

    async fn save_geocode(
        &self,
        orgnr: &OrgNumber,
        coordinates: Option<Coordinates>
    ) -> RegistrySyncResult<()> {
        self.count_write();
        let mut state = self.state.write().await;
        if let Some(stored) = state.companies.get_mut(orgnr) {
            stored.geocode_attempts += 1;
            if coordinates.is_some() {
                stored.coordinates = coordinates;
            }
        }
        Ok(())
    }

    async fn upsert_population(&self, records: &[PopulationRecord]) -> RegistrySyncResult<u64> {
        let mut state = self.state.write().await;
        for record in records {
            state.population.insert(
                (record.municipality_number.clone(), record.year),
                record.clone()
            );
        }
        Ok(records.len() as u64)
    }

    async fn industry_stats(&self, limit: usize) -> RegistrySyncResult<Vec<IndustryStat>> {
        let state = self.state.read().await;
        let mut by_code: BTreeMap<String, IndustryStat> = BTreeMap::new();
        for stored in state.companies.values() {
            let Some(code) = stored.company.industry_codes.first() else {
                continue;
            };
            let stat = by_code
                .entry(code.clone())
                .or_insert_with(|| IndustryStat {
                    industry_code: code.clone(),
                    company_count: 0,
                    employee_count: 0
                });
            stat.company_count += 1;
            stat.employee_count += i64::from(stored.company.employees.unwrap_or(0));
        }
        let mut stats: Vec<IndustryStat> = by_code.into_values().collect();
        stats.sort_by(|a, b| {
            b.company_count
                .cmp(&a.company_count)
                .then_with(|| a.industry_code.cmp(&b.industry_code))
        });
        stats.truncate(limit);
        Ok(stats)
    }

    async fn county_stats(&self) -> RegistrySyncResult<Vec<CountyStat>> {
        let state = self.state.read().await;
        let mut by_county: BTreeMap<String, CountyStat> = BTreeMap::new();
        for stored in state.companies.values() {
            let Some(municipality) = stored
                .company
                .address
                .as_ref()
                .and_then(|a| a.municipality_number.as_deref())
            else {
                continue;
            };
            let county: String = municipality.chars().take(2).collect();
            let stat = by_county
                .entry(county.clone())
                .or_insert_with(|| CountyStat {
                    county_number: county,
                    company_count: 0,
                    employee_count: 0,
                    population: None
                });
            stat.company_count += 1;
            stat.employee_count += i64::from(stored.company.employees.unwrap_or(0));
        }
        // Latest year per municipality.
        let mut latest: HashMap<&str, &PopulationRecord> = HashMap::new();
        for record in state.population.values() {
            latest
                .entry(record.municipality_number.as_str())
                .and_modify(|current| {
                    if record.year > current.year {
                        *current = record;
                    }
                })
                .or_insert(record);
        }
        for record in latest.into_values() {
            let county: String = record.municipality_number.chars().take(2).collect();
            if let Some(stat) = by_county.get_mut(&county) {
                *stat.population.get_or_insert(0) += record.population;
            }
        }
        Ok(by_county.into_values().collect())
    }
}
