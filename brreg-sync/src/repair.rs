//! Consistency sweeps over local storage and the sync error ledger.
//!
//! Every sweep runs the same scan with or without `repair`; only repair mode
//! writes to the entity tables or the ledger.

use crate::client::RegistryClient;
use crate::config::RepairConfig;
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::ledger::SyncErrorLedger;
use crate::models::{EntityType, Fetched, OrgNumber};
use crate::store::Store;
use crate::telemetry::Telemetry;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairMode {
    Ghosts,
    Subunits,
    Roles,
    Errors,
    All
}

impl RepairMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ghosts => "ghosts",
            Self::Subunits => "subunits",
            Self::Roles => "roles",
            Self::Errors => "errors",
            Self::All => "all"
        }
    }
}

impl FromStr for RepairMode {
    type Err = RegistrySyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ghosts" => Ok(Self::Ghosts),
            "subunits" => Ok(Self::Subunits),
            "roles" => Ok(Self::Roles),
            "errors" => Ok(Self::Errors),
            "all" => Ok(Self::All),
            other => Err(RegistrySyncError::ValidationError(format!(
                "unknown repair mode: {other}"
            )))
        }
    }
}

impl fmt::Display for RepairMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairFinding {
    pub orgnr: OrgNumber,
    pub detail: String
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub sweep: String,
    pub repair: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scanned: u64,
    pub discrepancies: u64,
    pub repaired: u64,
    pub gone: u64,
    pub failed: u64,
    pub promoted: u64,
    pub findings: Vec<RepairFinding>
}

impl RepairReport {
    fn new(sweep: &str, repair: bool) -> Self {
        Self {
            sweep: sweep.to_string(),
            repair,
            started_at: Utc::now(),
            completed_at: None,
            scanned: 0,
            discrepancies: 0,
            repaired: 0,
            gone: 0,
            failed: 0,
            promoted: 0,
            findings: Vec::new()
        }
    }

    fn finding(&mut self, orgnr: &OrgNumber, detail: impl Into<String>) {
        self.findings.push(RepairFinding {
            orgnr: orgnr.clone(),
            detail: detail.into()
        });
    }

    fn complete(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        info!(
            sweep = %self.sweep,
            repair = self.repair,
            scanned = self.scanned,
            discrepancies = self.discrepancies,
            repaired = self.repaired,
            gone = self.gone,
            failed = self.failed,
            promoted = self.promoted,
            "Repair sweep finished"
        );
        self
    }
}

pub struct RepairService {
    client: Arc<dyn RegistryClient>,
    store: Arc<dyn Store>,
    ledger: SyncErrorLedger,
    config: RepairConfig
}

impl RepairService {
    pub fn new(client: Arc<dyn RegistryClient>, store: Arc<dyn Store>, config: RepairConfig) -> Self {
        Self {
            ledger: SyncErrorLedger::new(store.clone()),
            client,
            store,
            config
        }
    }

    pub async fn run(
        &self,
        mode: RepairMode,
        limit: usize,
        repair: bool
    ) -> RegistrySyncResult<Vec<RepairReport>> {
        info!(mode = mode.as_str(), limit, repair, "Starting repair");
        let reports = match mode {
            RepairMode::Ghosts => vec![self.fix_ghost_parents(limit, repair).await?],
            RepairMode::Subunits => vec![self.audit_subunits(limit, repair).await?],
            RepairMode::Roles => vec![self.backfill_roles(limit, repair).await?],
            RepairMode::Errors => vec![self.retry_sync_errors(limit, repair).await?],
            RepairMode::All => vec![
                self.fix_ghost_parents(limit, repair).await?,
                self.audit_subunits(limit, repair).await?,
                self.backfill_roles(limit, repair).await?
            ]
        };
        Ok(reports)
    }

    /// Parents referenced by subunits but missing locally.
    pub async fn fix_ghost_parents(&self, limit: usize, repair: bool) -> RegistrySyncResult<RepairReport> {
        let mut report = RepairReport::new("ghost_parents", repair);
        let parents = self.store.orphaned_parents(limit).await?;

        for parent in parents {
            report.scanned += 1;
            report.discrepancies += 1;
            match self.client.fetch_entity(&parent).await {
                Ok(Fetched::Found(company)) => {
                    report.finding(&parent, "parent exists upstream but not locally");
                    if repair {
                        self.store.upsert_companies(&[company]).await?;
                        self.ledger.resolve(&parent, EntityType::Company).await?;
                        report.repaired += 1;
                    }
                }
                Ok(Fetched::Gone) => {
                    report.gone += 1;
                    report.finding(&parent, "parent deleted upstream");
                    if repair {
                        let marked = self.store.mark_parent_gone(&parent).await?;
                        debug!(parent = %parent, subunits = marked, "Orphan marker set");
                        report.repaired += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    report.finding(&parent, format!("lookup failed: {e}"));
                    if repair {
                        self.ledger
                            .report(&parent, EntityType::Company, &e.to_string())
                            .await?;
                    } else {
                        warn!(parent = %parent, error = %e, "Parent lookup failed");
                    }
                }
            }
        }

        Ok(report.complete())
    }

    /// Compares local and upstream subunit counts for the largest companies.
    /// Repair only inserts subunits missing locally; nothing is deleted.
    pub async fn audit_subunits(&self, limit: usize, repair: bool) -> RegistrySyncResult<RepairReport> {
        let mut report = RepairReport::new("subunit_audit", repair);
        let parents = self.store.largest_companies(limit).await?;

        for parent in parents {
            report.scanned += 1;
            let local = self.store.subunits_of(&parent).await?;
            let upstream = match self.client.count_subunits(&parent).await {
                Ok(count) => count,
                Err(e) => {
                    report.failed += 1;
                    report.finding(&parent, format!("count failed: {e}"));
                    if repair {
                        self.ledger
                            .report(&parent, EntityType::Subunit, &e.to_string())
                            .await?;
                    }
                    continue;
                }
            };

            let local_count = local.len() as u64;
            if upstream == local_count {
                continue;
            }
            report.discrepancies += 1;
            report.finding(
                &parent,
                format!("local subunits {local_count}, upstream {upstream}")
            );

            if !repair || upstream < local_count {
                continue;
            }
            match self.client.list_subunits(&parent, upstream as usize).await {
                Ok(listed) => {
                    let missing: Vec<_> = listed
                        .into_iter()
                        .filter(|s| !local.contains(&s.orgnr))
                        .collect();
                    if !missing.is_empty() {
                        self.store.upsert_subunits(&missing).await?;
                        report.repaired += missing.len() as u64;
                        Telemetry::record_applied(EntityType::Subunit.as_str(), missing.len() as u64);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.ledger
                        .report(&parent, EntityType::Subunit, &e.to_string())
                        .await?;
                }
            }
        }

        Ok(report.complete())
    }

    /// Companies whose roles were never fetched or are older than the
    /// staleness threshold.
    pub async fn backfill_roles(&self, limit: usize, repair: bool) -> RegistrySyncResult<RepairReport> {
        let mut report = RepairReport::new("role_backfill", repair);
        let stale_before = Utc::now() - Duration::days(self.config.role_staleness_days);
        let candidates = self
            .store
            .companies_needing_roles(stale_before, limit)
            .await?;
        report.scanned = candidates.len() as u64;
        report.discrepancies = candidates.len() as u64;

        if !repair {
            for orgnr in &candidates {
                report.finding(orgnr, "roles missing or stale");
            }
            return Ok(report.complete());
        }

        let mut staged = Vec::new();
        let mut gone = Vec::new();
        for orgnr in candidates {
            match self.client.fetch_roles(&orgnr).await {
                Ok(Fetched::Found(roles)) => staged.push((orgnr, roles)),
                Ok(Fetched::Gone) => {
                    report.gone += 1;
                    report.finding(&orgnr, "deleted upstream");
                    gone.push((orgnr, Vec::new()));
                }
                Err(e) => {
                    report.failed += 1;
                    self.ledger
                        .report(&orgnr, EntityType::Role, &e.to_string())
                        .await?;
                }
            }
        }

        if !staged.is_empty() {
            self.store.replace_roles(&staged, Utc::now()).await?;
            for (orgnr, _) in &staged {
                self.ledger.resolve(orgnr, EntityType::Role).await?;
            }
            report.repaired = staged.len() as u64;
            Telemetry::record_applied(EntityType::Role.as_str(), report.repaired);
        }

        // An empty set clears stale roles and stamps the poll time.
        if !gone.is_empty() {
            self.store.replace_roles(&gone, Utc::now()).await?;
            for (orgnr, _) in &gone {
                self.ledger.resolve(orgnr, EntityType::Role).await?;
            }
        }

        Ok(report.complete())
    }

    /// Re-attempts open ledger rows below the attempt ceiling, then promotes
    /// rows at the ceiling to permanent failure.
    pub async fn retry_sync_errors(&self, limit: usize, repair: bool) -> RegistrySyncResult<RepairReport> {
        let mut report = RepairReport::new("sync_error_retry", repair);
        let ceiling = self.config.max_sync_error_attempts;
        let rows = self.ledger.retryable(limit, ceiling).await?;
        report.scanned = rows.len() as u64;
        report.discrepancies = rows.len() as u64;

        if !repair {
            for row in &rows {
                report.finding(
                    &row.orgnr,
                    format!("{} failed {} time(s): {}", row.entity_type, row.attempt_count, row.message)
                );
            }
            return Ok(report.complete());
        }

        for row in rows {
            match self.refetch(&row.orgnr, row.entity_type).await {
                Ok(Fetched::Found(())) => {
                    self.ledger.resolve(&row.orgnr, row.entity_type).await?;
                    report.repaired += 1;
                }
                Ok(Fetched::Gone) => {
                    self.ledger.resolve(&row.orgnr, row.entity_type).await?;
                    report.gone += 1;
                }
                Err(e) => {
                    self.ledger
                        .report(&row.orgnr, row.entity_type, &e.to_string())
                        .await?;
                    report.failed += 1;
                }
            }
        }
        report.promoted = self.ledger.mark_permanent_failures(ceiling).await?;

        Ok(report.complete())
    }

    async fn refetch(&self, orgnr: &OrgNumber, entity_type: EntityType) -> RegistrySyncResult<Fetched<()>> {
        let now = Utc::now();
        Ok(match entity_type {
            EntityType::Company => match self.client.fetch_entity(orgnr).await? {
                Fetched::Found(company) => {
                    self.store.upsert_companies(&[company]).await?;
                    Fetched::Found(())
                }
                Fetched::Gone => Fetched::Gone
            },
            EntityType::Subunit => match self.client.fetch_subunit(orgnr).await? {
                Fetched::Found(subunit) => {
                    self.store.upsert_subunits(&[subunit]).await?;
                    Fetched::Found(())
                }
                Fetched::Gone => Fetched::Gone
            },
            EntityType::Role => match self.client.fetch_roles(orgnr).await? {
                Fetched::Found(roles) => {
                    self.store
                        .replace_roles(&[(orgnr.clone(), roles)], now)
                        .await?;
                    Fetched::Found(())
                }
                Fetched::Gone => Fetched::Gone
            },
            EntityType::Financials => match self.client.fetch_financials(orgnr).await? {
                Fetched::Found(statements) => {
                    self.store
                        .upsert_financials(orgnr, &statements, now)
                        .await?;
                    Fetched::Found(())
                }
                Fetched::Gone => Fetched::Gone
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("ghosts".parse::<RepairMode>().unwrap(), RepairMode::Ghosts);
        assert_eq!("ALL".parse::<RepairMode>().unwrap(), RepairMode::All);
        assert!("everything".parse::<RepairMode>().is_err());
        assert_eq!(RepairMode::Subunits.to_string(), "subunits");
    }
}
