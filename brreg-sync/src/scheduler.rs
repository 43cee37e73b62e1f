use crate::analytics::AnalyticsService;
use crate::bulk_import::BulkImportService;
use crate::client::{RegistryClient, create_brreg_client};
use crate::config::RegistrySyncConfig;
use crate::error::{RegistrySyncError, RegistrySyncResult};
use crate::geocode::{Geocoder, KartverketGeocoder, geocode_pending};
use crate::population::{PopulationSource, SsbPopulationClient, sync_population};
use crate::rate_limit::RateLimiter;
use crate::repair::RepairService;
use crate::store::Store;
use crate::telemetry::Telemetry;
use crate::update::UpdateService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    UpdateCycle,
    ViewRefresh,
    PopulationSync,
    Geocode,
    LedgerRetry,
    QueueReaper
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        Self::UpdateCycle,
        Self::ViewRefresh,
        Self::PopulationSync,
        Self::Geocode,
        Self::LedgerRetry,
        Self::QueueReaper
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateCycle => "update_cycle",
            Self::ViewRefresh => "view_refresh",
            Self::PopulationSync => "population_sync",
            Self::Geocode => "geocode",
            Self::LedgerRetry => "ledger_retry",
            Self::QueueReaper => "queue_reaper"
        }
    }

    fn interval(&self, config: &RegistrySyncConfig) -> Duration {
        let scheduler = &config.scheduler;
        match self {
            Self::UpdateCycle => scheduler.update_interval(),
            Self::ViewRefresh => scheduler.view_refresh_interval(),
            Self::PopulationSync => scheduler.population_sync_interval(),
            Self::Geocode => scheduler.geocode_interval(),
            Self::LedgerRetry => scheduler.ledger_retry_interval(),
            Self::QueueReaper => scheduler.queue_reaper_interval()
        }
    }
}

impl FromStr for JobKind {
    type Err = RegistrySyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| RegistrySyncError::ValidationError(format!("unknown job: {s}")))
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub summary: Value,
    pub error: Option<String>
}

/// Owns the services the periodic jobs drive. Every job catches its own
/// errors and turns them into a failed [`JobReport`].
pub struct JobRunner {
    store: Arc<dyn Store>,
    update: UpdateService,
    repair: RepairService,
    bulk_import: BulkImportService,
    analytics: AnalyticsService,
    geocoder: Arc<dyn Geocoder>,
    population: Arc<dyn PopulationSource>,
    config: RegistrySyncConfig
}

impl JobRunner {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        store: Arc<dyn Store>,
        geocoder: Arc<dyn Geocoder>,
        population: Arc<dyn PopulationSource>,
        config: RegistrySyncConfig
    ) -> Self {
        Self {
            update: UpdateService::new(
                client.clone(),
                store.clone(),
                config.registry.update_concurrency
            ),
            repair: RepairService::new(client.clone(), store.clone(), config.repair.clone()),
            bulk_import: BulkImportService::new(client, store.clone(), config.bulk_import.clone()),
            analytics: AnalyticsService::new(store.clone(), &config.cache),
            store,
            geocoder,
            population,
            config
        }
    }

    /// Production wiring: one shared rate limiter in front of the registry
    /// client, plus the Kartverket and SSB collaborators.
    pub fn from_config(config: RegistrySyncConfig, store: Arc<dyn Store>) -> RegistrySyncResult<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let client = create_brreg_client(&config, limiter)?;
        let geocoder = Arc::new(KartverketGeocoder::new(&config)?);
        let population = Arc::new(SsbPopulationClient::new(&config)?);
        Ok(Self::new(client, store, geocoder, population, config))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn update(&self) -> &UpdateService {
        &self.update
    }

    pub fn repair(&self) -> &RepairService {
        &self.repair
    }

    pub fn bulk_import(&self) -> &BulkImportService {
        &self.bulk_import
    }

    pub fn analytics(&self) -> &AnalyticsService {
        &self.analytics
    }

    pub async fn run(&self, job: JobKind) -> JobReport {
        let started_at = Utc::now();
        info!(job = job.as_str(), "Job started");

        let (success, summary, error) = match self.execute(job).await {
            Ok((success, summary)) => (success, summary, None),
            Err(e) => {
                error!(job = job.as_str(), error = %e, "Job failed");
                (false, Value::Null, Some(e.to_string()))
            }
        };
        Telemetry::record_job(job.as_str(), success);

        JobReport {
            job,
            started_at,
            finished_at: Utc::now(),
            success,
            summary,
            error
        }
    }

    async fn execute(&self, job: JobKind) -> RegistrySyncResult<(bool, Value)> {
        match job {
            JobKind::UpdateCycle => {
                let cycle = self.update.run_cycle().await;
                Ok((!cycle.has_failures(), serde_json::to_value(&cycle)?))
            }
            JobKind::ViewRefresh => {
                let views = &self.config.scheduler.materialized_views;
                self.store.refresh_materialized_views(views).await?;
                self.analytics.invalidate().await;
                Ok((true, serde_json::json!({ "refreshed": views })))
            }
            JobKind::PopulationSync => {
                let stored = sync_population(&self.store, self.population.as_ref()).await?;
                Ok((true, serde_json::json!({ "stored": stored })))
            }
            JobKind::Geocode => {
                let report = geocode_pending(
                    &self.store,
                    self.geocoder.as_ref(),
                    self.config.scheduler.geocode_batch_size,
                    &self.config.geocoding
                )
                .await?;
                Ok((true, serde_json::to_value(&report)?))
            }
            JobKind::LedgerRetry => {
                let report = self
                    .repair
                    .retry_sync_errors(self.config.repair.ledger_retry_batch, true)
                    .await?;
                Ok((true, serde_json::to_value(&report)?))
            }
            JobKind::QueueReaper => {
                let requeued = self.bulk_import.reap_stale(None).await?;
                Ok((true, serde_json::json!({ "requeued": requeued })))
            }
        }
    }
}

type ReportMap = Arc<RwLock<HashMap<JobKind, JobReport>>>;

/// Fixed-interval driver for the background jobs.
pub struct SyncScheduler {
    scheduler: JobScheduler,
    runner: Arc<JobRunner>,
    last_reports: ReportMap,
    running: Arc<HashMap<JobKind, Arc<Mutex<()>>>>
}

impl SyncScheduler {
    pub async fn new(runner: JobRunner) -> RegistrySyncResult<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| RegistrySyncError::SchedulerError(e.to_string()))?;

        Ok(Self {
            scheduler,
            runner: Arc::new(runner),
            last_reports: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(
                JobKind::ALL
                    .into_iter()
                    .map(|job| (job, Arc::new(Mutex::new(()))))
                    .collect()
            )
        })
    }

    /// Registers every job at its configured interval and starts ticking.
    pub async fn start(&self) -> RegistrySyncResult<()> {
        for job in JobKind::ALL {
            let interval = job.interval(&self.runner.config);
            let runner = self.runner.clone();
            let reports = self.last_reports.clone();
            let running = self.running.clone();

            let scheduled = Job::new_repeated_async(interval, move |_uuid, _lock| {
                let runner = runner.clone();
                let reports = reports.clone();
                let running = running.clone();
                Box::pin(async move {
                    let Some(guard) = running.get(&job).and_then(|m| m.clone().try_lock_owned().ok())
                    else {
                        warn!(job = job.as_str(), "Previous run still active, skipping tick");
                        return;
                    };
                    let report = runner.run(job).await;
                    reports.write().await.insert(job, report);
                    drop(guard);
                })
            })
            .map_err(|e| RegistrySyncError::SchedulerError(e.to_string()))?;

            self.scheduler
                .add(scheduled)
                .await
                .map_err(|e| RegistrySyncError::SchedulerError(e.to_string()))?;
            info!(job = job.as_str(), interval_seconds = interval.as_secs(), "Job scheduled");
        }

        self.scheduler
            .start()
            .await
            .map_err(|e| RegistrySyncError::SchedulerError(e.to_string()))?;
        info!("Registry sync scheduler started");
        Ok(())
    }

    pub async fn stop(&mut self) -> RegistrySyncResult<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| RegistrySyncError::SchedulerError(e.to_string()))?;
        info!("Registry sync scheduler stopped");
        Ok(())
    }

    /// Runs one job immediately, waiting for a scheduled run of the same
    /// job to finish first.
    pub async fn run_now(&self, job: JobKind) -> JobReport {
        let lock = self.running.get(&job).cloned();
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None
        };
        let report = self.runner.run(job).await;
        self.last_reports.write().await.insert(job, report.clone());
        report
    }

    pub async fn last_report(&self, job: JobKind) -> Option<JobReport> {
        self.last_reports.read().await.get(&job).cloned()
    }

    pub async fn last_reports(&self) -> Vec<JobReport> {
        let reports = self.last_reports.read().await;
        JobKind::ALL
            .iter()
            .filter_map(|job| reports.get(job).cloned())
            .collect()
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_names_round_trip() {
        for job in JobKind::ALL {
            assert_eq!(job.as_str().parse::<JobKind>().unwrap(), job);
        }
        assert!("nightly".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_intervals_follow_config() {
        let mut config = RegistrySyncConfig::default();
        config.scheduler.view_refresh_interval_seconds = 120;
        assert_eq!(JobKind::ViewRefresh.interval(&config), Duration::from_secs(120));
        assert_eq!(
            JobKind::PopulationSync.interval(&config),
            Duration::from_secs(86400)
        );
    }
}
