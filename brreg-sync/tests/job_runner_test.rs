mod common;

use async_trait::async_trait;
use brreg_sync::error::{RegistrySyncError, RegistrySyncResult};
use brreg_sync::geocode::Geocoder;
use brreg_sync::models::{Address, Coordinates, PopulationRecord};
use brreg_sync::population::PopulationSource;
use brreg_sync::store::EntityStore;
use brreg_sync::{JobKind, JobRunner, MemoryStore, RegistrySyncConfig, SyncScheduler};
use common::{Reply, ScriptedRegistry, company, event, org};
use std::sync::Arc;

struct FixedGeocoder;

#[async_trait]
impl Geocoder for FixedGeocoder {
    async fn geocode(&self, address: &Address) -> RegistrySyncResult<Option<Coordinates>> {
        Ok(address
            .street
            .as_ref()
            .map(|_| Coordinates { lat: 65.47, lon: 12.21 }))
    }
}

struct FixedPopulation(Option<Vec<PopulationRecord>>);

#[async_trait]
impl PopulationSource for FixedPopulation {
    async fn fetch_population(&self) -> RegistrySyncResult<Vec<PopulationRecord>> {
        self.0
            .clone()
            .ok_or_else(|| RegistrySyncError::external("population", "07459", Some(503), "down"))
    }
}

fn runner(
    registry: &Arc<ScriptedRegistry>,
    store: &Arc<MemoryStore>,
    population: Option<Vec<PopulationRecord>>
) -> JobRunner {
    JobRunner::new(
        registry.clone(),
        store.clone(),
        Arc::new(FixedGeocoder),
        Arc::new(FixedPopulation(population)),
        RegistrySyncConfig::default()
    )
}

#[tokio::test]
async fn test_update_cycle_job_applies_changes() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    registry.company("923609016", Reply::Found(company("923609016", "Havnegata AS")));
    registry.pages(brreg_sync::UpdateStream::Companies, vec![vec![event(5, "923609016")]]);

    let report = runner(&registry, &store, Some(Vec::new()))
        .run(JobKind::UpdateCycle)
        .await;

    assert!(report.success);
    assert!(report.error.is_none());
    assert!(store.get_company(&org("923609016")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_view_refresh_job_refreshes_configured_views() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());

    let report = runner(&registry, &store, Some(Vec::new()))
        .run(JobKind::ViewRefresh)
        .await;

    assert!(report.success);
    assert_eq!(
        store.refreshed_views().await,
        vec!["mv_industry_stats".to_string(), "mv_county_stats".to_string()]
    );
}

#[tokio::test]
async fn test_geocode_job_stores_coordinates() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_companies(&[company("923609016", "Havnegata AS")])
        .await
        .unwrap();

    let report = runner(&registry, &store, Some(Vec::new()))
        .run(JobKind::Geocode)
        .await;

    assert!(report.success);
    assert_eq!(report.summary["located"], 1);
    assert_eq!(
        store.coordinates(&org("923609016")).await,
        Some(Coordinates { lat: 65.47, lon: 12.21 })
    );
}

#[tokio::test]
async fn test_failing_job_is_reported_not_propagated() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());

    let report = runner(&registry, &store, None)
        .run(JobKind::PopulationSync)
        .await;

    assert!(!report.success);
    assert!(report.error.unwrap().contains("population"));
    assert!(store.population().await.is_empty());
}

#[tokio::test]
async fn test_population_job_stores_records() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    let records = vec![PopulationRecord {
        municipality_number: "1813".to_string(),
        year: 2024,
        population: 7800
    }];

    let report = runner(&registry, &store, Some(records.clone()))
        .run(JobKind::PopulationSync)
        .await;

    assert!(report.success);
    assert_eq!(store.population().await, records);
}

#[tokio::test]
async fn test_scheduler_run_now_keeps_last_report() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    let scheduler = SyncScheduler::new(runner(&registry, &store, Some(Vec::new())))
        .await
        .unwrap();

    assert!(scheduler.last_report(JobKind::QueueReaper).await.is_none());
    let report = scheduler.run_now(JobKind::QueueReaper).await;
    assert!(report.success);
    assert_eq!(report.summary["requeued"], 0);

    let kept = scheduler.last_report(JobKind::QueueReaper).await.unwrap();
    assert_eq!(kept.finished_at, report.finished_at);
    assert_eq!(scheduler.last_reports().await.len(), 1);
}
