mod common;

use brreg_sync::models::{EntityType, PageCursor, SyncErrorStatus};
use brreg_sync::store::{EntityStore, RoleStore, SystemStateStore};
use brreg_sync::{MemoryStore, SyncErrorLedger, UpdateService, UpdateSince, UpdateStream};
use chrono::NaiveDate;
use common::{Reply, ScriptedRegistry, company, event, org, role, subunit};
use std::sync::Arc;

fn service(registry: &Arc<ScriptedRegistry>, store: &Arc<MemoryStore>) -> UpdateService {
    UpdateService::new(registry.clone(), store.clone(), 4)
}

#[tokio::test]
async fn test_cursor_advances_to_highest_id_and_rerun_applies_nothing() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    registry.company("923609016", Reply::Found(company("923609016", "Havnegata AS")));
    registry.company("987654321", Reply::Found(company("987654321", "Fjord AS")));
    registry.pages(
        UpdateStream::Companies,
        vec![
            vec![event(101, "923609016"), event(105, "987654321")],
            vec![event(103, "923609016"), event(110, "923609016")]
        ]
    );
    let updates = service(&registry, &store);

    let first = updates.fetch_company_updates(None).await.unwrap();
    assert_eq!(first.pages, 2);
    assert_eq!(first.entities_updated, 3);
    assert_eq!(first.latest_oppdateringsid, Some(110));
    assert_eq!(updates.cursor(UpdateStream::Companies).await.unwrap(), Some(110));
    assert!(store.get_company(&org("987654321")).await.unwrap().is_some());

    let calls = registry.entity_calls();
    let second = updates.fetch_company_updates(None).await.unwrap();
    assert_eq!(second.entities_updated, 0);
    assert_eq!(second.latest_oppdateringsid, Some(110));
    assert_eq!(registry.entity_calls(), calls);
    assert!(matches!(
        registry.page_requests().last(),
        Some(PageCursor::Next(_))
    ));
    assert!(registry
        .page_requests()
        .contains(&PageCursor::Start(UpdateSince::After(110))));
}

#[tokio::test]
async fn test_repeated_orgnr_on_one_page_is_fetched_once() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    registry.company("923609016", Reply::Found(company("923609016", "Havnegata AS")));
    registry.pages(
        UpdateStream::Companies,
        vec![vec![event(1, "923609016"), event(2, "923609016"), event(3, "923609016")]]
    );

    let report = service(&registry, &store)
        .fetch_company_updates(Some(UpdateSince::After(0)))
        .await
        .unwrap();

    assert_eq!(report.entities_updated, 1);
    assert_eq!(registry.entity_calls(), 1);
    assert_eq!(report.latest_oppdateringsid, Some(3));
}

#[tokio::test]
async fn test_gone_entity_is_skipped_without_ledger_or_entity_writes() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    registry.company("923609016", Reply::Gone);
    registry.pages(UpdateStream::Companies, vec![vec![event(7, "923609016")]]);

    let report = service(&registry, &store)
        .fetch_company_updates(None)
        .await
        .unwrap();

    assert_eq!(report.gone_skipped, 1);
    assert_eq!(report.entities_updated, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(store.entity_write_count(), 0);
    assert!(store.sync_errors().await.is_empty());
    // The cursor still moves past the event.
    assert_eq!(report.latest_oppdateringsid, Some(7));
}

#[tokio::test]
async fn test_failure_goes_to_ledger_and_later_success_resolves_it() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    registry.subunit("974760673", Reply::Fail(503));
    registry.subunit("912345678", Reply::Found(subunit("912345678", "923609016")));
    registry.pages(
        UpdateStream::Subunits,
        vec![vec![event(20, "974760673"), event(21, "912345678")]]
    );
    let updates = service(&registry, &store);

    let report = updates.fetch_subunit_updates(None).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.entities_updated, 1);

    let ledger = SyncErrorLedger::new(store.clone());
    let open = ledger
        .open(&org("974760673"), EntityType::Subunit)
        .await
        .unwrap()
        .expect("failure recorded");
    assert_eq!(open.status, SyncErrorStatus::Pending);
    assert_eq!(open.attempt_count, 1);

    registry.subunit("974760673", Reply::Found(subunit("974760673", "923609016")));
    registry.pages(UpdateStream::Subunits, vec![vec![event(30, "974760673")]]);
    let retried = updates.fetch_subunit_updates(None).await.unwrap();
    assert_eq!(retried.entities_updated, 1);
    assert!(ledger
        .open(&org("974760673"), EntityType::Subunit)
        .await
        .unwrap()
        .is_none());
    assert_eq!(retried.latest_oppdateringsid, Some(30));
}

#[tokio::test]
async fn test_explicit_date_replays_without_moving_cursor_back() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    store
        .set_state(&UpdateStream::Companies.cursor_key(), "500")
        .await
        .unwrap();
    registry.company("923609016", Reply::Found(company("923609016", "Havnegata AS")));
    registry.pages(UpdateStream::Companies, vec![vec![event(40, "923609016")]]);

    let since = UpdateSince::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    let report = service(&registry, &store)
        .fetch_company_updates(Some(since))
        .await
        .unwrap();

    assert_eq!(report.entities_updated, 1);
    assert_eq!(report.latest_oppdateringsid, Some(500));
    assert_eq!(
        store
            .get_state(&UpdateStream::Companies.cursor_key())
            .await
            .unwrap()
            .as_deref(),
        Some("500")
    );
}

#[tokio::test]
async fn test_run_cycle_records_sync_date_per_stream() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());

    let cycle = service(&registry, &store).run_cycle().await;

    assert!(!cycle.has_failures());
    assert_eq!(cycle.reports.len(), 3);
    for stream in [UpdateStream::Companies, UpdateStream::Subunits, UpdateStream::Roles] {
        assert!(store.get_state(&stream.sync_date_key()).await.unwrap().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_role_replace_is_never_observed_half_applied() {
    let registry = Arc::new(ScriptedRegistry::new());
    let store = Arc::new(MemoryStore::new());
    let orgnr = org("923609016");

    let old = vec![
        role("923609016", "DAGL", "Kari Nordmann", 0),
        role("923609016", "LEDE", "Ola Nordmann", 1)
    ];
    let new = vec![
        role("923609016", "DAGL", "Per Hansen", 0),
        role("923609016", "LEDE", "Ola Nordmann", 1),
        role("923609016", "MEDL", "Anne Olsen", 2)
    ];
    store
        .replace_roles(&[(orgnr.clone(), old.clone())], chrono::Utc::now())
        .await
        .unwrap();
    registry.roles("923609016", Reply::Found(new.clone()));
    registry.pages(UpdateStream::Roles, vec![vec![event(9, "923609016")]]);

    let reader = {
        let store = store.clone();
        let orgnr = orgnr.clone();
        tokio::spawn(async move {
            let mut snapshots = Vec::new();
            for _ in 0..200 {
                snapshots.push(store.get_roles(&orgnr).await.unwrap());
                tokio::task::yield_now().await;
            }
            snapshots
        })
    };

    let report = service(&registry, &store)
        .fetch_role_updates(None)
        .await
        .unwrap();
    assert_eq!(report.entities_updated, 1);

    for snapshot in reader.await.unwrap() {
        assert!(snapshot == old || snapshot == new, "partial role set: {snapshot:?}");
    }
    assert_eq!(store.get_roles(&orgnr).await.unwrap(), new);
}
