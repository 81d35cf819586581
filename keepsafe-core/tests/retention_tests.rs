/*!
Integration tests for tiered retention against real destination copies.
*/

use chrono::{DateTime, Duration, TimeZone, Utc};
use keepsafe_core::manifest::MANIFEST_FORMAT_VERSION;
use keepsafe_core::{
    Destination, DestinationSet, DomainEntry, Manifest, MemoryDestination, RetentionConfig,
    RetentionManager, StateStore, Tier,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    store: Arc<StateStore>,
    primary: Arc<MemoryDestination>,
    offsite: Arc<MemoryDestination>,
    destinations: Arc<DestinationSet>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state")).unwrap());
    let primary = Arc::new(MemoryDestination::new("primary"));
    let offsite = Arc::new(MemoryDestination::new("offsite"));
    let destinations = Arc::new(
        DestinationSet::new(vec![
            primary.clone() as Arc<dyn Destination>,
            offsite.clone() as Arc<dyn Destination>,
        ])
        .with_retry_policy(keepsafe_retry::RetryPolicy::immediate(2)),
    );
    Fixture {
        dir,
        store,
        primary,
        offsite,
        destinations,
    }
}

/// Store a real archive on both destinations and record its manifest
async fn backup(f: &Fixture, id: &str, tier: Tier, created_at: DateTime<Utc>) -> Manifest {
    let archive = f.dir.path().join(format!("{id}.tar"));
    std::fs::write(&archive, id.as_bytes()).unwrap();
    let checksum = keepsafe_core::integrity::hash_file(&archive).unwrap();

    let replication = f.destinations.replicate(id, &archive, &checksum).await;
    assert_eq!(replication.refs.len(), 2, "{:?}", replication.failures);

    let manifest = Manifest {
        format_version: MANIFEST_FORMAT_VERSION,
        backup_id: id.to_string(),
        job_id: format!("job-{id}"),
        tier,
        name: None,
        created_at,
        domains: vec![DomainEntry {
            domain: "database".into(),
            artifact_path: "domains/database/data".into(),
            size_bytes: id.len() as u64,
            checksum: checksum.clone(),
        }],
        total_size_bytes: id.len() as u64,
        checksum: checksum.clone(),
        stored_checksum: checksum,
        stored_size_bytes: id.len() as u64,
        compressed: false,
        encrypted: false,
        encryption: None,
        destinations: replication.refs,
        signature: None,
    };
    f.store.put_manifest(&manifest).unwrap();
    manifest
}

fn ids(manifests: &[Manifest]) -> Vec<&str> {
    let mut ids: Vec<_> = manifests.iter().map(|m| m.backup_id.as_str()).collect();
    ids.sort();
    ids
}

fn policy(daily: usize) -> RetentionConfig {
    RetentionConfig {
        daily: Some(daily),
        ..RetentionConfig::default()
    }
}

#[tokio::test]
async fn test_sweep_keeps_two_newest_daily_backups() {
    let f = fixture();
    let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    let oldest = backup(&f, "t1", Tier::Daily, t1).await;
    backup(&f, "t2", Tier::Daily, t1 + Duration::days(1)).await;
    backup(&f, "t3", Tier::Daily, t1 + Duration::days(2)).await;
    assert_eq!(f.primary.object_count(), 3);

    let retention = RetentionManager::new(f.store.clone(), f.destinations.clone(), policy(2));
    let report = retention.sweep().await.unwrap();

    assert_eq!(report.considered, 3);
    assert_eq!(report.evicted, vec!["t1"]);
    assert_eq!(ids(&f.store.list_manifests().unwrap()), vec!["t2", "t3"]);
    for reference in &oldest.destinations {
        let memory = if reference.destination_name == "primary" {
            &f.primary
        } else {
            &f.offsite
        };
        assert!(!memory.contains(&reference.remote_path));
    }
    assert_eq!(f.primary.object_count(), 2);
    assert_eq!(f.offsite.object_count(), 2);
}

#[tokio::test]
async fn test_failed_delete_keeps_manifest_until_next_sweep() {
    let f = fixture();
    let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    backup(&f, "t1", Tier::Daily, t1).await;
    backup(&f, "t2", Tier::Daily, t1 + Duration::days(1)).await;
    let retention = RetentionManager::new(f.store.clone(), f.destinations.clone(), policy(1));

    f.offsite.fail_deletes(true);
    let report = retention.sweep().await.unwrap();
    assert!(report.evicted.is_empty());
    assert_eq!(report.partially_evicted, vec!["t1"]);
    // The copy on offsite still exists, so the record must too
    assert_eq!(ids(&f.store.list_manifests().unwrap()), vec!["t1", "t2"]);

    f.offsite.fail_deletes(false);
    let report = retention.sweep().await.unwrap();
    assert_eq!(report.evicted, vec!["t1"]);
    assert_eq!(ids(&f.store.list_manifests().unwrap()), vec!["t2"]);
    assert_eq!(f.offsite.object_count(), 1);
}

#[tokio::test]
async fn test_backup_under_restore_is_not_evicted() {
    let f = fixture();
    let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    backup(&f, "t1", Tier::Daily, t1).await;
    backup(&f, "t2", Tier::Daily, t1 + Duration::days(1)).await;
    let retention = RetentionManager::new(f.store.clone(), f.destinations.clone(), policy(1));

    let lease = f.store.acquire_restore_lease("t1").unwrap();
    let report = retention.sweep().await.unwrap();
    assert_eq!(report.skipped_for_restore, vec!["t1"]);
    assert_eq!(f.store.list_manifests().unwrap().len(), 2);

    drop(lease);
    let report = retention.sweep().await.unwrap();
    assert_eq!(report.evicted, vec!["t1"]);
}

#[tokio::test]
async fn test_tiers_are_counted_separately() {
    let f = fixture();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    backup(&f, "d1", Tier::Daily, t0).await;
    backup(&f, "w1", Tier::Weekly, t0 - Duration::days(30)).await;
    backup(&f, "m1", Tier::Manual, t0 - Duration::days(365)).await;

    let retention = RetentionManager::new(f.store.clone(), f.destinations.clone(), policy(1));
    let report = retention.sweep().await.unwrap();
    assert!(report.evicted.is_empty());
    assert_eq!(f.store.list_manifests().unwrap().len(), 3);
}
