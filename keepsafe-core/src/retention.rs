/*!
Tiered retention.

Selection is a pure function over a snapshot of the manifest set: per tier,
newest first by creation time, keep the first `keep_count`, evict the rest.
Eviction deletes every destination copy first and removes the manifest only
when all of them are confirmed gone. A manifest whose copies could not all be
deleted stays in place and is retried on the next sweep.
*/

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::destination::DestinationSet;
use crate::job::Tier;
use crate::manifest::Manifest;
use crate::observability::record_evictions;
use crate::store::StateStore;
use crate::Result;

/// Manifests that fall outside their tier's keep count, oldest last
pub fn select_evictions<'a>(manifests: &'a [Manifest], policy: &RetentionConfig) -> Vec<&'a Manifest> {
    let mut by_tier: BTreeMap<Tier, Vec<&Manifest>> = BTreeMap::new();
    for manifest in manifests {
        by_tier.entry(manifest.tier).or_default().push(manifest);
    }

    let mut evict = Vec::new();
    for (tier, mut group) in by_tier {
        let Some(keep) = policy.keep_count(tier) else {
            continue;
        };
        group.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        evict.extend(group.into_iter().skip(keep));
    }
    evict
}

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    /// Manifests in the snapshot the sweep worked from
    pub considered: usize,
    /// Backups whose copies and manifest are gone
    pub evicted: Vec<String>,
    /// Backups with at least one copy that could not be deleted
    pub partially_evicted: Vec<String>,
    /// Backups spared because a restore is using them
    pub skipped_for_restore: Vec<String>,
}

pub struct RetentionManager {
    store: Arc<StateStore>,
    destinations: Arc<DestinationSet>,
    policy: RetentionConfig,
    sweeping: tokio::sync::Mutex<()>,
}

impl RetentionManager {
    pub fn new(store: Arc<StateStore>, destinations: Arc<DestinationSet>, policy: RetentionConfig) -> Self {
        Self {
            store,
            destinations,
            policy,
            sweeping: tokio::sync::Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RetentionConfig {
        &self.policy
    }

    /// Run one retention pass; concurrent calls queue behind each other
    pub async fn sweep(&self) -> Result<SweepReport> {
        let _sweeping = self.sweeping.lock().await;

        // Backups created after this point are not considered this pass
        let snapshot = self.store.list_manifests()?;
        let candidates = select_evictions(&snapshot, &self.policy);
        let mut report = SweepReport {
            considered: snapshot.len(),
            ..Default::default()
        };

        for manifest in candidates {
            // Re-read right before deleting so a restore that just started is honoured
            if self
                .store
                .active_restore_ids()?
                .contains(&manifest.backup_id)
            {
                info!(backup_id = %manifest.backup_id, "Skipping eviction, restore in progress");
                report.skipped_for_restore.push(manifest.backup_id.clone());
                continue;
            }

            if self.delete_copies(manifest).await {
                self.store.remove_manifest(&manifest.backup_id)?;
                info!(backup_id = %manifest.backup_id, tier = %manifest.tier, "Backup evicted");
                report.evicted.push(manifest.backup_id.clone());
            } else {
                warn!(backup_id = %manifest.backup_id, "Backup partially evicted, will retry next sweep");
                report.partially_evicted.push(manifest.backup_id.clone());
            }
        }

        record_evictions(report.evicted.len());
        debug!(
            considered = report.considered,
            evicted = report.evicted.len(),
            partial = report.partially_evicted.len(),
            "Retention sweep finished"
        );
        Ok(report)
    }

    /// Delete every copy; true only if all are confirmed gone
    async fn delete_copies(&self, manifest: &Manifest) -> bool {
        let mut all_gone = true;
        for reference in &manifest.destinations {
            let Some(destination) = self.destinations.get(&reference.destination_name) else {
                warn!(
                    backup_id = %manifest.backup_id,
                    destination = %reference.destination_name,
                    "Copy is on a destination that is no longer configured"
                );
                all_gone = false;
                continue;
            };
            match self.destinations.delete(destination.as_ref(), reference).await {
                Ok(()) => debug!(
                    backup_id = %manifest.backup_id,
                    destination = %reference.destination_name,
                    "Copy deleted"
                ),
                Err(e) => {
                    warn!(
                        backup_id = %manifest.backup_id,
                        destination = %reference.destination_name,
                        error = %e,
                        "Failed to delete copy"
                    );
                    all_gone = false;
                }
            }
        }
        all_gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DestinationRef, DomainEntry, MANIFEST_FORMAT_VERSION};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn manifest(id: &str, tier: Tier, created_at: DateTime<Utc>) -> Manifest {
        Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            backup_id: id.to_string(),
            job_id: format!("job-{id}"),
            tier,
            name: None,
            created_at,
            domains: vec![DomainEntry {
                domain: "database".into(),
                artifact_path: "domains/database/database.dump".into(),
                size_bytes: 4,
                checksum: "00".into(),
            }],
            total_size_bytes: 4,
            checksum: "00".into(),
            stored_checksum: "00".into(),
            stored_size_bytes: 4,
            compressed: false,
            encrypted: false,
            encryption: None,
            destinations: vec![DestinationRef::new("primary", format!("backups/{id}/archive.tar"))
                .verified(created_at)],
            signature: None,
        }
    }

    #[test]
    fn test_keeps_most_recent_per_tier() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let manifests = vec![
            manifest("d1", Tier::Daily, t0),
            manifest("d3", Tier::Daily, t0 + Duration::days(2)),
            manifest("d2", Tier::Daily, t0 + Duration::days(1)),
            manifest("w1", Tier::Weekly, t0),
        ];
        let policy = RetentionConfig {
            daily: Some(2),
            weekly: Some(4),
            monthly: Some(12),
            manual: None,
        };

        let evicted: Vec<_> = select_evictions(&manifests, &policy)
            .into_iter()
            .map(|m| m.backup_id.as_str())
            .collect();
        assert_eq!(evicted, vec!["d1"]);
    }

    #[test]
    fn test_unlimited_tier_is_never_evicted() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let manifests: Vec<_> = (0..20)
            .map(|i| manifest(&format!("m{i}"), Tier::Manual, t0 + Duration::hours(i)))
            .collect();
        assert!(select_evictions(&manifests, &RetentionConfig::default()).is_empty());
    }

    #[test]
    fn test_keep_zero_evicts_all() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let manifests = vec![manifest("a", Tier::Monthly, t0), manifest("b", Tier::Monthly, t0)];
        let policy = RetentionConfig {
            monthly: Some(0),
            ..RetentionConfig::default()
        };
        assert_eq!(select_evictions(&manifests, &policy).len(), 2);
    }
}
