/*!
The backup engine: one handle over the whole pipeline.

[`BackupEngine`] owns the state store, the destination set and the domain
registry, and runs submitted jobs on a small worker pool. Jobs for
overlapping domain sets are rejected at submission, including jobs held by
another process on the same state dir, so disjoint jobs run in parallel.
Retention runs after every successful job and, in daemon mode, on a fixed
interval next to the scheduler tick.
*/

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keepsafe_retry::RetryPolicy;

use crate::config::EngineConfig;
use crate::coordinator::SnapshotCoordinator;
use crate::destination::{build_destination, Destination, DestinationSet, DestinationStatus};
use crate::domain::DomainRegistry;
use crate::job::{BackupJob, Tier};
use crate::manifest::Manifest;
use crate::observability::record_job;
use crate::queue::{InFlightJobs, JobQueue, QueuedJob};
use crate::restore::{RestoreEngine, RestoreReport, RestoreRequest};
use crate::retention::{RetentionManager, SweepReport};
use crate::schedule::ScheduleTable;
use crate::store::{RestoreRecord, StateStore};
use crate::{BackupError, Result};

/// A submitted job; await [`JobHandle::wait`] for its outcome
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    reply: oneshot::Receiver<Result<Manifest>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The manifest of the succeeded job, or the reason it failed
    pub async fn wait(self) -> Result<Manifest> {
        self.reply.await.unwrap_or_else(|_| {
            Err(BackupError::validation(format!(
                "job {} was dropped before it finished",
                self.job_id
            )))
        })
    }
}

/// Result of re-verifying one stored copy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CopyVerification {
    pub destination: String,
    pub remote_path: String,
    pub verified: bool,
    pub error: Option<String>,
}

/// What the workers need, shared between them
struct Pipeline {
    coordinator: SnapshotCoordinator,
    retention: Arc<RetentionManager>,
    cancels: DashMap<String, CancellationToken>,
}

impl Pipeline {
    async fn execute(&self, queued: QueuedJob) {
        let QueuedJob {
            mut job,
            claim,
            cancel,
            reply,
        } = queued;

        let outcome = self.coordinator.run(&mut job, &cancel).await;
        self.cancels.remove(&job.id);
        // Terminal now; the domain set is free for the next job
        drop(claim);

        if outcome.is_ok() {
            match self.retention.sweep().await {
                Ok(report) if !report.evicted.is_empty() => {
                    info!(evicted = report.evicted.len(), "Retention pass after job")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Retention pass after job failed"),
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }
}

pub struct BackupEngine {
    config: EngineConfig,
    store: Arc<StateStore>,
    domains: Arc<DomainRegistry>,
    destinations: Arc<DestinationSet>,
    pipeline: Arc<Pipeline>,
    restores: RestoreEngine,
    in_flight: InFlightJobs,
    queue: JobQueue,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackupEngine {
    /// Build an engine with the destinations and domains named in `config`
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut destinations = Vec::with_capacity(config.destinations.len());
        for destination in &config.destinations {
            destinations.push(build_destination(destination).await?);
        }
        let domains = DomainRegistry::from_config(&config.domains, &config.exclude)?;
        Self::with_parts(config, destinations, domains)
    }

    /// Build an engine around already constructed destinations and domain hooks
    pub fn with_parts(
        config: EngineConfig,
        destinations: Vec<Arc<dyn Destination>>,
        domains: DomainRegistry,
    ) -> Result<Self> {
        let store = Arc::new(StateStore::open(&config.state_dir)?);
        let destinations = Arc::new(
            DestinationSet::new(destinations)
                .with_store(store.clone())?
                .with_retry_policy(RetryPolicy::remote().with_max_attempts(config.max_transfer_attempts))
                .with_transfer_timeout(config.transfer_timeout()),
        );
        let domains = Arc::new(domains);
        let keys = config.encryption.key_source()?;

        let coordinator = SnapshotCoordinator::new(
            domains.clone(),
            destinations.clone(),
            store.clone(),
            config.staging_dir(),
        )
        .with_compression(config.compression)
        .with_encryption(if config.encryption.enabled { keys.clone() } else { None })
        .with_export_timeout(config.export_timeout());

        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            destinations.clone(),
            config.retention.clone(),
        ));
        let restores = RestoreEngine::new(
            store.clone(),
            destinations.clone(),
            domains.clone(),
            config.staging_dir(),
        )
        .with_keys(keys);

        info!(
            destinations = destinations.statuses().len(),
            domains = domains.names().len(),
            workers = config.workers,
            "Backup engine ready"
        );

        let in_flight = InFlightJobs::with_store(store.clone());
        Ok(Self {
            store,
            domains,
            destinations,
            pipeline: Arc::new(Pipeline {
                coordinator,
                retention,
                cancels: DashMap::new(),
            }),
            restores,
            in_flight,
            queue: JobQueue::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn destinations(&self) -> &Arc<DestinationSet> {
        &self.destinations
    }

    /// Spawn the worker pool on the current runtime if it is not running yet
    fn ensure_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BackupError::validation(format!("no async runtime for workers: {e}")))?;

        for index in 0..self.config.workers.max(1) {
            let pipeline = self.pipeline.clone();
            let queue = self.queue.clone();
            let shutdown = self.shutdown.clone();
            workers.push(runtime.spawn(async move {
                debug!(worker = index, "Worker started");
                loop {
                    let queued = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = queue.next() => match next {
                            Some(queued) => queued,
                            None => break,
                        },
                    };
                    pipeline.execute(queued).await;
                }
                debug!(worker = index, "Worker stopped");
            }));
        }
        Ok(())
    }

    /// Queue a backup of `domains`, or of every configured domain when empty
    ///
    /// Fails with [`BackupError::JobConflict`] when a pending or running job
    /// already covers any of the same domains. The rejected job is still
    /// recorded in the job history as failed.
    pub fn submit(&self, tier: Tier, domains: &[String], name: Option<&str>) -> Result<JobHandle> {
        let domains = if domains.is_empty() {
            self.domains.names().to_vec()
        } else {
            self.domains.ordered(domains)?
        };
        if domains.is_empty() {
            return Err(BackupError::validation("no domains are configured"));
        }

        let mut job = BackupJob::new(tier, domains);
        if let Some(name) = name {
            job = job.with_name(name);
        }

        let claim = match self.in_flight.claim(&job) {
            Ok(claim) => claim,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job rejected");
                job.fail(e.to_string())?;
                record_job(job.tier.as_str(), "failed", Duration::ZERO, None);
                if let Err(audit) = self.store.append_job(&job) {
                    error!(job_id = %job.id, error = %audit, "Failed to append job history");
                }
                return Err(e);
            }
        };
        self.ensure_workers()?;

        self.store.append_job(&job)?;
        let cancel = CancellationToken::new();
        self.pipeline.cancels.insert(job.id.clone(), cancel.clone());
        let (reply, receiver) = oneshot::channel();
        let job_id = job.id.clone();
        info!(job_id = %job_id, tier = %tier, domains = %job.domain_list(), "Job queued");

        self.queue.push(QueuedJob {
            job,
            claim,
            cancel,
            reply: Some(reply),
        })?;
        Ok(JobHandle {
            job_id,
            reply: receiver,
        })
    }

    /// Submit a job and wait for it to finish
    pub async fn backup_now(&self, tier: Tier, domains: &[String], name: Option<&str>) -> Result<Manifest> {
        self.submit(tier, domains, name)?.wait().await
    }

    /// Ask a queued or running job to stop before its next domain export
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.pipeline.cancels.get(job_id) {
            Some(token) => {
                info!(job_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of jobs currently pending or running
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.job_ids()
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.pipeline.retention.sweep().await
    }

    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        self.restores.restore(request).await
    }

    /// Re-read and re-hash every stored copy of a backup
    ///
    /// A copy that fails the hash check marks its destination unhealthy.
    pub async fn verify_backup(&self, backup_id: &str) -> Result<Vec<CopyVerification>> {
        let manifest = self.store.get_manifest(backup_id)?;
        let mut results = Vec::with_capacity(manifest.destinations.len());

        for reference in &manifest.destinations {
            let mut result = CopyVerification {
                destination: reference.destination_name.clone(),
                remote_path: reference.remote_path.clone(),
                verified: false,
                error: None,
            };
            match self.destinations.get(&reference.destination_name) {
                None => result.error = Some("destination is not configured".to_string()),
                Some(destination) => match self
                    .destinations
                    .verify(destination.as_ref(), reference, &manifest.stored_checksum)
                    .await
                {
                    Ok(true) => result.verified = true,
                    Ok(false) => {
                        self.destinations.mark_unhealthy(
                            &reference.destination_name,
                            &format!("copy of {backup_id} failed verification"),
                        );
                        result.error = Some("stored object does not match the manifest checksum".to_string());
                    }
                    Err(e) => result.error = Some(e.to_string()),
                },
            }
            info!(
                backup_id,
                destination = %result.destination,
                verified = result.verified,
                "Copy checked"
            );
            results.push(result);
        }
        Ok(results)
    }

    pub fn list_backups(&self) -> Result<Vec<Manifest>> {
        self.store.list_manifests()
    }

    pub fn show_backup(&self, backup_id: &str) -> Result<Manifest> {
        self.store.get_manifest(backup_id)
    }

    pub fn job_history(&self) -> Result<Vec<BackupJob>> {
        self.store.job_history()
    }

    pub fn restore_history(&self) -> Result<Vec<RestoreRecord>> {
        self.store.restore_history()
    }

    pub fn destination_statuses(&self) -> Vec<DestinationStatus> {
        self.destinations.statuses()
    }

    pub fn clear_destination(&self, name: &str) -> Result<()> {
        self.destinations.clear(name)
    }

    /// Submit a job for every tier due at `now`; returns the queued job ids
    ///
    /// A due tier whose job conflicts with one already in flight is skipped;
    /// its fire is consumed rather than retried.
    pub fn fire_due(&self, table: &mut ScheduleTable, now: DateTime<Utc>) -> Result<Vec<String>> {
        let due = table.tick(now);
        if due.is_empty() {
            return Ok(Vec::new());
        }
        self.store.save_schedule(&table.last_fires())?;

        let mut queued = Vec::new();
        for tier in due {
            match self.submit(tier, &[], None) {
                Ok(handle) => {
                    info!(tier = %tier, job_id = handle.job_id(), "Scheduled job fired");
                    queued.push(handle.job_id().to_string());
                }
                Err(BackupError::JobConflict { running_job, .. }) => {
                    warn!(tier = %tier, running_job = %running_job, "Scheduled job skipped, previous run still in flight");
                }
                Err(e) => error!(tier = %tier, error = %e, "Failed to queue scheduled job"),
            }
        }
        Ok(queued)
    }

    /// Run the scheduler and periodic retention until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.ensure_workers()?;
        let mut table = ScheduleTable::new(
            self.config.schedule.cadences()?,
            &self.store.load_schedule()?,
            Utc::now(),
        );
        for (tier, next) in table.next_fires() {
            info!(tier = %tier, next_fire = ?next, "Schedule loaded");
        }

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.fire_due(&mut table, Utc::now()) {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Periodic retention sweep failed");
                    }
                }
            }
        }

        info!("Shutting down");
        self.shutdown().await;
        Ok(())
    }

    /// Cancel in-flight jobs and wait for the workers to stop
    pub async fn shutdown(&self) {
        for entry in self.pipeline.cancels.iter() {
            entry.value().cancel();
        }
        self.shutdown.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MemoryDestination;
    use crate::domain::{DomainHook, ExportedArtifact};
    use crate::job::JobStatus;
    use chrono::TimeZone;
    use std::path::Path;
    use tempfile::TempDir;

    /// Exports a fixed payload, optionally waiting for a release signal first
    struct StaticHook {
        name: String,
        gate: Option<Arc<std::sync::Barrier>>,
    }

    impl DomainHook for StaticHook {
        fn name(&self) -> &str {
            &self.name
        }

        fn export(&self, scratch_dir: &Path) -> Result<ExportedArtifact> {
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            let path = scratch_dir.join("data");
            std::fs::write(&path, self.name.as_bytes())?;
            Ok(ExportedArtifact {
                path,
                size_bytes: self.name.len() as u64,
            })
        }

        fn import(&self, _artifact: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn engine(dir: &TempDir, hooks: Vec<StaticHook>) -> (BackupEngine, Arc<MemoryDestination>) {
        let mut config = EngineConfig::with_state_dir(dir.path());
        config.workers = 2;
        config.retention.daily = Some(1);
        let memory = Arc::new(MemoryDestination::new("primary"));
        let mut domains = DomainRegistry::new();
        for hook in hooks {
            domains.register(Arc::new(hook)).unwrap();
        }
        let engine = BackupEngine::with_parts(config, vec![memory.clone() as Arc<dyn Destination>], domains).unwrap();
        (engine, memory)
    }

    fn hook(name: &str) -> StaticHook {
        StaticHook {
            name: name.to_string(),
            gate: None,
        }
    }

    #[tokio::test]
    async fn test_backup_now_and_retention_after_job() {
        let dir = TempDir::new().unwrap();
        let (engine, memory) = engine(&dir, vec![hook("database"), hook("config")]);

        let first = engine.backup_now(Tier::Daily, &[], None).await.unwrap();
        let second = engine.backup_now(Tier::Daily, &[], None).await.unwrap();

        // keep 1 daily: the first one was evicted by the pass after the second job
        let remaining: Vec<_> = engine.list_backups().unwrap().into_iter().map(|m| m.backup_id).collect();
        assert_eq!(remaining, vec![second.backup_id.clone()]);
        assert!(!remaining.contains(&first.backup_id));
        assert_eq!(memory.object_count(), 1);

        let history = engine.job_history().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|j| j.status == JobStatus::Succeeded));
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_conflicting_submission_is_rejected_and_audited() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(std::sync::Barrier::new(2));
        let (engine, _) = engine(
            &dir,
            vec![StaticHook {
                name: "database".into(),
                gate: Some(gate.clone()),
            }],
        );

        let running = engine.submit(Tier::Manual, &[], None).unwrap();
        let err = engine.submit(Tier::Manual, &[], None).unwrap_err();
        match err {
            BackupError::JobConflict { running_job, .. } => assert_eq!(running_job, running.job_id()),
            other => panic!("expected JobConflict, got {other:?}"),
        }

        tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();
        running.wait().await.unwrap();

        let history = engine.job_history().unwrap();
        assert_eq!(history.iter().filter(|j| j.status == JobStatus::Failed).count(), 1);
        assert_eq!(history.iter().filter(|j| j.status == JobStatus::Succeeded).count(), 1);
        assert!(engine.in_flight().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_verify_backup_flags_corrupt_copy() {
        let dir = TempDir::new().unwrap();
        let (engine, memory) = engine(&dir, vec![hook("database")]);
        let manifest = engine.backup_now(Tier::Manual, &[], None).await.unwrap();

        let checks = engine.verify_backup(&manifest.backup_id).await.unwrap();
        assert!(checks.iter().all(|c| c.verified));

        memory.corrupt_stored_objects(true);
        let checks = engine.verify_backup(&manifest.backup_id).await.unwrap();
        assert!(!checks[0].verified);
        assert!(!engine.destinations().is_healthy("primary"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_domain_is_rejected_before_queueing() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir, vec![hook("database")]);
        let err = engine
            .submit(Tier::Manual, &["reports".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
        assert!(engine.job_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_fires_each_due_tier_once() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir, vec![hook("database")]);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut table = ScheduleTable::new(
            vec![(Tier::Daily, crate::schedule::Cadence::parse("daily").unwrap())],
            &Default::default(),
            start,
        );

        // Two days pass with the process down
        let later = start + chrono::Duration::days(2);
        let fired = engine.fire_due(&mut table, later).unwrap();
        assert_eq!(fired.len(), 1);
        assert!(engine.fire_due(&mut table, later).unwrap().is_empty());
        assert_eq!(engine.store().load_schedule().unwrap()[&Tier::Daily], later);
        engine.shutdown().await;
    }
}
