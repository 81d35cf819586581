/*!
Snapshot coordinator: runs one backup job from export to manifest.

For each requested domain, in registration order, the coordinator checks for
cancellation, quiesces the domain, exports it and streams the artifact into
the staging archive, all on the blocking thread pool and under the export
timeout. The archive is then sealed, optionally encrypted into a new file and
replicated. A manifest is written only once at least one destination holds a
verified copy.

Everything is staged in a per-job temporary directory that is removed on
every exit path, so a failed or cancelled job leaves nothing behind.
*/

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{ArchiveWriter, SealedArchive};
use crate::crypto::{encrypt_file, DerivedKey, EncryptionEnvelope, KeySource};
use crate::destination::DestinationSet;
use crate::domain::DomainRegistry;
use crate::job::{BackupJob, JobStatus};
use crate::manifest::{archive_file_name, new_backup_id, Manifest, MANIFEST_FORMAT_VERSION};
use crate::observability::record_job;
use crate::store::StateStore;
use crate::{BackupError, Result};

/// The file that gets replicated, after optional encryption
struct StoredArchive {
    path: PathBuf,
    checksum: String,
    size_bytes: u64,
    envelope: Option<EncryptionEnvelope>,
    key: Option<DerivedKey>,
}

/// Orchestrates a single backup run across data domains
pub struct SnapshotCoordinator {
    domains: Arc<DomainRegistry>,
    destinations: Arc<DestinationSet>,
    store: Arc<StateStore>,
    staging_root: PathBuf,
    compressed: bool,
    encryption: Option<KeySource>,
    export_timeout: Duration,
}

impl SnapshotCoordinator {
    pub fn new<P: AsRef<Path>>(
        domains: Arc<DomainRegistry>,
        destinations: Arc<DestinationSet>,
        store: Arc<StateStore>,
        staging_root: P,
    ) -> Self {
        Self {
            domains,
            destinations,
            store,
            staging_root: staging_root.as_ref().to_path_buf(),
            compressed: true,
            encryption: None,
            export_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_compression(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Encrypt new archives with keys derived from `source`
    pub fn with_encryption(mut self, source: Option<KeySource>) -> Self {
        self.encryption = source;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    fn audit(&self, job: &BackupJob) {
        if let Err(e) = self.store.append_job(job) {
            error!(job_id = %job.id, error = %e, "Failed to append job history");
        }
    }

    /// Drive `job` from pending to a terminal state
    ///
    /// The job ends `succeeded` with the written manifest, or `failed` with the
    /// error as its failure reason. Both transitions are appended to the job
    /// history.
    #[instrument(skip_all, fields(job_id = %job.id, tier = %job.tier))]
    pub async fn run(&self, job: &mut BackupJob, cancel: &CancellationToken) -> Result<Manifest> {
        job.transition(JobStatus::Running)?;
        self.audit(job);
        info!(domains = %job.domain_list(), "Backup job started");

        let started = Instant::now();
        let outcome = self.execute(job, cancel).await;

        match &outcome {
            Ok(manifest) => {
                job.backup_id = Some(manifest.backup_id.clone());
                job.transition(JobStatus::Succeeded)?;
                info!(
                    backup_id = %manifest.backup_id,
                    bytes = manifest.stored_size_bytes,
                    copies = manifest.destinations.len(),
                    "Backup job succeeded"
                );
            }
            Err(e) => {
                job.fail(e.to_string())?;
                error!(error = %e, "Backup job failed");
            }
        }
        record_job(
            job.tier.as_str(),
            &job.status.to_string(),
            started.elapsed(),
            outcome.as_ref().ok().map(|m| m.stored_size_bytes),
        );
        self.audit(job);
        outcome
    }

    async fn execute(&self, job: &BackupJob, cancel: &CancellationToken) -> Result<Manifest> {
        let order = self.domains.ordered(&job.domains)?;
        if order.is_empty() {
            return Err(BackupError::validation("job names no domains"));
        }

        std::fs::create_dir_all(&self.staging_root)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job.id))
            .tempdir_in(&self.staging_root)?;

        let created_at = Utc::now();
        let backup_id = new_backup_id(job.tier, created_at);
        let sealed = self
            .export_domains(job, &order, staging.path(), cancel)
            .await?;
        debug!(bytes = sealed.size_bytes, checksum = %sealed.checksum, "Archive sealed");

        let stored = self.prepare_upload(&sealed, staging.path()).await?;

        let replication = self
            .destinations
            .replicate(&backup_id, &stored.path, &stored.checksum)
            .await;
        if replication.refs.is_empty() {
            return Err(BackupError::NoDurableCopy {
                job_id: job.id.clone(),
                failures: replication.failures,
            });
        }
        for failure in &replication.failures {
            warn!(backup_id = %backup_id, failure = %failure, "Copy missing at one destination");
        }

        let mut manifest = Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            backup_id,
            job_id: job.id.clone(),
            tier: job.tier,
            name: job.name.clone(),
            created_at,
            domains: sealed.entries,
            total_size_bytes: sealed.size_bytes,
            checksum: sealed.checksum,
            stored_checksum: stored.checksum,
            stored_size_bytes: stored.size_bytes,
            compressed: self.compressed,
            encrypted: stored.envelope.is_some(),
            encryption: stored.envelope,
            destinations: replication.refs,
            signature: None,
        };
        if let Some(key) = &stored.key {
            manifest.sign(key)?;
        }

        if let Err(e) = self.store.put_manifest(&manifest) {
            // Without a manifest nothing would ever evict these copies
            self.discard_copies(&manifest).await;
            return Err(e);
        }
        Ok(manifest)
    }

    /// Export every domain into one archive, checking for cancellation between domains
    async fn export_domains(
        &self,
        job: &BackupJob,
        order: &[String],
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<SealedArchive> {
        let archive_path = staging.join(archive_file_name(self.compressed, false));
        let mut writer = ArchiveWriter::create(&archive_path, self.compressed)?;

        for domain in order {
            if cancel.is_cancelled() {
                info!(domain = %domain, "Cancelled before export");
                return Err(BackupError::Cancelled(job.id.clone()));
            }

            let invoker = self.domains.invoker(domain)?;
            if invoker.is_busy() {
                warn!(domain = %domain, "An earlier hook call on this domain is still running, export will wait for it");
            }
            let scratch = staging.join("scratch").join(domain);
            std::fs::create_dir_all(&scratch)?;

            let held = invoker.clone();
            let task = tokio::task::spawn_blocking(move || {
                let result = invoker.export(&scratch).and_then(|artifact| {
                    writer.append_artifact(invoker.domain(), &artifact.path, artifact.size_bytes)
                });
                // The artifact now lives in the archive
                let _ = std::fs::remove_dir_all(&scratch);
                (writer, result)
            });

            writer = match tokio::time::timeout(self.export_timeout, task).await {
                Err(_) => {
                    // The blocking call cannot be interrupted and keeps the domain lock
                    warn!(
                        domain = %domain,
                        timeout_secs = self.export_timeout.as_secs(),
                        still_running = held.is_busy(),
                        "Export timed out, the domain stays locked until the hook returns"
                    );
                    return Err(BackupError::timeout(
                        format!("export of domain '{domain}'"),
                        self.export_timeout.as_secs(),
                    ))
                }
                Ok(Err(join)) => {
                    return Err(BackupError::export(
                        domain,
                        format!("export task panicked: {join}"),
                    ))
                }
                Ok(Ok((writer, result))) => {
                    let entry = result?;
                    info!(domain = %domain, bytes = entry.size_bytes, "Domain exported");
                    writer
                }
            };
        }

        tokio::task::spawn_blocking(move || writer.finish())
            .await
            .map_err(|e| BackupError::validation(format!("archive task failed: {e}")))?
    }

    /// Encrypt into a new file when configured, then drop the plaintext
    async fn prepare_upload(&self, sealed: &SealedArchive, staging: &Path) -> Result<StoredArchive> {
        let Some(source) = self.encryption.clone() else {
            return Ok(StoredArchive {
                path: sealed.path.clone(),
                checksum: sealed.checksum.clone(),
                size_bytes: sealed.size_bytes,
                envelope: None,
                key: None,
            });
        };

        let plaintext = sealed.path.clone();
        let encrypted = staging.join(archive_file_name(self.compressed, true));
        tokio::task::spawn_blocking(move || -> Result<StoredArchive> {
            let (key, params) = source.fresh()?;
            let (checksum, size_bytes) = encrypt_file(&plaintext, &encrypted, &key)?;
            // Only once the ciphertext is synced
            std::fs::remove_file(&plaintext)?;
            let envelope = EncryptionEnvelope::seal(&key, params)?;
            Ok(StoredArchive {
                path: encrypted,
                checksum,
                size_bytes,
                envelope: Some(envelope),
                key: Some(key),
            })
        })
        .await
        .map_err(|e| BackupError::crypto(format!("encryption task failed: {e}")))?
    }

    async fn discard_copies(&self, manifest: &Manifest) {
        for reference in &manifest.destinations {
            let Some(destination) = self.destinations.get(&reference.destination_name) else {
                continue;
            };
            if let Err(e) = self.destinations.delete(destination.as_ref(), reference).await {
                warn!(
                    destination = %reference.destination_name,
                    error = %e,
                    "Could not remove copy of unrecorded backup"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{Destination, MemoryDestination};
    use crate::domain::{DomainHook, ExportedArtifact, MockDomainHook};
    use keepsafe_retry::RetryPolicy;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        staging: PathBuf,
        store: Arc<StateStore>,
        memory: Arc<MemoryDestination>,
        destinations: Arc<DestinationSet>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state")).unwrap());
        let memory = Arc::new(MemoryDestination::new("primary"));
        let destinations = Arc::new(
            DestinationSet::new(vec![memory.clone() as Arc<dyn Destination>])
                .with_retry_policy(RetryPolicy::immediate(3)),
        );
        Fixture {
            staging: dir.path().join("staging"),
            _dir: dir,
            store,
            memory,
            destinations,
        }
    }

    fn writing_hook(name: &'static str, contents: &'static str) -> MockDomainHook {
        let mut hook = MockDomainHook::new();
        hook.expect_name().return_const(name.to_string());
        hook.expect_quiesce()
            .returning(move || Ok(crate::domain::QuiesceGuard::noop(name)));
        hook.expect_export().returning(move |scratch| {
            let path = scratch.join(format!("{name}.dump"));
            std::fs::write(&path, contents).unwrap();
            Ok(ExportedArtifact {
                path,
                size_bytes: contents.len() as u64,
            })
        });
        hook
    }

    fn registry(hooks: Vec<MockDomainHook>) -> Arc<DomainRegistry> {
        let mut registry = DomainRegistry::new();
        for hook in hooks {
            registry.register(Arc::new(hook) as Arc<dyn DomainHook>).unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_successful_job_writes_manifest() {
        let f = fixture();
        let coordinator = SnapshotCoordinator::new(
            registry(vec![writing_hook("database", "rows"), writing_hook("config", "port=1")]),
            f.destinations.clone(),
            f.store.clone(),
            &f.staging,
        );

        let mut job = BackupJob::new(crate::job::Tier::Daily, ["config", "database"]);
        let manifest = coordinator
            .run(&mut job, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.backup_id.as_deref(), Some(manifest.backup_id.as_str()));
        // Registration order, not request order
        assert_eq!(manifest.domain_names(), vec!["database", "config"]);
        assert!(manifest.is_durable());
        assert_eq!(f.store.get_manifest(&manifest.backup_id).unwrap(), manifest);
        assert_eq!(f.memory.object_count(), 1);
        assert_eq!(std::fs::read_dir(&f.staging).unwrap().count(), 0);

        let history = f.store.job_history().unwrap();
        assert_eq!(history[0].status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_no_verified_copy_fails_job() {
        let f = fixture();
        f.memory.deny_puts(true);
        let coordinator = SnapshotCoordinator::new(
            registry(vec![writing_hook("database", "rows")]),
            f.destinations.clone(),
            f.store.clone(),
            &f.staging,
        );

        let mut job = BackupJob::new(crate::job::Tier::Manual, ["database"]);
        let err = coordinator
            .run(&mut job, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::NoDurableCopy { .. }));
        assert_eq!(job.status, JobStatus::Failed);
        assert!(f.store.list_manifests().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_job_exports_nothing() {
        let f = fixture();
        let mut hook = MockDomainHook::new();
        hook.expect_name().return_const("database".to_string());
        hook.expect_export().never();
        let coordinator = SnapshotCoordinator::new(
            registry(vec![hook]),
            f.destinations.clone(),
            f.store.clone(),
            &f.staging,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut job = BackupJob::new(crate::job::Tier::Manual, ["database"]);
        let err = coordinator.run(&mut job, &cancel).await.unwrap_err();

        assert!(matches!(err, BackupError::Cancelled(_)));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(std::fs::read_dir(&f.staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_export_timeout_fails_job_and_next_job_waits_for_the_hook() {
        let f = fixture();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let mut hook = MockDomainHook::new();
        hook.expect_name().return_const("database".to_string());
        hook.expect_quiesce()
            .returning(|| Ok(crate::domain::QuiesceGuard::noop("database")));
        hook.expect_export().returning(move |scratch| {
            // Only the first export hangs past the timeout
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(800));
            }
            let path = scratch.join("database.dump");
            std::fs::write(&path, b"rows")?;
            Ok(ExportedArtifact { path, size_bytes: 4 })
        });
        let domains = registry(vec![hook]);

        let impatient = SnapshotCoordinator::new(
            domains.clone(),
            f.destinations.clone(),
            f.store.clone(),
            &f.staging,
        )
        .with_export_timeout(Duration::from_millis(100));
        let mut job = BackupJob::new(crate::job::Tier::Manual, ["database"]);
        let err = impatient
            .run(&mut job, &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            BackupError::Timeout { operation, .. } => assert!(operation.contains("database")),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(job.status, JobStatus::Failed);
        assert!(f.store.list_manifests().unwrap().is_empty());
        assert_eq!(f.memory.object_count(), 0);
        assert_eq!(std::fs::read_dir(&f.staging).unwrap().count(), 0);

        // The hung call still holds the domain; the next job waits it out
        let patient = SnapshotCoordinator::new(
            domains,
            f.destinations.clone(),
            f.store.clone(),
            &f.staging,
        );
        let mut job = BackupJob::new(crate::job::Tier::Manual, ["database"]);
        let manifest = patient
            .run(&mut job, &CancellationToken::new())
            .await
            .unwrap();
        assert!(manifest.is_durable());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_between_domains_discards_first_export() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let mut database = MockDomainHook::new();
        database.expect_name().return_const("database".to_string());
        database.expect_quiesce()
            .returning(|| Ok(crate::domain::QuiesceGuard::noop("database")));
        database.expect_export().times(1).returning(move |scratch| {
            // Cancellation arrives while this export is running
            trigger.cancel();
            let path = scratch.join("database.dump");
            std::fs::write(&path, b"rows")?;
            Ok(ExportedArtifact { path, size_bytes: 4 })
        });
        let mut config = MockDomainHook::new();
        config.expect_name().return_const("config".to_string());
        config.expect_export().never();

        let coordinator = SnapshotCoordinator::new(
            registry(vec![database, config]),
            f.destinations.clone(),
            f.store.clone(),
            &f.staging,
        );
        let mut job = BackupJob::new(crate::job::Tier::Manual, ["database", "config"]);
        let err = coordinator.run(&mut job, &cancel).await.unwrap_err();

        assert!(matches!(err, BackupError::Cancelled(_)));
        assert_eq!(job.status, JobStatus::Failed);
        assert!(f.store.list_manifests().unwrap().is_empty());
        assert_eq!(f.memory.put_attempts(), 0);
        assert_eq!(std::fs::read_dir(&f.staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_job_signs_manifest() {
        let f = fixture();
        let source = KeySource::new("correct horse", 1024, 1, 1);
        let coordinator = SnapshotCoordinator::new(
            registry(vec![writing_hook("database", "rows")]),
            f.destinations.clone(),
            f.store.clone(),
            &f.staging,
        )
        .with_encryption(Some(source.clone()));

        let mut job = BackupJob::new(crate::job::Tier::Manual, ["database"]);
        let manifest = coordinator
            .run(&mut job, &CancellationToken::new())
            .await
            .unwrap();

        assert!(manifest.encrypted);
        assert_ne!(manifest.checksum, manifest.stored_checksum);
        assert!(manifest.destinations[0].remote_path.ends_with(".enc"));
        let envelope = manifest.encryption.as_ref().unwrap();
        let key = source.derive(&envelope.kdf).unwrap();
        envelope.check_key(&key).unwrap();
        manifest.verify_signature(&key).unwrap();
    }
}
