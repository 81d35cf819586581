/*!
Destinations: places where archive copies are stored.

Every backend implements the same small [`Destination`] trait. Objects are
keyed deterministically by backup id, so repeating a `put` after a retry or a
crash overwrites the same object instead of creating a second one.

[`DestinationSet`] wraps the configured backends with what they share: retry
with backoff, a transfer timeout, health tracking and fan-out replication.
*/

#[cfg(feature = "gcs")]
pub mod gcs;
pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;
#[cfg(feature = "sftp")]
pub mod sftp;

#[cfg(feature = "gcs")]
pub use gcs::GcsDestination;
pub use local::LocalDestination;
pub use memory::MemoryDestination;
#[cfg(feature = "s3")]
pub use s3::S3Destination;
#[cfg(feature = "sftp")]
pub use sftp::SftpDestination;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use keepsafe_retry::{with_backoff_notify, RetryError, RetryPolicy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{DestinationBackend, DestinationConfig};
use crate::error::DestinationErrorKind;
use crate::integrity::hash_file;
use crate::manifest::DestinationRef;
use crate::observability::{record_destination_health, record_retry, MetricsTimer};
use crate::store::{HealthRecord, StateStore};
use crate::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Local,
    Remote,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Local => write!(f, "local"),
            DestinationKind::Remote => write!(f, "remote"),
        }
    }
}

/// Object key for a backup's archive: `[prefix/]backups/<backup_id>/<file_name>`
pub fn object_key(prefix: Option<&str>, backup_id: &str, file_name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/backups/{backup_id}/{file_name}"),
        None => format!("backups/{backup_id}/{file_name}"),
    }
}

/// Storage backend for archive copies
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DestinationKind;

    /// Store `archive` under the deterministic key for `backup_id`
    async fn put(&self, backup_id: &str, archive: &Path) -> Result<DestinationRef>;

    /// Download a stored object to `to`
    async fn fetch(&self, reference: &DestinationRef, to: &Path) -> Result<()>;

    /// Re-read the stored object and compare its hash with `expected_checksum`
    async fn verify(&self, reference: &DestinationRef, expected_checksum: &str) -> Result<bool> {
        let scratch = tempfile::Builder::new()
            .prefix("keepsafe-verify-")
            .tempfile()?;
        self.fetch(reference, scratch.path()).await?;
        let path = scratch.path().to_path_buf();
        let actual = tokio::task::spawn_blocking(move || hash_file(path))
            .await
            .map_err(|e| BackupError::validation(format!("verify task failed: {e}")))??;
        Ok(actual.eq_ignore_ascii_case(expected_checksum))
    }

    /// All backup archives stored at this destination
    async fn list(&self) -> Result<Vec<DestinationRef>>;

    /// Remove a stored object; an already-absent object is not an error
    async fn delete(&self, reference: &DestinationRef) -> Result<()>;
}

/// Create the backend described by a configuration entry
pub async fn build_destination(config: &DestinationConfig) -> Result<Arc<dyn Destination>> {
    config.validate()?;
    match &config.backend {
        DestinationBackend::Local { path } => {
            Ok(Arc::new(LocalDestination::new(&config.name, path)?))
        }
        #[cfg(feature = "s3")]
        DestinationBackend::S3 {
            bucket,
            prefix,
            region,
            endpoint,
        } => Ok(Arc::new(
            S3Destination::connect(
                &config.name,
                bucket,
                prefix.clone(),
                region.clone(),
                endpoint.clone(),
            )
            .await?,
        )),
        #[cfg(feature = "gcs")]
        DestinationBackend::Gcs {
            bucket,
            prefix,
            credentials,
        } => Ok(Arc::new(
            GcsDestination::connect(&config.name, bucket, prefix.clone(), credentials.clone())
                .await?,
        )),
        #[cfg(feature = "sftp")]
        DestinationBackend::Sftp {
            host,
            port,
            user,
            path,
            identity_file,
        } => Ok(Arc::new(SftpDestination::new(
            &config.name,
            host,
            *port,
            user,
            path,
            identity_file.clone(),
        ))),
        #[allow(unreachable_patterns)]
        other => Err(BackupError::config(format!(
            "destination '{}' needs a backend that was not compiled in: {other:?}",
            config.name
        ))),
    }
}

/// Health of one configured destination, for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationStatus {
    pub name: String,
    pub kind: DestinationKind,
    pub healthy: bool,
    pub reason: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

/// Outcome of replicating one archive to every healthy destination
#[derive(Debug, Default)]
pub struct Replication {
    /// Verified copies
    pub refs: Vec<DestinationRef>,
    /// One line per destination that did not end up with a verified copy
    pub failures: Vec<String>,
}

/// The configured destinations plus shared retry, timeout and health state
pub struct DestinationSet {
    destinations: Vec<Arc<dyn Destination>>,
    health: Mutex<BTreeMap<String, HealthRecord>>,
    store: Option<Arc<StateStore>>,
    policy: RetryPolicy,
    transfer_timeout: Duration,
}

impl DestinationSet {
    pub fn new(destinations: Vec<Arc<dyn Destination>>) -> Self {
        Self {
            destinations,
            health: Mutex::new(BTreeMap::new()),
            store: None,
            policy: RetryPolicy::remote(),
            transfer_timeout: Duration::from_secs(1800),
        }
    }

    /// Keep health flags in `store`, shared with other processes on the same state dir
    pub fn with_store(mut self, store: Arc<StateStore>) -> Result<Self> {
        let loaded = store.load_health()?;
        for (name, record) in &loaded {
            if !record.healthy {
                warn!(destination = %name, reason = ?record.reason, "Destination is marked unhealthy");
            }
        }
        self.health = Mutex::new(loaded);
        self.store = Some(store);
        Ok(self)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Destination>> {
        self.destinations
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    fn health(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, HealthRecord>> {
        self.health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current health flags, re-read from the store so an operator's clear is seen
    fn current_health(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, HealthRecord>> {
        let mut health = self.health();
        if let Some(store) = &self.store {
            match store.load_health() {
                Ok(loaded) => *health = loaded,
                Err(e) => warn!(error = %e, "Failed to reload destination health, using last known flags"),
            }
        }
        health
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.current_health().get(name).map_or(true, |r| r.healthy)
    }

    /// Destinations that accept new copies
    pub fn healthy(&self) -> Vec<Arc<dyn Destination>> {
        let health = self.current_health();
        self.destinations
            .iter()
            .filter(|d| health.get(d.name()).map_or(true, |r| r.healthy))
            .cloned()
            .collect()
    }

    fn set_health(&self, name: &str, healthy: bool, reason: Option<String>) -> Result<()> {
        let record = HealthRecord {
            healthy,
            reason,
            changed_at: Utc::now(),
        };
        let mut health = self.health();
        match &self.store {
            Some(store) => {
                *health = store.update_health(|flags| {
                    flags.insert(name.to_string(), record);
                })?;
            }
            None => {
                health.insert(name.to_string(), record);
            }
        }
        record_destination_health(name, healthy);
        Ok(())
    }

    /// Exclude a destination from future puts until an operator clears it
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        error!(destination = %name, reason, "Marking destination unhealthy");
        if let Err(e) = self.set_health(name, false, Some(reason.to_string())) {
            error!(destination = %name, error = %e, "Failed to persist destination health");
        }
    }

    /// Operator action: accept new copies on `name` again
    pub fn clear(&self, name: &str) -> Result<()> {
        if self.get(name).is_none() {
            return Err(BackupError::validation(format!(
                "unknown destination '{name}'"
            )));
        }
        info!(destination = %name, "Clearing unhealthy flag");
        self.set_health(name, true, None)
    }

    pub fn statuses(&self) -> Vec<DestinationStatus> {
        let health = self.current_health();
        self.destinations
            .iter()
            .map(|d| {
                let record = health.get(d.name());
                DestinationStatus {
                    name: d.name().to_string(),
                    kind: d.kind(),
                    healthy: record.map_or(true, |r| r.healthy),
                    reason: record.and_then(|r| r.reason.clone()),
                    changed_at: record.map(|r| r.changed_at),
                }
            })
            .collect()
    }

    /// Retry transient failures within the transfer timeout
    async fn attempt<T, F, Fut>(
        &self,
        destination: &str,
        operation: &'static str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op_name = format!("{operation} at {destination}");
        let timer = MetricsTimer::start(destination, operation);
        let retried = with_backoff_notify(
            &op_name,
            &self.policy,
            |_attempt| {
                let fut = f();
                async move { fut.await.map_err(|e| e.at_destination(destination)) }
            },
            |_err, _attempt, _delay| record_retry(destination, operation),
        );

        let outcome = match tokio::time::timeout(self.transfer_timeout, retried).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RetryError::MaxRetriesExceeded {
                attempts,
                last_error,
                ..
            })) => Err(BackupError::destination(
                destination,
                DestinationErrorKind::Transient,
                format!("{operation} gave up after {attempts} attempts: {last_error}"),
            )),
            Ok(Err(RetryError::Permanent { last_error, .. })) => Err(last_error),
            Err(_) => Err(BackupError::destination(
                destination,
                DestinationErrorKind::Transient,
                format!(
                    "{operation} timed out after {}s",
                    self.transfer_timeout.as_secs()
                ),
            )),
        };
        let elapsed = timer.finish(outcome.is_ok());
        debug!(destination, operation, elapsed_ms = elapsed.as_millis() as u64, ok = outcome.is_ok(), "Destination operation finished");
        outcome
    }

    pub async fn put(
        &self,
        destination: &dyn Destination,
        backup_id: &str,
        archive: &Path,
    ) -> Result<DestinationRef> {
        self.attempt(destination.name(), "put", || destination.put(backup_id, archive))
            .await
    }

    pub async fn verify(
        &self,
        destination: &dyn Destination,
        reference: &DestinationRef,
        expected_checksum: &str,
    ) -> Result<bool> {
        self.attempt(destination.name(), "verify", || {
            destination.verify(reference, expected_checksum)
        })
        .await
    }

    pub async fn fetch(
        &self,
        destination: &dyn Destination,
        reference: &DestinationRef,
        to: &Path,
    ) -> Result<()> {
        self.attempt(destination.name(), "fetch", || destination.fetch(reference, to))
            .await
    }

    /// Delete a copy; a copy that is already gone counts as deleted
    pub async fn delete(&self, destination: &dyn Destination, reference: &DestinationRef) -> Result<()> {
        match self
            .attempt(destination.name(), "delete", || destination.delete(reference))
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Put and verify one archive on every healthy destination concurrently
    ///
    /// A destination whose stored copy fails verification is marked unhealthy.
    /// Copies that did not verify are deleted on a best-effort basis.
    pub async fn replicate(
        &self,
        backup_id: &str,
        archive: &Path,
        stored_checksum: &str,
    ) -> Replication {
        let targets = self.healthy();
        if targets.is_empty() {
            return Replication {
                refs: Vec::new(),
                failures: vec!["no healthy destinations are configured".to_string()],
            };
        }

        let transfers = targets.iter().map(|destination| async move {
            let name = destination.name();
            let reference = self.put(destination.as_ref(), backup_id, archive).await?;

            // verify waits for this destination's own put only
            match self
                .verify(destination.as_ref(), &reference, stored_checksum)
                .await
            {
                Ok(true) => {
                    info!(destination = %name, backup_id, "Copy verified");
                    Ok(reference.verified(Utc::now()))
                }
                Ok(false) => {
                    self.mark_unhealthy(name, "stored copy failed checksum verification");
                    self.discard_unverified(destination.as_ref(), &reference).await;
                    Err(BackupError::integrity(
                        format!("copy of {backup_id} at '{name}'"),
                        stored_checksum,
                        "a different hash",
                    ))
                }
                Err(e) => {
                    self.discard_unverified(destination.as_ref(), &reference).await;
                    Err(e)
                }
            }
        });

        let mut replication = Replication::default();
        for (destination, result) in targets.iter().zip(join_all(transfers).await) {
            match result {
                Ok(reference) => replication.refs.push(reference),
                Err(e) => {
                    warn!(destination = %destination.name(), backup_id, error = %e, "Replication failed");
                    replication
                        .failures
                        .push(format!("{}: {e}", destination.name()));
                }
            }
        }
        replication
    }

    async fn discard_unverified(&self, destination: &dyn Destination, reference: &DestinationRef) {
        if let Err(e) = destination.delete(reference).await {
            warn!(
                destination = %destination.name(),
                path = %reference.remote_path,
                error = %e,
                "Could not remove unverified copy"
            );
        }
    }
}
