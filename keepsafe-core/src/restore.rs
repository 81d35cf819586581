/*!
Restore engine.

A restore moves through `requested → validated → staged → applying` and ends
`completed`, `rolled_back` or `partial`, or `failed` when the first import
fails and nothing was applied. Nothing live is touched until the
archive has been downloaded, its checksums confirmed and, when encrypted,
decrypted. Domain artifacts are extracted outside any live path and checked
again before the first import.

Imports run one domain at a time in capture order, with the target domains
claimed in the state store so no backup job exports them meanwhile. When one fails, the
domains already applied are undone only if every one of them supports undo.
Otherwise the restore stops and reports exactly which domains were applied.
*/

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::archive::extract_archive;
use crate::crypto::{decrypt_file, KeySource};
use crate::destination::DestinationSet;
use crate::domain::DomainRegistry;
use crate::error::DestinationErrorKind;
use crate::integrity::{hash_file, verify_checksum};
use crate::manifest::{DestinationRef, DomainEntry, Manifest};
use crate::observability::record_restore;
use crate::store::{RestoreRecord, StateStore};
use crate::{BackupError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Requested,
    Validated,
    Staged,
    Applying,
    Completed,
    RolledBack,
    /// Some domains were applied and could not be undone
    Partial,
    /// Stopped before any domain was touched
    Failed,
}

impl RestoreState {
    pub fn can_transition_to(self, next: RestoreState) -> bool {
        use RestoreState::*;
        matches!(
            (self, next),
            (Requested, Validated)
                | (Requested, Failed)
                | (Validated, Staged)
                | (Validated, Failed)
                | (Staged, Applying)
                | (Staged, Failed)
                | (Applying, Completed)
                | (Applying, RolledBack)
                | (Applying, Partial)
                | (Applying, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestoreState::Requested => "requested",
            RestoreState::Validated => "validated",
            RestoreState::Staged => "staged",
            RestoreState::Applying => "applying",
            RestoreState::Completed => "completed",
            RestoreState::RolledBack => "rolled_back",
            RestoreState::Partial => "partial",
            RestoreState::Failed => "failed",
        }
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which domains of a backup to restore
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RestoreScope {
    #[default]
    Full,
    Domains(Vec<String>),
}

/// Operator request to restore one backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub scope: RestoreScope,
    pub dry_run: bool,
    /// Destination to read from; defaults to the first verified copy
    pub source: Option<String>,
}

impl RestoreRequest {
    pub fn new<S: Into<String>>(backup_id: S) -> Self {
        Self {
            backup_id: backup_id.into(),
            scope: RestoreScope::Full,
            dry_run: false,
            source: None,
        }
    }

    pub fn domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = RestoreScope::Domains(domains.into_iter().map(Into::into).collect());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn from_destination<S: Into<String>>(mut self, destination: S) -> Self {
        self.source = Some(destination.into());
        self
    }
}

/// Outcome of a restore that got past validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub state: RestoreState,
    pub dry_run: bool,
    /// Destination the archive was read from
    pub source: String,
    /// Domains targeted, in capture order, with what would be written
    pub planned: Vec<DomainEntry>,
    pub applied: Vec<String>,
    pub rolled_back: Vec<String>,
    pub failure: Option<String>,
}

/// Tracks the state of one restore and refuses invalid transitions
#[derive(Debug)]
struct RestoreRun {
    state: RestoreState,
}

impl RestoreRun {
    fn new() -> Self {
        Self {
            state: RestoreState::Requested,
        }
    }

    fn advance(&mut self, next: RestoreState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BackupError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(from = %self.state, to = %next, "Restore state changed");
        self.state = next;
        Ok(())
    }
}

pub struct RestoreEngine {
    store: Arc<StateStore>,
    destinations: Arc<DestinationSet>,
    domains: Arc<DomainRegistry>,
    keys: Option<KeySource>,
    staging_root: PathBuf,
}

impl RestoreEngine {
    pub fn new<P: AsRef<Path>>(
        store: Arc<StateStore>,
        destinations: Arc<DestinationSet>,
        domains: Arc<DomainRegistry>,
        staging_root: P,
    ) -> Self {
        Self {
            store,
            destinations,
            domains,
            keys: None,
            staging_root: staging_root.as_ref().to_path_buf(),
        }
    }

    pub fn with_keys(mut self, keys: Option<KeySource>) -> Self {
        self.keys = keys;
        self
    }

    /// Run a restore to its final state and append it to the restore log
    ///
    /// Returns the report for `completed`, `rolled_back` and dry-run `staged`
    /// outcomes. A restore that leaves some domains applied returns
    /// [`BackupError::PartialRestore`]; failures before any import return the
    /// underlying error.
    #[instrument(skip_all, fields(backup_id = %request.backup_id, dry_run = request.dry_run))]
    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let requested_at = Utc::now();
        let mut run = RestoreRun::new();
        let outcome = self.execute(request, &mut run).await;

        let (final_state, applied, failure) = match &outcome {
            Ok(report) => (report.state, report.applied.clone(), report.failure.clone()),
            Err(BackupError::PartialRestore { succeeded, .. }) => {
                (RestoreState::Partial, succeeded.clone(), outcome.as_ref().err().map(|e| e.to_string()))
            }
            Err(e) => {
                if run.state.can_transition_to(RestoreState::Failed) {
                    run.state = RestoreState::Failed;
                }
                (run.state, Vec::new(), Some(e.to_string()))
            }
        };

        record_restore(final_state.as_str());
        let record = RestoreRecord {
            backup_id: request.backup_id.clone(),
            requested_at,
            finished_at: Utc::now(),
            dry_run: request.dry_run,
            final_state: final_state.to_string(),
            applied,
            failure,
        };
        if let Err(e) = self.store.append_restore(&record) {
            error!(error = %e, "Failed to append restore log");
        }
        outcome
    }

    async fn execute(&self, request: &RestoreRequest, run: &mut RestoreRun) -> Result<RestoreReport> {
        // Pin the backup before reading its manifest so retention cannot race us
        let _lease = self.store.acquire_restore_lease(&request.backup_id)?;
        let manifest = self.store.get_manifest(&request.backup_id)?;
        if !manifest.is_compatible() {
            return Err(BackupError::validation(format!(
                "backup {} uses manifest format {}, newer than supported",
                manifest.backup_id, manifest.format_version
            )));
        }
        let targets = self.targets(&manifest, &request.scope)?;
        let reference = self.source(&manifest, request.source.as_deref())?;
        let _claims = if request.dry_run {
            None
        } else {
            Some(self.store.claim_domains(
                &format!("restore of {}", manifest.backup_id),
                targets.iter().map(|t| &t.domain),
            )?)
        };

        std::fs::create_dir_all(&self.staging_root)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("restore-{}-", manifest.backup_id))
            .tempdir_in(&self.staging_root)?;

        let archive = self.download_and_validate(&manifest, &reference, staging.path()).await?;
        run.advance(RestoreState::Validated)?;

        let extracted = staging.path().join("extracted");
        let staged = {
            let archive = archive.clone();
            let extracted = extracted.clone();
            let compressed = manifest.compressed;
            let targets = targets.clone();
            tokio::task::spawn_blocking(move || stage(&archive, compressed, &extracted, &targets))
                .await
                .map_err(|e| BackupError::validation(format!("staging task failed: {e}")))??
        };
        run.advance(RestoreState::Staged)?;

        let mut report = RestoreReport {
            backup_id: manifest.backup_id.clone(),
            state: RestoreState::Staged,
            dry_run: request.dry_run,
            source: reference.destination_name.clone(),
            planned: targets,
            applied: Vec::new(),
            rolled_back: Vec::new(),
            failure: None,
        };
        if request.dry_run {
            info!(domains = report.planned.len(), "Dry run staged, no domain touched");
            return Ok(report);
        }

        run.advance(RestoreState::Applying)?;
        self.apply(&manifest, staged, run, &mut report).await?;
        Ok(report)
    }

    /// Requested domains in capture order; every one must exist in the backup and locally
    fn targets(&self, manifest: &Manifest, scope: &RestoreScope) -> Result<Vec<DomainEntry>> {
        let targets: Vec<DomainEntry> = match scope {
            RestoreScope::Full => manifest.domains.clone(),
            RestoreScope::Domains(requested) => {
                if requested.is_empty() {
                    return Err(BackupError::validation("restore names no domains"));
                }
                for name in requested {
                    if !manifest.domains.iter().any(|d| &d.domain == name) {
                        return Err(BackupError::validation(format!(
                            "backup {} does not contain domain '{name}'",
                            manifest.backup_id
                        )));
                    }
                }
                manifest
                    .domains
                    .iter()
                    .filter(|d| requested.contains(&d.domain))
                    .cloned()
                    .collect()
            }
        };
        for entry in &targets {
            if !self.domains.contains(&entry.domain) {
                return Err(BackupError::validation(format!(
                    "domain '{}' is not configured on this host",
                    entry.domain
                )));
            }
        }
        Ok(targets)
    }

    /// The verified copy to read; an unhealthy source is an error, not a fallback
    fn source(&self, manifest: &Manifest, requested: Option<&str>) -> Result<DestinationRef> {
        let reference = match requested {
            Some(name) => manifest
                .verified_refs()
                .find(|r| r.destination_name == name)
                .ok_or_else(|| {
                    BackupError::destination(
                        name,
                        DestinationErrorKind::NotFound,
                        format!("no verified copy of {}", manifest.backup_id),
                    )
                })?,
            None => manifest.verified_refs().next().ok_or_else(|| {
                BackupError::validation(format!(
                    "backup {} has no verified copy",
                    manifest.backup_id
                ))
            })?,
        };

        let name = &reference.destination_name;
        if self.destinations.get(name).is_none() {
            return Err(BackupError::destination(
                name,
                DestinationErrorKind::Permanent,
                "destination is not configured",
            ));
        }
        if !self.destinations.is_healthy(name) {
            return Err(BackupError::destination(
                name,
                DestinationErrorKind::Permanent,
                "destination is marked unhealthy; clear it or pick another source",
            ));
        }
        Ok(reference.clone())
    }

    /// Fetch the stored object and return the path of the plaintext archive
    async fn download_and_validate(
        &self,
        manifest: &Manifest,
        reference: &DestinationRef,
        staging: &Path,
    ) -> Result<PathBuf> {
        let destination = self
            .destinations
            .get(&reference.destination_name)
            .ok_or_else(|| BackupError::validation("source destination disappeared"))?;

        // Prove the key before downloading anything
        let key = match &manifest.encryption {
            Some(envelope) => {
                let keys = self.keys.clone().ok_or_else(|| {
                    BackupError::crypto("backup is encrypted but no key_ref is configured")
                })?;
                let kdf = envelope.kdf.clone();
                let key = tokio::task::spawn_blocking(move || keys.derive(&kdf))
                    .await
                    .map_err(|e| BackupError::crypto(format!("key derivation task failed: {e}")))??;
                envelope.check_key(&key)?;
                manifest.verify_signature(&key)?;
                Some(key)
            }
            None => None,
        };

        let downloaded = staging.join(manifest.archive_file_name());
        self.destinations
            .fetch(destination.as_ref(), reference, &downloaded)
            .await?;

        let stored_checksum = manifest.stored_checksum.clone();
        let context = format!(
            "copy of {} at '{}'",
            manifest.backup_id, reference.destination_name
        );
        let plaintext_checksum = manifest.checksum.clone();
        let backup_id = manifest.backup_id.clone();
        let compressed = manifest.compressed;
        let staging = staging.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            verify_checksum(&context, &stored_checksum, &hash_file(&downloaded)?)?;
            let Some(key) = key else {
                return Ok(downloaded);
            };
            let plaintext = staging.join(crate::manifest::archive_file_name(compressed, false));
            let (checksum, _) = decrypt_file(&downloaded, &plaintext, &key)?;
            verify_checksum(
                &format!("decrypted archive of {backup_id}"),
                &plaintext_checksum,
                &checksum,
            )?;
            std::fs::remove_file(&downloaded)?;
            Ok(plaintext)
        })
        .await
        .map_err(|e| BackupError::validation(format!("validation task failed: {e}")))?
    }

    async fn apply(
        &self,
        manifest: &Manifest,
        staged: Vec<(DomainEntry, PathBuf)>,
        run: &mut RestoreRun,
        report: &mut RestoreReport,
    ) -> Result<()> {
        for (entry, artifact) in staged {
            let invoker = self.domains.invoker(&entry.domain)?;
            let hook = invoker.clone();
            let imported = tokio::task::spawn_blocking(move || hook.import(&artifact))
                .await
                .unwrap_or_else(|e| {
                    Err(BackupError::import(&entry.domain, format!("import task panicked: {e}")))
                });

            match imported {
                Ok(()) => {
                    info!(domain = %entry.domain, "Domain restored");
                    report.applied.push(entry.domain.clone());
                }
                Err(e) => {
                    error!(domain = %entry.domain, error = %e, "Import failed");
                    return self
                        .recover(manifest, &entry.domain, e, run, report)
                        .await;
                }
            }
        }

        for domain in &report.applied {
            let invoker = self.domains.invoker(domain)?;
            let _ = tokio::task::spawn_blocking(move || invoker.commit()).await;
        }
        run.advance(RestoreState::Completed)?;
        report.state = RestoreState::Completed;
        info!(domains = report.applied.len(), "Restore completed");
        Ok(())
    }

    /// After a failed import: undo the applied domains if all of them can, else report partial
    ///
    /// A failed import leaves its own domain as it was, so only domains that
    /// were fully applied are undone, newest first.
    async fn recover(
        &self,
        manifest: &Manifest,
        failed_domain: &str,
        cause: BackupError,
        run: &mut RestoreRun,
        report: &mut RestoreReport,
    ) -> Result<()> {
        if report.applied.is_empty() {
            // Nothing was applied, so there is nothing to undo or report as partial
            return Err(cause);
        }
        let invokers = report
            .applied
            .iter()
            .map(|d| self.domains.invoker(d))
            .collect::<Result<Vec<_>>>()?;

        let partial = |succeeded: Vec<String>, cause: String| BackupError::PartialRestore {
            backup_id: manifest.backup_id.clone(),
            succeeded,
            failed_domain: failed_domain.to_string(),
            cause,
        };

        if !invokers.iter().all(|i| i.supports_undo()) {
            warn!(applied = ?report.applied, "Not every applied domain supports undo, leaving them in place");
            run.advance(RestoreState::Partial)?;
            report.state = RestoreState::Partial;
            return Err(partial(report.applied.clone(), cause.to_string()));
        }

        for invoker in invokers.into_iter().rev() {
            let domain = invoker.domain().to_string();
            let undone = tokio::task::spawn_blocking(move || invoker.undo())
                .await
                .unwrap_or_else(|e| Err(BackupError::import(&domain, format!("undo task panicked: {e}"))));
            match undone {
                Ok(()) => {
                    report.applied.retain(|d| d != &domain);
                    report.rolled_back.push(domain);
                }
                Err(undo_error) => {
                    error!(domain = %domain, error = %undo_error, "Undo failed");
                    run.advance(RestoreState::Partial)?;
                    report.state = RestoreState::Partial;
                    return Err(partial(
                        report.applied.clone(),
                        format!("{cause}; undo of '{domain}' also failed: {undo_error}"),
                    ));
                }
            }
        }

        run.advance(RestoreState::RolledBack)?;
        report.state = RestoreState::RolledBack;
        report.failure = Some(cause.to_string());
        warn!(rolled_back = ?report.rolled_back, "Restore rolled back");
        Ok(())
    }
}

/// Extract the archive and check each target artifact against its manifest checksum
fn stage(
    archive: &Path,
    compressed: bool,
    extracted: &Path,
    targets: &[DomainEntry],
) -> Result<Vec<(DomainEntry, PathBuf)>> {
    extract_archive(archive, compressed, extracted)?;
    targets
        .iter()
        .map(|entry| {
            let path = extracted.join(&entry.artifact_path);
            if !path.is_file() {
                return Err(BackupError::integrity(
                    format!("artifact of domain '{}'", entry.domain),
                    &entry.checksum,
                    "missing from archive",
                ));
            }
            verify_checksum(
                &format!("artifact of domain '{}'", entry.domain),
                &entry.checksum,
                &hash_file(&path)?,
            )?;
            Ok((entry.clone(), path))
        })
        .collect()
}
