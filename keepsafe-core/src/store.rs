/*!
On-disk engine state.

```text
<state_dir>/
  manifests/<backup_id>.json   one immutable file per backup
  jobs.jsonl                   append-only job audit trail
  restores.jsonl               append-only restore audit trail
  restores/active/<backup_id>.<uuid>.lease
                               backups pinned by an in-progress restore
  claims/<domain>.lock         domains held by a pending or running job
  schedule.json                last fire time per tier
  destinations.json            destination health flags
  destinations.lock            serializes health updates
```

Whole-file writes go through a temp file in the same directory followed by a
rename, so readers never observe a half-written record.

Several processes may share one state dir (the daemon and operator commands).
Domain claims and health updates use `flock`, so a claim held by a process
that dies is released by the kernel.
*/

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::job::{BackupJob, Tier};
use crate::manifest::Manifest;
use crate::{BackupError, Result};

const MANIFEST_DIR: &str = "manifests";
const LEASE_DIR: &str = "restores/active";
const JOBS_LOG: &str = "jobs.jsonl";
const RESTORES_LOG: &str = "restores.jsonl";
const SCHEDULE_FILE: &str = "schedule.json";
const HEALTH_FILE: &str = "destinations.json";
const HEALTH_LOCK: &str = "destinations.lock";
const CLAIM_DIR: &str = "claims";

/// Persisted health flag for one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub healthy: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Terminal outcome of one restore, kept for auditing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub backup_id: String,
    pub requested_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub final_state: String,
    pub applied: Vec<String>,
    #[serde(default)]
    pub failure: Option<String>,
}

pub struct StateStore {
    root: PathBuf,
    append_lock: Mutex<()>,
}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(BackupError::validation(format!("invalid backup id '{id}'")))
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}

impl StateStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(MANIFEST_DIR))?;
        fs::create_dir_all(root.join(LEASE_DIR))?;
        fs::create_dir_all(root.join(CLAIM_DIR))?;
        debug!(root = %root.display(), "Opened state store");
        Ok(Self {
            root,
            append_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, backup_id: &str) -> Result<PathBuf> {
        validate_id(backup_id)?;
        Ok(self.root.join(MANIFEST_DIR).join(format!("{backup_id}.json")))
    }

    fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<NamedTempFile> {
        let dir = path
            .parent()
            .ok_or_else(|| BackupError::validation("state path has no parent directory"))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), value)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    fn replace_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let tmp = self.write_json_atomic(path, value)?;
        tmp.persist(path).map_err(|e| BackupError::Io(e.error))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned + Default>(&self, path: &Path) -> Result<T> {
        match File::open(path) {
            Ok(file) => Ok(serde_json::from_reader(BufReader::new(file))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new manifest; an existing manifest is never overwritten
    pub fn put_manifest(&self, manifest: &Manifest) -> Result<()> {
        manifest.validate()?;
        let path = self.manifest_path(&manifest.backup_id)?;
        let tmp = self.write_json_atomic(&path, manifest)?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                BackupError::validation(format!(
                    "manifest {} already exists",
                    manifest.backup_id
                ))
            } else {
                BackupError::Io(e.error)
            }
        })?;
        debug!(backup_id = %manifest.backup_id, "Manifest written");
        Ok(())
    }

    pub fn get_manifest(&self, backup_id: &str) -> Result<Manifest> {
        let path = self.manifest_path(backup_id)?;
        match File::open(&path) {
            Ok(file) => Ok(serde_json::from_reader(BufReader::new(file))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::ManifestNotFound(backup_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All manifests, newest first
    ///
    /// Unreadable files are logged and skipped.
    pub fn list_manifests(&self) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::new();
        for entry in fs::read_dir(self.root.join(MANIFEST_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = File::open(&path)
                .map_err(BackupError::from)
                .and_then(|f| Ok(serde_json::from_reader::<_, Manifest>(BufReader::new(f))?));
            match parsed {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(manifests)
    }

    pub fn remove_manifest(&self, backup_id: &str) -> Result<()> {
        let path = self.manifest_path(backup_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn append_line<T: Serialize>(&self, file_name: &str, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file_name))?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_lines<T: DeserializeOwned>(&self, file_name: &str) -> Result<Vec<T>> {
        let file = match File::open(self.root.join(file_name)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                // A crash mid-append can leave a torn last line
                Err(e) => warn!(file = file_name, line = index + 1, error = %e, "Skipping malformed audit record"),
            }
        }
        Ok(records)
    }

    /// Record a job state change in the audit trail
    pub fn append_job(&self, job: &BackupJob) -> Result<()> {
        self.append_line(JOBS_LOG, job)
    }

    /// Latest recorded state of every job, newest first
    pub fn job_history(&self) -> Result<Vec<BackupJob>> {
        let mut latest: HashMap<String, BackupJob> = HashMap::new();
        for job in self.read_lines::<BackupJob>(JOBS_LOG)? {
            latest.insert(job.id.clone(), job);
        }
        let mut jobs: Vec<BackupJob> = latest.into_values().collect();
        jobs.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        Ok(jobs)
    }

    pub fn append_restore(&self, record: &RestoreRecord) -> Result<()> {
        self.append_line(RESTORES_LOG, record)
    }

    /// Every restore outcome, newest first
    pub fn restore_history(&self) -> Result<Vec<RestoreRecord>> {
        let mut records = self.read_lines::<RestoreRecord>(RESTORES_LOG)?;
        records.reverse();
        Ok(records)
    }

    pub fn load_schedule(&self) -> Result<BTreeMap<Tier, DateTime<Utc>>> {
        self.read_json(&self.root.join(SCHEDULE_FILE))
    }

    pub fn save_schedule(&self, last_fires: &BTreeMap<Tier, DateTime<Utc>>) -> Result<()> {
        self.replace_json(&self.root.join(SCHEDULE_FILE), last_fires)
    }

    pub fn load_health(&self) -> Result<BTreeMap<String, HealthRecord>> {
        self.read_json(&self.root.join(HEALTH_FILE))
    }

    pub fn save_health(&self, health: &BTreeMap<String, HealthRecord>) -> Result<()> {
        self.replace_json(&self.root.join(HEALTH_FILE), health)
    }

    /// Read, change and write the health flags under an exclusive lock
    ///
    /// Updates from other processes made since the last read are kept.
    pub fn update_health<F>(&self, update: F) -> Result<BTreeMap<String, HealthRecord>>
    where
        F: FnOnce(&mut BTreeMap<String, HealthRecord>),
    {
        let file = open_lock_file(&self.root.join(HEALTH_LOCK))?;
        let _lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| BackupError::Io(errno.into()))?;
        let mut health = self.load_health()?;
        update(&mut health);
        self.save_health(&health)?;
        Ok(health)
    }

    fn claim_path(&self, domain: &str) -> PathBuf {
        let stem = if validate_id(domain).is_ok() {
            domain.to_string()
        } else {
            let hex: String = domain.bytes().map(|b| format!("{b:02x}")).collect();
            format!("~{hex}")
        };
        self.root.join(CLAIM_DIR).join(format!("{stem}.lock"))
    }

    /// Claim `domains` for `holder` in every process sharing this state dir
    ///
    /// Fails with [`BackupError::JobConflict`] naming the current holder when
    /// any domain is already claimed. Nothing stays claimed on failure.
    pub fn claim_domains<'a, I>(&self, holder: &str, domains: I) -> Result<DomainClaims>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let domains: Vec<&String> = domains.into_iter().collect();
        let mut claims = DomainClaims {
            held: Vec::with_capacity(domains.len()),
        };
        for domain in &domains {
            let path = self.claim_path(domain);
            match Flock::lock(open_lock_file(&path)?, FlockArg::LockExclusiveNonblock) {
                Ok(mut lock) => {
                    lock.set_len(0)?;
                    (*lock).write_all(holder.as_bytes())?;
                    claims.held.push(lock);
                }
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    let running_job = fs::read_to_string(&path)
                        .ok()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "a job in another process".to_string());
                    debug!(domain = %domain, holder = %running_job, "Domain already claimed");
                    return Err(BackupError::JobConflict {
                        domains: domains
                            .iter()
                            .map(|d| d.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        running_job,
                    });
                }
                Err((_, errno)) => return Err(BackupError::Io(errno.into())),
            }
        }
        Ok(claims)
    }

    /// Pin a backup against eviction until the lease is dropped
    pub fn acquire_restore_lease(&self, backup_id: &str) -> Result<RestoreLease> {
        validate_id(backup_id)?;
        let path = self.root.join(LEASE_DIR).join(format!(
            "{backup_id}.{}.lease",
            uuid::Uuid::new_v4().simple()
        ));
        File::create(&path)?.sync_all()?;
        Ok(RestoreLease { path })
    }

    /// Backup ids pinned by at least one restore
    pub fn active_restore_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for entry in fs::read_dir(self.root.join(LEASE_DIR))? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_suffix(".lease")
                .and_then(|rest| rest.rsplit_once('.'))
                .map(|(id, _)| id)
            {
                ids.insert(id.to_string());
            }
        }
        Ok(ids)
    }
}

/// Exclusive hold on a set of domains; released on drop or process exit
#[must_use = "dropping the claims releases the domains immediately"]
pub struct DomainClaims {
    held: Vec<Flock<File>>,
}

impl std::fmt::Debug for DomainClaims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainClaims")
            .field("held", &self.held.len())
            .finish()
    }
}

impl Drop for DomainClaims {
    fn drop(&mut self) {
        for lock in &self.held {
            // Clear the holder name before the lock goes
            if let Err(e) = lock.set_len(0) {
                debug!(error = %e, "Failed to clear domain claim");
            }
        }
    }
}

/// Marks a backup as being restored; removes the marker on drop
#[derive(Debug)]
pub struct RestoreLease {
    path: PathBuf,
}

impl Drop for RestoreLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release restore lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::manifest::{DestinationRef, DomainEntry, MANIFEST_FORMAT_VERSION};
    use chrono::Duration;
    use tempfile::TempDir;

    fn manifest(id: &str, created_at: DateTime<Utc>) -> Manifest {
        Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            backup_id: id.to_string(),
            job_id: format!("job-{id}"),
            tier: Tier::Daily,
            name: None,
            created_at,
            domains: vec![DomainEntry {
                domain: "database".to_string(),
                artifact_path: "domains/database/database.dump".to_string(),
                size_bytes: 3,
                checksum: "ab".repeat(32),
            }],
            total_size_bytes: 10,
            checksum: "cd".repeat(32),
            stored_checksum: "cd".repeat(32),
            stored_size_bytes: 10,
            compressed: false,
            encrypted: false,
            encryption: None,
            destinations: vec![DestinationRef::new("primary", format!("backups/{id}/archive.tar"))
                .verified(created_at)],
            signature: None,
        }
    }

    #[test]
    fn test_manifest_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let now = Utc::now();

        store.put_manifest(&manifest("b1", now - Duration::hours(2))).unwrap();
        store.put_manifest(&manifest("b2", now)).unwrap();

        let listed = store.list_manifests().unwrap();
        assert_eq!(
            listed.iter().map(|m| m.backup_id.as_str()).collect::<Vec<_>>(),
            vec!["b2", "b1"]
        );
        assert_eq!(store.get_manifest("b1").unwrap().job_id, "job-b1");

        store.remove_manifest("b1").unwrap();
        assert!(matches!(
            store.get_manifest("b1"),
            Err(BackupError::ManifestNotFound(_))
        ));
        store.remove_manifest("b1").unwrap();
    }

    #[test]
    fn test_manifests_are_immutable() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let m = manifest("b1", Utc::now());
        store.put_manifest(&m).unwrap();
        assert!(store.put_manifest(&m).is_err());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.get_manifest("../etc/passwd").is_err());
        assert!(store.acquire_restore_lease("a/b").is_err());
    }

    #[test]
    fn test_job_history_keeps_latest_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut job = BackupJob::new(Tier::Manual, ["database"]);
        store.append_job(&job).unwrap();
        job.transition(JobStatus::Running).unwrap();
        store.append_job(&job).unwrap();
        job.transition(JobStatus::Succeeded).unwrap();
        store.append_job(&job).unwrap();

        let history = store.job_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Succeeded);
    }

    #[test]
    fn test_torn_audit_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .append_job(&BackupJob::new(Tier::Daily, ["database"]))
            .unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOBS_LOG))
            .unwrap();
        file.write_all(b"{\"id\":\"trunc").unwrap();

        assert_eq!(store.job_history().unwrap().len(), 1);
    }

    #[test]
    fn test_restore_leases() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let lease = store.acquire_restore_lease("daily-1").unwrap();
        let second = store.acquire_restore_lease("daily-1").unwrap();
        assert!(store.active_restore_ids().unwrap().contains("daily-1"));

        drop(lease);
        assert!(store.active_restore_ids().unwrap().contains("daily-1"));
        drop(second);
        assert!(store.active_restore_ids().unwrap().is_empty());
    }

    #[test]
    fn test_domain_claims_conflict_across_store_handles() {
        let dir = TempDir::new().unwrap();
        // Two handles on one state dir stand in for the daemon and a CLI call
        let daemon = StateStore::open(dir.path()).unwrap();
        let cli = StateStore::open(dir.path()).unwrap();
        let database = "database".to_string();
        let config = "config".to_string();

        let held = daemon.claim_domains("job-1", [&database]).unwrap();
        match cli.claim_domains("job-2", [&config, &database]).unwrap_err() {
            BackupError::JobConflict { running_job, domains } => {
                assert_eq!(running_job, "job-1");
                assert_eq!(domains, "config, database");
            }
            other => panic!("expected JobConflict, got {other:?}"),
        }

        // The failed attempt released "config" again
        let reports = cli.claim_domains("job-3", [&config]).unwrap();
        drop(reports);

        drop(held);
        assert!(cli.claim_domains("job-2", [&config, &database]).is_ok());
    }

    #[test]
    fn test_odd_domain_names_get_their_own_claim_file() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let nested = "app/config".to_string();
        let flat = "app_config".to_string();
        let _first = store.claim_domains("job-1", [&nested]).unwrap();
        assert!(store.claim_domains("job-2", [&flat]).is_ok());
        assert!(store.claim_domains("job-3", [&nested]).is_err());
    }

    #[test]
    fn test_health_updates_merge_with_other_writers() {
        let dir = TempDir::new().unwrap();
        let daemon = StateStore::open(dir.path()).unwrap();
        let cli = StateStore::open(dir.path()).unwrap();
        let record = |healthy| HealthRecord {
            healthy,
            reason: None,
            changed_at: Utc::now(),
        };

        daemon
            .update_health(|h| {
                h.insert("primary".to_string(), record(false));
            })
            .unwrap();
        cli.update_health(|h| {
            h.insert("primary".to_string(), record(true));
        })
        .unwrap();
        let merged = daemon
            .update_health(|h| {
                h.insert("offsite".to_string(), record(false));
            })
            .unwrap();

        assert!(merged["primary"].healthy);
        assert!(!merged["offsite"].healthy);
        assert_eq!(cli.load_health().unwrap(), merged);
    }

    #[test]
    fn test_schedule_and_health_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.load_schedule().unwrap().is_empty());

        let mut fires = BTreeMap::new();
        fires.insert(Tier::Weekly, Utc::now());
        store.save_schedule(&fires).unwrap();
        assert_eq!(store.load_schedule().unwrap(), fires);

        let mut health = BTreeMap::new();
        health.insert(
            "offsite".to_string(),
            HealthRecord {
                healthy: false,
                reason: Some("verify mismatch".to_string()),
                changed_at: Utc::now(),
            },
        );
        store.save_health(&health).unwrap();
        assert_eq!(store.load_health().unwrap(), health);
    }
}
