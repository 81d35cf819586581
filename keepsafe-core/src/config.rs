//! Configuration for the backup engine
//!
//! The engine consumes a single TOML document describing cadences, retention
//! counts, encryption, destinations and data domains. Structures here are plain
//! serde types; [`EngineConfig::validate`] enforces cross-field rules.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::KeySource;
use crate::job::Tier;
use crate::schedule::Cadence;
use crate::{BackupError, Result};

/// Storage target configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    #[serde(flatten)]
    pub backend: DestinationBackend,
}

/// Enumeration of supported storage backends and their parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationBackend {
    /// Local filesystem directory
    Local { path: PathBuf },
    /// Amazon S3 (or S3-compatible) object storage
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// Google Cloud Storage
    Gcs {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        credentials: Option<PathBuf>,
    },
    /// Remote filesystem reached over SSH
    Sftp {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        user: String,
        path: String,
        #[serde(default)]
        identity_file: Option<PathBuf>,
    },
}

fn default_ssh_port() -> u16 {
    22
}

impl DestinationConfig {
    /// Parse a destination URI and create the matching configuration
    ///
    /// Supports formats:
    /// - `s3://bucket/prefix`
    /// - `gs://bucket/prefix`
    /// - `sftp://user@host[:port]/path`
    /// - `/local/path` or `./relative/path`
    pub fn from_uri(name: &str, uri: &str) -> Result<DestinationConfig> {
        let backend = if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = split_bucket(rest, "S3")?;
            DestinationBackend::S3 {
                bucket,
                prefix,
                region: None,
                endpoint: None,
            }
        } else if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, prefix) = split_bucket(rest, "GCS")?;
            DestinationBackend::Gcs {
                bucket,
                prefix,
                credentials: None,
            }
        } else if let Some(rest) = uri.strip_prefix("sftp://") {
            let (authority, path) = rest.split_once('/').ok_or_else(|| {
                BackupError::config("SFTP URI must include a remote path")
            })?;
            let (user, host_port) = authority.split_once('@').ok_or_else(|| {
                BackupError::config("SFTP URI must include a user (user@host)")
            })?;
            let (host, port) = match host_port.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse()
                        .map_err(|_| BackupError::config(format!("Invalid SFTP port: {port}")))?;
                    (host.to_string(), port)
                }
                None => (host_port.to_string(), default_ssh_port()),
            };
            DestinationBackend::Sftp {
                host,
                port,
                user: user.to_string(),
                path: format!("/{path}"),
                identity_file: None,
            }
        } else {
            DestinationBackend::Local {
                path: PathBuf::from(uri),
            }
        };

        let config = DestinationConfig {
            name: name.to_string(),
            backend,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BackupError::config("destination name cannot be empty"));
        }
        match &self.backend {
            DestinationBackend::Local { path } => {
                if path.as_os_str().is_empty() {
                    return Err(BackupError::config(format!(
                        "destination '{}' requires a path",
                        self.name
                    )));
                }
            }
            DestinationBackend::S3 { bucket, .. } | DestinationBackend::Gcs { bucket, .. } => {
                if bucket.is_empty() {
                    return Err(BackupError::config(format!(
                        "destination '{}' requires a valid bucket name",
                        self.name
                    )));
                }
            }
            DestinationBackend::Sftp { host, user, .. } => {
                if host.is_empty() || user.is_empty() {
                    return Err(BackupError::config(format!(
                        "destination '{}' requires host and user",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn split_bucket(rest: &str, label: &str) -> Result<(String, Option<String>)> {
    let mut parts = rest.splitn(2, '/');
    let bucket = parts.next().unwrap_or_default();
    if bucket.is_empty() {
        return Err(BackupError::config(format!(
            "Invalid {label} URI: missing bucket name"
        )));
    }
    let prefix = parts
        .next()
        .map(|p| p.trim_matches('/').to_string())
        .filter(|p| !p.is_empty());
    Ok((bucket.to_string(), prefix))
}

/// A slice of application state that can be exported and imported on its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    #[serde(flatten)]
    pub hook: DomainHookConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DomainHookConfig {
    /// A directory tree archived as a whole
    Directory { path: PathBuf },
    /// External commands; the artifact path is passed in `KEEPSAFE_ARTIFACT`
    Command {
        export: String,
        import: String,
        #[serde(default)]
        undo: Option<String>,
        #[serde(default)]
        quiesce: Option<String>,
        #[serde(default)]
        release: Option<String>,
        #[serde(default)]
        artifact: Option<String>,
    },
}

/// Cadence expressions per scheduled tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub daily: Option<String>,
    #[serde(default)]
    pub weekly: Option<String>,
    #[serde(default)]
    pub monthly: Option<String>,
}

impl ScheduleConfig {
    /// Parsed cadences for every tier that has one configured
    pub fn cadences(&self) -> Result<Vec<(Tier, Cadence)>> {
        let mut cadences = Vec::new();
        for (tier, expr) in [
            (Tier::Daily, &self.daily),
            (Tier::Weekly, &self.weekly),
            (Tier::Monthly, &self.monthly),
        ] {
            if let Some(expr) = expr {
                cadences.push((tier, Cadence::parse(expr)?));
            }
        }
        Ok(cadences)
    }
}

/// Number of succeeded backups to keep per tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_daily_keep")]
    pub daily: Option<usize>,
    #[serde(default = "default_weekly_keep")]
    pub weekly: Option<usize>,
    #[serde(default = "default_monthly_keep")]
    pub monthly: Option<usize>,
    /// Manual backups are kept forever unless a count is given
    #[serde(default)]
    pub manual: Option<usize>,
}

fn default_daily_keep() -> Option<usize> {
    Some(7)
}

fn default_weekly_keep() -> Option<usize> {
    Some(4)
}

fn default_monthly_keep() -> Option<usize> {
    Some(12)
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: default_daily_keep(),
            weekly: default_weekly_keep(),
            monthly: default_monthly_keep(),
            manual: None,
        }
    }
}

impl RetentionConfig {
    pub fn keep_count(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
            Tier::Manual => self.manual,
        }
    }
}

/// Archive encryption settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Where the secret lives: `env:VAR_NAME` or `file:/path/to/secret`
    #[serde(default)]
    pub key_ref: Option<String>,
    #[serde(default = "default_memory_cost")]
    pub memory_cost: u32,
    #[serde(default = "default_time_cost")]
    pub time_cost: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_memory_cost() -> u32 {
    65536
}

fn default_time_cost() -> u32 {
    3
}

fn default_parallelism() -> u32 {
    4
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_ref: None,
            memory_cost: default_memory_cost(),
            time_cost: default_time_cost(),
            parallelism: default_parallelism(),
        }
    }
}

impl EncryptionConfig {
    /// Resolve the configured secret
    pub fn resolve_secret(&self) -> Result<String> {
        let key_ref = self
            .key_ref
            .as_deref()
            .ok_or_else(|| BackupError::config("encryption.key_ref is not set"))?;

        let secret = if let Some(var) = key_ref.strip_prefix("env:") {
            std::env::var(var).map_err(|_| {
                BackupError::config(format!("encryption secret variable {var} is not set"))
            })?
        } else if let Some(path) = key_ref.strip_prefix("file:") {
            std::fs::read_to_string(path)
                .map_err(|e| {
                    BackupError::config(format!("failed to read encryption secret {path}: {e}"))
                })?
                .trim_end()
                .to_string()
        } else {
            return Err(BackupError::config(
                "encryption.key_ref must start with 'env:' or 'file:'",
            ));
        };

        if secret.is_empty() {
            return Err(BackupError::config("encryption secret is empty"));
        }
        Ok(secret)
    }

    /// The secret for encrypting new backups and decrypting old ones
    ///
    /// Available whenever `key_ref` is set, even with encryption disabled, so
    /// backups taken before encryption was switched off stay restorable.
    pub fn key_source(&self) -> Result<Option<KeySource>> {
        if self.key_ref.is_none() {
            return Ok(None);
        }
        Ok(Some(KeySource::new(
            self.resolve_secret()?,
            self.memory_cost,
            self.time_cost,
            self.parallelism,
        )))
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Manifests, job history, schedule and destination health
    pub state_dir: PathBuf,
    /// Scratch space for archives; defaults to `<state_dir>/staging`
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    /// Glob patterns skipped when archiving directory domains
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_export_timeout")]
    pub export_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_transfer_attempts: usize,
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_poll_interval() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_export_timeout() -> u64 {
    3600
}

fn default_transfer_timeout() -> u64 {
    1800
}

fn default_max_attempts() -> usize {
    keepsafe_retry::DEFAULT_MAX_ATTEMPTS
}

impl EngineConfig {
    /// Minimal configuration rooted at `state_dir`, with no destinations or domains
    pub fn with_state_dir<P: AsRef<Path>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            staging_dir: None,
            schedule: ScheduleConfig::default(),
            retention: RetentionConfig::default(),
            compression: true,
            encryption: EncryptionConfig::default(),
            destinations: Vec::new(),
            domains: Vec::new(),
            exclude: Vec::new(),
            workers: default_workers(),
            poll_interval_secs: default_poll_interval(),
            sweep_interval_secs: default_sweep_interval(),
            export_timeout_secs: default_export_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            max_transfer_attempts: default_max_attempts(),
        }
    }

    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BackupError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&text)?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| BackupError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("staging"))
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(BackupError::config("state_dir cannot be empty"));
        }

        let mut names = HashSet::new();
        for destination in &self.destinations {
            destination.validate()?;
            if !names.insert(destination.name.as_str()) {
                return Err(BackupError::config(format!(
                    "duplicate destination name '{}'",
                    destination.name
                )));
            }
        }

        let mut names = HashSet::new();
        for domain in &self.domains {
            if domain.name.trim().is_empty() {
                return Err(BackupError::config("domain name cannot be empty"));
            }
            if domain.name.contains(['/', '\\']) || domain.name.starts_with('.') {
                return Err(BackupError::config(format!(
                    "domain name '{}' must not contain path separators or start with '.'",
                    domain.name
                )));
            }
            if !names.insert(domain.name.as_str()) {
                return Err(BackupError::config(format!(
                    "duplicate domain name '{}'",
                    domain.name
                )));
            }
        }

        self.schedule.cadences()?;

        if self.encryption.enabled && self.encryption.key_ref.is_none() {
            return Err(BackupError::config(
                "encryption is enabled but encryption.key_ref is not set",
            ));
        }

        if self.workers == 0 {
            return Err(BackupError::config("workers must be at least 1"));
        }
        if self.max_transfer_attempts == 0 {
            return Err(BackupError::config("max_transfer_attempts must be at least 1"));
        }
        Ok(())
    }
}
