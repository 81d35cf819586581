/*!
Backup manifests.

A manifest is written exactly once, after a job has at least one verified
destination copy, and is never modified afterwards. It is the only record of
what a backup contains and where its copies live.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, DerivedKey, EncryptionEnvelope};
use crate::integrity;
use crate::job::Tier;
use crate::{BackupError, Result};

/// Current manifest format version for compatibility tracking
pub const MANIFEST_FORMAT_VERSION: u8 = 1;

/// One exported domain inside the archive
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DomainEntry {
    pub domain: String,
    /// Path of the artifact inside the archive
    pub artifact_path: String,
    pub size_bytes: u64,
    /// SHA-256 of the artifact as exported
    pub checksum: String,
}

/// Location of one stored copy of an archive
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DestinationRef {
    pub destination_name: String,
    pub remote_path: String,
    /// Set once the stored object has been re-read and its hash confirmed
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

impl DestinationRef {
    pub fn new<S1: Into<String>, S2: Into<String>>(destination_name: S1, remote_path: S2) -> Self {
        Self {
            destination_name: destination_name.into(),
            remote_path: remote_path.into(),
            verified_at: None,
        }
    }

    pub fn verified(mut self, at: DateTime<Utc>) -> Self {
        self.verified_at = Some(at);
        self
    }

    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

/// Metadata describing one completed backup
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub format_version: u8,
    pub backup_id: String,
    pub job_id: String,
    pub tier: Tier,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Domains in capture order
    pub domains: Vec<DomainEntry>,
    /// Size of the plaintext archive
    pub total_size_bytes: u64,
    /// SHA-256 of the plaintext archive
    pub checksum: String,
    /// SHA-256 of the object as stored at destinations (ciphertext when encrypted)
    pub stored_checksum: String,
    pub stored_size_bytes: u64,
    pub compressed: bool,
    pub encrypted: bool,
    #[serde(default)]
    pub encryption: Option<EncryptionEnvelope>,
    pub destinations: Vec<DestinationRef>,
    /// HMAC over every other field, present when a secret is configured
    #[serde(default)]
    pub signature: Option<String>,
}

impl Manifest {
    /// File name of the archive as stored at destinations
    pub fn archive_file_name(&self) -> String {
        archive_file_name(self.compressed, self.encrypted)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.domain.clone()).collect()
    }

    pub fn verified_refs(&self) -> impl Iterator<Item = &DestinationRef> {
        self.destinations.iter().filter(|r| r.is_verified())
    }

    /// At least one destination holds a verified copy
    pub fn is_durable(&self) -> bool {
        self.verified_refs().next().is_some()
    }

    /// Check if this manifest is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= MANIFEST_FORMAT_VERSION
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.backup_id.is_empty() {
            return Err(BackupError::validation("backup_id cannot be empty"));
        }
        if self.checksum.is_empty() || self.stored_checksum.is_empty() {
            return Err(BackupError::validation("manifest checksums cannot be empty"));
        }
        if self.domains.is_empty() {
            return Err(BackupError::validation("manifest lists no domains"));
        }
        if self.encrypted != self.encryption.is_some() {
            return Err(BackupError::validation(
                "encrypted flag and encryption envelope disagree",
            ));
        }
        if !self.is_durable() {
            return Err(BackupError::validation(
                "manifest has no verified destination copy",
            ));
        }
        Ok(())
    }

    /// Bytes covered by the signature: the manifest serialized without it
    fn signing_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn sign(&mut self, key: &DerivedKey) -> Result<()> {
        let payload = self.signing_payload()?;
        self.signature = Some(crypto::sign(key, &payload)?);
        Ok(())
    }

    /// Check the signature; unsigned manifests pass
    pub fn verify_signature(&self, key: &DerivedKey) -> Result<()> {
        match &self.signature {
            Some(signature) => crypto::verify_signature(key, &self.signing_payload()?, signature),
            None => Ok(()),
        }
    }

    /// Check a plaintext archive against the recorded checksum
    pub fn verify_archive(&self, actual_checksum: &str) -> Result<()> {
        integrity::verify_checksum(
            &format!("archive of backup {}", self.backup_id),
            &self.checksum,
            actual_checksum,
        )
    }
}

pub fn archive_file_name(compressed: bool, encrypted: bool) -> String {
    let mut name = String::from("archive.tar");
    if compressed {
        name.push_str(".gz");
    }
    if encrypted {
        name.push_str(".enc");
    }
    name
}

/// Short human-readable identifier for a new backup
pub fn new_backup_id(tier: Tier, created_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        tier,
        created_at.format("%Y%m%dT%H%M%SZ"),
        &suffix[..8]
    )
}
