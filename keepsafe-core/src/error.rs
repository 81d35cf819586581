/*!
Error types for the Keepsafe core engine.

Every failure names where it came from: the domain whose hook failed, the
destination that rejected a transfer, the artifact whose checksum did not match.
*/

use keepsafe_retry::RetryableError;
use std::fmt;
use thiserror::Error;

/// Result type used throughout the Keepsafe core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// How a destination failure should be treated by the retry layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationErrorKind {
    /// Network errors, throttling, server-side 5xx
    Transient,
    /// Authentication, permissions, misconfiguration
    Permanent,
    /// The object does not exist at the destination
    NotFound,
}

impl fmt::Display for DestinationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationErrorKind::Transient => write!(f, "transient"),
            DestinationErrorKind::Permanent => write!(f, "permanent"),
            DestinationErrorKind::NotFound => write!(f, "not found"),
        }
    }
}

/// Errors that can occur during backup, retention and restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Another job for an overlapping domain set is already in flight
    #[error("Job conflict: a job for domains [{domains}] is already in flight ({running_job})")]
    JobConflict { domains: String, running_job: String },

    /// A domain export hook failed
    #[error("Export of domain '{domain}' failed: {cause}")]
    Export { domain: String, cause: String },

    /// A domain import hook failed
    #[error("Import of domain '{domain}' failed: {cause}")]
    Import { domain: String, cause: String },

    /// Transfer, verify, list or delete failure at a destination
    #[error("Destination '{destination}' error ({kind}): {cause}")]
    Destination {
        destination: String,
        kind: DestinationErrorKind,
        cause: String,
    },

    /// Checksum mismatch anywhere in the pipeline
    #[error("Integrity check failed for {context}: expected {expected}, got {actual}")]
    Integrity {
        context: String,
        expected: String,
        actual: String,
    },

    /// No destination holds a verified copy of the backup
    #[error("Job {job_id} has no durable copy: {}", .failures.join("; "))]
    NoDurableCopy { job_id: String, failures: Vec<String> },

    /// Some but not all domains were restored
    #[error(
        "Partial restore of backup {backup_id}: restored [{}], failed on '{failed_domain}': {cause}",
        .succeeded.join(", ")
    )]
    PartialRestore {
        backup_id: String,
        succeeded: Vec<String>,
        failed_domain: String,
        cause: String,
    },

    /// No manifest exists for the requested backup
    #[error("Backup not found: {0}")]
    ManifestNotFound(String),

    /// Job was cancelled before all domains were exported
    #[error("Job {0} was cancelled")]
    Cancelled(String),

    /// A hook or transfer exceeded its time budget
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// A state machine was asked to make a transition it does not allow
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Encryption, decryption or key derivation failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl BackupError {
    /// Create a new export error
    pub fn export<D: Into<String>, C: fmt::Display>(domain: D, cause: C) -> Self {
        Self::Export {
            domain: domain.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a new import error
    pub fn import<D: Into<String>, C: fmt::Display>(domain: D, cause: C) -> Self {
        Self::Import {
            domain: domain.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a new destination error
    pub fn destination<D: Into<String>, C: fmt::Display>(
        destination: D,
        kind: DestinationErrorKind,
        cause: C,
    ) -> Self {
        Self::Destination {
            destination: destination.into(),
            kind,
            cause: cause.to_string(),
        }
    }

    /// Create a new integrity error
    pub fn integrity<S1, S2, S3>(context: S1, expected: S2, actual: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Integrity {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a new crypto error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// True when a destination reported the object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackupError::Destination {
                kind: DestinationErrorKind::NotFound,
                ..
            }
        )
    }

    /// Attach a destination name to an error raised without one
    pub(crate) fn at_destination(self, name: &str) -> Self {
        match self {
            BackupError::Io(e) => {
                let kind = match e.kind() {
                    std::io::ErrorKind::NotFound => DestinationErrorKind::NotFound,
                    std::io::ErrorKind::PermissionDenied => DestinationErrorKind::Permanent,
                    _ => DestinationErrorKind::Transient,
                };
                BackupError::destination(name, kind, e)
            }
            BackupError::Timeout { operation, seconds } => BackupError::destination(
                name,
                DestinationErrorKind::Transient,
                format!("{operation} timed out after {seconds}s"),
            ),
            other => other,
        }
    }
}

impl RetryableError for BackupError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            BackupError::Destination {
                kind: DestinationErrorKind::Transient,
                ..
            }
        )
    }
}
