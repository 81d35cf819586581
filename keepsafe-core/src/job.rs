/*!
Backup jobs and their lifecycle.

A job moves `pending -> running -> succeeded | failed`; a pending job can also
fail straight away when it is rejected before it starts. Only the coordinator
drives transitions.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{BackupError, Result};

/// Retention class of a backup
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
    Manual,
}

impl Tier {
    /// Tiers driven by a cadence
    pub const SCHEDULED: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    pub const ALL: [Tier; 4] = [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Manual];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Manual => "manual",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            "manual" => Ok(Tier::Manual),
            other => Err(BackupError::validation(format!("unknown tier '{other}'"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One execution of the backup pipeline
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupJob {
    pub id: String,
    pub tier: Tier,
    pub triggered_at: DateTime<Utc>,
    /// Domains covered by this job, in sorted order
    pub domains: BTreeSet<String>,
    pub status: JobStatus,
    /// Operator-supplied label for manual backups
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    pub fn new<I, S>(tier: Tier, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            tier,
            triggered_at: Utc::now(),
            domains: domains.into_iter().map(Into::into).collect(),
            status: JobStatus::Pending,
            name: None,
            failure: None,
            backup_id: None,
            finished_at: None,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_triggered_at(mut self, triggered_at: DateTime<Utc>) -> Self {
        self.triggered_at = triggered_at;
        self
    }

    /// Comma-separated domain list for logs and errors
    pub fn domain_list(&self) -> String {
        self.domains.iter().cloned().collect::<Vec<_>>().join(", ")
    }

    pub(crate) fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BackupError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn fail<S: Into<String>>(&mut self, reason: S) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending_with_sorted_domains() {
        let job = BackupJob::new(Tier::Daily, ["config", "database"]);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.domain_list(), "config, database");
        assert!(!job.id.is_empty());
    }

    #[test]
    fn test_allowed_transitions() {
        let mut job = BackupJob::new(Tier::Manual, ["database"]);
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Succeeded).unwrap();
        assert!(job.finished_at.is_some());

        let mut rejected = BackupJob::new(Tier::Manual, ["database"]);
        rejected.fail("conflict").unwrap();
        assert_eq!(rejected.status, JobStatus::Failed);
        assert_eq!(rejected.failure.as_deref(), Some("conflict"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = BackupJob::new(Tier::Weekly, ["database"]);
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Failed).unwrap();

        let err = job.transition(JobStatus::Running).unwrap_err();
        assert!(matches!(err, BackupError::InvalidTransition { .. }));
        assert!(job.transition(JobStatus::Succeeded).is_err());
    }

    #[test]
    fn test_pending_cannot_succeed_directly() {
        let mut job = BackupJob::new(Tier::Daily, ["database"]);
        assert!(job.transition(JobStatus::Succeeded).is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("Weekly".parse::<Tier>().unwrap(), Tier::Weekly);
        assert!("hourly".parse::<Tier>().is_err());
        assert_eq!(
            serde_json::to_string(&Tier::Monthly).unwrap(),
            "\"monthly\""
        );
    }
}
