//! Job de-duplication and the worker queue
//!
//! A job claims its domain set when it is submitted and holds the claim until
//! it reaches a terminal state. Claims on overlapping domain sets conflict.
//! With a state store attached the claim also covers every other process on
//! the same state dir, so a manual `create` and the daemon never overlap.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::job::BackupJob;
use crate::manifest::Manifest;
use crate::store::{DomainClaims, StateStore};
use crate::{BackupError, Result};

#[derive(Debug)]
struct Claim {
    job_id: String,
    domains: BTreeSet<String>,
}

/// Registry of domain sets held by pending or running jobs
#[derive(Clone, Default)]
pub struct InFlightJobs {
    claims: Arc<Mutex<Vec<Claim>>>,
    store: Option<Arc<StateStore>>,
}

impl std::fmt::Debug for InFlightJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightJobs")
            .field("claims", &self.claims)
            .field("shared", &self.store.is_some())
            .finish()
    }
}

impl InFlightJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also claim domains in `store`, visible to other processes
    pub fn with_store(store: Arc<StateStore>) -> Self {
        Self {
            claims: Arc::default(),
            store: Some(store),
        }
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, Vec<Claim>> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the job's domains, or fail with `JobConflict` if any is held
    pub fn claim(&self, job: &BackupJob) -> Result<JobClaim> {
        let mut claims = self.claims();
        if let Some(holder) = claims
            .iter()
            .find(|c| !c.domains.is_disjoint(&job.domains))
        {
            return Err(BackupError::JobConflict {
                domains: job.domain_list(),
                running_job: holder.job_id.clone(),
            });
        }
        let shared = match &self.store {
            Some(store) => Some(store.claim_domains(&job.id, &job.domains)?),
            None => None,
        };
        claims.push(Claim {
            job_id: job.id.clone(),
            domains: job.domains.clone(),
        });
        Ok(JobClaim {
            registry: self.clone(),
            job_id: job.id.clone(),
            _shared: shared,
        })
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.claims().iter().map(|c| c.job_id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.claims().is_empty()
    }
}

/// Held for as long as the job is in flight; dropping it releases the domains
#[derive(Debug)]
#[must_use]
pub struct JobClaim {
    registry: InFlightJobs,
    job_id: String,
    _shared: Option<DomainClaims>,
}

impl JobClaim {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        self.registry.claims().retain(|c| c.job_id != self.job_id);
    }
}

/// A claimed job waiting for a worker
#[derive(Debug)]
pub struct QueuedJob {
    pub job: BackupJob,
    pub claim: JobClaim,
    pub cancel: CancellationToken,
    /// Receives the job's outcome once it is terminal
    pub reply: Option<oneshot::Sender<Result<Manifest>>>,
}

/// Multi-consumer job queue shared by the worker pool
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    pub fn push(&self, job: QueuedJob) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|_| BackupError::validation("job queue is closed"))
    }

    /// Wait for the next job; workers take turns on the receiver
    pub async fn next(&self) -> Option<QueuedJob> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Tier;

    fn job(domains: &[&str]) -> BackupJob {
        BackupJob::new(Tier::Manual, domains.iter().map(|d| d.to_string()))
    }

    #[test]
    fn test_same_domain_set_conflicts() {
        let jobs = InFlightJobs::new();
        let first = job(&["database", "config"]);
        let second = job(&["config", "database"]);

        let claim = jobs.claim(&first).unwrap();
        match jobs.claim(&second).unwrap_err() {
            BackupError::JobConflict { running_job, .. } => assert_eq!(running_job, first.id),
            other => panic!("expected JobConflict, got {other:?}"),
        }

        drop(claim);
        assert!(jobs.claim(&second).is_ok());
    }

    #[test]
    fn test_overlapping_sets_conflict_disjoint_sets_do_not() {
        let jobs = InFlightJobs::new();
        let _db = jobs.claim(&job(&["database"])).unwrap();
        assert!(jobs.claim(&job(&["database", "reports"])).is_err());

        let reports = jobs.claim(&job(&["reports"])).unwrap();
        assert_eq!(jobs.job_ids().len(), 2);
        drop(reports);
        assert_eq!(jobs.job_ids().len(), 1);
    }

    #[test]
    fn test_concurrent_claims_admit_exactly_one() {
        let jobs = InFlightJobs::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let jobs = jobs.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    jobs.claim(&job(&["database", "config"]))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, BackupError::JobConflict { .. })));
    }

    #[test]
    fn test_claims_are_shared_through_the_state_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let daemon = InFlightJobs::with_store(Arc::new(StateStore::open(dir.path()).unwrap()));
        let cli = InFlightJobs::with_store(Arc::new(StateStore::open(dir.path()).unwrap()));

        let scheduled = job(&["database"]);
        let claim = daemon.claim(&scheduled).unwrap();
        match cli.claim(&job(&["database", "config"])).unwrap_err() {
            BackupError::JobConflict { running_job, .. } => assert_eq!(running_job, scheduled.id),
            other => panic!("expected JobConflict, got {other:?}"),
        }
        assert!(cli.is_empty());

        // Disjoint sets still run side by side
        let reports = cli.claim(&job(&["reports"])).unwrap();
        drop(reports);

        drop(claim);
        assert!(cli.claim(&job(&["database", "config"])).is_ok());
    }

    #[tokio::test]
    async fn test_queue_delivers_in_order() {
        let jobs = InFlightJobs::new();
        let queue = JobQueue::new();
        for domain in ["a", "b"] {
            let job = job(&[domain]);
            let claim = jobs.claim(&job).unwrap();
            queue
                .push(QueuedJob {
                    job,
                    claim,
                    cancel: CancellationToken::new(),
                    reply: None,
                })
                .unwrap();
        }
        let first = queue.next().await.unwrap();
        assert_eq!(first.job.domain_list(), "a");
        let second = queue.next().await.unwrap();
        assert_eq!(second.job.domain_list(), "b");
    }
}
