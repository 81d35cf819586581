/*!
# Keepsafe Core Engine

Scheduled, verified and optionally encrypted backups of an application's
operational state, with tiered retention and staged restores.

The engine is built from a few narrow parts:

- Data domains are exported and imported through [`DomainHook`]s under a
  per-domain consistency lock
- Archives are hashed while written and optionally encrypted into a new file
- [`Destination`]s hold the copies; every copy is re-read and re-hashed
  before a backup counts as durable
- Retention keeps the newest backups per tier and never drops a manifest
  while any of its copies still exists
- Restores validate and stage everything before touching a live domain

## Usage

```rust,no_run
use keepsafe_core::{BackupEngine, EngineConfig, RestoreRequest, Tier};

# async fn run() -> keepsafe_core::Result<()> {
let config = EngineConfig::load("/etc/keepsafe/keepsafe.toml")?;
let engine = BackupEngine::from_config(config).await?;

// Back up every configured domain and wait for the verified manifest
let manifest = engine.backup_now(Tier::Manual, &[], Some("before upgrade")).await?;

// Stage it without importing anything
let report = engine
    .restore(&RestoreRequest::new(&manifest.backup_id).dry_run(true))
    .await?;
println!("{} domains would be restored", report.planned.len());
# Ok(())
# }
```
*/

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod destination;
pub mod domain;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod job;
pub mod manifest;
pub mod observability;
pub mod queue;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod store;

#[cfg(test)]
mod error_tests;
#[cfg(test)]
mod manifest_tests;

pub use config::{DestinationBackend, DestinationConfig, DomainConfig, EngineConfig, RetentionConfig};
pub use destination::{Destination, DestinationKind, DestinationSet, DestinationStatus, LocalDestination, MemoryDestination};
pub use domain::{CommandDomain, DirectoryDomain, DomainHook, DomainRegistry, ExportedArtifact, QuiesceGuard};
pub use engine::{BackupEngine, CopyVerification, JobHandle};
pub use error::{BackupError, DestinationErrorKind, Result};
pub use job::{BackupJob, JobStatus, Tier};
pub use manifest::{DestinationRef, DomainEntry, Manifest};
pub use observability::{init_observability, LogOptions};
pub use restore::{RestoreReport, RestoreRequest, RestoreScope, RestoreState};
pub use retention::{select_evictions, RetentionManager, SweepReport};
pub use schedule::{next_fire, Cadence, ScheduleTable};
pub use store::StateStore;
