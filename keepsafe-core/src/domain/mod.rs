/*!
Data domains and their export/import hooks.

A domain is an independently exportable slice of application state. The
engine never looks inside an artifact; it only asks a [`DomainHook`] to
produce one under a consistency lock and, on restore, to take one back.

Hooks are blocking calls. The engine runs them on the blocking thread pool
and holds the per-domain lock only for the duration of one hook invocation.
*/

pub mod command;
pub mod directory;

pub use command::CommandDomain;
pub use directory::DirectoryDomain;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use tracing::{debug, warn};

use crate::archive::ExcludeSet;
use crate::config::{DomainConfig, DomainHookConfig};
use crate::{BackupError, Result};

/// A file produced by an export hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Releases a domain's quiesce state when dropped
///
/// The release runs on every exit path, including a failed or panicking
/// export.
#[must_use = "dropping the guard releases the domain immediately"]
pub struct QuiesceGuard {
    domain: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl QuiesceGuard {
    pub fn new<S, F>(domain: S, release: F) -> Self
    where
        S: Into<String>,
        F: FnOnce() + Send + 'static,
    {
        Self {
            domain: domain.into(),
            release: Some(Box::new(release)),
        }
    }

    /// A guard for domains that need no quiesce step
    pub fn noop<S: Into<String>>(domain: S) -> Self {
        Self {
            domain: domain.into(),
            release: None,
        }
    }
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            debug!(domain = %self.domain, "Releasing quiesce");
            release();
        }
    }
}

impl std::fmt::Debug for QuiesceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuiesceGuard")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Export/import contract for one data domain
#[cfg_attr(test, mockall::automock)]
pub trait DomainHook: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the domain to a consistent instant until the guard is dropped
    fn quiesce(&self) -> Result<QuiesceGuard> {
        Ok(QuiesceGuard::noop(self.name()))
    }

    /// Write an artifact somewhere under `scratch_dir`
    fn export(&self, scratch_dir: &Path) -> Result<ExportedArtifact>;

    /// Replace the live domain with the contents of `artifact`
    fn import(&self, artifact: &Path) -> Result<()>;

    fn supports_undo(&self) -> bool {
        false
    }

    /// Revert the most recent import
    fn undo(&self) -> Result<()> {
        Err(BackupError::import(
            self.name(),
            "domain does not support undo",
        ))
    }

    /// Discard undo state once a restore has completed
    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

struct DomainSlot {
    hook: Arc<dyn DomainHook>,
    lock: Arc<Mutex<()>>,
}

/// Hooks for every configured domain, each paired with its consistency lock
#[derive(Default)]
pub struct DomainRegistry {
    order: Vec<String>,
    slots: HashMap<String, DomainSlot>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(domains: &[DomainConfig], exclude: &[String]) -> Result<Self> {
        let exclude = Arc::new(ExcludeSet::new(exclude));
        let mut registry = Self::new();
        for domain in domains {
            let hook: Arc<dyn DomainHook> = match &domain.hook {
                DomainHookConfig::Directory { path } => Arc::new(DirectoryDomain::new(
                    &domain.name,
                    path,
                    Arc::clone(&exclude),
                )),
                DomainHookConfig::Command { .. } => {
                    Arc::new(CommandDomain::from_config(&domain.name, &domain.hook)?)
                }
            };
            registry.register(hook)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, hook: Arc<dyn DomainHook>) -> Result<()> {
        let name = hook.name().to_string();
        if self.slots.contains_key(&name) {
            return Err(BackupError::config(format!(
                "domain '{name}' is registered twice"
            )));
        }
        self.order.push(name.clone());
        self.slots.insert(
            name,
            DomainSlot {
                hook,
                lock: Arc::new(Mutex::new(())),
            },
        );
        Ok(())
    }

    /// Domain names in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DomainHook>> {
        self.slots
            .get(name)
            .map(|slot| Arc::clone(&slot.hook))
            .ok_or_else(|| BackupError::validation(format!("unknown domain '{name}'")))
    }

    /// Order the requested domains the way they were registered
    pub fn ordered<'a, I>(&self, requested: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let requested: Vec<&String> = requested.into_iter().collect();
        for name in &requested {
            if !self.contains(name) {
                return Err(BackupError::validation(format!("unknown domain '{name}'")));
            }
        }
        Ok(self
            .order
            .iter()
            .filter(|name| requested.contains(name))
            .cloned()
            .collect())
    }

    pub(crate) fn invoker(&self, name: &str) -> Result<HookInvoker> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| BackupError::validation(format!("unknown domain '{name}'")))?;
        Ok(HookInvoker {
            domain: name.to_string(),
            hook: Arc::clone(&slot.hook),
            lock: Arc::clone(&slot.lock),
        })
    }
}

/// Owned handle for calling one domain's hooks from a blocking task
#[derive(Clone)]
pub(crate) struct HookInvoker {
    domain: String,
    hook: Arc<dyn DomainHook>,
    lock: Arc<Mutex<()>>,
}

impl HookInvoker {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn supports_undo(&self) -> bool {
        self.hook.supports_undo()
    }

    /// A hook call on this domain is still running
    pub fn is_busy(&self) -> bool {
        matches!(self.lock.try_lock(), Err(TryLockError::WouldBlock))
    }

    fn with_lock<T>(&self, f: impl FnOnce(&dyn DomainHook) -> Result<T>) -> Result<T> {
        // A poisoned lock only means an earlier hook panicked; the guard is still usable
        let _lock = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!(domain = %self.domain, "Domain is held by an earlier hook call that has not returned, waiting");
                self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
            }
        };
        f(self.hook.as_ref())
    }

    /// Quiesce, export, release. Errors are attributed to this domain.
    pub fn export(&self, scratch_dir: &Path) -> Result<ExportedArtifact> {
        self.with_lock(|hook| {
            let _guard = hook.quiesce().map_err(|e| attribute_export(&self.domain, e))?;
            hook.export(scratch_dir)
                .map_err(|e| attribute_export(&self.domain, e))
        })
    }

    pub fn import(&self, artifact: &Path) -> Result<()> {
        self.with_lock(|hook| {
            hook.import(artifact)
                .map_err(|e| attribute_import(&self.domain, e))
        })
    }

    pub fn undo(&self) -> Result<()> {
        self.with_lock(|hook| hook.undo().map_err(|e| attribute_import(&self.domain, e)))
    }

    pub fn commit(&self) {
        if let Err(e) = self.with_lock(|hook| hook.commit()) {
            warn!(domain = %self.domain, error = %e, "Failed to discard undo state");
        }
    }
}

fn attribute_export(domain: &str, err: BackupError) -> BackupError {
    match err {
        BackupError::Export { .. } => err,
        other => BackupError::export(domain, other),
    }
}

fn attribute_import(domain: &str, err: BackupError) -> BackupError {
    match err {
        BackupError::Import { .. } => err,
        other => BackupError::import(domain, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_guard_releases_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        {
            let _guard = QuiesceGuard::new("database", move || flag.store(true, Ordering::SeqCst));
            assert!(!released.load(Ordering::SeqCst));
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_export_failure_still_releases_quiesce() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);

        let mut hook = MockDomainHook::new();
        hook.expect_name().return_const("database".to_string());
        hook.expect_quiesce().times(1).return_once(move || {
            Ok(QuiesceGuard::new("database", move || {
                flag.store(true, Ordering::SeqCst)
            }))
        });
        hook.expect_export()
            .times(1)
            .returning(|_| Err(BackupError::Io(std::io::Error::other("disk full"))));

        let mut registry = DomainRegistry::new();
        registry.register(Arc::new(hook)).unwrap();

        let err = registry
            .invoker("database")
            .unwrap()
            .export(Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, BackupError::Export { ref domain, .. } if domain == "database"));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_registry_orders_requested_domains() {
        let mut registry = DomainRegistry::new();
        for name in ["database", "config", "uploads"] {
            let mut hook = MockDomainHook::new();
            hook.expect_name().return_const(name.to_string());
            registry.register(Arc::new(hook)).unwrap();
        }

        let requested = vec!["uploads".to_string(), "database".to_string()];
        assert_eq!(
            registry.ordered(&requested).unwrap(),
            vec!["database", "uploads"]
        );

        let unknown = vec!["logs".to_string()];
        assert!(registry.ordered(&unknown).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = DomainRegistry::new();
        let mut first = MockDomainHook::new();
        first.expect_name().return_const("config".to_string());
        let mut second = MockDomainHook::new();
        second.expect_name().return_const("config".to_string());

        registry.register(Arc::new(first)).unwrap();
        assert!(registry.register(Arc::new(second)).is_err());
        assert_eq!(registry.names().len(), 1);
    }
}
