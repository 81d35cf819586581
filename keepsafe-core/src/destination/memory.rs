//! In-process destination used by tests and dry runs
//!
//! Keeps objects in a map and can be told to misbehave: fail puts transiently,
//! reject them outright, stall, hand back corrupted bytes or refuse deletes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{object_key, Destination, DestinationKind};
use crate::error::DestinationErrorKind;
use crate::integrity::hash_bytes;
use crate::manifest::DestinationRef;
use crate::{BackupError, Result};

#[derive(Debug, Default)]
pub struct MemoryDestination {
    name: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    transient_put_failures: AtomicUsize,
    put_attempts: AtomicUsize,
    deny_puts: AtomicBool,
    corrupt: AtomicBool,
    fail_deletes: AtomicBool,
    put_delay: Mutex<Option<Duration>>,
}

impl MemoryDestination {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` puts fail with a transient error
    pub fn fail_next_puts(&self, count: usize) {
        self.transient_put_failures.store(count, Ordering::SeqCst);
    }

    /// Every put fails with a permanent error
    pub fn deny_puts(&self, deny: bool) {
        self.deny_puts.store(deny, Ordering::SeqCst);
    }

    /// Stored objects read back with a flipped byte
    pub fn corrupt_stored_objects(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    /// Every put sleeps this long before storing anything
    pub fn delay_puts(&self, delay: Option<Duration>) {
        *self
            .put_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects().contains_key(key)
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let mut data = self.objects().get(key).cloned().ok_or_else(|| {
            BackupError::destination(&self.name, DestinationErrorKind::NotFound, key)
        })?;
        if self.corrupt.load(Ordering::SeqCst) {
            match data.first_mut() {
                Some(byte) => *byte ^= 0xff,
                None => data.push(0),
            }
        }
        Ok(data)
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Local
    }

    async fn put(&self, backup_id: &str, archive: &Path) -> Result<DestinationRef> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .put_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny_puts.load(Ordering::SeqCst) {
            return Err(BackupError::destination(
                &self.name,
                DestinationErrorKind::Permanent,
                "access denied",
            ));
        }
        let remaining = self.transient_put_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_put_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BackupError::destination(
                &self.name,
                DestinationErrorKind::Transient,
                "connection reset",
            ));
        }

        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::validation("archive path has no file name"))?;
        let data = tokio::fs::read(archive).await?;
        let key = object_key(None, backup_id, &file_name);
        self.objects().insert(key.clone(), data);
        Ok(DestinationRef::new(&self.name, key))
    }

    async fn fetch(&self, reference: &DestinationRef, to: &Path) -> Result<()> {
        let data = self.read(&reference.remote_path)?;
        tokio::fs::write(to, data).await?;
        Ok(())
    }

    async fn verify(&self, reference: &DestinationRef, expected_checksum: &str) -> Result<bool> {
        let data = self.read(&reference.remote_path)?;
        Ok(hash_bytes(&data).eq_ignore_ascii_case(expected_checksum))
    }

    async fn list(&self) -> Result<Vec<DestinationRef>> {
        Ok(self
            .objects()
            .keys()
            .map(|key| DestinationRef::new(&self.name, key))
            .collect())
    }

    async fn delete(&self, reference: &DestinationRef) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackupError::destination(
                &self.name,
                DestinationErrorKind::Permanent,
                "delete refused",
            ));
        }
        self.objects().remove(&reference.remote_path);
        Ok(())
    }
}
