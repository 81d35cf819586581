/*!
Local filesystem destination.

Archives land at `<root>/backups/<backup_id>/<file>`. Each put copies into a
temporary file in the target directory and renames it into place, so a
half-written copy is never visible under the final name.
*/

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{object_key, Destination, DestinationKind};
use crate::error::DestinationErrorKind;
use crate::integrity::hash_file;
use crate::manifest::DestinationRef;
use crate::{BackupError, Result};

/// Destination on a locally mounted filesystem
#[derive(Debug, Clone)]
pub struct LocalDestination {
    name: String,
    root: PathBuf,
}

impl LocalDestination {
    /// Create the destination, creating `root` if it does not exist
    pub fn new<S: Into<String>, P: AsRef<Path>>(name: S, root: P) -> Result<Self> {
        let name = name.into();
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            BackupError::destination(
                &name,
                DestinationErrorKind::Permanent,
                format!("Failed to create directory {}: {e}", root.display()),
            )
        })?;
        Ok(Self { name, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote_path: &str) -> Result<PathBuf> {
        let relative = Path::new(remote_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(BackupError::destination(
                &self.name,
                DestinationErrorKind::Permanent,
                format!("refusing path outside destination root: {remote_path}"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn put_blocking(&self, backup_id: &str, archive: &Path) -> Result<DestinationRef> {
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::validation("archive path has no file name"))?;
        let key = object_key(None, backup_id, &file_name);
        let target = self.resolve(&key)?;
        let parent = target
            .parent()
            .ok_or_else(|| BackupError::validation("object key has no parent"))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let mut source = fs::File::open(archive)?;
        let copied = std::io::copy(&mut source, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| BackupError::Io(e.error))?;

        debug!(destination = %self.name, key = %key, bytes = copied, "Stored archive");
        Ok(DestinationRef::new(&self.name, key))
    }
}

#[async_trait]
impl Destination for LocalDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Local
    }

    async fn put(&self, backup_id: &str, archive: &Path) -> Result<DestinationRef> {
        info!(destination = %self.name, backup_id, "Copying archive to local destination");
        let this = self.clone();
        let backup_id = backup_id.to_string();
        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || this.put_blocking(&backup_id, &archive))
            .await
            .map_err(|e| BackupError::validation(format!("put task failed: {e}")))?
    }

    async fn fetch(&self, reference: &DestinationRef, to: &Path) -> Result<()> {
        let source = self.resolve(&reference.remote_path)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(BackupError::destination(
                &self.name,
                DestinationErrorKind::NotFound,
                format!("{} does not exist", reference.remote_path),
            ));
        }
        tokio::fs::copy(&source, to).await?;
        Ok(())
    }

    async fn verify(&self, reference: &DestinationRef, expected_checksum: &str) -> Result<bool> {
        let path = self.resolve(&reference.remote_path)?;
        let actual = tokio::task::spawn_blocking(move || hash_file(path))
            .await
            .map_err(|e| BackupError::validation(format!("verify task failed: {e}")))??;
        Ok(actual.eq_ignore_ascii_case(expected_checksum))
    }

    async fn list(&self) -> Result<Vec<DestinationRef>> {
        let backups = self.root.join("backups");
        if !backups.is_dir() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        for entry in WalkDir::new(&backups)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            // Skip in-flight temp files
            if entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                refs.push(DestinationRef::new(
                    &self.name,
                    relative.to_string_lossy().replace('\\', "/"),
                ));
            }
        }
        Ok(refs)
    }

    async fn delete(&self, reference: &DestinationRef) -> Result<()> {
        let path = self.resolve(&reference.remote_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop the per-backup directory once it is empty
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalDestination, PathBuf) {
        let dir = TempDir::new().unwrap();
        let destination = LocalDestination::new("primary", dir.path().join("dest")).unwrap();
        let archive = dir.path().join("archive.tar.gz");
        std::fs::write(&archive, b"archive bytes").unwrap();
        (dir, destination, archive)
    }

    #[tokio::test]
    async fn test_put_verify_fetch_delete() {
        let (dir, destination, archive) = setup();

        let reference = destination.put("daily-1", &archive).await.unwrap();
        assert_eq!(reference.remote_path, "backups/daily-1/archive.tar.gz");
        assert!(destination
            .verify(&reference, &hash_bytes(b"archive bytes"))
            .await
            .unwrap());
        assert!(!destination.verify(&reference, "00").await.unwrap());

        let fetched = dir.path().join("fetched");
        destination.fetch(&reference, &fetched).await.unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"archive bytes");

        destination.delete(&reference).await.unwrap();
        assert!(destination.list().await.unwrap().is_empty());
        // Deleting again is fine
        destination.delete(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_twice_keeps_one_object() {
        let (_dir, destination, archive) = setup();

        let first = destination.put("daily-1", &archive).await.unwrap();
        let second = destination.put("daily-1", &archive).await.unwrap();
        assert_eq!(first.remote_path, second.remote_path);
        assert_eq!(destination.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let (dir, destination, _archive) = setup();
        let reference = DestinationRef::new("primary", "backups/missing/archive.tar");
        let err = destination
            .fetch(&reference, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (dir, destination, _archive) = setup();
        let reference = DestinationRef::new("primary", "../outside");
        assert!(destination
            .fetch(&reference, &dir.path().join("out"))
            .await
            .is_err());
    }
}
