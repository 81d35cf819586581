//! A domain backed by a plain directory tree

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{DomainHook, ExportedArtifact};
use crate::archive::ExcludeSet;
use crate::{BackupError, Result};

/// Archives a directory on export and swaps it in atomically on import
///
/// Import unpacks next to the live directory, moves the live tree aside and
/// renames the new one into place. The previous tree is kept until the restore
/// commits, which is what makes [`DomainHook::undo`] possible.
pub struct DirectoryDomain {
    name: String,
    root: PathBuf,
    exclude: Arc<ExcludeSet>,
    previous: Mutex<Option<PathBuf>>,
}

impl DirectoryDomain {
    pub fn new<S: Into<String>, P: AsRef<Path>>(name: S, root: P, exclude: Arc<ExcludeSet>) -> Self {
        Self {
            name: name.into(),
            root: root.as_ref().to_path_buf(),
            exclude,
            previous: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sibling(&self, suffix: &str) -> Result<PathBuf> {
        let file_name = self.root.file_name().ok_or_else(|| {
            BackupError::import(&self.name, "directory domain root has no file name")
        })?;
        let mut sibling = file_name.to_os_string();
        sibling.push(suffix);
        Ok(self.root.with_file_name(sibling))
    }

    fn previous_slot(&self) -> std::sync::MutexGuard<'_, Option<PathBuf>> {
        self.previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pack(&self, out: &Path) -> Result<u64> {
        let file = BufWriter::new(File::create(out)?);
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let relative = entry
                    .path()
                    .strip_prefix(&self.root)
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                !self.exclude.is_excluded(&relative)
            });

        let mut files = 0usize;
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| BackupError::export(&self.name, e))?;
            if entry.file_type().is_dir() {
                builder.append_dir(relative, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), relative)?;
                files += 1;
            }
        }

        let writer = builder.into_inner()?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::Io(e.into_error()))?;
        file.sync_all()?;
        debug!(domain = %self.name, files, "Packed directory");
        Ok(file.metadata()?.len())
    }
}

impl DomainHook for DirectoryDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn export(&self, scratch_dir: &Path) -> Result<ExportedArtifact> {
        if !self.root.is_dir() {
            return Err(BackupError::export(
                &self.name,
                format!("{} is not a directory", self.root.display()),
            ));
        }
        let path = scratch_dir.join(format!("{}.tar", self.name));
        let size_bytes = self.pack(&path)?;
        Ok(ExportedArtifact { path, size_bytes })
    }

    fn import(&self, artifact: &Path) -> Result<()> {
        let incoming = self.sibling(".keepsafe-incoming")?;
        let previous = self.sibling(".keepsafe-previous")?;

        if incoming.exists() {
            std::fs::remove_dir_all(&incoming)?;
        }
        std::fs::create_dir_all(&incoming)?;
        let unpacked = File::open(artifact)
            .and_then(|file| tar::Archive::new(file).unpack(&incoming));
        if let Err(e) = unpacked {
            let _ = std::fs::remove_dir_all(&incoming);
            return Err(BackupError::import(&self.name, e));
        }

        if previous.exists() {
            std::fs::remove_dir_all(&previous)?;
        }
        let had_live = self.root.exists();
        if had_live {
            std::fs::rename(&self.root, &previous)?;
        }
        if let Err(e) = std::fs::rename(&incoming, &self.root) {
            if had_live {
                std::fs::rename(&previous, &self.root)?;
            }
            return Err(BackupError::import(&self.name, e));
        }

        *self.previous_slot() = had_live.then_some(previous);
        info!(domain = %self.name, root = %self.root.display(), "Directory replaced");
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        true
    }

    fn undo(&self) -> Result<()> {
        let previous = self.previous_slot().take();
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        if let Some(previous) = previous {
            std::fs::rename(&previous, &self.root)?;
        }
        info!(domain = %self.name, "Directory import undone");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if let Some(previous) = self.previous_slot().take() {
            std::fs::remove_dir_all(previous)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("conf.d")).unwrap();
        std::fs::create_dir_all(root.join("cache")).unwrap();
        std::fs::write(root.join("app.toml"), "port = 8080").unwrap();
        std::fs::write(root.join("conf.d/extra.toml"), "debug = false").unwrap();
        std::fs::write(root.join("cache/blob"), "ephemeral").unwrap();
        std::fs::write(root.join("notes.tmp"), "scratch").unwrap();
    }

    #[test]
    fn test_export_honours_exclude() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("config");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        populate(&root);

        let exclude = Arc::new(ExcludeSet::new(["*.tmp", "cache"]));
        let domain = DirectoryDomain::new("config", &root, exclude);
        let artifact = domain.export(&scratch).unwrap();
        assert_eq!(
            artifact.size_bytes,
            std::fs::metadata(&artifact.path).unwrap().len()
        );

        let out = dir.path().join("out");
        tar::Archive::new(File::open(&artifact.path).unwrap())
            .unpack(&out)
            .unwrap();
        assert!(out.join("app.toml").exists());
        assert!(out.join("conf.d/extra.toml").exists());
        assert!(!out.join("cache").exists());
        assert!(!out.join("notes.tmp").exists());
    }

    #[test]
    fn test_import_then_undo_restores_previous_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("config");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        populate(&root);

        let domain = DirectoryDomain::new("config", &root, Arc::new(ExcludeSet::default()));
        let artifact = domain.export(&scratch).unwrap();

        std::fs::write(root.join("app.toml"), "port = 9999").unwrap();
        domain.import(&artifact.path).unwrap();
        assert_eq!(
            std::fs::read_to_string(root.join("app.toml")).unwrap(),
            "port = 8080"
        );

        domain.undo().unwrap();
        assert_eq!(
            std::fs::read_to_string(root.join("app.toml")).unwrap(),
            "port = 9999"
        );
    }

    #[test]
    fn test_commit_discards_previous_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("config");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        populate(&root);

        let domain = DirectoryDomain::new("config", &root, Arc::new(ExcludeSet::default()));
        let artifact = domain.export(&scratch).unwrap();
        domain.import(&artifact.path).unwrap();
        assert!(dir.path().join("config.keepsafe-previous").exists());

        domain.commit().unwrap();
        assert!(!dir.path().join("config.keepsafe-previous").exists());
        assert!(root.join("app.toml").exists());
    }

    #[test]
    fn test_export_of_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let domain = DirectoryDomain::new(
            "uploads",
            dir.path().join("missing"),
            Arc::new(ExcludeSet::default()),
        );
        let err = domain.export(dir.path()).unwrap_err();
        assert!(matches!(err, BackupError::Export { .. }));
    }
}
