//! A domain driven by external shell commands
//!
//! Commands run through `sh -c` with `KEEPSAFE_DOMAIN` and `KEEPSAFE_ARTIFACT`
//! in their environment. Export writes the artifact to that path; import reads
//! it from there.

use std::path::Path;
use std::process::Command;
use tracing::{debug, error};

use super::{DomainHook, ExportedArtifact, QuiesceGuard};
use crate::config::DomainHookConfig;
use crate::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct CommandDomain {
    name: String,
    export: String,
    import: String,
    undo: Option<String>,
    quiesce: Option<String>,
    release: Option<String>,
    artifact: String,
}

impl CommandDomain {
    pub fn new<S1, S2, S3>(name: S1, export: S2, import: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        let name = name.into();
        Self {
            artifact: format!("{name}.dump"),
            name,
            export: export.into(),
            import: import.into(),
            undo: None,
            quiesce: None,
            release: None,
        }
    }

    pub fn from_config(name: &str, config: &DomainHookConfig) -> Result<Self> {
        match config {
            DomainHookConfig::Command {
                export,
                import,
                undo,
                quiesce,
                release,
                artifact,
            } => {
                let mut domain = Self::new(name, export, import);
                domain.undo = undo.clone();
                domain.quiesce = quiesce.clone();
                domain.release = release.clone();
                if let Some(artifact) = artifact {
                    if artifact.contains('/') || artifact.is_empty() {
                        return Err(BackupError::config(format!(
                            "domain '{name}': artifact must be a plain file name"
                        )));
                    }
                    domain.artifact = artifact.clone();
                }
                Ok(domain)
            }
            DomainHookConfig::Directory { .. } => Err(BackupError::config(format!(
                "domain '{name}' is not a command domain"
            ))),
        }
    }

    pub fn with_undo<S: Into<String>>(mut self, undo: S) -> Self {
        self.undo = Some(undo.into());
        self
    }

    pub fn with_quiesce<S1: Into<String>, S2: Into<String>>(mut self, quiesce: S1, release: S2) -> Self {
        self.quiesce = Some(quiesce.into());
        self.release = Some(release.into());
        self
    }
}

fn run_shell(domain: &str, script: &str, artifact: Option<&Path>) -> std::result::Result<(), String> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script).env("KEEPSAFE_DOMAIN", domain);
    if let Some(artifact) = artifact {
        command.env("KEEPSAFE_ARTIFACT", artifact);
    }

    debug!(domain, script, "Running hook command");
    let output = command
        .output()
        .map_err(|e| format!("failed to spawn `{script}`: {e}"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr.trim();
    Err(match output.status.code() {
        Some(code) if detail.is_empty() => format!("`{script}` exited with status {code}"),
        Some(code) => format!("`{script}` exited with status {code}: {detail}"),
        None => format!("`{script}` was terminated by a signal"),
    })
}

impl DomainHook for CommandDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn quiesce(&self) -> Result<QuiesceGuard> {
        let Some(quiesce) = &self.quiesce else {
            return Ok(QuiesceGuard::noop(&self.name));
        };
        run_shell(&self.name, quiesce, None).map_err(|e| BackupError::export(&self.name, e))?;

        match self.release.clone() {
            Some(release) => {
                let domain = self.name.clone();
                Ok(QuiesceGuard::new(self.name.clone(), move || {
                    if let Err(e) = run_shell(&domain, &release, None) {
                        error!(domain = %domain, error = %e, "Release command failed");
                    }
                }))
            }
            None => Ok(QuiesceGuard::noop(&self.name)),
        }
    }

    fn export(&self, scratch_dir: &Path) -> Result<ExportedArtifact> {
        let path = scratch_dir.join(&self.artifact);
        run_shell(&self.name, &self.export, Some(&path))
            .map_err(|e| BackupError::export(&self.name, e))?;

        let metadata = std::fs::metadata(&path).map_err(|e| {
            BackupError::export(
                &self.name,
                format!("export command produced no artifact at {}: {e}", path.display()),
            )
        })?;
        Ok(ExportedArtifact {
            path,
            size_bytes: metadata.len(),
        })
    }

    fn import(&self, artifact: &Path) -> Result<()> {
        run_shell(&self.name, &self.import, Some(artifact))
            .map_err(|e| BackupError::import(&self.name, e))
    }

    fn supports_undo(&self) -> bool {
        self.undo.is_some()
    }

    fn undo(&self) -> Result<()> {
        let undo = self
            .undo
            .as_deref()
            .ok_or_else(|| BackupError::import(&self.name, "domain does not support undo"))?;
        run_shell(&self.name, undo, None).map_err(|e| BackupError::import(&self.name, e))
    }
}
