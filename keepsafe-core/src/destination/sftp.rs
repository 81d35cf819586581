//! Remote filesystem over SFTP
//!
//! libssh2 is blocking, so every operation opens its own session on the
//! blocking thread pool. Uploads go to a temporary name and are renamed over
//! the final key.

use async_trait::async_trait;
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{object_key, Destination, DestinationKind};
use crate::error::DestinationErrorKind;
use crate::manifest::DestinationRef;
use crate::{BackupError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// libssh2 status codes
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;
const SESSION_AUTHENTICATION_FAILED: i32 = -18;

#[derive(Debug, Clone)]
pub struct SftpDestination {
    name: String,
    host: String,
    port: u16,
    user: String,
    root: PathBuf,
    identity_file: Option<PathBuf>,
}

fn classify(code: &ErrorCode) -> DestinationErrorKind {
    match code {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => DestinationErrorKind::NotFound,
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => DestinationErrorKind::Permanent,
        ErrorCode::Session(SESSION_AUTHENTICATION_FAILED) => DestinationErrorKind::Permanent,
        _ => DestinationErrorKind::Transient,
    }
}

impl SftpDestination {
    pub fn new<P: AsRef<Path>>(
        name: &str,
        host: &str,
        port: u16,
        user: &str,
        root: P,
        identity_file: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            user: user.to_string(),
            root: root.as_ref().to_path_buf(),
            identity_file,
        }
    }

    fn ssh_error(&self, op: &str, error: ssh2::Error) -> BackupError {
        BackupError::destination(
            &self.name,
            classify(&error.code()),
            format!("SFTP {op} on {}: {error}", self.host),
        )
    }

    fn connect(&self) -> Result<Sftp> {
        let address = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                BackupError::destination(
                    &self.name,
                    DestinationErrorKind::Permanent,
                    format!("cannot resolve host {}", self.host),
                )
            })?;
        let tcp = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).map_err(|e| {
            BackupError::destination(
                &self.name,
                DestinationErrorKind::Transient,
                format!("connect to {address}: {e}"),
            )
        })?;

        let mut session = Session::new().map_err(|e| self.ssh_error("session", e))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| self.ssh_error("handshake", e))?;

        let auth = match &self.identity_file {
            Some(identity) => session.userauth_pubkey_file(&self.user, None, identity, None),
            None => session.userauth_agent(&self.user),
        };
        auth.map_err(|e| {
            BackupError::destination(
                &self.name,
                DestinationErrorKind::Permanent,
                format!("SFTP authentication as {} failed: {e}", self.user),
            )
        })?;
        if !session.authenticated() {
            return Err(BackupError::destination(
                &self.name,
                DestinationErrorKind::Permanent,
                format!("SFTP authentication as {} was rejected", self.user),
            ));
        }
        session.sftp().map_err(|e| self.ssh_error("subsystem", e))
    }

    fn ensure_dir(&self, sftp: &Sftp, dir: &Path) -> Result<()> {
        let mut current = PathBuf::new();
        for component in dir.components() {
            current.push(component);
            if sftp.stat(&current).is_err() {
                if let Err(e) = sftp.mkdir(&current, 0o755) {
                    // Lost a race with another writer
                    if sftp.stat(&current).is_err() {
                        return Err(self.ssh_error("mkdir", e));
                    }
                }
            }
        }
        Ok(())
    }

    fn put_blocking(&self, backup_id: &str, archive: &Path) -> Result<DestinationRef> {
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::validation("archive path has no file name"))?;
        let key = object_key(None, backup_id, &file_name);
        let target = self.root.join(&key);
        let temp = target.with_file_name(format!(".{file_name}.partial"));

        let sftp = self.connect()?;
        if let Some(parent) = target.parent() {
            self.ensure_dir(&sftp, parent)?;
        }

        let mut source = std::fs::File::open(archive)?;
        let mut remote = sftp.create(&temp).map_err(|e| self.ssh_error("create", e))?;
        let bytes = std::io::copy(&mut source, &mut remote)?;
        remote.flush()?;
        drop(remote);

        sftp.rename(
            &temp,
            &target,
            Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
        )
        .map_err(|e| self.ssh_error("rename", e))?;
        debug!(destination = %self.name, key = %key, bytes, "Uploaded archive over SFTP");
        Ok(DestinationRef::new(&self.name, key))
    }

    fn fetch_blocking(&self, remote_path: &str, to: &Path) -> Result<()> {
        let sftp = self.connect()?;
        let mut remote = sftp
            .open(&self.root.join(remote_path))
            .map_err(|e| self.ssh_error("open", e))?;
        let mut local = std::fs::File::create(to)?;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = remote.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            local.write_all(&buffer[..read])?;
        }
        local.sync_all()?;
        Ok(())
    }

    fn list_blocking(&self) -> Result<Vec<DestinationRef>> {
        let sftp = self.connect()?;
        let backups = self.root.join("backups");
        let entries = match sftp.readdir(&backups) {
            Ok(entries) => entries,
            Err(e) if classify(&e.code()) == DestinationErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.ssh_error("readdir", e)),
        };

        let mut refs = Vec::new();
        for (dir, stat) in entries {
            if !stat.is_dir() {
                continue;
            }
            let files = sftp.readdir(&dir).map_err(|e| self.ssh_error("readdir", e))?;
            for (path, stat) in files {
                let hidden = path
                    .file_name()
                    .map_or(true, |n| n.to_string_lossy().starts_with('.'));
                if !stat.is_file() || hidden {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    refs.push(DestinationRef::new(
                        &self.name,
                        relative.to_string_lossy().into_owned(),
                    ));
                }
            }
        }
        refs.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
        Ok(refs)
    }

    fn delete_blocking(&self, remote_path: &str) -> Result<()> {
        let sftp = self.connect()?;
        let path = self.root.join(remote_path);
        match sftp.unlink(&path) {
            Ok(()) => {}
            Err(e) if classify(&e.code()) == DestinationErrorKind::NotFound => {}
            Err(e) => return Err(self.ssh_error("unlink", e)),
        }
        if let Some(parent) = path.parent() {
            let _ = sftp.rmdir(parent);
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SftpDestination) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| BackupError::validation(format!("SFTP task failed: {e}")))?
    }
}

#[async_trait]
impl Destination for SftpDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Remote
    }

    async fn put(&self, backup_id: &str, archive: &Path) -> Result<DestinationRef> {
        info!(destination = %self.name, host = %self.host, backup_id, "Uploading archive over SFTP");
        let backup_id = backup_id.to_string();
        let archive = archive.to_path_buf();
        self.blocking(move |this| this.put_blocking(&backup_id, &archive))
            .await
    }

    async fn fetch(&self, reference: &DestinationRef, to: &Path) -> Result<()> {
        let remote_path = reference.remote_path.clone();
        let to = to.to_path_buf();
        self.blocking(move |this| this.fetch_blocking(&remote_path, &to))
            .await
    }

    async fn list(&self) -> Result<Vec<DestinationRef>> {
        self.blocking(|this| this.list_blocking()).await
    }

    async fn delete(&self, reference: &DestinationRef) -> Result<()> {
        let remote_path = reference.remote_path.clone();
        self.blocking(move |this| this.delete_blocking(&remote_path))
            .await
    }
}
