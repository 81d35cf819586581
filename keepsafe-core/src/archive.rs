/*!
Archive assembly and extraction.

Exported domain artifacts are streamed straight into a tar archive, optionally
gzip-compressed. Both the per-artifact checksum and the checksum of the archive
file itself are computed on the way through, so every byte is read once.
*/

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::integrity::{HashingReader, HashingWriter};
use crate::manifest::DomainEntry;
use crate::{BackupError, Result};

enum ArchiveSink {
    Plain(HashingWriter<BufWriter<File>>),
    Gzip(GzEncoder<HashingWriter<BufWriter<File>>>),
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArchiveSink::Plain(w) => w.write(buf),
            ArchiveSink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArchiveSink::Plain(w) => w.flush(),
            ArchiveSink::Gzip(w) => w.flush(),
        }
    }
}

/// A finished archive file on disk
#[derive(Debug, Clone)]
pub struct SealedArchive {
    pub path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
    pub entries: Vec<DomainEntry>,
}

/// Incrementally built backup archive
pub struct ArchiveWriter {
    builder: tar::Builder<ArchiveSink>,
    path: PathBuf,
    entries: Vec<DomainEntry>,
}

impl ArchiveWriter {
    pub fn create<P: AsRef<Path>>(path: P, compressed: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().write(true).create_new(true).open(&path)?;
        let hashing = HashingWriter::new(BufWriter::new(file));
        let sink = if compressed {
            ArchiveSink::Gzip(GzEncoder::new(hashing, Compression::default()))
        } else {
            ArchiveSink::Plain(hashing)
        };
        Ok(Self {
            builder: tar::Builder::new(sink),
            path,
            entries: Vec::new(),
        })
    }

    pub fn entries(&self) -> &[DomainEntry] {
        &self.entries
    }

    /// Copy one exported artifact into the archive under `domains/<domain>/`
    pub fn append_artifact(
        &mut self,
        domain: &str,
        artifact: &Path,
        reported_size: u64,
    ) -> Result<DomainEntry> {
        let file = File::open(artifact)
            .map_err(|e| BackupError::export(domain, format!("cannot open artifact: {e}")))?;
        let size = file.metadata()?.len();
        if size != reported_size {
            return Err(BackupError::export(
                domain,
                format!("hook reported {reported_size} bytes but artifact has {size}"),
            ));
        }

        let file_name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let artifact_path = format!("domains/{domain}/{file_name}");

        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o600);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_entry_type(tar::EntryType::Regular);

        let mut reader = HashingReader::new(BufReader::new(file).take(size));
        self.builder
            .append_data(&mut header, &artifact_path, &mut reader)?;
        let (checksum, copied) = reader.finalize();
        if copied != size {
            return Err(BackupError::export(
                domain,
                format!("artifact shrank while archiving ({copied} of {size} bytes)"),
            ));
        }

        let entry = DomainEntry {
            domain: domain.to_string(),
            artifact_path,
            size_bytes: size,
            checksum,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Write the tar trailer, flush compression and sync the file
    pub fn finish(self) -> Result<SealedArchive> {
        let sink = self.builder.into_inner()?;
        let hashing = match sink {
            ArchiveSink::Plain(w) => w,
            ArchiveSink::Gzip(encoder) => encoder.finish()?,
        };
        let (writer, checksum, size_bytes) = hashing.finalize();
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::Io(e.into_error()))?;
        file.sync_all()?;

        Ok(SealedArchive {
            path: self.path,
            checksum,
            size_bytes,
            entries: self.entries,
        })
    }
}

/// Unpack an archive into `dest`
pub fn extract_archive<P: AsRef<Path>, Q: AsRef<Path>>(
    archive: P,
    compressed: bool,
    dest: Q,
) -> Result<()> {
    let file = BufReader::new(File::open(archive.as_ref())?);
    std::fs::create_dir_all(dest.as_ref())?;
    if compressed {
        tar::Archive::new(GzDecoder::new(file)).unpack(dest.as_ref())?;
    } else {
        tar::Archive::new(file).unpack(dest.as_ref())?;
    }
    Ok(())
}

/// Glob patterns for paths that never enter an archive
///
/// `*` and `?` stay within one path segment, `**` crosses segments. A pattern
/// without `/` is matched against the file name at any depth.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Vec<char>>,
}

impl ExcludeSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim_start_matches("./").chars().collect())
                .filter(|p: &Vec<char>| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// `relative` uses `/` separators and is relative to the archived root
    pub fn is_excluded(&self, relative: &str) -> bool {
        let full: Vec<char> = relative.chars().collect();
        let name: Vec<char> = relative
            .rsplit('/')
            .next()
            .unwrap_or(relative)
            .chars()
            .collect();

        self.patterns.iter().any(|pattern| {
            if pattern.contains(&'/') {
                glob_match(pattern, &full)
            } else {
                glob_match(pattern, &name)
            }
        })
    }
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') if pattern.get(1) == Some(&'*') => {
            if pattern.get(2) == Some(&'/') {
                // `**/` matches zero or more whole segments
                let rest = &pattern[3..];
                (0..=text.len())
                    .filter(|&i| i == 0 || text[i - 1] == '/')
                    .any(|i| glob_match(rest, &text[i..]))
            } else {
                let rest = &pattern[2..];
                (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
            }
        }
        Some('*') => {
            let rest = &pattern[1..];
            for i in 0..=text.len() {
                if glob_match(rest, &text[i..]) {
                    return true;
                }
                if i < text.len() && text[i] == '/' {
                    break;
                }
            }
            false
        }
        Some('?') => {
            !text.is_empty() && text[0] != '/' && glob_match(&pattern[1..], &text[1..])
        }
        Some(c) => text.first() == Some(c) && glob_match(&pattern[1..], &text[1..]),
    }
}
