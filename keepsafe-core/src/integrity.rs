/*!
Streaming SHA-256 helpers.

Archives can be far larger than memory, so every checksum in the pipeline is
computed while the bytes are already flowing through a reader or writer.
*/

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use crate::{BackupError, Result};

const BUFFER_SIZE: usize = 64 * 1024;

/// Compute SHA-256 hash of the provided data
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash a file without loading it into memory
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = HashingReader::new(BufReader::new(File::open(path.as_ref())?));
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.finalize().0)
}

/// Compare an observed checksum against the recorded one
pub fn verify_checksum(context: &str, expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(BackupError::integrity(context, expected, actual))
    }
}

/// Writer adapter that hashes and counts every byte written through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Returns the inner writer, the hex digest and the byte count
    pub fn finalize(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that hashes and counts every byte read through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Returns the hex digest and the byte count
    pub fn finalize(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Copy a file to `dest` and return the digest and size of what was copied
pub fn copy_hashed<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dest: Q) -> Result<(String, u64)> {
    let reader = File::open(src.as_ref())?;
    let mut reader = HashingReader::new(BufReader::with_capacity(BUFFER_SIZE, reader));
    let mut out = File::create(dest.as_ref())?;
    io::copy(&mut reader, &mut out)?;
    out.sync_all()?;
    Ok(reader.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA_HASH: &str = "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9";

    #[test]
    fn test_hash_bytes() {
        assert_eq!(hash_bytes(b"test data"), TEST_DATA_HASH);
    }

    #[test]
    fn test_hashing_writer_matches_hash_bytes() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"test ").unwrap();
        writer.write_all(b"data").unwrap();
        let (inner, digest, bytes) = writer.finalize();

        assert_eq!(inner, b"test data");
        assert_eq!(digest, TEST_DATA_HASH);
        assert_eq!(bytes, 9);
    }

    #[test]
    fn test_hash_file_and_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        std::fs::write(&src, b"test data").unwrap();

        assert_eq!(hash_file(&src).unwrap(), TEST_DATA_HASH);

        let (digest, size) = copy_hashed(&src, &dest).unwrap();
        assert_eq!(digest, TEST_DATA_HASH);
        assert_eq!(size, 9);
        assert_eq!(std::fs::read(&dest).unwrap(), b"test data");
    }

    #[test]
    fn test_verify_checksum() {
        assert!(verify_checksum("archive", TEST_DATA_HASH, TEST_DATA_HASH).is_ok());
        let err = verify_checksum("archive", TEST_DATA_HASH, "deadbeef").unwrap_err();
        assert!(matches!(err, BackupError::Integrity { .. }));
    }
}
