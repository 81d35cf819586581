//! Archive encryption and manifest signing
//!
//! Archives are encrypted with AES-256-GCM under a key derived from the
//! configured secret with Argon2id. The salt is random per backup and kept in
//! the manifest together with a small key-check token, so a restore can prove
//! the secret is right before it downloads anything.
//!
//! Encrypted file layout:
//!
//! ```text
//! magic (8) | nonce prefix (7) | chunk*
//! chunk = u32 big-endian length (high bit set on the final chunk) | ciphertext+tag
//! ```
//!
//! Each chunk's nonce is `prefix | chunk counter (u32 BE) | final flag (u8)`, so
//! reordering, dropping or truncating chunks fails authentication.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, Params};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::integrity::HashingWriter;
use crate::{BackupError, Result};

pub const ALGORITHM: &str = "aes-256-gcm-chunked";

const MAGIC: &[u8; 8] = b"KSAFENC1";
const NONCE_SIZE: usize = 12;
const NONCE_PREFIX_LEN: usize = 7;
const TAG_SIZE: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;
const FINAL_CHUNK: u32 = 0x8000_0000;
const SALT_LEN: usize = 16;
const KEY_CHECK_PLAINTEXT: &[u8] = b"keepsafe key check v1";
const SIGNING_CONTEXT: &[u8] = b"keepsafe manifest signing v1";

/// Argon2id parameters stored alongside each encrypted backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivationParams {
    /// Salt for key derivation (base64 encoded)
    pub salt: String,
    /// Memory cost in KiB
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl KeyDerivationParams {
    /// Create params with a fresh random salt
    pub fn generate(memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self {
            salt: STANDARD.encode(salt),
            memory_cost,
            time_cost,
            parallelism,
        }
    }
}

/// A derived encryption key
pub struct DerivedKey {
    key: [u8; 32],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| BackupError::crypto(format!("failed to create cipher: {e}")))
    }

    fn signing_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(SIGNING_CONTEXT);
        hasher.update(self.key);
        hasher.finalize().into()
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.key.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Derive a 256-bit key from a secret
pub fn derive_key(secret: &str, params: &KeyDerivationParams) -> Result<DerivedKey> {
    let salt = STANDARD
        .decode(&params.salt)
        .map_err(|e| BackupError::crypto(format!("invalid salt: {e}")))?;

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| BackupError::crypto(format!("invalid Argon2 parameters: {e}")))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret.as_bytes(), &salt, &mut key)
        .map_err(|e| BackupError::crypto(format!("key derivation failed: {e}")))?;

    Ok(DerivedKey { key })
}

/// The configured secret plus the Argon2 costs used for new backups
#[derive(Clone)]
pub struct KeySource {
    secret: String,
    memory_cost: u32,
    time_cost: u32,
    parallelism: u32,
}

impl KeySource {
    pub fn new<S: Into<String>>(secret: S, memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            secret: secret.into(),
            memory_cost,
            time_cost,
            parallelism,
        }
    }

    /// Derive a key under a fresh salt, for a new backup
    pub fn fresh(&self) -> Result<(DerivedKey, KeyDerivationParams)> {
        let params =
            KeyDerivationParams::generate(self.memory_cost, self.time_cost, self.parallelism);
        let key = derive_key(&self.secret, &params)?;
        Ok((key, params))
    }

    /// Re-derive the key recorded in an existing backup's envelope
    pub fn derive(&self, params: &KeyDerivationParams) -> Result<DerivedKey> {
        derive_key(&self.secret, params)
    }
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySource")
            .field("secret", &"[REDACTED]")
            .field("memory_cost", &self.memory_cost)
            .field("time_cost", &self.time_cost)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// Everything needed to decrypt a backup, minus the secret itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionEnvelope {
    pub algorithm: String,
    pub kdf: KeyDerivationParams,
    /// base64(nonce | AES-GCM(key, constant)); decrypts only under the right key
    pub key_check: String,
}

impl EncryptionEnvelope {
    pub fn seal(key: &DerivedKey, kdf: KeyDerivationParams) -> Result<Self> {
        let cipher = key.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), KEY_CHECK_PLAINTEXT)
            .map_err(|e| BackupError::crypto(format!("encryption failed: {e}")))?;

        let mut token = nonce_bytes.to_vec();
        token.extend_from_slice(&ciphertext);
        Ok(Self {
            algorithm: ALGORITHM.to_string(),
            kdf,
            key_check: STANDARD.encode(token),
        })
    }

    /// Prove `key` can decrypt the backup this envelope belongs to
    pub fn check_key(&self, key: &DerivedKey) -> Result<()> {
        if self.algorithm != ALGORITHM {
            return Err(BackupError::crypto(format!(
                "unsupported encryption algorithm: {}",
                self.algorithm
            )));
        }
        let token = STANDARD
            .decode(&self.key_check)
            .map_err(|e| BackupError::crypto(format!("invalid key check encoding: {e}")))?;
        if token.len() <= NONCE_SIZE {
            return Err(BackupError::crypto("key check token is too short"));
        }
        let (nonce, ciphertext) = token.split_at(NONCE_SIZE);
        let plaintext = key
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BackupError::crypto("decryption key does not match this backup"))?;
        if plaintext != KEY_CHECK_PLAINTEXT {
            return Err(BackupError::crypto("decryption key does not match this backup"));
        }
        Ok(())
    }
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_SIZE - 1].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_SIZE - 1] = u8::from(last);
    nonce
}

/// Fill `buf` as far as the reader allows
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn finish_file(writer: HashingWriter<BufWriter<File>>) -> Result<(String, u64)> {
    let (writer, digest, bytes) = writer.finalize();
    let file = writer
        .into_inner()
        .map_err(|e| BackupError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok((digest, bytes))
}

/// Encrypt `src` into the new file `dest`
///
/// Returns the SHA-256 and size of the encrypted output. `dest` must not be
/// `src`; the caller removes the plaintext once this returns.
pub fn encrypt_file<P: AsRef<Path>, Q: AsRef<Path>>(
    src: P,
    dest: Q,
    key: &DerivedKey,
) -> Result<(String, u64)> {
    let cipher = key.cipher()?;
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut prefix);

    let mut reader = BufReader::new(File::open(src.as_ref())?);
    let mut writer = HashingWriter::new(BufWriter::new(
        File::options()
            .write(true)
            .create_new(true)
            .open(dest.as_ref())?,
    ));
    writer.write_all(MAGIC)?;
    writer.write_all(&prefix)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut counter: u32 = 0;
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        let last = n < CHUNK_SIZE;
        let nonce = chunk_nonce(&prefix, counter, last);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &buf[..n])
            .map_err(|e| BackupError::crypto(format!("encryption failed: {e}")))?;

        let mut header = ciphertext.len() as u32;
        if last {
            header |= FINAL_CHUNK;
        }
        writer.write_all(&header.to_be_bytes())?;
        writer.write_all(&ciphertext)?;

        if last {
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| BackupError::crypto("archive too large to encrypt"))?;
    }

    finish_file(writer)
}

/// Decrypt `src` into the new file `dest`
///
/// Returns the SHA-256 and size of the recovered plaintext.
pub fn decrypt_file<P: AsRef<Path>, Q: AsRef<Path>>(
    src: P,
    dest: Q,
    key: &DerivedKey,
) -> Result<(String, u64)> {
    let cipher = key.cipher()?;
    let mut reader = BufReader::new(File::open(src.as_ref())?);

    let mut magic = [0u8; MAGIC.len()];
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    if read_full(&mut reader, &mut magic)? != magic.len() || &magic != MAGIC {
        return Err(BackupError::crypto("not a keepsafe encrypted archive"));
    }
    if read_full(&mut reader, &mut prefix)? != prefix.len() {
        return Err(BackupError::crypto("encrypted archive header is truncated"));
    }

    let mut writer = HashingWriter::new(BufWriter::new(
        File::options()
            .write(true)
            .create_new(true)
            .open(dest.as_ref())?,
    ));

    let mut counter: u32 = 0;
    let mut ciphertext = Vec::with_capacity(CHUNK_SIZE + TAG_SIZE);
    loop {
        let mut header = [0u8; 4];
        if read_full(&mut reader, &mut header)? != header.len() {
            return Err(BackupError::crypto("encrypted archive is truncated"));
        }
        let header = u32::from_be_bytes(header);
        let last = header & FINAL_CHUNK != 0;
        let len = (header & !FINAL_CHUNK) as usize;
        if len < TAG_SIZE || len > CHUNK_SIZE + TAG_SIZE {
            return Err(BackupError::crypto(format!("invalid chunk length {len}")));
        }

        ciphertext.resize(len, 0);
        if read_full(&mut reader, &mut ciphertext)? != len {
            return Err(BackupError::crypto("encrypted archive is truncated"));
        }

        let nonce = chunk_nonce(&prefix, counter, last);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| {
                BackupError::crypto("decryption failed: invalid key or corrupted data")
            })?;
        writer.write_all(&plaintext)?;

        if last {
            let mut trailing = [0u8; 1];
            if read_full(&mut reader, &mut trailing)? != 0 {
                return Err(BackupError::crypto("unexpected data after final chunk"));
            }
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| BackupError::crypto("chunk counter overflow"))?;
    }

    finish_file(writer)
}

type HmacSha256 = Hmac<Sha256>;

fn manifest_mac(key: &DerivedKey) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(&key.signing_key())
        .map_err(|e| BackupError::crypto(format!("failed to create signer: {e}")))
}

/// HMAC-SHA256 over the canonical manifest bytes, base64 encoded
pub fn sign(key: &DerivedKey, payload: &[u8]) -> Result<String> {
    let mut mac = manifest_mac(key)?;
    mac.update(payload);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(key: &DerivedKey, payload: &[u8], signature: &str) -> Result<()> {
    let expected = STANDARD
        .decode(signature)
        .map_err(|e| BackupError::crypto(format!("invalid signature encoding: {e}")))?;
    let mut mac = manifest_mac(key)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| BackupError::crypto("manifest signature does not match"))
}
