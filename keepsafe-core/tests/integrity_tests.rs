/*!
Integration tests for checksums, encryption and idempotent storage.
*/

use keepsafe_core::crypto::{decrypt_file, encrypt_file, KeySource};
use keepsafe_core::integrity::hash_file;
use keepsafe_core::{Destination, LocalDestination};
use rand::RngCore;
use tempfile::TempDir;

#[test]
fn test_decrypt_of_encrypt_preserves_checksum() {
    let dir = TempDir::new().unwrap();
    let source = KeySource::new("correct horse battery staple", 1024, 1, 1);
    let (key, params) = source.fresh().unwrap();

    // Spans several encryption chunks with a ragged tail
    let mut data = vec![0u8; 3 * 1024 * 1024 + 17];
    rand::thread_rng().fill_bytes(&mut data);
    let archive = dir.path().join("archive.tar.gz");
    std::fs::write(&archive, &data).unwrap();

    let encrypted = dir.path().join("archive.tar.gz.enc");
    let (stored_checksum, _) = encrypt_file(&archive, &encrypted, &key).unwrap();
    assert_eq!(stored_checksum, hash_file(&encrypted).unwrap());
    assert_ne!(stored_checksum, hash_file(&archive).unwrap());

    // A key derived again from the recorded parameters decrypts it
    let key = source.derive(&params).unwrap();
    let decrypted = dir.path().join("decrypted.tar.gz");
    let (checksum, size) = decrypt_file(&encrypted, &decrypted, &key).unwrap();
    assert_eq!(checksum, hash_file(&archive).unwrap());
    assert_eq!(size, data.len() as u64);
}

#[tokio::test]
async fn test_repeated_put_stores_one_object() {
    let dir = TempDir::new().unwrap();
    let destination = LocalDestination::new("local", dir.path().join("store")).unwrap();
    let archive = dir.path().join("archive.tar");
    std::fs::write(&archive, b"archive bytes").unwrap();

    let first = destination.put("manual-20240101T000000Z-abcd", &archive).await.unwrap();
    let second = destination.put("manual-20240101T000000Z-abcd", &archive).await.unwrap();

    assert_eq!(first.remote_path, second.remote_path);
    let listed = destination.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(destination
        .verify(&first, &hash_file(&archive).unwrap())
        .await
        .unwrap());
}
