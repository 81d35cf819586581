/*!
Tests for manifest validation, signing and serialization.
*/

#[cfg(test)]
mod tests {
    use crate::crypto::{derive_key, KeyDerivationParams};
    use crate::job::Tier;
    use crate::manifest::{
        archive_file_name, new_backup_id, DestinationRef, DomainEntry, Manifest,
        MANIFEST_FORMAT_VERSION,
    };
    use chrono::Utc;

    fn sample_manifest() -> Manifest {
        Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            backup_id: "daily-20240101T020000Z-abcd1234".to_string(),
            job_id: "job-1".to_string(),
            tier: Tier::Daily,
            name: None,
            created_at: Utc::now(),
            domains: vec![
                DomainEntry {
                    domain: "database".to_string(),
                    artifact_path: "domains/database/database.dump".to_string(),
                    size_bytes: 1024,
                    checksum: "aa".repeat(32),
                },
                DomainEntry {
                    domain: "config".to_string(),
                    artifact_path: "domains/config/config.tar".to_string(),
                    size_bytes: 512,
                    checksum: "bb".repeat(32),
                },
            ],
            total_size_bytes: 4096,
            checksum: "cc".repeat(32),
            stored_checksum: "cc".repeat(32),
            stored_size_bytes: 4096,
            compressed: true,
            encrypted: false,
            encryption: None,
            destinations: vec![DestinationRef::new("primary", "backups/x/archive.tar.gz")
                .verified(Utc::now())],
            signature: None,
        }
    }

    #[test]
    fn test_valid_manifest() {
        let manifest = sample_manifest();
        assert!(manifest.validate().is_ok());
        assert!(manifest.is_durable());
        assert!(manifest.is_compatible());
        assert_eq!(manifest.domain_names(), vec!["database", "config"]);
    }

    #[test]
    fn test_manifest_without_verified_copy_is_invalid() {
        let mut manifest = sample_manifest();
        manifest.destinations = vec![DestinationRef::new("primary", "backups/x/archive.tar.gz")];
        assert!(!manifest.is_durable());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_encryption_flag_must_match_envelope() {
        let mut manifest = sample_manifest();
        manifest.encrypted = true;
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("envelope"));
    }

    #[test]
    fn test_future_format_is_incompatible() {
        let mut manifest = sample_manifest();
        manifest.format_version = MANIFEST_FORMAT_VERSION + 1;
        assert!(!manifest.is_compatible());
    }

    #[test]
    fn test_serialization_roundtrip_preserves_order() {
        let manifest = sample_manifest();
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        let restored: Manifest = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, manifest);
        assert_eq!(restored.domains[0].domain, "database");
        assert!(json.contains("\"tier\": \"daily\""));
    }

    #[test]
    fn test_signature_detects_modification() {
        let key = derive_key("secret", &KeyDerivationParams::generate(1024, 1, 1)).unwrap();
        let mut manifest = sample_manifest();
        manifest.sign(&key).unwrap();
        assert!(manifest.signature.is_some());
        assert!(manifest.verify_signature(&key).is_ok());

        manifest.total_size_bytes += 1;
        assert!(manifest.verify_signature(&key).is_err());
    }

    #[test]
    fn test_verify_archive_checksum() {
        let manifest = sample_manifest();
        assert!(manifest.verify_archive(&"cc".repeat(32)).is_ok());
        assert!(manifest.verify_archive(&"dd".repeat(32)).is_err());
    }

    #[test]
    fn test_archive_file_names() {
        assert_eq!(archive_file_name(false, false), "archive.tar");
        assert_eq!(archive_file_name(true, false), "archive.tar.gz");
        assert_eq!(archive_file_name(true, true), "archive.tar.gz.enc");
    }

    #[test]
    fn test_backup_ids_are_unique_and_prefixed() {
        let now = Utc::now();
        let a = new_backup_id(Tier::Weekly, now);
        let b = new_backup_id(Tier::Weekly, now);
        assert!(a.starts_with("weekly-"));
        assert_ne!(a, b);
    }
}
