/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::{BackupError, DestinationErrorKind};
    use keepsafe_retry::RetryableError;
    use std::io;

    #[test]
    fn test_backup_error_display_names_origin() {
        let error = BackupError::export("database", "pg_dump exited with 1");
        assert_eq!(
            error.to_string(),
            "Export of domain 'database' failed: pg_dump exited with 1"
        );

        let error =
            BackupError::destination("offsite", DestinationErrorKind::Permanent, "access denied");
        assert_eq!(
            error.to_string(),
            "Destination 'offsite' error (permanent): access denied"
        );
    }

    #[test]
    fn test_integrity_error_contains_both_hashes() {
        let error = BackupError::integrity("archive", "abc123", "def456");
        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
    }

    #[test]
    fn test_no_durable_copy_lists_failures() {
        let error = BackupError::NoDurableCopy {
            job_id: "job-1".to_string(),
            failures: vec!["local: disk full".to_string(), "s3: timeout".to_string()],
        };
        let text = error.to_string();
        assert!(text.contains("job-1"));
        assert!(text.contains("local: disk full; s3: timeout"));
    }

    #[test]
    fn test_partial_restore_names_succeeded_domains() {
        let error = BackupError::PartialRestore {
            backup_id: "b1".to_string(),
            succeeded: vec!["database".to_string()],
            failed_domain: "config".to_string(),
            cause: "permission denied".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains("[database]"));
        assert!(text.contains("'config'"));
    }

    #[test]
    fn test_only_transient_destination_errors_retry() {
        let transient =
            BackupError::destination("s3", DestinationErrorKind::Transient, "connection reset");
        assert!(transient.is_transient());

        let permanent = BackupError::destination("s3", DestinationErrorKind::Permanent, "denied");
        assert!(permanent.is_permanent());

        let not_found = BackupError::destination("s3", DestinationErrorKind::NotFound, "gone");
        assert!(not_found.is_permanent());
        assert!(not_found.is_not_found());

        let integrity = BackupError::integrity("archive", "a", "b");
        assert!(!integrity.is_transient());
    }

    #[test]
    fn test_io_errors_are_attributed_to_destination() {
        let missing = BackupError::from(io::Error::new(io::ErrorKind::NotFound, "no file"));
        assert!(missing.at_destination("local").is_not_found());

        let denied = BackupError::from(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        match denied.at_destination("local") {
            BackupError::Destination {
                destination, kind, ..
            } => {
                assert_eq!(destination, "local");
                assert_eq!(kind, DestinationErrorKind::Permanent);
            }
            other => panic!("Expected destination error, got {other:?}"),
        }

        let timeout = BackupError::timeout("put", 30).at_destination("remote");
        assert!(timeout.is_transient());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BackupError>();
        assert_sync::<BackupError>();
    }

    #[test]
    fn test_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = BackupError::from(json_error);
        assert!(matches!(error, BackupError::Json(_)));
    }
}
