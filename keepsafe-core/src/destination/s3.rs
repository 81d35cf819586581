/*!
Amazon S3 (and S3-compatible) destination.

Uses the official AWS SDK with the standard credential provider chain:
environment variables, the shared credentials file, then instance or task
roles. An explicit `endpoint` switches to path-style addressing for
S3-compatible services.
*/

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_smithy_runtime_api::client::result::SdkError;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::{object_key, Destination, DestinationKind};
use crate::error::DestinationErrorKind;
use crate::manifest::DestinationRef;
use crate::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct S3Destination {
    name: String,
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Destination {
    /// Load AWS configuration from the environment and build a client
    pub async fn connect(
        name: &str,
        bucket: &str,
        prefix: Option<String>,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(BackupError::destination(
                name,
                DestinationErrorKind::Permanent,
                "AWS credentials not found. Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY or configure a profile",
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        info!(destination = name, bucket, prefix = ?prefix, "Initialized S3 destination");
        Ok(Self {
            name: name.to_string(),
            client,
            bucket: bucket.to_string(),
            prefix,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn listing_prefix(&self) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/backups/"),
            _ => "backups/".to_string(),
        }
    }
}

/// Classify an S3 error code or HTTP status for the retry layer
fn classify(code: Option<&str>, status: Option<u16>) -> DestinationErrorKind {
    match code {
        Some("NoSuchKey" | "NotFound") => return DestinationErrorKind::NotFound,
        Some(
            "AccessDenied" | "Forbidden" | "NoSuchBucket" | "InvalidBucketName"
            | "InvalidAccessKeyId" | "SignatureDoesNotMatch",
        ) => return DestinationErrorKind::Permanent,
        Some("SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout") => {
            return DestinationErrorKind::Transient
        }
        _ => {}
    }
    match status {
        Some(404) => DestinationErrorKind::NotFound,
        Some(429) => DestinationErrorKind::Transient,
        Some(s) if s >= 500 => DestinationErrorKind::Transient,
        Some(s) if s >= 400 => DestinationErrorKind::Permanent,
        _ => DestinationErrorKind::Transient,
    }
}

/// Map AWS SDK errors to destination errors with the object key as context
fn map_s3_error<E, R>(name: &str, op: &str, error: SdkError<E, R>, key: &str) -> BackupError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &error {
        SdkError::DispatchFailure(dispatch) => BackupError::destination(
            name,
            DestinationErrorKind::Transient,
            format!("S3 {op} request failed to dispatch: {dispatch:?}"),
        ),
        SdkError::TimeoutError(_) => BackupError::destination(
            name,
            DestinationErrorKind::Transient,
            format!("S3 {op} request timed out (key: {key})"),
        ),
        SdkError::ResponseError(response) => BackupError::destination(
            name,
            DestinationErrorKind::Transient,
            format!("S3 {op} response error: {response:?}"),
        ),
        SdkError::ServiceError(service) => {
            let code = service.err().code();
            let kind = classify(code, None);
            let detail = service.err().message().unwrap_or("unknown error");
            BackupError::destination(
                name,
                kind,
                format!("S3 {op} of '{key}' failed ({}): {detail}", code.unwrap_or("no code")),
            )
        }
        _ => BackupError::destination(
            name,
            DestinationErrorKind::Permanent,
            format!("S3 {op} error: {error:?}"),
        ),
    }
}

#[async_trait]
impl Destination for S3Destination {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Remote
    }

    async fn put(&self, backup_id: &str, archive: &Path) -> Result<DestinationRef> {
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::validation("archive path has no file name"))?;
        let key = object_key(self.prefix.as_deref(), backup_id, &file_name);
        info!(destination = %self.name, bucket = %self.bucket, key = %key, "Uploading archive to S3");

        let body = ByteStream::from_path(archive).await.map_err(|e| {
            BackupError::destination(
                &self.name,
                DestinationErrorKind::Permanent,
                format!("cannot read {}: {e}", archive.display()),
            )
        })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let err = map_s3_error(&self.name, "put_object", e, &key);
                error!(bucket = %self.bucket, key = %key, error = %err, "Failed to upload archive");
                err
            })?;

        debug!(bucket = %self.bucket, key = %key, "Uploaded archive");
        Ok(DestinationRef::new(&self.name, key))
    }

    async fn fetch(&self, reference: &DestinationRef, to: &Path) -> Result<()> {
        let key = &reference.remote_path;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "get_object", e, key))?;

        let mut reader = output.body.into_async_read();
        let mut file = tokio::fs::File::create(to).await?;
        let bytes = tokio::io::copy(&mut reader, &mut file).await.map_err(|e| {
            BackupError::destination(
                &self.name,
                DestinationErrorKind::Transient,
                format!("Failed to read S3 object stream: {e}"),
            )
        })?;
        file.flush().await?;
        debug!(bucket = %self.bucket, key = %key, bytes, "Downloaded archive");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DestinationRef>> {
        let prefix = self.listing_prefix();
        let mut refs = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_s3_error(&self.name, "list_objects_v2", e, &prefix))?;

            refs.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| DestinationRef::new(&self.name, key)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(refs)
    }

    async fn delete(&self, reference: &DestinationRef) -> Result<()> {
        let key = &reference.remote_path;
        info!(destination = %self.name, bucket = %self.bucket, key = %key, "Deleting archive from S3");
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "delete_object", e, key))?;
        Ok(())
    }
}
