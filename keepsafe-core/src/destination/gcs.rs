/*!
Google Cloud Storage destination.

Authentication follows the usual GCP chain: `GOOGLE_APPLICATION_CREDENTIALS`,
the metadata server of the compute instance, then gcloud user credentials. A
`credentials` path in the configuration takes precedence over all of them.
*/

use async_trait::async_trait;
use futures::StreamExt;
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client as GcsClient, ClientConfig};
use google_cloud_storage::http::buckets::get::GetBucketRequest;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use super::{object_key, Destination, DestinationKind};
use crate::error::DestinationErrorKind;
use crate::manifest::DestinationRef;
use crate::{BackupError, Result};

pub struct GcsDestination {
    name: String,
    client: GcsClient,
    bucket: String,
    prefix: Option<String>,
}

impl GcsDestination {
    /// Authenticate and check that the bucket is reachable
    pub async fn connect(
        name: &str,
        bucket: &str,
        prefix: Option<String>,
        credentials: Option<PathBuf>,
    ) -> Result<Self> {
        let auth_failed = |e: &dyn std::fmt::Display| {
            BackupError::destination(
                name,
                DestinationErrorKind::Permanent,
                format!("GCS authentication failed: {e}"),
            )
        };
        let config = match credentials {
            Some(path) => {
                let file = CredentialsFile::new_from_file(path.to_string_lossy().into_owned())
                    .await
                    .map_err(|e| auth_failed(&e))?;
                ClientConfig::default()
                    .with_credentials(file)
                    .await
                    .map_err(|e| auth_failed(&e))?
            }
            None => ClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| auth_failed(&e))?,
        };
        let client = GcsClient::new(config);

        // Fail fast on a missing bucket or missing permissions
        client
            .get_bucket(&GetBucketRequest {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BackupError::destination(
                    name,
                    DestinationErrorKind::Permanent,
                    format!(
                        "Failed to access GCS bucket '{bucket}': {e}. Ensure the bucket exists and you have proper permissions."
                    ),
                )
            })?;

        info!(destination = name, bucket, prefix = ?prefix, "Initialized GCS destination");
        Ok(Self {
            name: name.to_string(),
            client,
            bucket: bucket.to_string(),
            prefix,
        })
    }

    fn listing_prefix(&self) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/backups/"),
            _ => "backups/".to_string(),
        }
    }

    fn map_error(&self, operation: &str, error: &google_cloud_storage::http::Error, key: &str) -> BackupError {
        let kind = classify(&error.to_string());
        let err = BackupError::destination(
            &self.name,
            kind,
            format!("GCS {operation} of '{key}' failed: {error}"),
        );
        if kind != DestinationErrorKind::NotFound {
            error!(bucket = %self.bucket, key, error = %err, "GCS request failed");
        }
        err
    }
}

/// Classify a GCS error by the status it reports
fn classify(message: &str) -> DestinationErrorKind {
    let message = message.to_ascii_lowercase();
    let has = |needle: &str| message.contains(needle);

    if has("404") || has("not found") || has("no such object") {
        DestinationErrorKind::NotFound
    } else if has("401") || has("403") || has("permission") || has("unauthorized") {
        DestinationErrorKind::Permanent
    } else if has("429")
        || has("500")
        || has("502")
        || has("503")
        || has("504")
        || has("timeout")
        || has("timed out")
        || has("connection")
        || has("network")
    {
        DestinationErrorKind::Transient
    } else if has("400") || has("409") || has("412") {
        DestinationErrorKind::Permanent
    } else {
        DestinationErrorKind::Transient
    }
}

#[async_trait]
impl Destination for GcsDestination {
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
        info!(destination = %self.name, bucket = %self.bucket, key = %key, "Uploading archive to GCS");

        let file = tokio::fs::File::open(archive).await?;
        let length = file.metadata().await?.len();
        let mut media = Media::new(key.clone());
        media.content_length = Some(length);

        self.client
            .upload_streamed_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                ReaderStream::new(file),
                &UploadType::Simple(media),
            )
            .await
            .map_err(|e| self.map_error("upload", &e, &key))?;

        debug!(bucket = %self.bucket, key = %key, bytes = length, "Uploaded archive");
        Ok(DestinationRef::new(&self.name, key))
    }

    async fn fetch(&self, reference: &DestinationRef, to: &Path) -> Result<()> {
        let key = &reference.remote_path;
        let mut stream = self
            .client
            .download_streamed_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: key.clone(),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| self.map_error("download", &e, key))?;

        let mut file = tokio::fs::File::create(to).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_error("download", &e, key))?;
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(bucket = %self.bucket, key = %key, bytes, "Downloaded archive");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DestinationRef>> {
        let prefix = self.listing_prefix();
        let mut refs = Vec::new();
        let mut page_token = None;

        loop {
            let response = self
                .client
                .list_objects(&ListObjectsRequest {
                    bucket: self.bucket.clone(),
                    prefix: Some(prefix.clone()),
                    page_token: page_token.take(),
                    ..Default::default()
                })
                .await
                .map_err(|e| self.map_error("list", &e, &prefix))?;

            refs.extend(
                response
                    .items
                    .unwrap_or_default()
                    .into_iter()
                    .map(|object| DestinationRef::new(&self.name, object.name)),
            );

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(refs)
    }

    async fn delete(&self, reference: &DestinationRef) -> Result<()> {
        let key = &reference.remote_path;
        info!(destination = %self.name, bucket = %self.bucket, key = %key, "Deleting archive from GCS");
        self.client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: key.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| self.map_error("delete", &e, key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_messages() {
        assert_eq!(classify("404 No such object: b/k"), DestinationErrorKind::NotFound);
        assert_eq!(classify("403 Forbidden"), DestinationErrorKind::Permanent);
        assert_eq!(classify("503 Service Unavailable"), DestinationErrorKind::Transient);
        assert_eq!(classify("429 rate limit"), DestinationErrorKind::Transient);
        assert_eq!(classify("connection reset by peer"), DestinationErrorKind::Transient);
        assert_eq!(classify("412 Precondition Failed"), DestinationErrorKind::Permanent);
    }
}
