// snapshot-relay/src/remote/s3.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::RemoteStorage;
use crate::backup::naming::{name_from_path, origin_from_path};
use crate::backup::{BackupDescriptor, BackupLocation};
use crate::config::RemoteConfig;

/// S3-compatible object storage (AWS, MinIO, DigitalOcean Spaces, ...).
#[derive(Debug, Default)]
pub struct S3Remote;

impl S3Remote {
    pub fn new() -> Self {
        Self
    }

    async fn client(config: &RemoteConfig) -> s3::Client {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        // Path-style addressing for self-hosted endpoints.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        s3::Client::from_conf(s3_config)
    }
}

fn to_chrono(value: Option<&s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl RemoteStorage for S3Remote {
    async fn upload(&self, config: &RemoteConfig, local_file: &Path, remote_path: &str) -> Result<()> {
        info!(
            file = %local_file.display(),
            bucket = %config.bucket_name,
            key = %remote_path,
            "Uploading to remote storage"
        );
        let client = Self::client(config).await;

        let body = ByteStream::from_path(local_file)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", local_file.display()))?;

        client
            .put_object()
            .bucket(&config.bucket_name)
            .key(remote_path)
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to upload file {} to bucket {} with key {}",
                    local_file.display(),
                    config.bucket_name,
                    remote_path
                )
            })?;

        info!(key = %remote_path, "Upload complete");
        Ok(())
    }

    async fn download(&self, config: &RemoteConfig, remote_path: &str, dest: &Path) -> Result<u64> {
        if let Some(parent_dir) = dest.parent() {
            tokio::fs::create_dir_all(parent_dir)
                .await
                .with_context(|| format!("Failed to create directory for download: {}", parent_dir.display()))?;
        }
        let client = Self::client(config).await;

        let mut object = client
            .get_object()
            .bucket(&config.bucket_name)
            .key(remote_path)
            .send()
            .await
            .with_context(|| format!("Failed to get object s3://{}/{}", config.bucket_name, remote_path))?;

        let mut output_file = File::create(dest)
            .await
            .with_context(|| format!("Failed to create destination file: {}", dest.display()))?;

        let mut total_bytes = 0u64;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .with_context(|| format!("Download of s3://{}/{} was interrupted", config.bucket_name, remote_path))?
        {
            output_file
                .write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write to destination file: {}", dest.display()))?;
            total_bytes += chunk.len() as u64;
        }
        output_file.flush().await?;

        info!(key = %remote_path, bytes = total_bytes, "Download complete");
        Ok(total_bytes)
    }

    async fn list(&self, config: &RemoteConfig, prefix: &str) -> Result<Vec<BackupDescriptor>> {
        let client = Self::client(config).await;
        let mut descriptors = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = client
                .list_objects_v2()
                .bucket(&config.bucket_name)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", config.bucket_name, prefix))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if key.ends_with('/') {
                    continue;
                }
                descriptors.push(BackupDescriptor {
                    id: key.to_string(),
                    name: name_from_path(key),
                    created_at: to_chrono(object.last_modified()),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    origin: origin_from_path(key),
                    location: BackupLocation::Remote,
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix = %prefix, count = descriptors.len(), "Listed remote backups");
        Ok(descriptors)
    }

    async fn delete(&self, config: &RemoteConfig, remote_path: &str) -> Result<()> {
        let client = Self::client(config).await;
        client
            .delete_object()
            .bucket(&config.bucket_name)
            .key(remote_path)
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", config.bucket_name, remote_path))?;
        Ok(())
    }

    async fn test_connection(&self, config: &RemoteConfig) -> Result<()> {
        info!(endpoint = %config.endpoint_url, "Checking remote storage connection");
        let client = Self::client(config).await;

        client
            .head_bucket()
            .bucket(&config.bucket_name)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Could not access bucket '{}' at {}",
                    config.bucket_name, config.endpoint_url
                )
            })?;

        info!(bucket = %config.bucket_name, "Remote storage is reachable");
        Ok(())
    }
}
