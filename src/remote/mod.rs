// snapshot-relay/src/remote/mod.rs
pub(crate) mod s3;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::backup::BackupDescriptor;
use crate::config::RemoteConfig;

pub use s3::S3Remote;

/// Remote storage destination. Every call takes the persisted configuration
/// so a saved change applies to the next call without rebuilding anything.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn upload(&self, config: &RemoteConfig, local_file: &Path, remote_path: &str) -> Result<()>;

    /// Downloads `remote_path` into `dest`, returning the number of bytes written.
    async fn download(&self, config: &RemoteConfig, remote_path: &str, dest: &Path) -> Result<u64>;

    async fn list(&self, config: &RemoteConfig, prefix: &str) -> Result<Vec<BackupDescriptor>>;

    async fn delete(&self, config: &RemoteConfig, remote_path: &str) -> Result<()>;

    /// Authenticated no-op request against the configured destination.
    async fn test_connection(&self, config: &RemoteConfig) -> Result<()>;
}
