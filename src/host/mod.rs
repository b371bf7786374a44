// snapshot-relay/src/host/mod.rs
pub(crate) mod supervisor;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::backup::BackupDescriptor;

pub use supervisor::SupervisorClient;

/// Host application API: workload control and the local snapshot store.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Stops the given workloads. Workloads already stopped are skipped.
    async fn pause_workloads(&self, slugs: &[String]) -> Result<()>;

    /// Starts the given workloads. Must succeed when they are already running.
    async fn resume_workloads(&self, slugs: &[String]) -> Result<()>;

    async fn host_version(&self) -> Result<String>;

    /// Creates a snapshot and returns its identifier.
    async fn create_snapshot(&self, name: &str) -> Result<String>;

    /// Streams the snapshot into `dest`, returning the number of bytes written.
    async fn fetch_snapshot(&self, snapshot_id: &str, dest: &Path) -> Result<u64>;

    async fn list_snapshots(&self) -> Result<Vec<BackupDescriptor>>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Imports a snapshot archive into the host store, returning its identifier.
    async fn upload_snapshot(&self, file: &Path) -> Result<String>;
}
