// snapshot-relay/src/restore/mod.rs
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::naming::name_from_path;
use crate::config::ConfigStore;
use crate::errors::{AppError, Result};
use crate::host::HostApi;
use crate::remote::RemoteStorage;
use crate::status::{OperationStatus, StatusRegister};

/// Brings a remote backup back into the host snapshot store. The host's own
/// restore is then started from its UI; this flow only moves the archive.
pub struct RestoreFlow {
    status: Arc<StatusRegister>,
    host: Arc<dyn HostApi>,
    remote: Arc<dyn RemoteStorage>,
    config: Arc<ConfigStore>,
    staging_dir: PathBuf,
}

impl RestoreFlow {
    pub fn new(
        status: Arc<StatusRegister>,
        host: Arc<dyn HostApi>,
        remote: Arc<dyn RemoteStorage>,
        config: Arc<ConfigStore>,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            status,
            host,
            remote,
            config,
            staging_dir,
        }
    }

    /// Checks preconditions and takes the register, so the caller can report
    /// acceptance before the transfer starts.
    pub fn begin(&self, remote_path: &str) -> Result<()> {
        if remote_path.trim().is_empty() {
            return Err(AppError::Validation(vec![crate::config::validate::FieldError::new(
                "path",
                "is required",
            )]));
        }
        if self.config.remote().is_none() {
            return Err(AppError::NotConfigured);
        }
        self.status.try_acquire_for(OperationStatus::Download)
    }

    /// Runs a restore whose register was taken by [`RestoreFlow::begin`].
    /// Returns the identifier of the imported host snapshot.
    pub async fn execute(&self, remote_path: &str) -> Result<String> {
        let result = self.transfer(remote_path).await;
        match &result {
            Ok(snapshot_id) => info!(path = %remote_path, snapshot = %snapshot_id, "Restore upload complete"),
            Err(e) => {
                warn!(path = %remote_path, "Restore failed: {}", e);
                self.status.note_error(e.to_string());
            }
        }
        self.status.release(false);
        result
    }

    pub async fn restore(&self, remote_path: &str) -> Result<String> {
        self.begin(remote_path)?;
        self.execute(remote_path).await
    }

    async fn transfer(&self, remote_path: &str) -> Result<String> {
        let remote_config = self.config.remote().ok_or(AppError::NotConfigured)?;
        let _transfer = self.status.begin_transfer().await;

        let staged = self
            .staging_dir
            .join("restore")
            .join(format!("{}.tar", name_from_path(remote_path)));
        self.remote
            .download(&remote_config, remote_path, &staged)
            .await
            .map_err(|source| AppError::Transfer {
                phase: OperationStatus::Download,
                source,
            })?;

        self.status.set_phase(OperationStatus::Upload);
        let snapshot_id = self
            .host
            .upload_snapshot(&staged)
            .await
            .map_err(|source| AppError::Transfer {
                phase: OperationStatus::Upload,
                source,
            })?;

        if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!(file = %staged.display(), "Failed to remove restore staging file: {}", e);
        }
        Ok(snapshot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeHost, FakeRemote, HostCall, configured_store};

    fn flow(dir: &std::path::Path) -> (RestoreFlow, Arc<FakeHost>, Arc<FakeRemote>, Arc<StatusRegister>) {
        let host = Arc::new(FakeHost::new());
        let remote = Arc::new(FakeRemote::new());
        let status = Arc::new(StatusRegister::new());
        let flow = RestoreFlow::new(
            Arc::clone(&status),
            host.clone(),
            remote.clone(),
            configured_store(dir),
            dir.join("staging"),
        );
        (flow, host, remote, status)
    }

    #[tokio::test]
    async fn test_restore_imports_remote_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (flow, host, remote, status) = flow(dir.path());
        remote.seed("backups/Auto/nightly.tar", 1);

        let snapshot_id = flow.restore("backups/Auto/nightly.tar").await.unwrap();

        assert!(host.snapshot_ids().contains(&snapshot_id));
        assert_eq!(host.calls(), vec![HostCall::Upload]);
        assert_eq!(status.current(), OperationStatus::Idle);
    }

    #[tokio::test]
    async fn test_restore_rejected_when_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (flow, host, remote, status) = flow(dir.path());
        remote.seed("backups/Auto/nightly.tar", 1);
        status.try_acquire().unwrap();

        assert!(matches!(
            flow.restore("backups/Auto/nightly.tar").await,
            Err(AppError::Busy(OperationStatus::Stopping))
        ));
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_releases_register() {
        let dir = tempfile::tempdir().unwrap();
        let (flow, _host, _remote, status) = flow(dir.path());

        let result = flow.restore("backups/Auto/missing.tar").await;

        assert!(matches!(
            result,
            Err(AppError::Transfer { phase: OperationStatus::Download, .. })
        ));
        assert_eq!(status.current(), OperationStatus::Idle);
        assert!(status.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn test_empty_path_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let (flow, _host, _remote, _status) = flow(dir.path());
        assert!(matches!(flow.restore(" ").await, Err(AppError::Validation(_))));
    }
}
