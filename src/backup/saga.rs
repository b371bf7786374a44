// snapshot-relay/src/backup/saga.rs
//! The backup pipeline.
//!
//! `idle -> stopping -> creating -> download -> upload -> starting -> idle`
//!
//! Once run rights are acquired the resume step always runs, whether the
//! pipeline completed or failed part-way. A failed step followed by a
//! successful resume releases the register to `idle` and keeps the failure
//! as `last_error`; a failed resume leaves the register in `error` until an
//! operator resets it.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::naming::{destination_path, is_single_segment, render_name, sanitize_name, staging_path};
use super::{BackupDescriptor, BackupLocation, BackupOrigin};
use crate::config::validate::FieldError;
use crate::config::{BackupConfig, ConfigStore, RemoteConfig};
use crate::errors::{AppError, Result};
use crate::host::HostApi;
use crate::remote::RemoteStorage;
use crate::status::{OperationStatus, StatusRegister};

#[derive(Debug)]
pub enum SagaOutcome {
    Completed,
    /// A step failed; workloads were resumed and the register released.
    Compensated(AppError),
    /// Resuming workloads failed; the register stays in `error`.
    Stuck {
        failure: Option<AppError>,
        resume: AppError,
    },
}

#[derive(Debug)]
pub struct SagaReport {
    pub origin: BackupOrigin,
    pub name: Option<String>,
    pub remote_path: Option<String>,
    /// The uploaded artifact, when the upload step succeeded.
    pub uploaded: Option<BackupDescriptor>,
    pub outcome: SagaOutcome,
}

/// Flat view of a [`SagaReport`] for command output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub origin: String,
    pub outcome: String,
    pub name: Option<String>,
    pub remote_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
}

impl SagaReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, SagaOutcome::Completed)
    }

    pub fn summary(&self) -> BackupSummary {
        let (outcome, error) = match &self.outcome {
            SagaOutcome::Completed => ("completed", None),
            SagaOutcome::Compensated(e) => ("compensated", Some(e.to_string())),
            SagaOutcome::Stuck { failure: Some(failure), resume } => {
                ("stuck", Some(format!("{}; then {}", failure, resume)))
            }
            SagaOutcome::Stuck { failure: None, resume } => ("stuck", Some(resume.to_string())),
        };
        BackupSummary {
            origin: self.origin.label().to_string(),
            outcome: outcome.to_string(),
            name: self.name.clone(),
            remote_path: self.remote_path.clone(),
            size_bytes: self.uploaded.as_ref().map(|u| u.size_bytes),
            error,
        }
    }
}

#[derive(Clone)]
pub struct BackupSaga {
    status: Arc<StatusRegister>,
    host: Arc<dyn HostApi>,
    remote: Arc<dyn RemoteStorage>,
    config: Arc<ConfigStore>,
    staging_dir: PathBuf,
}

/// Run rights for one pipeline execution, obtained from [`BackupSaga::begin`].
pub struct SagaRun {
    saga: BackupSaga,
    origin: BackupOrigin,
    remote_config: RemoteConfig,
    backup_config: BackupConfig,
}

#[derive(Default)]
struct Progress {
    name: Option<String>,
    remote_path: Option<String>,
    uploaded: Option<BackupDescriptor>,
}

/// Runs one pipeline step, tagging its failure with the phase.
async fn step<T, F>(phase: OperationStatus, fut: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    fut.await.map_err(|source| {
        warn!(phase = %phase, "Backup step failed: {:#}", source);
        AppError::Transfer { phase, source }
    })
}

impl BackupSaga {
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

    pub fn status(&self) -> &Arc<StatusRegister> {
        &self.status
    }

    /// Acquires run rights. Fails with `NotConfigured` when no remote
    /// configuration has been saved and with `Busy` when another operation
    /// holds the register. Nothing is queued.
    pub fn begin(&self, origin: BackupOrigin) -> Result<SagaRun> {
        let remote_config = self.config.remote().ok_or(AppError::NotConfigured)?;
        let backup_config = self.config.backup();
        self.status.try_acquire()?;
        Ok(SagaRun {
            saga: self.clone(),
            origin,
            remote_config,
            backup_config,
        })
    }

    pub async fn run(&self, origin: BackupOrigin) -> Result<SagaReport> {
        Ok(self.begin(origin)?.execute().await)
    }

    /// Transfers an existing host snapshot to the manual folder. Nothing is
    /// paused, so there is nothing to compensate.
    pub async fn upload_existing(&self, snapshot_id: &str, name: Option<String>) -> Result<BackupDescriptor> {
        if !is_single_segment(snapshot_id) {
            return Err(AppError::Validation(vec![FieldError::new(
                "snapshot_id",
                "must be a plain snapshot identifier",
            )]));
        }
        let name = name.map(|name| sanitize_name(&name));
        if let Some(name) = &name {
            if !is_single_segment(name) {
                return Err(AppError::Validation(vec![FieldError::new("name", "must be a usable file name")]));
            }
        }
        let remote_config = self.config.remote().ok_or(AppError::NotConfigured)?;
        self.status.try_acquire_for(OperationStatus::Download)?;

        let result = self.transfer_existing(&remote_config, snapshot_id, name).await;
        match &result {
            Ok(descriptor) => {
                info!(path = %descriptor.id, "Existing snapshot uploaded");
                self.status.release(true);
            }
            Err(e) => {
                self.status.note_error(e.to_string());
                self.status.release(false);
            }
        }
        result
    }

    async fn transfer_existing(
        &self,
        remote_config: &RemoteConfig,
        snapshot_id: &str,
        name: Option<String>,
    ) -> Result<BackupDescriptor> {
        let _transfer = self.status.begin_transfer().await;

        let name = match name {
            Some(name) => name,
            None => step(OperationStatus::Download, self.host.list_snapshots())
                .await?
                .into_iter()
                .find(|s| s.id == snapshot_id)
                .map(|s| sanitize_name(&s.name))
                .filter(|name| is_single_segment(name))
                .unwrap_or_else(|| snapshot_id.to_string()),
        };
        let staged = staging_path(&self.staging_dir, snapshot_id);
        let size_bytes = step(
            OperationStatus::Download,
            self.host.fetch_snapshot(snapshot_id, &staged),
        )
        .await?;

        self.status.set_phase(OperationStatus::Upload);
        let remote_path = destination_path(&remote_config.back_dir, BackupOrigin::Manual, &name);
        step(
            OperationStatus::Upload,
            self.remote.upload(remote_config, &staged, &remote_path),
        )
        .await?;
        remove_staged(&staged).await;

        Ok(BackupDescriptor {
            id: remote_path,
            name,
            created_at: Utc::now(),
            size_bytes,
            origin: BackupOrigin::Manual,
            location: BackupLocation::Remote,
        })
    }
}

impl SagaRun {
    pub fn origin(&self) -> BackupOrigin {
        self.origin
    }

    /// Drives the pipeline to a terminal state.
    pub async fn execute(self) -> SagaReport {
        let status = Arc::clone(&self.saga.status);
        let workloads = self.backup_config.auto_stop_workloads.clone();
        info!(origin = ?self.origin, "Backup started");

        let mut progress = Progress::default();
        let pipeline = self.drive(&mut progress).await;

        // Compensation and the normal final step are the same action.
        status.set_phase(OperationStatus::Starting);
        let resumed = step(
            OperationStatus::Starting,
            self.saga.host.resume_workloads(&workloads),
        )
        .await;

        let outcome = match (pipeline, resumed) {
            (Ok(()), Ok(())) => {
                status.release(true);
                info!(origin = ?self.origin, path = ?progress.remote_path, "Backup completed");
                SagaOutcome::Completed
            }
            (Err(failure), Ok(())) => {
                status.note_error(failure.to_string());
                status.release(false);
                warn!(origin = ?self.origin, "Backup failed, workloads resumed: {}", failure);
                SagaOutcome::Compensated(failure)
            }
            (pipeline, Err(resume_failure)) => {
                let resume = match resume_failure {
                    AppError::Transfer { source, .. } => AppError::Resume(source),
                    other => other,
                };
                error!(
                    origin = ?self.origin,
                    "Workloads could not be resumed, host may be left paused: {}", resume
                );
                status.fail(resume.to_string());
                SagaOutcome::Stuck {
                    failure: pipeline.err(),
                    resume,
                }
            }
        };

        SagaReport {
            origin: self.origin,
            name: progress.name,
            remote_path: progress.remote_path,
            uploaded: progress.uploaded,
            outcome,
        }
    }

    async fn drive(&self, progress: &mut Progress) -> Result<()> {
        let saga = &self.saga;
        let status = &saga.status;
        let workloads = &self.backup_config.auto_stop_workloads;

        // Acquisition already entered `stopping`.
        step(OperationStatus::Stopping, saga.host.pause_workloads(workloads)).await?;

        status.set_phase(OperationStatus::Creating);
        let version = step(OperationStatus::Creating, saga.host.host_version()).await?;
        let name = render_name(&self.backup_config.name_template, self.origin, &version, Local::now());
        progress.name = Some(name.clone());
        let snapshot_id = step(OperationStatus::Creating, saga.host.create_snapshot(&name)).await?;
        info!(snapshot = %snapshot_id, name = %name, "Snapshot created");

        let _transfer = status.begin_transfer().await;
        status.set_phase(OperationStatus::Download);
        let staged = staging_path(&saga.staging_dir, &snapshot_id);
        let size_bytes = step(
            OperationStatus::Download,
            saga.host.fetch_snapshot(&snapshot_id, &staged),
        )
        .await?;

        status.set_phase(OperationStatus::Upload);
        let remote_path = destination_path(&self.remote_config.back_dir, self.origin, &name);
        progress.remote_path = Some(remote_path.clone());
        // The staged file is kept on failure for a later manual retry.
        step(
            OperationStatus::Upload,
            saga.remote.upload(&self.remote_config, &staged, &remote_path),
        )
        .await?;
        remove_staged(&staged).await;

        progress.uploaded = Some(BackupDescriptor {
            id: remote_path,
            name,
            created_at: Utc::now(),
            size_bytes,
            origin: self.origin,
            location: BackupLocation::Remote,
        });
        Ok(())
    }
}

async fn remove_staged(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(file = %path.display(), "Failed to remove staged snapshot: {}", e);
    }
}
