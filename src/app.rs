// snapshot-relay/src/app.rs
//! Wires the collaborators together and maps commands onto them.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backup::naming::origin_prefix;
use crate::backup::{BackupDescriptor, BackupOrigin, BackupSaga, SagaReport};
use crate::config::validate::{
    FieldError, check_connectivity, parse_backup_json, parse_remote_json, validate_backup, validate_remote,
};
use crate::config::{BackupConfig, ConfigStore, EnvSettings, RemoteConfig};
use crate::errors::{AppError, Result};
use crate::host::{HostApi, SupervisorClient};
use crate::remote::{RemoteStorage, S3Remote};
use crate::restore::RestoreFlow;
use crate::retention::{PruneReport, RetentionPruner};
use crate::scheduler::Scheduler;
use crate::status::{OperationStatus, StatusRegister, StatusSnapshot};

/// Answer given to whoever asked for an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted,
    Busy(OperationStatus),
    ValidationFailed(Vec<FieldError>),
    NotConfigured,
}

impl TriggerOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            TriggerOutcome::Accepted => "accepted",
            TriggerOutcome::Busy(_) => "busy",
            TriggerOutcome::ValidationFailed(_) => "validation-failed",
            TriggerOutcome::NotConfigured => "not-configured",
        }
    }

    /// Maps a synchronous result onto a response code. Errors that are not
    /// refusals are handed back to the caller.
    pub fn classify<T>(result: Result<T>) -> std::result::Result<(Self, Option<T>), AppError> {
        match result {
            Ok(value) => Ok((TriggerOutcome::Accepted, Some(value))),
            Err(AppError::Busy(status)) => Ok((TriggerOutcome::Busy(status), None)),
            Err(AppError::Validation(errors)) => Ok((TriggerOutcome::ValidationFailed(errors), None)),
            Err(AppError::NotConfigured) => Ok((TriggerOutcome::NotConfigured, None)),
            Err(other) => Err(other),
        }
    }
}

pub struct App {
    status: Arc<StatusRegister>,
    config: Arc<ConfigStore>,
    host: Arc<dyn HostApi>,
    remote: Arc<dyn RemoteStorage>,
    saga: BackupSaga,
    pruner: Arc<RetentionPruner>,
    restore: Arc<RestoreFlow>,
    scheduler: Arc<Scheduler>,
}

impl App {
    pub fn new(
        host: Arc<dyn HostApi>,
        remote: Arc<dyn RemoteStorage>,
        config: Arc<ConfigStore>,
        staging_dir: PathBuf,
    ) -> Self {
        let status = Arc::new(StatusRegister::new());
        let saga = BackupSaga::new(
            Arc::clone(&status),
            Arc::clone(&host),
            Arc::clone(&remote),
            Arc::clone(&config),
            staging_dir.clone(),
        );
        let pruner = Arc::new(RetentionPruner::new(
            Arc::clone(&status),
            Arc::clone(&host),
            Arc::clone(&remote),
            Arc::clone(&config),
        ));
        let restore = Arc::new(RestoreFlow::new(
            Arc::clone(&status),
            Arc::clone(&host),
            Arc::clone(&remote),
            Arc::clone(&config),
            staging_dir,
        ));
        let scheduler = Arc::new(Scheduler::new(saga.clone(), Arc::clone(&pruner), Arc::clone(&config)));

        Self {
            status,
            config,
            host,
            remote,
            saga,
            pruner,
            restore,
            scheduler,
        }
    }

    /// Builds the production wiring: supervisor HTTP client and S3 remote.
    pub fn from_env(settings: &EnvSettings) -> Result<Self> {
        let host = SupervisorClient::new(&settings.supervisor_url, settings.supervisor_token.clone())?;
        let config = ConfigStore::open(&settings.config_dir)?;
        Ok(Self::new(
            Arc::new(host),
            Arc::new(S3Remote::new()),
            Arc::new(config),
            settings.staging_dir.clone(),
        ))
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn schedule_expression(&self) -> Option<String> {
        self.scheduler.active_expression()
    }

    pub fn reset_error(&self) -> bool {
        self.status.reset()
    }

    /// Takes the register and runs the backup in the background.
    pub fn start_manual_backup(&self) -> Result<JoinHandle<SagaReport>> {
        let run = self.saga.begin(BackupOrigin::Manual)?;
        info!(origin = ?run.origin(), "Backup accepted");
        Ok(tokio::spawn(run.execute()))
    }

    pub async fn upload_existing(&self, snapshot_id: &str, name: Option<String>) -> Result<BackupDescriptor> {
        self.saga.upload_existing(snapshot_id, name).await
    }

    /// Takes the register and runs the restore in the background.
    pub fn start_restore(&self, remote_path: &str) -> Result<JoinHandle<Result<String>>> {
        self.restore.begin(remote_path)?;
        info!(path = %remote_path, "Restore accepted");
        let restore = Arc::clone(&self.restore);
        let remote_path = remote_path.to_string();
        Ok(tokio::spawn(async move { restore.execute(&remote_path).await }))
    }

    /// Restores in the foreground, returning the imported snapshot id.
    pub async fn restore_now(&self, remote_path: &str) -> Result<String> {
        self.restore.restore(remote_path).await
    }

    pub async fn clean_now(&self) -> Result<PruneReport> {
        self.pruner.run().await
    }

    /// Host snapshots followed by remote backups of both origins. A store
    /// that cannot be listed is logged and left out.
    pub async fn list_backups(&self) -> Vec<BackupDescriptor> {
        let mut all = match self.host.list_snapshots().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Could not list host snapshots: {:#}", e);
                Vec::new()
            }
        };
        if let Some(conf) = self.config.remote() {
            for origin in [BackupOrigin::Manual, BackupOrigin::Scheduled] {
                let prefix = origin_prefix(&conf.back_dir, origin);
                match self.remote.list(&conf, &prefix).await {
                    Ok(list) => all.extend(list),
                    Err(e) => warn!(prefix = %prefix, "Could not list remote backups: {:#}", e),
                }
            }
        }
        all
    }

    /// Validates and persists a remote configuration. With
    /// `test_connection`, the credentials are tried before anything is saved.
    pub async fn update_remote_config(&self, value: Value, test_connection: bool) -> Result<RemoteConfig> {
        let config = parse_remote_json(value).map_err(AppError::Validation)?;
        if test_connection {
            check_connectivity(self.remote.as_ref(), &config)
                .await
                .map_err(AppError::Validation)?;
        }
        self.config.save_remote(&config)?;
        Ok(config)
    }

    /// Validates and persists a backup configuration, then re-derives the
    /// schedule from it.
    pub fn update_backup_config(&self, value: Value) -> Result<BackupConfig> {
        let config = parse_backup_json(value).map_err(AppError::Validation)?;
        self.config.save_backup(&config)?;
        self.scheduler.reload()?;
        Ok(config)
    }

    /// Re-validates what is persisted. An unconfigured remote is reported as
    /// a field error rather than a refusal.
    pub async fn validate_persisted(&self, test_connection: bool) -> Vec<FieldError> {
        let mut errors = Vec::new();
        match self.config.remote() {
            Some(remote) => {
                if let Err(e) = validate_remote(&remote) {
                    errors.extend(e);
                } else if test_connection {
                    if let Err(e) = check_connectivity(self.remote.as_ref(), &remote).await {
                        errors.extend(e);
                    }
                }
            }
            None => errors.push(FieldError::new("remote", "is not configured")),
        }
        if let Err(e) = validate_backup(&self.config.backup()) {
            errors.extend(e);
        }
        errors
    }

    /// Runs the scheduler until ctrl-c.
    pub async fn run_daemon(&self) -> Result<()> {
        if let Err(e) = self.scheduler.reload() {
            warn!("Persisted schedule rejected, running without one: {}", e);
        }
        let scheduler = Arc::clone(&self.scheduler);
        let handle = tokio::spawn(async move { scheduler.run_loop().await });

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        self.scheduler.shutdown();
        if let Err(e) = handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupLocation;
    use crate::test_support::{FakeHost, FakeRemote, HostCall, configured_store};
    use serde_json::json;
    use std::time::Duration;

    fn app_with(store: Arc<ConfigStore>, dir: &std::path::Path) -> (App, Arc<FakeHost>, Arc<FakeRemote>) {
        let host = Arc::new(FakeHost::new());
        let remote = Arc::new(FakeRemote::new());
        let app = App::new(host.clone(), remote.clone(), store, dir.join("staging"));
        (app, host, remote)
    }

    #[tokio::test]
    async fn test_manual_backup_accepted_then_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (app, host, remote) = app_with(configured_store(dir.path()), dir.path());
        host.hold_fetch();

        let (outcome, handle) = TriggerOutcome::classify(app.start_manual_backup()).unwrap();
        assert_eq!(outcome, TriggerOutcome::Accepted);

        let (second, _) = TriggerOutcome::classify(app.start_manual_backup()).unwrap();
        assert_eq!(second.code(), "busy");

        host.release_fetch();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_completed());
        assert!(report.remote_path.unwrap().starts_with("backups/Manual/Manual-"));
        assert_eq!(remote.object_count(), 1);
        assert_eq!(app.status().status, OperationStatus::Idle);
        assert!(app.status().last_backup.is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_remote_refuses_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path()).unwrap());
        let (app, host, _remote) = app_with(store, dir.path());

        let (backup, _) = TriggerOutcome::classify(app.start_manual_backup()).unwrap();
        let (restore, _) = TriggerOutcome::classify(app.start_restore("x/Auto/a.tar")).unwrap();

        assert_eq!(backup, TriggerOutcome::NotConfigured);
        assert_eq!(restore.code(), "not-configured");
        assert!(host.calls().is_empty());
        assert_eq!(app.status().status, OperationStatus::Idle);
    }

    #[tokio::test]
    async fn test_invalid_backup_config_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = configured_store(dir.path());
        let (app, _host, _remote) = app_with(Arc::clone(&store), dir.path());
        let before = store.backup();

        let result = app.update_backup_config(json!({
            "schedule": { "enabled": true, "expression": "every day at noon" }
        }));

        let (outcome, _) = TriggerOutcome::classify(result).unwrap();
        assert!(matches!(outcome, TriggerOutcome::ValidationFailed(ref e) if e[0].field == "schedule.expression"));
        assert_eq!(store.backup(), before);
        assert_eq!(app.status().next_backup, None);
    }

    #[tokio::test]
    async fn test_valid_backup_config_reschedules() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _host, _remote) = app_with(configured_store(dir.path()), dir.path());

        let saved = app
            .update_backup_config(json!({
                "schedule": { "enabled": true, "expression": "30 2 * * *" },
                "retention": { "local": { "max_count": 3 }, "remote": { "max_age_days": 30 } }
            }))
            .unwrap();

        assert_eq!(saved.retention.local.max_count, 3);
        assert!(app.status().next_backup.is_some());
    }

    #[tokio::test]
    async fn test_remote_config_rejected_when_connection_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path()).unwrap());
        let (app, _host, remote) = app_with(Arc::clone(&store), dir.path());
        remote.fail_connection(true);
        let body = json!({
            "endpoint_url": "https://s3.example.com",
            "region": "us-east-1",
            "bucket_name": "ha",
            "access_key_id": "key",
            "secret_access_key": "secret"
        });

        let result = app.update_remote_config(body.clone(), true).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(store.remote().is_none());

        let saved = app.update_remote_config(body, false).await.unwrap();
        assert_eq!(saved.back_dir, "snapshot-relay");
        assert_eq!(store.remote(), Some(saved));
    }

    #[tokio::test]
    async fn test_list_backups_spans_host_and_both_remote_folders() {
        let dir = tempfile::tempdir().unwrap();
        let (app, host, remote) = app_with(configured_store(dir.path()), dir.path());
        host.seed_snapshot("Manual-2024.1.0", 1);
        remote.seed("backups/Manual/one.tar", 2);
        remote.seed("backups/Auto/two.tar", 3);
        remote.seed("elsewhere/three.tar", 3);

        let all = app.list_backups().await;

        assert_eq!(all.len(), 3);
        assert_eq!(all[0].location, BackupLocation::LocalPending);
        assert_eq!(all[1].origin, BackupOrigin::Manual);
        assert_eq!(all[2].origin, BackupOrigin::Scheduled);
    }

    #[tokio::test]
    async fn test_list_backups_survives_unreachable_host() {
        let dir = tempfile::tempdir().unwrap();
        let (app, host, remote) = app_with(configured_store(dir.path()), dir.path());
        host.fail_on(HostCall::List);
        remote.seed("backups/Auto/two.tar", 3);

        let all = app.list_backups().await;

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "backups/Auto/two.tar");
    }

    #[tokio::test]
    async fn test_restore_runs_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let (app, host, remote) = app_with(configured_store(dir.path()), dir.path());
        remote.seed("backups/Auto/nightly.tar", 1);

        let handle = app.start_restore("backups/Auto/nightly.tar").unwrap();
        let snapshot_id = handle.await.unwrap().unwrap();

        assert!(host.snapshot_ids().contains(&snapshot_id));
        assert_eq!(host.calls(), vec![HostCall::Upload]);
    }

    #[tokio::test]
    async fn test_validate_persisted_reports_missing_remote() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path()).unwrap());
        let (app, _host, _remote) = app_with(store, dir.path());

        let errors = app.validate_persisted(false).await;
        assert_eq!(errors, vec![FieldError::new("remote", "is not configured")]);
    }

    #[tokio::test]
    async fn test_reset_error_after_stuck_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (app, host, _remote) = app_with(configured_store(dir.path()), dir.path());
        host.fail_on(HostCall::Resume);

        let report = app.start_manual_backup().unwrap().await.unwrap();
        assert!(!report.is_completed());
        assert_eq!(app.status().status, OperationStatus::Error);

        assert!(app.reset_error());
        assert_eq!(app.status().status, OperationStatus::Idle);
    }
}
