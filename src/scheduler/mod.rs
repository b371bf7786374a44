//! Cron scheduler - triggers scheduled backups
//!
//! Expressions use the standard five cron fields (`min hour dom month dow`)
//! or the six/seven field form with leading seconds and trailing year.
//! Times are evaluated in the local timezone.

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupOrigin, BackupSaga, SagaOutcome};
use crate::config::validate::FieldError;
use crate::config::{ConfigStore, ScheduleSpec};
use crate::errors::{AppError, Result};
use crate::retention::RetentionPruner;

/// Parses a cron expression, requiring at least one future fire time.
pub fn parse_schedule(expression: &str) -> std::result::Result<Schedule, String> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        n => return Err(format!("expected 5, 6 or 7 fields, found {}", n)),
    };
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression '{}': {}", trimmed, e))?;
    if schedule.upcoming(Local).next().is_none() {
        return Err(format!("cron expression '{}' never fires in the future", trimmed));
    }
    Ok(schedule)
}

/// How often the loop re-reads the persisted configuration.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);

struct ActiveSchedule {
    expression: String,
    schedule: Schedule,
}

pub struct Scheduler {
    saga: BackupSaga,
    pruner: Arc<RetentionPruner>,
    config: Arc<ConfigStore>,
    active: RwLock<Option<ActiveSchedule>>,
    // Last persisted schedule this scheduler acted on, valid or not.
    applied: Mutex<Option<ScheduleSpec>>,
    changed: Notify,
    shutdown: Notify,
}

impl Scheduler {
    pub fn new(saga: BackupSaga, pruner: Arc<RetentionPruner>, config: Arc<ConfigStore>) -> Self {
        Self {
            saga,
            pruner,
            config,
            active: RwLock::new(None),
            applied: Mutex::new(None),
            changed: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    /// Activates `requested`, replacing the current schedule. A disabled schedule
    /// deactivates. An invalid expression is rejected and the current
    /// schedule stays in force.
    pub fn activate(&self, requested: &ScheduleSpec) -> Result<()> {
        if !requested.enabled {
            self.deactivate();
            return Ok(());
        }
        let schedule = parse_schedule(&requested.expression)
            .map_err(|message| AppError::Validation(vec![FieldError::new("schedule.expression", message)]))?;

        *self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ActiveSchedule {
            expression: requested.expression.clone(),
            schedule,
        });
        let next = self.next_fire_time();
        self.saga.status().set_next_backup(next);
        info!(schedule = %requested.expression, next_run = ?next, "Backup schedule activated");
        self.changed.notify_one();
        Ok(())
    }

    pub fn deactivate(&self) {
        let previous = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.saga.status().set_next_backup(None);
        if let Some(previous) = previous {
            info!(schedule = %previous.expression, "Backup schedule deactivated");
        }
        self.changed.notify_one();
    }

    /// Re-derives the schedule from the persisted configuration.
    pub fn reload(&self) -> Result<()> {
        let persisted = self.config.backup().schedule;
        *self.applied.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(persisted.clone());
        self.activate(&persisted)
    }

    /// Reloads when the persisted schedule differs from the last one seen,
    /// which picks up saves made by other processes. Returns whether a
    /// reload happened.
    pub fn sync_with_config(&self) -> bool {
        let persisted = self.config.backup().schedule;
        let unchanged = self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            == Some(&persisted);
        if unchanged {
            return false;
        }
        info!(schedule = %persisted.expression, enabled = persisted.enabled, "Persisted schedule changed");
        if let Err(e) = self.reload() {
            warn!("Persisted schedule rejected, keeping the current one: {}", e);
        }
        true
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(|active| active.schedule.upcoming(Local).next())
            .map(|next| next.with_timezone(&Utc))
    }

    pub fn active_expression(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|active| active.expression.clone())
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Runs until [`Scheduler::shutdown`] is called.
    pub async fn run_loop(&self) {
        info!("Scheduler started");
        loop {
            let next = self.next_fire_time();
            self.saga.status().set_next_backup(next);
            let wait = next
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = self.changed.notified() => {
                    debug!("Schedule changed, recomputing next run");
                    continue;
                }
                _ = tokio::time::sleep(CONFIG_POLL_INTERVAL) => {
                    self.sync_with_config();
                }
                _ = tokio::time::sleep(wait), if next.is_some() => {
                    self.trigger().await;
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Fires one scheduled backup. A busy register skips this run; it is
    /// neither retried nor queued.
    pub async fn trigger(&self) {
        let report = match self.saga.run(BackupOrigin::Scheduled).await {
            Ok(report) => report,
            Err(AppError::Busy(status)) => {
                warn!(status = %status, "Scheduled backup skipped, another operation is in progress");
                return;
            }
            Err(e) => {
                warn!("Scheduled backup not started: {}", e);
                return;
            }
        };

        match &report.outcome {
            SagaOutcome::Completed => {
                if self.config.backup().auto_clean_after_backup {
                    if let Err(e) = self.pruner.run().await {
                        warn!("Retention pruning after scheduled backup failed: {}", e);
                    }
                }
            }
            SagaOutcome::Compensated(e) => warn!("Scheduled backup failed: {}", e),
            SagaOutcome::Stuck { resume, .. } => error!("Scheduled backup left the host paused: {}", resume),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{OperationStatus, StatusRegister};
    use crate::test_support::{FakeHost, FakeRemote, configured_store};

    struct Fixture {
        dir: tempfile::TempDir,
        scheduler: Arc<Scheduler>,
        host: Arc<FakeHost>,
        remote: Arc<FakeRemote>,
        status: Arc<StatusRegister>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = configured_store(dir.path());
        let host = Arc::new(FakeHost::new());
        let remote = Arc::new(FakeRemote::new());
        let status = Arc::new(StatusRegister::new());
        let saga = BackupSaga::new(
            Arc::clone(&status),
            host.clone(),
            remote.clone(),
            Arc::clone(&store),
            dir.path().join("staging"),
        );
        let pruner = Arc::new(RetentionPruner::new(
            Arc::clone(&status),
            host.clone(),
            remote.clone(),
            Arc::clone(&store),
        ));
        Fixture {
            dir,
            scheduler: Arc::new(Scheduler::new(saga, pruner, store)),
            host,
            remote,
            status,
        }
    }

    fn enabled(expression: &str) -> ScheduleSpec {
        ScheduleSpec {
            enabled: true,
            expression: expression.to_string(),
        }
    }

    #[test]
    fn test_parse_schedule_field_counts() {
        assert!(parse_schedule("0 3 * * *").is_ok());
        assert!(parse_schedule("0 0 3 * * *").is_ok());
        assert!(parse_schedule("0 0 3 * * * *").is_ok());
        assert!(parse_schedule("not a cron").is_err());
        assert!(parse_schedule("* *").is_err());
        assert!(parse_schedule("0 0 3 * * * 2001").is_err());
    }

    #[test]
    fn test_invalid_expression_keeps_previous_schedule() {
        let f = fixture();
        f.scheduler.activate(&enabled("0 3 * * *")).unwrap();
        let before = f.scheduler.next_fire_time();
        assert!(before.is_some());

        let result = f.scheduler.activate(&enabled("61 * * * *"));
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(f.scheduler.active_expression().as_deref(), Some("0 3 * * *"));
        assert_eq!(f.scheduler.next_fire_time(), before);
        assert_eq!(f.status.snapshot().next_backup, before);
    }

    #[test]
    fn test_disabled_schedule_deactivates() {
        let f = fixture();
        f.scheduler.activate(&enabled("0 3 * * *")).unwrap();
        f.scheduler
            .activate(&ScheduleSpec {
                enabled: false,
                expression: "0 3 * * *".to_string(),
            })
            .unwrap();
        assert_eq!(f.scheduler.next_fire_time(), None);
        assert_eq!(f.status.snapshot().next_backup, None);
    }

    #[test]
    fn test_schedule_saved_elsewhere_is_picked_up() {
        let f = fixture();
        f.scheduler.reload().unwrap();
        assert!(!f.scheduler.sync_with_config());
        assert_eq!(f.status.snapshot().next_backup, None);

        // A second store on the same directory, as a separate process would have.
        let other = ConfigStore::open(&f.dir.path().join("config")).unwrap();
        let mut backup = other.backup();
        backup.schedule = enabled("*/5 * * * *");
        other.save_backup(&backup).unwrap();

        assert!(f.scheduler.sync_with_config());
        assert_eq!(f.scheduler.active_expression().as_deref(), Some("*/5 * * * *"));
        assert!(f.status.snapshot().next_backup.is_some());
        assert!(!f.scheduler.sync_with_config());
    }

    #[tokio::test]
    async fn test_trigger_skips_when_busy() {
        let f = fixture();
        f.status.try_acquire_for(OperationStatus::Upload).unwrap();

        f.scheduler.trigger().await;

        assert!(f.host.calls().is_empty());
        assert_eq!(f.status.current(), OperationStatus::Upload);
    }

    #[tokio::test]
    async fn test_trigger_runs_scheduled_backup() {
        let f = fixture();
        f.scheduler.trigger().await;

        assert_eq!(f.remote.object_count(), 1);
        assert_eq!(f.status.current(), OperationStatus::Idle);
    }

    #[tokio::test]
    async fn test_run_loop_fires_and_stops() {
        let f = fixture();
        f.scheduler.activate(&enabled("* * * * * *")).unwrap();

        let scheduler = Arc::clone(&f.scheduler);
        let handle = tokio::spawn(async move { scheduler.run_loop().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.remote.object_count() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        f.scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
