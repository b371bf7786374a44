//! Process-wide operation status.
//!
//! [`StatusRegister`] is the single source of truth for "is an operation in
//! progress". Every backup, upload and restore run enters through
//! [`StatusRegister::try_acquire`] (or [`StatusRegister::try_acquire_for`]),
//! so the scheduler and manually triggered commands compose through the same
//! gate without extra locking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};

/// Current phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Idle,
    Stopping,
    Creating,
    Download,
    Upload,
    Starting,
    Error,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Idle => "idle",
            OperationStatus::Stopping => "stopping",
            OperationStatus::Creating => "creating",
            OperationStatus::Download => "download",
            OperationStatus::Upload => "upload",
            OperationStatus::Starting => "starting",
            OperationStatus::Error => "error",
        }
    }

    /// Phases during which an artifact is partially written somewhere.
    pub fn is_transfer(self) -> bool {
        matches!(self, OperationStatus::Download | OperationStatus::Upload)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read model handed to presenters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: OperationStatus,
    pub last_backup: Option<DateTime<Utc>>,
    pub next_backup: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct StatusState {
    status: OperationStatus,
    last_backup: Option<DateTime<Utc>>,
    next_backup: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct StatusRegister {
    state: Mutex<StatusState>,
    // Held exclusively by a run while it is in `download`/`upload`,
    // shared by retention pruning.
    transfer_lock: Arc<RwLock<()>>,
}

impl Default for StatusRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegister {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StatusState {
                status: OperationStatus::Idle,
                last_backup: None,
                next_backup: None,
                last_error: None,
            }),
            transfer_lock: Arc::new(RwLock::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusState> {
        // A poisoned lock only means a panic happened mid-update of plain data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquires exclusive run rights, entering the first backup phase.
    pub fn try_acquire(&self) -> Result<()> {
        self.try_acquire_for(OperationStatus::Stopping)
    }

    /// Acquires exclusive run rights, entering `first_phase`.
    ///
    /// Succeeds only from `idle`; `error` must be reset explicitly first.
    pub fn try_acquire_for(&self, first_phase: OperationStatus) -> Result<()> {
        let mut state = self.lock();
        if state.status != OperationStatus::Idle {
            debug!(status = %state.status, "Acquire refused");
            return Err(AppError::Busy(state.status));
        }
        state.status = first_phase;
        info!(phase = %first_phase, "Operation started");
        Ok(())
    }

    pub fn set_phase(&self, phase: OperationStatus) {
        let mut state = self.lock();
        if state.status == OperationStatus::Idle {
            warn!(phase = %phase, "Phase change without an acquired run");
        }
        debug!(from = %state.status, to = %phase, "Phase change");
        state.status = phase;
    }

    /// Returns the register to `idle`. `succeeded` records the completion time
    /// as the last successful backup.
    pub fn release(&self, succeeded: bool) {
        let mut state = self.lock();
        state.status = OperationStatus::Idle;
        if succeeded {
            state.last_backup = Some(Utc::now());
            state.last_error = None;
        }
    }

    /// Records a failure message, moving to `error`.
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.lock();
        state.status = OperationStatus::Error;
        state.last_error = Some(message.into());
    }

    /// Remembers a failure without changing the phase.
    pub fn note_error(&self, message: impl Into<String>) {
        self.lock().last_error = Some(message.into());
    }

    /// Operator reset out of `error`. Returns whether a reset happened.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        if state.status == OperationStatus::Error {
            state.status = OperationStatus::Idle;
            info!("Status reset from error to idle");
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> OperationStatus {
        self.lock().status
    }

    pub fn set_next_backup(&self, next: Option<DateTime<Utc>>) {
        self.lock().next_backup = next;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        StatusSnapshot {
            status: state.status,
            last_backup: state.last_backup,
            next_backup: state.next_backup,
            last_error: state.last_error.clone(),
        }
    }

    /// Exclusive transfer guard, taken by a run before `download`.
    pub async fn begin_transfer(&self) -> TransferGuard {
        TransferGuard {
            _guard: Arc::clone(&self.transfer_lock).write_owned().await,
        }
    }

    /// Shared guard for retention pruning. Refused while a run is in a
    /// transfer phase.
    pub fn begin_prune(&self) -> Result<PruneGuard> {
        let status = self.current();
        if status.is_transfer() {
            return Err(AppError::Busy(status));
        }
        match Arc::clone(&self.transfer_lock).try_read_owned() {
            Ok(guard) => Ok(PruneGuard { _guard: guard }),
            Err(_) => Err(AppError::Busy(self.current())),
        }
    }
}

pub struct TransferGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

pub struct PruneGuard {
    _guard: OwnedRwLockReadGuard<()>,
}
