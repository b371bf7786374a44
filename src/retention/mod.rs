// snapshot-relay/src/retention/mod.rs
//! Retention pruning of host snapshots and remote backups.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::naming::origin_prefix;
use crate::backup::{BackupDescriptor, BackupOrigin};
use crate::config::{ConfigStore, RemoteConfig, RetentionConfig, RetentionPolicy};
use crate::errors::Result;
use crate::host::HostApi;
use crate::remote::RemoteStorage;
use crate::status::StatusRegister;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub deleted_local: Vec<String>,
    pub deleted_remote: Vec<String>,
    pub failed: usize,
}

/// Items `policy` says to delete, newest first. Count and age rules are
/// applied independently and their results unioned.
pub fn select_for_deletion<'a>(
    items: &'a [BackupDescriptor],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a BackupDescriptor> {
    if policy.is_disabled() {
        return Vec::new();
    }

    let mut sorted: Vec<&BackupDescriptor> = items.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let cutoff = (policy.max_age_days > 0).then(|| now - Duration::days(i64::from(policy.max_age_days)));
    let keep_count = policy.max_count as usize;

    sorted
        .into_iter()
        .enumerate()
        .filter(|(index, item)| {
            let over_count = keep_count > 0 && *index >= keep_count;
            let too_old = cutoff.is_some_and(|cutoff| item.created_at < cutoff);
            over_count || too_old
        })
        .map(|(_, item)| item)
        .collect()
}

pub struct RetentionPruner {
    status: Arc<StatusRegister>,
    host: Arc<dyn HostApi>,
    remote: Arc<dyn RemoteStorage>,
    config: Arc<ConfigStore>,
}

impl RetentionPruner {
    pub fn new(
        status: Arc<StatusRegister>,
        host: Arc<dyn HostApi>,
        remote: Arc<dyn RemoteStorage>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            status,
            host,
            remote,
            config,
        }
    }

    /// Lists both stores and prunes them with the persisted policy.
    ///
    /// Remote pruning only looks at the scheduled folder; manual backups are
    /// kept until removed by hand.
    pub async fn run(&self) -> Result<PruneReport> {
        // Refuse before listing; `prune` takes the guard for the deletions.
        drop(self.status.begin_prune()?);
        let retention = self.config.backup().retention;

        let local = match self.host.list_snapshots().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Could not list host snapshots, skipping local pruning: {:#}", e);
                Vec::new()
            }
        };
        let remote = match self.config.remote() {
            Some(conf) => {
                let prefix = origin_prefix(&conf.back_dir, BackupOrigin::Scheduled);
                match self.remote.list(&conf, &prefix).await {
                    Ok(list) => list,
                    Err(e) => {
                        warn!("Could not list remote backups, skipping remote pruning: {:#}", e);
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        self.prune(&local, &remote, &retention).await
    }

    /// Prunes the given lists. Refused while a run is transferring.
    pub async fn prune(
        &self,
        local: &[BackupDescriptor],
        remote: &[BackupDescriptor],
        retention: &RetentionConfig,
    ) -> Result<PruneReport> {
        let _guard = self.status.begin_prune()?;
        let remote_config = self.config.remote();
        Ok(self
            .delete_selected(local, remote, retention, remote_config.as_ref(), Utc::now())
            .await)
    }

    async fn delete_selected(
        &self,
        local: &[BackupDescriptor],
        remote: &[BackupDescriptor],
        retention: &RetentionConfig,
        remote_config: Option<&RemoteConfig>,
        now: DateTime<Utc>,
    ) -> PruneReport {
        let local_doomed = select_for_deletion(local, &retention.local, now);
        let remote_doomed = match remote_config {
            Some(_) => select_for_deletion(remote, &retention.remote, now),
            None => Vec::new(),
        };

        let local_task = async {
            let mut deleted = Vec::new();
            let mut failed = 0;
            for item in dedup(local_doomed) {
                match self.host.delete_snapshot(&item.id).await {
                    Ok(()) => {
                        info!(snapshot = %item.id, name = %item.name, "Deleted host snapshot");
                        deleted.push(item.id.clone());
                    }
                    Err(e) => {
                        warn!(snapshot = %item.id, "Failed to delete host snapshot: {:#}", e);
                        failed += 1;
                    }
                }
            }
            (deleted, failed)
        };

        let remote_task = async {
            let mut deleted = Vec::new();
            let mut failed = 0;
            let Some(conf) = remote_config else {
                return (deleted, failed);
            };
            for item in dedup(remote_doomed) {
                match self.remote.delete(conf, &item.id).await {
                    Ok(()) => {
                        info!(path = %item.id, "Deleted remote backup");
                        deleted.push(item.id.clone());
                    }
                    Err(e) => {
                        warn!(path = %item.id, "Failed to delete remote backup: {:#}", e);
                        failed += 1;
                    }
                }
            }
            (deleted, failed)
        };

        let ((deleted_local, local_failed), (deleted_remote, remote_failed)) =
            tokio::join!(local_task, remote_task);

        info!(
            local = deleted_local.len(),
            remote = deleted_remote.len(),
            failed = local_failed + remote_failed,
            "Retention pruning finished"
        );
        PruneReport {
            deleted_local,
            deleted_remote,
            failed: local_failed + remote_failed,
        }
    }
}

fn dedup(items: Vec<&BackupDescriptor>) -> Vec<&BackupDescriptor> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.id.as_str())).collect()
}
