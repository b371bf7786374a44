//! In-memory host and remote fakes shared by the unit tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::backup::naming::{name_from_path, origin_from_path};
use crate::backup::{BackupDescriptor, BackupLocation, BackupOrigin};
use crate::config::{BackupConfig, ConfigStore, RemoteConfig};
use crate::host::HostApi;
use crate::remote::RemoteStorage;

pub const HOST_VERSION: &str = "2024.1.0";

pub fn remote_config() -> RemoteConfig {
    RemoteConfig {
        endpoint_url: "https://s3.example.com".to_string(),
        region: "us-east-1".to_string(),
        bucket_name: "ha".to_string(),
        access_key_id: "key".to_string(),
        secret_access_key: "secret".to_string(),
        back_dir: "backups".to_string(),
    }
}

/// A config store with a saved remote configuration and one paused workload.
pub fn configured_store(dir: &Path) -> Arc<ConfigStore> {
    let store = ConfigStore::open(&dir.join("config")).unwrap();
    store.save_remote(&remote_config()).unwrap();
    let backup = BackupConfig {
        auto_stop_workloads: vec!["core_mariadb".to_string()],
        ..BackupConfig::default()
    };
    store.save_backup(&backup).unwrap();
    Arc::new(store)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Pause,
    Resume,
    Version,
    Create,
    Fetch,
    List,
    Delete,
    Upload,
}

#[derive(Default)]
struct HostState {
    calls: Vec<HostCall>,
    failing: HashSet<HostCall>,
    failing_deletes: HashSet<String>,
    snapshots: Vec<BackupDescriptor>,
    next_id: u32,
    paused_runs: usize,
    max_paused_runs: usize,
}

pub struct FakeHost {
    state: Mutex<HostState>,
    fetch_held: AtomicBool,
    fetch_gate: Semaphore,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            fetch_held: AtomicBool::new(false),
            fetch_gate: Semaphore::new(0),
        }
    }

    fn record(&self, call: HostCall) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.failing.contains(&call) {
            return Err(anyhow!("injected {:?} failure", call));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_on(&self, call: HostCall) {
        self.state.lock().unwrap().failing.insert(call);
    }

    pub fn fail_delete_of(&self, id: &str) {
        self.state.lock().unwrap().failing_deletes.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    /// Blocks `fetch_snapshot` until [`FakeHost::release_fetch`].
    pub fn hold_fetch(&self) {
        self.fetch_held.store(true, Ordering::SeqCst);
    }

    pub fn release_fetch(&self) {
        self.fetch_held.store(false, Ordering::SeqCst);
        self.fetch_gate.add_permits(64);
    }

    /// Highest number of runs that were paused at the same time.
    pub fn max_concurrent_runs(&self) -> usize {
        self.state.lock().unwrap().max_paused_runs
    }

    pub fn seed_snapshot(&self, name: &str, age_days: i64) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("snap{:04}", state.next_id);
        state.snapshots.push(BackupDescriptor {
            id: id.clone(),
            name: name.to_string(),
            created_at: Utc::now() - Duration::days(age_days),
            size_bytes: 1024,
            origin: BackupOrigin::guess_from_name(name),
            location: BackupLocation::LocalPending,
        });
        id
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }
}

#[async_trait]
impl HostApi for FakeHost {
    async fn pause_workloads(&self, _slugs: &[String]) -> Result<()> {
        self.record(HostCall::Pause)?;
        let mut state = self.state.lock().unwrap();
        state.paused_runs += 1;
        state.max_paused_runs = state.max_paused_runs.max(state.paused_runs);
        Ok(())
    }

    async fn resume_workloads(&self, _slugs: &[String]) -> Result<()> {
        self.record(HostCall::Resume)?;
        let mut state = self.state.lock().unwrap();
        state.paused_runs = state.paused_runs.saturating_sub(1);
        Ok(())
    }

    async fn host_version(&self) -> Result<String> {
        self.record(HostCall::Version)?;
        Ok(HOST_VERSION.to_string())
    }

    async fn create_snapshot(&self, name: &str) -> Result<String> {
        self.record(HostCall::Create)?;
        Ok(self.seed_snapshot(name, 0))
    }

    async fn fetch_snapshot(&self, snapshot_id: &str, dest: &Path) -> Result<u64> {
        self.record(HostCall::Fetch)?;
        if self.fetch_held.load(Ordering::SeqCst) {
            self.fetch_gate.acquire().await?.forget();
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = format!("snapshot {}", snapshot_id).into_bytes();
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn list_snapshots(&self) -> Result<Vec<BackupDescriptor>> {
        self.record(HostCall::List)?;
        Ok(self.state.lock().unwrap().snapshots.clone())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.record(HostCall::Delete)?;
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(snapshot_id) {
            return Err(anyhow!("injected delete failure for {}", snapshot_id));
        }
        state.snapshots.retain(|s| s.id != snapshot_id);
        Ok(())
    }

    async fn upload_snapshot(&self, file: &Path) -> Result<String> {
        self.record(HostCall::Upload)?;
        let name = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(self.seed_snapshot(&name, 0))
    }
}

#[derive(Default)]
struct RemoteState {
    objects: BTreeMap<String, (Vec<u8>, DateTime<Utc>)>,
    failing_deletes: HashSet<String>,
}

pub struct FakeRemote {
    state: Mutex<RemoteState>,
    fail_uploads: AtomicBool,
    fail_connection: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            fail_uploads: AtomicBool::new(false),
            fail_connection: AtomicBool::new(false),
        }
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connection(&self, fail: bool) {
        self.fail_connection.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, path: &str) {
        self.state.lock().unwrap().failing_deletes.insert(path.to_string());
    }

    pub fn seed(&self, path: &str, age_days: i64) {
        self.state.lock().unwrap().objects.insert(
            path.to_string(),
            (b"seeded".to_vec(), Utc::now() - Duration::days(age_days)),
        );
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(path)
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }
}

#[async_trait]
impl RemoteStorage for FakeRemote {
    async fn upload(&self, _config: &RemoteConfig, local_file: &Path, remote_path: &str) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(anyhow!("injected upload failure"));
        }
        let body = tokio::fs::read(local_file).await?;
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(remote_path.to_string(), (body, Utc::now()));
        Ok(())
    }

    async fn download(&self, _config: &RemoteConfig, remote_path: &str, dest: &Path) -> Result<u64> {
        let body = self
            .state
            .lock()
            .unwrap()
            .objects
            .get(remote_path)
            .map(|(body, _)| body.clone())
            .ok_or_else(|| anyhow!("no such object: {}", remote_path))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn list(&self, _config: &RemoteConfig, prefix: &str) -> Result<Vec<BackupDescriptor>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, (body, created_at))| BackupDescriptor {
                id: path.clone(),
                name: name_from_path(path),
                created_at: *created_at,
                size_bytes: body.len() as u64,
                origin: origin_from_path(path),
                location: BackupLocation::Remote,
            })
            .collect())
    }

    async fn delete(&self, _config: &RemoteConfig, remote_path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(remote_path) {
            return Err(anyhow!("injected delete failure for {}", remote_path));
        }
        state.objects.remove(remote_path);
        Ok(())
    }

    async fn test_connection(&self, _config: &RemoteConfig) -> Result<()> {
        if self.fail_connection.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }
}
