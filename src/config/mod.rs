// snapshot-relay/src/config/mod.rs
pub mod validate;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

const REMOTE_CONFIG_FILE: &str = "remote.json";
const BACKUP_CONFIG_FILE: &str = "backup.json";
const CONTROL_SOCKET_FILE: &str = "control.sock";
const DEFAULT_CONFIG_DIR: &str = "./data";
const DEFAULT_STAGING_DIR: &str = "./staging";
const DEFAULT_SUPERVISOR_URL: &str = "http://supervisor";

pub const DEFAULT_NAME_TEMPLATE: &str = "{type}-{ha_version}-{date}_{hour}";
pub const DEFAULT_CRON: &str = "0 3 * * *";

/// Connection settings for the S3-compatible remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub endpoint_url: String,
    pub region: String,
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default = "default_back_dir")]
    pub back_dir: String,
}

fn default_back_dir() -> String {
    "snapshot-relay".to_string()
}

/// Keep rules for one store. Zero disables a dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_count: u32,
    #[serde(default)]
    pub max_age_days: u32,
}

impl RetentionPolicy {
    pub fn is_disabled(&self) -> bool {
        self.max_count == 0 && self.max_age_days == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub local: RetentionPolicy,
    #[serde(default)]
    pub remote: RetentionPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            local: RetentionPolicy { max_count: 5, max_age_days: 0 },
            remote: RetentionPolicy { max_count: 7, max_age_days: 0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub enabled: bool,
    pub expression: String,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            expression: DEFAULT_CRON.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_name_template")]
    pub name_template: String,
    #[serde(default)]
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Workload slugs paused for the duration of a backup.
    #[serde(default)]
    pub auto_stop_workloads: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_clean_after_backup: bool,
}

fn default_name_template() -> String {
    DEFAULT_NAME_TEMPLATE.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            name_template: default_name_template(),
            schedule: ScheduleSpec::default(),
            retention: RetentionConfig::default(),
            auto_stop_workloads: Vec::new(),
            auto_clean_after_backup: true,
        }
    }
}

/// Process settings taken from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub config_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub supervisor_url: String,
    pub supervisor_token: Option<String>,
    /// Unix socket of the process that owns the status register.
    pub control_socket: PathBuf,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        if let Err(e) = dotenv::dotenv() {
            debug!("No .env file loaded: {}", e);
        }
        let config_dir = env::var("SNAPSHOT_RELAY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
        Self {
            control_socket: env::var("SNAPSHOT_RELAY_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|_| config_dir.join(CONTROL_SOCKET_FILE)),
            config_dir,
            staging_dir: env::var("SNAPSHOT_RELAY_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_STAGING_DIR)),
            supervisor_url: env::var("SUPERVISOR_URL")
                .unwrap_or_else(|_| DEFAULT_SUPERVISOR_URL.to_string()),
            supervisor_token: env::var("SUPERVISOR_TOKEN").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Persisted configuration. Readers get the last valid value on disk, so
/// saves from other processes are picked up; callers validate before calling
/// the `save_*` methods.
#[derive(Debug)]
pub struct ConfigStore {
    dir: PathBuf,
    remote: RwLock<Option<RemoteConfig>>,
    backup: RwLock<BackupConfig>,
}

impl ConfigStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let remote = read_json_file::<RemoteConfig>(&dir.join(REMOTE_CONFIG_FILE))?;
        if remote.is_none() {
            warn!("Remote storage is not configured yet; backups will be refused until it is");
        }
        let backup = read_json_file::<BackupConfig>(&dir.join(BACKUP_CONFIG_FILE))?
            .unwrap_or_default();

        info!(dir = %dir.display(), "Configuration loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            remote: RwLock::new(remote),
            backup: RwLock::new(backup),
        })
    }

    /// Re-reads both files so saves made by another process take effect.
    /// Unreadable or invalid files are logged and the last good value kept.
    /// Returns whether anything changed.
    pub fn refresh(&self) -> bool {
        let remote = self.refresh_remote();
        let backup = self.refresh_backup();
        remote || backup
    }

    fn refresh_remote(&self) -> bool {
        let path = self.dir.join(REMOTE_CONFIG_FILE);
        let on_disk = match read_json_file::<RemoteConfig>(&path) {
            Ok(on_disk) => on_disk,
            Err(e) => {
                warn!("Keeping previous remote configuration: {:#}", e);
                return false;
            }
        };
        if let Some(Err(errors)) = on_disk.as_ref().map(validate::validate_remote) {
            warn!(file = %path.display(), "Keeping previous remote configuration, file is invalid: {:?}", errors);
            return false;
        }
        replace_if_changed(&self.remote, on_disk)
    }

    fn refresh_backup(&self) -> bool {
        let path = self.dir.join(BACKUP_CONFIG_FILE);
        let on_disk = match read_json_file::<BackupConfig>(&path) {
            Ok(on_disk) => on_disk.unwrap_or_default(),
            Err(e) => {
                warn!("Keeping previous backup configuration: {:#}", e);
                return false;
            }
        };
        if let Err(errors) = validate::validate_backup(&on_disk) {
            warn!(file = %path.display(), "Keeping previous backup configuration, file is invalid: {:?}", errors);
            return false;
        }
        replace_if_changed(&self.backup, on_disk)
    }

    pub fn remote(&self) -> Option<RemoteConfig> {
        self.refresh_remote();
        self.remote
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn backup(&self) -> BackupConfig {
        self.refresh_backup();
        self.backup
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn save_remote(&self, config: &RemoteConfig) -> Result<()> {
        write_json_file(&self.dir.join(REMOTE_CONFIG_FILE), config)?;
        *self.remote.write().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(config.clone());
        info!(endpoint = %config.endpoint_url, bucket = %config.bucket_name, "Remote configuration saved");
        Ok(())
    }

    pub fn save_backup(&self, config: &BackupConfig) -> Result<()> {
        write_json_file(&self.dir.join(BACKUP_CONFIG_FILE), config)?;
        *self.backup.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = config.clone();
        info!("Backup configuration saved");
        Ok(())
    }
}

fn replace_if_changed<T: PartialEq>(slot: &RwLock<T>, value: T) -> bool {
    let mut current = slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if *current == value {
        return false;
    }
    *current = value;
    debug!("Configuration changed on disk");
    true
}

fn read_json_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON from config file at {}", path.display()))?;
    Ok(Some(value))
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize config for {}", path.display()))?;
    // Readers never observe a half-written file.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .with_context(|| format!("Failed to write config file: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move config file into place: {}", path.display()))?;
    Ok(())
}
