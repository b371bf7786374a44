// snapshot-relay/src/backup/descriptor.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOrigin {
    Manual,
    Scheduled,
}

impl BackupOrigin {
    /// Capitalized label, used for `{type}` and the remote folder name.
    pub fn label(self) -> &'static str {
        match self {
            BackupOrigin::Manual => "Manual",
            BackupOrigin::Scheduled => "Auto",
        }
    }

    /// Best guess for artifacts we did not produce in this process: names
    /// rendered from the default template carry the origin label.
    pub fn guess_from_name(name: &str) -> Self {
        if name.to_ascii_lowercase().contains("manual") {
            BackupOrigin::Manual
        } else {
            BackupOrigin::Scheduled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupLocation {
    LocalPending,
    Remote,
}

/// One backup artifact, either a host snapshot or a remote object.
///
/// For host snapshots `id` is the snapshot slug; for remote objects it is the
/// full object path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub origin: BackupOrigin,
    pub location: BackupLocation,
}
