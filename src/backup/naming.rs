// snapshot-relay/src/backup/naming.rs
//! Backup names and remote destination paths.
//!
//! Supported template tokens: `{type}`, `{type_low}`, `{ha_version}`,
//! `{date}`, `{hour}`, `{hour_12}`, `{day}`, `{month}`, `{year}`,
//! `{year_short}`. Unknown tokens are left as-is.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

use super::BackupOrigin;

const ARCHIVE_EXTENSION: &str = ".tar";

pub fn render_name(template: &str, origin: BackupOrigin, version: &str, now: DateTime<Local>) -> String {
    let label = origin.label();
    let rendered = template
        .replace("{type_low}", &label.to_ascii_lowercase())
        .replace("{type}", label)
        .replace("{ha_version}", version)
        .replace("{date}", &now.format("%Y-%m-%d").to_string())
        .replace("{hour_12}", &now.format("%I%M%p").to_string())
        .replace("{hour}", &now.format("%H%M").to_string())
        .replace("{day}", &now.format("%d").to_string())
        .replace("{month}", &now.format("%m").to_string())
        .replace("{year_short}", &now.format("%y").to_string())
        .replace("{year}", &now.format("%Y").to_string());
    sanitize_name(&rendered)
}

/// Replaces path separators so a name always stays one path segment.
pub fn sanitize_name(name: &str) -> String {
    name.trim().replace(['/', '\\'], "-")
}

/// True when `segment` can be joined onto a directory without leaving it.
pub fn is_single_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".." && !segment.contains(['/', '\\'])
}

/// Remote folder holding backups of the given origin.
pub fn origin_prefix(back_dir: &str, origin: BackupOrigin) -> String {
    let base = back_dir.trim_matches('/');
    if base.is_empty() {
        format!("{}/", origin.label())
    } else {
        format!("{}/{}/", base, origin.label())
    }
}

/// Full remote path of a backup. Manual and scheduled backups live in
/// separate folders, so they never share a path.
pub fn destination_path(back_dir: &str, origin: BackupOrigin, name: &str) -> String {
    format!("{}{}{}", origin_prefix(back_dir, origin), name, ARCHIVE_EXTENSION)
}

pub fn staging_path(staging_dir: &Path, snapshot_id: &str) -> PathBuf {
    staging_dir.join(format!("{}{}", snapshot_id, ARCHIVE_EXTENSION))
}

pub fn name_from_path(remote_path: &str) -> String {
    let file_name = remote_path.rsplit('/').next().unwrap_or(remote_path);
    file_name
        .strip_suffix(ARCHIVE_EXTENSION)
        .unwrap_or(file_name)
        .to_string()
}

pub fn origin_from_path(remote_path: &str) -> BackupOrigin {
    let manual = BackupOrigin::Manual.label();
    if remote_path.split('/').any(|segment| segment == manual) {
        BackupOrigin::Manual
    } else {
        BackupOrigin::Scheduled
    }
}
