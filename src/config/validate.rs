// snapshot-relay/src/config/validate.rs
//! Structural validation of configuration before it is persisted.
//!
//! Everything here is side-effect free except [`check_connectivity`], which
//! issues one authenticated request against the remote store and is only run
//! when the caller opts in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{BackupConfig, RemoteConfig, RetentionPolicy};
use crate::remote::RemoteStorage;
use crate::scheduler::parse_schedule;

pub const MAX_RETENTION_COUNT: u32 = 1000;
pub const MAX_RETENTION_AGE_DAYS: u32 = 3650;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Validation = std::result::Result<(), Vec<FieldError>>;

fn require(errors: &mut Vec<FieldError>, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "is required"));
    }
}

pub fn validate_remote(config: &RemoteConfig) -> Validation {
    let mut errors = Vec::new();

    require(&mut errors, "endpoint_url", &config.endpoint_url);
    if !config.endpoint_url.trim().is_empty() {
        match Url::parse(&config.endpoint_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                if url.host_str().is_none() {
                    errors.push(FieldError::new("endpoint_url", "must include a host"));
                }
            }
            Ok(url) => errors.push(FieldError::new(
                "endpoint_url",
                format!("unsupported scheme '{}', expected http or https", url.scheme()),
            )),
            Err(e) => errors.push(FieldError::new("endpoint_url", format!("invalid URL: {}", e))),
        }
    }
    require(&mut errors, "region", &config.region);
    require(&mut errors, "bucket_name", &config.bucket_name);
    require(&mut errors, "access_key_id", &config.access_key_id);
    require(&mut errors, "secret_access_key", &config.secret_access_key);
    if config.back_dir.split('/').any(|segment| segment == "..") {
        errors.push(FieldError::new("back_dir", "must not contain '..' segments"));
    }

    finish(errors)
}

fn validate_policy(errors: &mut Vec<FieldError>, prefix: &str, policy: &RetentionPolicy) {
    if policy.max_count > MAX_RETENTION_COUNT {
        errors.push(FieldError::new(
            format!("{}.max_count", prefix),
            format!("must be at most {}", MAX_RETENTION_COUNT),
        ));
    }
    if policy.max_age_days > MAX_RETENTION_AGE_DAYS {
        errors.push(FieldError::new(
            format!("{}.max_age_days", prefix),
            format!("must be at most {}", MAX_RETENTION_AGE_DAYS),
        ));
    }
}

pub fn validate_backup(config: &BackupConfig) -> Validation {
    let mut errors = Vec::new();

    require(&mut errors, "name_template", &config.name_template);
    if config.name_template.contains('/') || config.name_template.contains('\\') {
        errors.push(FieldError::new("name_template", "must not contain path separators"));
    }

    // Checked even when disabled so enabling later cannot activate a bad expression.
    if let Err(e) = parse_schedule(&config.schedule.expression) {
        errors.push(FieldError::new("schedule.expression", e));
    }

    validate_policy(&mut errors, "retention.local", &config.retention.local);
    validate_policy(&mut errors, "retention.remote", &config.retention.remote);

    for (i, slug) in config.auto_stop_workloads.iter().enumerate() {
        if slug.trim().is_empty() {
            errors.push(FieldError::new(
                format!("auto_stop_workloads[{}]", i),
                "must not be empty",
            ));
        }
    }

    finish(errors)
}

/// Deserializes and validates a remote configuration submitted as JSON.
pub fn parse_remote_json(value: Value) -> std::result::Result<RemoteConfig, Vec<FieldError>> {
    let config: RemoteConfig = serde_json::from_value(value)
        .map_err(|e| vec![FieldError::new("body", e.to_string())])?;
    validate_remote(&config)?;
    Ok(config)
}

/// Deserializes and validates a backup configuration submitted as JSON.
pub fn parse_backup_json(value: Value) -> std::result::Result<BackupConfig, Vec<FieldError>> {
    let config: BackupConfig = serde_json::from_value(value)
        .map_err(|e| vec![FieldError::new("body", e.to_string())])?;
    validate_backup(&config)?;
    Ok(config)
}

/// Live check: one authenticated no-op request against the remote store.
pub async fn check_connectivity(remote: &dyn RemoteStorage, config: &RemoteConfig) -> Validation {
    remote
        .test_connection(config)
        .await
        .map_err(|e| vec![FieldError::new("endpoint_url", format!("connection test failed: {:#}", e))])
}

fn finish(errors: Vec<FieldError>) -> Validation {
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
