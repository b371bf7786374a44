// snapshot-relay/src/host/supervisor.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::HostApi;
use crate::backup::{BackupDescriptor, BackupLocation, BackupOrigin};

/// Supervisor responses are wrapped in `{"result": "ok"|"error", ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: String,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WorkloadInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct CoreInfo {
    version: String,
}

#[derive(Debug, Deserialize)]
struct SlugData {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotList {
    backups: Vec<SnapshotEntry>,
}

#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    slug: String,
    name: String,
    date: String,
    /// Size in megabytes, as reported by the supervisor.
    #[serde(default)]
    size: f64,
}

/// HTTP client for the host supervisor API.
pub struct SupervisorClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl SupervisorClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid supervisor URL: {}", base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        if token.is_none() {
            warn!("SUPERVISOR_TOKEN is not set; supervisor requests will be unauthenticated");
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid supervisor path: {}", path))?;
        let builder = self.client.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<Option<T>> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("Supervisor request failed: {}", what))?;
        let status = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|| format!("Invalid supervisor response for {} (HTTP {})", what, status))?;
        if envelope.result != "ok" {
            anyhow::bail!(
                "Supervisor refused {}: {}",
                what,
                envelope.message.unwrap_or_else(|| status.to_string())
            );
        }
        Ok(envelope.data)
    }

    async fn call_data<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T> {
        self.call(builder, what)
            .await?
            .with_context(|| format!("Supervisor response for {} carried no data", what))
    }

    async fn workload_state(&self, slug: &str) -> Result<String> {
        let info: WorkloadInfo = self
            .call_data(
                self.request(Method::GET, &format!("addons/{}/info", slug))?,
                &format!("info of {}", slug),
            )
            .await?;
        Ok(info.state)
    }
}

#[async_trait]
impl HostApi for SupervisorClient {
    async fn pause_workloads(&self, slugs: &[String]) -> Result<()> {
        for slug in slugs {
            if self.workload_state(slug).await? != "started" {
                debug!(workload = %slug, "Workload not running, nothing to stop");
                continue;
            }
            info!(workload = %slug, "Stopping workload");
            self.call::<serde_json::Value>(
                self.request(Method::POST, &format!("addons/{}/stop", slug))?,
                &format!("stop of {}", slug),
            )
            .await?;
        }
        Ok(())
    }

    async fn resume_workloads(&self, slugs: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        for slug in slugs {
            let outcome: Result<()> = async {
                if self.workload_state(slug).await? == "started" {
                    debug!(workload = %slug, "Workload already running");
                    return Ok(());
                }
                info!(workload = %slug, "Starting workload");
                self.call::<serde_json::Value>(
                    self.request(Method::POST, &format!("addons/{}/start", slug))?,
                    &format!("start of {}", slug),
                )
                .await
                .map(|_| ())
            }
            .await;
            // Every workload gets a start attempt.
            if let Err(e) = outcome {
                warn!(workload = %slug, "Failed to start workload: {:#}", e);
                failed.push(slug.as_str());
            }
        }
        if !failed.is_empty() {
            anyhow::bail!("Failed to start workloads: {}", failed.join(", "));
        }
        Ok(())
    }

    async fn host_version(&self) -> Result<String> {
        let info: CoreInfo = self
            .call_data(self.request(Method::GET, "core/info")?, "core info")
            .await?;
        Ok(info.version)
    }

    async fn create_snapshot(&self, name: &str) -> Result<String> {
        info!(name = %name, "Requesting snapshot creation");
        let created: SlugData = self
            .call_data(
                self.request(Method::POST, "backups/new/full")?
                    .json(&serde_json::json!({ "name": name })),
                "snapshot creation",
            )
            .await?;
        Ok(created.slug)
    }

    async fn fetch_snapshot(&self, snapshot_id: &str, dest: &Path) -> Result<u64> {
        if let Some(parent_dir) = dest.parent() {
            tokio::fs::create_dir_all(parent_dir)
                .await
                .with_context(|| format!("Failed to create staging directory: {}", parent_dir.display()))?;
        }

        let mut response = self
            .request(Method::GET, &format!("backups/{}/download", snapshot_id))?
            .send()
            .await
            .with_context(|| format!("Failed to request download of snapshot {}", snapshot_id))?
            .error_for_status()
            .with_context(|| format!("Supervisor refused download of snapshot {}", snapshot_id))?;

        let mut output_file = File::create(dest)
            .await
            .with_context(|| format!("Failed to create staging file: {}", dest.display()))?;

        let mut total_bytes = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Download of snapshot {} was interrupted", snapshot_id))?
        {
            output_file
                .write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write to staging file: {}", dest.display()))?;
            total_bytes += chunk.len() as u64;
        }
        output_file.flush().await?;

        info!(snapshot = %snapshot_id, bytes = total_bytes, "Snapshot downloaded");
        Ok(total_bytes)
    }

    async fn list_snapshots(&self) -> Result<Vec<BackupDescriptor>> {
        let list: SnapshotList = self
            .call_data(self.request(Method::GET, "backups")?, "snapshot list")
            .await?;
        list.backups
            .into_iter()
            .map(|entry| {
                let created_at = DateTime::parse_from_rfc3339(&entry.date)
                    .with_context(|| format!("Invalid date '{}' on snapshot {}", entry.date, entry.slug))?
                    .with_timezone(&Utc);
                Ok(BackupDescriptor {
                    origin: BackupOrigin::guess_from_name(&entry.name),
                    id: entry.slug,
                    name: entry.name,
                    created_at,
                    size_bytes: (entry.size.max(0.0) * 1024.0 * 1024.0) as u64,
                    location: BackupLocation::LocalPending,
                })
            })
            .collect()
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.call::<serde_json::Value>(
            self.request(Method::DELETE, &format!("backups/{}", snapshot_id))?,
            &format!("deletion of snapshot {}", snapshot_id),
        )
        .await?;
        Ok(())
    }

    async fn upload_snapshot(&self, file: &Path) -> Result<String> {
        let handle = File::open(file)
            .await
            .with_context(|| format!("Failed to open snapshot archive: {}", file.display()))?;
        let length = handle.metadata().await?.len();
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "snapshot.tar".to_string());

        let part = Part::stream_with_length(handle, length)
            .file_name(file_name)
            .mime_str("application/x-tar")?;
        let form = Form::new().part("file", part);

        info!(file = %file.display(), bytes = length, "Uploading snapshot to host");
        let uploaded: SlugData = self
            .call_data(
                self.request(Method::POST, "backups/new/upload")?.multipart(form),
                "snapshot upload",
            )
            .await?;
        Ok(uploaded.slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() -> Result<()> {
        let client = SupervisorClient::new("http://supervisor/api", Some("t".to_string()))?;
        assert_eq!(client.base_url.as_str(), "http://supervisor/api/");
        Ok(())
    }

    #[test]
    fn test_envelope_error_parses() -> Result<()> {
        let envelope: Envelope<SlugData> =
            serde_json::from_str(r#"{"result":"error","message":"Backup already running"}"#)?;
        assert_eq!(envelope.result, "error");
        assert_eq!(envelope.message.as_deref(), Some("Backup already running"));
        assert!(envelope.data.is_none());
        Ok(())
    }

    #[test]
    fn test_snapshot_list_parses() -> Result<()> {
        let envelope: Envelope<SnapshotList> = serde_json::from_str(
            r#"{"result":"ok","data":{"backups":[
                {"slug":"a1b2","name":"Manual-2024.1.0-2024-01-05_10","date":"2024-01-05T10:00:00+00:00","size":1.5,"type":"full"}
            ]}}"#,
        )?;
        let entry = &envelope.data.unwrap().backups[0];
        assert_eq!(entry.slug, "a1b2");
        assert_eq!(entry.size, 1.5);
        Ok(())
    }
}
