// snapshot-relay/src/control/mod.rs
//! Local control channel.
//!
//! Exactly one process owns the status register: the daemon, or a one-shot
//! command when no daemon is running. The owner listens on a Unix socket and
//! every other invocation forwards its command there, so all triggers go
//! through the same gate. The wire format is one JSON request line answered
//! by one JSON response line.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::app::{App, TriggerOutcome};
use crate::config::validate::FieldError;

const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    Status,
    Reset,
    Backup { wait: bool },
    Upload { snapshot_id: String, name: Option<String> },
    Restore { path: String, wait: bool },
    Clean,
    List,
    Validate { test_connection: bool },
    SetRemote { body: Value, test_connection: bool },
    SetBackup { body: Value },
}

impl Request {
    /// The same request, waiting for background work to finish. A one-shot
    /// owner exits when its command returns, so it cannot detach.
    pub fn in_foreground(self) -> Self {
        match self {
            Request::Backup { .. } => Request::Backup { wait: true },
            Request::Restore { path, .. } => Request::Restore { path, wait: true },
            other => other,
        }
    }
}

/// `code` is `accepted`, `busy`, `validation-failed`, `not-configured`, or
/// `failed` when the operation itself went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    fn accepted(data: Option<Value>) -> Self {
        Self {
            code: TriggerOutcome::Accepted.code().to_string(),
            message: None,
            errors: Vec::new(),
            data: data.filter(|v| !v.is_null()),
        }
    }

    fn refused(outcome: TriggerOutcome) -> Self {
        let code = outcome.code().to_string();
        let (message, errors) = match outcome {
            TriggerOutcome::Accepted => (None, Vec::new()),
            TriggerOutcome::Busy(status) => (Some(format!("Another operation is in progress ({})", status)), Vec::new()),
            TriggerOutcome::NotConfigured => (Some("Remote storage is not configured".to_string()), Vec::new()),
            TriggerOutcome::ValidationFailed(errors) => (Some("Validation failed".to_string()), errors),
        };
        Self {
            code,
            message,
            errors,
            data: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            code: "failed".to_string(),
            message: Some(message.into()),
            errors: Vec::new(),
            data: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.code == TriggerOutcome::Accepted.code()
    }
}

fn respond<T: Serialize>(result: crate::errors::Result<T>) -> Response {
    match TriggerOutcome::classify(result) {
        Ok((TriggerOutcome::Accepted, value)) => match value.map(serde_json::to_value).transpose() {
            Ok(data) => Response::accepted(data),
            Err(e) => Response::failed(format!("Failed to encode result: {}", e)),
        },
        Ok((outcome, _)) => Response::refused(outcome),
        Err(e) => Response::failed(e.to_string()),
    }
}

/// Runs one request against the register owner's [`App`].
pub async fn dispatch(app: &App, request: Request) -> Response {
    match request {
        Request::Status => {
            let mut status = match serde_json::to_value(app.status()) {
                Ok(status) => status,
                Err(e) => return Response::failed(e.to_string()),
            };
            status["schedule"] = json!(app.schedule_expression());
            Response::accepted(Some(status))
        }
        Request::Reset => Response::accepted(Some(json!({ "reset": app.reset_error() }))),
        Request::Backup { wait } => match app.start_manual_backup() {
            Ok(handle) if wait => match handle.await {
                Ok(report) => respond(Ok(report.summary())),
                Err(e) => Response::failed(format!("Backup task ended abnormally: {}", e)),
            },
            Ok(_) => Response::accepted(None),
            Err(e) => respond::<()>(Err(e)),
        },
        Request::Upload { snapshot_id, name } => respond(app.upload_existing(&snapshot_id, name).await),
        Request::Restore { path, wait: true } => {
            respond(app.restore_now(&path).await.map(|snapshot_id| json!({ "snapshot_id": snapshot_id })))
        }
        Request::Restore { path, wait: false } => respond(app.start_restore(&path).map(|_| ())),
        Request::Clean => respond(app.clean_now().await),
        Request::List => respond(Ok(app.list_backups().await)),
        Request::Validate { test_connection } => {
            let errors = app.validate_persisted(test_connection).await;
            if errors.is_empty() {
                Response::accepted(None)
            } else {
                Response::refused(TriggerOutcome::ValidationFailed(errors))
            }
        }
        // The stored remote carries credentials; it is not echoed back.
        Request::SetRemote { body, test_connection } => {
            respond(app.update_remote_config(body, test_connection).await.map(|_| ()))
        }
        Request::SetBackup { body } => respond(
            app.update_backup_config(body)
                .map(|_| json!({ "next_backup": app.status().next_backup })),
        ),
    }
}

/// Removes the socket file when the owner goes away.
#[derive(Debug)]
pub struct SocketFile {
    path: PathBuf,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(socket = %self.path.display(), "Failed to remove control socket: {}", e);
            }
        }
    }
}

pub enum Endpoint {
    /// This process owns the register and must serve the listener.
    Owner(UnixListener, SocketFile),
    /// Another process owns the register.
    Forward(UnixStream),
}

async fn connect(path: &Path) -> Result<Option<UnixStream>> {
    match UnixStream::connect(path).await {
        Ok(stream) => Ok(Some(stream)),
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to connect to control socket {}", path.display())),
    }
}

/// Connects to the current owner, or becomes the owner when there is none.
/// A socket file nobody listens on is left over from a dead owner and is
/// replaced.
pub async fn claim(path: &Path) -> Result<Endpoint> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory for {}", path.display()))?;
    }
    for _ in 0..CLAIM_ATTEMPTS {
        if let Some(stream) = connect(path).await? {
            debug!(socket = %path.display(), "Forwarding to the running instance");
            return Ok(Endpoint::Forward(stream));
        }
        match UnixListener::bind(path) {
            Ok(listener) => {
                info!(socket = %path.display(), "Listening for control requests");
                return Ok(Endpoint::Owner(listener, SocketFile { path: path.to_path_buf() }));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                if connect(path).await?.is_none() {
                    warn!(socket = %path.display(), "Removing stale control socket");
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        if e.kind() != ErrorKind::NotFound {
                            return Err(e).context("Failed to remove stale control socket");
                        }
                    }
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to bind control socket {}", path.display()));
            }
        }
    }
    bail!("Could not claim control socket {}", path.display())
}

/// Sends one request to the owner and waits for its answer.
pub async fn exchange(mut stream: UnixStream, request: &Request) -> Result<Response> {
    let mut line = serde_json::to_vec(request).context("Failed to encode control request")?;
    line.push(b'\n');
    stream.write_all(&line).await.context("Failed to send control request")?;
    stream.shutdown().await?;

    let mut body = String::new();
    stream
        .read_to_string(&mut body)
        .await
        .context("Failed to read control response")?;
    serde_json::from_str(body.trim()).with_context(|| format!("Malformed control response: {}", body.trim()))
}

/// Answers requests until the task is dropped.
pub async fn serve(app: Arc<App>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(&app, stream).await {
                        warn!("Control request failed: {:#}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept control connection: {}", e),
        }
    }
}

async fn handle_connection(app: &App, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => {
            debug!(request = ?request, "Control request");
            dispatch(app, request).await
        }
        Err(e) => Response::failed(format!("Malformed control request: {}", e)),
    };

    let mut body = serde_json::to_vec(&response)?;
    body.push(b'\n');
    writer.write_all(&body).await?;
    writer.shutdown().await?;
    Ok(())
}
