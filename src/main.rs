//! Snapshot relay
//!
//! Pauses workloads, snapshots the host, ships the archive to remote storage
//! and prunes old backups. CLI entry point and cron daemon.

// snapshot-relay/src/main.rs
mod app;
mod backup;
mod config;
mod control;
mod errors;
mod host;
mod logging;
mod remote;
mod restore;
mod retention;
mod scheduler;
mod status;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result, bail};
use app::App;
use backup::{BackupDescriptor, BackupSummary};
use config::EnvSettings;
use control::{Endpoint, Request, Response};
use retention::PruneReport;
use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

/// Main entry point for the snapshot relay
#[tokio::main]
async fn main() -> ExitCode {
    logging::init_logging();
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let settings = EnvSettings::from_env();

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };
    let arg = |i: usize| args.get(i).map(|s| s.trim().to_string());
    let detach = args.iter().skip(2).any(|a| a == "--detach");

    let request = match choice.as_str() {
        "1" | "status" => Request::Status,
        "2" | "backup" => {
            println!("🚀 Starting Backup Process...");
            Request::Backup { wait: !detach }
        }
        "3" | "upload" => {
            let snapshot_id = arg(2).context("Usage: upload <snapshot-id> [name]")?;
            println!("📤 Uploading snapshot {}...", snapshot_id);
            Request::Upload {
                snapshot_id,
                name: arg(3),
            }
        }
        "4" | "restore" => {
            let path = match arg(2).filter(|a| a != "--detach") {
                Some(path) => path,
                None => prompt_line("Remote path to restore: ")?,
            };
            println!("🔄 Starting Restore Process...");
            Request::Restore { path, wait: !detach }
        }
        "5" | "clean" => {
            println!("🧹 Applying retention policy...");
            Request::Clean
        }
        "6" | "list" => Request::List,
        "7" | "validate" => Request::Validate {
            test_connection: arg(2).as_deref() == Some("--test"),
        },
        "8" | "daemon" => return run_daemon(&settings).await,
        "set-remote" => {
            let file = arg(2).context("Usage: set-remote <file.json> [--test]")?;
            Request::SetRemote {
                body: read_json(&file)?,
                test_connection: arg(3).as_deref() == Some("--test"),
            }
        }
        "set-backup" => {
            let file = arg(2).context("Usage: set-backup <file.json>")?;
            Request::SetBackup { body: read_json(&file)? }
        }
        "reset" => Request::Reset,
        _ => {
            println!("❌ Invalid choice. Please enter a number from 1 to 8 or a command name.");
            bail!("Invalid operation choice");
        }
    };

    let response = send(&settings, request.clone()).await?;
    print_response(&request, response)
}

/// Owns the register for as long as the scheduler runs.
async fn run_daemon(settings: &EnvSettings) -> Result<()> {
    let (listener, _socket) = match control::claim(&settings.control_socket).await? {
        Endpoint::Owner(listener, socket) => (listener, socket),
        Endpoint::Forward(_) => bail!(
            "A relay is already running on {}",
            settings.control_socket.display()
        ),
    };
    let app = Arc::new(App::from_env(settings).context("Failed to initialise the relay")?);
    let server = tokio::spawn(control::serve(Arc::clone(&app), listener));

    println!("⏰ Running scheduler, press Ctrl-C to stop...");
    let result = app.run_daemon().await;
    server.abort();
    result?;
    Ok(())
}

/// Hands the request to the running relay. Without one, this process owns the
/// register until the command finishes.
async fn send(settings: &EnvSettings, request: Request) -> Result<Response> {
    match control::claim(&settings.control_socket).await? {
        Endpoint::Forward(stream) => control::exchange(stream, &request).await,
        Endpoint::Owner(listener, _socket) => {
            let app = Arc::new(App::from_env(settings).context("Failed to initialise the relay")?);
            let server = tokio::spawn(control::serve(Arc::clone(&app), listener));
            let response = control::dispatch(&app, request.in_foreground()).await;
            server.abort();
            Ok(response)
        }
    }
}

/// Prints the result of a command; refusals and failures become a failing
/// exit status.
fn print_response(request: &Request, response: Response) -> Result<()> {
    println!("Result: {}", response.code);
    if !response.is_accepted() {
        for e in &response.errors {
            println!("  {}: {}", e.field, e.message);
        }
        match response.message {
            Some(message) => bail!(message),
            None => bail!("Request refused: {}", response.code),
        }
    }
    let data = response.data;

    match request {
        Request::Status => println!("{}", serde_json::to_string_pretty(&data)?),
        Request::Backup { .. } => match data {
            Some(data) => {
                let summary: BackupSummary = serde_json::from_value(data)?;
                match (&summary.remote_path, summary.outcome.as_str()) {
                    (Some(path), "completed") => println!("Backup stored at {}", path),
                    _ => bail!(
                        "Backup did not complete ({}): {}",
                        summary.outcome,
                        summary.error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
            None => println!("Backup running in the background, see 'status'."),
        },
        Request::Upload { .. } => {
            let uploaded: BackupDescriptor = serde_json::from_value(data.context("Missing upload result")?)?;
            println!("Uploaded to {} ({} bytes)", uploaded.id, uploaded.size_bytes);
        }
        Request::Restore { .. } => match data {
            Some(data) => println!(
                "Imported as host snapshot {}",
                data["snapshot_id"].as_str().unwrap_or_default()
            ),
            None => println!("Restore running in the background, see 'status'."),
        },
        Request::Clean => {
            let report: PruneReport = serde_json::from_value(data.context("Missing retention report")?)?;
            println!(
                "Deleted {} host snapshot(s), {} remote backup(s), {} failure(s)",
                report.deleted_local.len(),
                report.deleted_remote.len(),
                report.failed
            );
        }
        Request::List => {
            let items: Vec<BackupDescriptor> = match data {
                Some(data) => serde_json::from_value(data)?,
                None => Vec::new(),
            };
            for item in items {
                println!(
                    "{:<14} {:<8} {} {:>12}  {}",
                    format!("{:?}", item.location),
                    item.origin.label(),
                    item.created_at.format("%Y-%m-%d %H:%M"),
                    item.size_bytes,
                    item.id
                );
            }
        }
        Request::Validate { .. } => println!("Configuration is valid."),
        Request::SetRemote { .. } => println!("Remote configuration saved."),
        Request::SetBackup { .. } => {
            if let Some(next) = data.as_ref().and_then(|d| d["next_backup"].as_str()) {
                println!("Next scheduled backup: {}", next);
            }
        }
        Request::Reset => {
            if data.and_then(|d| d["reset"].as_bool()).unwrap_or(false) {
                println!("Status reset to idle.");
            } else {
                println!("Status is not in error, nothing to reset.");
            }
        }
    }
    Ok(())
}

fn read_json(path: &str) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("Failed to read {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse JSON from {}", path))
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Show status (or type 'status')");
    println!("2. Take Backup (or type 'backup')");
    println!("3. Upload existing snapshot (or type 'upload')");
    println!("4. Restore Backup (or type 'restore')");
    println!("5. Apply retention (or type 'clean')");
    println!("6. List backups (or type 'list')");
    println!("7. Validate configuration (or type 'validate')");
    println!("8. Run scheduler (or type 'daemon')");
    prompt_line("Enter your choice: ")
}

fn prompt_line(prompt: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{}", prompt);
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
