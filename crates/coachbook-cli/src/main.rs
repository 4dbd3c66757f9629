//! Coachbook CLI - manage a personal-trainer client roster from the terminal
//!
//! Every command works offline against the local cache; cloud backup engages
//! automatically when `COACHBOOK_API_BASE_URL` and `COACHBOOK_TOKEN` are set.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use coachbook_core::cache::LocalCache;
use coachbook_core::remote::{DriveBackupClient, RemoteError};
use coachbook_core::session::{SessionProvider, StaticSession};
use coachbook_core::sync::SyncCoordinator;
use coachbook_core::util::normalize_text_option;
use coachbook_core::Client;
use thiserror::Error;

/// Base URL used when the backup remote is not configured. The session stays
/// offline in that case, so no request ever reaches this host.
const PLACEHOLDER_BASE_URL: &str = "https://api.coachbook.dev";

#[derive(Parser)]
#[command(name = "coachbook")]
#[command(about = "Manage personal-training clients with local-first cloud backup")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional path to local cache file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new client
    #[command(alias = "new")]
    Add {
        /// Client display name
        name: Vec<String>,
        /// Contact email
        #[arg(long)]
        email: Option<String>,
        /// Training goal
        #[arg(long)]
        goal: Option<String>,
    },
    /// List clients
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync bookkeeping
    Status,
    /// Reconcile with the backup remote and push pending changes
    Sync,
    /// Flush pending changes and end the session; local data is retained
    Logout,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] coachbook_core::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No client name provided")]
    EmptyClientName,
    #[error(
        "Backup is not configured. Set COACHBOOK_API_BASE_URL and COACHBOOK_TOKEN to enable `coachbook sync`."
    )]
    BackupNotConfigured,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coachbook=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Some(Commands::Add { name, email, goal }) => {
            run_add(&name, email, goal, &db_path).await?;
        }
        Some(Commands::List { json }) => run_list(json, &db_path).await?,
        Some(Commands::Status) => run_status(&db_path).await?,
        Some(Commands::Sync) => run_sync(&db_path).await?,
        Some(Commands::Logout) => run_logout(&db_path).await?,
        None => {
            Cli::command().print_help().map_err(CliError::Io)?;
            println!();
        }
    }

    Ok(())
}

async fn run_add(
    name_parts: &[String],
    email: Option<String>,
    goal: Option<String>,
    db_path: &Path,
) -> Result<(), CliError> {
    let name = normalize_client_name(&name_parts.join(" "))?;

    let (coordinator, _session) = build_coordinator(db_path)?;
    let mut clients = coordinator.load().await?;

    let mut client = Client::new(name);
    client.email = normalize_text_option(email);
    client.goal = normalize_text_option(goal);
    let id = client.id;

    clients.push(client);
    coordinator.save(clients)?;

    // One-shot process: push now instead of waiting out the debounce window.
    coordinator.flush_pending().await;
    coordinator.shutdown().await;

    println!("{id}");
    Ok(())
}

async fn run_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let (coordinator, _session) = build_coordinator(db_path)?;
    let mut clients = coordinator.load().await?;
    clients.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    coordinator.shutdown().await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&clients)?);
    } else {
        for line in format_client_lines(&clients) {
            println!("{line}");
        }
    }

    Ok(())
}

async fn run_status(db_path: &Path) -> Result<(), CliError> {
    let (coordinator, session) = build_coordinator(db_path)?;
    let clients = coordinator.load().await?;
    let status = coordinator.status();
    coordinator.shutdown().await;

    println!("clients:           {}", clients.len());
    println!(
        "backup:            {}",
        if backup_configured() {
            "configured"
        } else {
            "not configured"
        }
    );
    println!("online:            {}", session.is_online());
    println!("pending push:      {}", status.pending_push);
    println!("queued retries:    {}", status.queued_retries);
    println!("auth halted:       {}", status.auth_halted);
    println!(
        "last local save:   {}",
        format_optional_time(status.last_local_save_at)
    );
    println!(
        "last remote sync:  {}",
        format_optional_time(status.last_known_remote_modified_at)
    );

    Ok(())
}

async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    if !backup_configured() {
        return Err(CliError::BackupNotConfigured);
    }

    let (coordinator, _session) = build_coordinator(db_path)?;
    coordinator.background_sync().await;
    coordinator.flush_pending().await;
    let status = coordinator.status();
    coordinator.shutdown().await;

    if status.pending_push || status.queued_retries > 0 {
        println!("Sync incomplete; changes remain queued");
    } else {
        println!("Sync completed");
    }
    Ok(())
}

async fn run_logout(db_path: &Path) -> Result<(), CliError> {
    let (coordinator, _session) = build_coordinator(db_path)?;
    coordinator.shutdown().await;
    println!("Signed out; local data retained at {}", db_path.display());
    Ok(())
}

/// Wire the cache, remote client, and session together for one invocation.
fn build_coordinator(db_path: &Path) -> Result<(SyncCoordinator, Arc<StaticSession>), CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::debug!(path = %db_path.display(), "opening local cache");
    let cache = LocalCache::open(db_path)?;

    let base_url = env::var("COACHBOOK_API_BASE_URL").ok().filter(|u| !u.is_empty());
    let token = env::var("COACHBOOK_TOKEN").ok().filter(|t| !t.is_empty());

    let session = if base_url.is_some() && token.is_some() {
        Arc::new(StaticSession::new(token))
    } else {
        Arc::new(StaticSession::offline())
    };

    let store = DriveBackupClient::new(
        base_url.unwrap_or_else(|| PLACEHOLDER_BASE_URL.to_string()),
        Arc::clone(&session) as Arc<dyn SessionProvider>,
    )?;

    let coordinator = SyncCoordinator::new(
        cache,
        Arc::new(store),
        Arc::clone(&session) as Arc<dyn SessionProvider>,
    )?;

    Ok((coordinator, session))
}

fn backup_configured() -> bool {
    env::var("COACHBOOK_API_BASE_URL").is_ok_and(|url| !url.is_empty())
        && env::var("COACHBOOK_TOKEN").is_ok_and(|token| !token.is_empty())
}

fn format_client_lines(clients: &[Client]) -> Vec<String> {
    let now = Utc::now();
    clients
        .iter()
        .map(|client| {
            let id = client.id.as_str();
            let short_id = id.chars().take(8).collect::<String>();
            let detail = client
                .goal
                .as_deref()
                .or(client.email.as_deref())
                .unwrap_or("");
            let relative = format_relative_time(client.updated_at, now);

            if detail.is_empty() {
                format!("{short_id:<8}  {:<24}  {relative}", client.name)
            } else {
                format!("{short_id:<8}  {:<24}  {detail:<30}  {relative}", client.name)
            }
        })
        .collect()
}

fn format_optional_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
}

fn format_relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now.signed_duration_since(then).num_milliseconds().max(0);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

fn normalize_client_name(name: &str) -> Result<String, CliError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyClientName)
    } else {
        Ok(trimmed.to_string())
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("COACHBOOK_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coachbook")
        .join("coachbook.db")
}
