//! Driftsync CLI - run and inspect the sync scheduler from a terminal.
//!
//! Useful for exercising a database against a remote without an
//! application around it, replaying push wake-ups through the background
//! path, and previewing the backoff schedule for a configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use driftsync_common::{Credential, RemoteTarget, Secret};
use driftsync_store::StoreConfig;
use driftsync_sync::{
    next_interval, BackoffConfig, ConfigStore, JsonFileConfigStore, Platform,
    PushNotification, SessionConfig, SyncConfig, SyncCounters, SyncEngine, SyncHooks,
};

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(about = "Driftsync - local-first sync scheduler")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a database and run the foreground scheduler for a while.
    Run {
        /// Path to the SQLite database.
        #[arg(short, long)]
        db: PathBuf,

        /// Remote connection string. Runs local-only when omitted.
        #[arg(short, long)]
        connection: Option<String>,

        /// API key for the remote.
        #[arg(long, conflicts_with = "token")]
        api_key: Option<String>,

        /// Access token for the remote.
        #[arg(long)]
        token: Option<String>,

        /// Table to enroll (repeatable).
        #[arg(short, long = "table")]
        tables: Vec<String>,

        /// Path to the reconciliation extension library.
        #[arg(short, long)]
        extension: Option<String>,

        /// Session configuration file, kept for the background command.
        #[arg(long, default_value = "driftsync-session.json")]
        state: PathBuf,

        /// How long to run before shutting down.
        #[arg(short, long, default_value_t = 60)]
        seconds: u64,
    },

    /// Replay a push wake-up through the background path.
    Background {
        /// Session configuration file written by `run`.
        #[arg(short, long, default_value = "driftsync-session.json")]
        config: PathBuf,

        /// Notification payload as JSON.
        #[arg(short, long)]
        payload: String,
    },

    /// Print the polling intervals for a run of empty syncs or errors.
    Intervals {
        /// Number of consecutive errors.
        #[arg(long, conflicts_with = "empty")]
        errors: Option<u32>,

        /// Number of consecutive empty syncs.
        #[arg(long)]
        empty: Option<u32>,

        /// Base interval in milliseconds.
        #[arg(long, default_value_t = 5_000)]
        base_ms: u64,

        /// Maximum interval in milliseconds.
        #[arg(long, default_value_t = 300_000)]
        max_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            db,
            connection,
            api_key,
            token,
            tables,
            extension,
            state,
            seconds,
        } => {
            let credential = match (api_key, token) {
                (Some(key), _) => Credential::ApiKey(Secret::new(key)),
                (None, Some(token)) => Credential::AccessToken(Secret::new(token)),
                (None, None) => Credential::None,
            };
            let remote = connection.map(|conn| {
                let target = RemoteTarget::new(conn, tables).with_credential(credential);
                match extension {
                    Some(path) => target.with_extension_path(path),
                    None => target,
                }
            });
            cmd_run(&db, remote, &state, Duration::from_secs(seconds)).await
        }

        Commands::Background { config, payload } => cmd_background(&config, &payload).await,

        Commands::Intervals {
            errors,
            empty,
            base_ms,
            max_ms,
        } => cmd_intervals(errors, empty, base_ms, max_ms),
    }
}

/// Run the foreground engine until the deadline.
async fn cmd_run(
    db: &Path,
    remote: Option<RemoteTarget>,
    state: &Path,
    duration: Duration,
) -> Result<()> {
    info!("Opening {}", db.display());

    let config = SessionConfig::new(StoreConfig::sqlite(db.to_string_lossy()), remote)
        .with_sync(SyncConfig::polling());
    let platform = Platform::default().with_config_store(Arc::new(JsonFileConfigStore::new(state)));
    let engine = SyncEngine::with_defaults(platform, Arc::new(SyncHooks::new()));

    let mut changes = engine.subscribe_changes();
    engine
        .start(config)
        .await
        .context("Failed to initialize the store")?;

    let status = engine.status();
    println!("Session started");
    println!("  Store ready: {}", status.readiness.store_ready);
    println!("  Link ready: {}", status.readiness.link_ready);
    if let Some(err) = &status.link_error {
        println!("  Link error: {}", err);
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = changes.recv() => match event {
                Ok(event) => println!(
                    "{}  {} changes ({})",
                    event.at.format("%H:%M:%S"),
                    event.changes,
                    event.origin
                ),
                Err(RecvError::Lagged(missed)) => println!("  ... {} events skipped", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    let status = engine.status();
    println!("Session stopped");
    println!("  Last sync: {:?}", status.last_sync_time);
    println!("  Empty syncs in a row: {}", status.consecutive_empty_syncs);
    println!("  Errors in a row: {}", status.consecutive_sync_errors);
    if let Some(err) = &status.last_error {
        println!("  Last error: {}", err);
    }

    Ok(())
}

/// Run the background path once for a payload.
async fn cmd_background(config: &Path, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let store = JsonFileConfigStore::new(config);
    if store.load().await?.is_none() {
        anyhow::bail!("No session configuration at {}", config.display());
    }

    let platform = Platform::default().with_config_store(Arc::new(store));
    let engine = SyncEngine::with_defaults(platform, Arc::new(SyncHooks::new()));
    engine.hooks().on_background_sync(|manifest| async move {
        println!("Changes: {}", manifest.changes);
        for row in &manifest.rows {
            println!("  {:?} {} #{}", row.action, row.table, row.rowid);
        }
        Ok(())
    });

    let run = engine
        .background_context()
        .run_once(&PushNotification::new(payload))
        .await;
    println!("Background run: {:?}", run);
    Ok(())
}

/// Print the interval sequence for the default policy.
fn cmd_intervals(errors: Option<u32>, empty: Option<u32>, base_ms: u64, max_ms: u64) -> Result<()> {
    let config = BackoffConfig::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
    config.validate().context("Invalid backoff configuration")?;

    let (label, count) = match (errors, empty) {
        (Some(n), _) => ("error", n),
        (None, Some(n)) => ("empty", n),
        (None, None) => anyhow::bail!("Pass --errors or --empty"),
    };

    println!("{:>6}  {:>10}", label, "interval");
    for step in 1..=count {
        let counters = SyncCounters {
            consecutive_empty_syncs: if label == "empty" { step } else { 0 },
            consecutive_sync_errors: if label == "error" { step } else { 0 },
        };
        let interval = next_interval(&counters, &config);
        println!("{:>6}  {:>8}ms", step, interval.as_millis());
    }
    Ok(())
}
