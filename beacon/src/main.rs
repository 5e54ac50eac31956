//! beacon - queue telemetry events and deliver them to the collector
//!
//! This tool provides commands for:
//! - Checking configuration, queued events and dispatch lock state
//! - Queueing events and delivering them on demand or on a timer
//! - Recovering after a dispatch was interrupted by a crash
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/beacon/store.db (~/.local/share/beacon/store.db)
//! - Logs: $XDG_STATE_HOME/beacon/beacon.log.YYYY-MM-DD (~/.local/state/beacon/)
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use beacon_core::dispatch::{DiscardReason, DispatchOutcome, DispatchProgress, SkipReason};
use beacon_core::{Config, Telemetry};
use clap::{ArgAction, Parser, Subcommand};
use process_lock::{acquire_store_guard, try_acquire_store_guard};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Queue telemetry events and deliver them to the collector")]
#[command(version)]
struct Args {
    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, queued events and dispatch lock state
    Status,

    /// Record an event
    Track {
        /// Collection the event belongs to
        collection: String,

        /// Event payload as a JSON object
        #[arg(default_value = "{}")]
        payload: String,

        /// Dispatch the queue right after recording
        #[arg(long)]
        flush: bool,
    },

    /// Run one dispatch attempt
    Flush,

    /// Dispatch periodically until interrupted
    Watch {
        /// Seconds between dispatches (default: from config)
        #[arg(short, long, allow_negative_numbers = true)]
        interval: Option<i64>,
    },

    /// Discard events left behind by an interrupted dispatch
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let mut config = Config::load().context("failed to load configuration")?;
    match args.verbose {
        0 => {}
        1 => config.logging.level = "debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }

    let _log_guard =
        beacon_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("beacon starting");

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Track {
            collection,
            payload,
            flush,
        } => cmd_track(&config, &collection, &payload, flush).await,
        Command::Flush => cmd_flush(&config).await,
        Command::Watch { interval } => cmd_watch(config, interval).await,
        Command::Recover => cmd_recover(&config),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Beacon Configuration");
    println!("====================");
    println!();

    let app = &config.app;
    println!(
        "App ID:          {}",
        app.app_id.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Write Key:       {}",
        if app.api_write_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Server:          {}", app.api_server);
    match config.dispatch.interval() {
        Some(interval) => println!("Interval:        {}s", interval.as_secs()),
        None => println!("Interval:        disabled (events are sent directly)"),
    }
    println!("Timeout:         {}s", config.dispatch.timeout_secs);

    let store_path = config.store_path();
    println!("Store:           {}", store_path.display());
    println!(
        "Log File:        {}",
        beacon_core::logging::log_file_path().display()
    );

    println!();
    if !app.is_ready() {
        println!("Status: Not ready (missing required configuration)");
        println!();
        println!("Set the application identity in {}:", Config::config_path().display());
        println!();
        println!("  [app]");
        println!("  app_id = \"your-app-id\"");
        println!("  api_write_key = \"your-write-key\"");
        return Ok(());
    }
    println!("Status: Ready");

    if !store_path.exists() {
        println!();
        println!("No events recorded yet");
        return Ok(());
    }

    let guard = try_acquire_store_guard(&store_path).context("failed to check store owner")?;
    let telemetry = Telemetry::open(config).context("failed to open store")?;
    let dispatcher = telemetry.dispatcher();
    let snapshot = dispatcher.queue().snapshot();

    println!();
    println!("Queued Events:   {}", snapshot.len());
    for (collection, events) in snapshot.iter() {
        println!("  - {}: {}", collection, events.len());
    }

    let flagged = dispatcher.locks().is_held_persisted(dispatcher.lock_name());
    let lock_state = match (flagged, guard.is_some()) {
        (false, _) => "clear",
        (true, false) => "held (another beacon process is dispatching)",
        (true, true) => "stale (interrupted dispatch; run 'recover')",
    };
    println!("Dispatch Lock:   {}", lock_state);
    if guard.is_none() {
        println!("Owner:           another beacon process");
    }

    Ok(())
}

async fn cmd_track(config: &Config, collection: &str, payload: &str, flush: bool) -> Result<()> {
    let payload = match serde_json::from_str::<Value>(payload).context("payload is not valid JSON")? {
        Value::Object(map) => map,
        other => anyhow::bail!("payload must be a JSON object, got {}", other),
    };

    let _store_guard = acquire_store_guard(&config.store_path())?;
    let telemetry = Telemetry::open(config).context("failed to set up telemetry")?;

    telemetry
        .track(collection, payload)
        .context("failed to record event")?;

    if telemetry.dispatch_interval().is_none() {
        telemetry.drain_direct_sends().await;
        println!("Sent event to '{}' directly (caching disabled)", collection);
        return Ok(());
    }

    println!(
        "Queued event in '{}' ({} pending)",
        collection,
        telemetry.dispatcher().queue().len()
    );

    if flush {
        let attempt = telemetry.dispatch_now().await;
        println!("{}", describe(&attempt.outcome));
    }

    Ok(())
}

async fn cmd_flush(config: &Config) -> Result<()> {
    let _store_guard = acquire_store_guard(&config.store_path())?;
    let telemetry = Telemetry::open(config).context("failed to set up telemetry")?;

    let attempt = telemetry.dispatch_now().await;
    tracing::info!(attempt_id = %attempt.id, "Manual dispatch finished");

    println!("{}", describe(&attempt.outcome));
    println!("Pending:         {}", telemetry.dispatcher().queue().len());

    Ok(())
}

async fn cmd_watch(mut config: Config, interval: Option<i64>) -> Result<()> {
    if let Some(secs) = interval {
        config.dispatch.interval_secs = secs;
    }

    let _store_guard = acquire_store_guard(&config.store_path())?;
    let telemetry = Telemetry::open(&config).context("failed to set up telemetry")?;
    let mut progress = telemetry.subscribe();

    telemetry.start().context("failed to start dispatching")?;
    match telemetry.dispatch_interval() {
        Some(interval) => println!(
            "Dispatching every {}s. Press Ctrl-C to stop.",
            interval.as_secs()
        ),
        None => println!("Periodic dispatch disabled. Press Ctrl-C to stop."),
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            message = progress.recv() => match message {
                Ok(DispatchProgress::Started { events, .. }) => {
                    println!("Dispatching {} event(s)...", events);
                }
                Ok(DispatchProgress::Sending { .. }) => {}
                Ok(DispatchProgress::Finished { outcome, .. }) => {
                    println!("{}", describe(&outcome));
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Progress listener fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    telemetry.stop();
    telemetry.drain_direct_sends().await;
    println!(
        "Stopped; {} event(s) pending",
        telemetry.dispatcher().queue().len()
    );
    tracing::info!("beacon watch stopped");

    Ok(())
}

fn cmd_recover(config: &Config) -> Result<()> {
    let _store_guard = acquire_store_guard(&config.store_path())?;
    let telemetry = Telemetry::open(config).context("failed to set up telemetry")?;

    match telemetry.dispatcher().recover_stale() {
        Some(outcome) => println!("{}", describe(&outcome)),
        None => println!("No interrupted dispatch found"),
    }

    Ok(())
}

fn describe(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::Skipped(SkipReason::EmptyQueue) => "Nothing to send".to_string(),
        DispatchOutcome::Skipped(SkipReason::Unreachable) => {
            "Network unreachable; events kept".to_string()
        }
        DispatchOutcome::Skipped(SkipReason::InProgress) => {
            "Another dispatch is in progress".to_string()
        }
        DispatchOutcome::Skipped(SkipReason::StorageUnavailable) => {
            "Store unavailable; nothing sent".to_string()
        }
        DispatchOutcome::Delivered { events, ack } => {
            format!("Delivered {} event(s) (HTTP {})", events, ack.status)
        }
        DispatchOutcome::Retained { events, error } => {
            format!("Kept {} event(s) for retry: {}", events, error)
        }
        DispatchOutcome::Discarded {
            events,
            reason: DiscardReason::Rejected(error),
        } => format!("Discarded {} rejected event(s): {}", events, error),
        DispatchOutcome::Discarded {
            events,
            reason: DiscardReason::Recovered,
        } => format!(
            "Previous dispatch was interrupted; discarded {} event(s)",
            events
        ),
    }
}
