//! `esguard-monitor` entry point.
//!
//! Runs the reconciliation engine headless, logging new denials and outcome
//! messages until Ctrl-C.
//!
//! ## Modes
//!
//! - **Watch mode** (default): start the engine and follow changes.
//! - **`--once`**: load every source, print one JSON snapshot to stdout and
//!   exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use esguard_monitor::config::ConfigLoader;
use esguard_monitor::control::{ProcessController, TracingNotifier};
use esguard_monitor::{LogLine, ReconciliationEngine, Snapshot};

#[derive(Debug, Parser)]
#[command(name = "esguard-monitor", version, about)]
struct Cli {
    /// Load configuration from this TOML file instead of the default.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print one snapshot as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let config = loader.load().context("loading configuration")?;

    tracing::info!("esguard-monitor v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Policy {}", config.paths.policy.display());
    tracing::debug!("Denials {}", config.paths.denials.display());
    tracing::debug!("Daemon log {}", config.paths.log.display());

    let controller = Arc::new(ProcessController::new(&config.daemon));
    let engine = ReconciliationEngine::start(config, controller, Arc::new(TracingNotifier)).await;

    if cli.once {
        let snapshot = engine.refresh().await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        engine.shutdown().await?;
        return Ok(());
    }

    let mut updates = engine.subscribe();
    let mut previous = engine.snapshot();
    log_status(&previous);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Signal received, shutting down");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = updates.borrow_and_update().clone();
                log_changes(&previous, &current);
                previous = current;
            }
        }
    }

    engine.shutdown().await?;
    tracing::info!("esguard-monitor exiting cleanly");
    Ok(())
}

fn log_status(snapshot: &Snapshot) {
    tracing::info!(
        "{} denial(s), {} protected zone(s), {} override(s), daemon {}",
        snapshot.records.len(),
        snapshot.policy.protected_zones.len(),
        snapshot.policy.temporary_overrides.len(),
        if snapshot.daemon_running {
            "running"
        } else {
            "not running"
        }
    );
}

fn log_changes(previous: &Snapshot, current: &Snapshot) {
    if previous.daemon_running != current.daemon_running {
        log_status(current);
    }
    if previous.policy.temporary_overrides != current.policy.temporary_overrides {
        tracing::info!(
            "Temporary overrides: {:?}",
            current.policy.temporary_overrides
        );
    }
    if previous.last_denial != current.last_denial {
        tracing::info!("Last denial: {}", current.last_denial);
    }
    for line in new_log_lines(previous, current)
        .iter()
        .filter(|line| line.is_error)
    {
        tracing::warn!("daemon: {}", line.text);
    }
}

/// Lines of `current.log_tail` that arrived after `previous` was taken.
fn new_log_lines<'a>(previous: &Snapshot, current: &'a Snapshot) -> &'a [LogLine] {
    let arrived = current
        .log_lines_received
        .saturating_sub(previous.log_lines_received);
    let arrived = usize::try_from(arrived).unwrap_or(usize::MAX);
    let tail = &current.log_tail;
    &tail[tail.len().saturating_sub(arrived)..]
}
