//! `esguard-monitor`: watch/tail/reconcile engine for the ES Guard daemon.
//!
//! Observes the files the guard daemon writes (denial log, policy document,
//! last-denial summary, daemon log), rebuilds one consistent [`Snapshot`]
//! whenever any of them changes, and applies temporary policy overrides with
//! automatic expiry.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use esguard_monitor::config::ConfigLoader;
//! use esguard_monitor::control::{ProcessController, TracingNotifier};
//! use esguard_monitor::engine::ReconciliationEngine;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ConfigLoader::new().load()?;
//! let controller = Arc::new(ProcessController::new(&config.daemon));
//! let engine = ReconciliationEngine::start(config, controller, Arc::new(TracingNotifier)).await;
//!
//! let snapshot = engine.refresh().await?;
//! println!("{} denial(s)", snapshot.records.len());
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod config;
pub mod control;
pub mod engine;
mod fsutil;
pub mod last_denial;
pub mod model;
pub mod policy;
pub mod records;
pub mod tailer;
pub mod watcher;

pub use engine::{EngineError, EngineHandle, ReconciliationEngine};
pub use model::{
    AgentStats, DenialRecord, LogLine, OperationKind, Outcome, RecordId, SecurityPolicy, Snapshot,
};
