//! The reconciliation engine: one task that owns every store, fans file
//! changes into the matching reload and publishes a single snapshot.
//!
//! Watch callbacks, the tailer, timers and spawned collaborator calls never
//! touch state. They post an [`Event`] to the owning task, which applies it
//! and republishes through a `tokio::sync::watch` channel. Callers talk to
//! the engine through a cloneable [`EngineHandle`].
//!
//! Shutdown (explicit, or when the last handle is dropped) stops every
//! watch, the tailer and all pending timers, then waits for in-flight
//! collaborator calls to observe cancellation.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use esguard_async_utils::{KeyedTimers, OrCancelExt, sleep_or_cancel};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ack::AckStore;
use crate::config::MonitorConfig;
use crate::control::{ControlError, DaemonController, Notifier, run_override_helper};
use crate::last_denial::read_last_denial;
use crate::model::{LogLine, MAX_LOG_LINES, Outcome, RecordId, Snapshot, display_name};
use crate::policy::PolicyStore;
use crate::records::RecordStore;
use crate::tailer::LogTailer;
use crate::watcher::PathWatcher;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine has shut down")]
    Closed,
}

/// Watched file feeding one of the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Policy,
    Denials,
    LastDenial,
}

const SOURCES: [Source; 3] = [Source::Policy, Source::Denials, Source::LastDenial];

/// Requests from handles.
enum Command {
    Refresh {
        reply: oneshot::Sender<Snapshot>,
    },
    Acknowledge {
        reply: oneshot::Sender<bool>,
    },
    RequestOverride {
        path: String,
        reply: oneshot::Sender<Outcome>,
    },
    RemoveOverride {
        path: String,
        reply: oneshot::Sender<Outcome>,
    },
    ClearAllOverrides {
        reply: oneshot::Sender<Outcome>,
    },
    RestartDaemon {
        reply: oneshot::Sender<Outcome>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Notifications from background work owned by the engine.
enum Event {
    Changed(Source),
    LogLines(Vec<LogLine>),
    RunningState {
        running: bool,
        reply: oneshot::Sender<Snapshot>,
    },
    OverrideExpired {
        path: String,
        generation: u64,
    },
    OutcomeExpired {
        generation: u64,
    },
    HelperFinished {
        path: String,
        result: Result<(), ControlError>,
        reply: oneshot::Sender<Outcome>,
    },
    RestartFinished {
        result: Result<(), ControlError>,
        running: bool,
        reply: oneshot::Sender<Outcome>,
    },
}

/// Cloneable front end to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl EngineHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that wakes on every published change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Reload every source once and resolve with the resulting snapshot.
    pub async fn refresh(&self) -> Result<Snapshot, EngineError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    /// Mark the newest record as seen. Resolves to `false` when there is no
    /// record to acknowledge.
    pub async fn acknowledge(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::Acknowledge { reply }).await
    }

    pub async fn request_override(&self, path: impl Into<String>) -> Result<Outcome, EngineError> {
        let path = path.into();
        self.request(|reply| Command::RequestOverride { path, reply })
            .await
    }

    pub async fn remove_override(&self, path: impl Into<String>) -> Result<Outcome, EngineError> {
        let path = path.into();
        self.request(|reply| Command::RemoveOverride { path, reply })
            .await
    }

    pub async fn clear_all_overrides(&self) -> Result<Outcome, EngineError> {
        self.request(|reply| Command::ClearAllOverrides { reply })
            .await
    }

    pub async fn restart_daemon(&self) -> Result<Outcome, EngineError> {
        self.request(|reply| Command::RestartDaemon { reply }).await
    }

    /// Stop the engine and wait until its background work has ended.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }
}

/// State owned by the engine task.
pub struct ReconciliationEngine {
    config: MonitorConfig,
    controller: Arc<dyn DaemonController>,
    notifier: Arc<dyn Notifier>,

    records: RecordStore,
    policy: PolicyStore,
    acks: AckStore,
    acknowledged: Option<RecordId>,
    last_denial: String,
    log_tail: VecDeque<LogLine>,
    log_lines_received: u64,
    daemon_running: bool,
    outcome: Option<Outcome>,

    watcher: PathWatcher,
    tailer: LogTailer,
    expiry: KeyedTimers<String>,
    outcome_timer: KeyedTimers<()>,

    events: mpsc::UnboundedSender<Event>,
    snapshot_tx: watch::Sender<Snapshot>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    /// Load every source, register watches and the tailer, and spawn the
    /// owning task. Must be called within a tokio runtime.
    pub async fn start(
        config: MonitorConfig,
        controller: Arc<dyn DaemonController>,
        notifier: Arc<dyn Notifier>,
    ) -> EngineHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let mut engine = Self {
            records: RecordStore::new(&config.paths.denials),
            policy: PolicyStore::new(&config.paths.policy),
            acks: AckStore::new(&config.paths.state),
            acknowledged: None,
            last_denial: String::new(),
            log_tail: VecDeque::with_capacity(MAX_LOG_LINES),
            log_lines_received: 0,
            daemon_running: false,
            outcome: None,
            watcher: PathWatcher::new(config.watch.clone()),
            tailer: LogTailer::new(config.tail.clone()),
            expiry: KeyedTimers::new(),
            outcome_timer: KeyedTimers::new(),
            events: events_tx,
            snapshot_tx,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            config,
            controller,
            notifier,
        };

        engine.acknowledged = engine.acks.load();
        for source in SOURCES {
            engine.reload(source);
        }
        engine.daemon_running = engine.controller.is_running().await;
        engine.register_watches();
        engine.ensure_tailing();
        engine.publish();

        tracing::info!(
            "Engine started: {} record(s), {} override(s), daemon {}",
            engine.records.records().len(),
            engine.policy.policy().temporary_overrides.len(),
            if engine.daemon_running { "running" } else { "not running" }
        );

        tokio::spawn(engine.run(commands_rx, events_rx));

        EngineHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = result {
                        tracing::warn!("Engine task failed: {e}");
                    }
                }
            }
        }
        tracing::debug!("All engine handles dropped");
        self.shutdown().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh { reply } => self.refresh(reply),
            Command::Acknowledge { reply } => {
                let _ = reply.send(self.acknowledge());
            }
            Command::RequestOverride { path, reply } => self.request_override(&path, reply),
            Command::RemoveOverride { path, reply } => {
                let outcome = self.remove_override(&path);
                let _ = reply.send(self.report(outcome));
            }
            Command::ClearAllOverrides { reply } => {
                let outcome = self.clear_all_overrides();
                let _ = reply.send(self.report(outcome));
            }
            Command::RestartDaemon { reply } => self.restart_daemon(reply),
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Changed(source) => {
                self.reload(source);
                self.publish();
            }
            Event::LogLines(lines) => {
                self.log_lines_received += lines.len() as u64;
                self.log_tail.extend(lines);
                while self.log_tail.len() > MAX_LOG_LINES {
                    self.log_tail.pop_front();
                }
                self.publish();
            }
            Event::RunningState { running, reply } => {
                self.daemon_running = running;
                self.publish();
                let _ = reply.send(self.snapshot_tx.borrow().clone());
            }
            Event::OverrideExpired { path, generation } => self.override_expired(path, generation),
            Event::OutcomeExpired { generation } => {
                if self.outcome_timer.complete(&(), generation) {
                    self.outcome = None;
                    self.publish();
                }
            }
            Event::HelperFinished {
                path,
                result,
                reply,
            } => {
                let outcome = self.helper_finished(&path, result);
                let _ = reply.send(self.report(outcome));
            }
            Event::RestartFinished {
                result,
                running,
                reply,
            } => {
                self.daemon_running = running;
                let outcome = match result {
                    Ok(()) if running => Outcome::success("Daemon restarted"),
                    Ok(()) => Outcome::failure("Restart failed: daemon is not running"),
                    Err(e) => Outcome::failure(format!("Restart failed: {e}")),
                };
                let _ = reply.send(self.report(outcome));
            }
        }
    }

    fn reload(&mut self, source: Source) {
        match source {
            Source::Policy => {
                self.policy.reload();
            }
            Source::Denials => {
                if let Some(record) = self.records.reload() {
                    tracing::info!("New denial {}", record.id());
                    self.notifier.denial(&record);
                }
            }
            Source::LastDenial => {
                self.last_denial = read_last_denial(&self.config.paths.last_denial);
            }
        }
    }

    fn source_path(&self, source: Source) -> &Path {
        match source {
            Source::Policy => &self.config.paths.policy,
            Source::Denials => &self.config.paths.denials,
            Source::LastDenial => &self.config.paths.last_denial,
        }
    }

    /// Watch every source that has no live watch yet.
    fn register_watches(&mut self) {
        for source in SOURCES {
            let path = self.source_path(source).to_path_buf();
            if self.watcher.is_active(&path) {
                continue;
            }
            let events = self.events.clone();
            self.watcher.watch(path, move || {
                let _ = events.send(Event::Changed(source));
            });
        }
    }

    fn ensure_tailing(&mut self) {
        if self.tailer.is_tailing() {
            return;
        }
        let events = self.events.clone();
        self.tailer
            .start_tailing(&self.config.paths.log, move |lines| {
                let _ = events.send(Event::LogLines(lines));
            });
    }

    fn refresh(&mut self, reply: oneshot::Sender<Snapshot>) {
        for source in SOURCES {
            self.reload(source);
        }
        self.register_watches();
        self.ensure_tailing();
        self.publish();
        self.check_running(reply);
    }

    fn check_running(&mut self, reply: oneshot::Sender<Snapshot>) {
        let controller = Arc::clone(&self.controller);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            if let Ok(running) = controller.is_running().or_cancel(&cancel).await {
                let _ = events.send(Event::RunningState { running, reply });
            }
        });
    }

    fn acknowledge(&mut self) -> bool {
        let Some(newest) = self.records.records().first().map(|r| r.id()) else {
            return false;
        };
        if let Err(e) = self.acks.save(&newest) {
            tracing::warn!("Failed to persist acknowledgement: {e}");
        }
        self.acknowledged = Some(newest);
        self.publish();
        true
    }

    fn request_override(&mut self, raw: &str, reply: oneshot::Sender<Outcome>) {
        let path = raw.trim();
        if path.is_empty() {
            let _ = reply.send(self.report(Outcome::failure("Override path is empty")));
            return;
        }
        if !Path::new(path).is_absolute() {
            let outcome = Outcome::failure(format!("Override path must be absolute: {path}"));
            let _ = reply.send(self.report(outcome));
            return;
        }

        let Some(helper) = self.config.daemon.override_helper.clone() else {
            let outcome = match self.policy.add_override(path) {
                Ok(_) => {
                    self.schedule_expiry(path);
                    Outcome::success(format!("Temporarily allowed {}", display_name(path)))
                }
                Err(e) => Outcome::failure(format!("Failed to update policy: {e}")),
            };
            let _ = reply.send(self.report(outcome));
            return;
        };

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let path = path.to_string();
        self.tasks.spawn(async move {
            if let Ok(result) = run_override_helper(&helper, &path).or_cancel(&cancel).await {
                let _ = events.send(Event::HelperFinished {
                    path,
                    result,
                    reply,
                });
            }
        });
    }

    fn helper_finished(&mut self, path: &str, result: Result<(), ControlError>) -> Outcome {
        match result {
            Ok(()) => {
                self.policy.reload();
                self.schedule_expiry(path);
                Outcome::success(format!("Temporarily allowed {}", display_name(path)))
            }
            Err(ControlError::Failed {
                code: Some(code), ..
            }) => Outcome::failure(format!("Override helper failed (exit code {code})")),
            Err(e) => Outcome::failure(format!("Override helper error: {e}")),
        }
    }

    fn schedule_expiry(&mut self, path: &str) {
        let Some(delay) = self.config.auto_revoke else {
            return;
        };
        let events = self.events.clone();
        let key = path.to_string();
        self.expiry.schedule(path.to_string(), delay, move |generation| {
            let _ = events.send(Event::OverrideExpired {
                path: key,
                generation,
            });
        });
    }

    fn remove_override(&mut self, path: &str) -> Outcome {
        let path = path.trim();
        match self.policy.remove_override(path) {
            Ok(true) => {
                self.expiry.cancel(&path.to_string());
                Outcome::success(format!("Removed override for {}", display_name(path)))
            }
            Ok(false) => {
                self.expiry.cancel(&path.to_string());
                Outcome::failure(format!("No override for {}", display_name(path)))
            }
            Err(e) => Outcome::failure(format!("Failed to update policy: {e}")),
        }
    }

    fn clear_all_overrides(&mut self) -> Outcome {
        match self.policy.clear_overrides() {
            Ok(count) => {
                self.expiry.cancel_all();
                Outcome::success(format!("Cleared {count} temporary override(s)"))
            }
            Err(e) => Outcome::failure(format!("Failed to update policy: {e}")),
        }
    }

    fn override_expired(&mut self, path: String, generation: u64) {
        if !self.expiry.complete(&path, generation) {
            tracing::debug!("Ignoring stale expiry for {path}");
            return;
        }
        match self.policy.remove_override(&path) {
            Ok(true) => {
                self.notifier.override_expired(&path);
                let outcome = Outcome::success(format!(
                    "Override for {} expired; protected again",
                    display_name(&path)
                ));
                self.report(outcome);
            }
            Ok(false) => tracing::debug!("Override for {path} already gone at expiry"),
            Err(e) => {
                tracing::warn!("Failed to revoke override for {path}: {e}");
                self.report(Outcome::failure(format!("Failed to update policy: {e}")));
            }
        }
    }

    fn restart_daemon(&mut self, reply: oneshot::Sender<Outcome>) {
        let controller = Arc::clone(&self.controller);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let settle = self.config.restart_settle;
        self.tasks.spawn(async move {
            let result = match controller.restart().or_cancel(&cancel).await {
                Ok(result) => result,
                Err(_) => return,
            };
            if !sleep_or_cancel(settle, &cancel).await {
                return;
            }
            if let Ok(running) = controller.is_running().or_cancel(&cancel).await {
                let _ = events.send(Event::RestartFinished {
                    result,
                    running,
                    reply,
                });
            }
        });
    }

    /// Show `outcome` until the outcome TTL elapses or a newer one arrives.
    fn report(&mut self, outcome: Outcome) -> Outcome {
        if outcome.success {
            tracing::info!("{}", outcome.message);
        } else {
            tracing::warn!("{}", outcome.message);
        }
        self.outcome = Some(outcome.clone());

        let events = self.events.clone();
        self.outcome_timer
            .schedule((), self.config.outcome_ttl, move |generation| {
                let _ = events.send(Event::OutcomeExpired { generation });
            });
        self.publish();
        outcome
    }

    fn build_snapshot(&self) -> Snapshot {
        let unacknowledged = self
            .records
            .records()
            .first()
            .is_some_and(|newest| Some(newest.id()) != self.acknowledged);

        Snapshot {
            records: self.records.records().to_vec(),
            agent_stats: self.records.agent_stats().to_vec(),
            policy: self.policy.policy().clone(),
            last_denial: self.last_denial.clone(),
            log_tail: self.log_tail.iter().cloned().collect(),
            log_lines_received: self.log_lines_received,
            daemon_running: self.daemon_running,
            unacknowledged,
            outcome: self.outcome.clone(),
        }
    }

    fn publish(&self) {
        let next = self.build_snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.watcher.stop_all();
        self.tailer.stop_tailing();
        self.expiry.cancel_all();
        self.outcome_timer.cancel_all();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!("Engine task failed during shutdown: {e}");
            }
        }
        tracing::info!("Engine stopped");
    }
}

