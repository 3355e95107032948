//! Per-path change notification that survives file replacement.
//!
//! Each watched path is driven by its own task through three states:
//!
//! ```text
//! Watching --(delete / rename / identity change)--> Reopening --(path reappears)--> Watching
//!     \                                                  |
//!      `------------------- stop() --------------------> Stopped
//! ```
//!
//! Producers commonly rewrite a file by renaming a temp file over it or by
//! deleting and recreating it. Both leave the OS watch attached to a dead
//! inode, so on an invalidating event the task fires the callback, drops the
//! stale watch and retries opening the path with exponential backoff until it
//! succeeds or the watch is stopped. A successful re-arm fires the callback
//! once more so content written during the gap is picked up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use esguard_async_utils::sleep_or_cancel;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fsutil::FileIdentity;

/// Callback fired (at least once) per logical change of a watched file.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("path does not exist: {}", .0.display())]
    Missing(PathBuf),

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// Lifecycle of a single path watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Watching,
    /// The previous handle was invalidated; `attempt` counts re-open tries.
    Reopening { attempt: u32 },
    Stopped,
}

/// Timing for re-arming a watch after its file was replaced.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Delay before the first re-open attempt.
    pub rearm_delay: Duration,
    /// Upper bound for the backoff between later attempts.
    pub rearm_max_delay: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            rearm_delay: Duration::from_millis(500),
            rearm_max_delay: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    Ignore,
    Changed,
    /// The watched handle no longer refers to the file at the path.
    Invalidated,
}

fn classify(kind: EventKind) -> EventClass {
    match kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => EventClass::Invalidated,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => EventClass::Changed,
        EventKind::Access(_) => EventClass::Ignore,
        _ => EventClass::Changed,
    }
}

/// An OS watch on one file plus the identity of the file it was opened on.
struct ArmedWatch {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    identity: FileIdentity,
}

impl ArmedWatch {
    fn open(path: &Path) -> Result<Self, WatchError> {
        let metadata =
            std::fs::metadata(path).map_err(|_| WatchError::Missing(path.to_path_buf()))?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        Ok(Self {
            _watcher: watcher,
            events,
            identity: FileIdentity::from_metadata(&metadata),
        })
    }

    fn replaced(&self, path: &Path) -> bool {
        FileIdentity::of(path) != Some(self.identity)
    }
}

struct WatchEntry {
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    _task: JoinHandle<()>,
}

/// Owns one background watch task per path.
pub struct PathWatcher {
    options: WatchOptions,
    entries: HashMap<PathBuf, WatchEntry>,
    root: CancellationToken,
}

impl PathWatcher {
    pub fn new(options: WatchOptions) -> Self {
        Self {
            options,
            entries: HashMap::new(),
            root: CancellationToken::new(),
        }
    }

    /// Start watching `path`, replacing any existing watch on it.
    ///
    /// Returns `false` (after logging) when the path cannot be watched, for
    /// example because it does not exist yet; such a watch never fires.
    /// Must be called from within a tokio runtime.
    pub fn watch<F>(&mut self, path: impl Into<PathBuf>, on_change: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let path = path.into();
        self.stop(&path);

        let armed = match ArmedWatch::open(&path) {
            Ok(armed) => armed,
            Err(e) => {
                tracing::warn!("Not watching {}: {e}", path.display());
                return false;
            }
        };

        let cancel = self.root.child_token();
        let (state_tx, state_rx) = watch::channel(WatchState::Watching);
        let task = tokio::spawn(run_watch(
            path.clone(),
            armed,
            Arc::new(on_change),
            self.options.clone(),
            state_tx,
            cancel.clone(),
        ));

        tracing::debug!("Watching {}", path.display());
        self.entries.insert(
            path,
            WatchEntry {
                cancel,
                state: state_rx,
                _task: task,
            },
        );
        true
    }

    /// Current state of the watch on `path`; `Stopped` if there is none.
    pub fn state(&self, path: &Path) -> WatchState {
        self.entries
            .get(path)
            .map(|entry| *entry.state.borrow())
            .unwrap_or(WatchState::Stopped)
    }

    /// Whether a live watch (watching or re-opening) exists for `path`.
    pub fn is_active(&self, path: &Path) -> bool {
        self.state(path) != WatchState::Stopped
    }

    /// Subscribe to state transitions of the watch on `path`.
    pub fn subscribe_state(&self, path: &Path) -> Option<watch::Receiver<WatchState>> {
        self.entries.get(path).map(|entry| entry.state.clone())
    }

    /// Stop watching `path` and release its OS handle.
    pub fn stop(&mut self, path: &Path) -> bool {
        match self.entries.remove(path) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!("Stopped watching {}", path.display());
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.cancel.cancel();
        }
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run_watch(
    path: PathBuf,
    mut armed: ArmedWatch,
    on_change: ChangeCallback,
    options: WatchOptions,
    state_tx: watch::Sender<WatchState>,
    cancel: CancellationToken,
) {
    loop {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    state_tx.send_replace(WatchState::Stopped);
                    return;
                }
                event = armed.events.recv() => event,
            };

            match event {
                Some(Ok(event)) => match classify(event.kind) {
                    EventClass::Ignore => {}
                    EventClass::Changed => {
                        on_change();
                        if armed.replaced(&path) {
                            tracing::debug!("{} now names a different file", path.display());
                            break;
                        }
                    }
                    EventClass::Invalidated => {
                        on_change();
                        break;
                    }
                },
                Some(Err(e)) => tracing::warn!("Watch error on {}: {e}", path.display()),
                None => {
                    tracing::debug!("Watch channel closed for {}", path.display());
                    break;
                }
            }
        }

        drop(armed);
        match rearm(&path, &options, &state_tx, &cancel).await {
            Some(next) => {
                armed = next;
                state_tx.send_replace(WatchState::Watching);
                on_change();
            }
            None => {
                state_tx.send_replace(WatchState::Stopped);
                return;
            }
        }
    }
}

/// Retry opening `path` until it succeeds or `cancel` fires.
async fn rearm(
    path: &Path,
    options: &WatchOptions,
    state_tx: &watch::Sender<WatchState>,
    cancel: &CancellationToken,
) -> Option<ArmedWatch> {
    let mut delays = ExponentialBuilder::default()
        .with_min_delay(options.rearm_delay)
        .with_max_delay(options.rearm_max_delay)
        .with_max_times(usize::MAX)
        .build();

    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        state_tx.send_replace(WatchState::Reopening { attempt });

        let delay = delays.next().unwrap_or(options.rearm_max_delay);
        if !sleep_or_cancel(delay, cancel).await {
            return None;
        }

        match ArmedWatch::open(path) {
            Ok(armed) => {
                tracing::debug!(
                    "Re-armed watch on {} after {attempt} attempt(s)",
                    path.display()
                );
                return Some(armed);
            }
            Err(e) if attempt == 1 => {
                tracing::warn!("Re-arming watch on {} failed, retrying: {e}", path.display());
            }
            Err(e) => tracing::debug!("Re-arm attempt {attempt} for {}: {e}", path.display()),
        }
    }
}
