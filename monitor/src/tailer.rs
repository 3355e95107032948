//! Incremental reader for the daemon's append-only log.
//!
//! The cursor starts at the end of the file, so history is never replayed.
//! New bytes are split into lines; a trailing line without its newline is
//! held back until a later read completes it. If the file shrinks below the
//! cursor or is replaced by a different file, reading restarts at offset 0.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::fsutil::FileIdentity;
use crate::model::LogLine;

/// Callback receiving each batch of newly completed lines, oldest first.
pub type LinesCallback = Arc<dyn Fn(Vec<LogLine>) + Send + Sync>;

/// Shortest fallback poll period; smaller values are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Wake-up period used only when the log's directory cannot be watched.
    pub poll_interval: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Read cursor into a growing text file.
pub struct TailCursor {
    path: PathBuf,
    offset: u64,
    identity: Option<FileIdentity>,
    /// Bytes of an incomplete trailing line.
    pending: Vec<u8>,
}

impl TailCursor {
    /// Position a cursor at the current end of `path`.
    pub fn at_end(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        Ok(Self {
            offset: metadata.len(),
            identity: Some(FileIdentity::from_metadata(&metadata)),
            pending: Vec::new(),
            path,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read everything appended since the last call and return the lines it
    /// completed. A missing file yields no lines.
    pub fn read_available(&mut self) -> io::Result<Vec<LogLine>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let metadata = file.metadata()?;
        let identity = FileIdentity::from_metadata(&metadata);
        if self.identity != Some(identity) || metadata.len() < self.offset {
            tracing::info!(
                "{} was truncated or replaced; reading from the start",
                self.path.display()
            );
            self.offset = 0;
            self.pending.clear();
            self.identity = Some(identity);
        }
        if metadata.len() == self.offset {
            return Ok(vec![]);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf)?;
        self.offset += read as u64;

        Ok(self.feed(&buf))
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<LogLine> {
        self.pending.extend_from_slice(bytes);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return vec![];
        };

        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        complete.split(|b| *b == b'\n').filter_map(decode_line).collect()
    }
}

fn decode_line(raw: &[u8]) -> Option<LogLine> {
    let stripped = strip_ansi_escapes::strip(raw);
    let text = String::from_utf8_lossy(&stripped);
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        return None;
    }
    Some(LogLine::classify(text))
}

struct ActiveTail {
    path: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Follows one log file on a background task.
pub struct LogTailer {
    options: TailOptions,
    active: Option<ActiveTail>,
}

impl LogTailer {
    pub fn new(options: TailOptions) -> Self {
        Self {
            options,
            active: None,
        }
    }

    /// Begin delivering lines appended to `path` from now on.
    ///
    /// Returns `false` (after logging) when the file does not exist; tailing
    /// is then not attempted again. Must be called within a tokio runtime.
    pub fn start_tailing<F>(&mut self, path: impl Into<PathBuf>, on_new_lines: F) -> bool
    where
        F: Fn(Vec<LogLine>) + Send + Sync + 'static,
    {
        self.stop_tailing();
        let path = path.into();

        let cursor = match TailCursor::at_end(&path) {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!("Not tailing {}: {e}", path.display());
                return false;
            }
        };

        let (wake_tx, wake_rx) = mpsc::channel::<()>(1);
        let watcher = directory_watcher(&path, wake_tx.clone());
        let poll = watcher.is_none().then_some(self.options.poll_interval);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_tail(
            cursor,
            watcher,
            wake_tx,
            wake_rx,
            Arc::new(on_new_lines),
            poll,
            cancel.clone(),
        ));

        tracing::debug!("Tailing {}", path.display());
        self.active = Some(ActiveTail {
            path,
            cancel,
            task,
        });
        true
    }

    /// Whether a tail task is live. A task that ended on its own counts as
    /// not tailing so the owner can start it again.
    pub fn is_tailing(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    pub fn tailed_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.path.as_path())
    }

    /// Stop delivery and release the file.
    pub fn stop_tailing(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            tracing::debug!("Stopped tailing {}", active.path.display());
        }
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop_tailing();
    }
}

/// Watch the log's parent directory so appends, truncation and recreation
/// all wake the reader. Returns `None` when no watcher could be set up; reads
/// are then driven by the poll interval.
fn directory_watcher(path: &Path, wake_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let file_name = path.file_name()?.to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
        {
            let _ = wake_tx.try_send(());
        }
    })
    .map_err(|e| tracing::debug!("Log watcher unavailable, polling only: {e}"))
    .ok()?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| tracing::debug!("Cannot watch {}: {e}", dir.display()))
        .ok()?;

    Some(watcher)
}

async fn run_tail(
    mut cursor: TailCursor,
    _watcher: Option<RecommendedWatcher>,
    // Held so `wake_rx` stays open even without a watcher.
    _wake_tx: mpsc::Sender<()>,
    mut wake_rx: mpsc::Receiver<()>,
    on_new_lines: LinesCallback,
    poll_interval: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut poll = poll_interval.map(|period| {
        let mut poll = tokio::time::interval(period.max(MIN_POLL_INTERVAL));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll
    });

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wake_rx.recv() => {}
            _ = next_poll(&mut poll) => {}
        }

        match cursor.read_available() {
            Ok(lines) if !lines.is_empty() => on_new_lines(lines),
            Ok(_) => {}
            Err(e) => tracing::debug!("Reading {} failed: {e}", cursor.path.display()),
        }
    }
}

/// Next poll tick, or never when reads are event-driven.
async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn append(path: &Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    fn texts(lines: &[LogLine]) -> Vec<&str> {
        lines.iter().map(|line| line.text.as_str()).collect()
    }

    #[test]
    fn appended_lines_are_classified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "history that must not be replayed\n").unwrap();

        let mut cursor = TailCursor::at_end(&path).unwrap();
        append(&path, b"[DENY] blocked\nok\n");
        let lines = cursor.read_available().unwrap();

        assert_eq!(
            lines,
            vec![
                LogLine {
                    text: "[DENY] blocked".to_string(),
                    is_error: true
                },
                LogLine {
                    text: "ok".to_string(),
                    is_error: false
                },
            ]
        );
        assert!(cursor.read_available().unwrap().is_empty());
    }

    #[test]
    fn partial_line_is_held_until_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "").unwrap();
        let mut cursor = TailCursor::at_end(&path).unwrap();

        append(&path, b"first\n[DE");
        assert_eq!(texts(&cursor.read_available().unwrap()), vec!["first"]);

        append(&path, b"NY] blocked");
        assert!(cursor.read_available().unwrap().is_empty());

        append(&path, b"\n");
        let lines = cursor.read_available().unwrap();
        assert_eq!(texts(&lines), vec!["[DENY] blocked"]);
        assert!(lines[0].is_error);
    }

    #[test]
    fn multibyte_characters_split_across_reads_decode_intact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "").unwrap();
        let mut cursor = TailCursor::at_end(&path).unwrap();

        let line = "拦截 blocked\n".as_bytes();
        append(&path, &line[..2]);
        assert!(cursor.read_available().unwrap().is_empty());
        append(&path, &line[2..]);

        assert_eq!(texts(&cursor.read_available().unwrap()), vec!["拦截 blocked"]);
    }

    #[test]
    fn escape_sequences_and_carriage_returns_are_stripped() {
        let mut cursor = TailCursor {
            path: PathBuf::from("unused"),
            offset: 0,
            identity: None,
            pending: Vec::new(),
        };

        let lines = cursor.feed(b"\x1b[31mERROR\x1b[0m failed\r\n\n\x1b[1mplain\x1b[0m\n");
        assert_eq!(texts(&lines), vec!["ERROR failed", "plain"]);
        assert!(lines[0].is_error);
        assert!(!lines[1].is_error);
    }

    #[test]
    fn truncation_restarts_from_the_beginning() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "").unwrap();
        let mut cursor = TailCursor::at_end(&path).unwrap();

        append(&path, b"one\ntwo\npartial");
        assert_eq!(texts(&cursor.read_available().unwrap()), vec!["one", "two"]);

        std::fs::write(&path, "fresh\n").unwrap();
        assert_eq!(texts(&cursor.read_available().unwrap()), vec!["fresh"]);
        assert_eq!(cursor.offset(), "fresh\n".len() as u64);
    }

    #[cfg(unix)]
    #[test]
    fn replaced_file_is_read_from_the_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "a long line of old history\n").unwrap();
        let mut cursor = TailCursor::at_end(&path).unwrap();

        let rotated = dir.path().join("guard.log.new");
        std::fs::write(&rotated, "a much longer first line of the new log file\n").unwrap();
        std::fs::rename(&rotated, &path).unwrap();

        assert_eq!(
            texts(&cursor.read_available().unwrap()),
            vec!["a much longer first line of the new log file"]
        );
    }

    #[test]
    fn missing_file_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "").unwrap();
        let mut cursor = TailCursor::at_end(&path).unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(cursor.read_available().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_file_is_not_tailed() {
        let dir = TempDir::new().unwrap();
        let mut tailer = LogTailer::new(TailOptions::default());

        assert!(!tailer.start_tailing(dir.path().join("absent.log"), |_| {}));
        assert!(!tailer.is_tailing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tailer_delivers_appended_batches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "old line\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Reads must be driven by directory events, not the poll period.
        let mut tailer = LogTailer::new(TailOptions {
            poll_interval: Duration::from_secs(3600),
        });
        assert!(tailer.start_tailing(&path, move |lines| {
            let _ = tx.send(lines);
        }));
        assert_eq!(tailer.tailed_path(), Some(path.as_path()));

        append(&path, b"[DENY] blocked\nok\n");

        let mut received = Vec::new();
        while received.len() < 2 {
            let batch = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no lines delivered")
                .expect("tailer dropped its callback");
            received.extend(batch);
        }
        assert_eq!(texts(&received), vec!["[DENY] blocked", "ok"]);
        assert!(received[0].is_error);
        assert!(!received[1].is_error);

        tailer.stop_tailing();
        assert!(!tailer.is_tailing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_poll_interval_still_delivers_without_a_watcher() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.log");
        std::fs::write(&path, "").unwrap();

        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_tail(
            TailCursor::at_end(&path).unwrap(),
            None,
            wake_tx,
            wake_rx,
            Arc::new(move |lines: Vec<LogLine>| {
                let _ = lines_tx.send(lines);
            }),
            Some(Duration::ZERO),
            cancel.clone(),
        ));

        append(&path, b"[DENY] x\n");
        let batch = timeout(Duration::from_secs(5), lines_rx.recv())
            .await
            .expect("no lines delivered")
            .expect("tail task ended");
        assert_eq!(texts(&batch), vec!["[DENY] x"]);
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
    }
}
