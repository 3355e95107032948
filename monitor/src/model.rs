//! Domain types shared by the stores, the engine and its observers.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Maximum number of denial records kept in the window.
pub const MAX_RECORDS: usize = 200;

/// Maximum number of daemon log lines kept in the tail.
pub const MAX_LOG_LINES: usize = 200;

/// Placeholder shown when the last-denial file is missing or empty.
pub const NO_RECENT_DENIAL: &str = "No recent denials";

/// Tool names trusted when the policy document does not list its own.
pub const DEFAULT_TRUSTED_TOOLS: &[&str] = &["git", "cargo", "npm", "pnpm", "yarn", "make", "nix"];

/// AI-agent process patterns used when the policy document does not list its own.
pub const DEFAULT_AI_AGENT_PATTERNS: &[&str] =
    &["codex", "claude", "cursor", "gemini", "aider", "copilot"];

/// Kind of filesystem operation the daemon refused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[serde(rename = "unlink")]
    Delete,
    Rename,
    /// Any operation name this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Stable identity of a denial record: `"{ts}-{path}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One line of `denials.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DenialRecord {
    /// Epoch seconds.
    pub ts: i64,
    pub op: OperationKind,
    pub path: String,
    /// Rename destination; absent for deletes.
    #[serde(default)]
    pub dest: Option<String>,
    pub zone: String,
    pub process: String,
    pub ancestor: String,
}

impl DenialRecord {
    pub fn id(&self) -> RecordId {
        RecordId(format!("{}-{}", self.ts, self.path))
    }

    /// Last path component of the subject, or the whole path if it has none.
    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

/// Last component of `path` for user-facing messages.
pub fn display_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// The daemon's enforcement document (`es_policy.json`).
///
/// Fields this build does not model are kept in `extra` and written back
/// untouched, so a rewrite never drops daemon-managed configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecurityPolicy {
    pub protected_zones: Vec<String>,
    #[serde(default)]
    pub temporary_overrides: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_agent_patterns: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SecurityPolicy {
    /// The value used whenever the document is missing or malformed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn effective_trusted_tools(&self) -> Vec<String> {
        self.trusted_tools
            .clone()
            .unwrap_or_else(|| DEFAULT_TRUSTED_TOOLS.iter().map(ToString::to_string).collect())
    }

    pub fn effective_ai_agent_patterns(&self) -> Vec<String> {
        self.ai_agent_patterns.clone().unwrap_or_else(|| {
            DEFAULT_AI_AGENT_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect()
        })
    }

    /// Whether the daemon would currently guard `path`: it lies inside a
    /// protected zone and not under a temporary override.
    pub fn is_protected(&self, path: &str) -> bool {
        let in_zone = self
            .protected_zones
            .iter()
            .any(|zone| path.starts_with(zone.as_str()));
        in_zone
            && !self
                .temporary_overrides
                .iter()
                .any(|over| path.starts_with(over.as_str()))
    }
}

/// One daemon log line after escape-sequence stripping.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub is_error: bool,
}

/// Markers that flag a log line as an error.
pub const ERROR_MARKERS: &[&str] = &["[DENY]", "ERROR", "panic"];

impl LogLine {
    pub fn classify(text: impl Into<String>) -> Self {
        let text = text.into();
        let is_error = ERROR_MARKERS.iter().any(|marker| text.contains(marker));
        Self { text, is_error }
    }
}

/// Per-ancestor denial counts over the current record window.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentStats {
    pub agent_name: String,
    pub delete_count: usize,
    pub move_count: usize,
}

impl AgentStats {
    pub fn total(&self) -> usize {
        self.delete_count + self.move_count
    }
}

/// Result of a user-initiated action, shown transiently.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Point-in-time view published by the engine.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snapshot {
    /// Most recent first.
    pub records: Vec<DenialRecord>,
    pub agent_stats: Vec<AgentStats>,
    pub policy: SecurityPolicy,
    pub last_denial: String,
    /// Oldest first.
    pub log_tail: Vec<LogLine>,
    /// Lines delivered by the tailer since the engine started.
    pub log_lines_received: u64,
    pub daemon_running: bool,
    /// The newest record differs from the last acknowledged one.
    pub unacknowledged: bool,
    pub outcome: Option<Outcome>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            agent_stats: Vec::new(),
            policy: SecurityPolicy::empty(),
            last_denial: NO_RECENT_DENIAL.to_string(),
            log_tail: Vec::new(),
            log_lines_received: 0,
            daemon_running: false,
            unacknowledged: false,
            outcome: None,
        }
    }
}
