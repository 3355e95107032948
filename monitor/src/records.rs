//! Denial record window rebuilt from `denials.jsonl` on every change.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::model::{AgentStats, DenialRecord, MAX_RECORDS, OperationKind};

/// Most recent denial records and their per-agent aggregates.
pub struct RecordStore {
    path: PathBuf,
    records: Vec<DenialRecord>,
    agent_stats: Vec<AgentStats>,
    previous_count: usize,
    first_load: bool,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
            agent_stats: Vec::new(),
            previous_count: 0,
            first_load: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent first.
    pub fn records(&self) -> &[DenialRecord] {
        &self.records
    }

    pub fn agent_stats(&self) -> &[AgentStats] {
        &self.agent_stats
    }

    /// Re-derive the window from disk.
    ///
    /// Returns the newest record when this reload looks like a new arrival:
    /// not the first load, more parsed records than last time, and a
    /// non-empty window. The comparison is by count only, so an append that
    /// coincides with an older line dropping out of the window goes unseen.
    pub fn reload(&mut self) -> Option<DenialRecord> {
        let content = match std::fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::debug!("Denial log {} unreadable: {e}", self.path.display());
                self.records.clear();
                self.agent_stats.clear();
                return None;
            }
        };

        let parsed = parse_window(&content);
        let arrival = if !self.first_load && parsed.len() > self.previous_count {
            parsed.first().cloned()
        } else {
            None
        };

        self.previous_count = parsed.len();
        self.agent_stats = agent_stats(&parsed);
        self.records = parsed;
        self.first_load = false;

        arrival
    }
}

/// Parse up to [`MAX_RECORDS`] of the last non-empty lines, newest first.
/// Lines that are not valid records are skipped.
fn parse_window(content: &str) -> Vec<DenialRecord> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .rev()
        .take(MAX_RECORDS)
        .filter_map(|line| match serde_json::from_str::<DenialRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!("Skipping malformed denial line: {e}");
                None
            }
        })
        .collect()
}

/// Count deletes and moves per ancestor, ordered by descending total with
/// ties kept in first-seen order.
pub fn agent_stats(records: &[DenialRecord]) -> Vec<AgentStats> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut stats: Vec<AgentStats> = Vec::new();

    for record in records {
        let (deletes, moves) = match record.op {
            OperationKind::Delete => (1, 0),
            OperationKind::Rename => (0, 1),
            OperationKind::Unknown => continue,
        };
        let slot = *index.entry(record.ancestor.as_str()).or_insert_with(|| {
            stats.push(AgentStats {
                agent_name: record.ancestor.clone(),
                delete_count: 0,
                move_count: 0,
            });
            stats.len() - 1
        });
        stats[slot].delete_count += deletes;
        stats[slot].move_count += moves;
    }

    // Stable sort: ties keep first-seen order.
    stats.sort_by_key(|s| Reverse(s.total()));
    stats
}
