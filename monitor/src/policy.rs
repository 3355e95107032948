//! The policy document (`es_policy.json`): reload on change, rewrite on
//! override edits.
//!
//! Edits always start from the in-memory value rather than re-reading the
//! file, and are persisted through a temp-file rename so the watcher never
//! observes a half-written document.

use std::path::{Path, PathBuf};

use crate::fsutil::atomic_write;
use crate::model::SecurityPolicy;

/// Errors from writing the policy document.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct PolicyStore {
    path: PathBuf,
    policy: SecurityPolicy,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: SecurityPolicy::empty(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Re-read the document. Any failure resets to the empty policy.
    pub fn reload(&mut self) -> &SecurityPolicy {
        self.policy = match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<SecurityPolicy>(&bytes) {
                Ok(policy) => policy,
                Err(e) => {
                    tracing::warn!("Policy {} is malformed: {e}", self.path.display());
                    SecurityPolicy::empty()
                }
            },
            Err(e) => {
                tracing::debug!("Policy {} unreadable: {e}", self.path.display());
                SecurityPolicy::empty()
            }
        };
        &self.policy
    }

    /// Add `path` to the temporary overrides. Returns `false` if it was
    /// already present, in which case nothing is written.
    pub fn add_override(&mut self, path: &str) -> Result<bool, PolicyError> {
        if self.policy.temporary_overrides.iter().any(|p| p == path) {
            return Ok(false);
        }
        let mut next = self.policy.clone();
        next.temporary_overrides.push(path.to_string());
        self.persist(next)?;
        Ok(true)
    }

    /// Remove every occurrence of `path`. Returns whether one was present.
    pub fn remove_override(&mut self, path: &str) -> Result<bool, PolicyError> {
        if !self.policy.temporary_overrides.iter().any(|p| p == path) {
            return Ok(false);
        }
        let mut next = self.policy.clone();
        next.temporary_overrides.retain(|p| p != path);
        self.persist(next)?;
        Ok(true)
    }

    /// Drop all temporary overrides. Returns how many were removed.
    pub fn clear_overrides(&mut self) -> Result<usize, PolicyError> {
        let count = self.policy.temporary_overrides.len();
        if count == 0 {
            return Ok(0);
        }
        let mut next = self.policy.clone();
        next.temporary_overrides.clear();
        self.persist(next)?;
        Ok(count)
    }

    /// Write `next` to disk and adopt it; on failure the in-memory value is
    /// left untouched.
    fn persist(&mut self, next: SecurityPolicy) -> Result<(), PolicyError> {
        let mut json = serde_json::to_vec_pretty(&next)?;
        json.push(b'\n');
        atomic_write(&self.path, &json)?;
        tracing::info!(
            "Wrote {} ({} temporary override(s))",
            self.path.display(),
            next.temporary_overrides.len()
        );
        self.policy = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const FULL_POLICY: &str = r#"{
  "protected_zones": ["/Users/me/01-agent/", "/Users/me/00-nixos-config/"],
  "temporary_overrides": [],
  "trusted_tools": ["git", "jj"],
  "ai_agent_patterns": ["codex", "claude"],
  "enforcement": {"mode": "deny", "log_level": 2}
}"#;

    fn store_with(content: &str) -> (TempDir, PolicyStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("es_policy.json");
        std::fs::write(&path, content).unwrap();
        let mut store = PolicyStore::new(path);
        store.reload();
        (dir, store)
    }

    #[test]
    fn missing_document_is_the_empty_policy() {
        let dir = TempDir::new().unwrap();
        let mut store = PolicyStore::new(dir.path().join("es_policy.json"));
        assert_eq!(store.reload(), &SecurityPolicy::empty());
    }

    #[test]
    fn malformed_document_discards_the_previous_value() {
        let (_dir, mut store) = store_with(FULL_POLICY);
        assert_eq!(store.policy().protected_zones.len(), 2);

        std::fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.reload(), &SecurityPolicy::empty());
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let (_dir, store) = store_with(r#"{"protected_zones":["/a"],"temporary_overrides":["/a/b"]}"#);
        let policy = store.policy();
        assert_eq!(policy.protected_zones, vec!["/a"]);
        assert_eq!(policy.temporary_overrides, vec!["/a/b"]);
        assert_eq!(policy.trusted_tools, None);
        assert_eq!(policy.ai_agent_patterns, None);
    }

    #[test]
    fn override_round_trip_preserves_daemon_fields() {
        let (_dir, mut store) = store_with(FULL_POLICY);
        let before = store.policy().clone();

        assert!(store.add_override("/Users/me/01-agent/notes.md").unwrap());
        assert!(!store.path().with_extension("tmp").exists());

        let reloaded = store.reload().clone();
        assert_eq!(
            reloaded.temporary_overrides,
            vec!["/Users/me/01-agent/notes.md"]
        );
        assert_eq!(reloaded.trusted_tools, before.trusted_tools);
        assert_eq!(reloaded.ai_agent_patterns, before.ai_agent_patterns);
        assert_eq!(reloaded.protected_zones, before.protected_zones);
        assert_eq!(reloaded.extra, before.extra);
    }

    #[test]
    fn absent_optional_fields_stay_absent_after_write() {
        let (_dir, mut store) = store_with(r#"{"protected_zones":["/a"],"temporary_overrides":[]}"#);
        store.add_override("/a/x").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(raw.get("trusted_tools").is_none());
        assert!(raw.get("ai_agent_patterns").is_none());
    }

    #[test]
    fn duplicate_override_is_not_added_twice() {
        let (_dir, mut store) = store_with(FULL_POLICY);
        assert!(store.add_override("/x").unwrap());
        assert!(!store.add_override("/x").unwrap());
        assert_eq!(store.policy().temporary_overrides, vec!["/x"]);
    }

    #[test]
    fn remove_and_clear_overrides() {
        let (_dir, mut store) = store_with(FULL_POLICY);
        store.add_override("/x").unwrap();
        store.add_override("/y").unwrap();
        store.add_override("/z").unwrap();

        assert!(store.remove_override("/y").unwrap());
        assert!(!store.remove_override("/y").unwrap());
        assert_eq!(store.reload().temporary_overrides, vec!["/x", "/z"]);

        assert_eq!(store.clear_overrides().unwrap(), 2);
        assert_eq!(store.clear_overrides().unwrap(), 0);
        assert!(store.reload().temporary_overrides.is_empty());
        assert_eq!(store.policy().trusted_tools.as_deref(), Some(&["git".to_string(), "jj".to_string()][..]));
    }

    #[test]
    fn failed_write_keeps_the_in_memory_policy() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let mut store = PolicyStore::new(blocker.join("es_policy.json"));
        assert!(store.add_override("/x").is_err());
        assert!(store.policy().temporary_overrides.is_empty());
    }
}
