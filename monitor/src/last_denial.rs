//! The daemon's one-line summary of its most recent denial.

use std::path::Path;

use crate::model::NO_RECENT_DENIAL;

/// Read `last_denial.txt`, trimmed. Missing, unreadable or blank files
/// yield [`NO_RECENT_DENIAL`].
pub fn read_last_denial(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => NO_RECENT_DENIAL.to_string(),
        Err(e) => {
            tracing::debug!("Last denial {} unreadable: {e}", path.display());
            NO_RECENT_DENIAL.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn summary_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_denial.txt");
        std::fs::write(&path, "\n  codex tried to delete main.rs \n").unwrap();
        assert_eq!(read_last_denial(&path), "codex tried to delete main.rs");
    }

    #[test]
    fn missing_or_blank_file_uses_placeholder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_denial.txt");
        assert_eq!(read_last_denial(&path), NO_RECENT_DENIAL);

        std::fs::write(&path, " \n\t").unwrap();
        assert_eq!(read_last_denial(&path), NO_RECENT_DENIAL);
    }
}
