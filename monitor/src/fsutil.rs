//! Small filesystem helpers shared by the stores and the watchers.

use std::io;
use std::path::Path;

/// Atomically write `data` to `path` via a `.tmp` sibling.
///
/// A reader racing with the write sees either the old document or the new
/// one, never a partial file.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

/// Identity of the file currently at a path.
///
/// Used to notice that a path now names a different file (rename-over or
/// delete-and-recreate) even when no delete event was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    /// `None` when the path does not exist or cannot be inspected.
    pub(crate) fn of(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self::from_metadata(&metadata))
    }

    #[cfg(unix)]
    pub(crate) fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    // Without inode numbers every file looks the same; replacement is then
    // detected from event kinds alone.
    #[cfg(not(unix))]
    pub(crate) fn from_metadata(_metadata: &std::fs::Metadata) -> Self {
        Self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!path.with_extension("tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn identity_changes_when_file_is_replaced() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        std::fs::write(&path, "a").unwrap();
        let before = FileIdentity::of(&path).unwrap();

        std::fs::write(&path, "b").unwrap();
        assert_eq!(FileIdentity::of(&path), Some(before));

        let replacement = dir.path().join("replacement.txt");
        std::fs::write(&replacement, "c").unwrap();
        std::fs::rename(&replacement, &path).unwrap();
        assert_ne!(FileIdentity::of(&path), Some(before));

        std::fs::remove_file(&path).unwrap();
        assert_eq!(FileIdentity::of(&path), None);
    }
}
