//! In-memory state of one user's maildir.

use std::path::{Path, PathBuf};

/// Aggregate counts produced by one walk of a maildir.
///
/// The root directory of the maildir is never part of these counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaildirCounts {
    /// Folders plus files.
    pub elements: u64,
    pub folders: u64,
    pub files: u64,
    /// Sum of the byte lengths of all regular files.
    pub size: u64,
}

/// One discovered user maildir and the state its walk loop keeps for it.
///
/// `path` never changes after discovery. The checksum and counts are only
/// written by the entity's own walk loop.
#[derive(Debug, Clone)]
pub struct Entity {
    user: String,
    path: PathBuf,
    last_checksum: Option<String>,
    counts: MaildirCounts,
}

impl Entity {
    pub fn new(user: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            path: path.into(),
            last_checksum: None,
            counts: MaildirCounts::default(),
        }
    }

    /// Name of the user directory, used as the `user` metric label.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Absolute path of the maildir root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checksum of the last successful walk, `None` before the first one.
    pub fn last_checksum(&self) -> Option<&str> {
        self.last_checksum.as_deref()
    }

    pub fn counts(&self) -> MaildirCounts {
        self.counts
    }

    /// Store the outcome of a successful walk.
    ///
    /// Returns the previous checksum when it differs from `checksum`, i.e.
    /// when the series keyed by it has become stale.
    pub fn record_walk(&mut self, checksum: String, counts: MaildirCounts) -> Option<String> {
        self.counts = counts;
        if self.last_checksum.as_deref() == Some(checksum.as_str()) {
            return None;
        }
        self.last_checksum.replace(checksum)
    }
}
