//! Deterministic maildir traversal.
//!
//! A walk visits every folder and regular file below a user's maildir root in
//! lexicographic order per directory level, counts them, sums file sizes and
//! feeds each root-relative path into a [`PathHasher`]. The resulting checksum
//! is a fingerprint of the tree's structure: it changes when paths are added,
//! removed or renamed, but not when only file contents change.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::WatchPolicy;
use crate::entity::MaildirCounts;
use crate::error::{MaildirError, Result};

/// Incremental hash over the sequence of visited paths.
pub trait PathHasher: Default {
    /// Feed one root-relative path.
    fn update(&mut self, path: &Path);

    /// Hex-encoded digest of everything fed so far.
    fn finalize(self) -> String;
}

/// BLAKE3 implementation of [`PathHasher`].
#[derive(Default)]
pub struct Blake3PathHasher(blake3::Hasher);

impl PathHasher for Blake3PathHasher {
    fn update(&mut self, path: &Path) {
        self.0.update(path.as_os_str().as_encoded_bytes());
        // Terminate each path so ["ab", "c"] and ["a", "bc"] hash differently.
        self.0.update(&[0]);
    }

    fn finalize(self) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

/// One visited folder or file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkItem {
    /// Path relative to the maildir root.
    pub path: PathBuf,
    /// Byte length for files, zero for folders.
    pub size: u64,
}

/// Outcome of one successful walk.
#[derive(Debug, Clone)]
pub struct WalkResult {
    /// Visited entries in traversal order.
    pub items: Vec<WalkItem>,
    pub counts: MaildirCounts,
    pub checksum: String,
}

/// Walk `root` with the default BLAKE3 checksum.
///
/// See [`walk_tree_with`].
pub fn walk_tree<F>(root: &Path, policy: &WatchPolicy, register: F) -> Result<WalkResult>
where
    F: FnMut(&Path) -> Result<()>,
{
    walk_tree_with::<Blake3PathHasher, F>(root, policy, register)
}

/// Walk the tree below `root`, hashing paths with `H`.
///
/// `register` is called with `root` itself and with every directory the
/// `policy` selects, so the caller can subscribe to changes in them. The root
/// is neither counted nor hashed. Entries that are neither directories nor
/// regular files (symlinks, sockets, ...) are skipped entirely.
///
/// # Errors
///
/// Fails on the first I/O error for any entry and on the first error
/// returned by `register`. No partial result is returned.
pub fn walk_tree_with<H, F>(root: &Path, policy: &WatchPolicy, mut register: F) -> Result<WalkResult>
where
    H: PathHasher,
    F: FnMut(&Path) -> Result<()>,
{
    let root_meta = fs::symlink_metadata(root).map_err(|e| MaildirError::walk(root, e))?;
    if !root_meta.is_dir() {
        return Err(MaildirError::walk(
            root,
            io::Error::new(io::ErrorKind::NotADirectory, "maildir root is not a directory"),
        ));
    }
    register(root)?;

    let mut hasher = H::default();
    let mut items = Vec::new();
    let mut counts = MaildirCounts::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| walkdir_error(root, e))?;
        let file_type = entry.file_type();

        let size = if file_type.is_dir() {
            counts.folders += 1;
            if policy.should_watch(&entry.file_name().to_string_lossy()) {
                register(entry.path())?;
            }
            0
        } else if file_type.is_file() {
            let metadata = entry.metadata().map_err(|e| walkdir_error(root, e))?;
            counts.files += 1;
            counts.size += metadata.len();
            metadata.len()
        } else {
            continue;
        };
        counts.elements += 1;

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        hasher.update(&relative);
        items.push(WalkItem {
            path: relative,
            size,
        });
    }

    Ok(WalkResult {
        items,
        counts,
        checksum: hasher.finalize(),
    })
}

fn walkdir_error(root: &Path, e: walkdir::Error) -> MaildirError {
    let path = e.path().unwrap_or(root).to_path_buf();
    let source = e
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("filesystem loop detected"));
    MaildirError::walk(path, source)
}
