#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

/// A maildir root with one directory per user in an isolated temp directory
pub struct MaildirFixture {
    pub temp_dir: TempDir,
}

impl MaildirFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        MaildirFixture { temp_dir }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.root().join(user)
    }

    /// Create an empty maildir for `user`.
    pub fn add_user(&self, user: &str) -> PathBuf {
        let dir = self.user_dir(user);
        fs::create_dir_all(&dir).expect("Failed to create user maildir");
        dir
    }

    /// Create a folder (and its parents) inside `user`'s maildir.
    pub fn add_folder(&self, user: &str, folder: &str) -> PathBuf {
        let dir = self.user_dir(user).join(folder);
        fs::create_dir_all(&dir).expect("Failed to create folder");
        dir
    }

    /// Write a message of `size` bytes at `rel` inside `user`'s maildir.
    pub fn add_message(&self, user: &str, rel: &str, size: usize) -> PathBuf {
        let path = self.user_dir(user).join(rel);
        fs::write(&path, vec![b'x'; size]).expect("Failed to write message");
        path
    }
}

/// Poll `check` until it returns true or `limit` passes.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
