use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaildirError {
    #[error("failed to list maildir root {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watch subsystem error: {0}")]
    WatchSubsystem(String),

    #[error("metric sink error: {0}")]
    Sink(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metrics server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl From<notify::Error> for MaildirError {
    fn from(e: notify::Error) -> Self {
        MaildirError::WatchSubsystem(e.to_string())
    }
}

impl From<prometheus::Error> for MaildirError {
    fn from(e: prometheus::Error) -> Self {
        MaildirError::Sink(e.to_string())
    }
}

impl MaildirError {
    /// Wrap an I/O error hit while walking `path`.
    pub fn walk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MaildirError::Walk {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MaildirError>;
