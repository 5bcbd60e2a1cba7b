//! Exporter configuration.
//!
//! Configuration can come from an optional YAML file and from command-line
//! flags. Flags always win over the file. The resulting [`Config`] is
//! validated once at startup before any entity is discovered.

use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MaildirError, Result};

/// Default address of the scrape endpoint.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:9275";

/// Default path the scrape endpoint is served on.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Folder name watched when nothing else is configured.
pub const DEFAULT_WATCH_FOLDER: &str = "cur";

/// Default time granted to all loops to acknowledge shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing one maildir per user
    pub root: Option<PathBuf>,

    /// Socket address of the scrape endpoint
    pub listen: String,

    /// HTTP path of the scrape endpoint
    pub metrics_path: String,

    /// Directory names that get a change subscription during walks
    pub watch_folders: Vec<String>,

    /// Subscribe to every directory instead of only `watch_folders`
    pub watch_all_folders: bool,

    /// Seconds to wait for loops to stop before abandoning them
    pub shutdown_timeout_secs: u64,

    /// Verbosity used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: None,
            listen: DEFAULT_LISTEN.to_string(),
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            watch_folders: vec![DEFAULT_WATCH_FOLDER.to_string()],
            watch_all_folders: false,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MaildirError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Check that the configuration can be used to start the exporter.
    pub fn validate(&self) -> Result<()> {
        if self.root.is_none() {
            return Err(MaildirError::Config(
                "please specify the maildir root directory".to_string(),
            ));
        }
        self.listen_addr()?;
        if !self.metrics_path.starts_with('/') {
            return Err(MaildirError::Config(format!(
                "metrics path '{}' must start with '/'",
                self.metrics_path
            )));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(MaildirError::Config(
                "shutdown timeout must be at least one second".to_string(),
            ));
        }
        if !self.watch_all_folders && self.watch_folders.iter().any(|f| f.is_empty()) {
            return Err(MaildirError::Config(
                "watch folder names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen.parse().map_err(|e| {
            MaildirError::Config(format!("invalid listen address '{}': {e}", self.listen))
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Watch policy derived from the folder settings.
    pub fn watch_policy(&self) -> WatchPolicy {
        if self.watch_all_folders {
            WatchPolicy::AllDirectories
        } else {
            WatchPolicy::named(self.watch_folders.iter().cloned())
        }
    }
}

/// Decides which directories found during a walk get a change subscription.
///
/// The entity root is always subscribed regardless of policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPolicy {
    /// Subscribe to every directory in the tree.
    AllDirectories,
    /// Subscribe only to directories whose own name is in the set.
    Named(BTreeSet<String>),
}

impl WatchPolicy {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WatchPolicy::Named(names.into_iter().map(Into::into).collect())
    }

    /// Whether a directory called `name` should be watched.
    pub fn should_watch(&self, name: &str) -> bool {
        match self {
            WatchPolicy::AllDirectories => true,
            WatchPolicy::Named(names) => names.contains(name),
        }
    }
}

impl Default for WatchPolicy {
    fn default() -> Self {
        WatchPolicy::named([DEFAULT_WATCH_FOLDER])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid() -> Config {
        Config {
            root: Some(PathBuf::from("/var/mail")),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:9275");
        assert_eq!(config.metrics_path, "/metrics");
        assert_eq!(config.watch_folders, vec!["cur".to_string()]);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.watch_policy(), WatchPolicy::default());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = Config::from_yaml(
            "root: /srv/maildirs\nwatch_folders: [cur, new]\nshutdown_timeout_secs: 3\n",
        )
        .unwrap();
        assert_eq!(config.root, Some(PathBuf::from("/srv/maildirs")));
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.shutdown_timeout_secs, 3);
        assert!(config.watch_policy().should_watch("new"));
        assert!(!config.watch_policy().should_watch("tmp"));
    }

    #[test]
    fn test_from_yaml_empty_is_default() {
        let config = Config::from_yaml("  \n").unwrap();
        assert!(config.root.is_none());
        assert_eq!(config.metrics_path, DEFAULT_METRICS_PATH);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_types() {
        let result = Config::from_yaml("shutdown_timeout_secs: soon\n");
        assert!(matches!(result, Err(MaildirError::Yaml(_))));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("exporter.yaml");
        fs::write(&path, "root: /data\nwatch_all_folders: true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.watch_policy(), WatchPolicy::AllDirectories);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/exporter.yaml"));
        assert!(matches!(result, Err(MaildirError::Config(_))));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        assert!(Config::default().validate().is_err());

        let mut bad_listen = valid();
        bad_listen.listen = "not-an-address".to_string();
        assert!(bad_listen.validate().is_err());

        let mut bad_path = valid();
        bad_path.metrics_path = "metrics".to_string();
        assert!(bad_path.validate().is_err());

        let mut bad_timeout = valid();
        bad_timeout.shutdown_timeout_secs = 0;
        assert!(bad_timeout.validate().is_err());

        let mut empty_folder = valid();
        empty_folder.watch_folders.push(String::new());
        assert!(empty_folder.validate().is_err());
    }

    #[test]
    fn test_watch_policy_all_directories() {
        let policy = WatchPolicy::AllDirectories;
        assert!(policy.should_watch("cur"));
        assert!(policy.should_watch("anything"));
    }
}
