//! Configuration for QuarryDB
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the directory below the installation root that holds all files
pub const DATA_DIR: &str = "data";

/// Name of the database registry file inside the data directory
pub const MANAGER_FILE: &str = "manager";

/// Main configuration for a QuarryDB installation
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Installation root. Internal structure:
    ///   {root_dir}/data/
    ///     ├── manager                  (known databases, one per line)
    ///     └── {db}/
    ///         ├── log                  (write-ahead log)
    ///         └── tables/
    ///             ├── {table}.meta     (column definitions)
    ///             └── {table}          (rows)
    pub root_dir: PathBuf,

    /// Database created on startup and selected as current
    pub default_database: String,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Log size (bytes) above which a commit triggers a checkpoint
    pub checkpoint_threshold: u64,

    /// fsync after every appended log record
    pub sync_log: bool,

    // -------------------------------------------------------------------------
    // Lock Configuration
    // -------------------------------------------------------------------------
    /// Upper bound for a single blocked lock acquisition; `None` waits forever
    pub lock_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            default_database: "db".to_string(),
            checkpoint_threshold: 50_000,
            sync_log: true,
            lock_timeout: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// `{root}/data`
    pub fn data_dir(&self) -> PathBuf {
        self.root_dir.join(DATA_DIR)
    }

    /// `{root}/data/manager`
    pub fn manager_file(&self) -> PathBuf {
        self.data_dir().join(MANAGER_FILE)
    }

    /// `{root}/data/{db}`
    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.data_dir().join(database)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the installation root
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_dir = path.into();
        self
    }

    /// Set the database created and selected on startup
    pub fn default_database(mut self, name: impl Into<String>) -> Self {
        self.config.default_database = name.into();
        self
    }

    /// Set the log size (in bytes) that triggers a checkpoint
    pub fn checkpoint_threshold(mut self, bytes: u64) -> Self {
        self.config.checkpoint_threshold = bytes;
        self
    }

    /// Enable or disable fsync on every log append
    pub fn sync_log(mut self, sync: bool) -> Self {
        self.config.sync_log = sync;
        self
    }

    /// Bound every blocked lock acquisition
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
