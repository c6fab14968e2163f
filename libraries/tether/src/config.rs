use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {message}")]
    Io { path: String, message: String },

    #[error("could not parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Where pending writes are journaled. `None` keeps them in memory only.
    pub journal_path: Option<PathBuf>,
    /// Where authoritative bases are saved on sign-out and loaded on open.
    pub snapshot_path: Option<PathBuf>,
    pub max_cache_entries: usize,
    pub write_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
    /// How many resolved writes the journal remembers for inspection.
    pub archive_len: usize,
    /// Dead journal records tolerated before the file is rewritten.
    pub compact_after: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            snapshot_path: None,
            max_cache_entries: 1024,
            write_timeout_ms: 10_000,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            max_reconnect_attempts: 8,
            archive_len: 64,
            compact_after: 256,
        }
    }
}

impl SyncConfig {
    /// Keeps everything in memory. Handy for tests.
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Journal and snapshot files inside `directory`.
    pub fn in_directory(directory: &FsPath) -> Self {
        Self {
            journal_path: Some(directory.join("tether.journal")),
            snapshot_path: Some(directory.join("tether.snapshot.json")),
            ..Self::default()
        }
    }

    pub fn load(path: &FsPath) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Defaults, or the file named by `TETHER_CONFIG`, with `TETHER_*` overrides on top.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("TETHER_CONFIG") {
            Some(path) => Self::load(FsPath::new(&path))?,
            None => Self::default(),
        };

        if let Some(path) = lookup("TETHER_JOURNAL_PATH") {
            config.journal_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("TETHER_SNAPSHOT_PATH") {
            config.snapshot_path = Some(PathBuf::from(path));
        }
        override_number(&lookup, "TETHER_MAX_CACHE_ENTRIES", &mut config.max_cache_entries)?;
        override_number(&lookup, "TETHER_WRITE_TIMEOUT_MS", &mut config.write_timeout_ms)?;
        override_number(&lookup, "TETHER_BACKOFF_BASE_MS", &mut config.backoff_base_ms)?;
        override_number(&lookup, "TETHER_BACKOFF_MAX_MS", &mut config.backoff_max_ms)?;
        override_number(
            &lookup,
            "TETHER_MAX_RECONNECT_ATTEMPTS",
            &mut config.max_reconnect_attempts,
        )?;
        override_number(&lookup, "TETHER_ARCHIVE_LEN", &mut config.archive_len)?;
        override_number(&lookup, "TETHER_COMPACT_AFTER", &mut config.compact_after)?;
        Ok(config)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(name) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidVar {
            name: name.to_string(),
            value,
        })?;
    }
    Ok(())
}
