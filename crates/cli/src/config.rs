use anyhow::{Context, Result};
use codeprompt_indexer::{parse_refresh_concurrency, WatcherConfig};
use codeprompt_protocol::Limits;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "codeprompt.toml";
pub const DATA_DIR_ENV: &str = "CODEPROMPT_DATA_DIR";

/// Engine tuning, loaded from `codeprompt.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_files: usize,
    /// Total embedded characters per prompt.
    pub max_content_size: u64,
    /// Per-file byte ceiling; larger files are reported, not embedded.
    pub max_file_size: u64,
    /// Age after which a mirrored prompt file is ignored.
    pub cache_expiry_seconds: u64,
    /// Polling fallback period when native watching is unavailable.
    pub file_watcher_interval_ms: u64,
    pub watch_debounce_ms: u64,
    pub periodic_save_interval_seconds: u64,
    /// Selections above this many KiB render in a separate process.
    pub process_pool_threshold_kb: u64,
    pub worker_timeout_seconds: u64,
    pub artifact_cache_capacity: usize,
    pub refresh_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_files: limits.max_files,
            max_content_size: limits.max_content_size,
            max_file_size: limits.max_file_size,
            cache_expiry_seconds: 3600,
            file_watcher_interval_ms: 10_000,
            watch_debounce_ms: 750,
            periodic_save_interval_seconds: 30,
            process_pool_threshold_kb: 200,
            worker_timeout_seconds: 60,
            artifact_cache_capacity: 20,
            refresh_concurrency: codeprompt_indexer::DEFAULT_REFRESH_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid engine config")
    }

    /// Missing file yields defaults; an unparsable one is reported and ignored.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Self::default();
            }
            Err(err) => {
                warn!("Cannot read config {}: {err}; using defaults", path.display());
                return Self::default();
            }
        };
        match Self::from_toml_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err:#} in {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str| {
            lookup(key).and_then(|raw| {
                let parsed = raw.trim().parse::<u64>().ok();
                if parsed.is_none() {
                    warn!("Ignoring {key}={raw:?}: not a number");
                }
                parsed
            })
        };
        if let Some(value) = parse_u64("CODEPROMPT_MAX_FILES") {
            self.max_files = usize::try_from(value).unwrap_or(usize::MAX);
        }
        if let Some(value) = parse_u64("CODEPROMPT_MAX_CONTENT_SIZE") {
            self.max_content_size = value;
        }
        if let Some(value) = parse_u64("CODEPROMPT_MAX_FILE_SIZE") {
            self.max_file_size = value;
        }
        self.refresh_concurrency = parse_refresh_concurrency(
            lookup("CODEPROMPT_REFRESH_CONCURRENCY").as_deref(),
            self.refresh_concurrency,
        );
        self
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_files: self.max_files,
            max_file_size: self.max_file_size,
            max_content_size: self.max_content_size,
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        let debounce = Duration::from_millis(self.watch_debounce_ms);
        WatcherConfig {
            debounce,
            max_batch_wait: debounce.saturating_mul(4),
            poll_interval: Duration::from_millis(self.file_watcher_interval_ms.max(1)),
        }
    }

    pub fn offload_threshold_bytes(&self) -> u64 {
        self.process_pool_threshold_kb.saturating_mul(1024)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_seconds)
    }

    pub fn periodic_save_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_save_interval_seconds.max(1))
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_seconds)
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("codeprompt")
}

/// Flag, then `CODEPROMPT_DATA_DIR`, then the platform data directory.
pub fn resolve_data_dir(flag: Option<&Path>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    std::env::var_os(DATA_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map_or_else(default_data_dir, PathBuf::from)
}
