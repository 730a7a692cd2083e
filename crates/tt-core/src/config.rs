use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.teamtrace/config.toml`.
///
/// Every section falls back to its defaults when absent, so an empty file
/// (or no file at all) yields a fully working configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load from the default path, falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch.debounce_ms == 0 {
            return Err(ConfigError::Validation(
                "watch.debounce_ms must be greater than zero".into(),
            ));
        }
        if self.bridge.heartbeat_secs == 0 {
            return Err(ConfigError::Validation(
                "bridge.heartbeat_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.watch.teams_root = expand_tilde(&self.watch.teams_root);
        self.watch.tasks_root = expand_tilde(&self.watch.tasks_root);
        self.store.path = expand_tilde(&self.store.path);
    }

    fn default_path() -> PathBuf {
        home_dir().join(".teamtrace").join("config.toml")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// The two roots the agent runtime writes: team directories (configs and
/// inboxes) and per-team task directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_teams_root")]
    pub teams_root: PathBuf,
    #[serde(default = "default_tasks_root")]
    pub tasks_root: PathBuf,
    /// How long notifications for one path settle before processing.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            teams_root: default_teams_root(),
            tasks_root: default_tasks_root(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Liveness message interval towards connected observers.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_teams_root() -> PathBuf {
    home_dir().join(".claude").join("teams")
}

fn default_tasks_root() -> PathBuf {
    home_dir().join(".claude").join("tasks")
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_store_path() -> PathBuf {
    home_dir().join(".teamtrace").join("history.db")
}

fn default_port() -> u16 {
    4317
}

fn default_heartbeat_secs() -> u64 {
    5
}
