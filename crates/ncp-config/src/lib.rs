//! Configuration for the nodecallspython bridge
//!
//! Settings are resolved in three layers, later layers winning:
//!
//! 1. built-in defaults
//! 2. a TOML file (`$NCP_CONFIG`, or `<config dir>/nodecallspython/config.toml`)
//! 3. `NCP_*` environment variables
//!
//! ```toml
//! worker_threads = 4
//! callback_mode = "promise"
//! traceback = true
//! import_paths = ["/opt/models"]
//! executable = "/usr/bin/python3"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "NCP_CONFIG";
pub const WORKER_THREADS_ENV: &str = "NCP_WORKER_THREADS";
pub const CALLBACK_MODE_ENV: &str = "NCP_CALLBACK_MODE";
pub const TRACEBACK_ENV: &str = "NCP_TRACEBACK";

const DEFAULT_WORKER_THREADS: usize = 4;
const CONFIG_DIR_NAME: &str = "nodecallspython";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// How interpreter code that calls back into a host function gets its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackMode {
    /// The host function answers immediately with a value
    #[default]
    Sync,
    /// The host function may answer with a deferred value that the interpreter waits on
    Promise,
}

impl CallbackMode {
    /// Map the boolean flag used by the host-facing `setCallbackMode` call
    pub fn from_sync_flag(sync: bool) -> Self {
        if sync {
            CallbackMode::Sync
        } else {
            CallbackMode::Promise
        }
    }
}

impl fmt::Display for CallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackMode::Sync => write!(f, "sync"),
            CallbackMode::Promise => write!(f, "promise"),
        }
    }
}

impl FromStr for CallbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(CallbackMode::Sync),
            "promise" | "async" => Ok(CallbackMode::Promise),
            other => Err(format!("expected 'sync' or 'promise', got '{}'", other)),
        }
    }
}

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Size of the pool that runs non-blocking calls
    pub worker_threads: usize,
    pub callback_mode: CallbackMode,
    /// Attach the Python traceback to runtime failures
    pub traceback: bool,
    /// Extra directories appended to `sys.path` at startup
    pub import_paths: Vec<PathBuf>,
    /// Interpreter executable used by subprocess-spawning features
    pub executable: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            callback_mode: CallbackMode::default(),
            traceback: false,
            import_paths: Vec::new(),
            executable: None,
        }
    }
}

impl BridgeConfig {
    /// Load defaults, the config file if one exists, then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Location of the config file: `$NCP_CONFIG` if set, else the user config dir
    pub fn config_path() -> Option<PathBuf> {
        if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV) {
            if !explicit.is_empty() {
                return Some(PathBuf::from(explicit));
            }
        }
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Apply `NCP_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(WORKER_THREADS_ENV) {
            let threads = value
                .trim()
                .parse::<usize>()
                .map_err(|e| invalid(WORKER_THREADS_ENV, &value, &e.to_string()))?;
            self.worker_threads = threads;
        }

        if let Some(value) = lookup(CALLBACK_MODE_ENV) {
            self.callback_mode = value
                .parse()
                .map_err(|reason: String| invalid(CALLBACK_MODE_ENV, &value, &reason))?;
        }

        if let Some(value) = lookup(TRACEBACK_ENV) {
            self.traceback = parse_flag(&value)
                .ok_or_else(|| invalid(TRACEBACK_ENV, &value, "expected a boolean"))?;
        }

        self.validate()
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(invalid(
                "worker_threads",
                "0",
                "the worker pool needs at least one thread",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
