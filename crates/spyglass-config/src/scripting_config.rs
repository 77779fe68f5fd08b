use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::ProjectPaths;

/// Default liveness budget for a script, in milliseconds
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5000;

/// Configuration for a single file-based script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDetails {
    /// Location of the script source
    pub file: PathBuf,

    /// Re-run the script each time it finishes (asynchronous runs only)
    #[serde(default)]
    pub repeat: bool,

    /// Start the script as soon as it is registered
    #[serde(default)]
    pub auto_start: bool,

    /// Liveness budget override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ScriptDetails {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            repeat: false,
            auto_start: false,
            timeout_ms: None,
        }
    }

    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Configured timeout, or the default
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_SCRIPT_TIMEOUT_MS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Whether scripting is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory containing scripts (default: <data dir>/scripts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_dir: Option<PathBuf>,

    /// Whether to look for scripts in subdirectories of the script directory
    #[serde(default)]
    pub recursive: bool,

    /// Explicitly configured scripts
    #[serde(default)]
    pub scripts: Vec<ScriptDetails>,

    /// Custom parameters made available to every run through `args`
    #[serde(default)]
    pub parameters: HashMap<String, toml::Value>,

    /// Watchdog polling interval in milliseconds (default: 1000ms)
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_ms: u64,

    /// Whether hot reload is enabled (default: true)
    #[serde(default = "default_true")]
    pub hot_reload: bool,

    /// Hot reload scan interval in milliseconds (default: 1000ms)
    #[serde(default = "default_hot_reload_interval")]
    pub hot_reload_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval() -> u64 {
    1000
}

fn default_hot_reload_interval() -> u64 {
    1000
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script_dir: None,
            recursive: false,
            scripts: Vec::new(),
            parameters: HashMap::new(),
            watchdog_interval_ms: default_watchdog_interval(),
            hot_reload: true,
            hot_reload_interval_ms: default_hot_reload_interval(),
        }
    }
}

impl ScriptingConfig {
    /// Get the script directory path (use provided or default)
    pub fn script_dir(&self) -> PathBuf {
        self.script_dir.clone().unwrap_or_else(|| {
            ProjectPaths::new("spyglass")
                .map(|p| p.data_dir().join("scripts"))
                .unwrap_or_else(|| PathBuf::from(".scripts"))
        })
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn hot_reload_interval(&self) -> Duration {
        Duration::from_millis(self.hot_reload_interval_ms)
    }

    /// Scripts that should be started right after registration
    pub fn auto_start_scripts(&self) -> impl Iterator<Item = &ScriptDetails> {
        self.scripts.iter().filter(|s| s.auto_start)
    }
}
