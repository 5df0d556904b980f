//! Configuration module for the extension bridge.

use serde::Deserialize;
use std::path::Path;

use crate::{BridgeError, Result};

/// Plugin discovery and reply configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionConfig {
    /// Directory scanned for plugin packages (one sub-directory per plugin).
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: String,
    /// Replacement for `{self}`/`{nick}` when the invoker has no name.
    #[serde(default = "default_fallback_nick")]
    pub fallback_nick: String,
    /// Replacement for `{card}` when no card text or character is known.
    #[serde(default = "default_fallback_card")]
    pub fallback_card: String,
}

fn default_plugin_dir() -> String {
    "data/plugins".to_string()
}

fn default_fallback_nick() -> String {
    "you".to_string()
}

fn default_fallback_card() -> String {
    "character card".to_string()
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            fallback_nick: default_fallback_nick(),
            fallback_card: default_fallback_card(),
        }
    }
}

/// Interpreter resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterConfig {
    /// Maximum number of instructions per script call (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Maximum interpreter memory in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_memory_mb() -> usize {
    16
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

/// Persistent store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps, lost on exit.
    Memory,
    /// SQLite database file.
    Sqlite,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Which store implementation to open.
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_db_path() -> String {
    "data/dicebridge.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level or filter directives, e.g. `info` or `info,sqlx=warn`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Separate level for plugin script output.
    #[serde(default)]
    pub plugin_level: Option<String>,
    /// Path to the log file. Empty logs to the console only.
    #[serde(default = "default_log_file")]
    pub file: String,
    /// Append to an existing log file instead of truncating it.
    #[serde(default = "default_true")]
    pub append: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_file() -> String {
    "logs/dicebridge.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            plugin_level: None,
            file: default_log_file(),
            append: true,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Plugin configuration.
    #[serde(default)]
    pub extensions: ExtensionConfig,
    /// Interpreter configuration.
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(BridgeError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| BridgeError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `DICEBRIDGE_PLUGIN_DIR`: plugin directory
    /// - `DICEBRIDGE_DB_PATH`: SQLite database path
    /// - `DICEBRIDGE_LOG_LEVEL`: log level
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_env("DICEBRIDGE_PLUGIN_DIR") {
            self.extensions.plugin_dir = dir;
        }
        if let Some(path) = non_empty_env("DICEBRIDGE_DB_PATH") {
            self.database.path = path;
        }
        if let Some(level) = non_empty_env("DICEBRIDGE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.extensions.plugin_dir.trim().is_empty() {
            return Err(BridgeError::Config(
                "extensions.plugin_dir must not be empty".to_string(),
            ));
        }
        if self.database.backend == StoreBackend::Sqlite && self.database.path.trim().is_empty()
        {
            return Err(BridgeError::Config(
                "database.path must be set for the sqlite backend".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
