//! Tracing setup for the host process.
//!
//! `RUST_LOG` takes precedence. Otherwise the configured directive string is
//! used, with `plugin_level` narrowing the output of plugin scripts
//! (`dice.log` and interpreter diagnostics) on its own.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::{BridgeError, Result};

/// Tracing target of the script subsystem.
pub const SCRIPT_TARGET: &str = "dicebridge::script";

/// Expand the configured levels into one directive string.
///
/// `warning` is accepted for `warn` in every directive.
pub fn directives(level: &str, plugin_level: Option<&str>) -> String {
    let mut parts: Vec<String> = level
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(normalize_level)
        .collect();
    if parts.is_empty() {
        parts.push("info".to_string());
    }
    if let Some(plugin) = plugin_level.map(str::trim).filter(|l| !l.is_empty()) {
        parts.push(format!("{SCRIPT_TARGET}={}", normalize_level(plugin)));
    }
    parts.join(",")
}

fn normalize_level(directive: &str) -> String {
    let (target, level) = match directive.rsplit_once('=') {
        Some((target, level)) => (Some(target.trim()), level.trim()),
        None => (None, directive),
    };
    let level = if level.eq_ignore_ascii_case("warning") {
        "warn".to_string()
    } else {
        level.to_lowercase()
    };
    match target {
        Some(target) => format!("{target}={level}"),
        None => level,
    }
}

/// Filter from the configured directives. Malformed directives are a
/// `Config` error.
pub fn configured_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let spec = directives(&config.level, config.plugin_level.as_deref());
    EnvFilter::try_new(&spec)
        .map_err(|e| BridgeError::Config(format!("invalid logging.level '{spec}': {e}")))
}

fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => configured_filter(config),
    }
}

/// Open the log file, creating parent directories.
pub fn open_log_file(path: &Path, append: bool) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    Ok(options.open(path)?)
}

/// Install the global subscriber: colored console output, plus a plain
/// file copy unless `file` is empty.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = filter(config)?;
    let file_layer = match config.file.trim() {
        "" => None,
        path => {
            let file = Arc::new(open_log_file(Path::new(path), config.append)?);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true),
            )
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .with_target(true),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| BridgeError::Config(format!("logging already initialized: {e}")))
}

/// Console logging at `level`, falling back to `info` when the level does
/// not parse.
pub fn init_console_only(level: &str) {
    let filter = EnvFilter::try_new(directives(level, None))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn logging(level: &str, plugin_level: Option<&str>) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            plugin_level: plugin_level.map(str::to_string),
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn test_directives_keep_per_target_levels() {
        assert_eq!(directives("info,sqlx=warn", None), "info,sqlx=warn");
        assert_eq!(directives(" DEBUG , sqlx = WARNING", None), "debug,sqlx=warn");
        assert_eq!(directives("", None), "info");
    }

    #[test]
    fn test_plugin_level_targets_scripts() {
        assert_eq!(
            directives("warning", Some("Debug")),
            "warn,dicebridge::script=debug"
        );
        assert_eq!(directives("info", Some("  ")), "info");
    }

    #[test]
    fn test_configured_filter() {
        assert!(configured_filter(&logging("info,dicebridge=trace", Some("warn"))).is_ok());
        assert!(matches!(
            configured_filter(&logging("info,sqlx=loud", None)),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_log_file_append_or_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/logs/bridge.log");

        open_log_file(&path, true).unwrap().write_all(b"first\n").unwrap();
        open_log_file(&path, true).unwrap().write_all(b"second\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        open_log_file(&path, false).unwrap().write_all(b"fresh\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
    }
}
