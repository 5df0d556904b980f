//! Command definition loader (`reply/*.toml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use super::types::CommandDefinition;
use crate::{BridgeError, Result};

#[derive(Debug, Deserialize)]
struct ReplyFile {
    #[serde(default)]
    reply: BTreeMap<String, RawReply>,
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(rename = "type")]
    kind: Option<String>,
    rule: Option<String>,
    keyword: Option<Keyword>,
    echo: Option<Echo>,
    limit: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
struct Keyword {
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Echo {
    lua: Option<String>,
    js: Option<String>,
}

/// Parse one reply file into command definitions.
///
/// Definitions without an `echo` script are skipped with a warning.
pub fn parse_reply_file(
    content: &str,
    path: &Path,
    plugin_name: &str,
) -> Result<Vec<CommandDefinition>> {
    let file: ReplyFile = toml::from_str(content).map_err(|e| BridgeError::CommandConfig {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut definitions = Vec::with_capacity(file.reply.len());
    for (command_key, raw) in file.reply {
        let Some(script) = raw.echo.and_then(|echo| echo.lua.or(echo.js)) else {
            warn!(command = %command_key, "No script specified for command, skipping");
            continue;
        };

        let target_script = if script.starts_with(&format!("{plugin_name}.")) {
            script
        } else {
            format!("{plugin_name}.{script}")
        };

        let prefix = raw
            .keyword
            .and_then(|k| k.prefix)
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| format!(".{command_key}"));

        definitions.push(CommandDefinition {
            command_key,
            prefix,
            target_script,
            rule_system: raw.rule,
            command_type: raw.kind,
            access_limits: raw.limit,
        });
    }

    Ok(definitions)
}

/// Load every `*.toml` file under `reply_dir`.
///
/// A missing directory yields no commands. A malformed file is logged and
/// skipped; later files override earlier ones on key collision.
pub fn load_command_definitions(
    reply_dir: &Path,
    plugin_name: &str,
) -> Result<BTreeMap<String, CommandDefinition>> {
    let mut commands = BTreeMap::new();
    if !reply_dir.is_dir() {
        debug!(plugin = %plugin_name, "No reply directory");
        return Ok(commands);
    }

    let mut files: Vec<_> = fs::read_dir(reply_dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();

    for path in files {
        let parsed = fs::read_to_string(&path)
            .map_err(BridgeError::from)
            .and_then(|content| parse_reply_file(&content, &path, plugin_name));
        match parsed {
            Ok(definitions) => {
                for def in definitions {
                    debug!(plugin = %plugin_name, command = %def.command_key, "Found command");
                    commands.insert(def.command_key.clone(), def);
                }
            }
            Err(e) => warn!(plugin = %plugin_name, "Skipping reply file: {}", e),
        }
    }

    Ok(commands)
}
