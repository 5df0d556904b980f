//! Plugin types and data structures.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use super::descriptor::ManifestFormat;
use crate::script::ScriptUnit;

/// Identity and metadata declared by a plugin's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin name (registry key).
    pub name: String,
    /// Human readable title.
    #[serde(default)]
    pub title: Option<String>,
    /// Version string (`ver` in the JSON manifest).
    #[serde(alias = "ver", deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    /// One-line summary.
    #[serde(default)]
    pub brief: Option<String>,
    #[serde(default, alias = "desc")]
    pub description: Option<String>,
    #[serde(default, alias = "repo")]
    pub repository: Option<String>,
    /// Minimum host build the plugin was written for.
    #[serde(default)]
    pub dice_build: Option<u64>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl PluginDescriptor {
    /// Title if declared, otherwise the plugin name.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Version::deserialize(deserializer)? {
        Version::Text(s) => s,
        Version::Int(n) => n.to_string(),
        Version::Float(f) => f.to_string(),
    })
}

/// One declarative command definition read from `reply/*.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDefinition {
    /// Table key under `[reply]`.
    pub command_key: String,
    /// Chat prefix, e.g. `.team`.
    pub prefix: String,
    /// Qualified script reference invoked by every handler of this command.
    pub target_script: String,
    /// Rule system the command belongs to.
    pub rule_system: Option<String>,
    /// Free-form command category (`type`).
    pub command_type: Option<String>,
    /// Declared access limits. Carried verbatim and not enforced.
    pub access_limits: Option<toml::Value>,
}

impl CommandDefinition {
    /// Command name derived from the prefix (leading `.` removed).
    pub fn command_name(&self) -> &str {
        self.prefix.strip_prefix('.').unwrap_or(&self.prefix)
    }
}

/// Aggregate of everything loaded for one plugin.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// Equal to `descriptor.name`.
    pub name: String,
    /// Plugin root directory, used by reload.
    pub path: PathBuf,
    pub descriptor: PluginDescriptor,
    pub manifest_format: ManifestFormat,
    /// Scripts keyed by qualified name.
    pub scripts: BTreeMap<String, ScriptUnit>,
    /// Command definitions keyed by command key.
    pub commands: BTreeMap<String, CommandDefinition>,
    /// Rule systems this plugin contributed to.
    pub rule_systems: Vec<String>,
    /// Names of character templates this plugin registered.
    pub templates: Vec<String>,
    /// Full command names registered in the chat command tree.
    pub registered_commands: Vec<String>,
}

impl LoadedPlugin {
    /// Summary used by the admin listing.
    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.name.clone(),
            title: self.descriptor.display_name().to_string(),
            version: self.descriptor.version.clone(),
            author: self.descriptor.author.clone(),
            brief: self.descriptor.brief.clone(),
            script_count: self.scripts.len(),
            command_count: self.commands.len(),
        }
    }
}

/// Short, printable description of a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub title: String,
    pub version: String,
    pub author: Option<String>,
    pub brief: Option<String>,
    pub script_count: usize,
    pub command_count: usize,
}

impl fmt::Display for PluginSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.title, self.version)?;
        if let Some(author) = &self.author {
            write!(f, " by {author}")?;
        }
        write!(
            f,
            " ({} scripts, {} commands)",
            self.script_count, self.command_count
        )?;
        if let Some(brief) = &self.brief {
            write!(f, "\n  {brief}")?;
        }
        Ok(())
    }
}
