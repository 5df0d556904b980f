//! Rule registry and rulebook loader (`rulebook/*.yaml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::{debug, info, warn};

use crate::{BridgeError, Result};

/// One keyword lookup result with the plugin that contributed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub text: String,
    pub plugin: String,
}

/// Process-wide keyword→text tables grouped by rule system name.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    systems: BTreeMap<String, BTreeMap<String, RuleEntry>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge entries into `system`. Existing keywords are overwritten.
    pub fn merge(
        &mut self,
        system: &str,
        plugin: &str,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> usize {
        let manual = self.systems.entry(system.to_string()).or_default();
        let mut count = 0;
        for (keyword, text) in entries {
            manual.insert(
                keyword,
                RuleEntry {
                    text,
                    plugin: plugin.to_string(),
                },
            );
            count += 1;
        }
        count
    }

    /// Look up a keyword within one rule system.
    pub fn query(&self, system: &str, keyword: &str) -> Option<&str> {
        self.systems
            .get(system)
            .and_then(|manual| manual.get(keyword))
            .map(|entry| entry.text.as_str())
    }

    /// Look up a keyword across all systems, in system name order.
    pub fn query_any(&self, keyword: &str) -> Option<(&str, &str)> {
        self.systems.iter().find_map(|(system, manual)| {
            manual
                .get(keyword)
                .map(|entry| (system.as_str(), entry.text.as_str()))
        })
    }

    /// Names of all rule systems.
    pub fn systems(&self) -> Vec<String> {
        self.systems.keys().cloned().collect()
    }

    /// Remove every entry contributed by `plugin`, dropping emptied systems.
    pub fn remove_plugin(&mut self, plugin: &str) -> usize {
        let mut removed = 0;
        for manual in self.systems.values_mut() {
            let before = manual.len();
            manual.retain(|_, entry| entry.plugin != plugin);
            removed += before - manual.len();
        }
        self.systems.retain(|_, manual| !manual.is_empty());
        removed
    }

    /// Plain copy of all tables for handing to a script.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.systems
            .iter()
            .map(|(system, manual)| {
                let entries = manual
                    .iter()
                    .map(|(k, entry)| (k.clone(), entry.text.clone()))
                    .collect();
                (system.clone(), entries)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

/// A parsed rulebook document.
#[derive(Debug, Clone, PartialEq)]
pub struct Rulebook {
    pub rule: String,
    pub manual: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawRulebook {
    rule: String,
    manual: Mapping,
}

fn yaml_to_text(value: &YamlValue) -> String {
    match value {
        YamlValue::String(s) => s.clone(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Parse one rulebook document.
pub fn parse_rulebook(content: &str, path: &Path) -> Result<Rulebook> {
    let raw: RawRulebook = serde_yaml::from_str(content).map_err(|e| BridgeError::Rulebook {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if raw.rule.trim().is_empty() {
        return Err(BridgeError::Rulebook {
            path: path.to_path_buf(),
            reason: "empty rule system name".to_string(),
        });
    }

    let manual = raw
        .manual
        .iter()
        .map(|(k, v)| (yaml_to_text(k), yaml_to_text(v)))
        .collect();

    Ok(Rulebook {
        rule: raw.rule,
        manual,
    })
}

/// Load every `*.yaml`/`*.yml` file under `dir` into `registry`.
///
/// Returns the rule systems that received entries. A missing or empty
/// directory is not an error; a malformed file is logged and skipped.
pub fn load_rulebooks(dir: &Path, plugin: &str, registry: &mut RuleRegistry) -> Result<Vec<String>> {
    let mut systems = Vec::new();
    if !dir.is_dir() {
        debug!(plugin = %plugin, "No rulebook directory");
        return Ok(systems);
    }

    let mut files: Vec<_> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    files.sort();

    for path in files {
        let parsed = fs::read_to_string(&path)
            .map_err(BridgeError::from)
            .and_then(|content| parse_rulebook(&content, &path));
        match parsed {
            Ok(book) => {
                let count = registry.merge(&book.rule, plugin, book.manual);
                info!(plugin = %plugin, rule = %book.rule, entries = count, "Loaded rulebook");
                if !systems.contains(&book.rule) {
                    systems.push(book.rule);
                }
            }
            Err(e) => warn!(plugin = %plugin, "Skipping rulebook: {}", e),
        }
    }

    Ok(systems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_merge_last_wins() {
        let mut registry = RuleRegistry::new();
        registry.merge("Maid", "a", [("favor".to_string(), "old".to_string())]);
        registry.merge("Maid", "b", [("favor".to_string(), "new".to_string())]);
        assert_eq!(registry.query("Maid", "favor"), Some("new"));
    }

    #[test]
    fn test_query_any_follows_system_order() {
        let mut registry = RuleRegistry::new();
        registry.merge("Zeta", "p", [("hp".to_string(), "zeta hp".to_string())]);
        registry.merge("Alpha", "p", [("hp".to_string(), "alpha hp".to_string())]);
        assert_eq!(registry.query_any("hp"), Some(("Alpha", "alpha hp")));
        assert_eq!(registry.query_any("mp"), None);
    }

    #[test]
    fn test_remove_plugin() {
        let mut registry = RuleRegistry::new();
        registry.merge("Maid", "a", [("x".to_string(), "1".to_string())]);
        registry.merge("Maid", "b", [("y".to_string(), "2".to_string())]);
        registry.merge("Solo", "a", [("z".to_string(), "3".to_string())]);

        assert_eq!(registry.remove_plugin("a"), 2);
        assert_eq!(registry.systems(), vec!["Maid".to_string()]);
        assert_eq!(registry.query("Maid", "y"), Some("2"));
        assert_eq!(registry.query("Maid", "x"), None);
    }

    #[test]
    fn test_parse_rulebook_stringifies_values() {
        let yaml = "rule: Maid\nmanual:\n  favor: \"Favor rules\"\n  3: 42\n  flag: true\n";
        let book = parse_rulebook(yaml, Path::new("maid.yaml")).unwrap();
        assert_eq!(book.rule, "Maid");
        assert_eq!(book.manual.get("favor").map(String::as_str), Some("Favor rules"));
        assert_eq!(book.manual.get("3").map(String::as_str), Some("42"));
        assert_eq!(book.manual.get("flag").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_parse_rulebook_missing_rule() {
        let result = parse_rulebook("manual:\n  a: b\n", Path::new("x.yaml"));
        assert!(matches!(result, Err(BridgeError::Rulebook { .. })));
    }

    #[test]
    fn test_load_rulebooks_directory() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("maid.yaml"), "rule: Maid\nmanual:\n  a: A\n").unwrap();
        fs::write(dir.path().join("extra.yml"), "rule: Maid\nmanual:\n  b: B\n").unwrap();
        fs::write(dir.path().join("broken.yaml"), "rule: [\n").unwrap();
        fs::write(dir.path().join("readme.md"), "rule: Other").unwrap();

        let mut registry = RuleRegistry::new();
        let systems = load_rulebooks(dir.path(), "maid", &mut registry).unwrap();
        assert_eq!(systems, vec!["Maid".to_string()]);
        assert_eq!(registry.query("Maid", "a"), Some("A"));
        assert_eq!(registry.query("Maid", "b"), Some("B"));
    }

    #[test]
    fn test_load_rulebooks_empty_dir() {
        let dir = tempdir().unwrap();
        let mut registry = RuleRegistry::new();
        assert!(load_rulebooks(dir.path(), "p", &mut registry).unwrap().is_empty());
        assert!(load_rulebooks(&dir.path().join("missing"), "p", &mut registry)
            .unwrap()
            .is_empty());
        assert!(registry.is_empty());
    }
}
