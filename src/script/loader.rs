//! Script loader for scanning a plugin's `script/` directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Interpreter dialect of a script, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScriptDialect {
    Lua,
    Js,
}

impl ScriptDialect {
    /// Dialect for a file path, if the extension is known.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "lua" => Some(ScriptDialect::Lua),
            "js" => Some(ScriptDialect::Js),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ScriptDialect::Lua => "lua",
            ScriptDialect::Js => "js",
        }
    }
}

/// One script file collected from a plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptUnit {
    /// `<plugin>.<relative path with dots>`, extension stripped.
    pub qualified_name: String,
    /// Qualified name without the `<plugin>.` prefix.
    pub short_name: Option<String>,
    pub dialect: ScriptDialect,
    pub source: String,
    /// SHA-256 of the source, hex encoded.
    pub digest: String,
    /// Path relative to the script directory.
    pub relative_path: String,
}

impl ScriptUnit {
    /// Every name the unit is registered under.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.qualified_name.as_str()).chain(self.short_name.as_deref())
    }
}

/// Result of scanning a script directory.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Units keyed by qualified name.
    pub units: BTreeMap<String, ScriptUnit>,
    /// Paths that could not be read, with the reason.
    pub errors: Vec<(String, String)>,
}

/// Loader for one plugin's scripts.
pub struct ScriptLoader {
    scripts_dir: PathBuf,
    plugin_name: String,
}

impl ScriptLoader {
    pub fn new<P: AsRef<Path>>(scripts_dir: P, plugin_name: &str) -> Self {
        Self {
            scripts_dir: scripts_dir.as_ref().to_path_buf(),
            plugin_name: plugin_name.to_string(),
        }
    }

    /// Collect every script below the directory. A missing directory is empty.
    pub fn load_all(&self) -> ScanResult {
        let mut result = ScanResult::default();
        if self.scripts_dir.is_dir() {
            self.scan_directory(&self.scripts_dir, &mut result);
        }
        result
    }

    /// Scan a directory recursively.
    fn scan_directory(&self, dir: &Path, result: &mut ScanResult) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                result
                    .errors
                    .push((dir.display().to_string(), e.to_string()));
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        paths.sort();

        for path in paths {
            if path.is_dir() {
                self.scan_directory(&path, result);
                continue;
            }

            let Some(dialect) = ScriptDialect::from_path(&path) else {
                warn!(plugin = %self.plugin_name, path = %path.display(), "Unknown script type, skipping");
                continue;
            };

            match fs::read_to_string(&path) {
                Ok(source) => {
                    let unit = self.make_unit(&path, dialect, source);
                    result.units.insert(unit.qualified_name.clone(), unit);
                }
                Err(e) => result
                    .errors
                    .push((path.display().to_string(), e.to_string())),
            }
        }
    }

    fn make_unit(&self, path: &Path, dialect: ScriptDialect, source: String) -> ScriptUnit {
        let relative = path.strip_prefix(&self.scripts_dir).unwrap_or(path);
        let qualified_name = self.qualified_name(relative);
        ScriptUnit {
            short_name: short_name(&qualified_name, &self.plugin_name),
            digest: calculate_hash(&source),
            relative_path: relative.to_string_lossy().replace('\\', "/"),
            qualified_name,
            dialect,
            source,
        }
    }

    /// `<plugin>.<dir>.<dir>.<stem>` for a path relative to the script root.
    fn qualified_name(&self, relative: &Path) -> String {
        let stemmed = relative.with_extension("");
        let mut name = self.plugin_name.clone();
        for component in stemmed.components() {
            if let Component::Normal(part) = component {
                name.push('.');
                name.push_str(&part.to_string_lossy());
            }
        }
        name
    }
}

/// Short alias of a qualified name, present only when the plugin prefix is.
pub fn short_name(qualified_name: &str, plugin_name: &str) -> Option<String> {
    qualified_name
        .strip_prefix(plugin_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

/// Hex-encoded SHA-256 digest of script source.
pub fn calculate_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_short_name() {
        assert_eq!(
            short_name("Maid-TRPG.Maid.team", "Maid-TRPG"),
            Some("Maid.team".to_string())
        );
        assert_eq!(short_name("Other.team", "Maid-TRPG"), None);
        assert_eq!(short_name("Maid-TRPGx.team", "Maid-TRPG"), None);
        assert_eq!(short_name("Maid-TRPG", "Maid-TRPG"), None);
    }

    #[test]
    fn test_calculate_hash_is_stable() {
        assert_eq!(calculate_hash("return 1"), calculate_hash("return 1"));
        assert_ne!(calculate_hash("return 1"), calculate_hash("return 2"));
        assert_eq!(calculate_hash("").len(), 64);
    }

    #[test]
    fn test_load_all_recursive() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Maid").join("sub")).unwrap();
        fs::write(root.join("hello.lua"), "return 'hi'").unwrap();
        fs::write(root.join("Maid").join("team.lua"), "return msg.suffix").unwrap();
        fs::write(root.join("Maid").join("sub").join("deep.js"), "'js'").unwrap();
        fs::write(root.join("Maid").join("notes.txt"), "ignored").unwrap();

        let result = ScriptLoader::new(root, "Maid-TRPG").load_all();
        assert!(result.errors.is_empty());
        let names: Vec<&str> = result.units.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["Maid-TRPG.Maid.sub.deep", "Maid-TRPG.Maid.team", "Maid-TRPG.hello"]
        );

        let team = &result.units["Maid-TRPG.Maid.team"];
        assert_eq!(team.short_name.as_deref(), Some("Maid.team"));
        assert_eq!(team.dialect, ScriptDialect::Lua);
        assert_eq!(team.relative_path, "Maid/team.lua");
        assert_eq!(
            team.names().collect::<Vec<_>>(),
            vec!["Maid-TRPG.Maid.team", "Maid.team"]
        );

        assert_eq!(
            result.units["Maid-TRPG.Maid.sub.deep"].dialect,
            ScriptDialect::Js
        );
    }

    #[test]
    fn test_load_all_missing_dir() {
        let dir = tempdir().unwrap();
        let result = ScriptLoader::new(dir.path().join("script"), "p").load_all();
        assert!(result.units.is_empty());
        assert!(result.errors.is_empty());
    }
}
