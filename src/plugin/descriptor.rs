//! Plugin manifest and package layout.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::types::PluginDescriptor;
use crate::{BridgeError, Result};

/// Manifest file format, chosen by which file is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManifestFormat {
    Json,
    Toml,
}

impl ManifestFormat {
    /// Manifest file name for this format.
    pub fn file_name(self) -> &'static str {
        match self {
            ManifestFormat::Json => "descriptor.json",
            ManifestFormat::Toml => "descriptor.toml",
        }
    }
}

/// On-disk layout of a plugin package.
#[derive(Debug, Clone)]
pub struct PluginLayout {
    root: PathBuf,
}

impl PluginLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn script_dir(&self) -> PathBuf {
        self.root.join("script")
    }

    pub fn rulebook_dir(&self) -> PathBuf {
        self.root.join("rulebook")
    }

    pub fn reply_dir(&self) -> PathBuf {
        self.root.join("reply")
    }

    pub fn template_dir(&self) -> PathBuf {
        self.root.join("template")
    }

    /// Locate the manifest file, preferring JSON.
    pub fn manifest(&self) -> Option<(PathBuf, ManifestFormat)> {
        [ManifestFormat::Json, ManifestFormat::Toml]
            .into_iter()
            .map(|format| (self.root.join(format.file_name()), format))
            .find(|(path, _)| path.is_file())
    }

    /// Read and validate the plugin descriptor.
    pub fn read_descriptor(&self) -> Result<(PluginDescriptor, ManifestFormat)> {
        let (path, format) = self.manifest().ok_or_else(|| BridgeError::InvalidManifest {
            path: self.root.join(ManifestFormat::Json.file_name()),
            reason: "no descriptor.json or descriptor.toml".to_string(),
        })?;

        let content = fs::read_to_string(&path).map_err(|e| BridgeError::InvalidManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let descriptor = parse_descriptor(&content, format).map_err(|reason| {
            BridgeError::InvalidManifest {
                path: path.clone(),
                reason,
            }
        })?;

        Ok((descriptor, format))
    }
}

/// Parse manifest text in the given format.
pub fn parse_descriptor(
    content: &str,
    format: ManifestFormat,
) -> std::result::Result<PluginDescriptor, String> {
    let descriptor: PluginDescriptor = match format {
        ManifestFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string())?,
        ManifestFormat::Toml => toml::from_str(content).map_err(|e| e.to_string())?,
    };

    if descriptor.name.trim().is_empty() {
        return Err("plugin name is empty".to_string());
    }
    if descriptor.version.trim().is_empty() {
        return Err("plugin version is empty".to_string());
    }

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_json_descriptor() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("descriptor.json"),
            r#"{"name": "Maid-TRPG", "title": "Maid RPG", "ver": "1.0"}"#,
        )
        .unwrap();

        let layout = PluginLayout::new(dir.path());
        let (descriptor, format) = layout.read_descriptor().unwrap();
        assert_eq!(descriptor.name, "Maid-TRPG");
        assert_eq!(format, ManifestFormat::Json);
    }

    #[test]
    fn test_read_toml_descriptor() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("descriptor.toml"),
            "name = \"Maid-TRPG\"\nversion = \"2.0\"\nauthor = \"anon\"\n",
        )
        .unwrap();

        let (descriptor, format) = PluginLayout::new(dir.path()).read_descriptor().unwrap();
        assert_eq!(descriptor.version, "2.0");
        assert_eq!(descriptor.author.as_deref(), Some("anon"));
        assert_eq!(format, ManifestFormat::Toml);
    }

    #[test]
    fn test_json_preferred_over_toml() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("descriptor.json"),
            r#"{"name": "from-json", "ver": "1"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("descriptor.toml"),
            "name = \"from-toml\"\nversion = \"1\"\n",
        )
        .unwrap();

        let (descriptor, _) = PluginLayout::new(dir.path()).read_descriptor().unwrap();
        assert_eq!(descriptor.name, "from-json");
    }

    #[test]
    fn test_missing_descriptor() {
        let dir = tempdir().unwrap();
        let result = PluginLayout::new(dir.path()).read_descriptor();
        assert!(matches!(result, Err(BridgeError::InvalidManifest { .. })));
    }

    #[test]
    fn test_unparsable_descriptor() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("descriptor.json"), "{ not json").unwrap();
        let result = PluginLayout::new(dir.path()).read_descriptor();
        assert!(matches!(result, Err(BridgeError::InvalidManifest { .. })));
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = parse_descriptor(r#"{"name": " ", "ver": "1"}"#, ManifestFormat::Json);
        assert_eq!(result.unwrap_err(), "plugin name is empty");
    }

    #[test]
    fn test_layout_paths() {
        let layout = PluginLayout::new("/plugins/maid");
        assert_eq!(layout.script_dir(), PathBuf::from("/plugins/maid/script"));
        assert_eq!(layout.rulebook_dir(), PathBuf::from("/plugins/maid/rulebook"));
        assert_eq!(layout.reply_dir(), PathBuf::from("/plugins/maid/reply"));
        assert_eq!(layout.template_dir(), PathBuf::from("/plugins/maid/template"));
    }
}
