//! Attribute alias resolution.
//!
//! Templates map stable aliases (`Favor`) to the display names a card stores
//! its values under (`宠爱`). A literal key on the card always wins over an
//! alias lookup.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};

/// Card key holding the template name.
pub const CARD_TYPE_KEY: &str = "type";

/// Alias maps of every loaded template, keyed by template name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AliasSnapshot {
    templates: BTreeMap<String, HashMap<String, String>>,
}

impl AliasSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the alias map of one template.
    pub fn insert(&mut self, template: impl Into<String>, aliases: HashMap<String, String>) {
        self.templates.insert(template.into(), aliases);
    }

    /// Display name for `alias` under `template`.
    pub fn resolve(&self, template: &str, alias: &str) -> Option<&str> {
        self.templates
            .get(template)
            .and_then(|aliases| aliases.get(alias))
            .map(String::as_str)
    }

    /// Alias map of one template.
    pub fn template_aliases(&self, template: &str) -> Option<&HashMap<String, String>> {
        self.templates.get(template)
    }

    /// Alias map of the template a card snapshot names under `type`.
    pub fn card_aliases(&self, card: &Map<String, Value>) -> Option<&HashMap<String, String>> {
        card.get(CARD_TYPE_KEY)
            .and_then(Value::as_str)
            .and_then(|template| self.template_aliases(template))
            .filter(|aliases| !aliases.is_empty())
    }
}
