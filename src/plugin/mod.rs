//! Plugin packages: descriptor, command definitions, rulebooks and templates.

pub mod descriptor;
pub mod formula;
pub mod reply;
pub mod rulebook;
pub mod template;
pub mod types;

use std::cell::RefCell;
use std::rc::Rc;

pub use descriptor::{ManifestFormat, PluginLayout};
pub use rulebook::{RuleEntry, RuleRegistry};
pub use template::{CharacterTemplate, TemplateField, TemplateRegistry};
pub use types::{CommandDefinition, LoadedPlugin, PluginDescriptor, PluginSummary};

/// Lookup tables shared by every loaded plugin.
#[derive(Debug, Default)]
pub struct Registries {
    pub rules: RuleRegistry,
    pub templates: TemplateRegistry,
}

/// Registries owned by the extension service and read by command handlers.
pub type SharedRegistries = Rc<RefCell<Registries>>;
