//! Extension service: plugin discovery, loading and lookup.
//!
//! Loading runs descriptor, then scripts, then rulebooks and templates, then
//! commands. Failures are isolated: a broken plugin never blocks the others,
//! and a broken script never blocks the rest of its plugin.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bridge::{Bridge, ChatIdentity, ContextBuilder};
use crate::character::{CharacterService, GameSessionService};
use crate::command::{CommandRegistrar, CommandTree};
use crate::config::{Config, ExtensionConfig};
use crate::plugin::reply::load_command_definitions;
use crate::plugin::rulebook::load_rulebooks;
use crate::plugin::template::load_templates;
use crate::plugin::{
    CharacterTemplate, LoadedPlugin, PluginLayout, PluginSummary, Registries, SharedRegistries,
};
use crate::script::{Interpreter, ResourceLimits, ScriptEngine, ScriptLoader, ScriptUnit};
use crate::store::{Attributes, CharacterCard, Store};
use crate::{BridgeError, Result};

/// Owns every loaded plugin and the registries they contribute to.
pub struct ExtensionService {
    plugin_dir: PathBuf,
    store: Arc<dyn Store>,
    characters: CharacterService,
    sessions: Arc<GameSessionService>,
    registries: SharedRegistries,
    interpreter: Rc<dyn Interpreter>,
    registrar: CommandRegistrar,
    commands: CommandTree,
    plugins: BTreeMap<String, LoadedPlugin>,
}

impl ExtensionService {
    /// Create a service backed by the Lua engine.
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Result<Self> {
        let engine = ScriptEngine::with_limits(ResourceLimits::from(&config.interpreter))?;
        Ok(Self::with_interpreter(
            &config.extensions,
            store,
            Rc::new(engine),
        ))
    }

    /// Create a service around an existing interpreter.
    pub fn with_interpreter(
        config: &ExtensionConfig,
        store: Arc<dyn Store>,
        interpreter: Rc<dyn Interpreter>,
    ) -> Self {
        let characters = CharacterService::new(Arc::clone(&store));
        let sessions = Arc::new(GameSessionService::new(Arc::clone(&store)));
        let registries: SharedRegistries = Rc::new(RefCell::new(Registries::default()));

        let builder = ContextBuilder::new(
            characters.clone(),
            Arc::clone(&sessions),
            Rc::clone(&registries),
        );
        let bridge = Bridge::new(
            builder,
            Rc::clone(&interpreter),
            Arc::clone(&store),
            config,
        );

        Self {
            plugin_dir: PathBuf::from(&config.plugin_dir),
            store,
            characters,
            sessions,
            registries,
            interpreter,
            registrar: CommandRegistrar::new(Rc::new(bridge)),
            commands: CommandTree::new(),
            plugins: BTreeMap::new(),
        }
    }

    /// Load every plugin below the configured plugin directory.
    ///
    /// Returns the number of plugins loaded.
    pub fn initialize(&mut self) -> usize {
        let dir = self.plugin_dir.clone();
        self.load_directory(&dir)
    }

    /// Load every immediate subdirectory of `dir` as a plugin.
    pub fn load_directory(&mut self, dir: &Path) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Plugin directory not readable");
                return 0;
            }
        };

        let mut roots: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        roots.sort();

        let mut loaded = 0;
        for root in roots {
            match self.load_plugin(&root) {
                Ok(_) => loaded += 1,
                Err(e) => error!(path = %root.display(), "Failed to load plugin: {}", e),
            }
        }
        info!(path = %dir.display(), loaded, "Plugin discovery finished");
        loaded
    }

    /// Load one plugin package. A plugin with the same name is replaced.
    pub fn load_plugin(&mut self, path: &Path) -> Result<PluginSummary> {
        let layout = PluginLayout::new(path);
        let (descriptor, manifest_format) = layout.read_descriptor()?;
        let name = descriptor.name.clone();

        if self.plugins.contains_key(&name) {
            info!(plugin = %name, "Replacing loaded plugin");
            self.unload_plugin(&name);
        }

        let scripts = self.load_scripts(&layout, &name);

        let (rule_systems, templates) = {
            let mut registries = self.registries.borrow_mut();
            let rule_systems = load_rulebooks(&layout.rulebook_dir(), &name, &mut registries.rules)
                .unwrap_or_else(|e| {
                    warn!(plugin = %name, "Failed to read rulebooks: {}", e);
                    Vec::new()
                });
            let templates =
                load_templates(&layout.template_dir(), &name, &mut registries.templates)
                    .unwrap_or_else(|e| {
                        warn!(plugin = %name, "Failed to read templates: {}", e);
                        Vec::new()
                    });
            (rule_systems, templates)
        };

        let commands = load_command_definitions(&layout.reply_dir(), &name).unwrap_or_else(|e| {
            warn!(plugin = %name, "Failed to read command definitions: {}", e);
            BTreeMap::new()
        });
        let registered_commands = self.registrar.register(
            &name,
            descriptor.display_name(),
            commands.values(),
            &mut self.commands,
        );

        let plugin = LoadedPlugin {
            name: name.clone(),
            path: path.to_path_buf(),
            descriptor,
            manifest_format,
            scripts,
            commands,
            rule_systems,
            templates,
            registered_commands,
        };
        let summary = plugin.summary();
        info!(
            plugin = %name,
            version = %summary.version,
            scripts = summary.script_count,
            commands = summary.command_count,
            "Loaded plugin"
        );
        self.plugins.insert(name, plugin);
        Ok(summary)
    }

    /// Compile every script of a plugin under its qualified and short names.
    ///
    /// Only units whose qualified name compiled are kept.
    fn load_scripts(&self, layout: &PluginLayout, plugin: &str) -> BTreeMap<String, ScriptUnit> {
        let scan = ScriptLoader::new(layout.script_dir(), plugin).load_all();
        for (path, reason) in &scan.errors {
            warn!(plugin = %plugin, path = %path, "Failed to read script: {}", reason);
        }

        let mut loaded = BTreeMap::new();
        for (qualified, unit) in scan.units {
            if let Err(e) = self
                .interpreter
                .load_script(&qualified, &unit.source, unit.dialect)
            {
                warn!(plugin = %plugin, "{}", e);
                continue;
            }
            if let Some(short) = &unit.short_name {
                if let Some(owner) = self.script_owner(short) {
                    warn!(
                        plugin = %plugin,
                        script = %short,
                        owner = %owner.qualified_name,
                        "Short script name already taken, keeping qualified name only"
                    );
                } else if let Err(e) = self.interpreter.load_script(short, &unit.source, unit.dialect) {
                    warn!(plugin = %plugin, "{}", e);
                }
            }
            debug!(plugin = %plugin, script = %qualified, digest = %unit.digest, "Loaded script");
            loaded.insert(qualified, unit);
        }
        loaded
    }

    /// Remove a plugin with its scripts, commands, rules and templates.
    pub fn unload_plugin(&mut self, name: &str) -> bool {
        let Some(plugin) = self.plugins.remove(name) else {
            return false;
        };

        for unit in plugin.scripts.values() {
            for script_name in unit.names() {
                self.release_script_name(script_name);
            }
        }

        let removed_commands = self.registrar.unregister(name, &mut self.commands);
        let (removed_rules, removed_templates) = {
            let mut registries = self.registries.borrow_mut();
            (
                registries.rules.remove_plugin(name),
                registries.templates.remove_plugin(name),
            )
        };

        info!(
            plugin = %name,
            commands = removed_commands.len(),
            rules = removed_rules,
            templates = removed_templates,
            "Unloaded plugin"
        );
        true
    }

    /// Unit of a loaded plugin that answers to `script_name`.
    ///
    /// A unit whose qualified name matches wins over one whose short name does.
    fn script_owner(&self, script_name: &str) -> Option<&ScriptUnit> {
        self.plugins
            .values()
            .flat_map(|plugin| plugin.scripts.values())
            .filter(|unit| unit.names().any(|n| n == script_name))
            .min_by_key(|unit| unit.qualified_name != script_name)
    }

    /// Drop `script_name` from the interpreter, or hand it back to the
    /// remaining plugin that claims it.
    fn release_script_name(&self, script_name: &str) {
        match self.script_owner(script_name) {
            Some(unit) => {
                debug!(script = %script_name, owner = %unit.qualified_name, "Restoring script name");
                if let Err(e) = self
                    .interpreter
                    .load_script(script_name, &unit.source, unit.dialect)
                {
                    warn!(script = %script_name, "{}", e);
                    self.interpreter.unload_script(script_name);
                }
            }
            None => {
                self.interpreter.unload_script(script_name);
            }
        }
    }

    /// Load a plugin again from its recorded path.
    ///
    /// The loaded plugin is only replaced once the new descriptor reads; a
    /// broken manifest leaves it in place.
    pub fn reload_plugin(&mut self, name: &str) -> Result<PluginSummary> {
        let path = self
            .plugins
            .get(name)
            .map(|plugin| plugin.path.clone())
            .ok_or_else(|| BridgeError::NotFound(format!("plugin '{name}'")))?;
        let summary = self.load_plugin(&path)?;
        if summary.name != name {
            info!(plugin = %name, renamed = %summary.name, "Plugin renamed on reload");
            self.unload_plugin(name);
        }
        Ok(summary)
    }

    pub fn list_plugins(&self) -> Vec<PluginSummary> {
        self.plugins.values().map(LoadedPlugin::summary).collect()
    }

    pub fn get_plugin(&self, name: &str) -> Option<&LoadedPlugin> {
        self.plugins.get(name)
    }

    /// Look up a keyword in one rule system.
    pub fn query_plugin_rule(&self, system: &str, keyword: &str) -> Option<String> {
        self.registries
            .borrow()
            .rules
            .query(system, keyword)
            .map(str::to_string)
    }

    /// Look up a keyword in every rule system. Returns `(system, text)`.
    pub fn query_rule_any(&self, keyword: &str) -> Option<(String, String)> {
        self.registries
            .borrow()
            .rules
            .query_any(keyword)
            .map(|(system, text)| (system.to_string(), text.to_string()))
    }

    pub fn list_rule_systems(&self) -> Vec<String> {
        self.registries.borrow().rules.systems()
    }

    pub fn get_template(&self, name: &str) -> Option<CharacterTemplate> {
        self.registries.borrow().templates.get(name).cloned()
    }

    pub fn list_templates(&self) -> Vec<String> {
        self.registries.borrow().templates.names()
    }

    /// Default attributes of a registered template.
    pub fn generate_default_attributes(&self, template: &str) -> Result<Attributes> {
        let registries = self.registries.borrow();
        let template = registries
            .templates
            .get(template)
            .ok_or_else(|| BridgeError::NotFound(format!("template '{template}'")))?;
        template.generate_default_attributes()
    }

    /// Create a character card filled with a template's defaults.
    pub async fn create_character(
        &self,
        user_id: &str,
        platform: &str,
        card_name: &str,
        template: &str,
    ) -> Result<CharacterCard> {
        let attributes = self.generate_default_attributes(template)?;
        self.characters
            .create_card(user_id, platform, card_name, template, attributes)
            .await
    }

    /// Run the command a chat line refers to. `None` when no command matches.
    pub async fn dispatch(&self, identity: &ChatIdentity, line: &str) -> Option<String> {
        let invocation = self.commands.resolve(line)?;
        debug!(
            command = %invocation.command,
            user = %identity.user_id,
            "Dispatching extension command"
        );
        Some(invocation.run(identity.clone()).await)
    }

    /// Names of all registered chat commands.
    pub fn command_names(&self) -> Vec<String> {
        self.commands.names()
    }

    pub fn has_script(&self, name: &str) -> bool {
        self.interpreter.has_script(name)
    }

    pub fn list_scripts(&self) -> Vec<String> {
        self.interpreter.list_scripts()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn characters(&self) -> &CharacterService {
        &self.characters
    }

    pub fn sessions(&self) -> &GameSessionService {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn maid_plugin(root: &Path) {
        write(
            root,
            "descriptor.json",
            r#"{"name": "maid", "title": "Maid TRPG", "ver": "1.0.0", "author": "someone"}"#,
        );
        write(root, "script/team.lua", "return 'team ' .. msg.suffix");
        write(root, "script/sub/roll.lua", "return 'rolled'");
        write(
            root,
            "rulebook/maid.yaml",
            "rule: Maid\nmanual:\n  favor: Favor measures the master's affection.\n",
        );
        write(
            root,
            "reply/team.toml",
            r#"
[reply.team]
rule = "Maid"
keyword.prefix = ".team"
echo.lua = "team"
"#,
        );
        write(
            root,
            "template/maid.xml",
            r#"<model name="Maid"><property>
                <any name="宠爱" alias="Favor" default="5"/>
                <any name="压力" alias="Stress" text="javascript">this.Favor * 2</any>
            </property></model>"#,
        );
    }

    fn service(plugin_dir: &Path) -> ExtensionService {
        let config = Config::parse(&format!(
            "[extensions]\nplugin_dir = {:?}\n[database]\nbackend = \"memory\"\n",
            plugin_dir.display().to_string()
        ))
        .unwrap();
        ExtensionService::new(&config, Arc::new(MemoryStore::new())).unwrap()
    }

    fn fixture() -> (TempDir, ExtensionService) {
        let dir = tempdir().unwrap();
        maid_plugin(&dir.path().join("maid"));
        let mut service = service(dir.path());
        assert_eq!(service.initialize(), 1);
        (dir, service)
    }

    #[test]
    fn test_load_plugin_registers_everything() {
        let (_dir, service) = fixture();

        let plugin = service.get_plugin("maid").unwrap();
        assert_eq!(plugin.name, plugin.descriptor.name);
        assert_eq!(plugin.scripts.len(), 2);
        assert_eq!(plugin.rule_systems, vec!["Maid".to_string()]);
        assert_eq!(plugin.templates, vec!["Maid".to_string()]);

        assert!(service.has_script("maid.team"));
        assert!(service.has_script("team"));
        assert!(service.has_script("maid.sub.roll"));
        assert!(service.has_script("sub.roll"));

        let names = service.command_names();
        assert!(names.contains(&"team".to_string()));
        assert!(names.contains(&"team.show".to_string()));
        assert!(names.contains(&"team.set".to_string()));
    }

    #[test]
    fn test_loading_twice_replaces() {
        let (dir, mut service) = fixture();
        let commands = service.command_names();

        service.load_plugin(&dir.path().join("maid")).unwrap();
        assert_eq!(service.list_plugins().len(), 1);
        assert_eq!(service.command_names(), commands);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let (_dir, mut service) = fixture();
        let before = service.get_plugin("maid").unwrap().clone();

        let summary = service.reload_plugin("maid").unwrap();
        assert_eq!(summary.title, "Maid TRPG");

        let after = service.get_plugin("maid").unwrap();
        assert_eq!(
            before.scripts.keys().collect::<Vec<_>>(),
            after.scripts.keys().collect::<Vec<_>>()
        );
        assert_eq!(
            before.commands.keys().collect::<Vec<_>>(),
            after.commands.keys().collect::<Vec<_>>()
        );
        assert_eq!(before.registered_commands, after.registered_commands);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_plugin() {
        let (dir, mut service) = fixture();
        let commands = service.command_names();
        write(&dir.path().join("maid"), "descriptor.json", "{ broken");

        assert!(matches!(
            service.reload_plugin("maid"),
            Err(BridgeError::InvalidManifest { .. })
        ));
        assert!(service.get_plugin("maid").is_some());
        assert_eq!(service.command_names(), commands);
        assert!(service.has_script("team"));

        let identity = ChatIdentity::new("u1", "qq", "c1").with_group("g1");
        assert_eq!(
            service.dispatch(&identity, ".team ok").await.as_deref(),
            Some("team ok")
        );
    }

    #[test]
    fn test_reload_after_rename() {
        let (dir, mut service) = fixture();
        write(
            &dir.path().join("maid"),
            "descriptor.json",
            r#"{"name": "maid2", "ver": "1.1.0"}"#,
        );

        let summary = service.reload_plugin("maid").unwrap();
        assert_eq!(summary.name, "maid2");
        assert!(service.get_plugin("maid").is_none());
        assert!(service.has_script("maid2.team"));
        assert!(!service.has_script("maid.team"));
        assert!(service.command_names().contains(&"team".to_string()));
    }

    #[test]
    fn test_reload_unknown_plugin() {
        let (_dir, mut service) = fixture();
        assert!(matches!(
            service.reload_plugin("ghost"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_unload_removes_contributions() {
        let (_dir, mut service) = fixture();
        assert!(service.unload_plugin("maid"));
        assert!(!service.unload_plugin("maid"));

        assert!(service.list_plugins().is_empty());
        assert!(service.command_names().is_empty());
        assert!(!service.has_script("maid.team"));
        assert!(!service.has_script("team"));
        assert!(service.list_rule_systems().is_empty());
        assert!(service.get_template("Maid").is_none());
    }

    #[tokio::test]
    async fn test_short_name_not_shadowed_by_other_plugin() {
        let (dir, mut service) = fixture();
        let root = dir.path().join("other");
        write(&root, "descriptor.json", r#"{"name": "other", "ver": "1"}"#);
        write(&root, "script/team.lua", "return 'OTHER'");
        write(&root, "script/caller.lua", "return loadLua('team')(msg)");
        write(&root, "reply/call.toml", "[reply.call]\necho.lua = \"caller\"\n");

        let identity = ChatIdentity::new("u1", "qq", "c1").with_group("g1");
        service.load_plugin(&root).unwrap();
        assert!(service.has_script("other.team"));
        assert_eq!(
            service.dispatch(&identity, ".call x").await.as_deref(),
            Some("team x")
        );

        // The owner of `team` leaves; the remaining claimant takes the name.
        assert!(service.unload_plugin("maid"));
        assert!(service.has_script("team"));
        assert_eq!(
            service.dispatch(&identity, ".call x").await.as_deref(),
            Some("OTHER")
        );

        assert!(service.unload_plugin("other"));
        assert!(!service.has_script("team"));
        assert!(service.list_scripts().is_empty());
    }

    #[tokio::test]
    async fn test_unloading_shadowed_plugin_keeps_owner() {
        let (dir, mut service) = fixture();
        let root = dir.path().join("other");
        write(&root, "descriptor.json", r#"{"name": "other", "ver": "1"}"#);
        write(&root, "script/team.lua", "return 'OTHER'");
        service.load_plugin(&root).unwrap();

        assert!(service.unload_plugin("other"));
        let identity = ChatIdentity::new("u1", "qq", "c1").with_group("g1");
        assert_eq!(
            service.dispatch(&identity, ".team x").await.as_deref(),
            Some("team x")
        );
        assert!(service.has_script("team"));
        assert!(!service.has_script("other.team"));
    }

    #[test]
    fn test_broken_plugin_is_isolated() {
        let dir = tempdir().unwrap();
        maid_plugin(&dir.path().join("maid"));
        write(&dir.path().join("broken"), "descriptor.json", "{ not json");
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let mut service = service(dir.path());
        assert_eq!(service.initialize(), 1);
        assert!(service.get_plugin("maid").is_some());
    }

    #[test]
    fn test_missing_plugin_dir() {
        let dir = tempdir().unwrap();
        let mut service = service(&dir.path().join("nowhere"));
        assert_eq!(service.initialize(), 0);
    }

    #[test]
    fn test_failing_script_does_not_abort_load() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mixed");
        write(&root, "descriptor.toml", "name = \"mixed\"\nversion = \"2\"\n");
        write(&root, "script/good.lua", "return 'ok'");
        write(&root, "script/bad.lua", "return function(");
        write(&root, "script/web.js", "module.exports = 1;");

        let mut service = service(dir.path());
        service.load_plugin(&root).unwrap();

        let plugin = service.get_plugin("mixed").unwrap();
        assert_eq!(plugin.scripts.keys().collect::<Vec<_>>(), vec!["mixed.good"]);
        assert!(service.has_script("good"));
        assert!(!service.has_script("mixed.bad"));
        assert!(!service.has_script("mixed.web"));
    }

    #[test]
    fn test_rule_queries() {
        let (_dir, service) = fixture();
        assert_eq!(
            service.query_plugin_rule("Maid", "favor").as_deref(),
            Some("Favor measures the master's affection.")
        );
        assert_eq!(service.query_plugin_rule("Maid", "missing"), None);
        assert_eq!(
            service.query_rule_any("favor").map(|(system, _)| system),
            Some("Maid".to_string())
        );
        assert_eq!(service.list_rule_systems(), vec!["Maid".to_string()]);
    }

    #[tokio::test]
    async fn test_create_character_from_template() {
        let (_dir, service) = fixture();
        assert_eq!(service.list_templates(), vec!["Maid".to_string()]);

        let defaults = service.generate_default_attributes("Maid").unwrap();
        assert_eq!(json!(defaults), json!({"宠爱": 5, "压力": 10}));

        let card = service
            .create_character("u1", "qq", "Alice", "Maid")
            .await
            .unwrap();
        assert_eq!(card.card_type, "Maid");
        assert!(card.is_active);
        assert!(matches!(
            service.generate_default_attributes("Nope"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch() {
        let (_dir, service) = fixture();
        let identity = ChatIdentity::new("u1", "qq", "c1").with_group("g1");

        assert_eq!(
            service.dispatch(&identity, ".team show Alice").await.as_deref(),
            Some("team show Alice")
        );
        assert_eq!(
            service.dispatch(&identity, ".team list").await.as_deref(),
            Some("team list")
        );
        assert_eq!(service.dispatch(&identity, "hello").await, None);
        assert_eq!(service.dispatch(&identity, ".unknown").await, None);
    }
}
