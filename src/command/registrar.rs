//! Turns declarative command definitions into live commands.

use std::rc::Rc;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, ChatIdentity};
use crate::plugin::CommandDefinition;

use super::tree::{CommandHandler, CommandRegistry};

/// Subcommands registered for every definition. Each forwards to the same
/// script with its own name prepended to the argument tail.
pub const GENERIC_SUBCOMMANDS: [&str; 6] = ["show", "list", "add", "remove", "del", "set"];

/// Registers plugin commands against a command registry.
pub struct CommandRegistrar {
    bridge: Rc<Bridge>,
}

impl CommandRegistrar {
    pub fn new(bridge: Rc<Bridge>) -> Self {
        Self { bridge }
    }

    /// Register every definition of `plugin` under the plugin's namespace.
    ///
    /// Returns the full names of the registered commands.
    pub fn register<'a>(
        &self,
        plugin: &str,
        title: &str,
        definitions: impl IntoIterator<Item = &'a CommandDefinition>,
        registry: &mut dyn CommandRegistry,
    ) -> Vec<String> {
        let mut registered = Vec::new();

        for definition in definitions {
            let name = definition.command_name();
            if name.is_empty() || name.contains(char::is_whitespace) {
                warn!(
                    plugin = %plugin,
                    command = %definition.command_key,
                    prefix = %definition.prefix,
                    "Invalid command prefix, skipping"
                );
                continue;
            }
            if let Some(limits) = &definition.access_limits {
                debug!(
                    plugin = %plugin,
                    command = %name,
                    limits = %limits,
                    "Access limits declared but not enforced"
                );
            }

            let usage = match &definition.rule_system {
                Some(rule) => format!("[{rule}] {title}"),
                None => title.to_string(),
            };

            registry.register_command(
                name,
                plugin,
                &usage,
                self.handler(&definition.target_script, None),
            );
            registered.push(name.to_string());

            for sub in GENERIC_SUBCOMMANDS {
                let full = format!("{name}.{sub}");
                registry.register_command(
                    &full,
                    plugin,
                    &usage,
                    self.handler(&definition.target_script, Some(sub)),
                );
                registered.push(full);
            }

            info!(
                plugin = %plugin,
                command = %name,
                script = %definition.target_script,
                "Registered extension command"
            );
        }

        registered
    }

    /// Remove every command of `plugin`.
    pub fn unregister(&self, plugin: &str, registry: &mut dyn CommandRegistry) -> Vec<String> {
        let removed = registry.unregister_namespace(plugin);
        if !removed.is_empty() {
            debug!(plugin = %plugin, count = removed.len(), "Unregistered extension commands");
        }
        removed
    }

    fn handler(&self, script: &str, subcommand: Option<&'static str>) -> CommandHandler {
        let bridge = Rc::clone(&self.bridge);
        let script = script.to_string();
        Rc::new(move |identity: ChatIdentity, tail: String| {
            let bridge = Rc::clone(&bridge);
            let script = script.clone();
            let tail = inject_subcommand(subcommand, &tail);
            async move { bridge.invoke(&script, &identity, &tail).await }.boxed_local()
        })
    }
}

/// Argument tail seen by the script: the subcommand name, then the rest.
pub fn inject_subcommand(subcommand: Option<&str>, tail: &str) -> String {
    match (subcommand, tail.is_empty()) {
        (None, _) => tail.to_string(),
        (Some(sub), true) => sub.to_string(),
        (Some(sub), false) => format!("{sub} {tail}"),
    }
}
