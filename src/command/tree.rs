//! Command tree and chat line parser.
//!
//! Lines look like `.name args...`. A line `.name sub rest` goes to the
//! subcommand `name.sub` when one is registered, otherwise to `name` with
//! the whole argument tail.

use std::collections::BTreeMap;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use tracing::{debug, warn};

use crate::bridge::ChatIdentity;

/// Prefix marking a chat line as a command.
pub const COMMAND_PREFIX: char = '.';

/// Future produced by a command handler; resolves to the reply text.
pub type CommandFuture = LocalBoxFuture<'static, String>;

/// Handler invoked with the sender and the argument tail.
pub type CommandHandler = Rc<dyn Fn(ChatIdentity, String) -> CommandFuture>;

/// The chat framework surface the registrar needs.
pub trait CommandRegistry {
    /// Register `name` under `namespace`, replacing any existing command of that name.
    fn register_command(&mut self, name: &str, namespace: &str, usage: &str, handler: CommandHandler);

    /// Remove every command of `namespace`. Returns the removed names.
    fn unregister_namespace(&mut self, namespace: &str) -> Vec<String>;

    fn has_command(&self, name: &str) -> bool;
}

/// A command line split into name and argument tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub name: &'a str,
    pub tail: &'a str,
}

/// Parse a chat line. Returns `None` for plain messages.
pub fn parse_input(input: &str) -> Option<ParsedLine<'_>> {
    let trimmed = input.trim();
    let without_prefix = trimmed.strip_prefix(COMMAND_PREFIX)?;
    let (name, tail) = match without_prefix.find(char::is_whitespace) {
        Some(pos) => (&without_prefix[..pos], without_prefix[pos..].trim()),
        None => (without_prefix, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some(ParsedLine { name, tail })
}

struct RegisteredCommand {
    namespace: String,
    usage: String,
    handler: CommandHandler,
}

/// A resolved command ready to run.
pub struct Invocation {
    pub command: String,
    pub tail: String,
    handler: CommandHandler,
}

impl Invocation {
    pub fn run(self, identity: ChatIdentity) -> CommandFuture {
        (self.handler)(identity, self.tail)
    }
}

/// In-process command tree.
#[derive(Default)]
pub struct CommandTree {
    commands: BTreeMap<String, RegisteredCommand>,
}

impl CommandTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the handler for a chat line.
    pub fn resolve(&self, line: &str) -> Option<Invocation> {
        let parsed = parse_input(line)?;

        let (sub, rest) = match parsed.tail.find(char::is_whitespace) {
            Some(pos) => (&parsed.tail[..pos], parsed.tail[pos..].trim()),
            None => (parsed.tail, ""),
        };
        if !sub.is_empty() {
            let full = format!("{}.{}", parsed.name, sub);
            if let Some(command) = self.commands.get(&full) {
                return Some(Invocation {
                    command: full,
                    tail: rest.to_string(),
                    handler: Rc::clone(&command.handler),
                });
            }
        }

        let command = self.commands.get(parsed.name)?;
        Some(Invocation {
            command: parsed.name.to_string(),
            tail: parsed.tail.to_string(),
            handler: Rc::clone(&command.handler),
        })
    }

    /// Names of all registered commands, sorted.
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn usage(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(|c| c.usage.as_str())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandRegistry for CommandTree {
    fn register_command(&mut self, name: &str, namespace: &str, usage: &str, handler: CommandHandler) {
        if let Some(existing) = self.commands.get(name) {
            if existing.namespace != namespace {
                warn!(
                    command = %name,
                    "Command from '{}' replaced by '{}'", existing.namespace, namespace
                );
            }
        }
        debug!(command = %name, namespace = %namespace, "Registered command");
        self.commands.insert(
            name.to_string(),
            RegisteredCommand {
                namespace: namespace.to_string(),
                usage: usage.to_string(),
                handler,
            },
        );
    }

    fn unregister_namespace(&mut self, namespace: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .commands
            .iter()
            .filter(|(_, c)| c.namespace == namespace)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            self.commands.remove(name);
        }
        removed
    }

    fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }
}
