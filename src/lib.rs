//! dicebridge - rule-system plugin host for a chat dice bot.
//!
//! Plugins are folders holding a descriptor, Lua scripts, command
//! definitions, rulebooks and character templates. The [`ExtensionService`]
//! discovers them and turns their command definitions into chat commands
//! that run the scripts against a pre-resolved execution context.

pub mod alias;
pub mod bridge;
pub mod character;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod script;
pub mod service;
pub mod store;

pub use alias::AliasSnapshot;
pub use bridge::{Bridge, ChatIdentity, ContextBuilder, ExecutionContext, StoreEffect};
pub use character::{CharacterService, GameSessionService, Role};
pub use command::{CommandRegistrar, CommandRegistry, CommandTree, GENERIC_SUBCOMMANDS};
pub use config::Config;
pub use error::{BridgeError, Result};
pub use plugin::{CharacterTemplate, CommandDefinition, LoadedPlugin, PluginDescriptor, PluginSummary};
pub use script::{Interpreter, ScriptDialect, ScriptEngine};
pub use service::ExtensionService;
pub use store::{Attributes, CharacterCard, GameSession, MemoryStore, Store};
