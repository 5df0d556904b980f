//! Chat command registration for extension plugins.

pub mod registrar;
pub mod tree;

pub use registrar::{inject_subcommand, CommandRegistrar, GENERIC_SUBCOMMANDS};
pub use tree::{
    parse_input, CommandFuture, CommandHandler, CommandRegistry, CommandTree, Invocation,
    ParsedLine, COMMAND_PREFIX,
};
