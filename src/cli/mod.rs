mod args;
mod commands;

pub use args::{Cli, Commands, ConfigSubcommands, parse_assignment};
pub use commands::{open_store, run};
