//! CLI argument definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::schema::SchemaPreset;

#[derive(Parser, Debug)]
#[command(name = "permsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Storage file shared by every process (overrides config)
    #[arg(long, global = true)]
    pub storage: Option<PathBuf>,

    /// Permission preset: microfrontend or widget (overrides config)
    #[arg(long, global = true)]
    pub preset: Option<SchemaPreset>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the current permission record as JSON
    Show,
    /// Exit with status 0 if the permission is granted, 1 if it is denied
    /// and 2 if no such permission exists
    Check {
        /// Permission name, e.g. canAccessAdmin
        name: String,
    },
    /// Update permissions, e.g. `set canAccessAdmin=true canEditRemote2Data=false`
    Set {
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<(String, bool)>,
    },
    /// Restore every permission to its default
    Reset,
    /// Print the record whenever another process changes it
    Watch {
        /// Poll interval in milliseconds (overrides config)
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Exit after this many changes
        #[arg(long)]
        count: Option<usize>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigSubcommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommands {
    /// Initialize a new config file
    Init,
    /// Print config file location
    Where,
    /// Persist the permission preset in the config file, removing a custom
    /// permission list and a storage key left over from another preset
    UsePreset { preset: SchemaPreset },
}

/// Parses `name=value` where value is true/false, on/off, yes/no or 1/0.
pub fn parse_assignment(input: &str) -> Result<(String, bool), String> {
    let (name, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{input}'"))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing permission name in '{input}'"));
    }

    let value = match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => true,
        "false" | "off" | "no" | "0" => false,
        other => return Err(format!("'{other}' is not a boolean")),
    };

    Ok((name.to_string(), value))
}
