//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Goblin - MCP aggregation gateway
#[derive(Parser, Debug)]
#[command(name = "goblin")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (JSON)
    #[arg(short, long, env = "GOBLIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GOBLIN_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GOBLIN_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand; defaults to running the daemon
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Daemon control commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway daemon (default)
    Run,
    /// Query the status of a running daemon via its lock port
    Status {
        /// Lock port of the daemon
        #[arg(long)]
        lock_port: Option<u16>,
    },
    /// Stop a running daemon via its lock port
    Stop {
        /// Lock port of the daemon
        #[arg(long)]
        lock_port: Option<u16>,
    },
}
