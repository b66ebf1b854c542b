// ABOUTME: CLI argument parsing and command routing for busline
//
// Provides command-line interface for:
// - Inspecting configuration (config show, config check)
// - Exercising the engine against an in-process loopback bus (selftest)

pub mod config_cmd;
pub mod selftest;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Message bus coordination engine: correlated requests, project downloads, worker pools
#[derive(Parser)]
#[command(name = "busline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (overrides $BUSLINE_CONFIG and ~/.busline/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Also log to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON document
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Run a request, a download and a pool round-trip over a loopback bus
    Selftest(SelftestArgs),
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Validate a config file
    Check {
        /// File to validate
        path: PathBuf,
    },
}

/// Arguments for the selftest command
#[derive(clap::Args)]
pub struct SelftestArgs {
    /// Files listed by the loopback project host
    #[arg(long, default_value_t = 3)]
    pub files: usize,

    /// Download into this directory instead of a temporary one
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// User the worker is acquired for
    #[arg(long, default_value = "selftest")]
    pub user: String,
}
