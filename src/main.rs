// ABOUTME: Main entry point for busline CLI
//
// Binary: busline
// Usage: busline <COMMAND>
// - config show: print the effective configuration
// - config check <PATH>: validate a config file
// - selftest: exercise requests, downloads and the pool over a loopback bus

#![allow(missing_docs)]

use anyhow::Result;
use busline::config::Config;
use clap::Parser;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    setup_logging(args.verbose);
    setup_panic_handler();

    match args.command {
        cli::Commands::Config(cli::ConfigCommand::Check { path }) => {
            cli::config_cmd::check(&path, args.format)
        }
        cli::Commands::Config(cli::ConfigCommand::Show) => {
            let config = load_config(args.config.as_deref())?;
            cli::config_cmd::show(&config, args.format)
        }
        cli::Commands::Selftest(selftest_args) => {
            let config = load_config(args.config.as_deref())?;
            cli::selftest::execute(selftest_args, config, args.format).await
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    Ok(config)
}

fn setup_logging(verbose: bool) {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use tracing_subscriber::prelude::*;

    // Create log directory if it doesn't exist
    let log_dir = dirs::home_dir()
        .map(|home| home.join(".busline").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".busline/logs"));

    let _ = std::fs::create_dir_all(&log_dir);

    // JSONL log file with timestamp
    let log_file = log_dir.join(format!(
        "busline-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file_layer = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(file)
                .with_ansi(false)
        });

    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "busline=info".into()),
        )
        .init();
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
