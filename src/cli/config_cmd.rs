// ABOUTME: CLI config commands - print the effective configuration or validate a file

use super::OutputFormat;
use anyhow::{Context, Result};
use busline::config::Config;
use std::path::Path;

/// Print the effective configuration
pub fn show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let rendered = config
                .to_toml_string()
                .context("Failed to render configuration")?;
            print!("{rendered}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
    }
    Ok(())
}

/// Validate a config file, failing with the first problem found
pub fn check(path: &Path, format: OutputFormat) -> Result<()> {
    let result = Config::load(path);

    match format {
        OutputFormat::Text => match &result {
            Ok(_) => println!("✅ {} is valid", path.display()),
            Err(e) => eprintln!("❌ {}: {e}", path.display()),
        },
        OutputFormat::Json => {
            let report = serde_json::json!({
                "path": path.display().to_string(),
                "valid": result.is_ok(),
                "error": result.as_ref().err().map(ToString::to_string),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    result
        .map(|_| ())
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}
