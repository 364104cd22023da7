//! `config`: load, validate and write configuration files.

use anyhow::{Context, Result, bail};
use shared::config::AppConfig;
use std::{fs, path::PathBuf};

/// Loads the configuration and rejects it when validation finds problems.
///
/// # Errors
/// Returns an error when loading fails or the configuration is invalid.
pub fn load_validated(path: Option<PathBuf>) -> Result<AppConfig> {
    let path = path.or_else(|| AppConfig::default_path().filter(|candidate| candidate.exists()));
    let config = AppConfig::load_config(path.clone()).map_err(|err| match &path {
        Some(path) => anyhow::anyhow!("failed to load configuration from {}: {err}", path.display()),
        None => anyhow::anyhow!("failed to load configuration: {err}"),
    })?;

    if let Err(problems) = config.validate() {
        bail!("invalid configuration:\n  - {}", problems.join("\n  - "));
    }
    Ok(config)
}

/// Generates a configuration file in the specified format.
///
/// # Arguments
/// * `format` - The format of the configuration file ("yaml" or "json").
/// * `output` - Target path; `config.<format>` in the working directory when absent.
///
/// # Errors
/// Returns an error if the format is unsupported or if writing the file fails.
pub fn generate_config(format: &str, output: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::with_defaults();
    let serialized = match format {
        "yaml" => serde_yml::to_string(&config).context("failed to serialize configuration")?,
        "json" => serde_json::to_string_pretty(&config).context("failed to serialize configuration")?,
        _ => bail!("Unsupported format. Use 'yaml' or 'json'."),
    };

    let path = output.unwrap_or_else(|| PathBuf::from(format!("config.{format}")));
    fs::write(&path, serialized).with_context(|| format!("failed to write {}", path.display()))?;

    println!("Configuration file '{}' generated successfully.", path.display());
    Ok(())
}
