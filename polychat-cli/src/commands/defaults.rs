//! `defaults`: show default entries and their merge for a model.

use anyhow::{Context, Result};
use colored::Colorize;
use orchestrator::defaults::DefaultsRegistry;
use std::path::PathBuf;

use super::config::load_validated;

/// Prints the configured default entries and the merged result for `model_id`.
///
/// # Errors
/// Returns an error when the configuration cannot be loaded.
pub fn show(config: Option<PathBuf>, model_id: &str) -> Result<()> {
    let config = load_validated(config)?;
    let registry = DefaultsRegistry::new(config.defaults.clone());

    println!("{}", format!("Defaults for {model_id}").green().bold());
    for entry in registry.entries() {
        let pattern = if entry.pattern.is_empty() {
            "(always)".to_string()
        } else {
            entry.pattern.clone()
        };
        println!("- {} {}", entry.id.yellow(), pattern.dimmed());
    }

    let merged = registry.resolve(model_id);
    let rendered = serde_yml::to_string(&merged).context("failed to render defaults")?;
    println!("\n{rendered}");
    Ok(())
}
