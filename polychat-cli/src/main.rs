#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)]

//! Entry point of the `polychat` command-line client.

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;

mod commands;
mod logging;

/// Command line of the `polychat` binary.
#[derive(Parser, Debug)]
#[command(name = "polychat")]
#[command(about = "Send one prompt to several AI models concurrently and compare the answers", long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands of the `polychat` binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one prompt to several models and print every answer
    Compare(commands::compare::CompareArgs),

    /// Print the matched default settings for a model
    Defaults {
        /// Model identifier to resolve defaults for
        #[arg(long, short)]
        model: String,

        /// Path to the configuration file (optional)
        #[arg(
            long,
            short,
            help = "Path to the configuration file (e.g., config.yaml or config.json). If not provided, defaults will be used."
        )]
        config: Option<PathBuf>,
    },

    /// Generate shell completion scripts for the CLI
    Completion {
        /// The shell type for which to generate the completion script (e.g., bash, zsh, fish, powershell)
        #[arg(
            long,
            short,
            help = "The shell type for which to generate the completion script (e.g., bash, zsh, fish, powershell)"
        )]
        shell: String,
    },

    /// Generate a configuration file
    Config {
        /// Format of the configuration file to generate (yaml or json). Defaults to yaml.
        #[arg(
            long,
            short,
            help = "Format of the configuration file to generate (yaml or json). Defaults to yaml."
        )]
        format: Option<String>,

        /// Where to write the file. Defaults to `config.<format>` in the current directory.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compare(args) => commands::compare::run(args).await?,
        Commands::Defaults { model, config } => commands::defaults::show(config, &model)?,
        Commands::Completion { shell } => {
            let shell = shell
                .parse::<clap_complete::Shell>()
                .map_err(|err| anyhow!("invalid shell type: {err}"))?;
            commands::completion::generate_completion(shell);
        }
        Commands::Config { format, output } => {
            let format = format.unwrap_or_else(|| "yaml".to_string());
            commands::config::generate_config(&format, output)?;
        }
    }

    Ok(())
}
