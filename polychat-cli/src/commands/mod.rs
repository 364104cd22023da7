//! Subcommand implementations.

pub mod compare;
pub mod completion;
pub mod config;
pub mod defaults;
