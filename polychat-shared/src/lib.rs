#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)]
//! Shared data model and configuration for the `polychat` orchestrator and CLI.

pub mod config;
pub mod models;
