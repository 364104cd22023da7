#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)]

//! Concurrent multi-model streaming orchestration.
//!
//! One prompt is fanned out to several models, each optionally run several
//! times. Every (model, run) streams independently, can be aborted on its
//! own, falls back to a single-shot request when the stream stalls or stays
//! empty, and is finalized with resolved images and reconciled cost.

pub mod composer;
pub mod controller;
pub mod cost;
pub mod debounce;
pub mod decoder;
pub mod defaults;
pub mod errors;
pub mod images;
pub mod orchestrator;
pub mod persistence;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use controller::{RunOutcome, RunReport};
pub use errors::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{Collaborators, Orchestrator};
pub use persistence::{MemoryPersistence, Persistence};
pub use state::{StateEvent, StateStore};
pub use transport::{CompletionTransport, HttpClient};
