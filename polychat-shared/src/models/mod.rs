//! # Data model
//!
//! Sessions, messages, per-model stats, default entries and image assets
//! shared by the orchestrator and its front-ends.

pub mod defaults;
pub mod image;
pub mod message;
pub mod session;
pub mod stats;
pub mod timestamp;

pub use defaults::{COMMON_DEFAULT_ID, DefaultEntry, DefaultOverrides, ReasoningEffort};
pub use image::{Attachment, ImageAsset};
pub use message::{Message, MessageRole, MessageStatus};
pub use session::Session;
pub use stats::{ModelStats, TokenUsage};
pub use timestamp::Timestamp;
