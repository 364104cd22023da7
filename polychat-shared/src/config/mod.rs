//! # Configuration
//!
//! Application settings and the model catalog.

pub mod app;
pub mod catalog;

pub use app::{
    ApiConfig, AppConfig, ENV_API_KEY, ENV_BASE_URL, ENV_LOG_FORMAT, ENV_LOG_LEVEL, ENV_STALL_TIMEOUT_SECS,
    LogFormat, LoggingConfig, OrchestratorSettings,
};
pub use catalog::{MODALITY_IMAGE, MODALITY_TEXT, ModelInfo, ModelParameters, ModelPricing};
