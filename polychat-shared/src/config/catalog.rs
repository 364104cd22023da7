//! # Model catalog
//!
//! Metadata, pricing and per-model parameter overrides for the completion
//! models a session can target.

use serde::{Deserialize, Serialize};

/// Output modality name for text.
pub const MODALITY_TEXT: &str = "text";
/// Output modality name for generated images.
pub const MODALITY_IMAGE: &str = "image";

/// Per-token, per-request and per-image prices in USD.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPricing {
    /// Price of one prompt token
    #[serde(default)]
    pub prompt: f64,

    /// Price of one completion token
    #[serde(default)]
    pub completion: f64,

    /// Flat price charged per request
    #[serde(default)]
    pub request: f64,

    /// Price of one generated image
    #[serde(default)]
    pub image: f64,
}

/// Catalog entry describing one completion model.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelInfo {
    /// Human readable model name
    #[serde(default)]
    pub name: String,

    /// Output modalities advertised by the provider (`text`, `image`)
    #[serde(default)]
    pub output_modalities: Vec<String>,

    /// Pricing used for local cost estimates
    #[serde(default)]
    pub pricing: ModelPricing,
}

impl ModelInfo {
    /// Whether the model advertises image output.
    #[must_use]
    pub fn produces_images(&self) -> bool {
        self.output_modalities.iter().any(|m| m == MODALITY_IMAGE)
    }

    /// Whether the model advertises image output and nothing else.
    #[must_use]
    pub fn is_image_only(&self) -> bool {
        self.produces_images() && self.output_modalities.iter().all(|m| m == MODALITY_IMAGE)
    }
}

/// User-set sampling overrides for one model. Unset fields are omitted
/// from the outbound request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelParameters {
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Frequency penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    /// Presence penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Repetition penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,

    /// Maximum completion tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Explicit output modalities, taking precedence over catalog metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
}
