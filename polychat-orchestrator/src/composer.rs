//! # Request composer
//!
//! Builds the `chat/completions` payload for one (model, run) pair from the
//! model's message history, its parameter overrides, the matched default and
//! catalog metadata. Composition is a pure transform.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use shared::{
    config::{MODALITY_IMAGE, MODALITY_TEXT, ModelInfo, ModelParameters},
    models::{DefaultOverrides, ImageAsset, Message, MessageRole, MessageStatus, ReasoningEffort},
};
use std::collections::HashMap;

/// Models that only ever return images.
static IMAGE_ONLY_MODEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(dall-e|gpt-image|imagen|flux|stable-diffusion|sdxl|recraft|ideogram)")
        .expect("valid image-only model pattern")
});

/// Models that can return images next to text, e.g. `google/gemini-2.5-flash-image`.
static IMAGE_CAPABLE_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)image").expect("valid image model pattern"));

/// Body of a `chat/completions` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    /// Provider model identifier.
    pub model: String,
    /// Conversation sent to the model.
    pub messages: Vec<ChatMessage>,
    /// Whether the answer is streamed as SSE.
    pub stream: bool,
    /// Requested output modalities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    /// Reasoning effort hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling mass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Frequency penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    /// Presence penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Repetition penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    /// Completion token limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Structured output format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    /// Image generation hints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_config: Option<ImageConfig>,
    /// Inline usage accounting.
    pub usage: UsageOptions,
}

impl CompletionRequest {
    /// Same payload, switched to streaming or single-shot delivery.
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// One message of the request conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: MessageRole,
    /// Text or multi-part content.
    pub content: ChatContent,
}

/// Message content in either wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatContent {
    /// Plain text.
    Text(String),
    /// Text and image parts.
    Parts(Vec<ContentPart>),
}

/// One part of multi-part content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text part.
    Text {
        /// The text.
        text: String,
    },
    /// Image part.
    ImageUrl {
        /// Location of the image.
        image_url: ImageUrl,
    },
}

/// Image location wrapper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    /// Remote URL or `data:` URI.
    pub url: String,
}

/// Reasoning settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReasoningConfig {
    /// Requested effort.
    pub effort: ReasoningEffort,
}

/// Structured output request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFormat {
    /// Format name, e.g. `json_object`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Image generation hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageConfig {
    /// Aspect ratio such as `16:9`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    /// Size hint such as `1K`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    /// Encoded image format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

impl ImageConfig {
    fn is_empty(&self) -> bool {
        self.aspect_ratio.is_none() && self.image_size.is_none() && self.output_format.is_none()
    }
}

/// Asks the provider to report usage and cost inline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageOptions {
    /// Whether usage is included in the response.
    pub include: bool,
}

/// Everything the composer reads for one (model, run).
#[derive(Debug, Clone, Copy)]
pub struct ComposeInput<'a> {
    /// Model the request is for.
    pub model_id: &'a str,
    /// Run the request belongs to; `None` for single-run sends.
    pub run_index: Option<u32>,
    /// The model's conversation, oldest first.
    pub history: &'a [Message],
    /// Per-model parameter overrides.
    pub parameters: Option<&'a ModelParameters>,
    /// The matched default for `model_id`.
    pub defaults: &'a DefaultOverrides,
    /// Catalog metadata, when known.
    pub model_info: Option<&'a ModelInfo>,
    /// Stored assets referenced by the history.
    pub images: &'a HashMap<String, ImageAsset>,
}

/// Image generation capabilities inferred for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCapability {
    /// The model may return images.
    pub generates_images: bool,
    /// The model returns only images.
    pub image_only: bool,
}

impl ImageCapability {
    /// Infers capabilities from catalog metadata, requested modalities and the model name.
    #[must_use]
    pub fn detect(model_id: &str, info: Option<&ModelInfo>, modalities: Option<&[String]>) -> Self {
        let name = info.map_or("", |info| info.name.as_str());
        let image_only = info.is_some_and(ModelInfo::is_image_only)
            || IMAGE_ONLY_MODEL.is_match(model_id)
            || IMAGE_ONLY_MODEL.is_match(name);
        let advertises = modalities.is_some_and(|m| m.iter().any(|m| m == MODALITY_IMAGE));
        let generates_images =
            image_only || advertises || IMAGE_CAPABLE_MODEL.is_match(model_id) || IMAGE_CAPABLE_MODEL.is_match(name);

        Self {
            generates_images,
            image_only,
        }
    }
}

/// Builds the streaming payload for one (model, run).
#[must_use]
pub fn compose(input: &ComposeInput<'_>) -> CompletionRequest {
    let defaults = input.defaults;
    let params = input.parameters.cloned().unwrap_or_default();

    let modalities = resolve_modalities(input.model_id, &params, input.model_info);
    let capability = ImageCapability::detect(input.model_id, input.model_info, modalities.as_deref());
    let modalities = modalities.or_else(|| {
        capability.generates_images.then(|| {
            if capability.image_only {
                vec![MODALITY_IMAGE.to_string()]
            } else {
                vec![MODALITY_IMAGE.to_string(), MODALITY_TEXT.to_string()]
            }
        })
    });

    let mut request = CompletionRequest {
        model: input.model_id.to_string(),
        messages: compose_messages(input),
        stream: true,
        modalities,
        reasoning: defaults.reasoning_hint().map(|effort| ReasoningConfig { effort }),
        temperature: None,
        top_p: None,
        top_k: None,
        frequency_penalty: None,
        presence_penalty: None,
        repetition_penalty: None,
        max_tokens: params.max_tokens,
        response_format: None,
        image_config: None,
        usage: UsageOptions { include: true },
    };

    let allow_sampling = !capability.image_only || params.max_tokens.is_some();
    if allow_sampling {
        request.temperature = params.temperature.or(defaults.temperature);
        request.top_p = params.top_p;
        request.top_k = params.top_k;
        request.frequency_penalty = params.frequency_penalty;
        request.presence_penalty = params.presence_penalty;
        request.repetition_penalty = params.repetition_penalty;
    }

    let output_format = defaults
        .output_format
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty());

    if capability.generates_images {
        let config = ImageConfig {
            aspect_ratio: defaults.image_aspect_ratio.clone(),
            image_size: defaults.image_size.clone(),
            output_format: output_format.map(str::to_string),
        };
        request.image_config = (!config.is_empty()).then_some(config);
    } else if output_format.is_some_and(|f| f.eq_ignore_ascii_case("json")) {
        request.response_format = Some(ResponseFormat {
            kind: "json_object".to_string(),
        });
    }

    request
}

fn resolve_modalities(
    model_id: &str,
    params: &ModelParameters,
    info: Option<&ModelInfo>,
) -> Option<Vec<String>> {
    if let Some(explicit) = params.modalities.clone().filter(|m| !m.is_empty()) {
        return Some(explicit);
    }
    let advertised = info
        .map(|info| info.output_modalities.clone())
        .filter(|m| !m.is_empty());
    if advertised.is_none() {
        tracing::trace!(model_id, "no modality metadata, inferring from model id");
    }
    advertised
}

fn compose_messages(input: &ComposeInput<'_>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(input.history.len() + 1);

    if let Some(system) = input
        .defaults
        .system_message
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        messages.push(ChatMessage {
            role: MessageRole::System,
            content: ChatContent::Text(system.to_string()),
        });
    }

    messages.extend(
        input
            .history
            .iter()
            .filter(|message| message.visible_to_run(input.run_index))
            .filter(|message| !matches!(message.status, MessageStatus::Streaming | MessageStatus::Error))
            .filter(|message| message.role != MessageRole::Assistant || carries_output(message, input.images))
            .map(|message| to_chat_message(message, input.images)),
    );

    messages
}

/// An assistant turn is worth replaying when it has text or at least one
/// image that can be sent back.
fn carries_output(message: &Message, images: &HashMap<String, ImageAsset>) -> bool {
    !message.content.trim().is_empty() || message.image_ids.iter().any(|id| images.contains_key(id))
}

fn to_chat_message(message: &Message, images: &HashMap<String, ImageAsset>) -> ChatMessage {
    let attached: Vec<&ImageAsset> = match message.role {
        MessageRole::User | MessageRole::Assistant => {
            message.image_ids.iter().filter_map(|id| images.get(id)).collect()
        }
        MessageRole::System | MessageRole::Tool => Vec::new(),
    };

    let content = if attached.is_empty() {
        ChatContent::Text(message.content.clone())
    } else {
        let mut parts = Vec::with_capacity(attached.len() + 1);
        if !message.content.trim().is_empty() {
            parts.push(ContentPart::Text {
                text: message.content.clone(),
            });
        }
        parts.extend(attached.into_iter().map(|asset| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: asset.to_data_uri(),
            },
        }));
        ChatContent::Parts(parts)
    };

    ChatMessage {
        role: message.role,
        content,
    }
}
