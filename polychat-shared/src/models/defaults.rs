//! Default entries layered onto every request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the non-deletable base entry.
pub const COMMON_DEFAULT_ID: &str = "common";

/// Reasoning effort hint forwarded to reasoning-capable models.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    /// Barely any deliberation.
    Minimal,
    /// Short deliberation.
    Low,
    /// Provider default depth.
    Medium,
    /// Longest deliberation.
    High,
}

impl ReasoningEffort {
    /// Wire name of the effort level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional overrides carried by a default entry.
///
/// `None` means "not configured"; `Some(false)` / `Some(0.0)` are explicit
/// values and win over lower layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultOverrides {
    /// System prompt prepended to every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    /// Whether reasoning text is streamed and kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_reasoning: Option<bool>,
    /// Effort hint for reasoning-capable models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Keep only the last generated image of a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_only_last_image: Option<bool>,
    /// Requested response format, e.g. `json_object`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// Aspect ratio hint for image generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_aspect_ratio: Option<String>,
    /// Size hint for image generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
}

impl DefaultOverrides {
    /// Layers `upper` on top of `self`, field by field. Only fields set in
    /// `upper` replace the current value.
    pub fn layer(&mut self, upper: &DefaultOverrides) {
        fn take<T: Clone>(target: &mut Option<T>, source: Option<&T>) {
            if let Some(value) = source {
                *target = Some(value.clone());
            }
        }

        take(&mut self.system_message, upper.system_message.as_ref());
        take(&mut self.stream_reasoning, upper.stream_reasoning.as_ref());
        take(&mut self.reasoning_effort, upper.reasoning_effort.as_ref());
        take(&mut self.temperature, upper.temperature.as_ref());
        take(&mut self.keep_only_last_image, upper.keep_only_last_image.as_ref());
        take(&mut self.output_format, upper.output_format.as_ref());
        take(&mut self.image_aspect_ratio, upper.image_aspect_ratio.as_ref());
        take(&mut self.image_size, upper.image_size.as_ref());
    }

    /// Reasoning and thinking text is kept unless explicitly disabled.
    #[must_use]
    pub fn keeps_reasoning(&self) -> bool {
        self.stream_reasoning != Some(false)
    }

    /// Whether only the final image of a response is stored.
    #[must_use]
    pub fn keep_only_last_image(&self) -> bool {
        self.keep_only_last_image == Some(true)
    }

    /// Effort hint, only when both reasoning streaming and an effort are configured.
    #[must_use]
    pub fn reasoning_hint(&self) -> Option<ReasoningEffort> {
        if self.stream_reasoning == Some(true) {
            self.reasoning_effort
        } else {
            None
        }
    }
}

/// A user-managed default entry matched against model ids by regex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultEntry {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Regular expression tested against the model id; empty matches everything.
    #[serde(default)]
    pub pattern: String,
    /// Values this entry contributes.
    #[serde(default, flatten)]
    pub overrides: DefaultOverrides,
}

impl DefaultEntry {
    /// Creates an entry with no overrides.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pattern: pattern.into(),
            overrides: DefaultOverrides::default(),
        }
    }

    /// The base entry every model starts from.
    #[must_use]
    pub fn common() -> Self {
        Self::new(COMMON_DEFAULT_ID, "Common", "")
    }

    /// Whether this is the base entry.
    #[must_use]
    pub fn is_common(&self) -> bool {
        self.id == COMMON_DEFAULT_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_only_overrides_set_fields() {
        let mut base = DefaultOverrides {
            output_format: Some("png".into()),
            temperature: Some(0.7),
            ..DefaultOverrides::default()
        };
        let upper = DefaultOverrides {
            temperature: Some(0.2),
            stream_reasoning: Some(false),
            ..DefaultOverrides::default()
        };

        base.layer(&upper);

        assert_eq!(base.temperature, Some(0.2));
        assert_eq!(base.output_format.as_deref(), Some("png"));
        assert_eq!(base.stream_reasoning, Some(false));
    }

    #[test]
    fn test_reasoning_flags() {
        let unset = DefaultOverrides::default();
        assert!(unset.keeps_reasoning());
        assert_eq!(unset.reasoning_hint(), None);

        let effort_only = DefaultOverrides {
            reasoning_effort: Some(ReasoningEffort::High),
            ..DefaultOverrides::default()
        };
        assert_eq!(effort_only.reasoning_hint(), None);

        let enabled = DefaultOverrides {
            stream_reasoning: Some(true),
            reasoning_effort: Some(ReasoningEffort::High),
            ..DefaultOverrides::default()
        };
        assert_eq!(enabled.reasoning_hint(), Some(ReasoningEffort::High));

        let disabled = DefaultOverrides {
            stream_reasoning: Some(false),
            ..DefaultOverrides::default()
        };
        assert!(!disabled.keeps_reasoning());
    }

    #[test]
    fn test_entry_deserializes_flattened_overrides() {
        let yaml_like = r#"{"id":"claude","name":"Claude","pattern":"^anthropic/","temperature":0.2}"#;
        let entry: DefaultEntry = serde_json::from_str(yaml_like).unwrap();

        assert_eq!(entry.overrides.temperature, Some(0.2));
        assert!(!entry.is_common());
        assert!(DefaultEntry::common().is_common());
    }
}
