//! Token usage and per-model running totals.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token counts reported for a single completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the request.
    pub prompt_tokens: u64,
    /// Tokens in the answer.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Usage from explicit counts.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Prompt plus completion tokens.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Running usage totals for one model inside one session.
///
/// Rows are created on the first finished run and only ever grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    /// Owning session.
    pub session_id: Uuid,
    /// Model the totals belong to.
    pub model_id: String,
    /// Summed prompt tokens.
    pub input_tokens: u64,
    /// Summed completion tokens.
    pub output_tokens: u64,
    /// Summed cost in credits.
    pub cost: f64,
}

impl ModelStats {
    /// Zeroed totals.
    #[must_use]
    pub fn new(session_id: Uuid, model_id: impl Into<String>) -> Self {
        Self {
            session_id,
            model_id: model_id.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
        }
    }

    /// Adds one run's usage. Negative or non-finite costs are ignored.
    pub fn record(&mut self, usage: TokenUsage, cost: Option<f64>) {
        self.input_tokens = self.input_tokens.saturating_add(usage.prompt_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.completion_tokens);
        if let Some(cost) = cost.filter(|value| value.is_finite() && *value > 0.0) {
            self.cost += cost;
        }
    }
}
