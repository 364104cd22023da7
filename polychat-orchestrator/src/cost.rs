//! # Cost estimation and reconciliation
//!
//! Usage and cost can come from three places that do not always agree: the
//! inline `usage` object of the stream, the generation lookup endpoint, and
//! a local estimate from the pricing table. [`CostReconciler`] merges them
//! after a run and verifies the streamed cost when an independent lookup is
//! available.

use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;
use shared::{config::ModelPricing, models::TokenUsage};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{decoder::UsageReport, errors::OrchestratorResult};

/// Local estimate: prompt and completion tokens at their rates plus the flat
/// request price and the per-image price.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn estimate_cost(pricing: &ModelPricing, usage: &TokenUsage, images: usize) -> f64 {
    pricing.prompt * usage.prompt_tokens as f64
        + pricing.completion * usage.completion_tokens as f64
        + pricing.request
        + pricing.image * images as f64
}

/// Body of the generation lookup endpoint (`data` object).
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct GenerationUsage {
    /// Billed cost in credits.
    #[serde(default)]
    pub total_cost: Option<f64>,
    /// Prompt tokens counted by the provider.
    #[serde(default)]
    pub tokens_prompt: Option<u64>,
    /// Completion tokens counted by the provider.
    #[serde(default)]
    pub tokens_completion: Option<u64>,
}

/// Generation lookup by provider request id.
#[async_trait]
pub trait UsageLookup: Send + Sync {
    /// `Ok(None)` while the provider has not recorded the generation yet.
    async fn lookup(&self, request_id: &str) -> OrchestratorResult<Option<GenerationUsage>>;
}

/// Where the final cost of a run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostSource {
    /// Inline `usage` object of the stream.
    Stream,
    /// Generation lookup endpoint.
    Lookup,
    /// Local pricing table.
    Estimate,
    /// No source was available.
    Unknown,
}

impl CostSource {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Lookup => "lookup",
            Self::Estimate => "estimate",
            Self::Unknown => "unknown",
        }
    }
}

/// Outcome of comparing the streamed cost with the looked-up cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CostVerification {
    /// Both costs agree within the tolerance.
    Match {
        /// Cost from the stream.
        streamed: f64,
        /// Cost from the lookup.
        looked_up: f64,
    },
    /// The costs differ by more than the tolerance.
    Mismatch {
        /// Cost from the stream.
        streamed: f64,
        /// Cost from the lookup.
        looked_up: f64,
    },
}

impl CostVerification {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Match { .. } => "match",
            Self::Mismatch { .. } => "mismatch",
        }
    }
}

/// Everything known about a finished run's usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileInput<'a> {
    /// Inline usage seen on the stream.
    pub streamed: Option<UsageReport>,
    /// Provider request id for the generation lookup.
    pub request_id: Option<&'a str>,
    /// Catalog pricing for the local estimate.
    pub pricing: Option<&'a ModelPricing>,
    /// Images stored for the run.
    pub image_count: usize,
}

/// Final usage and cost of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Token counts.
    pub usage: TokenUsage,
    /// Cost in credits, when any source knew it.
    pub cost: Option<f64>,
    /// Where `cost` came from.
    pub source: CostSource,
    /// Streamed versus looked-up comparison, when both exist.
    pub verification: Option<CostVerification>,
}

/// Merges usage sources after a run, retrying the lookup with backoff.
#[derive(Clone)]
pub struct CostReconciler {
    lookup: Option<Arc<dyn UsageLookup>>,
    attempts: u32,
    base_delay: Duration,
    tolerance: f64,
}

impl std::fmt::Debug for CostReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostReconciler")
            .field("lookup", &self.lookup.is_some())
            .field("attempts", &self.attempts)
            .field("base_delay", &self.base_delay)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl CostReconciler {
    /// `attempts` is clamped to at least one lookup.
    #[must_use]
    pub fn new(
        lookup: Option<Arc<dyn UsageLookup>>,
        attempts: u32,
        base_delay: Duration,
        tolerance: f64,
    ) -> Self {
        Self {
            lookup,
            attempts: attempts.max(1),
            base_delay,
            tolerance,
        }
    }

    /// Merges usage from the stream, the lookup endpoint and the local
    /// estimate. Never fails: a missing lookup only degrades the source.
    pub async fn reconcile(&self, input: ReconcileInput<'_>, cancel: &CancellationToken) -> Reconciliation {
        let streamed = input.streamed.unwrap_or_default();
        let looked_up = match input.request_id {
            Some(request_id) => self.lookup_with_backoff(request_id, cancel).await,
            None => None,
        };

        let usage = TokenUsage::new(
            streamed
                .prompt_tokens
                .or_else(|| looked_up.and_then(|u| u.tokens_prompt))
                .unwrap_or(0),
            streamed
                .completion_tokens
                .or_else(|| looked_up.and_then(|u| u.tokens_completion))
                .unwrap_or(0),
        );

        let lookup_cost = looked_up.and_then(|u| u.total_cost);
        let (cost, source) = match (streamed.cost, lookup_cost, input.pricing) {
            (Some(cost), _, _) => (Some(cost), CostSource::Stream),
            (None, Some(cost), _) => (Some(cost), CostSource::Lookup),
            (None, None, Some(pricing)) => (
                Some(estimate_cost(pricing, &usage, input.image_count)),
                CostSource::Estimate,
            ),
            (None, None, None) => (None, CostSource::Unknown),
        };

        let verification = match (streamed.cost, lookup_cost) {
            (Some(streamed), Some(looked_up)) => Some(self.verify(streamed, looked_up)),
            _ => None,
        };

        debug!(source = source.as_str(), ?cost, "reconciled run cost");
        Reconciliation {
            usage,
            cost,
            source,
            verification,
        }
    }

    fn verify(&self, streamed: f64, looked_up: f64) -> CostVerification {
        let verification = if (streamed - looked_up).abs() <= self.tolerance {
            CostVerification::Match { streamed, looked_up }
        } else {
            CostVerification::Mismatch { streamed, looked_up }
        };

        counter!("polychat_cost_verifications_total", "outcome" => verification.outcome()).increment(1);
        match verification {
            CostVerification::Match { .. } => info!(streamed, looked_up, "cost verified"),
            CostVerification::Mismatch { .. } => {
                warn!(streamed, looked_up, "streamed cost disagrees with generation lookup");
            }
        }
        verification
    }

    async fn lookup_with_backoff(
        &self,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Option<GenerationUsage> {
        let lookup = self.lookup.as_ref()?;
        let mut delay = self.base_delay;

        for attempt in 1..=self.attempts {
            match lookup.lookup(request_id).await {
                Ok(Some(usage)) => return Some(usage),
                Ok(None) => debug!(request_id, attempt, "generation not available yet"),
                Err(err) => warn!(request_id, attempt, error = %err, "generation lookup failed"),
            }

            if attempt == self.attempts {
                break;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            delay = delay.saturating_mul(2);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedLookup {
        ready_after: u32,
        calls: AtomicU32,
        usage: GenerationUsage,
    }

    #[async_trait]
    impl UsageLookup for ScriptedLookup {
        async fn lookup(&self, _request_id: &str) -> OrchestratorResult<Option<GenerationUsage>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((call >= self.ready_after).then_some(self.usage))
        }
    }

    fn reconciler(lookup: Arc<ScriptedLookup>, attempts: u32) -> CostReconciler {
        CostReconciler::new(Some(lookup), attempts, Duration::from_millis(1), 1e-6)
    }

    fn pricing() -> ModelPricing {
        ModelPricing {
            prompt: 0.000_003,
            completion: 0.000_006,
            ..ModelPricing::default()
        }
    }

    #[test]
    fn test_estimate_cost() {
        let cost = estimate_cost(&pricing(), &TokenUsage::new(100, 50), 0);
        assert!((cost - 0.0006).abs() < 1e-12);

        let with_extras = ModelPricing {
            request: 0.01,
            image: 0.04,
            ..pricing()
        };
        let cost = estimate_cost(&with_extras, &TokenUsage::new(100, 50), 2);
        assert!((cost - 0.0906).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_estimate_when_no_other_source() {
        let reconciler = CostReconciler::new(None, 3, Duration::from_millis(1), 1e-6);
        let pricing = pricing();

        let result = reconciler
            .reconcile(
                ReconcileInput {
                    streamed: Some(UsageReport {
                        prompt_tokens: Some(100),
                        completion_tokens: Some(50),
                        cost: None,
                    }),
                    request_id: Some("gen-1"),
                    pricing: Some(&pricing),
                    image_count: 0,
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.source, CostSource::Estimate);
        assert!((result.cost.unwrap() - 0.0006).abs() < 1e-12);
        assert!(result.verification.is_none());
    }

    #[tokio::test]
    async fn test_lookup_retries_until_available() {
        let lookup = Arc::new(ScriptedLookup {
            ready_after: 3,
            calls: AtomicU32::new(0),
            usage: GenerationUsage {
                total_cost: Some(0.002),
                tokens_prompt: Some(7),
                tokens_completion: Some(9),
            },
        });

        let result = reconciler(lookup.clone(), 5)
            .reconcile(
                ReconcileInput {
                    request_id: Some("gen-2"),
                    ..ReconcileInput::default()
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.source, CostSource::Lookup);
        assert_eq!(result.usage, TokenUsage::new(7, 9));
        assert_eq!(result.cost, Some(0.002));
    }

    #[tokio::test]
    async fn test_lookup_gives_up_after_attempts() {
        let lookup = Arc::new(ScriptedLookup {
            ready_after: u32::MAX,
            calls: AtomicU32::new(0),
            usage: GenerationUsage::default(),
        });

        let result = reconciler(lookup.clone(), 2)
            .reconcile(
                ReconcileInput {
                    request_id: Some("gen-3"),
                    ..ReconcileInput::default()
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.source, CostSource::Unknown);
        assert_eq!(result.cost, None);
    }

    #[tokio::test]
    async fn test_cancellation_stops_backoff() {
        let lookup = Arc::new(ScriptedLookup {
            ready_after: u32::MAX,
            calls: AtomicU32::new(0),
            usage: GenerationUsage::default(),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let _ = reconciler(lookup.clone(), 5)
            .reconcile(
                ReconcileInput {
                    request_id: Some("gen-4"),
                    ..ReconcileInput::default()
                },
                &cancel,
            )
            .await;

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_streamed_cost_is_verified() {
        let lookup = Arc::new(ScriptedLookup {
            ready_after: 1,
            calls: AtomicU32::new(0),
            usage: GenerationUsage {
                total_cost: Some(0.001_000_5),
                ..GenerationUsage::default()
            },
        });
        let reconciler = reconciler(lookup, 3);
        let streamed = |cost| ReconcileInput {
            streamed: Some(UsageReport {
                prompt_tokens: Some(1),
                completion_tokens: Some(1),
                cost: Some(cost),
            }),
            request_id: Some("gen-5"),
            ..ReconcileInput::default()
        };

        let matched = reconciler.reconcile(streamed(0.001_000_8), &CancellationToken::new()).await;
        assert_eq!(matched.source, CostSource::Stream);
        assert!(matches!(matched.verification, Some(CostVerification::Match { .. })));

        let mismatched = reconciler.reconcile(streamed(0.002), &CancellationToken::new()).await;
        assert_eq!(mismatched.cost, Some(0.002));
        assert!(matches!(mismatched.verification, Some(CostVerification::Mismatch { .. })));
    }
}
