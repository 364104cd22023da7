//! Comparison sessions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Timestamp;

/// A comparison session: one prompt history fanned out to several models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Unique identifier.
    pub id: Uuid,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
    /// Model identifiers in display order.
    pub models: Vec<String>,
    /// Set after the first successful run.
    #[serde(default)]
    pub has_executed: bool,
    /// Number of stored messages.
    #[serde(default)]
    pub message_count: u64,
    /// Tokens used across all runs.
    #[serde(default)]
    pub token_count: u64,
    /// Accumulated cost across all runs.
    #[serde(default)]
    pub total_cost: f64,
}

impl Session {
    /// Creates an empty session comparing `models`.
    #[must_use]
    pub fn new(models: Vec<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            models,
            has_executed: false,
            message_count: 0,
            token_count: 0,
            total_cost: 0.0,
        }
    }

    /// Folds one finished run into the session aggregates.
    pub fn record_run(&mut self, tokens: u64, cost: f64) {
        self.has_executed = true;
        self.token_count = self.token_count.saturating_add(tokens);
        if cost.is_finite() && cost > 0.0 {
            self.total_cost += cost;
        }
        self.updated_at = Timestamp::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_run_marks_executed_and_accumulates() {
        let mut session = Session::new(vec!["a".into(), "b".into()]);
        assert!(!session.has_executed);

        session.record_run(150, 0.0006);
        session.record_run(10, f64::NAN);

        assert!(session.has_executed);
        assert_eq!(session.token_count, 160);
        assert!((session.total_cost - 0.0006).abs() < 1e-12);
    }
}
