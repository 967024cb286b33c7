//! Token-based cost calculation for synthesis requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ModelPricing;

const DEFAULT_CURRENCY: &str = "USD";

/// Cost breakdown for one synthesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
    pub model_name: String,
    pub timestamp: DateTime<Utc>,
}

impl SynthesisCost {
    #[must_use]
    pub fn exceeds_budget(&self, max_cost: f64) -> bool {
        self.total_cost > max_cost
    }
}

impl fmt::Display for SynthesisCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Synthesis cost: {:.4} {} (input: {} tokens / {:.4} {}, output: {} tokens / {:.4} {})",
            self.total_cost,
            self.currency,
            self.input_tokens,
            self.input_cost,
            self.currency,
            self.output_tokens,
            self.output_cost,
            self.currency
        )
    }
}

/// Prices token usage with a model's per-1000-token rates
#[derive(Debug, Clone, PartialEq)]
pub struct CostTracker {
    input_token_cost: f64,
    output_token_cost: f64,
    currency: String,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self {
            input_token_cost: 0.0,
            output_token_cost: 0.0,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

impl CostTracker {
    /// Build a tracker from optional model pricing. Missing or disabled
    /// pricing yields a tracker that always reports zero cost.
    #[must_use]
    pub fn new(pricing: Option<&ModelPricing>) -> Self {
        match pricing {
            Some(pricing) if pricing.enabled => Self {
                input_token_cost: pricing.input_token_cost,
                output_token_cost: pricing.output_token_cost,
                currency: if pricing.currency.is_empty() {
                    DEFAULT_CURRENCY.to_string()
                } else {
                    pricing.currency.clone()
                },
            },
            _ => Self::default(),
        }
    }

    #[must_use]
    pub fn currency(&self) -> &str {
        &self.currency
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn calculate_cost(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        model_name: &str,
    ) -> SynthesisCost {
        let input_cost = (input_tokens as f64 / 1000.0) * self.input_token_cost;
        let output_cost = (output_tokens as f64 / 1000.0) * self.output_token_cost;

        SynthesisCost {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            currency: self.currency.clone(),
            model_name: model_name.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Price a request before it runs, estimating input tokens from the prompt.
    #[must_use]
    pub fn estimate_cost(
        &self,
        prompt: &str,
        expected_output_tokens: u64,
        model_name: &str,
    ) -> SynthesisCost {
        self.calculate_cost(estimate_tokens(prompt), expected_output_tokens, model_name)
    }
}

/// Rough token count: four bytes per token plus a 10% margin, rounded up.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as f64 / 4.0 * 1.1).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing(enabled: bool) -> ModelPricing {
        ModelPricing {
            enabled,
            input_token_cost: 0.003,
            output_token_cost: 0.015,
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        // 4 bytes -> 1.1 -> 2
        assert_eq!(estimate_tokens("abcd"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(40)), 11);
        assert_eq!(estimate_tokens("abcdefgh"), 3);
    }

    #[test]
    fn test_calculate_cost() {
        let tracker = CostTracker::new(Some(&pricing(true)));
        let cost = tracker.calculate_cost(2000, 1000, "claude-sonnet");

        assert_eq!(cost.total_tokens, 3000);
        assert!((cost.input_cost - 0.006).abs() < 1e-12);
        assert!((cost.output_cost - 0.015).abs() < 1e-12);
        assert!((cost.total_cost - 0.021).abs() < 1e-12);
        assert_eq!(cost.model_name, "claude-sonnet");
        assert!(cost.exceeds_budget(0.02));
        assert!(!cost.exceeds_budget(0.021_000_1));
    }

    #[test]
    fn test_disabled_or_missing_pricing_is_free() {
        for tracker in [CostTracker::new(Some(&pricing(false))), CostTracker::new(None)] {
            let cost = tracker.calculate_cost(10_000, 10_000, "m");
            assert!(cost.total_cost.abs() < f64::EPSILON);
            assert_eq!(cost.currency, "USD");
        }
    }

    #[test]
    fn test_estimate_cost_uses_prompt_length() {
        let tracker = CostTracker::new(Some(&pricing(true)));
        let cost = tracker.estimate_cost(&"x".repeat(4000), 500, "m");
        assert_eq!(cost.input_tokens, 1100);
        assert_eq!(cost.output_tokens, 500);
    }

    #[test]
    fn test_display() {
        let tracker = CostTracker::new(Some(&pricing(true)));
        let cost = tracker.calculate_cost(1000, 1000, "m");
        assert_eq!(
            cost.to_string(),
            "Synthesis cost: 0.0180 USD (input: 1000 tokens / 0.0030 USD, output: 1000 tokens / 0.0150 USD)"
        );
    }
}
