//! Token usage accounting and cost estimation
//!
//! Prices are USD per million tokens. Dividing by `PRICE_UNIT_SCALE`
//! (10 000) yields the estimate in US cents, rounded to three decimals.
//! The estimate is informational only and never enforced.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Divisor turning `tokens × price-per-million` into cents
pub const PRICE_UNIT_SCALE: f64 = 10_000.0;

/// Input and output token prices for one model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl ModelPrice {
    pub const FREE: ModelPrice = ModelPrice { input: 0.0, output: 0.0 };
}

/// Static price table shared by every session
const PRICE_TABLE: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", ModelPrice { input: 0.15, output: 0.6 }),
    ("gpt-4o", ModelPrice { input: 2.5, output: 10.0 }),
    ("deepseek-chat", ModelPrice { input: 0.14, output: 0.28 }),
];

/// Look up the price of a model by identifier
pub fn price_for(model: &str) -> Option<ModelPrice> {
    PRICE_TABLE
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, price)| *price)
}

/// Token counts reported by the provider for one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// Accumulated usage of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Estimated cost in US cents
    pub cost: f64,
}

impl std::fmt::Display for UsageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "input={} output={} cost={:.3}",
            self.input_tokens, self.output_tokens, self.cost
        )
    }
}

/// Running token totals for one task-solving session
#[derive(Debug, Clone)]
pub struct UsageLedger {
    price: ModelPrice,
    input_tokens: u64,
    output_tokens: u64,
}

impl UsageLedger {
    pub fn new(price: ModelPrice) -> Self {
        Self {
            price,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Ledger priced from the static table; unknown models cost nothing
    pub fn for_model(model: &str) -> Self {
        let price = price_for(model).unwrap_or_else(|| {
            warn!(model, "No price known for model, cost estimates will be zero");
            ModelPrice::FREE
        });
        Self::new(price)
    }

    /// Add the usage of one completion call
    pub fn record(&mut self, usage: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(usage.prompt_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.completion_tokens);
    }

    pub fn reset(&mut self) {
        self.input_tokens = 0;
        self.output_tokens = 0;
    }

    pub fn snapshot(&self) -> UsageRecord {
        UsageRecord {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost: estimate_cost(self.price, self.input_tokens, self.output_tokens),
        }
    }
}

/// Cost in cents, rounded to three decimals
pub fn estimate_cost(price: ModelPrice, input_tokens: u64, output_tokens: u64) -> f64 {
    let raw = (input_tokens as f64 * price.input + output_tokens as f64 * price.output)
        / PRICE_UNIT_SCALE;
    (raw * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_accumulates_two_calls() {
        let mut ledger = UsageLedger::for_model("gpt-4o-mini");
        ledger.record(TokenUsage::new(120_000, 30_000));
        ledger.record(TokenUsage::new(80_000, 20_000));

        let usage = ledger.snapshot();
        assert_eq!(usage.input_tokens, 200_000);
        assert_eq!(usage.output_tokens, 50_000);
        // (200k * 0.15 + 50k * 0.6) / 1e4
        assert_eq!(usage.cost, 6.0);
    }

    #[test]
    fn test_cost_rounds_to_three_decimals() {
        let price = price_for("deepseek-chat").unwrap();
        let cost = estimate_cost(price, 1234, 567);
        let expected = ((1234.0 * 0.14 + 567.0 * 0.28) / 10_000.0 * 1000.0_f64).round() / 1000.0;
        assert_eq!(cost, expected);
        assert_eq!(cost, 0.033);
    }

    #[test]
    fn test_unknown_model_is_free() {
        let mut ledger = UsageLedger::for_model("some-local-model");
        ledger.record(TokenUsage::new(500, 500));
        assert_eq!(ledger.snapshot().cost, 0.0);
        assert_eq!(ledger.snapshot().input_tokens, 500);
    }

    #[test]
    fn test_reset_clears_totals() {
        let mut ledger = UsageLedger::for_model("gpt-4o");
        ledger.record(TokenUsage::new(10, 10));
        ledger.reset();
        assert_eq!(ledger.snapshot(), UsageRecord::default());
    }
}
