//! Token estimation, truncation and budget accounting.
//!
//! Token counts are approximated from character counts (four characters per
//! token), which is conservative for English text and, more importantly,
//! deterministic: the same text always yields the same count.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Characters-per-token approximation.
pub const CHARS_PER_TOKEN: usize = 4;

/// Marker appended (or prepended) when text is cut to fit a budget.
pub const TRUNCATION_MARKER: &str = " [truncated]";

/// Model used for pricing when a model is not in the rate table.
pub const DEFAULT_PRICING_MODEL: &str = "gpt-4o";

/// USD cost per 1,000 tokens (input, output).
const MODEL_COSTS: &[(&str, f64, f64)] = &[
    ("gpt-4o", 0.005, 0.015),
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-3.5-turbo", 0.0005, 0.0015),
];

/// Context-window limits in tokens.
const MODEL_CONTEXT_LIMITS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-3.5-turbo", 16_385),
];

const DEFAULT_CONTEXT_LIMIT: usize = 128_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token budget exhausted")]
    BudgetExhausted,
}

/// Which end of an oversized text is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationPolicy {
    /// Keep the beginning, drop the end.
    #[default]
    Tail,
    /// Keep the end, drop the beginning.
    Head,
}

/// Estimate the token count of `text`.
pub fn estimate(text: &str) -> usize {
    (text.chars().count() / CHARS_PER_TOKEN).max(1)
}

/// Estimate the USD cost of one call.
pub fn estimate_cost(input_tokens: usize, output_tokens: usize, model: &str) -> f64 {
    let (input_rate, output_rate) = MODEL_COSTS
        .iter()
        .find(|(name, _, _)| *name == model)
        .or_else(|| {
            MODEL_COSTS
                .iter()
                .find(|(name, _, _)| *name == DEFAULT_PRICING_MODEL)
        })
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or((0.0, 0.0));

    let cost = (input_tokens as f64 / 1000.0) * input_rate
        + (output_tokens as f64 / 1000.0) * output_rate;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

/// Context-window limit of a model.
pub fn context_limit(model: &str) -> usize {
    MODEL_CONTEXT_LIMITS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
}

/// Text cut down to fit a budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fitted {
    pub text: String,
    pub tokens: usize,
    pub truncated: bool,
}

/// Fit `text` into `remaining` tokens.
///
/// Oversized input is truncated per `policy` with [`TRUNCATION_MARKER`]; it is
/// never an error. Fails only when there is no budget left at all.
pub fn fit_to_budget(
    text: &str,
    remaining: usize,
    policy: TruncationPolicy,
) -> Result<Fitted, TokenError> {
    if remaining == 0 {
        return Err(TokenError::BudgetExhausted);
    }

    let tokens = estimate(text);
    if tokens <= remaining {
        return Ok(Fitted {
            text: text.to_string(),
            tokens,
            truncated: false,
        });
    }

    let max_chars = remaining * CHARS_PER_TOKEN;
    let marker_chars = TRUNCATION_MARKER.chars().count();
    // When the marker alone would not fit, cut without it.
    let (keep, marker) = if max_chars > marker_chars * 2 {
        (max_chars - marker_chars, TRUNCATION_MARKER)
    } else {
        (max_chars, "")
    };

    let fitted = match policy {
        TruncationPolicy::Tail => {
            let head: String = text.chars().take(keep).collect();
            format!("{}{}", head, marker)
        }
        TruncationPolicy::Head => {
            let total = text.chars().count();
            let tail: String = text.chars().skip(total - keep).collect();
            format!("{}{}", marker.trim_start(), tail)
        }
    };

    let fitted_tokens = estimate(&fitted);
    debug!(
        original = tokens,
        fitted = fitted_tokens,
        remaining,
        "Truncated text to fit budget"
    );

    Ok(Fitted {
        text: fitted,
        tokens: fitted_tokens,
        truncated: true,
    })
}

/// Token and cost ceiling for one chain run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Model used for pricing and context-window limits.
    pub model: String,
    /// Total tokens (input + output) the chain may consume.
    pub max_tokens: usize,
    /// Maximum output tokens requested per stage.
    pub max_output_tokens: usize,
    /// Optional USD ceiling for the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            model: DEFAULT_PRICING_MODEL.to_string(),
            max_tokens: 16_000,
            max_output_tokens: 1024,
            max_cost_usd: None,
        }
    }
}

/// Usage of one stage call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub stage: String,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost_usd: f64,
    pub truncated: bool,
}

/// Aggregated usage across a chain run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_input_tokens: usize,
    pub total_output_tokens: usize,
    pub total_tokens: usize,
    pub total_cost_usd: f64,
    pub records: Vec<TokenUsageRecord>,
}

/// Per-run budget tracker.
///
/// One instance per chain run. Tracks what has been consumed so far and
/// gates every prompt through [`fit_to_budget`].
#[derive(Debug, Clone)]
pub struct TokenOptimizer {
    budget: TokenBudget,
    policy: TruncationPolicy,
    records: Vec<TokenUsageRecord>,
    used_tokens: usize,
    used_cost: f64,
}

/// A prompt cleared for sending, with the output allowance that goes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPrompt {
    pub prompt: String,
    pub input_tokens: usize,
    pub max_output_tokens: usize,
    pub truncated: bool,
}

impl TokenOptimizer {
    pub fn new(budget: TokenBudget, policy: TruncationPolicy) -> Self {
        Self {
            budget,
            policy,
            records: Vec::new(),
            used_tokens: 0,
            used_cost: 0.0,
        }
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn used_tokens(&self) -> usize {
        self.used_tokens
    }

    pub fn remaining_tokens(&self) -> usize {
        self.budget.max_tokens.saturating_sub(self.used_tokens)
    }

    /// Remaining USD budget, if a cost ceiling is set.
    pub fn remaining_cost(&self) -> Option<f64> {
        self.budget
            .max_cost_usd
            .map(|max| (max - self.used_cost).max(0.0))
    }

    /// Fit a prompt into what is left of the budget.
    ///
    /// Input gets at most the remaining budget minus an output reserve (half of
    /// what is left, capped at `max_output_tokens`) and never more than the
    /// model's context window. Returns `BudgetExhausted` when nothing is left,
    /// or when the projected cost would exceed the remaining cost budget.
    pub fn prepare(&self, stage: &str, prompt: &str) -> Result<PreparedPrompt, TokenError> {
        let remaining = self.remaining_tokens();
        if remaining < 2 {
            return Err(TokenError::BudgetExhausted);
        }

        let reserve = (remaining / 2).min(self.budget.max_output_tokens).max(1);
        let input_limit = (remaining - reserve).min(context_limit(&self.budget.model));
        let fitted = fit_to_budget(prompt, input_limit, self.policy)?;
        if fitted.truncated {
            warn!(
                stage,
                tokens = fitted.tokens,
                limit = input_limit,
                "Prompt truncated to fit token budget"
            );
        }

        let max_output_tokens = (remaining - fitted.tokens).min(self.budget.max_output_tokens);

        if let Some(remaining_cost) = self.remaining_cost() {
            let projected = estimate_cost(fitted.tokens, max_output_tokens, &self.budget.model);
            if projected > remaining_cost {
                warn!(
                    stage,
                    projected, remaining_cost, "Projected stage cost exceeds remaining budget"
                );
                return Err(TokenError::BudgetExhausted);
            }
        }

        Ok(PreparedPrompt {
            prompt: fitted.text,
            input_tokens: fitted.tokens,
            max_output_tokens,
            truncated: fitted.truncated,
        })
    }

    /// Record a completed call and return the tokens it consumed.
    ///
    /// Output is clamped to the allowance handed out by [`prepare`], so the
    /// running total can never pass `max_tokens`.
    ///
    /// [`prepare`]: TokenOptimizer::prepare
    pub fn record(
        &mut self,
        stage: &str,
        prepared: &PreparedPrompt,
        output_tokens: usize,
        billable: bool,
    ) -> usize {
        let output_tokens = output_tokens.min(prepared.max_output_tokens);
        let cost_usd = if billable {
            estimate_cost(prepared.input_tokens, output_tokens, &self.budget.model)
        } else {
            0.0
        };
        let consumed = prepared.input_tokens + output_tokens;

        self.used_tokens += consumed;
        self.used_cost += cost_usd;
        self.records.push(TokenUsageRecord {
            stage: stage.to_string(),
            model: self.budget.model.clone(),
            input_tokens: prepared.input_tokens,
            output_tokens,
            cost_usd,
            truncated: prepared.truncated,
        });

        debug!(
            stage,
            input = prepared.input_tokens,
            output = output_tokens,
            cost_usd,
            "Recorded stage usage"
        );
        consumed
    }

    pub fn summary(&self) -> UsageSummary {
        let total_input_tokens = self.records.iter().map(|r| r.input_tokens).sum();
        let total_output_tokens = self.records.iter().map(|r| r.output_tokens).sum();
        let total_cost_usd = self.records.iter().map(|r| r.cost_usd).sum::<f64>();
        UsageSummary {
            total_input_tokens,
            total_output_tokens,
            total_tokens: total_input_tokens + total_output_tokens,
            total_cost_usd: (total_cost_usd * 1_000_000.0).round() / 1_000_000.0,
            records: self.records.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_deterministic() {
        let text = "Subscribers grew steadily over the last thirty days.";
        assert_eq!(estimate(text), estimate(text));
        assert_eq!(estimate("abcdefgh"), 2);
        assert_eq!(estimate(""), 1);
    }

    #[test]
    fn test_estimate_cost_known_and_unknown_model() {
        assert_eq!(estimate_cost(1000, 1000, "gpt-4o"), 0.02);
        assert_eq!(
            estimate_cost(1000, 1000, "mystery-model"),
            estimate_cost(1000, 1000, "gpt-4o")
        );
        assert!(estimate_cost(1000, 1000, "gpt-4o-mini") < 0.001);
    }

    #[test]
    fn test_fit_within_budget_untouched() {
        let fitted = fit_to_budget("short text", 100, TruncationPolicy::Tail).unwrap();
        assert_eq!(fitted.text, "short text");
        assert!(!fitted.truncated);
    }

    #[test]
    fn test_fit_tail_truncation_keeps_head() {
        let text = "a".repeat(400) + &"z".repeat(400);
        let fitted = fit_to_budget(&text, 50, TruncationPolicy::Tail).unwrap();
        assert!(fitted.truncated);
        assert!(fitted.tokens <= 50);
        assert!(fitted.text.starts_with('a'));
        assert!(fitted.text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_fit_head_truncation_keeps_tail() {
        let text = "a".repeat(400) + &"z".repeat(400);
        let fitted = fit_to_budget(&text, 50, TruncationPolicy::Head).unwrap();
        assert!(fitted.truncated);
        assert!(fitted.tokens <= 50);
        assert!(fitted.text.starts_with("[truncated]"));
        assert!(fitted.text.ends_with('z'));
    }

    #[test]
    fn test_fit_tiny_budget_drops_marker() {
        let fitted = fit_to_budget(&"x".repeat(100), 2, TruncationPolicy::Tail).unwrap();
        assert_eq!(fitted.text, "xxxxxxxx");
        assert!(fitted.tokens <= 2);
    }

    #[test]
    fn test_fit_zero_budget_is_exhausted() {
        assert_eq!(
            fit_to_budget("anything", 0, TruncationPolicy::Tail),
            Err(TokenError::BudgetExhausted)
        );
    }

    #[test]
    fn test_fit_multibyte_text() {
        let text = "é".repeat(200);
        let fitted = fit_to_budget(&text, 10, TruncationPolicy::Tail).unwrap();
        assert!(fitted.tokens <= 10);
    }

    #[test]
    fn test_optimizer_never_exceeds_budget() {
        let budget = TokenBudget {
            max_tokens: 300,
            max_output_tokens: 100,
            ..TokenBudget::default()
        };
        let mut optimizer = TokenOptimizer::new(budget, TruncationPolicy::Tail);
        let prompt = "p".repeat(2000);

        while let Ok(prepared) = optimizer.prepare("trend", &prompt) {
            // Pretend the model ignored max_tokens and rambled.
            optimizer.record("trend", &prepared, 10_000, true);
        }

        assert!(optimizer.used_tokens() <= 300);
        assert_eq!(optimizer.summary().total_tokens, optimizer.used_tokens());
    }

    #[test]
    fn test_optimizer_cost_ceiling() {
        let budget = TokenBudget {
            max_tokens: 100_000,
            max_output_tokens: 2000,
            max_cost_usd: Some(0.0001),
            ..TokenBudget::default()
        };
        let optimizer = TokenOptimizer::new(budget, TruncationPolicy::Tail);
        assert_eq!(
            optimizer.prepare("trend", &"p".repeat(4000)),
            Err(TokenError::BudgetExhausted)
        );
    }

    #[test]
    fn test_unbilled_usage_costs_nothing() {
        let mut optimizer = TokenOptimizer::new(TokenBudget::default(), TruncationPolicy::Tail);
        let prepared = optimizer.prepare("trend", "hello world prompt").unwrap();
        let consumed = optimizer.record("trend", &prepared, 20, false);
        assert_eq!(consumed, prepared.input_tokens + 20);
        assert_eq!(optimizer.summary().total_cost_usd, 0.0);
    }
}
