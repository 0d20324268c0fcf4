//! Heuristic token estimation
//!
//! The estimate deliberately runs high compared to real tokenizers so a
//! history that fits the budget also fits the provider's context window.

use super::models::Message;

/// Flat allowance for tool-call scaffolding the text estimate cannot size
pub const TOOL_CALL_OVERHEAD: usize = 50;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }

    /// Weighted cost of one message, never less than 1
    fn message_cost(&self, message: &Message) -> usize {
        let base = self.estimate(&message.content) + self.estimate(message.role.as_str());
        let mut cost = (base as f64 * message.role.weight()).floor() as usize;

        if !message.metadata.is_empty() {
            let json = serde_json::to_string(&message.metadata).unwrap_or_default();
            cost += self.estimate(&json);
            if message.metadata.has_tool_calls() {
                cost += TOOL_CALL_OVERHEAD;
            }
        }

        cost.max(1)
    }

    /// Sum of message costs
    fn history_cost(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.message_cost(m)).sum()
    }
}

/// Character-class estimator: four ASCII characters per token, one token per other character
#[derive(Debug, Clone, Copy, Default)]
pub struct CharClassEstimator;

impl CharClassEstimator {
    pub fn new() -> Self {
        Self
    }
}

impl TokenEstimator for CharClassEstimator {
    fn estimate(&self, text: &str) -> usize {
        let (ascii, other) = text.chars().fold((0usize, 0usize), |(ascii, other), c| {
            if c.is_ascii() {
                (ascii + 1, other)
            } else {
                (ascii, other + 1)
            }
        });
        ascii / 4 + other
    }
}
