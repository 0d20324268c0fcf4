//! Conversation context compression
//!
//! When a history exceeds the token budget, the leading messages are kept
//! verbatim (truncating the first one that no longer fits), tool output is
//! dropped, and the remaining user/assistant dialogue is summarized in
//! blocks of up to four messages. Summaries run concurrently and a failed
//! block degrades to a placeholder, so compression itself never fails.

use super::models::{Message, Role};
use super::summarizer::Summarizer;
use super::token_estimator::TokenEstimator;
use crate::config::ContextConfig;
use crate::metrics::METRICS;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Messages per dialogue block (two user/assistant rounds)
pub const MAX_BLOCK_MESSAGES: usize = 4;

/// Prefix of the placeholder left behind by a failed block summary
pub const COMPRESSION_FAILED_MARKER: &str = "[压缩失败]";

/// Characters of the block's first message kept in a placeholder
const PLACEHOLDER_CHARS: usize = 100;

/// Piece of the history after partitioning
#[derive(Debug)]
enum Segment {
    /// Passed through unchanged
    Keep(Message),
    /// Two or more dialogue messages to summarize together
    Block(Vec<Message>),
}

/// Bounds conversation history to a token budget
pub struct ContextManager {
    config: ContextConfig,
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextManager {
    pub fn new(
        config: ContextConfig,
        estimator: Arc<dyn TokenEstimator>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            config,
            estimator,
            summarizer,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.config.max_tokens
    }

    pub fn total_cost(&self, history: &[Message]) -> usize {
        self.estimator.history_cost(history)
    }

    pub fn is_over_limit(&self, history: &[Message]) -> bool {
        self.total_cost(history) > self.config.max_tokens
    }

    /// Compress `history` to the budget; returns it unchanged when it already fits
    pub async fn compress(&self, history: Vec<Message>) -> Vec<Message> {
        let before = self.total_cost(&history);
        if before <= self.config.max_tokens {
            return history;
        }

        let total = history.len();
        let (prefix, remainder) = match self.split_prefix(history) {
            PrefixSplit::Truncated(prefix) => (prefix, Vec::new()),
            PrefixSplit::Kept { prefix, remainder } => (prefix, remainder),
        };

        let prefix_cost = self.total_cost(&prefix);
        let summarized = self.summarize_remainder(remainder).await;

        let mut compressed = prefix;
        if prefix_cost + self.total_cost(&summarized) >= before {
            // Summaries did not reduce the cost; cut the pass-through tail instead.
            let available = self.config.max_tokens.saturating_sub(prefix_cost);
            compressed.extend(self.fit_tail(summarized, available));
        } else {
            compressed.extend(summarized);
        }

        let after = self.total_cost(&compressed);
        METRICS.record_compression(before, after);
        info!(
            "Context compressed: {} messages / {} tokens -> {} messages / {} tokens",
            total,
            before,
            compressed.len(),
            after
        );

        compressed
    }

    /// Walk the first `prestore_count` messages against the budget
    fn split_prefix(&self, history: Vec<Message>) -> PrefixSplit {
        let mut available = self.config.max_tokens as i64;
        let mut prefix = Vec::new();
        let mut messages = history.into_iter();

        while prefix.len() < self.config.prestore_count && available > 0 {
            let Some(message) = messages.next() else {
                break;
            };

            let cost = self.estimator.message_cost(&message) as i64;
            if cost <= available {
                available -= cost;
                prefix.push(message);
            } else {
                debug!(
                    "Prefix message does not fit ({} > {}), truncating",
                    cost, available
                );
                prefix.push(message.truncated(available as usize));
                return PrefixSplit::Truncated(prefix);
            }
        }

        PrefixSplit::Kept {
            prefix,
            remainder: messages.collect(),
        }
    }

    /// Keep tail messages while they fit `available`; the first that does not is shrunk and ends the tail
    fn fit_tail(&self, tail: Vec<Message>, available: usize) -> Vec<Message> {
        let mut available = available;
        let mut kept = Vec::with_capacity(tail.len());

        for message in tail {
            let cost = self.estimator.message_cost(&message);
            if cost <= available {
                available -= cost;
                kept.push(message);
                continue;
            }

            debug!("Tail message does not fit ({} > {}), truncating", cost, available);
            let mut cut = message.truncated(available);
            while self.estimator.message_cost(&cut) > available && !cut.content.is_empty() {
                let keep = cut.content.chars().count() * 3 / 4;
                cut = cut.truncated(keep);
            }
            kept.push(cut);
            break;
        }

        kept
    }

    async fn summarize_remainder(&self, remainder: Vec<Message>) -> Vec<Message> {
        let input_len = remainder.len();
        let segments = partition(remainder);

        let outputs = join_all(segments.into_iter().map(|segment| async move {
            match segment {
                Segment::Keep(message) => message,
                Segment::Block(block) => self.summarize_block(block).await,
            }
        }))
        .await;

        debug!(
            "Semantic summarization: {} messages -> {} messages",
            input_len,
            outputs.len()
        );
        outputs
    }

    async fn summarize_block(&self, block: Vec<Message>) -> Message {
        let dialogue = render_dialogue(&block);

        match self.summarizer.summarize_dialogue(&dialogue).await {
            Ok(summary) => {
                METRICS.record_block_summary(true);
                let mut message = Message::assistant(summary);
                message.metadata.original_block_size = Some(block.len());
                message
            }
            Err(e) => {
                METRICS.record_block_summary(false);
                warn!("Dialogue block summarization failed: {}", e);
                placeholder(&block)
            }
        }
    }
}

enum PrefixSplit {
    /// A prefix message was cut to the remaining budget; nothing follows it
    Truncated(Vec<Message>),
    Kept {
        prefix: Vec<Message>,
        remainder: Vec<Message>,
    },
}

/// Drop tool output and group consecutive dialogue messages into blocks
fn partition(messages: Vec<Message>) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut block = Vec::new();

    for message in messages {
        match message.role {
            Role::Tool => continue,
            role if role.is_dialogue() => {
                block.push(message);
                if block.len() == MAX_BLOCK_MESSAGES {
                    close_block(&mut segments, &mut block);
                }
            }
            _ => {
                close_block(&mut segments, &mut block);
                segments.push(Segment::Keep(message));
            }
        }
    }
    close_block(&mut segments, &mut block);

    segments
}

fn close_block(segments: &mut Vec<Segment>, block: &mut Vec<Message>) {
    let messages = std::mem::take(block);
    if messages.len() >= 2 {
        segments.push(Segment::Block(messages));
    } else {
        segments.extend(messages.into_iter().map(Segment::Keep));
    }
}

fn render_dialogue(block: &[Message]) -> String {
    block
        .iter()
        .map(|m| format!("{}: {}\n", m.role, m.content))
        .collect()
}

fn placeholder(block: &[Message]) -> Message {
    let head: String = block
        .first()
        .map(|m| m.content.chars().take(PLACEHOLDER_CHARS).collect())
        .unwrap_or_default();
    Message::assistant(format!("{} {}...", COMPRESSION_FAILED_MARKER, head))
}
