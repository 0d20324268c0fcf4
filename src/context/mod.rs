//! Conversation context under a token budget
//!
//! Messages, a heuristic cost model, and the compression engine that keeps
//! research conversations inside the model's context window.

pub mod manager;
pub mod models;
pub mod summarizer;
pub mod token_estimator;

pub use manager::{ContextManager, COMPRESSION_FAILED_MARKER, MAX_BLOCK_MESSAGES};
pub use models::{Message, MessageMetadata, Role, ToolCall};
pub use summarizer::{LlmSummarizer, Summarizer, SummarizerError};
pub use token_estimator::{CharClassEstimator, TokenEstimator, TOOL_CALL_OVERHEAD};
