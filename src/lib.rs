//! Deep research service
//!
//! A topic is triaged by a coordinator model: simple requests are answered
//! directly, complex ones get a multi-step research plan that waits for
//! human confirmation before the steps are researched in parallel and
//! merged into a single report. Conversation context is kept under a
//! token budget by summarizing older dialogue blocks.

pub mod api;
pub mod breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod prompts;
pub mod research;
pub mod search;
pub mod telemetry;

pub use crate::config::Config;
pub use crate::error::{ResearchError, Result};
pub use crate::research::{Confirmation, ResearchOrchestrator, SessionStatus, StartRequest};
