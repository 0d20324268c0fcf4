//! Staged research workflow
//!
//! Coordinator triage, plan generation with human confirmation, parallel
//! step research and serialized report assembly.

pub mod agent;
pub mod links;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod session;
pub mod state;

pub use agent::{AgentError, AgentOutcome, ResearchAgent};
pub use links::{extract_links, ExtractedLinks};
pub use orchestrator::{handoff_to_planner_spec, Collaborators, ResearchOrchestrator, HANDOFF_TO_PLANNER};
pub use pipeline::{DeliveredStep, PipelineOutcome, QueueItem, ResearchPipeline};
pub use plan::{Plan, Step};
pub use session::{InMemorySessionStore, SessionStore};
pub use state::{
    Confirmation, ResearchState, SessionStatus, Stage, StartRequest, StepResult, UserConfirm,
};
