//! Research workflow state machine
//!
//! ```text
//! coordinate ──direct answer──────────────────────────────▶ end
//!     │ handoff_to_planner
//!     ▼
//! generate_plan ──▶ human_feedback ──confirm──▶ research ──▶ end
//!     ▲                   │ modify
//!     └───────────────────┘
//! ```
//!
//! `human_feedback` is not an in-memory wait: the state is persisted and
//! the call returns. `resume` reloads it, validates the confirmation
//! against the stored stage and continues from there. State is saved after
//! every transition.

use super::pipeline::ResearchPipeline;
use super::plan::Plan;
use super::session::{InMemorySessionStore, SessionStore};
use super::state::{Confirmation, ResearchState, SessionStatus, Stage, StartRequest, UserConfirm};
use crate::config::{Config, ResearchConfig};
use crate::context::manager::ContextManager;
use crate::context::models::Message;
use crate::context::summarizer::LlmSummarizer;
use crate::context::token_estimator::{CharClassEstimator, TokenEstimator};
use crate::error::{ResearchError, Result};
use crate::llm::{invoke_structured, ChatModel, ChatRequest, LlmError, ModelTurn, OpenAiClient, ToolSpec};
use crate::metrics::METRICS;
use crate::prompts::{PromptRenderer, TemplateRegistry, COORDINATOR, PLANNER};
use crate::search::{CachedSearch, SearchTool, TavilySearch};
use chrono::Local;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capability offered to the coordinator to escalate a request to planning
pub const HANDOFF_TO_PLANNER: &str = "handoff_to_planner";

pub fn handoff_to_planner_spec() -> ToolSpec {
    ToolSpec {
        name: HANDOFF_TO_PLANNER.to_string(),
        description: "Hand the research topic over to the planner".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "research_topic": {
                    "type": "string",
                    "description": "The research topic or user question to hand over"
                },
                "locale": {
                    "type": "string",
                    "description": "The user's language (en-US, zh-CN, ...)"
                }
            },
            "required": ["research_topic", "locale"]
        }),
    }
}

/// Replaceable collaborators of the orchestrator
pub struct Collaborators {
    pub model: Arc<dyn ChatModel>,
    pub search: Arc<dyn SearchTool>,
    pub prompts: Arc<dyn PromptRenderer>,
    pub store: Arc<dyn SessionStore>,
    pub estimator: Arc<dyn TokenEstimator>,
}

impl Collaborators {
    /// Default adapters built from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let model: Arc<dyn ChatModel> = Arc::new(OpenAiClient::new(&config.llm)?);
        let tavily: Arc<dyn SearchTool> = Arc::new(TavilySearch::new(&config.search)?);
        let search: Arc<dyn SearchTool> = Arc::new(CachedSearch::new(
            tavily,
            config.search.cache_capacity,
            config.search.cache_ttl(),
        ));

        Ok(Self {
            model,
            search,
            prompts: Arc::new(TemplateRegistry::new()?),
            store: Arc::new(InMemorySessionStore::new()),
            estimator: Arc::new(CharClassEstimator),
        })
    }
}

/// Removes the session from the in-flight table when dropped
struct FlightGuard {
    session_id: Uuid,
    token: CancellationToken,
    in_flight: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.session_id);
    }
}

pub struct ResearchOrchestrator {
    model: Arc<dyn ChatModel>,
    prompts: Arc<dyn PromptRenderer>,
    store: Arc<dyn SessionStore>,
    context: Arc<ContextManager>,
    pipeline: ResearchPipeline,
    config: ResearchConfig,
    in_flight: Arc<DashMap<Uuid, CancellationToken>>,
}

impl ResearchOrchestrator {
    pub fn new(collaborators: Collaborators, config: &Config) -> Self {
        let summarizer = Arc::new(LlmSummarizer::new(
            collaborators.model.clone(),
            collaborators.prompts.clone(),
            config.context.summarize_timeout(),
        ));
        let context = Arc::new(ContextManager::new(
            config.context.clone(),
            collaborators.estimator.clone(),
            summarizer,
        ));
        let pipeline = ResearchPipeline::new(
            collaborators.model.clone(),
            collaborators.search.clone(),
            collaborators.prompts.clone(),
            context.clone(),
            config.research.clone(),
        );

        Self {
            model: collaborators.model,
            prompts: collaborators.prompts,
            store: collaborators.store,
            context,
            pipeline,
            config: config.research.clone(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Open a session and run it until it answers directly or proposes a plan
    pub async fn start_session(&self, request: StartRequest) -> Result<SessionStatus> {
        if request.topic.trim().is_empty() {
            return Err(ResearchError::InvalidRequest("topic must not be empty".to_string()));
        }

        let locale = request
            .locale
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.config.default_locale.clone());
        let state = ResearchState::new(request.topic, locale);
        info!(session_id = %state.session_id(), "Starting research session");

        self.store.save(&state).await?;
        let guard = self.begin(state.session_id())?;
        let state = self.drive(state, &guard).await?;
        Ok(SessionStatus::from(&state))
    }

    /// Apply the user's plan decision and run to the next suspension or the end
    pub async fn resume(&self, confirmation: Confirmation) -> Result<SessionStatus> {
        let (state, guard) = self.apply_feedback(confirmation).await?;
        let state = self.drive(state, &guard).await?;
        Ok(SessionStatus::from(&state))
    }

    /// Like [`resume`](Self::resume), but a confirmed plan is researched on a
    /// background task and the returned status is `researching`
    pub async fn resume_detached(self: &Arc<Self>, confirmation: Confirmation) -> Result<SessionStatus> {
        let (state, guard) = self.apply_feedback(confirmation).await?;

        if state.stage() != Stage::Research {
            let state = self.drive(state, &guard).await?;
            return Ok(SessionStatus::from(&state));
        }

        let status = SessionStatus::from(&state);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let session_id = state.session_id();
            if let Err(e) = orchestrator.drive(state, &guard).await {
                error!(session_id = %session_id, "Background research failed: {}", e);
            }
        });
        Ok(status)
    }

    pub async fn status(&self, session_id: Uuid) -> Result<SessionStatus> {
        let state = self.load(session_id).await?;
        Ok(SessionStatus::from(&state))
    }

    /// Cancel a session; a running one stops cooperatively
    pub async fn cancel(&self, session_id: Uuid) -> Result<SessionStatus> {
        let running = self.in_flight.get(&session_id).map(|entry| entry.value().clone());
        if let Some(token) = running {
            info!(session_id = %session_id, "Cancelling running session");
            token.cancel();
            return self.status(session_id).await;
        }

        let mut state = self.load(session_id).await?;
        if state.stage().is_terminal() {
            return Err(ResearchError::InvalidTransition {
                action: "cancel",
                stage: state.stage().to_string(),
            });
        }

        state.mark_cancelled();
        self.store.save(&state).await?;
        METRICS.record_session("cancelled");
        info!(session_id = %session_id, "Session cancelled");
        Ok(SessionStatus::from(&state))
    }

    async fn load(&self, session_id: Uuid) -> Result<ResearchState> {
        self.store
            .load(session_id)
            .await?
            .ok_or(ResearchError::SessionNotFound(session_id))
    }

    fn begin(&self, session_id: Uuid) -> Result<FlightGuard> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(session_id) {
            Entry::Occupied(_) => Err(ResearchError::SessionBusy(session_id)),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(FlightGuard {
                    session_id,
                    token,
                    in_flight: self.in_flight.clone(),
                })
            }
        }
    }

    /// Validate a confirmation against the stored stage and apply it
    async fn apply_feedback(&self, confirmation: Confirmation) -> Result<(ResearchState, FlightGuard)> {
        let session_id = confirmation.session_id;
        let guard = self.begin(session_id)?;
        let mut state = self.load(session_id).await?;

        if state.stage() != Stage::HumanFeedback || state.is_cancelled() {
            return Err(ResearchError::InvalidTransition {
                action: "resume",
                stage: state.stage().to_string(),
            });
        }

        match confirmation.user_confirm.parse::<UserConfirm>()? {
            UserConfirm::Confirm => {
                info!(session_id = %session_id, "Plan confirmed");
                state.set_stage(Stage::Research);
            }
            UserConfirm::Modify => {
                info!(session_id = %session_id, "Plan revision requested");
                match confirmation.message.filter(|m| !m.trim().is_empty()) {
                    Some(feedback) => state.append_message(Message::user(feedback).with_name("feedback")),
                    None => debug!(session_id = %session_id, "Revision without feedback text"),
                }
                state.set_stage(Stage::GeneratePlan);
            }
        }

        state.clear_error();
        self.store.save(&state).await?;
        Ok((state, guard))
    }

    /// Run stages until the session suspends or ends
    async fn drive(&self, mut state: ResearchState, guard: &FlightGuard) -> Result<ResearchState> {
        loop {
            if guard.token.is_cancelled() && !state.stage().is_terminal() {
                state.mark_cancelled();
                self.store.save(&state).await?;
                METRICS.record_session("cancelled");
                return Ok(state);
            }

            let stage = state.stage();
            let step = match stage {
                Stage::Coordinate => self.coordinate(&mut state).await,
                Stage::GeneratePlan => self.generate_plan(&mut state).await,
                Stage::Research => self.research(&mut state, guard.token.clone()).await,
                Stage::HumanFeedback | Stage::End => return Ok(state),
            };

            if let Err(e) = step {
                error!(
                    session_id = %state.session_id(),
                    stage = %stage,
                    "Stage failed: {}", e
                );
                state.set_error(e.to_string());
                self.store.save(&state).await?;
                METRICS.record_session("failed");
                return Err(e);
            }

            METRICS.record_stage(state.stage().as_str());
            self.store.save(&state).await?;
            debug!(
                session_id = %state.session_id(),
                "Stage {} -> {}", stage, state.stage()
            );

            if state.stage().is_terminal() && !state.is_cancelled() {
                METRICS.record_session("completed");
            }
        }
    }

    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, LlmError>>,
    {
        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(LlmError::Timeout(format!("model call exceeded {:?}", timeout)).into()),
        }
    }

    /// Triage: answer directly or hand off to the planner
    async fn coordinate(&self, state: &mut ResearchState) -> Result<()> {
        let topic = state.effective_topic().ok_or_else(|| {
            ResearchError::InvalidRequest("no research topic and no user message".to_string())
        })?;

        let system = self.prompts.render(
            COORDINATOR,
            &serde_json::json!({ "CURRENT_TIME": now() }),
        )?;
        let request = ChatRequest::new("coordinate", vec![Message::system(system), Message::user(topic.clone())])
            .with_tools(vec![handoff_to_planner_spec()]);

        let reply = self.call(self.model.invoke(request)).await?;

        match ModelTurn::from_message(reply) {
            ModelTurn::DirectAnswer(answer) => {
                info!(session_id = %state.session_id(), "Coordinator answered directly");
                state.append_message(Message::assistant(answer.clone()));
                state.set_direct_answer(answer);
                state.set_stage(Stage::End);
            }
            ModelTurn::Invocation { calls, .. } => {
                let handoff = calls.iter().rev().find(|c| c.name == HANDOFF_TO_PLANNER);
                if handoff.is_none() {
                    warn!("Coordinator invoked unexpected capability, planning anyway");
                }

                let research_topic = handoff
                    .and_then(|c| c.arg_str("research_topic"))
                    .filter(|t| !t.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or(topic);
                let locale = handoff
                    .and_then(|c| c.arg_str("locale"))
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| state.locale().to_string());

                info!(
                    session_id = %state.session_id(),
                    locale = %locale,
                    "Handing off to planner: {}", research_topic
                );
                state.set_topic(research_topic, locale);
                state.set_stage(Stage::GeneratePlan);
            }
        }
        Ok(())
    }

    /// Produce a fresh plan that replaces any previous one
    async fn generate_plan(&self, state: &mut ResearchState) -> Result<()> {
        let system = self.prompts.render(
            PLANNER,
            &serde_json::json!({
                "CURRENT_TIME": now(),
                "research_topic": state.research_topic(),
                "locale": state.locale(),
                "max_step_num": self.config.max_plan_steps,
            }),
        )?;

        let mut messages = vec![Message::system(system)];
        let history = self.context.compress(state.history().to_vec()).await;
        if history.is_empty() {
            messages.push(Message::user(state.research_topic()));
        } else {
            messages.extend(history);
        }

        let request = ChatRequest::new("plan", messages);
        let schema = Plan::output_schema();
        let plan: Plan = self
            .call(invoke_structured(self.model.as_ref(), request, &schema))
            .await
            .map_err(|e| match e {
                ResearchError::Model(LlmError::Decode(msg)) => ResearchError::PlanDecode(msg),
                other => other,
            })?;
        plan.validate().map_err(ResearchError::PlanDecode)?;

        info!(
            session_id = %state.session_id(),
            steps = plan.steps.len(),
            iteration = state.plan_iterations() + 1,
            "Plan generated: {}", plan.title
        );

        let plan_json = plan.to_json_pretty();
        state.replace_plan(plan);
        state.append_message(Message::assistant(plan_json));
        state.set_stage(Stage::HumanFeedback);
        Ok(())
    }

    /// Execute the confirmed plan
    async fn research(&self, state: &mut ResearchState, cancel: CancellationToken) -> Result<()> {
        let plan = state
            .current_plan()
            .cloned()
            .ok_or_else(|| ResearchError::Internal("research stage without a plan".to_string()))?;

        state.begin_research_loop();
        let outcome = self
            .pipeline
            .run(&plan, state.history().to_vec(), &state.locale().to_string(), cancel)
            .await;

        info!(
            session_id = %state.session_id(),
            delivered = outcome.delivered,
            failed = outcome.step_results.iter().filter(|r| r.is_error()).count(),
            "Research finished"
        );

        state.append_observations(outcome.observations);
        state.append_step_results(outcome.step_results);

        if outcome.cancelled {
            state.mark_cancelled();
            METRICS.record_session("cancelled");
            return Ok(());
        }

        if let Some(report) = outcome.report {
            state.append_message(Message::assistant(report.clone()));
            state.set_research_summary(report);
        }
        state.set_stage(Stage::End);
        Ok(())
    }
}

fn now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
