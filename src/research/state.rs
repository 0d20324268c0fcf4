//! Research session state
//!
//! The state is owned by the orchestrator: outside the crate it is read-only,
//! and inside it changes only through the explicit append/replace methods
//! below, which also bump `updated_at`.

use super::plan::Plan;
use crate::context::models::{Message, Role};
use crate::error::ResearchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Orchestrator stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Coordinate,
    GeneratePlan,
    /// Suspended until the user confirms or revises the plan
    HumanFeedback,
    Research,
    End,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Coordinate => "coordinate",
            Stage::GeneratePlan => "generate_plan",
            Stage::HumanFeedback => "human_feedback",
            Stage::Research => "research",
            Stage::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::End)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one executed plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub title: String,
    pub description: String,
    pub result_markdown: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn completed(
        step_index: usize,
        title: String,
        description: String,
        result_markdown: String,
        sources: Vec<String>,
        images: Vec<String>,
    ) -> Self {
        Self {
            step_index,
            title,
            description,
            result_markdown,
            sources,
            images,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failed(step_index: usize, title: String, description: String, error: String) -> Self {
        Self {
            step_index,
            title,
            description,
            result_markdown: format!("研究失败: {}", error),
            sources: Vec::new(),
            images: Vec::new(),
            timestamp: Utc::now(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Accumulated state of one research session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    session_id: Uuid,
    stage: Stage,
    research_topic: String,
    locale: String,
    current_plan: Option<Plan>,
    history: Vec<Message>,
    observations: Vec<String>,
    step_results: Vec<StepResult>,
    research_summary: Option<String>,
    direct_answer: Option<String>,
    plan_iterations: u32,
    loop_count: u32,
    error: Option<String>,
    cancelled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ResearchState {
    pub fn new(topic: impl Into<String>, locale: impl Into<String>) -> Self {
        let topic = topic.into();
        let now = Utc::now();
        let history = if topic.trim().is_empty() {
            Vec::new()
        } else {
            vec![Message::user(topic.clone())]
        };

        Self {
            session_id: Uuid::new_v4(),
            stage: Stage::Coordinate,
            research_topic: topic,
            locale: locale.into(),
            current_plan: None,
            history,
            observations: Vec::new(),
            step_results: Vec::new(),
            research_summary: None,
            direct_answer: None,
            plan_iterations: 0,
            loop_count: 0,
            error: None,
            cancelled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn research_topic(&self) -> &str {
        &self.research_topic
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.current_plan.as_ref()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn observations(&self) -> &[String] {
        &self.observations
    }

    pub fn step_results(&self) -> &[StepResult] {
        &self.step_results
    }

    pub fn research_summary(&self) -> Option<&str> {
        self.research_summary.as_deref()
    }

    pub fn direct_answer(&self) -> Option<&str> {
        self.direct_answer.as_deref()
    }

    pub fn plan_iterations(&self) -> u32 {
        self.plan_iterations
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Topic, falling back to the last user message
    pub fn effective_topic(&self) -> Option<String> {
        if !self.research_topic.trim().is_empty() {
            return Some(self.research_topic.clone());
        }
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.touch();
    }

    pub(crate) fn set_topic(&mut self, topic: String, locale: String) {
        self.research_topic = topic;
        self.locale = locale;
        self.touch();
    }

    /// Every planning pass fully replaces the previous plan
    pub(crate) fn replace_plan(&mut self, plan: Plan) {
        self.current_plan = Some(plan);
        self.plan_iterations += 1;
        self.touch();
    }

    pub(crate) fn append_message(&mut self, message: Message) {
        self.history.push(message);
        self.touch();
    }

    pub(crate) fn append_observations(&mut self, observations: impl IntoIterator<Item = String>) {
        self.observations.extend(observations);
        self.touch();
    }

    pub(crate) fn append_step_results(&mut self, results: impl IntoIterator<Item = StepResult>) {
        self.step_results.extend(results);
        self.touch();
    }

    pub(crate) fn set_research_summary(&mut self, summary: String) {
        if self.research_summary.is_none() {
            self.research_summary = Some(summary);
            self.touch();
        }
    }

    pub(crate) fn set_direct_answer(&mut self, answer: String) {
        self.direct_answer = Some(answer);
        self.touch();
    }

    pub(crate) fn begin_research_loop(&mut self) {
        self.loop_count += 1;
        self.touch();
    }

    pub(crate) fn set_error(&mut self, error: String) {
        self.error = Some(error);
        self.touch();
    }

    pub(crate) fn clear_error(&mut self) {
        self.error = None;
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
        self.stage = Stage::End;
        self.touch();
    }
}

/// The user's answer to a proposed plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserConfirm {
    Confirm,
    Modify,
}

impl FromStr for UserConfirm {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirm" => Ok(UserConfirm::Confirm),
            "modify" => Ok(UserConfirm::Modify),
            other => Err(ResearchError::InvalidConfirmation(other.to_string())),
        }
    }
}

/// Resume payload delivered out of band
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    pub session_id: Uuid,
    pub user_confirm: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Request to open a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub topic: String,
    #[serde(default)]
    pub locale: Option<String>,
}

/// Snapshot returned to callers after every operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub status: String,
    pub stage: Stage,
    /// Whether the caller must confirm or revise `current_plan`
    pub need_plan: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub current_plan: Option<Plan>,
    #[serde(default)]
    pub research_summary: Option<String>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub plan_iterations: u32,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&ResearchState> for SessionStatus {
    fn from(state: &ResearchState) -> Self {
        let status = if state.is_cancelled() {
            "cancelled"
        } else if state.error().is_some() {
            "failed"
        } else {
            match state.stage() {
                Stage::Coordinate | Stage::GeneratePlan => "running",
                Stage::HumanFeedback => "awaiting_confirmation",
                Stage::Research => "researching",
                Stage::End => "completed",
            }
        };

        let need_plan = state.stage() == Stage::HumanFeedback && !state.is_cancelled();
        let message = if let Some(answer) = state.direct_answer() {
            Some(answer.to_string())
        } else if need_plan {
            state.current_plan().map(Plan::outline)
        } else {
            None
        };

        Self {
            session_id: state.session_id(),
            status: status.to_string(),
            stage: state.stage(),
            need_plan,
            message,
            current_plan: state.current_plan().cloned(),
            research_summary: state.research_summary().map(str::to_string),
            step_results: state.step_results().to_vec(),
            plan_iterations: state.plan_iterations(),
            error: state.error().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::plan::Step;

    fn plan() -> Plan {
        Plan {
            locale: "zh-CN".to_string(),
            has_enough_context: false,
            thought: "t".to_string(),
            title: "T".to_string(),
            steps: vec![Step {
                title: "s".to_string(),
                description: "d".to_string(),
            }],
        }
    }

    #[test]
    fn test_new_state() {
        let state = ResearchState::new("2025 年 token2049 大会", "zh-CN");
        assert_eq!(state.stage(), Stage::Coordinate);
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.loop_count(), 0);
        assert!(state.current_plan().is_none());
    }

    #[test]
    fn test_effective_topic_falls_back_to_last_user_message() {
        let mut state = ResearchState::new("", "en-US");
        assert_eq!(state.effective_topic(), None);

        state.append_message(Message::user("first"));
        state.append_message(Message::assistant("reply"));
        state.append_message(Message::user("second"));
        assert_eq!(state.effective_topic().as_deref(), Some("second"));
    }

    #[test]
    fn test_replace_plan_counts_iterations() {
        let mut state = ResearchState::new("topic", "zh-CN");
        state.replace_plan(plan());
        let mut revised = plan();
        revised.title = "Revised".to_string();
        state.replace_plan(revised);

        assert_eq!(state.plan_iterations(), 2);
        assert_eq!(state.current_plan().unwrap().title, "Revised");
    }

    #[test]
    fn test_summary_is_set_once() {
        let mut state = ResearchState::new("topic", "zh-CN");
        state.set_research_summary("first".to_string());
        state.set_research_summary("second".to_string());
        assert_eq!(state.research_summary(), Some("first"));
    }

    #[test]
    fn test_user_confirm_parse() {
        assert_eq!("confirm".parse::<UserConfirm>().unwrap(), UserConfirm::Confirm);
        assert_eq!("modify".parse::<UserConfirm>().unwrap(), UserConfirm::Modify);
        assert!(matches!(
            "Confirm".parse::<UserConfirm>(),
            Err(ResearchError::InvalidConfirmation(_))
        ));
    }

    #[test]
    fn test_status_awaiting_confirmation() {
        let mut state = ResearchState::new("topic", "zh-CN");
        state.replace_plan(plan());
        state.set_stage(Stage::HumanFeedback);

        let status = SessionStatus::from(&state);
        assert_eq!(status.status, "awaiting_confirmation");
        assert!(status.need_plan);
        assert!(status.message.unwrap().starts_with("# T"));
    }

    #[test]
    fn test_status_direct_answer() {
        let mut state = ResearchState::new("你好", "zh-CN");
        state.set_direct_answer("你好！有什么可以帮你？".to_string());
        state.set_stage(Stage::End);

        let status = SessionStatus::from(&state);
        assert_eq!(status.status, "completed");
        assert!(!status.need_plan);
        assert_eq!(status.message.as_deref(), Some("你好！有什么可以帮你？"));
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = ResearchState::new("topic", "en-US");
        state.replace_plan(plan());
        let json = serde_json::to_string(&state).unwrap();
        let back: ResearchState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id(), state.session_id());
        assert_eq!(back.current_plan(), state.current_plan());
    }
}
