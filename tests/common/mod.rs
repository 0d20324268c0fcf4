//! In-process model and search doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use deep_research::config::Config;
use deep_research::context::{CharClassEstimator, Message, Role, ToolCall};
use deep_research::llm::{ChatModel, ChatRequest, LlmError, OutputSchema};
use deep_research::prompts::TemplateRegistry;
use deep_research::research::{Collaborators, InMemorySessionStore, ResearchOrchestrator, HANDOFF_TO_PLANNER};
use deep_research::search::{normalize_query, SearchError, SearchResult, SearchTool, WEB_SEARCH_TOOL};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GREETING_REPLY: &str = "你好！我是研究助手，有什么可以帮您？";

/// Answers each operation with a deterministic script
#[derive(Default)]
pub struct ScriptedModel {
    operations: Mutex<Vec<&'static str>>,
    plans: AtomicUsize,
    malformed_plan: bool,
    fail_reports: bool,
    failing_step: Option<usize>,
    research_delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Planner output that violates the plan schema
    pub fn with_malformed_plan() -> Self {
        Self {
            malformed_plan: true,
            ..Self::default()
        }
    }

    /// Every report merge fails upstream
    pub fn with_failing_reports() -> Self {
        Self {
            fail_reports: true,
            ..Self::default()
        }
    }

    /// Research for the given 1-based step number fails upstream
    pub fn with_failing_step(step_number: usize) -> Self {
        Self {
            failing_step: Some(step_number),
            ..Self::default()
        }
    }

    /// Every research turn stalls for `delay` before answering
    pub fn with_slow_research(delay: Duration) -> Self {
        Self {
            research_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn count(&self, operation: &str) -> usize {
        self.operations
            .lock()
            .unwrap()
            .iter()
            .filter(|op| **op == operation)
            .count()
    }

    fn record(&self, operation: &'static str) {
        self.operations.lock().unwrap().push(operation);
    }
}

fn last_user(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn line_after(text: &str, prefix: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix(prefix))
        .map(|rest| rest.trim().to_string())
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(&self, request: ChatRequest) -> Result<Message, LlmError> {
        self.record(request.operation);

        match request.operation {
            "coordinate" => {
                let topic = last_user(&request.messages);
                if topic.trim() == "你好" {
                    return Ok(Message::assistant(GREETING_REPLY));
                }
                Ok(Message::assistant("").with_tool_calls(vec![ToolCall::new(
                    "call_handoff",
                    HANDOFF_TO_PLANNER,
                    serde_json::json!({"research_topic": topic, "locale": "zh-CN"}),
                )]))
            }
            "research" => {
                let ask = last_user(&request.messages);
                let (number, title) = ask
                    .lines()
                    .next()
                    .and_then(|line| line.strip_prefix("Research step "))
                    .and_then(|rest| rest.split_once(": "))
                    .map(|(n, title)| (n.to_string(), title.to_string()))
                    .unwrap_or_else(|| ("0".to_string(), "step".to_string()));

                if let Some(delay) = self.research_delay {
                    tokio::time::sleep(delay).await;
                }
                if self.failing_step.map(|n| n.to_string()) == Some(number.clone()) {
                    return Err(LlmError::Upstream(format!("502 Bad Gateway for step {number}")));
                }
                let searched = request.messages.iter().any(|m| m.role == Role::Tool);

                if !searched && !request.tools.is_empty() {
                    return Ok(Message::assistant("").with_tool_calls(vec![ToolCall::new(
                        "call_search",
                        WEB_SEARCH_TOOL,
                        serde_json::json!({"query": title}),
                    )]));
                }

                let slug = format!("step{number}");
                Ok(Message::assistant(format!(
                    "### {title}\n\n据 [来源](https://example.com/{slug}) 报道，相关进展显著。\n\n![图表](https://img.example.com/{slug}.png)"
                )))
            }
            "report" => {
                if self.fail_reports {
                    return Err(LlmError::Upstream("503 Service Unavailable".to_string()));
                }
                let prompt = last_user(&request.messages);
                let title = line_after(&prompt, "Step:").unwrap_or_default();
                Ok(Message::assistant(format!("## {title}\n\n整理后的研究内容。")))
            }
            "synthesis" => Ok(Message::assistant("## 结论\n\n综合以上研究得出结论。")),
            "compress" => Ok(Message::assistant("对话摘要")),
            other => Err(LlmError::InvalidResponse(format!("unscripted operation {other}"))),
        }
    }

    async fn invoke_json(
        &self,
        request: ChatRequest,
        _schema: &OutputSchema,
    ) -> Result<serde_json::Value, LlmError> {
        self.record(request.operation);

        if request.operation != "plan" {
            return Err(LlmError::InvalidResponse("unscripted structured call".to_string()));
        }
        if self.malformed_plan {
            return Ok(serde_json::json!({"title": "missing fields"}));
        }

        let version = self.plans.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(serde_json::json!({
            "locale": "zh-CN",
            "has_enough_context": false,
            "thought": format!("需要收集资料 (v{version})"),
            "title": format!("Plan v{version}"),
            "steps": [
                {"title": format!("市场现状 v{version}"), "description": "收集市场规模数据"},
                {"title": format!("技术趋势 v{version}"), "description": "收集技术发展数据"},
                {"title": format!("政策环境 v{version}"), "description": "收集相关政策"}
            ]
        }))
    }
}

/// Returns one page per query
#[derive(Default)]
pub struct MockSearch {
    pub queries: AtomicUsize,
}

#[async_trait]
impl SearchTool for MockSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(vec![SearchResult {
            title: format!("About {query}"),
            url: format!("https://search.example.com/?q={}", normalize_query(query).len()),
            content: format!("Facts about {query}"),
            images: vec![],
        }])
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.research.call_timeout_secs = 5;
    config.research.step_timeout_secs = 10;
    config
}

pub fn orchestrator(model: Arc<ScriptedModel>) -> Arc<ResearchOrchestrator> {
    orchestrator_with_store(model).0
}

/// Orchestrator plus its session store, for inspecting persisted state
pub fn orchestrator_with_store(
    model: Arc<ScriptedModel>,
) -> (Arc<ResearchOrchestrator>, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::new());
    let collaborators = Collaborators {
        model,
        search: Arc::new(MockSearch::default()),
        prompts: Arc::new(TemplateRegistry::new().expect("built-in templates")),
        store: store.clone(),
        estimator: Arc::new(CharClassEstimator),
    };
    (
        Arc::new(ResearchOrchestrator::new(collaborators, &test_config())),
        store,
    )
}
