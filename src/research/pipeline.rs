//! Parallel research with a single serialized report writer
//!
//! One worker per plan step researches concurrently and pushes its findings
//! onto an unbounded FIFO queue. A single report worker drains the queue and,
//! holding the report lock, asks the model for the next report section given
//! everything written so far. `QueueItem::Done` is enqueued only after every
//! research worker has finished, so the report worker sees each delivered
//! step exactly once before it exits.

use super::agent::{AgentError, ResearchAgent};
use super::links::extract_links;
use super::plan::{Plan, Step};
use super::state::StepResult;
use crate::config::ResearchConfig;
use crate::context::manager::ContextManager;
use crate::context::models::Message;
use crate::llm::{collect_stream, ChatModel, ChatRequest, LlmError};
use crate::metrics::METRICS;
use crate::prompts::{PromptError, PromptRenderer, REPORTER, RESEARCHER, SYNTHESIS};
use crate::search::SearchTool;
use chrono::Local;
use futures::future::join_all;
use indexmap::IndexSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Findings of one research worker
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredStep {
    pub step_index: usize,
    pub title: String,
    pub description: String,
    pub step_markdown: String,
    pub sources: Vec<String>,
    pub images: Vec<String>,
}

/// Queue between research workers and the report worker
#[derive(Debug)]
pub enum QueueItem {
    Delivered(DeliveredStep),
    /// No more items will follow
    Done,
}

/// Result of a pipeline run
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    /// Final report; `None` when the run was cancelled
    pub report: Option<String>,
    /// Completed and failed steps in completion order
    pub step_results: Vec<StepResult>,
    /// Raw findings of delivered steps in delivery order
    pub observations: Vec<String>,
    pub delivered: usize,
    pub increments: usize,
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("{0}")]
    Agent(#[from] AgentError),
}

struct Shared {
    model: Arc<dyn ChatModel>,
    search: Arc<dyn SearchTool>,
    prompts: Arc<dyn PromptRenderer>,
    context: Arc<ContextManager>,
    config: ResearchConfig,
}

/// What the report worker produced before it exited
#[derive(Debug, Default)]
struct ReportOutput {
    completed: Vec<StepResult>,
    delivered: Vec<DeliveredStep>,
    increments: usize,
}

pub struct ResearchPipeline {
    shared: Arc<Shared>,
}

impl ResearchPipeline {
    pub fn new(
        model: Arc<dyn ChatModel>,
        search: Arc<dyn SearchTool>,
        prompts: Arc<dyn PromptRenderer>,
        context: Arc<ContextManager>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                model,
                search,
                prompts,
                context,
                config,
            }),
        }
    }

    /// Research the plan's steps and assemble the report
    ///
    /// The history is compressed once here and shared read-only by every
    /// worker; workers never change it, so each would compute the same result.
    pub async fn run(
        &self,
        plan: &Plan,
        history: Vec<Message>,
        locale: &str,
        cancel: CancellationToken,
    ) -> PipelineOutcome {
        let context = Arc::new(self.shared.context.compress(history).await);
        let steps: Vec<Step> = plan
            .steps
            .iter()
            .take(self.shared.config.max_parallel_steps)
            .cloned()
            .collect();

        info!(
            "Researching {} of {} plan steps for {:?}",
            steps.len(),
            plan.steps.len(),
            plan.title
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let report_body = Arc::new(Mutex::new(String::new()));

        let reporter = tokio::spawn(run_report_worker(
            rx,
            self.shared.clone(),
            report_body.clone(),
            locale.to_string(),
            cancel.clone(),
        ));

        let handles: Vec<_> = steps
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, step)| {
                tokio::spawn(research_worker(
                    self.shared.clone(),
                    idx,
                    step,
                    context.clone(),
                    locale.to_string(),
                    tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        let mut failures = Vec::new();
        for (idx, joined) in join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(Some(failed)) => failures.push(failed),
                Ok(None) => {}
                Err(e) => {
                    error!("Research worker for step {} panicked: {}", idx + 1, e);
                    let step = &steps[idx];
                    failures.push(StepResult::failed(
                        idx,
                        step.title.clone(),
                        step.description.clone(),
                        format!("worker aborted: {}", e),
                    ));
                }
            }
        }

        // All producers are finished; the sentinel is the last item.
        if tx.send(QueueItem::Done).is_err() {
            debug!("Report worker already stopped before sentinel");
        }
        drop(tx);

        let output = match reporter.await {
            Ok(output) => output,
            Err(e) => {
                error!("Report worker panicked: {}", e);
                ReportOutput::default()
            }
        };

        let mut step_results = failures;
        step_results.extend(output.completed);
        step_results.sort_by_key(|r| r.timestamp);

        let observations: Vec<String> = output
            .delivered
            .iter()
            .map(|d| d.step_markdown.clone())
            .collect();

        let mut outcome = PipelineOutcome {
            report: None,
            step_results,
            observations,
            delivered: output.delivered.len(),
            increments: output.increments,
            cancelled: cancel.is_cancelled(),
        };

        if outcome.cancelled {
            warn!("Research cancelled after {} delivered steps", outcome.delivered);
            return outcome;
        }

        let body = report_body.lock().await.clone();
        let references = reference_list(&output.delivered);
        let synthesis = self.synthesize(plan, &body, &references, locale).await;

        outcome.report = Some(assemble_report(
            plan,
            &body,
            synthesis.as_deref(),
            &references,
            locale,
        ));
        outcome
    }

    async fn synthesize(
        &self,
        plan: &Plan,
        body: &str,
        references: &[String],
        locale: &str,
    ) -> Option<String> {
        let prompt = match self.shared.prompts.render(
            SYNTHESIS,
            &serde_json::json!({
                "locale": locale,
                "title": plan.title,
                "report": body,
                "references": format_references(references),
            }),
        ) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Synthesis prompt failed, report has no closing section: {}", e);
                return None;
            }
        };

        let request = ChatRequest::new("synthesis", vec![Message::user(prompt)]);
        let timeout = self.shared.config.call_timeout();
        match tokio::time::timeout(timeout, self.shared.model.invoke(request)).await {
            Ok(Ok(message)) if !message.content.trim().is_empty() => Some(message.content),
            Ok(Ok(_)) => {
                warn!("Synthesis returned nothing");
                None
            }
            Ok(Err(e)) => {
                warn!("Synthesis failed, report has no closing section: {}", e);
                None
            }
            Err(_) => {
                warn!("Synthesis timed out after {:?}", timeout);
                None
            }
        }
    }
}

async fn research_worker(
    shared: Arc<Shared>,
    idx: usize,
    step: Step,
    context: Arc<Vec<Message>>,
    locale: String,
    tx: mpsc::UnboundedSender<QueueItem>,
    cancel: CancellationToken,
) -> Option<StepResult> {
    let start = Instant::now();
    let step_timeout = shared.config.step_timeout();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Step {} cancelled", idx + 1);
            return None;
        }
        outcome = tokio::time::timeout(step_timeout, research_step(&shared, idx, &step, &context, &locale)) => outcome,
    };

    let elapsed = start.elapsed().as_secs_f64();
    match outcome {
        Ok(Ok(delivered)) => {
            if cancel.is_cancelled() {
                return None;
            }
            METRICS.record_step(true, elapsed);
            info!("Step {} researched in {:.1}s: {}", idx + 1, elapsed, step.title);
            if tx.send(QueueItem::Delivered(delivered)).is_err() {
                warn!("Report worker stopped; step {} findings dropped", idx + 1);
            }
            None
        }
        Ok(Err(e)) => {
            METRICS.record_step(false, elapsed);
            warn!("Step {} failed: {}", idx + 1, e);
            Some(StepResult::failed(idx, step.title, step.description, e.to_string()))
        }
        Err(_) => {
            METRICS.record_step(false, elapsed);
            warn!("Step {} timed out after {:?}", idx + 1, step_timeout);
            Some(StepResult::failed(
                idx,
                step.title,
                step.description,
                format!("step timed out after {:?}", step_timeout),
            ))
        }
    }
}

async fn research_step(
    shared: &Shared,
    idx: usize,
    step: &Step,
    context: &[Message],
    locale: &str,
) -> Result<DeliveredStep, StepError> {
    let system = shared.prompts.render(
        RESEARCHER,
        &serde_json::json!({
            "CURRENT_TIME": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "locale": locale,
            "step_number": idx + 1,
            "step_title": step.title,
            "step_description": step.description,
        }),
    )?;

    let mut messages = Vec::with_capacity(context.len() + 2);
    messages.push(Message::system(system));
    messages.extend(context.iter().cloned());
    messages.push(Message::user(format!(
        "Research step {}: {}\n\n{}",
        idx + 1,
        step.title,
        step.description
    )));

    let agent = ResearchAgent::new(
        shared.model.clone(),
        shared.search.clone(),
        shared.config.agent_max_iterations,
        shared.config.call_timeout(),
    );
    let outcome = agent.run(messages).await?;
    let links = extract_links(&outcome.markdown);

    debug!(
        "Step {} used {} searches, cites {} urls",
        idx + 1,
        outcome.searches,
        links.sources.len()
    );

    Ok(DeliveredStep {
        step_index: idx,
        title: step.title.clone(),
        description: step.description.clone(),
        step_markdown: outcome.markdown,
        sources: links.sources,
        images: links.images,
    })
}

async fn run_report_worker(
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    shared: Arc<Shared>,
    report: Arc<Mutex<String>>,
    locale: String,
    cancel: CancellationToken,
) -> ReportOutput {
    let mut output = ReportOutput::default();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Report worker cancelled");
                break;
            }
            item = rx.recv() => item,
        };

        let step = match item {
            Some(QueueItem::Delivered(step)) => step,
            Some(QueueItem::Done) | None => break,
        };

        let mut body = report.lock().await;
        let increment = merge_step(&shared, &body, &step, &locale).await;
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(increment.trim());
        drop(body);

        output.increments += 1;
        output.completed.push(StepResult::completed(
            step.step_index,
            step.title.clone(),
            step.description.clone(),
            step.step_markdown.clone(),
            step.sources.clone(),
            step.images.clone(),
        ));
        output.delivered.push(step);
    }

    output
}

/// Report section for one delivered step; falls back to the raw findings
async fn merge_step(shared: &Shared, report_so_far: &str, step: &DeliveredStep, locale: &str) -> String {
    match request_section(shared, report_so_far, step, locale).await {
        Ok(section) if !section.trim().is_empty() => section,
        Ok(_) => {
            warn!("Empty report section for step {}, using raw findings", step.step_index + 1);
            raw_section(step)
        }
        Err(e) => {
            warn!(
                "Report merge failed for step {}, using raw findings: {}",
                step.step_index + 1,
                e
            );
            raw_section(step)
        }
    }
}

async fn request_section(
    shared: &Shared,
    report_so_far: &str,
    step: &DeliveredStep,
    locale: &str,
) -> Result<String, LlmError> {
    let prompt = shared
        .prompts
        .render(
            REPORTER,
            &serde_json::json!({
                "locale": locale,
                "report_so_far": report_so_far,
                "step_title": step.title,
                "step_markdown": step.step_markdown,
            }),
        )
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    let request = ChatRequest::new("report", vec![Message::user(prompt)]);
    let timeout = shared.config.call_timeout();

    tokio::time::timeout(timeout, async {
        let deltas = shared.model.stream(request).await?;
        collect_stream(deltas).await
    })
    .await
    .map_err(|_| LlmError::Timeout(format!("report merge exceeded {:?}", timeout)))?
}

fn raw_section(step: &DeliveredStep) -> String {
    format!("## {}\n\n{}", step.title, step.step_markdown.trim())
}

/// Deduplicated sources of delivered steps, in delivery order
fn reference_list(delivered: &[DeliveredStep]) -> Vec<String> {
    let refs: IndexSet<&String> = delivered.iter().flat_map(|d| d.sources.iter()).collect();
    refs.into_iter().cloned().collect()
}

fn format_references(references: &[String]) -> String {
    references
        .iter()
        .enumerate()
        .map(|(i, url)| format!("[{}] {}", i + 1, url))
        .collect::<Vec<_>>()
        .join("\n")
}

struct ReportLabels {
    report: &'static str,
    background: &'static str,
    references: &'static str,
    completed_at: &'static str,
}

impl ReportLabels {
    fn for_locale(locale: &str) -> Self {
        if locale.to_ascii_lowercase().starts_with("zh") {
            Self {
                report: "研究报告",
                background: "背景与研究动机",
                references: "参考资料",
                completed_at: "研究完成时间",
            }
        } else {
            Self {
                report: "Research Report",
                background: "Background and Motivation",
                references: "References",
                completed_at: "Completed at",
            }
        }
    }
}

fn assemble_report(
    plan: &Plan,
    body: &str,
    synthesis: Option<&str>,
    references: &[String],
    locale: &str,
) -> String {
    let labels = ReportLabels::for_locale(locale);
    let mut report = format!(
        "# {}: {}\n\n## {}\n{}\n\n",
        labels.report, plan.title, labels.background, plan.thought
    );

    if !body.is_empty() {
        report.push_str(body);
        report.push_str("\n\n");
    }

    if let Some(synthesis) = synthesis {
        report.push_str(synthesis.trim());
        report.push_str("\n\n");
    }

    if !references.is_empty() {
        report.push_str(&format!(
            "## {}\n{}\n\n",
            labels.references,
            format_references(references)
        ));
    }

    report.push_str(&format!(
        "---\n{}: {}\n",
        labels.completed_at,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    report
}
