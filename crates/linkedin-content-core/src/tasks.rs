use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use tracing::{debug, info, instrument, warn};

use crate::config::InvalidReportPolicy;
use crate::crew::{Crew, CrewOutput};
use crate::error::TaskError;
use crate::schema::{FlowState, ReportError, ResearchReport};
use crate::trace::{TraceCollector, TraceEvent};

pub const STATE_KEY: &str = "flow.state";
pub const INPUT_TOPIC_KEY: &str = "input.topic";
pub const INPUT_INDUSTRY_KEY: &str = "input.industry";
pub const REPORT_ERROR_KEY: &str = "research.error";
pub const RESEARCH_PATH_KEY: &str = "research.output_path";
pub const CONTENT_KEY: &str = "content.final";
pub const CONTENT_PATH_KEY: &str = "content.output_path";
pub const TRACE_KEY: &str = "trace.events";

async fn load_state(context: &Context) -> FlowState {
    context.get::<FlowState>(STATE_KEY).await.unwrap_or_default()
}

async fn record_trace(context: &Context, stage: &str, message: impl Into<String>) {
    let events: Vec<TraceEvent> = context.get(TRACE_KEY).await.unwrap_or_default();
    let mut collector = TraceCollector::from_events(events);
    collector.record(stage, message);
    context.set(TRACE_KEY, collector.events()).await;
}

fn last_output_file(output: &CrewOutput) -> Option<PathBuf> {
    output
        .tasks_output
        .last()
        .and_then(|task| task.output_file.clone())
}

/// Validate the research crew's answer, preferring the structured JSON when present.
pub fn parse_research_output(output: &CrewOutput) -> Result<ResearchReport, ReportError> {
    match &output.json {
        Some(value) => ResearchReport::from_value(value.clone()),
        None => ResearchReport::from_text(&output.raw),
    }
}

/// Trims the caller-provided topic and industry into the flow state.
#[derive(Default)]
pub struct GetUserInputTask;

#[async_trait]
impl Task for GetUserInputTask {
    fn id(&self) -> &str {
        "get_user_input"
    }

    #[instrument(name = "stage.get_user_input", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let topic: String = context.get(INPUT_TOPIC_KEY).await.unwrap_or_default();
        let industry: String = context.get(INPUT_INDUSTRY_KEY).await.unwrap_or_default();

        let mut state = load_state(&context).await;
        state
            .accept_input(&topic, &industry)
            .map_err(|err| TaskError::terminal("get_user_input", err.to_string()))?;

        context.set(STATE_KEY, &state).await;

        let message = format!(
            "Start research on {} for {}",
            state.topic, state.industry
        );
        record_trace(&context, self.id(), message.clone()).await;
        info!(topic = %state.topic, industry = %state.industry, "flow input accepted");

        Ok(TaskResult::new(Some(message), NextAction::ContinueAndExecute))
    }
}

/// Runs the research crew and validates its answer into a `ResearchReport`.
pub struct ResearchTask {
    crew: Arc<Crew>,
    output_dir: PathBuf,
    policy: InvalidReportPolicy,
}

impl ResearchTask {
    pub fn new(crew: Arc<Crew>, output_dir: PathBuf, policy: InvalidReportPolicy) -> Self {
        Self {
            crew,
            output_dir,
            policy,
        }
    }
}

#[async_trait]
impl Task for ResearchTask {
    fn id(&self) -> &str {
        "research"
    }

    #[instrument(name = "stage.research", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        create_dir_all(&self.output_dir).map_err(|err| {
            TaskError::terminal(
                "research",
                format!(
                    "failed to create output directory {}: {err}",
                    self.output_dir.display()
                ),
            )
        })?;

        let mut state = load_state(&context).await;
        let output = self
            .crew
            .kickoff(&state.research_inputs())
            .await
            .map_err(|err| TaskError::terminal("research", err.to_string()))?;

        if let Some(path) = last_output_file(&output) {
            context
                .set(RESEARCH_PATH_KEY, path.display().to_string())
                .await;
        }

        let message = match parse_research_output(&output) {
            Ok(report) => {
                debug!(
                    facts = report.facts.len(),
                    sources = report.sources.len(),
                    "research report accepted"
                );
                state.research_report = Some(report);
                format!(
                    "Finished research on {} for {}",
                    state.topic, state.industry
                )
            }
            Err(err) => {
                warn!(error = %err, policy = ?self.policy, "research output failed validation");
                context.set(REPORT_ERROR_KEY, err.to_string()).await;
                if self.policy == InvalidReportPolicy::Abort {
                    record_trace(&context, self.id(), format!("aborted: {err}")).await;
                    return Err(TaskError::terminal("research", err.to_string()).into());
                }
                format!("Research report rejected, continuing without it: {err}")
            }
        };

        context.set(STATE_KEY, &state).await;
        record_trace(&context, self.id(), message.clone()).await;
        info!(
            report = state.research_report.is_some(),
            "research stage completed"
        );

        Ok(TaskResult::new(Some(message), NextAction::ContinueAndExecute))
    }
}

/// Runs the content crew on the state produced by the research stage.
pub struct ContentTask {
    crew: Arc<Crew>,
}

impl ContentTask {
    pub fn new(crew: Arc<Crew>) -> Self {
        Self { crew }
    }
}

#[async_trait]
impl Task for ContentTask {
    fn id(&self) -> &str {
        "content"
    }

    #[instrument(name = "stage.content", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let state = load_state(&context).await;
        if state.research_report.is_none() {
            warn!("content crew running without a research report");
        }

        let output = self
            .crew
            .kickoff(&state.content_inputs())
            .await
            .map_err(|err| TaskError::terminal("content", err.to_string()))?;

        if let Some(path) = last_output_file(&output) {
            context.set(CONTENT_PATH_KEY, path.display().to_string()).await;
        }
        context.set(CONTENT_KEY, output.raw.clone()).await;

        let message = format!(
            "Finished content creation on {} for {}",
            state.topic, state.industry
        );
        record_trace(&context, self.id(), message.clone()).await;
        info!(chars = output.raw.len(), "content stage completed");

        Ok(TaskResult::new(Some(message), NextAction::End))
    }
}
