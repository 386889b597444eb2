use crate::config::{Config, LoggingConfig};
use crate::crews::{CrewKind, CrewSettings, content_crew, load_crew_configs, research_crew};
use crate::llm::{DynLlmClient, build_llm_client};
use crate::logging::{FlowLogInput, FlowLogTarget, log_flow_completion};
use crate::metrics::record_flow_metrics;
use crate::schema::FlowState;
use crate::search::{DynSearchTool, SerperSearch};
use crate::tasks::{
    CONTENT_KEY, CONTENT_PATH_KEY, ContentTask, GetUserInputTask, INPUT_INDUSTRY_KEY,
    INPUT_TOPIC_KEY, REPORT_ERROR_KEY, RESEARCH_PATH_KEY, ResearchTask, STATE_KEY, TRACE_KEY,
};
use crate::trace::{TraceEvent, TraceSummary, persist_trace};
use anyhow::{Context as _, Result, anyhow};
use chrono::NaiveDate;
use graph_flow::{
    ExecutionStatus, FlowRunner, Graph, GraphBuilder, InMemorySessionStorage, Session,
    SessionStorage, Task,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const FLOW_NAME: &str = "linkedin_content_flow";

/// The three stages of the flow, in execution order.
#[derive(Clone)]
pub struct FlowTasks {
    pub get_user_input: Arc<GetUserInputTask>,
    pub research: Arc<ResearchTask>,
    pub content: Arc<ContentTask>,
}

impl FlowTasks {
    pub fn ids(&self) -> [&str; 3] {
        [
            self.get_user_input.id(),
            self.research.id(),
            self.content.id(),
        ]
    }
}

fn build_graph(tasks: &FlowTasks) -> Arc<Graph> {
    let builder = GraphBuilder::new(FLOW_NAME)
        .add_task(tasks.get_user_input.clone())
        .add_task(tasks.research.clone())
        .add_task(tasks.content.clone())
        .add_edge(tasks.get_user_input.id(), tasks.research.id())
        .add_edge(tasks.research.id(), tasks.content.id())
        .set_start_task(tasks.get_user_input.id());

    Arc::new(builder.build())
}

fn new_session_id() -> String {
    format!("flow-{}", Uuid::new_v4())
}

/// Per-run inputs.
#[derive(Debug, Clone, Default)]
pub struct FlowOptions {
    pub topic: String,
    pub industry: String,
    pub session_id: Option<String>,
    /// Pin the date handed to the crews; defaults to today.
    pub current_date: Option<NaiveDate>,
}

impl FlowOptions {
    pub fn new(topic: impl Into<String>, industry: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            industry: industry.into(),
            ..Self::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_current_date(mut self, date: NaiveDate) -> Self {
        self.current_date = Some(date);
        self
    }
}

/// Everything a caller needs after a completed run.
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub session_id: String,
    pub state: FlowState,
    pub content: String,
    pub content_path: Option<PathBuf>,
    pub research_path: Option<PathBuf>,
    /// Why the research report was rejected, when it was.
    pub report_error: Option<String>,
    pub trace_events: Vec<TraceEvent>,
    pub trace_path: Option<PathBuf>,
}

impl FlowOutcome {
    pub fn trace_summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.trace_events)
    }
}

/// A fully wired flow: both crews built, graph assembled.
pub struct ContentFlow {
    graph: Arc<Graph>,
    tasks: FlowTasks,
    logging: LoggingConfig,
    base_dir: PathBuf,
}

impl ContentFlow {
    /// Build the flow with live Gemini/OpenAI and Serper clients, writing relative to the
    /// working directory.
    pub fn from_config(config: &Config) -> Result<Self> {
        let llm = build_llm_client(&config.llm, config.llm_api_key()?)?;
        let search: DynSearchTool =
            Arc::new(SerperSearch::new(&config.search, config.search_api_key()?)?);
        Self::from_parts(config, llm, search, ".")
    }

    /// Build the flow from explicit clients; every relative path resolves against `base_dir`.
    pub fn from_parts(
        config: &Config,
        llm: DynLlmClient,
        search: DynSearchTool,
        base_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let crew_dir = config.flow.crew_config_dir.as_deref();

        let settings = CrewSettings {
            base_dir: base_dir.clone(),
            research_output: config.flow.research_output.clone(),
            content_output: config.flow.content_output.clone(),
            search_results: config.search.num_results,
        };

        let research = research_crew(
            &load_crew_configs(CrewKind::Research, crew_dir)?,
            llm.clone(),
            search,
            &settings,
        )
        .context("failed to assemble research crew")?;
        let content = content_crew(
            &load_crew_configs(CrewKind::Content, crew_dir)?,
            llm,
            &settings,
        )
        .context("failed to assemble content crew")?;

        let tasks = FlowTasks {
            get_user_input: Arc::new(GetUserInputTask),
            research: Arc::new(ResearchTask::new(
                Arc::new(research),
                base_dir.join(&config.flow.output_dir),
                config.flow.invalid_report,
            )),
            content: Arc::new(ContentTask::new(Arc::new(content))),
        };
        let graph = build_graph(&tasks);

        Ok(Self {
            graph,
            tasks,
            logging: config.logging.clone(),
            base_dir,
        })
    }

    /// Stage ids in execution order.
    pub fn stages(&self) -> [&str; 3] {
        self.tasks.ids()
    }

    #[instrument(name = "flow.run", skip(self, options), fields(topic = %options.topic))]
    pub async fn run(&self, options: FlowOptions) -> Result<FlowOutcome> {
        let started = Instant::now();
        let session_id = options.session_id.clone().unwrap_or_else(new_session_id);
        let result = self.execute(&session_id, &options).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => {
                record_flow_metrics("completed", elapsed_ms, outcome.report_error.is_some())
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "flow failed");
                record_flow_metrics("failed", elapsed_ms, false);
                self.record_failure(&session_id, &options, err);
            }
        }
        result
    }

    async fn execute(&self, session_id: &str, options: &FlowOptions) -> Result<FlowOutcome> {
        let storage = Arc::new(InMemorySessionStorage::new());
        let runner = FlowRunner::new(self.graph.clone(), storage.clone());

        let session_id = session_id.to_string();
        let session = Session::new_from_task(session_id.clone(), self.tasks.get_user_input.id());

        let mut state = FlowState::default();
        if let Some(date) = options.current_date {
            state = state.with_date(date);
        }
        session.context.set(STATE_KEY, &state).await;
        session.context.set(INPUT_TOPIC_KEY, options.topic.clone()).await;
        session
            .context
            .set(INPUT_INDUSTRY_KEY, options.industry.clone())
            .await;

        storage
            .save(session)
            .await
            .map_err(|err| anyhow!("failed to persist session: {err}"))?;

        loop {
            let result = runner
                .run(&session_id)
                .await
                .map_err(|err| anyhow!("flow execution failure: {err}"))?;

            match result.status {
                ExecutionStatus::Completed => break,
                ExecutionStatus::WaitingForInput => continue,
                ExecutionStatus::Error(message) => return Err(anyhow!(message)),
            }
        }

        let session = storage
            .get(&session_id)
            .await
            .map_err(|err| anyhow!("failed to reload session: {err}"))?
            .ok_or_else(|| anyhow!("session missing after execution"))?;
        let context = &session.context;

        let mut outcome = FlowOutcome {
            session_id: session_id.clone(),
            state: context
                .get(STATE_KEY)
                .await
                .ok_or_else(|| anyhow!("flow state missing after execution"))?,
            content: context.get(CONTENT_KEY).await.unwrap_or_default(),
            content_path: context.get::<String>(CONTENT_PATH_KEY).await.map(PathBuf::from),
            research_path: context
                .get::<String>(RESEARCH_PATH_KEY)
                .await
                .map(PathBuf::from),
            report_error: context.get(REPORT_ERROR_KEY).await,
            trace_events: context.get(TRACE_KEY).await.unwrap_or_default(),
            trace_path: None,
        };

        if let Some(trace_dir) = &self.logging.trace_dir {
            match persist_trace(self.base_dir.join(trace_dir), &session_id, &outcome.trace_events)
            {
                Ok(path) => outcome.trace_path = Some(path),
                Err(err) => warn!(error = %err, "failed to persist flow trace"),
            }
        }
        self.record_run(&outcome);

        info!(
            session_id = %outcome.session_id,
            report = outcome.state.research_report.is_some(),
            "flow completed"
        );
        Ok(outcome)
    }

    fn log_target(&self) -> FlowLogTarget {
        FlowLogTarget {
            dir: self.base_dir.join(&self.logging.dir),
            retention_days: self.logging.retention_days,
        }
    }

    fn record_run(&self, outcome: &FlowOutcome) {
        let display = |path: &Option<PathBuf>| path.as_ref().map(|p| p.display().to_string());
        let input = FlowLogInput {
            session_id: outcome.session_id.clone(),
            topic: outcome.state.topic.clone(),
            industry: outcome.state.industry.clone(),
            report_accepted: outcome.state.research_report.is_some(),
            report_error: outcome.report_error.clone(),
            research_path: display(&outcome.research_path),
            content_path: display(&outcome.content_path),
            trace_path: display(&outcome.trace_path),
            failure: None,
        };
        if let Err(err) = log_flow_completion(&self.log_target(), input) {
            warn!(error = %err, "failed to append flow log");
        }
    }

    fn record_failure(&self, session_id: &str, options: &FlowOptions, error: &anyhow::Error) {
        let input = FlowLogInput {
            session_id: session_id.to_string(),
            topic: options.topic.trim().to_string(),
            industry: options.industry.trim().to_string(),
            report_accepted: false,
            report_error: None,
            research_path: None,
            content_path: None,
            trace_path: None,
            failure: Some(format!("{error:#}")),
        };
        if let Err(err) = log_flow_completion(&self.log_target(), input) {
            warn!(error = %err, "failed to append flow log");
        }
    }
}

/// Build the live flow from configuration and run it once.
pub async fn run_content_flow(config: &Config, options: FlowOptions) -> Result<FlowOutcome> {
    ContentFlow::from_config(config)?.run(options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::search::StubSearch;

    #[test]
    fn stages_run_in_declared_order() {
        let config = Config::default();
        let flow = ContentFlow::from_parts(
            &config,
            Arc::new(ScriptedLlm::new(Vec::<String>::new())),
            Arc::new(StubSearch::new(vec![])),
            ".",
        )
        .unwrap();
        assert_eq!(flow.stages(), ["get_user_input", "research", "content"]);
    }

    #[test]
    fn session_ids_are_unique() {
        let first = new_session_id();
        assert!(first.starts_with("flow-"));
        assert_ne!(first, new_session_id());
    }
}
