//! Minimal crew engine: role-playing agents executing YAML-declared tasks in order.
//!
//! A crew runs its tasks strictly sequentially. Each task sees the outputs of
//! the tasks it lists as context, or the previous task's output when it lists
//! none. Agents holding a search tool run one search per task and receive the
//! results in their prompt.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::llm::{CompletionRequest, DynLlmClient, LlmError, ResponseSchema};
use crate::schema::extract_json;
use crate::search::{DynSearchTool, SearchError, format_results};

/// Named values substituted into agent and task templates.
pub type CrewInputs = serde_json::Map<String, Value>;

const DEFAULT_SEARCH_QUERY: &str = "{topic} {industry}";
const DEFAULT_SEARCH_RESULTS: u32 = 5;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("invalid placeholder regex"));

#[derive(Debug, Error)]
pub enum CrewError {
    #[error("failed to read crew config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid crew config {name}: {source}")]
    ConfigParse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("crew `{crew}` has no {kind} named `{id}`")]
    Missing {
        crew: String,
        kind: &'static str,
        id: String,
    },
    #[error("task `{task}` uses `{context}` as context, but it does not run before it")]
    InvalidContext { task: String, context: String },
    #[error("crew `{0}` has no tasks")]
    Empty(String),
    #[error("task `{task}` failed: {source}")]
    Llm {
        task: String,
        #[source]
        source: LlmError,
    },
    #[error("search for task `{task}` failed: {source}")]
    Search {
        task: String,
        #[source]
        source: SearchError,
    },
    #[error("failed to write task output {path}: {source}")]
    OutputIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persona of an agent, as declared in `agents.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    pub role: String,
    pub goal: String,
    pub backstory: String,
}

/// Prompt unit, as declared in `tasks.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskConfig {
    pub description: String,
    pub expected_output: String,
    pub agent: String,
    /// Query template for agents holding a search tool.
    #[serde(default)]
    pub search_query: Option<String>,
}

/// Agent and task definitions for one crew.
#[derive(Debug, Clone, Default)]
pub struct CrewConfigSet {
    pub agents: BTreeMap<String, AgentConfig>,
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl CrewConfigSet {
    pub fn from_yaml(agents: &str, tasks: &str) -> Result<Self, CrewError> {
        let agents = serde_yaml::from_str(agents).map_err(|source| CrewError::ConfigParse {
            name: "agents.yaml".into(),
            source,
        })?;
        let tasks = serde_yaml::from_str(tasks).map_err(|source| CrewError::ConfigParse {
            name: "tasks.yaml".into(),
            source,
        })?;
        Ok(Self { agents, tasks })
    }

    /// Read `agents.yaml` and `tasks.yaml` from a directory.
    pub fn load(dir: &Path) -> Result<Self, CrewError> {
        let read = |name: &str| {
            let path = dir.join(name);
            fs::read_to_string(&path).map_err(|source| CrewError::ConfigIo { path, source })
        };
        Self::from_yaml(&read("agents.yaml")?, &read("tasks.yaml")?)
    }

    pub fn agent(&self, crew: &str, id: &str) -> Result<AgentConfig, CrewError> {
        self.agents.get(id).cloned().ok_or_else(|| CrewError::Missing {
            crew: crew.to_string(),
            kind: "agent config",
            id: id.to_string(),
        })
    }

    pub fn task(&self, crew: &str, id: &str) -> Result<TaskConfig, CrewError> {
        self.tasks.get(id).cloned().ok_or_else(|| CrewError::Missing {
            crew: crew.to_string(),
            kind: "task config",
            id: id.to_string(),
        })
    }
}

/// Replace `{name}` placeholders with kickoff inputs.
///
/// Strings are inserted verbatim, `null` becomes `(not available)` and any
/// other value is pretty-printed JSON. Unknown placeholders are left intact.
pub fn interpolate(template: &str, inputs: &CrewInputs) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match inputs.get(&caps[1]) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) => "(not available)".to_string(),
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_default(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub struct Agent {
    pub id: String,
    pub config: AgentConfig,
    pub tools: Vec<DynSearchTool>,
}

impl Agent {
    pub fn new(id: impl Into<String>, config: AgentConfig) -> Self {
        Self {
            id: id.into(),
            config,
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: DynSearchTool) -> Self {
        self.tools.push(tool);
        self
    }

    fn system_prompt(&self, inputs: &CrewInputs) -> String {
        format!(
            "You are {}. {}\nYour personal goal is: {}",
            interpolate(&self.config.role, inputs).trim(),
            interpolate(&self.config.backstory, inputs).trim(),
            interpolate(&self.config.goal, inputs).trim(),
        )
    }
}

pub struct CrewTask {
    pub id: String,
    pub config: TaskConfig,
    pub context: Vec<String>,
    pub output_file: Option<PathBuf>,
    pub output_json: bool,
    pub output_schema: Option<ResponseSchema>,
}

impl CrewTask {
    pub fn new(id: impl Into<String>, config: TaskConfig) -> Self {
        Self {
            id: id.into(),
            config,
            context: Vec::new(),
            output_file: None,
            output_json: false,
            output_schema: None,
        }
    }

    pub fn with_context(mut self, task_id: impl Into<String>) -> Self {
        self.context.push(task_id.into());
        self
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.output_json = true;
        self
    }

    /// JSON output constrained to `schema`.
    pub fn with_output_schema(mut self, schema: ResponseSchema) -> Self {
        self.output_json = true;
        self.output_schema = Some(schema);
        self
    }

    pub fn agent(&self) -> &str {
        &self.config.agent
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub agent_role: String,
    pub raw: String,
    pub json: Option<Value>,
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrewOutput {
    pub raw: String,
    pub json: Option<Value>,
    pub tasks_output: Vec<TaskOutput>,
}

pub struct Crew {
    name: String,
    agents: Vec<Agent>,
    tasks: Vec<CrewTask>,
    llm: DynLlmClient,
    base_dir: PathBuf,
    search_results: u32,
}

impl std::fmt::Debug for Crew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crew")
            .field("name", &self.name)
            .field("agents", &self.agents.iter().map(|a| &a.id).collect::<Vec<_>>())
            .field("tasks", &self.tasks.iter().map(|t| &t.id).collect::<Vec<_>>())
            .field("model", &self.llm.model())
            .finish()
    }
}

impl Crew {
    pub fn new(name: impl Into<String>, llm: DynLlmClient) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            tasks: Vec::new(),
            llm,
            base_dir: PathBuf::from("."),
            search_results: DEFAULT_SEARCH_RESULTS,
        }
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_task(mut self, task: CrewTask) -> Self {
        self.tasks.push(task);
        self
    }

    /// Directory that relative task output files are resolved against.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_search_results(mut self, count: u32) -> Self {
        self.search_results = count;
        self
    }

    /// Check that every task has a known agent and only earlier tasks as context.
    pub fn validate(self) -> Result<Self, CrewError> {
        if self.tasks.is_empty() {
            return Err(CrewError::Empty(self.name));
        }
        for (idx, task) in self.tasks.iter().enumerate() {
            if !self.agents.iter().any(|agent| agent.id == task.agent()) {
                return Err(CrewError::Missing {
                    crew: self.name.clone(),
                    kind: "agent",
                    id: task.agent().to_string(),
                });
            }
            for context in &task.context {
                if !self.tasks[..idx].iter().any(|earlier| &earlier.id == context) {
                    return Err(CrewError::InvalidContext {
                        task: task.id.clone(),
                        context: context.clone(),
                    });
                }
            }
        }
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[CrewTask] {
        &self.tasks
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    /// Run every task in declaration order and return the final task's output.
    #[instrument(name = "crew.kickoff", skip(self, inputs), fields(crew = %self.name))]
    pub async fn kickoff(&self, inputs: &CrewInputs) -> Result<CrewOutput, CrewError> {
        let mut outputs: Vec<TaskOutput> = Vec::with_capacity(self.tasks.len());

        for task in &self.tasks {
            let agent = self.agent(task.agent()).ok_or_else(|| CrewError::Missing {
                crew: self.name.clone(),
                kind: "agent",
                id: task.agent().to_string(),
            })?;

            let output = {
                let context: Vec<&TaskOutput> = if task.context.is_empty() {
                    outputs.last().into_iter().collect()
                } else {
                    task.context
                        .iter()
                        .filter_map(|id| outputs.iter().find(|output| &output.task_id == id))
                        .collect()
                };
                self.execute_task(task, agent, inputs, &context).await?
            };
            outputs.push(output);
        }

        let last = outputs
            .last()
            .cloned()
            .ok_or_else(|| CrewError::Empty(self.name.clone()))?;

        info!(tasks = outputs.len(), "crew finished");

        Ok(CrewOutput {
            raw: last.raw,
            json: last.json,
            tasks_output: outputs,
        })
    }

    #[instrument(name = "crew.task", skip_all, fields(task = %task.id, agent = %agent.id))]
    async fn execute_task(
        &self,
        task: &CrewTask,
        agent: &Agent,
        inputs: &CrewInputs,
        context: &[&TaskOutput],
    ) -> Result<TaskOutput, CrewError> {
        let search_block = self.run_tools(task, agent, inputs).await?;
        let prompt = build_task_prompt(task, inputs, context, search_block.as_deref());

        debug!(
            prompt_chars = prompt.len(),
            context_tasks = context.len(),
            "dispatching task to LLM"
        );

        let response = self
            .llm
            .complete(CompletionRequest {
                system: agent.system_prompt(inputs),
                prompt,
                json_output: task.output_json,
                response_schema: task.output_schema.clone(),
            })
            .await
            .map_err(|source| CrewError::Llm {
                task: task.id.clone(),
                source,
            })?;

        let raw = response.content;
        let json = if task.output_json {
            serde_json::from_str::<Value>(extract_json(&raw)).ok()
        } else {
            None
        };

        let output_file = match &task.output_file {
            Some(path) => Some(self.write_output(path, &raw, json.as_ref())?),
            None => None,
        };

        info!(
            output_chars = raw.len(),
            json = json.is_some(),
            "task completed"
        );

        Ok(TaskOutput {
            task_id: task.id.clone(),
            agent_role: interpolate(&agent.config.role, inputs).trim().to_string(),
            raw,
            json,
            output_file,
        })
    }

    async fn run_tools(
        &self,
        task: &CrewTask,
        agent: &Agent,
        inputs: &CrewInputs,
    ) -> Result<Option<String>, CrewError> {
        if agent.tools.is_empty() {
            return Ok(None);
        }

        let template = task
            .config
            .search_query
            .as_deref()
            .unwrap_or(DEFAULT_SEARCH_QUERY);
        let query = interpolate(template, inputs).trim().to_string();

        let mut blocks = Vec::with_capacity(agent.tools.len());
        for tool in &agent.tools {
            let results = tool
                .search(&query, self.search_results)
                .await
                .map_err(|source| CrewError::Search {
                    task: task.id.clone(),
                    source,
                })?;
            blocks.push(format!(
                "Results from {} for \"{}\":\n{}",
                tool.name(),
                query,
                format_results(&results)
            ));
        }
        Ok(Some(blocks.join("\n\n")))
    }

    fn write_output(
        &self,
        path: &Path,
        raw: &str,
        json: Option<&Value>,
    ) -> Result<PathBuf, CrewError> {
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| CrewError::OutputIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let body = match json {
            Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| raw.to_string()),
            None => raw.to_string(),
        };
        fs::write(&target, body).map_err(|source| CrewError::OutputIo {
            path: target.clone(),
            source,
        })?;
        debug!(path = %target.display(), "task output written");
        Ok(target)
    }
}

fn build_task_prompt(
    task: &CrewTask,
    inputs: &CrewInputs,
    context: &[&TaskOutput],
    search_block: Option<&str>,
) -> String {
    let mut prompt = format!(
        "{}\n\nThis is the expected criteria for your final answer:\n{}",
        interpolate(&task.config.description, inputs).trim(),
        interpolate(&task.config.expected_output, inputs).trim(),
    );

    if !context.is_empty() {
        prompt.push_str("\n\nThis is the context you're working with:");
        for output in context {
            prompt.push_str(&format!(
                "\n\n### Output of `{}` ({})\n{}",
                output.task_id, output.agent_role, output.raw
            ));
        }
    }

    if let Some(block) = search_block {
        prompt.push_str("\n\nWeb search results:\n");
        prompt.push_str(block);
    }

    if task.output_json {
        prompt.push_str("\n\nRespond with a single JSON document and nothing else.");
    }

    prompt
}
