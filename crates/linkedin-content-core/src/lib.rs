//! LinkedIn content flow built directly on top of `graph_flow`.
//!
//! A research crew (researcher + fact checker) produces a validated
//! `ResearchReport`; a content crew (writer + editor) turns it into a
//! LinkedIn post. The stages `get_user_input -> research -> content` run as a
//! linear `graph_flow` graph sharing one `FlowState`.

mod error;
mod security;

pub mod config;
pub mod crew;
pub mod crews;
pub mod llm;
pub mod logging;
mod metrics;
pub mod plot;
pub mod schema;
pub mod search;
pub mod tasks;
pub mod telemetry;
pub mod trace;
pub mod workflow;

pub use config::{Config, ConfigLoader, InvalidReportPolicy};
pub use crew::{Crew, CrewError, CrewInputs, CrewOutput, TaskOutput};
pub use error::{ContentFlowError, TaskError};
pub use llm::{DynLlmClient, LlmClient, ScriptedLlm};
pub use plot::{DEFAULT_PLOT_FILE, FlowDiagram};
pub use schema::{FlowState, ReportError, ResearchReport};
pub use search::{DynSearchTool, SearchResult, SearchTool, StubSearch};
pub use security::{SecretValue, require_env};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{ContentFlow, FlowOptions, FlowOutcome, run_content_flow};
