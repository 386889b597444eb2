use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Core error type for the content flow.
#[derive(Debug, Error)]
pub enum ContentFlowError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ContentFlowError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// A stage failure within the flow graph. Stages never retry, so every failure ends the run.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub stage: &'static str,
    pub reason: String,
}

impl TaskError {
    pub fn terminal(stage: &'static str, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "terminal failure in stage `{}`: {}", self.stage, self.reason)
    }
}

impl std::error::Error for TaskError {}

impl From<TaskError> for graph_flow::GraphError {
    fn from(err: TaskError) -> Self {
        graph_flow::GraphError::TaskExecutionFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_display_names_stage() {
        let err = TaskError::terminal("get_user_input", "topic must not be empty");
        assert_eq!(
            err.to_string(),
            "terminal failure in stage `get_user_input`: topic must not be empty"
        );
    }

    #[test]
    fn task_error_becomes_graph_failure() {
        let err: graph_flow::GraphError = TaskError::terminal("research", "no report").into();
        match err {
            graph_flow::GraphError::TaskExecutionFailed(message) => {
                assert_eq!(message, "terminal failure in stage `research`: no report");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
