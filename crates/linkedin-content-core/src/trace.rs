use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub stage: String,
    pub message: String,
    pub timestamp_ms: u128,
}

impl TraceEvent {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            stage: stage.into(),
            message: message.into(),
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn from_events(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }

    pub fn record(&mut self, stage: impl Into<String>, message: impl Into<String>) {
        self.events.push(TraceEvent::new(stage, message));
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                stage: event.stage.clone(),
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }
        let mut output = String::from("### Flow Trace\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. {} -> {}", step.index, step.stage, step.message);
        }
        output
    }
}

pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    session_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{session_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn markdown_renders_steps_in_order() {
        let mut collector = TraceCollector::default();
        collector.record("research", "report accepted");
        collector.record("content", "post written");

        let markdown = TraceSummary::from_events(collector.events()).render_markdown();
        assert!(markdown.contains("1. research -> report accepted"));
        assert!(markdown.contains("2. content -> post written"));
        assert_eq!(TraceSummary::default().render_markdown(), "No trace events recorded.");
    }

    #[test]
    fn persists_events_as_json() {
        let dir = tempdir().unwrap();
        let events = vec![TraceEvent::new("get_user_input", "topic accepted")];
        let path = persist_trace(dir.path().join("traces"), "flow-1", &events).unwrap();
        assert!(path.ends_with("flow-1.json"));

        let restored: Vec<TraceEvent> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(restored, events);
    }
}
