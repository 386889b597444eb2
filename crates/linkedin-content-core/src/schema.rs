//! Shared flow state and the research report contract between the two crews.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::ContentFlowError;
use crate::crew::CrewInputs;
use crate::llm::ResponseSchema;

/// Structured output of the research crew.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub summary: String,
    pub facts: Vec<String>,
    pub sources: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("research output is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("research output does not match the report schema: {0}")]
    Schema(#[source] serde_json::Error),
}

impl ResearchReport {
    /// JSON schema handed to the model so its answer matches this struct.
    pub fn response_schema() -> ResponseSchema {
        ResponseSchema::new(
            "research_report",
            json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string" },
                    "facts": { "type": "array", "items": { "type": "string" } },
                    "sources": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["summary", "facts", "sources"],
                "additionalProperties": false
            }),
        )
    }

    /// Validate an already-structured value against the report shape.
    ///
    /// A JSON string value is treated as JSON text, since models sometimes
    /// double-encode their structured answer.
    pub fn from_value(value: Value) -> Result<Self, ReportError> {
        match value {
            Value::String(text) => Self::from_text(&text),
            other => serde_json::from_value(other).map_err(ReportError::Schema),
        }
    }

    /// Parse raw model text, tolerating Markdown fences and surrounding prose.
    pub fn from_text(text: &str) -> Result<Self, ReportError> {
        let value: Value =
            serde_json::from_str(extract_json(text)).map_err(ReportError::Json)?;
        match value {
            Value::String(_) => Err(ReportError::Schema(serde::de::Error::custom(
                "expected a JSON object, found a string",
            ))),
            other => serde_json::from_value(other).map_err(ReportError::Schema),
        }
    }
}

/// Locate the JSON document inside raw model text.
///
/// Accepts bare JSON, a Markdown fence anywhere in the text (with or without
/// an info string, on one line or several), and otherwise falls back to the
/// outermost `{...}` slice.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with(['{', '[']) {
        return trimmed;
    }

    let candidate = fenced_body(trimmed).unwrap_or(trimmed);
    if candidate.starts_with(['{', '[', '"']) {
        return candidate;
    }

    match (candidate.find('{'), candidate.rfind('}')) {
        (Some(start), Some(end)) if start < end => &candidate[start..=end],
        _ => candidate,
    }
}

fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = text[start..]
        .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    let body = match rest.find("```") {
        Some(end) => &rest[..end],
        None => rest,
    };
    let body = body.trim();
    (!body.is_empty()).then_some(body)
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// State threaded through `get_user_input` -> `research` -> `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default = "today")]
    pub current_date: NaiveDate,
    #[serde(default)]
    pub research_report: Option<ResearchReport>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            topic: String::new(),
            industry: String::new(),
            current_date: today(),
            research_report: None,
        }
    }
}

impl FlowState {
    pub fn with_date(mut self, current_date: NaiveDate) -> Self {
        self.current_date = current_date;
        self
    }

    /// Store trimmed topic and industry; both must be non-empty after trimming.
    pub fn accept_input(&mut self, topic: &str, industry: &str) -> Result<(), ContentFlowError> {
        let topic = topic.trim();
        let industry = industry.trim();
        if topic.is_empty() {
            return Err(ContentFlowError::InvalidInput("topic must not be empty".into()));
        }
        if industry.is_empty() {
            return Err(ContentFlowError::InvalidInput(
                "industry must not be empty".into(),
            ));
        }
        self.topic = topic.to_string();
        self.industry = industry.to_string();
        Ok(())
    }

    pub fn research_inputs(&self) -> CrewInputs {
        let mut inputs = CrewInputs::new();
        inputs.insert("topic".into(), Value::String(self.topic.clone()));
        inputs.insert("industry".into(), Value::String(self.industry.clone()));
        inputs.insert(
            "current_date".into(),
            Value::String(self.current_date.format("%Y-%m-%d").to_string()),
        );
        inputs
    }

    /// Research inputs plus the report; an unset report is passed as an explicit `null`.
    pub fn content_inputs(&self) -> CrewInputs {
        let mut inputs = self.research_inputs();
        let report = self
            .research_report
            .as_ref()
            .and_then(|report| serde_json::to_value(report).ok())
            .unwrap_or(Value::Null);
        inputs.insert("research_report".into(), report);
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "summary": "Vector databases are moving into core banking stacks.",
            "facts": ["Fraud teams use similarity search", "Latency budgets are under 50ms"],
            "sources": ["https://example.com/a", "https://example.com/b"]
        })
    }

    #[test]
    fn accepts_structured_value() {
        let report = ResearchReport::from_value(sample()).unwrap();
        assert_eq!(report.facts.len(), 2);
        assert_eq!(report.sources[0], "https://example.com/a");
    }

    #[test]
    fn accepts_fenced_json_text() {
        let text = format!("```json\n{}\n```", sample());
        let report = ResearchReport::from_text(&text).unwrap();
        assert_eq!(report, ResearchReport::from_value(sample()).unwrap());
    }

    #[test]
    fn accepts_double_encoded_string() {
        let report = ResearchReport::from_value(Value::String(sample().to_string())).unwrap();
        assert!(report.summary.starts_with("Vector databases"));
    }

    #[test]
    fn ignores_unknown_fields() {
        let mut value = sample();
        value["confidence"] = json!(0.9);
        assert!(ResearchReport::from_value(value).is_ok());
    }

    #[test]
    fn rejects_missing_fields() {
        let err = ResearchReport::from_value(json!({"summary": "only"})).unwrap_err();
        assert!(matches!(err, ReportError::Schema(_)));
    }

    #[test]
    fn rejects_malformed_text() {
        let err = ResearchReport::from_text("{\"summary\": ").unwrap_err();
        assert!(matches!(err, ReportError::Json(_)));
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(extract_json("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```json\n{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json("```json {\"a\":1}```"), "{\"a\":1}");
        assert_eq!(extract_json("Report follows: {\"a\":1} Thanks!"), "{\"a\":1}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn accepts_single_line_fence_with_tag() {
        let text = format!("```json {}```", sample());
        let report = ResearchReport::from_text(&text).unwrap();
        assert_eq!(report, ResearchReport::from_value(sample()).unwrap());
    }

    #[test]
    fn accepts_prose_before_fence() {
        let text = format!("Here is the report:\n```json\n{}\n```  ", sample());
        let report = ResearchReport::from_text(&text).unwrap();
        assert_eq!(report.facts.len(), 2);
    }

    #[test]
    fn response_schema_requires_every_field() {
        let schema = ResearchReport::response_schema();
        assert_eq!(schema.name, "research_report");
        assert_eq!(schema.schema["required"], json!(["summary", "facts", "sources"]));
        assert!(ResearchReport::from_value(sample()).is_ok());
    }

    #[test]
    fn accept_input_trims_and_validates() {
        let mut state = FlowState::default();
        state.accept_input("  vector databases ", "\tfintech\n").unwrap();
        assert_eq!(state.topic, "vector databases");
        assert_eq!(state.industry, "fintech");

        let err = state.accept_input("   ", "fintech").unwrap_err();
        assert!(matches!(err, ContentFlowError::InvalidInput(_)));
        let err = state.accept_input("ai", "").unwrap_err();
        assert!(matches!(err, ContentFlowError::InvalidInput(_)));
    }

    #[test]
    fn content_inputs_carry_null_report_when_unset() {
        let state = FlowState::default()
            .with_date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        let inputs = state.content_inputs();
        assert_eq!(inputs["current_date"], json!("2024-03-09"));
        assert_eq!(inputs["research_report"], Value::Null);
    }

    #[test]
    fn state_serialises_date_as_iso() {
        let state = FlowState::default()
            .with_date(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["current_date"], json!("2025-01-02"));
    }
}
