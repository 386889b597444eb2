//! Hosted LLM clients used by crew agents.
//!
//! Two wire formats are supported: Gemini `generateContent` and the
//! OpenAI-compatible `chat/completions` endpoint (OpenAI, Ollama, proxies).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::{LlmConfig, LlmProvider};
use crate::{ContentFlowError, SecretValue};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),
    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("LLM response parse error: {0}")]
    ParseError(String),
    #[error("LLM returned no content")]
    EmptyResponse,
}

/// A single-turn completion: persona/system text plus the task prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// Ask the provider to constrain the answer to a JSON document.
    pub json_output: bool,
    /// Shape the JSON document must follow, when the provider supports it.
    pub response_schema: Option<ResponseSchema>,
}

/// Named JSON schema for structured output.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

impl ResponseSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

pub type DynLlmClient = Arc<dyn LlmClient>;

/// Build the configured provider client.
pub fn build_llm_client(
    config: &LlmConfig,
    api_key: SecretValue,
) -> Result<DynLlmClient, ContentFlowError> {
    let http = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|err| {
            ContentFlowError::InvalidConfiguration(format!("failed to build HTTP client: {err}"))
        })?;

    let client: DynLlmClient = match config.provider {
        LlmProvider::Gemini => Arc::new(GeminiClient {
            http,
            api_key,
            model: normalize_gemini_model(&config.model),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }),
        LlmProvider::OpenAi => Arc::new(OpenAiCompatClient {
            http,
            api_key,
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }),
    };
    Ok(client)
}

/// Accept LiteLLM-style identifiers such as `gemini/gemini-2.0-flash`.
fn normalize_gemini_model(model: &str) -> String {
    let model = model.trim();
    let model = model.strip_prefix("gemini/").unwrap_or(model);
    model.strip_prefix("models/").unwrap_or(model).to_string()
}

async fn post_json(
    request: reqwest::RequestBuilder,
    body: &Value,
) -> Result<Value, LlmError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|err| LlmError::RequestFailed(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status: status.as_u16(),
            message,
        });
    }

    response
        .json()
        .await
        .map_err(|err| LlmError::ParseError(err.to_string()))
}

pub struct GeminiClient {
    http: Client,
    api_key: SecretValue,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl GeminiClient {
    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut generation = json!({ "maxOutputTokens": self.max_tokens });
        if let Some(temperature) = self.temperature {
            generation["temperature"] = json!(temperature);
        }
        if request.json_output {
            generation["responseMimeType"] = json!("application/json");
            if let Some(schema) = &request.response_schema {
                generation["responseSchema"] = gemini_schema(&schema.schema);
            }
        }

        json!({
            "systemInstruction": { "parts": [{ "text": request.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation,
        })
    }
}

/// Gemini takes an OpenAPI subset: upper-case type names, no `additionalProperties`.
fn gemini_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| key.as_str() != "additionalProperties")
                .map(|(key, value)| {
                    let value = match (key.as_str(), value) {
                        ("type", Value::String(name)) => Value::String(name.to_uppercase()),
                        _ => gemini_schema(value),
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(gemini_schema).collect()),
        other => other.clone(),
    }
}

fn parse_gemini_response(json: &Value) -> Result<CompletionResponse, LlmError> {
    let parts = json["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or(LlmError::EmptyResponse)?;

    let content = parts
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    if content.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }

    let usage = json.get("usageMetadata").and_then(|u| {
        Some(TokenUsage {
            input_tokens: u["promptTokenCount"].as_u64()? as u32,
            output_tokens: u["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
            total_tokens: u["totalTokenCount"].as_u64()? as u32,
        })
    });

    Ok(CompletionResponse {
        content: content.trim().to_string(),
        usage,
    })
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(name = "llm.gemini", skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = self.request_body(&request);
        let json = post_json(
            self.http
                .post(url)
                .header("x-goog-api-key", self.api_key.expose()),
            &body,
        )
        .await?;

        let response = parse_gemini_response(&json)?;
        debug!(usage = ?response.usage, "gemini completion received");
        Ok(response)
    }
}

pub struct OpenAiCompatClient {
    http: Client,
    api_key: SecretValue,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl OpenAiCompatClient {
    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if request.json_output {
            body["response_format"] = match &request.response_schema {
                Some(schema) => json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": schema.name,
                        "schema": schema.schema,
                        "strict": true,
                    },
                }),
                None => json!({ "type": "json_object" }),
            };
        }
        body
    }
}

fn parse_openai_response(json: &Value) -> Result<CompletionResponse, LlmError> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .ok_or(LlmError::EmptyResponse)?;

    let usage = json.get("usage").and_then(|u| {
        Some(TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64()? as u32,
            output_tokens: u["completion_tokens"].as_u64()? as u32,
            total_tokens: u["total_tokens"].as_u64()? as u32,
        })
    });

    Ok(CompletionResponse {
        content: content.to_string(),
        usage,
    })
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(name = "llm.openai", skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.request_body(&request);
        let json = post_json(
            self.http
                .post(url)
                .bearer_auth(self.api_key.expose()),
            &body,
        )
        .await?;

        let response = parse_openai_response(&json)?;
        debug!(usage = ?response.usage, "chat completion received");
        Ok(response)
    }
}

/// Replays canned completions in order and records every request.
///
/// Used by tests and offline runs; returns `EmptyResponse` once the script is exhausted.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);
        let content = self
            .responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or(LlmError::EmptyResponse)?;
        Ok(CompletionResponse {
            content,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json_output: bool) -> CompletionRequest {
        CompletionRequest {
            system: "You are a researcher".into(),
            prompt: "Research vector databases".into(),
            json_output,
            response_schema: None,
        }
    }

    fn schema_request() -> CompletionRequest {
        CompletionRequest {
            response_schema: Some(ResponseSchema::new(
                "research_report",
                json!({
                    "type": "object",
                    "properties": {
                        "summary": { "type": "string" },
                        "facts": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["summary", "facts"],
                    "additionalProperties": false
                }),
            )),
            ..request(true)
        }
    }

    fn gemini() -> GeminiClient {
        GeminiClient {
            http: Client::new(),
            api_key: SecretValue::new("test"),
            model: "gemini-2.0-flash".into(),
            base_url: GEMINI_BASE_URL.into(),
            max_tokens: 2048,
            temperature: Some(0.2),
        }
    }

    #[test]
    fn normalizes_litellm_model_names() {
        assert_eq!(normalize_gemini_model("gemini/gemini-1.5-pro"), "gemini-1.5-pro");
        assert_eq!(normalize_gemini_model("models/gemini-2.0-flash"), "gemini-2.0-flash");
        assert_eq!(normalize_gemini_model(" gemini-2.0-flash "), "gemini-2.0-flash");
    }

    #[test]
    fn gemini_body_requests_json_when_asked() {
        let body = gemini().request_body(&request(true));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are a researcher");

        let body = gemini().request_body(&request(false));
        assert!(body["generationConfig"].get("responseMimeType").is_none());
    }

    #[test]
    fn gemini_body_carries_response_schema() {
        let body = gemini().request_body(&schema_request());
        let schema = &body["generationConfig"]["responseSchema"];
        assert_eq!(schema["type"], "OBJECT");
        assert_eq!(schema["properties"]["facts"]["type"], "ARRAY");
        assert_eq!(schema["properties"]["facts"]["items"]["type"], "STRING");
        assert_eq!(schema["required"], json!(["summary", "facts"]));
        assert!(schema.get("additionalProperties").is_none());

        let body = gemini().request_body(&request(true));
        assert!(body["generationConfig"].get("responseSchema").is_none());
    }

    #[test]
    fn parses_gemini_candidates() {
        let json = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hello " }, { "text": "world" }] } }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 2, "totalTokenCount": 12 }
        });
        let response = parse_gemini_response(&json).unwrap();
        assert_eq!(response.content, "Hello world");
        assert_eq!(response.usage.unwrap().total_tokens, 12);
    }

    #[test]
    fn gemini_without_candidates_is_empty() {
        let err = parse_gemini_response(&json!({ "candidates": [] })).unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }

    #[test]
    fn openai_body_and_response() {
        let client = OpenAiCompatClient {
            http: Client::new(),
            api_key: SecretValue::new("test"),
            model: "gpt-4o-mini".into(),
            base_url: OPENAI_BASE_URL.into(),
            max_tokens: 512,
            temperature: None,
        };
        let body = client.request_body(&request(true));
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["content"], "Research vector databases");
        assert!(body.get("temperature").is_none());

        let body = client.request_body(&schema_request());
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "research_report");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["properties"]["summary"]["type"],
            "string"
        );

        let json = json!({
            "choices": [{ "message": { "content": "  {\"summary\": \"x\"}  " } }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
        });
        let response = parse_openai_response(&json).unwrap();
        assert_eq!(response.content, "{\"summary\": \"x\"}");
        assert_eq!(response.usage.unwrap().output_tokens, 3);
    }
}
