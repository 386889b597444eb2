//! Web search tool available to research agents.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::SearchConfig;
use crate::{ContentFlowError, SecretValue};

const SERPER_BASE_URL: &str = "https://google.serper.dev";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    RequestFailed(String),
    #[error("search API error: {0}")]
    Api(String),
    #[error("search response parse error: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub published_date: Option<String>,
}

#[async_trait]
pub trait SearchTool: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, num_results: u32)
    -> Result<Vec<SearchResult>, SearchError>;
}

pub type DynSearchTool = Arc<dyn SearchTool>;

/// Google results through the Serper API.
pub struct SerperSearch {
    client: Client,
    api_key: SecretValue,
    base_url: String,
}

impl SerperSearch {
    pub fn new(config: &SearchConfig, api_key: SecretValue) -> Result<Self, ContentFlowError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| {
                ContentFlowError::InvalidConfiguration(format!(
                    "failed to build HTTP client: {err}"
                ))
            })?;
        Ok(Self {
            client,
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| SERPER_BASE_URL.to_string()),
        })
    }
}

#[derive(Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: u32,
}

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Deserialize)]
struct SerperResult {
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
    date: Option<String>,
}

impl From<SerperResult> for SearchResult {
    fn from(result: SerperResult) -> Self {
        Self {
            title: result.title,
            url: result.link,
            snippet: result.snippet,
            published_date: result.date,
        }
    }
}

#[async_trait]
impl SearchTool for SerperSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    #[instrument(name = "tool.serper", skip(self))]
    async fn search(
        &self,
        query: &str,
        num_results: u32,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("X-API-KEY", self.api_key.expose())
            .json(&SerperRequest {
                q: query,
                num: num_results,
            })
            .send()
            .await
            .map_err(|err| SearchError::RequestFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SearchError::Api(format!(
                "Serper returned {}",
                response.status()
            )));
        }

        let body: SerperResponse = response
            .json()
            .await
            .map_err(|err| SearchError::ParseError(err.to_string()))?;

        let results: Vec<SearchResult> = body
            .organic
            .into_iter()
            .take(num_results as usize)
            .map(SearchResult::from)
            .collect();
        info!(count = results.len(), "search returned results");
        Ok(results)
    }
}

/// Returns the same results for every query and remembers what was asked.
pub struct StubSearch {
    results: Vec<SearchResult>,
    queries: Mutex<Vec<String>>,
}

impl StubSearch {
    pub fn new(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl SearchTool for StubSearch {
    fn name(&self) -> &str {
        "stub_search"
    }

    async fn search(
        &self,
        query: &str,
        num_results: u32,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(query.to_string());
        Ok(self
            .results
            .iter()
            .take(num_results as usize)
            .cloned()
            .collect())
    }
}

/// Render results as a numbered list for inclusion in a prompt.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "(no search results)".to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(idx, result)| {
            let date = result
                .published_date
                .as_deref()
                .map(|date| format!(" ({date})"))
                .unwrap_or_default();
            format!(
                "{}. {}{}\n   {}\n   {}",
                idx + 1,
                result.title,
                date,
                result.url,
                result.snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
