use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{ContentFlowError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "LINKEDIN_CONTENT_CONFIG";
const MODEL_ENV: &str = "MODEL";

/// Top-level configuration, built once and injected into clients and the flow.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub flow: FlowConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, ContentFlowError> {
        require_env(&self.llm.api_key_env)
    }

    pub fn search_api_key(&self) -> Result<SecretValue, ContentFlowError> {
        require_env(&self.search.api_key_env)
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `LINKEDIN_CONTENT_CONFIG` environment variable.
    /// 3. `config.toml` in the current working directory.
    ///
    /// An explicit path must exist; a missing default file falls back to
    /// built-in defaults. `MODEL` overrides `llm.model` in every case.
    pub fn load(path: Option<PathBuf>) -> Result<Config, ContentFlowError> {
        let config = Self::resolve(path)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Same resolution as [`ConfigLoader::load`] without checking secrets or the model.
    pub fn resolve(path: Option<PathBuf>) -> Result<Config, ContentFlowError> {
        let explicit = path.is_some() || env_path().is_some();
        let candidate = resolve_path(path);

        let mut config = if !explicit && !candidate.exists() {
            Config::default()
        } else {
            Self::from_file(&candidate)?
        };

        if let Ok(model) = env::var(MODEL_ENV) {
            if !model.trim().is_empty() {
                config.llm.model = model.trim().to_string();
            }
        }

        Ok(config)
    }

    /// Parse a configuration file without touching the environment.
    pub fn from_file(path: &Path) -> Result<Config, ContentFlowError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| ContentFlowError::config_io(path.to_path_buf(), err))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Config, ContentFlowError> {
        toml::from_str(raw).map_err(|err| ContentFlowError::InvalidConfiguration(err.to_string()))
    }

    fn validate(config: &Config) -> Result<(), ContentFlowError> {
        if config.llm.api_key_env.trim().is_empty() {
            return Err(ContentFlowError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.search.api_key_env.trim().is_empty() {
            return Err(ContentFlowError::InvalidConfiguration(
                "search.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.llm.model.trim().is_empty() {
            return Err(ContentFlowError::InvalidConfiguration(
                "llm.model must not be empty (set it in config.toml or via MODEL)".into(),
            ));
        }

        // Ensure secrets exist at load time to discourage inline keys.
        config.llm_api_key()?;
        config.search_api_key()?;
        Ok(())
    }
}

fn env_path() -> Option<PathBuf> {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Some(from_env) = env_path() {
        return from_env;
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Gemini,
    #[serde(alias = "openai-compatible")]
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Gemini,
            model: "gemini-2.0-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            base_url: None,
            max_tokens: 2048,
            temperature: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub num_results: u32,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: "SERPER_API_KEY".to_string(),
            base_url: None,
            num_results: 5,
            timeout_secs: 30,
        }
    }
}

/// What to do when the research crew returns something that is not a valid report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidReportPolicy {
    /// Log, surface the error in the outcome, and run the content crew with a `null` report.
    #[default]
    Continue,
    /// Fail the flow before the content crew runs.
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub output_dir: PathBuf,
    pub research_output: PathBuf,
    pub content_output: PathBuf,
    pub invalid_report: InvalidReportPolicy,
    pub crew_config_dir: Option<PathBuf>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            research_output: PathBuf::from("output/research_result.json"),
            content_output: PathBuf::from("content_result.txt"),
            invalid_report: InvalidReportPolicy::Continue,
            crew_config_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    pub retention_days: u64,
    pub trace_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("data/logs"),
            retention_days: 90,
            trace_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ConfigLoader::from_toml("").unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Gemini);
        assert_eq!(config.llm.max_tokens, 2048);
        assert_eq!(config.search.num_results, 5);
        assert_eq!(
            config.flow.research_output,
            PathBuf::from("output/research_result.json")
        );
        assert_eq!(config.flow.content_output, PathBuf::from("content_result.txt"));
        assert_eq!(config.flow.invalid_report, InvalidReportPolicy::Continue);
    }

    #[test]
    fn parses_sections() {
        let raw = r#"
            [llm]
            provider = "openai"
            model = "gpt-4o-mini"
            api_key_env = "OPENAI_API_KEY"
            base_url = "http://localhost:11434/v1"
            temperature = 0.4

            [flow]
            invalid_report = "abort"
            crew_config_dir = "crews"

            [logging]
            level = "debug"
            trace_dir = "data/traces"
        "#;
        let config = ConfigLoader::from_toml(raw).unwrap();
        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert_eq!(config.llm.temperature, Some(0.4));
        assert_eq!(config.flow.invalid_report, InvalidReportPolicy::Abort);
        assert_eq!(config.flow.crew_config_dir, Some(PathBuf::from("crews")));
        assert_eq!(config.logging.trace_dir, Some(PathBuf::from("data/traces")));
        assert_eq!(config.logging.retention_days, 90);
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = ConfigLoader::from_toml("[llm]\nprovider = \"bard\"").unwrap_err();
        assert!(matches!(err, ContentFlowError::InvalidConfiguration(_)));
    }

    #[test]
    fn missing_explicit_file_is_an_io_error() {
        let err = ConfigLoader::from_file(Path::new("/nonexistent/linkedin.toml")).unwrap_err();
        assert!(matches!(err, ContentFlowError::ConfigIo { .. }));
    }

    #[test]
    fn validate_requires_secret_env() {
        let mut config = Config::default();
        config.llm.api_key_env = "LINKEDIN_CONTENT_TEST_NO_SUCH_KEY".into();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(matches!(err, ContentFlowError::MissingSecret(_)));
    }
}
