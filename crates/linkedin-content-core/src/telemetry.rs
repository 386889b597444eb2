use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

use crate::ContentFlowError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Options for the process-wide tracing subscriber.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Filter directive; `RUST_LOG` wins when set, then this, then `info`.
    pub env_filter: Option<String>,
    pub with_ansi: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
        }
    }
}

impl TelemetryOptions {
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            env_filter: Some(level.into()),
            ..Self::default()
        }
    }
}

fn resolve_filter(options: &TelemetryOptions) -> String {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| options.env_filter.clone())
        .unwrap_or_else(|| "info".to_string())
}

/// Initialise the global tracing subscriber.
///
/// Safe to call multiple times; only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), ContentFlowError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(resolve_filter(&options)))
        .with_ansi(options.with_ansi)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| {
            ContentFlowError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
