use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, create_dir_all, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

const FLOW_LOG_FILE: &str = "flow.jsonl";
const AUDIT_LOG_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
        ),
        (
            "google_key",
            Regex::new(r"(AIza[0-9A-Za-z\-_]{35})").expect("invalid google_key regex"),
        ),
    ]
});

/// Where run records go and how long they are kept.
#[derive(Debug, Clone)]
pub struct FlowLogTarget {
    pub dir: PathBuf,
    pub retention_days: u64,
}

#[derive(Debug, Clone)]
pub struct FlowLogInput {
    pub session_id: String,
    pub topic: String,
    pub industry: String,
    pub report_accepted: bool,
    pub report_error: Option<String>,
    pub research_path: Option<String>,
    pub content_path: Option<String>,
    pub trace_path: Option<String>,
    /// Set when the run aborted; the record is then logged as `failed`.
    pub failure: Option<String>,
}

#[derive(Serialize)]
struct FlowLogRecord {
    timestamp: String,
    session_id: String,
    status: &'static str,
    error: Option<String>,
    topic: String,
    industry: String,
    report_status: &'static str,
    report_error: Option<String>,
    research_path: Option<String>,
    content_path: Option<String>,
    trace_path: Option<String>,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    session_id: String,
    redactions: Vec<String>,
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{}", line)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert((*name).to_string());
        }
    }
    output
}

fn sanitize_opt(input: Option<String>, redactions: &mut BTreeSet<String>) -> Option<String> {
    input.map(|value| sanitize_text(&value, redactions))
}

/// Append one record for a finished or failed flow run to `<dir>/YYYY/MM/flow.jsonl`.
///
/// Returns the path of the flow log that was written.
pub fn log_flow_completion(target: &FlowLogTarget, input: FlowLogInput) -> Result<PathBuf> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();

    let topic = sanitize_text(&input.topic, &mut redactions);
    let industry = sanitize_text(&input.industry, &mut redactions);
    let report_error = sanitize_opt(input.report_error, &mut redactions);
    let status = if input.failure.is_some() {
        "failed"
    } else {
        "completed"
    };
    let error = sanitize_opt(input.failure, &mut redactions);

    let record = FlowLogRecord {
        timestamp: timestamp.to_rfc3339(),
        session_id: input.session_id.clone(),
        status,
        error,
        topic,
        industry,
        report_status: if input.report_accepted {
            "accepted"
        } else {
            "missing"
        },
        report_error,
        research_path: input.research_path,
        content_path: input.content_path,
        trace_path: input.trace_path,
        redactions: redactions.into_iter().collect(),
    };

    let month_dir = target
        .dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    let flow_log_path = month_dir.join(FLOW_LOG_FILE);
    append_json_line(&flow_log_path, &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: record.timestamp.clone(),
            session_id: input.session_id.clone(),
            redactions: record.redactions.clone(),
        };
        append_json_line(&month_dir.join(AUDIT_LOG_FILE), &audit)?;
        warn!(
            session_id = %input.session_id,
            fields = ?record.redactions,
            "redacted potential secrets from flow log"
        );
    }

    enforce_retention(&target.dir, target.retention_days)?;

    Ok(flow_log_path)
}

fn enforce_retention(base_dir: &Path, retention_days: u64) -> Result<()> {
    if retention_days == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn input(topic: &str) -> FlowLogInput {
        FlowLogInput {
            session_id: "flow-test".to_string(),
            topic: topic.to_string(),
            industry: "fintech".to_string(),
            report_accepted: true,
            report_error: None,
            research_path: Some("output/research_result.json".to_string()),
            content_path: Some("content_result.txt".to_string()),
            trace_path: None,
            failure: None,
        }
    }

    #[test]
    fn flow_logging_persists_record() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let target = FlowLogTarget {
            dir: temp.path().to_path_buf(),
            retention_days: 0,
        };

        let path = log_flow_completion(&target, input("vector databases"))?;
        assert!(path.ends_with(FLOW_LOG_FILE));

        let line = fs::read_to_string(&path)?;
        let record: Value = serde_json::from_str(line.trim())?;
        assert_eq!(record["session_id"], "flow-test");
        assert_eq!(record["status"], "completed");
        assert!(record["error"].is_null());
        assert_eq!(record["report_status"], "accepted");
        assert_eq!(record["redactions"].as_array().map(Vec::len), Some(0));
        assert!(!path.with_file_name(AUDIT_LOG_FILE).exists());
        Ok(())
    }

    #[test]
    fn secrets_are_redacted_and_audited() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let target = FlowLogTarget {
            dir: temp.path().to_path_buf(),
            retention_days: 90,
        };
        let mut input = input("leaked api_key=abcd1234 here");
        input.report_error = Some("upstream said bearer XYZ123".to_string());
        input.report_accepted = false;

        let path = log_flow_completion(&target, input)?;
        let record: Value = serde_json::from_str(fs::read_to_string(&path)?.trim())?;
        assert_eq!(record["topic"], "leaked api_key=[REDACTED] here");
        assert!(record["report_error"].as_str().unwrap().contains("[REDACTED]"));
        assert_eq!(record["report_status"], "missing");

        let audit = fs::read_to_string(path.with_file_name(AUDIT_LOG_FILE))?;
        assert!(audit.contains("api_key"));
        assert!(audit.contains("bearer"));
        Ok(())
    }

    #[test]
    fn failed_runs_are_logged_with_redacted_error() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let target = FlowLogTarget {
            dir: temp.path().to_path_buf(),
            retention_days: 0,
        };
        let mut input = input("vector databases");
        input.report_accepted = false;
        input.research_path = None;
        input.content_path = None;
        input.failure = Some("research stage failed: secret=hunter2".to_string());

        let path = log_flow_completion(&target, input)?;
        let record: Value = serde_json::from_str(fs::read_to_string(&path)?.trim())?;
        assert_eq!(record["status"], "failed");
        assert_eq!(record["error"], "research stage failed: secret=[REDACTED]");
        assert!(record["content_path"].is_null());
        assert!(fs::read_to_string(path.with_file_name(AUDIT_LOG_FILE))?.contains("secret"));
        Ok(())
    }

    #[test]
    fn sanitizer_handles_bare_tokens() {
        let mut redactions = BTreeSet::new();
        let text = sanitize_text("token sk-abcdef1234567890XYZ", &mut redactions);
        assert_eq!(text, "token [REDACTED]");
        assert!(redactions.contains("sk_token"));
    }
}
