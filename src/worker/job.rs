//! Job types and submission parsing
//!
//! Duration strings ("5m", "30s", "1h") are parsed at submission and invalid
//! ones fail fast; null means indefinite. Memory budgets are declared up
//! front and enforced by admission accounting plus engine data limits.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{FaztError, Result};

/// Default per-job memory budget when the spawn options omit one
pub const DEFAULT_JOB_MEMORY: u64 = 32 * 1024 * 1024;

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(FaztError::Database(format!("unknown job status {other}"))),
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Validated submission
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    /// Script path in the app's VFS; None runs the app's handler entry point
    pub script: Option<String>,
    pub daemon: bool,
    pub memory_bytes: u64,
    /// None = indefinite
    pub timeout: Option<Duration>,
    pub idle_channel: Option<String>,
    pub idle_timeout_ms: Option<u64>,
}

impl JobSpec {
    /// Parse spawn options from the script-facing map. Unknown keys are
    /// rejected so typos fail fast instead of silently defaulting.
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        let obj = options.as_object().ok_or_else(|| {
            FaztError::Validation(format!(
                "spawn options: got {}, expected object",
                crate::manifest::json_type(options)
            ))
        })?;

        const KNOWN: &[&str] = &[
            "name",
            "script",
            "daemon",
            "memory_mb",
            "timeout",
            "idle_channel",
            "idle_timeout_ms",
        ];
        for key in obj.keys() {
            if !KNOWN.contains(&key.as_str()) {
                return Err(FaztError::Validation(format!(
                    "spawn options: unknown key {key}"
                )));
            }
        }

        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| FaztError::Validation("spawn options: name is required".into()))?
            .to_string();

        let script = match obj.get("script") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(FaztError::Validation(format!(
                    "spawn options script: got {}, expected string",
                    crate::manifest::json_type(other)
                )))
            }
        };

        let daemon = match obj.get("daemon") {
            None => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(other) => {
                return Err(FaztError::Validation(format!(
                    "spawn options daemon: got {}, expected boolean",
                    crate::manifest::json_type(other)
                )))
            }
        };

        let memory_bytes = match obj.get("memory_mb") {
            None => DEFAULT_JOB_MEMORY,
            Some(v) => {
                let mb = v.as_u64().ok_or_else(|| {
                    FaztError::Validation(format!(
                        "spawn options memory_mb: got {}, expected number",
                        crate::manifest::json_type(v)
                    ))
                })?;
                if mb == 0 {
                    return Err(FaztError::Validation(
                        "spawn options memory_mb must be positive".into(),
                    ));
                }
                mb * 1024 * 1024
            }
        };

        let timeout = parse_timeout(obj.get("timeout"))?;

        let idle_channel = match obj.get("idle_channel") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(other) => {
                return Err(FaztError::Validation(format!(
                    "spawn options idle_channel: got {}, expected string",
                    crate::manifest::json_type(other)
                )))
            }
        };

        let idle_timeout_ms = match obj.get("idle_timeout_ms") {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                FaztError::Validation(format!(
                    "spawn options idle_timeout_ms: got {}, expected number",
                    crate::manifest::json_type(v)
                ))
            })?),
        };

        if idle_channel.is_some() != idle_timeout_ms.is_some() {
            return Err(FaztError::Validation(
                "idle_channel and idle_timeout_ms must be set together".into(),
            ));
        }

        Ok(Self {
            name,
            script,
            daemon,
            memory_bytes,
            timeout,
            idle_channel,
            idle_timeout_ms,
        })
    }
}

/// Parse a timeout value: null/absent = indefinite, strings go through
/// humantime ("5m", "30s", "1h").
fn parse_timeout(value: Option<&serde_json::Value>) -> Result<Option<Duration>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => humantime::parse_duration(s)
            .map(Some)
            .map_err(|e| FaztError::Validation(format!("timeout {s:?}: {e}"))),
        Some(other) => Err(FaztError::Validation(format!(
            "timeout: got {}, expected string or null",
            crate::manifest::json_type(other)
        ))),
    }
}

/// Persisted job row surfaced to scripts and the control plane
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub status: JobStatus,
    pub daemon: bool,
    pub memory_budget: u64,
    pub restart_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl JobInfo {
    pub fn new(id: String, app_id: &str, spec: &JobSpec) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id,
            app_id: app_id.to_string(),
            name: spec.name.clone(),
            status: JobStatus::Queued,
            daemon: spec.daemon,
            memory_budget: spec.memory_bytes,
            restart_count: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_options_default() {
        let spec = JobSpec::from_options(&json!({"name": "sync"})).unwrap();
        assert_eq!(spec.name, "sync");
        assert!(!spec.daemon);
        assert_eq!(spec.memory_bytes, DEFAULT_JOB_MEMORY);
        assert!(spec.timeout.is_none());
    }

    #[test]
    fn duration_strings_parse() {
        let spec =
            JobSpec::from_options(&json!({"name": "j", "timeout": "5m"})).unwrap();
        assert_eq!(spec.timeout, Some(Duration::from_secs(300)));

        let spec =
            JobSpec::from_options(&json!({"name": "j", "timeout": "30s"})).unwrap();
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));

        let spec = JobSpec::from_options(&json!({"name": "j", "timeout": null})).unwrap();
        assert!(spec.timeout.is_none());
    }

    #[test]
    fn invalid_durations_fail_fast() {
        assert!(JobSpec::from_options(&json!({"name": "j", "timeout": "soon"})).is_err());
        assert!(JobSpec::from_options(&json!({"name": "j", "timeout": 5})).is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = JobSpec::from_options(&json!({"name": "j", "demon": true})).unwrap_err();
        assert!(err.to_string().contains("unknown key demon"));
    }

    #[test]
    fn idle_fields_must_pair() {
        assert!(JobSpec::from_options(&json!({"name": "j", "idle_channel": "c"})).is_err());
        assert!(JobSpec::from_options(
            &json!({"name": "j", "idle_channel": "c", "idle_timeout_ms": 1000})
        )
        .is_ok());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
