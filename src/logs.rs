//! Structured per-workflow logging with a query interface.
//!
//! Each workflow accumulates an ordered log of phase-tagged entries,
//! persisted as one JSON document under `<project>/.faber/logs/<id>.json`.
//! Phase durations come from a monotonic clock. Entries below the
//! configured minimum level are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

/// Log levels, lowest to highest severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            _ => anyhow::bail!("Unknown log level '{}'", s),
        }
    }
}

/// Terminal status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            _ => anyhow::bail!(
                "Invalid status '{}'. Must be one of: running, completed, failed, cancelled",
                s
            ),
        }
    }
}

/// A single log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub phase: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Complete log for one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLog {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
    pub current_phase: String,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub summary: Map<String, Value>,
}

struct Active {
    log: WorkflowLog,
    phase_starts: HashMap<String, Instant>,
}

/// Per-workflow log store with file persistence.
pub struct LogStore {
    logs_dir: PathBuf,
    min_level: LogLevel,
    active: Mutex<Option<Active>>,
}

impl LogStore {
    /// Create a store rooted at `<project>/.faber/logs` (overridable via
    /// `FABER_LOGS_DIR`); the minimum level honours `FABER_LOG_LEVEL`.
    pub fn new(project_root: &Path) -> Self {
        let logs_dir = std::env::var("FABER_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_root.join(".faber/logs"));
        let min_level = std::env::var("FABER_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LogLevel::Info);
        Self {
            logs_dir,
            min_level,
            active: Mutex::new(None),
        }
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    // ========================================================================
    // Workflow lifecycle
    // ========================================================================

    /// Begin logging a new workflow.
    pub fn start_workflow(&self, workflow_id: &str, work_id: Option<&str>) {
        let log = WorkflowLog {
            workflow_id: workflow_id.to_string(),
            work_id: work_id.map(|w| w.to_string()),
            started_at: Utc::now(),
            ended_at: None,
            status: WorkflowStatus::Running,
            current_phase: "unknown".to_string(),
            entries: Vec::new(),
            summary: Map::new(),
        };
        *self.active.lock().expect("log store lock poisoned") = Some(Active {
            log,
            phase_starts: HashMap::new(),
        });

        self.info("unknown", &format!("Workflow started: {}", workflow_id));
    }

    /// End the current workflow, record the summary, and persist the log.
    pub fn end_workflow(
        &self,
        status: WorkflowStatus,
        summary: Option<Map<String, Value>>,
    ) -> Option<WorkflowLog> {
        self.info("unknown", &format!("Workflow {}", status));

        let mut guard = self.active.lock().expect("log store lock poisoned");
        let mut active = guard.take()?;
        active.log.ended_at = Some(Utc::now());
        active.log.status = status;
        active.log.summary = summary.unwrap_or_default();

        if let Err(e) = self.persist(&active.log) {
            warn!(error = %e, "Failed to persist workflow log");
        }
        Some(active.log)
    }

    /// Persist the in-progress log without ending it. Called by the engine
    /// after each phase so a crash never loses more than the current phase.
    pub fn save_current(&self) {
        let guard = self.active.lock().expect("log store lock poisoned");
        if let Some(active) = guard.as_ref() {
            if let Err(e) = self.persist(&active.log) {
                warn!(error = %e, "Failed to persist workflow log");
            }
        }
    }

    fn persist(&self, log: &WorkflowLog) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.logs_dir)?;
        let path = self.logs_dir.join(format!("{}.json", log.workflow_id));
        let serialized = serde_json::to_string_pretty(log)?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    // ========================================================================
    // Phase tracking
    // ========================================================================

    /// Mark a phase as started (monotonic timer begins).
    pub fn start_phase(&self, phase: &str) {
        {
            let mut guard = self.active.lock().expect("log store lock poisoned");
            if let Some(active) = guard.as_mut() {
                active.log.current_phase = phase.to_string();
                active.phase_starts.insert(phase.to_string(), Instant::now());
            }
        }
        self.info(phase, &format!("Phase started: {}", phase));
    }

    /// Mark a phase as ended, returning its elapsed milliseconds.
    pub fn end_phase(
        &self,
        phase: &str,
        status: &str,
        result: Option<Map<String, Value>>,
    ) -> Option<u64> {
        let duration_ms = {
            let mut guard = self.active.lock().expect("log store lock poisoned");
            guard.as_mut().and_then(|active| {
                active
                    .phase_starts
                    .remove(phase)
                    .map(|start| start.elapsed().as_millis() as u64)
            })
        };

        self.log(
            LogLevel::Info,
            phase,
            &format!("Phase {}: {}", status, phase),
            None,
            None,
            duration_ms,
            result,
        );
        duration_ms
    }

    // ========================================================================
    // Logging
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        level: LogLevel,
        phase: &str,
        message: &str,
        agent: Option<&str>,
        tool: Option<&str>,
        duration_ms: Option<u64>,
        metadata: Option<Map<String, Value>>,
    ) -> Option<LogEntry> {
        if level < self.min_level {
            return None;
        }

        let mut guard = self.active.lock().expect("log store lock poisoned");
        let (workflow_id, work_id) = match guard.as_ref() {
            Some(active) => (
                Some(active.log.workflow_id.clone()),
                active.log.work_id.clone(),
            ),
            None => (None, None),
        };

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            phase: phase.to_string(),
            message: message.to_string(),
            workflow_id,
            work_id,
            agent: agent.map(|a| a.to_string()),
            tool: tool.map(|t| t.to_string()),
            duration_ms,
            metadata: metadata.unwrap_or_default(),
        };

        if let Some(active) = guard.as_mut() {
            active.log.entries.push(entry.clone());
        }

        match level {
            LogLevel::Debug => tracing::debug!(phase = phase, "{}", message),
            LogLevel::Info => tracing::info!(phase = phase, "{}", message),
            LogLevel::Warning => tracing::warn!(phase = phase, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(phase = phase, "{}", message)
            }
        }

        Some(entry)
    }

    pub fn debug(&self, phase: &str, message: &str) -> Option<LogEntry> {
        self.log(LogLevel::Debug, phase, message, None, None, None, None)
    }

    pub fn info(&self, phase: &str, message: &str) -> Option<LogEntry> {
        self.log(LogLevel::Info, phase, message, None, None, None, None)
    }

    pub fn warning(&self, phase: &str, message: &str) -> Option<LogEntry> {
        self.log(LogLevel::Warning, phase, message, None, None, None, None)
    }

    pub fn error(&self, phase: &str, message: &str) -> Option<LogEntry> {
        self.log(LogLevel::Error, phase, message, None, None, None, None)
    }

    pub fn critical(&self, phase: &str, message: &str) -> Option<LogEntry> {
        self.log(LogLevel::Critical, phase, message, None, None, None, None)
    }

    /// Log a tool invocation with its input and outcome.
    pub fn log_tool_call(
        &self,
        phase: &str,
        tool_name: &str,
        input: &Value,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Option<LogEntry> {
        let level = if error.is_some() {
            LogLevel::Error
        } else {
            LogLevel::Debug
        };
        let message = format!(
            "Tool {}: {}",
            if error.is_some() { "failed" } else { "called" },
            tool_name
        );

        let mut metadata = Map::new();
        metadata.insert("input".to_string(), input.clone());
        if let Some(error) = error {
            metadata.insert("error".to_string(), Value::String(error.to_string()));
        }

        self.log(
            level,
            phase,
            &message,
            None,
            Some(tool_name),
            duration_ms,
            Some(metadata),
        )
    }

    /// Log an agent action.
    pub fn log_agent_action(
        &self,
        phase: &str,
        agent_name: &str,
        action: &str,
        details: Option<Map<String, Value>>,
    ) -> Option<LogEntry> {
        self.log(
            LogLevel::Info,
            phase,
            &format!("Agent action: {}", action),
            Some(agent_name),
            None,
            None,
            details,
        )
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Load a persisted workflow log by id.
    pub fn get_workflow_log(&self, workflow_id: &str) -> Option<WorkflowLog> {
        let path = self.logs_dir.join(format!("{}.json", workflow_id));
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// List persisted workflow logs, newest first, optionally filtered by
    /// status and work id.
    pub fn list_workflow_logs(
        &self,
        status: Option<WorkflowStatus>,
        work_id: Option<&str>,
        limit: usize,
    ) -> Vec<WorkflowLog> {
        let Ok(entries) = std::fs::read_dir(&self.logs_dir) else {
            return Vec::new();
        };

        let mut logs: Vec<WorkflowLog> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| {
                let content = std::fs::read_to_string(p).ok()?;
                serde_json::from_str::<WorkflowLog>(&content).ok()
            })
            .filter(|log| status.is_none_or(|s| log.status == s))
            .filter(|log| {
                work_id.is_none_or(|w| log.work_id.as_deref() == Some(w))
            })
            .collect();

        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        logs.truncate(limit);
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store(dir: &Path) -> LogStore {
        LogStore {
            logs_dir: dir.join("logs"),
            min_level: LogLevel::Debug,
            active: Mutex::new(None),
        }
    }

    #[test]
    fn test_workflow_lifecycle_persists_log() {
        let dir = tempdir().unwrap();
        let logs = store(dir.path());

        logs.start_workflow("WF-1", Some("42"));
        logs.start_phase("frame");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let duration = logs.end_phase("frame", "completed", None);
        assert!(duration.unwrap() >= 5);

        let finished = logs.end_workflow(WorkflowStatus::Completed, None).unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert!(finished.ended_at.is_some());

        let loaded = logs.get_workflow_log("WF-1").unwrap();
        assert_eq!(loaded.work_id.as_deref(), Some("42"));
        assert!(loaded.entries.iter().any(|e| e.message.contains("Phase started: frame")));
    }

    #[test]
    fn test_level_filtering() {
        let dir = tempdir().unwrap();
        let logs = store(dir.path()).with_min_level(LogLevel::Warning);

        logs.start_workflow("WF-1", None);
        assert!(logs.debug("frame", "hidden").is_none());
        assert!(logs.info("frame", "hidden too").is_none());
        assert!(logs.warning("frame", "visible").is_some());
        assert!(logs.critical("frame", "very visible").is_some());

        let finished = logs.end_workflow(WorkflowStatus::Failed, None).unwrap();
        // start/end workflow info entries are filtered at this level
        assert_eq!(finished.entries.len(), 2);
    }

    #[test]
    fn test_entries_carry_workflow_context() {
        let dir = tempdir().unwrap();
        let logs = store(dir.path());

        logs.start_workflow("WF-9", Some("77"));
        let entry = logs.info("build", "working").unwrap();
        assert_eq!(entry.workflow_id.as_deref(), Some("WF-9"));
        assert_eq!(entry.work_id.as_deref(), Some("77"));
    }

    #[test]
    fn test_tool_call_logging() {
        let dir = tempdir().unwrap();
        let logs = store(dir.path());
        logs.start_workflow("WF-1", None);

        let ok = logs
            .log_tool_call("build", "echo", &json!({"message": "hi"}), None, Some(12))
            .unwrap();
        assert_eq!(ok.level, LogLevel::Debug);
        assert_eq!(ok.tool.as_deref(), Some("echo"));

        let failed = logs
            .log_tool_call("build", "fetch", &json!({}), Some("timed out"), None)
            .unwrap();
        assert_eq!(failed.level, LogLevel::Error);
        assert_eq!(failed.metadata["error"], "timed out");
    }

    #[test]
    fn test_list_workflow_logs_filters_and_limits() {
        let dir = tempdir().unwrap();
        let logs = store(dir.path());

        for (id, work, status) in [
            ("WF-a", "1", WorkflowStatus::Completed),
            ("WF-b", "1", WorkflowStatus::Failed),
            ("WF-c", "2", WorkflowStatus::Completed),
        ] {
            logs.start_workflow(id, Some(work));
            logs.end_workflow(status, None);
        }

        let all = logs.list_workflow_logs(None, None, 50);
        assert_eq!(all.len(), 3);

        let completed = logs.list_workflow_logs(Some(WorkflowStatus::Completed), None, 50);
        assert_eq!(completed.len(), 2);

        let for_work_1 = logs.list_workflow_logs(None, Some("1"), 50);
        assert_eq!(for_work_1.len(), 2);

        let limited = logs.list_workflow_logs(None, None, 1);
        assert_eq!(limited.len(), 1);
        // Newest first
        assert_eq!(limited[0].workflow_id, "WF-c");
    }

    #[test]
    fn test_get_missing_log_returns_none() {
        let dir = tempdir().unwrap();
        let logs = store(dir.path());
        assert!(logs.get_workflow_log("WF-missing").is_none());
    }

    #[test]
    fn test_end_workflow_summary() {
        let dir = tempdir().unwrap();
        let logs = store(dir.path());

        logs.start_workflow("WF-1", None);
        let mut summary = Map::new();
        summary.insert("total_cost_usd".to_string(), json!(1.25));
        let finished = logs
            .end_workflow(WorkflowStatus::Completed, Some(summary))
            .unwrap();
        assert_eq!(finished.summary["total_cost_usd"], 1.25);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "completed".parse::<WorkflowStatus>().unwrap(),
            WorkflowStatus::Completed
        );
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }
}
