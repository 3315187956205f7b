//! Workflow runtime state.
//!
//! `WorkflowState` is the full record threaded through phases. Transitions
//! are structural updates: the engine clones the prior value and applies
//! field changes, so snapshots held by concurrent readers stay valid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The five pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Frame,
    Architect,
    Build,
    Evaluate,
    Release,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Frame,
        Phase::Architect,
        Phase::Build,
        Phase::Evaluate,
        Phase::Release,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Frame => "frame",
            Phase::Architect => "architect",
            Phase::Build => "build",
            Phase::Evaluate => "evaluate",
            Phase::Release => "release",
        }
    }

    /// Errors in frame or architect are fatal; build and evaluate errors
    /// flow through the retry loop.
    pub fn is_fatal_on_error(&self) -> bool {
        matches!(self, Phase::Frame | Phase::Architect)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "frame" => Ok(Phase::Frame),
            "architect" => Ok(Phase::Architect),
            "build" => Ok(Phase::Build),
            "evaluate" => Ok(Phase::Evaluate),
            "release" => Ok(Phase::Release),
            _ => anyhow::bail!(
                "Unknown phase '{}'. Valid phases: frame, architect, build, evaluate, release",
                s
            ),
        }
    }
}

/// Outcome status of a phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
}

/// GO/NO-GO decision from the evaluate phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evaluation {
    #[serde(rename = "GO")]
    Go,
    #[serde(rename = "NO_GO")]
    NoGo,
}

impl std::fmt::Display for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Evaluation::Go => write!(f, "GO"),
            Evaluation::NoGo => write!(f, "NO_GO"),
        }
    }
}

/// Result of one phase execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn completed(phase: &str, duration_ms: u64, output: Map<String, Value>) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::Completed,
            duration_ms: Some(duration_ms),
            output,
            error: None,
        }
    }

    pub fn failed(phase: &str, error: &str) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::Failed,
            duration_ms: None,
            output: Map::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn skipped(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::Skipped,
            duration_ms: None,
            output: Map::new(),
            error: None,
        }
    }
}

/// Full runtime state for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    // Identification
    pub workflow_id: String,
    pub work_id: String,
    pub created_at: DateTime<Utc>,

    // Phase tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    #[serde(default)]
    pub completed_phases: Vec<String>,
    #[serde(default)]
    pub phase_results: BTreeMap<String, PhaseResult>,

    // Frame outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<String>>,

    // Architect outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<String>,
    #[serde(default)]
    pub spec_validated: bool,

    // Build outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub commits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_modified: Option<Vec<String>>,

    // Evaluate outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_result: Option<Evaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_details: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,

    // Release outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,

    // Human-in-the-loop
    #[serde(default)]
    pub awaiting_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request: Option<Value>,

    // Cost rollup
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_limit_usd: Option<f64>,
    #[serde(default)]
    pub budget_approved: bool,

    // Error tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_phase: Option<String>,
}

/// Generate a globally unique workflow id for a work item. Two concurrent
/// runs for the same work item never collide.
pub fn new_workflow_id(work_id: &str) -> String {
    format!(
        "WF-{}-{}",
        work_id,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

/// Construct the initial state for a workflow run.
pub fn create_initial_state(
    workflow_id: &str,
    work_id: &str,
    budget_limit_usd: Option<f64>,
) -> WorkflowState {
    WorkflowState {
        workflow_id: workflow_id.to_string(),
        work_id: work_id.to_string(),
        created_at: Utc::now(),
        current_phase: None,
        completed_phases: Vec::new(),
        phase_results: BTreeMap::new(),
        work_type: None,
        requirements: None,
        spec_id: None,
        spec_path: None,
        spec_validated: false,
        branch_name: None,
        commits: Vec::new(),
        files_modified: None,
        evaluation_result: None,
        evaluation_details: None,
        retry_count: 0,
        pr_number: None,
        pr_url: None,
        awaiting_approval: false,
        approval_request: None,
        total_tokens: 0,
        total_cost_usd: 0.0,
        budget_limit_usd,
        budget_approved: false,
        error: None,
        error_phase: None,
    }
}

impl WorkflowState {
    /// Record a phase result, appending to `completed_phases` when the
    /// status is completed and the phase is not already listed (retries
    /// re-enter phases without duplicating entries).
    pub fn record_phase_result(&mut self, result: PhaseResult) {
        if result.status == PhaseStatus::Completed
            && !self.completed_phases.contains(&result.phase)
        {
            self.completed_phases.push(result.phase.clone());
        }
        self.phase_results.insert(result.phase.clone(), result);
    }

    /// Whether a phase has a completed result.
    pub fn is_phase_completed(&self, phase: &str) -> bool {
        self.phase_results
            .get(phase)
            .is_some_and(|r| r.status == PhaseStatus::Completed)
    }

    /// Record a fatal phase error.
    pub fn record_error(&mut self, phase: &str, message: &str) {
        self.error = Some(message.to_string());
        self.error_phase = Some(phase.to_string());
    }
}
