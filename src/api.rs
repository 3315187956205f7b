//! Public API: run, resume, and inspect workflows.
//!
//! Thin composition layer: loads configuration, wires the engine's
//! collaborators (registry, tool executor, approval queue, cost tracker,
//! checkpoint store, log store), and drives the engine synchronously from
//! the caller's viewpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::approval::{ApprovalAdapter, ApprovalQueue, CliAdapter};
use crate::checkpoint;
use crate::config::{AutonomyLevel, FaberConfig};
use crate::cost::CostTracker;
use crate::definitions::DefinitionRegistry;
use crate::errors::{ConfigError, WorkflowError};
use crate::llm::{LlmFactory, ProviderFactory};
use crate::logs::{LogStore, WorkflowLog, WorkflowStatus};
use crate::tools::{FunctionRegistry, ToolExecutor};
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::graph::PhaseGraph;
use crate::workflow::runner::PhaseRunner;
use crate::workflow::schema::WorkflowDoc;
use crate::workflow::state::{create_initial_state, new_workflow_id, Evaluation, WorkflowState};

/// Options for a workflow run.
#[derive(Clone)]
pub struct WorkflowOptions {
    pub autonomy: Option<AutonomyLevel>,
    pub max_retries: Option<u32>,
    pub budget_usd: Option<f64>,
    pub skip_phases: Vec<String>,
    /// Custom workflow document; the default FABER pipeline otherwise.
    pub workflow_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub project_root: Option<PathBuf>,
    /// Extra approval adapters beyond the built-in `cli` channel.
    pub approval_adapters: Vec<Arc<dyn ApprovalAdapter>>,
    /// Trusted in-process tool functions, registered at startup.
    pub functions: Option<Arc<FunctionRegistry>>,
    /// Provider factory override (tests use a mock).
    pub llm_factory: Option<Arc<dyn LlmFactory>>,
    /// External cancellation signal.
    pub cancel: Option<CancellationToken>,
    /// Attach the observability project span to the run.
    pub trace: bool,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            autonomy: None,
            max_retries: None,
            budget_usd: None,
            skip_phases: Vec::new(),
            workflow_path: None,
            config_path: None,
            project_root: None,
            approval_adapters: Vec::new(),
            functions: None,
            llm_factory: None,
            cancel: None,
            trace: false,
        }
    }
}

/// Final result of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub work_id: String,
    pub status: WorkflowStatus,
    pub completed_phases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_phase: Option<String>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_result: Option<Evaluation>,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
}

/// Summary row for `list_workflows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub current_phase: String,
    pub entry_count: usize,
}

/// Run the workflow for a work item to completion.
pub async fn run_workflow(
    work_id: &str,
    options: WorkflowOptions,
) -> Result<WorkflowResult, WorkflowError> {
    if work_id.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "work_id".to_string(),
            message: "work_id cannot be empty".to_string(),
        }
        .into());
    }
    if let Some(budget) = options.budget_usd {
        if budget <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "budget_usd".to_string(),
                message: format!("must be positive, got {}", budget),
            }
            .into());
        }
    }

    let setup = Setup::prepare(&options)?;
    let workflow_id = new_workflow_id(work_id);
    let state = create_initial_state(
        &workflow_id,
        work_id,
        (setup.config.cost.budget_limit_usd > 0.0).then_some(setup.config.cost.budget_limit_usd),
    );

    let engine = setup.build_engine(&workflow_id, &options)?;
    let outcome = if options.trace && setup.config.langsmith.enabled {
        let span = tracing::info_span!(
            "workflow",
            workflow_id = %workflow_id,
            project = %setup.config.langsmith.project,
        );
        engine.run(state).instrument(span).await?
    } else {
        engine.run(state).await?
    };
    Ok(to_result(outcome.state, outcome.status))
}

/// Resume a checkpointed workflow by its id.
pub async fn resume_workflow(
    workflow_id: &str,
    options: WorkflowOptions,
) -> Result<WorkflowResult, WorkflowError> {
    let setup = Setup::prepare(&options)?;
    let engine = setup.build_engine(workflow_id, &options)?;
    let outcome = engine.resume(workflow_id).await?;
    Ok(to_result(outcome.state, outcome.status))
}

/// List workflow executions from the log store, newest first.
pub fn list_workflows(
    project_root: Option<&std::path::Path>,
    status: Option<WorkflowStatus>,
    work_id: Option<&str>,
    limit: usize,
) -> Result<Vec<WorkflowSummary>, WorkflowError> {
    if limit == 0 {
        return Err(ConfigError::InvalidValue {
            field: "limit".to_string(),
            message: "must be positive".to_string(),
        }
        .into());
    }

    let root = resolve_root(project_root.map(|p| p.to_path_buf()))?;
    let logs = LogStore::new(&root);
    Ok(logs
        .list_workflow_logs(status, work_id, limit)
        .into_iter()
        .map(|log| WorkflowSummary {
            workflow_id: log.workflow_id,
            work_id: log.work_id,
            status: log.status,
            started_at: log.started_at,
            ended_at: log.ended_at,
            current_phase: log.current_phase,
            entry_count: log.entries.len(),
        })
        .collect())
}

/// Fetch the full log for one workflow.
pub fn view_workflow(
    project_root: Option<&std::path::Path>,
    workflow_id: &str,
) -> Result<Option<WorkflowLog>, WorkflowError> {
    let root = resolve_root(project_root.map(|p| p.to_path_buf()))?;
    let logs = LogStore::new(&root);
    Ok(logs.get_workflow_log(workflow_id))
}

struct Setup {
    root: PathBuf,
    config: FaberConfig,
    graph: PhaseGraph,
}

impl Setup {
    fn prepare(options: &WorkflowOptions) -> Result<Self, WorkflowError> {
        let root = resolve_root(options.project_root.clone())?;
        let mut config = FaberConfig::load(&root, options.config_path.as_deref())?;

        if let Some(autonomy) = options.autonomy {
            config.autonomy = autonomy;
        }
        if let Some(max_retries) = options.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(budget) = options.budget_usd {
            config.cost.budget_limit_usd = budget;
        }
        for phase in &options.skip_phases {
            if let Some(settings) = config.phases.get_mut(phase) {
                settings.enabled = false;
            }
        }

        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "config".to_string(),
                message: problems.join("; "),
            }
            .into());
        }

        let graph = match &options.workflow_path {
            Some(path) => PhaseGraph::compile(&WorkflowDoc::load(path)?)?,
            None => {
                let mut graph = PhaseGraph::default_faber(&config);
                for phase in &mut graph.phases {
                    if options.skip_phases.contains(&phase.name) {
                        phase.enabled = false;
                    }
                }
                graph
            }
        };

        Ok(Self {
            root,
            config,
            graph,
        })
    }

    fn build_engine(
        &self,
        workflow_id: &str,
        options: &WorkflowOptions,
    ) -> Result<WorkflowEngine, WorkflowError> {
        let registry = Arc::new(DefinitionRegistry::new(&self.root));
        let functions = options
            .functions
            .clone()
            .unwrap_or_else(|| Arc::new(FunctionRegistry::new()));
        let executor = Arc::new(ToolExecutor::new(functions));
        let llm_factory: Arc<dyn LlmFactory> = options
            .llm_factory
            .clone()
            .unwrap_or_else(|| Arc::new(ProviderFactory));

        let runner = PhaseRunner::new(self.root.clone(), registry, executor, llm_factory);

        let mut queue = ApprovalQueue::new(
            self.config.approval.notify_channels.clone(),
            self.config.approval.response_channels.clone(),
            self.config.approval.timeout_minutes,
        );
        queue.register_adapter(Arc::new(CliAdapter::new()));
        for adapter in &options.approval_adapters {
            queue.register_adapter(Arc::clone(adapter));
        }

        let checkpoints: Arc<dyn checkpoint::CheckpointStore> =
            checkpoint::create_store(&self.root, &self.config.checkpointing)?.into();
        let tracker = Arc::new(CostTracker::new(workflow_id, self.config.cost.clone()));
        let logs = Arc::new(LogStore::new(&self.root));
        let cancel = options.cancel.clone().unwrap_or_default();

        Ok(WorkflowEngine::new(
            self.graph.clone(),
            runner,
            checkpoints,
            Arc::new(queue),
            tracker,
            logs,
            self.config.approval.timeout_minutes,
            cancel,
        ))
    }
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf, WorkflowError> {
    match root {
        Some(root) => Ok(root),
        None => std::env::current_dir()
            .map_err(|e| WorkflowError::Other(anyhow::anyhow!("cannot resolve cwd: {}", e))),
    }
}

fn to_result(state: WorkflowState, status: WorkflowStatus) -> WorkflowResult {
    WorkflowResult {
        workflow_id: state.workflow_id,
        work_id: state.work_id,
        status,
        completed_phases: state.completed_phases,
        pr_url: state.pr_url,
        spec_path: state.spec_path,
        branch_name: state.branch_name,
        error: state.error,
        error_phase: state.error_phase,
        retry_count: state.retry_count,
        evaluation_result: state.evaluation_result,
        total_cost_usd: state.total_cost_usd,
        total_tokens: state.total_tokens,
    }
}
