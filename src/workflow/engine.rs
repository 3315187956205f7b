//! The workflow engine: sequences phases over the graph, gates on human
//! approval, checkpoints around every phase, enforces the cost budget, and
//! honours cancellation at each cooperative point.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::UsageSink;
use crate::approval::ApprovalQueue;
use crate::checkpoint::CheckpointStore;
use crate::cost::{BudgetStatus, CostTracker};
use crate::errors::WorkflowError;
use crate::llm::TokenUsage;
use crate::logs::{LogStore, WorkflowStatus};
use crate::workflow::graph::{CompiledPhase, PhaseGraph};
use crate::workflow::runner::PhaseRunner;
use crate::workflow::state::{Phase, PhaseResult, PhaseStatus, WorkflowState};

/// Records usage after every LLM call and enforces the budget thresholds:
/// warn and continue, route an approval request, or interrupt the run.
pub struct BudgetGuard {
    tracker: Arc<CostTracker>,
    approval: Arc<ApprovalQueue>,
    logs: Arc<LogStore>,
}

impl BudgetGuard {
    pub fn new(
        tracker: Arc<CostTracker>,
        approval: Arc<ApprovalQueue>,
        logs: Arc<LogStore>,
    ) -> Self {
        Self {
            tracker,
            approval,
            logs,
        }
    }
}

#[async_trait]
impl UsageSink for BudgetGuard {
    async fn record(
        &self,
        model: &str,
        usage: TokenUsage,
        phase: &str,
    ) -> Result<(), WorkflowError> {
        let (_, status) = self.tracker.add_usage(
            model,
            usage.input_tokens,
            usage.output_tokens,
            Some(phase),
            None,
        );

        match status {
            BudgetStatus::Ok => Ok(()),
            BudgetStatus::Warning { spent, limit } => {
                self.logs.warning(
                    phase,
                    &format!("Budget warning: ${:.2} / ${:.2}", spent, limit),
                );
                Ok(())
            }
            BudgetStatus::ApprovalRequired { spent, limit } => {
                self.logs.warning(
                    phase,
                    &format!(
                        "Budget approval required: ${:.2} / ${:.2}",
                        spent, limit
                    ),
                );

                let mut context = Map::new();
                context.insert("total_cost_usd".to_string(), json!(spent));
                context.insert("budget_limit_usd".to_string(), json!(limit));

                let response = self
                    .approval
                    .request(
                        self.tracker.workflow_id(),
                        "budget",
                        &format!(
                            "Budget threshold reached (${:.2} of ${:.2}). Continue?",
                            spent, limit
                        ),
                        None,
                        Some(context),
                        None,
                    )
                    .await;

                if response.is_approved() {
                    self.tracker.approve_budget();
                    Ok(())
                } else {
                    Err(WorkflowError::BudgetRejected { spent, limit })
                }
            }
            BudgetStatus::Exceeded { spent, limit } => {
                Err(WorkflowError::BudgetExceeded { spent, limit })
            }
        }
    }
}

/// Final outcome of an engine run.
#[derive(Debug)]
pub struct EngineOutcome {
    pub state: WorkflowState,
    pub status: WorkflowStatus,
}

/// The workflow state machine.
pub struct WorkflowEngine {
    graph: PhaseGraph,
    runner: PhaseRunner,
    checkpoints: Arc<dyn CheckpointStore>,
    approval: Arc<ApprovalQueue>,
    tracker: Arc<CostTracker>,
    logs: Arc<LogStore>,
    approval_timeout_minutes: u64,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: PhaseGraph,
        runner: PhaseRunner,
        checkpoints: Arc<dyn CheckpointStore>,
        approval: Arc<ApprovalQueue>,
        tracker: Arc<CostTracker>,
        logs: Arc<LogStore>,
        approval_timeout_minutes: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            graph,
            runner,
            checkpoints,
            approval,
            tracker,
            logs,
            approval_timeout_minutes,
            cancel,
        }
    }

    /// Run a workflow from its initial state.
    pub async fn run(&self, state: WorkflowState) -> Result<EngineOutcome, WorkflowError> {
        let first = self
            .graph
            .first_phase()
            .ok_or_else(|| WorkflowError::PhaseFailed {
                phase: "<none>".to_string(),
                message: "workflow graph has no phases".to_string(),
            })?
            .name
            .clone();
        self.drive(state, &first).await
    }

    /// Resume a workflow from its last checkpoint: execution continues at
    /// the first phase without a completed result. Safe across process
    /// restarts on durable backends.
    pub async fn resume(&self, thread_id: &str) -> Result<EngineOutcome, WorkflowError> {
        let state = self.checkpoints.get(thread_id).await?.ok_or_else(|| {
            WorkflowError::CheckpointNotFound {
                workflow_id: thread_id.to_string(),
            }
        })?;

        let start = self
            .graph
            .phases
            .iter()
            .find(|p| !state.is_phase_completed(&p.name))
            .map(|p| p.name.clone());

        match start {
            Some(start) => self.drive(state, &start).await,
            None => {
                // Everything already completed; report as-is.
                Ok(EngineOutcome {
                    state,
                    status: WorkflowStatus::Completed,
                })
            }
        }
    }

    async fn drive(
        &self,
        mut state: WorkflowState,
        start_phase: &str,
    ) -> Result<EngineOutcome, WorkflowError> {
        self.logs
            .start_workflow(&state.workflow_id, Some(&state.work_id));

        let budget_guard = BudgetGuard::new(
            Arc::clone(&self.tracker),
            Arc::clone(&self.approval),
            Arc::clone(&self.logs),
        );

        let mut current = self.graph.phase(start_phase).cloned();

        let status = loop {
            let Some(phase) = current else {
                // Ran off the end of the pipeline.
                break self.terminal_status(&state);
            };

            if self.cancel.is_cancelled() {
                break WorkflowStatus::Cancelled;
            }

            if !phase.enabled {
                state.record_phase_result(PhaseResult::skipped(&phase.name));
                self.checkpoint(&state).await?;
                current = self.graph.next_phase(&phase.name, &state).cloned();
                continue;
            }

            // Human-approval gate, checkpointed before suspension.
            if phase.human_approval {
                match self.gate(&phase, &mut state).await? {
                    GateOutcome::Approved => {}
                    GateOutcome::Denied(decision) => {
                        self.logs.warning(
                            &phase.name,
                            &format!("Approval {} at {} gate", decision, phase.name),
                        );
                        break WorkflowStatus::Cancelled;
                    }
                }
            }

            // Checkpoint before the phase so a crash re-runs it cleanly.
            self.checkpoint(&state).await?;

            self.logs.start_phase(&phase.name);
            let result = self.runner.run_phase(&phase, &state, &budget_guard).await;

            state = match result {
                Ok(next) => next,
                Err(WorkflowError::BudgetExceeded { spent, limit }) => {
                    state.record_error(
                        &phase.name,
                        &format!("Budget exceeded: ${:.2} / ${:.2}", spent, limit),
                    );
                    self.logs.error(&phase.name, state.error.as_deref().unwrap_or(""));
                    self.sync_cost(&mut state);
                    self.checkpoint(&state).await?;
                    break WorkflowStatus::Failed;
                }
                Err(WorkflowError::BudgetRejected { .. }) | Err(WorkflowError::Cancelled) => {
                    self.sync_cost(&mut state);
                    break WorkflowStatus::Cancelled;
                }
                Err(other) => return Err(other),
            };

            self.sync_cost(&mut state);

            let phase_result = state.phase_results.get(&phase.name).cloned();
            let (status_str, result_meta) = match &phase_result {
                Some(result) => (
                    match result.status {
                        PhaseStatus::Completed => "completed",
                        PhaseStatus::Failed => "failed",
                        PhaseStatus::Skipped => "skipped",
                    },
                    Some(result.output.clone()),
                ),
                None => ("unknown", None),
            };
            self.logs.end_phase(&phase.name, status_str, result_meta);

            // Checkpoint after the phase result is recorded.
            self.checkpoint(&state).await?;
            self.logs.save_current();

            let failed = phase_result
                .as_ref()
                .is_some_and(|r| r.status == PhaseStatus::Failed);

            if failed {
                match self.route_failure(&phase, &mut state) {
                    FailureRoute::Terminal => break WorkflowStatus::Failed,
                    FailureRoute::Continue(next) => {
                        current = next;
                        continue;
                    }
                }
            }

            current = self.graph.next_phase(&phase.name, &state).cloned();
        };

        // Final checkpoint reflects the terminal status.
        if status == WorkflowStatus::Cancelled && state.error.is_none() {
            state.error = Some("Workflow cancelled".to_string());
        }
        self.checkpoint(&state).await?;

        let mut summary = Map::new();
        summary.insert("completed_phases".to_string(), json!(state.completed_phases));
        summary.insert("retry_count".to_string(), json!(state.retry_count));
        summary.insert("total_cost_usd".to_string(), json!(state.total_cost_usd));
        summary.insert("total_tokens".to_string(), json!(state.total_tokens));
        self.logs.end_workflow(status, Some(summary));

        info!(
            workflow_id = %state.workflow_id,
            status = %status,
            retries = state.retry_count,
            "Workflow finished"
        );

        Ok(EngineOutcome { state, status })
    }

    /// Issue the pre-phase approval gate. The state is checkpointed with
    /// `awaiting_approval` set before the queue suspends.
    async fn gate(
        &self,
        phase: &CompiledPhase,
        state: &mut WorkflowState,
    ) -> Result<GateOutcome, WorkflowError> {
        let question = format!(
            "Approve the {} phase for work item #{}?",
            phase.name, state.work_id
        );

        state.awaiting_approval = true;
        state.approval_request = Some(json!({
            "phase": phase.name,
            "question": question,
        }));
        self.checkpoint(state).await?;

        let mut context = Map::new();
        context.insert("work_id".to_string(), json!(state.work_id));
        context.insert("retry_count".to_string(), json!(state.retry_count));

        let response = self
            .approval
            .request(
                &state.workflow_id,
                &phase.name,
                &question,
                None,
                Some(context),
                Some(self.approval_timeout_minutes),
            )
            .await;

        state.awaiting_approval = false;
        state.approval_request = None;

        if response.is_approved() {
            Ok(GateOutcome::Approved)
        } else {
            Ok(GateOutcome::Denied(response.decision))
        }
    }

    /// Decide where a failed phase sends the workflow. Frame and architect
    /// failures are fatal; build and evaluate failures flow through the
    /// retry loop; custom phases retry through their own policy or stop.
    fn route_failure(
        &self,
        phase: &CompiledPhase,
        state: &mut WorkflowState,
    ) -> FailureRoute {
        match phase.name.parse::<Phase>() {
            Ok(p) if p.is_fatal_on_error() => FailureRoute::Terminal,
            Ok(Phase::Build) => {
                // A build error counts as a failed attempt; the retry bound
                // decides between another build pass and releasing with the
                // failure annotated.
                state.evaluation_result = Some(crate::workflow::state::Evaluation::NoGo);
                if phase.on_failure.is_none() && state.retry_count < self.graph.max_retries {
                    state.retry_count += 1;
                }
                let target = if state.retry_count < self.graph.max_retries {
                    "build"
                } else {
                    warn!(
                        workflow_id = %state.workflow_id,
                        "Retries exhausted after build failure; proceeding to release"
                    );
                    "release"
                };
                FailureRoute::Continue(self.graph.phase(target).cloned())
            }
            Ok(Phase::Evaluate) => {
                FailureRoute::Continue(self.graph.next_phase(&phase.name, state).cloned())
            }
            Ok(Phase::Release) | Ok(Phase::Frame) | Ok(Phase::Architect) => {
                FailureRoute::Terminal
            }
            Err(_) => match &phase.on_failure {
                Some(_) => {
                    FailureRoute::Continue(self.graph.next_phase(&phase.name, state).cloned())
                }
                None => FailureRoute::Terminal,
            },
        }
    }

    fn terminal_status(&self, state: &WorkflowState) -> WorkflowStatus {
        let last = self.graph.phases.last();
        let last_completed =
            last.is_some_and(|p| state.is_phase_completed(&p.name) || !p.enabled);
        if last_completed {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        }
    }

    fn sync_cost(&self, state: &mut WorkflowState) {
        state.total_cost_usd = self.tracker.total_cost_usd();
        state.total_tokens = self.tracker.total_tokens();
        state.budget_approved = self.tracker.is_budget_approved();
    }

    /// Checkpoint write failures are fatal: without a durable checkpoint
    /// the engine cannot guarantee resumption.
    async fn checkpoint(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        if let Err(e) = self.checkpoints.put(&state.workflow_id, state).await {
            self.logs.critical(
                state
                    .current_phase
                    .map(|p| p.as_str())
                    .unwrap_or("unknown"),
                &format!("Checkpoint write failed: {}", e),
            );
            return Err(e);
        }
        Ok(())
    }
}

enum GateOutcome {
    Approved,
    Denied(String),
}

enum FailureRoute {
    Terminal,
    Continue(Option<CompiledPhase>),
}
