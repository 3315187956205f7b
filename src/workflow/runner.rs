//! Phase runner: executes one phase by driving its agent session and
//! recording the outcome on the workflow state.
//!
//! Each run produces a new state value by structural update. Failures are
//! captured as failed phase results; whether a failure is fatal is the
//! engine's decision, not the runner's.

use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::{AgentSession, UsageSink};
use crate::definitions::schema::{AgentDefinition, LlmConfig, LlmProvider};
use crate::definitions::DefinitionRegistry;
use crate::errors::WorkflowError;
use crate::llm::{LlmFactory, ModelSelector};
use crate::tools::ToolExecutor;
use crate::util::truncate_chars;
use crate::workflow::graph::CompiledPhase;
use crate::workflow::state::{Evaluation, PhaseResult, WorkflowState};

const SUMMARY_CHARS: usize = 500;

/// Executes phases against agent sessions.
pub struct PhaseRunner {
    project_root: PathBuf,
    registry: Arc<DefinitionRegistry>,
    executor: Arc<ToolExecutor>,
    llm_factory: Arc<dyn LlmFactory>,
}

impl PhaseRunner {
    pub fn new(
        project_root: PathBuf,
        registry: Arc<DefinitionRegistry>,
        executor: Arc<ToolExecutor>,
        llm_factory: Arc<dyn LlmFactory>,
    ) -> Self {
        Self {
            project_root,
            registry,
            executor,
            llm_factory,
        }
    }

    /// Run one phase, returning the updated state. The returned state
    /// always carries a `phase_results` entry for the phase; on failure it
    /// also carries `error` and `error_phase`.
    ///
    /// Budget interrupts and cancellation are not phase failures; they
    /// propagate to the engine untouched.
    pub async fn run_phase(
        &self,
        phase: &CompiledPhase,
        state: &WorkflowState,
        usage_sink: &dyn UsageSink,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut next = state.clone();
        next.current_phase = phase.name.parse().ok();

        match self.execute(phase, state, usage_sink).await {
            Ok((final_text, duration_ms)) => {
                self.record_success(phase, &mut next, &final_text, duration_ms);
            }
            Err(
                e @ (WorkflowError::BudgetExceeded { .. }
                | WorkflowError::BudgetRejected { .. }
                | WorkflowError::Cancelled),
            ) => return Err(e),
            Err(e) => {
                let message = e.to_string();
                next.record_phase_result(PhaseResult::failed(&phase.name, &message));
                next.record_error(&phase.name, &message);

                // A failing decision phase counts against the retry budget
                // and forces a NO_GO so the conditional edge sees it.
                if phase.name == "evaluate" {
                    next.evaluation_result = Some(Evaluation::NoGo);
                }
                if let Some(policy) = &phase.on_failure {
                    if next.retry_count < policy.max_retries {
                        next.retry_count += 1;
                    }
                }
            }
        }

        Ok(next)
    }

    async fn execute(
        &self,
        phase: &CompiledPhase,
        state: &WorkflowState,
        usage_sink: &dyn UsageSink,
    ) -> Result<(String, u64), WorkflowError> {
        let agent_name = phase.agent.as_deref().ok_or_else(|| {
            WorkflowError::PhaseFailed {
                phase: phase.name.clone(),
                message: "phase has no agent bound".to_string(),
            }
        })?;

        let agent_def = self.resolve_agent(agent_name, phase)?;
        let model_override = match &phase.model {
            Some(selector) => Some(selector.parse::<ModelSelector>()?),
            None => None,
        };

        let session = AgentSession::build(
            &agent_def,
            &self.project_root,
            &self.registry,
            Arc::clone(&self.executor),
            self.llm_factory.as_ref(),
            model_override.as_ref(),
            phase.max_iterations,
        )?;

        let task = self.compose_task(phase, state);
        let outcome = session.run(&task, &phase.name, usage_sink).await?;
        Ok((outcome.final_text, outcome.duration_ms))
    }

    /// Resolve the phase's agent: registry definitions win; the five
    /// pipeline agents have built-in fallbacks so a bare project runs.
    fn resolve_agent(
        &self,
        agent_name: &str,
        phase: &CompiledPhase,
    ) -> Result<AgentDefinition, WorkflowError> {
        match self.registry.get_agent_or_raise(agent_name) {
            Ok(agent) => Ok(agent),
            Err(err) => builtin_agent(agent_name, phase).ok_or_else(|| err.into()),
        }
    }

    /// Compose the user message for a phase from the engine-supplied task
    /// and the context hints its declared inputs reference.
    fn compose_task(&self, phase: &CompiledPhase, state: &WorkflowState) -> String {
        let mut task = match phase.name.as_str() {
            "frame" => format!(
                "Frame work item #{}. Fetch the issue, classify the work type, \
                 extract requirements, and post a FABER:FRAME comment.",
                state.work_id
            ),
            "architect" => format!(
                "Create a specification for work item #{}. Work type: {}. \
                 Use the appropriate template, fill in all sections, \
                 validate completeness, and post a FABER:ARCHITECT comment.",
                state.work_id,
                state.work_type.as_deref().unwrap_or("feature")
            ),
            "build" => format!(
                "Implement the solution for work item #{}. Spec ID: {}. \
                 Create a feature branch, implement the solution following \
                 the spec, write tests, and make semantic commits.",
                state.work_id,
                state.spec_id.as_deref().unwrap_or(&state.work_id)
            ),
            "evaluate" => format!(
                "Evaluate the implementation for work item #{}. \
                 Verify acceptance criteria, run tests, review code quality, \
                 and make a GO/NO-GO decision.",
                state.work_id
            ),
            "release" => format!(
                "Release work item #{}. Push the branch, create a pull request \
                 with a comprehensive description, and post a FABER:RELEASE \
                 comment on the issue.",
                state.work_id
            ),
            other => format!("Execute the '{}' phase for work item #{}.", other, state.work_id),
        };

        let context: Vec<String> = phase
            .inputs
            .iter()
            .filter_map(|input| {
                let value = resolve_input(input, state)?;
                Some(format!("- {}: {}", input.trim_start_matches('$'), value))
            })
            .collect();
        if !context.is_empty() {
            task = format!("Context:\n{}\n\nTask: {}", context.join("\n"), task);
        }

        task
    }

    fn record_success(
        &self,
        phase: &CompiledPhase,
        state: &mut WorkflowState,
        final_text: &str,
        duration_ms: u64,
    ) {
        let mut output = Map::new();
        output.insert(
            "summary".to_string(),
            json!(truncate_chars(final_text, SUMMARY_CHARS)),
        );

        // Structured fields the agent chose to report are lifted onto the
        // typed state.
        if let Some(structured) = crate::util::first_json_object(final_text) {
            apply_structured_outputs(state, &structured);
        }

        match phase.name.as_str() {
            "architect" => {
                state.spec_validated = true;
            }
            "evaluate" => {
                // Substring parse of the decision; any NO-GO wins.
                let upper = final_text.to_uppercase();
                let decision = if upper.contains("GO") && !upper.contains("NO-GO") {
                    Evaluation::Go
                } else {
                    Evaluation::NoGo
                };
                state.evaluation_result = Some(decision);
                state.evaluation_details =
                    Some(json!({"output": truncate_chars(final_text, 1000)}));
                if decision == Evaluation::NoGo
                    && phase
                        .on_failure
                        .as_ref()
                        .is_some_and(|p| state.retry_count < p.max_retries)
                {
                    // Never counts past the retry bound.
                    state.retry_count += 1;
                }
                output.insert("decision".to_string(), json!(decision.to_string()));
            }
            _ => {}
        }

        state.record_phase_result(PhaseResult::completed(&phase.name, duration_ms, output));
    }
}

/// Map a `$phase.output` (or bare field) reference onto the state.
fn resolve_input(reference: &str, state: &WorkflowState) -> Option<Value> {
    let path = reference.strip_prefix('$')?;
    let (phase, field) = path.split_once('.')?;

    match field {
        "work_type" => state.work_type.as_ref().map(|v| json!(v)),
        "requirements" => state.requirements.as_ref().map(|v| json!(v)),
        "spec_id" => state.spec_id.as_ref().map(|v| json!(v)),
        "spec_path" => state.spec_path.as_ref().map(|v| json!(v)),
        "branch_name" => state.branch_name.as_ref().map(|v| json!(v)),
        "commits" => (!state.commits.is_empty()).then(|| json!(state.commits)),
        "evaluation_result" => state.evaluation_result.map(|v| json!(v.to_string())),
        "pr_url" => state.pr_url.as_ref().map(|v| json!(v)),
        other => state
            .phase_results
            .get(phase)
            .and_then(|r| r.output.get(other))
            .cloned(),
    }
}

/// Lift recognised keys from an agent's structured reply onto the state.
fn apply_structured_outputs(state: &mut WorkflowState, structured: &Value) {
    let Some(map) = structured.as_object() else {
        return;
    };

    if let Some(work_type) = map.get("work_type").and_then(|v| v.as_str()) {
        state.work_type = Some(work_type.to_string());
    }
    if let Some(requirements) = map.get("requirements").and_then(|v| v.as_array()) {
        state.requirements = Some(
            requirements
                .iter()
                .filter_map(|r| r.as_str().map(|s| s.to_string()))
                .collect(),
        );
    }
    if let Some(spec_id) = map.get("spec_id").and_then(|v| v.as_str()) {
        state.spec_id = Some(spec_id.to_string());
    }
    if let Some(spec_path) = map.get("spec_path").and_then(|v| v.as_str()) {
        state.spec_path = Some(spec_path.to_string());
    }
    if let Some(branch_name) = map.get("branch_name").and_then(|v| v.as_str()) {
        state.branch_name = Some(branch_name.to_string());
    }
    if let Some(commits) = map.get("commits").and_then(|v| v.as_array()) {
        for commit in commits.iter().filter_map(|c| c.as_str()) {
            state.commits.push(commit.to_string());
        }
    }
    if let Some(pr_url) = map.get("pr_url").and_then(|v| v.as_str()) {
        state.pr_url = Some(pr_url.to_string());
    }
    if let Some(pr_number) = map.get("pr_number").and_then(|v| v.as_u64()) {
        state.pr_number = Some(pr_number);
    }
}

/// Built-in agent definitions for the five pipeline phases. A project can
/// shadow any of them by defining the same name under `.fractary/agents/`.
fn builtin_agent(agent_name: &str, phase: &CompiledPhase) -> Option<AgentDefinition> {
    let (name, prompt) = match agent_name {
        "frame-agent" => (
            "frame-agent",
            "You are the Frame agent. You fetch the work item, classify its \
             work type (feature, bug, chore, docs), and extract concrete \
             requirements. Reply with a JSON object containing work_type and \
             requirements, followed by a short summary.",
        ),
        "architect-agent" => (
            "architect-agent",
            "You are the Architect agent. You produce a complete, reviewable \
             specification for the work item and validate it for \
             completeness. Reply with a JSON object containing spec_id and \
             spec_path, followed by a short summary.",
        ),
        "build-agent" => (
            "build-agent",
            "You are the Build agent. You implement the specification on a \
             feature branch with tests and semantic commits. Reply with a \
             JSON object containing branch_name and commits, followed by a \
             short summary.",
        ),
        "evaluate-agent" => (
            "evaluate-agent",
            "You are the Evaluate agent. You verify acceptance criteria, run \
             the tests, and review the implementation. End your reply with \
             'Decision: GO' or 'Decision: NO-GO'.",
        ),
        "release-agent" => (
            "release-agent",
            "You are the Release agent. You push the branch and open a pull \
             request with a comprehensive description. Reply with a JSON \
             object containing pr_url and pr_number, followed by a short \
             summary.",
        ),
        _ => return None,
    };

    // Model routing comes from the phase; the selector here is only the
    // fallback when no route is configured.
    let llm = match &phase.model {
        Some(selector) => {
            let parsed: ModelSelector = selector.parse().ok()?;
            LlmConfig {
                provider: parsed.provider,
                model: parsed.model,
                temperature: 0.0,
                max_tokens: 8192,
            }
        }
        None => LlmConfig {
            provider: LlmProvider::Anthropic,
            model: "claude-sonnet-4-20250514".to_string(),
            temperature: 0.0,
            max_tokens: 8192,
        },
    };

    Some(AgentDefinition {
        name: name.to_string(),
        description: format!("Built-in {} for the FABER pipeline", name),
        llm,
        system_prompt: prompt.to_string(),
        tools: phase.tools.clone(),
        tags: vec!["builtin".to_string()],
        config: Default::default(),
        caching: None,
        custom_tools: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NullUsageSink;
    use crate::config::FaberConfig;
    use crate::llm::mock::{MockFactory, MockLlm};
    use crate::tools::FunctionRegistry;
    use crate::workflow::graph::PhaseGraph;
    use crate::workflow::state::{create_initial_state, PhaseStatus};
    use tempfile::tempdir;

    fn runner_with(mock: Arc<MockLlm>, root: &std::path::Path) -> PhaseRunner {
        PhaseRunner::new(
            root.to_path_buf(),
            Arc::new(DefinitionRegistry::new(root)),
            Arc::new(ToolExecutor::new(Arc::new(FunctionRegistry::new()))),
            Arc::new(MockFactory::new(mock)),
        )
    }

    fn graph() -> PhaseGraph {
        PhaseGraph::default_faber(&FaberConfig::default())
    }

    #[tokio::test]
    async fn test_frame_phase_records_result_and_outputs() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        mock.push_text(
            "{\"work_type\": \"feature\", \"requirements\": [\"fast\", \"tested\"]}\n\
             Classified the issue as a feature.",
        );

        let runner = runner_with(Arc::clone(&mock), dir.path());
        let graph = graph();
        let state = create_initial_state("WF-1", "42", None);

        let next = runner
            .run_phase(graph.phase("frame").unwrap(), &state, &NullUsageSink)
            .await
            .unwrap();

        assert!(next.is_phase_completed("frame"));
        assert_eq!(next.work_type.as_deref(), Some("feature"));
        assert_eq!(
            next.requirements,
            Some(vec!["fast".to_string(), "tested".to_string()])
        );
        assert_eq!(next.completed_phases, vec!["frame"]);

        // The task prompt names the work item.
        let request = &mock.requests()[0];
        match &request.messages[0].content[0] {
            crate::llm::ContentBlock::Text { text } => {
                assert!(text.contains("work item #42"))
            }
            other => panic!("Expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_evaluate_go_decision() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        mock.push_text("All criteria verified. Decision: GO");

        let runner = runner_with(mock, dir.path());
        let graph = graph();
        let state = create_initial_state("WF-1", "42", None);

        let next = runner
            .run_phase(graph.phase("evaluate").unwrap(), &state, &NullUsageSink)
            .await
            .unwrap();

        assert_eq!(next.evaluation_result, Some(Evaluation::Go));
        assert_eq!(next.retry_count, 0);
        assert_eq!(
            next.phase_results.get("evaluate").unwrap().output["decision"],
            "GO"
        );
    }

    #[tokio::test]
    async fn test_evaluate_no_go_increments_retry_count() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        mock.push_text("Tests are failing. Decision: NO-GO");

        let runner = runner_with(mock, dir.path());
        let graph = graph();
        let state = create_initial_state("WF-1", "42", None);

        let next = runner
            .run_phase(graph.phase("evaluate").unwrap(), &state, &NullUsageSink)
            .await
            .unwrap();

        assert_eq!(next.evaluation_result, Some(Evaluation::NoGo));
        assert_eq!(next.retry_count, 1);
        assert_eq!(
            next.phase_results.get("evaluate").unwrap().output["decision"],
            "NO_GO"
        );
    }

    #[tokio::test]
    async fn test_evaluate_error_counts_as_no_go() {
        let dir = tempdir().unwrap();
        // A handler that always errors at the provider level.
        struct FailingFactory;
        impl LlmFactory for FailingFactory {
            fn create(
                &self,
                _provider: LlmProvider,
            ) -> Result<Arc<dyn crate::llm::LlmClient>, WorkflowError> {
                Err(WorkflowError::Provider("provider offline".to_string()))
            }
        }

        let runner = PhaseRunner::new(
            dir.path().to_path_buf(),
            Arc::new(DefinitionRegistry::new(dir.path())),
            Arc::new(ToolExecutor::new(Arc::new(FunctionRegistry::new()))),
            Arc::new(FailingFactory),
        );
        let graph = graph();
        let state = create_initial_state("WF-1", "42", None);

        let next = runner
            .run_phase(graph.phase("evaluate").unwrap(), &state, &NullUsageSink)
            .await
            .unwrap();

        assert_eq!(
            next.phase_results.get("evaluate").unwrap().status,
            PhaseStatus::Failed
        );
        assert_eq!(next.evaluation_result, Some(Evaluation::NoGo));
        assert_eq!(next.retry_count, 1);
        assert_eq!(next.error_phase.as_deref(), Some("evaluate"));
    }

    #[tokio::test]
    async fn test_failed_phase_without_policy_keeps_retry_count() {
        let dir = tempdir().unwrap();
        struct FailingFactory;
        impl LlmFactory for FailingFactory {
            fn create(
                &self,
                _provider: LlmProvider,
            ) -> Result<Arc<dyn crate::llm::LlmClient>, WorkflowError> {
                Err(WorkflowError::Provider("provider offline".to_string()))
            }
        }

        let runner = PhaseRunner::new(
            dir.path().to_path_buf(),
            Arc::new(DefinitionRegistry::new(dir.path())),
            Arc::new(ToolExecutor::new(Arc::new(FunctionRegistry::new()))),
            Arc::new(FailingFactory),
        );
        let graph = graph();
        let state = create_initial_state("WF-1", "42", None);

        let next = runner
            .run_phase(graph.phase("frame").unwrap(), &state, &NullUsageSink)
            .await
            .unwrap();

        assert_eq!(next.retry_count, 0);
        assert_eq!(next.error_phase.as_deref(), Some("frame"));
    }

    #[tokio::test]
    async fn test_release_extracts_pr_url() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        mock.push_text(
            "{\"pr_url\": \"https://github.com/acme/repo/pull/7\", \"pr_number\": 7}\n\
             Opened the pull request.",
        );

        let runner = runner_with(mock, dir.path());
        let graph = graph();
        let state = create_initial_state("WF-1", "42", None);

        let next = runner
            .run_phase(graph.phase("release").unwrap(), &state, &NullUsageSink)
            .await
            .unwrap();

        assert_eq!(
            next.pr_url.as_deref(),
            Some("https://github.com/acme/repo/pull/7")
        );
        assert_eq!(next.pr_number, Some(7));
    }

    #[tokio::test]
    async fn test_architect_task_includes_work_type() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());

        let runner = runner_with(Arc::clone(&mock), dir.path());
        let graph = graph();
        let mut state = create_initial_state("WF-1", "42", None);
        state.work_type = Some("bug".to_string());

        runner
            .run_phase(graph.phase("architect").unwrap(), &state, &NullUsageSink)
            .await
            .unwrap();

        let request = &mock.requests()[0];
        match &request.messages[0].content[0] {
            crate::llm::ContentBlock::Text { text } => {
                assert!(text.contains("Work type: bug"));
            }
            other => panic!("Expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_custom_phase_inputs_become_context() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        let runner = runner_with(Arc::clone(&mock), dir.path());

        let phase = CompiledPhase {
            name: "summarize".to_string(),
            agent: Some("frame-agent".to_string()),
            model: None,
            tools: Vec::new(),
            inputs: vec!["$frame.work_type".to_string()],
            outputs: Vec::new(),
            human_approval: false,
            enabled: true,
            max_iterations: 10,
            on_failure: None,
        };

        let mut state = create_initial_state("WF-1", "42", None);
        state.work_type = Some("feature".to_string());

        runner.run_phase(&phase, &state, &NullUsageSink).await.unwrap();

        let request = &mock.requests()[0];
        match &request.messages[0].content[0] {
            crate::llm::ContentBlock::Text { text } => {
                assert!(text.contains("Context:"));
                assert!(text.contains("frame.work_type"));
                assert!(text.contains("feature"));
            }
            other => panic!("Expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_agent_is_phase_failure() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        let runner = runner_with(mock, dir.path());

        let phase = CompiledPhase {
            name: "custom".to_string(),
            agent: Some("missing-agent".to_string()),
            model: None,
            tools: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            human_approval: false,
            enabled: true,
            max_iterations: 10,
            on_failure: None,
        };
        let state = create_initial_state("WF-1", "42", None);

        let next = runner.run_phase(&phase, &state, &NullUsageSink).await.unwrap();
        let result = next.phase_results.get("custom").unwrap();
        assert_eq!(result.status, PhaseStatus::Failed);
        assert!(result.error.as_ref().unwrap().contains("missing-agent"));
        assert!(result.error.as_ref().unwrap().contains("Available agents"));
    }
}
