//! The phase graph: execution order plus conditional transitions.
//!
//! The built-in FABER pipeline is a fixed graph:
//!
//! ```text
//! frame → architect → build → evaluate → {build, release} → END
//! ```
//!
//! Custom workflow documents compile into the same type, with `$models.*`
//! and `$config.*` references resolved here; an unresolved reference is a
//! compile-time configuration error.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::FaberConfig;
use crate::errors::ConfigError;
use crate::workflow::schema::WorkflowDoc;
use crate::workflow::state::{Evaluation, PhaseStatus, WorkflowState};

/// Retry edge for a phase: re-enter `retry_phase` while the workflow's
/// retry count stays below `max_retries`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retry_phase: String,
    pub max_retries: u32,
}

/// One compiled phase.
#[derive(Debug, Clone)]
pub struct CompiledPhase {
    pub name: String,
    pub agent: Option<String>,
    /// Resolved `provider:model` selector, when routed.
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub human_approval: bool,
    pub enabled: bool,
    pub max_iterations: u32,
    pub on_failure: Option<RetryPolicy>,
}

/// A compiled workflow graph.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    pub name: String,
    pub phases: Vec<CompiledPhase>,
    pub max_retries: u32,
}

impl PhaseGraph {
    /// The built-in FABER pipeline, configured from the engine config.
    pub fn default_faber(config: &FaberConfig) -> Self {
        let phase = |name: &str, outputs: &[&str]| {
            let settings = config.phases.get(name).cloned().unwrap_or_default();
            CompiledPhase {
                name: name.to_string(),
                agent: Some(format!("{}-agent", name)),
                model: settings.model,
                tools: Vec::new(),
                inputs: Vec::new(),
                outputs: outputs.iter().map(|o| o.to_string()).collect(),
                human_approval: config.requires_approval(name),
                enabled: settings.enabled,
                max_iterations: settings.max_iterations,
                on_failure: None,
            }
        };

        let mut phases = vec![
            phase("frame", &["work_type", "requirements"]),
            phase("architect", &["spec_id", "spec_path"]),
            phase("build", &["branch_name", "commits"]),
            phase("evaluate", &["evaluation_result"]),
            phase("release", &["pr_url", "pr_number"]),
        ];
        // The evaluate → build retry loop.
        phases[3].on_failure = Some(RetryPolicy {
            retry_phase: "build".to_string(),
            max_retries: config.max_retries,
        });

        Self {
            name: "faber".to_string(),
            phases,
            max_retries: config.max_retries,
        }
    }

    /// Compile a custom workflow document, resolving `$models.*` and
    /// `$config.*` references.
    pub fn compile(doc: &WorkflowDoc) -> Result<Self, ConfigError> {
        doc.validate()?;

        let context = ReferenceContext {
            models: &doc.models,
            max_retries: doc.config.max_retries,
        };

        let mut known_outputs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut phases = Vec::with_capacity(doc.phases.len());

        for phase_doc in &doc.phases {
            let location = format!("phases.{}", phase_doc.name);

            let model = match &phase_doc.model {
                Some(model) if model.starts_with('$') => {
                    Some(context.resolve_model(model, &location)?)
                }
                Some(model) => Some(model.clone()),
                None => None,
            };

            // Phase input references must point at outputs of phases that
            // are already defined.
            for input in &phase_doc.inputs {
                if let Some(reference) = input.strip_prefix('$') {
                    if reference.starts_with("config.") || reference.starts_with("models.") {
                        continue;
                    }
                    let (ref_phase, ref_output) =
                        reference.split_once('.').unwrap_or((reference, ""));
                    match known_outputs.get(ref_phase) {
                        None => {
                            return Err(ConfigError::UnresolvedReference {
                                reference: input.clone(),
                                location: location.clone(),
                                message: format!(
                                    "phase '{}' is not defined before this phase",
                                    ref_phase
                                ),
                            });
                        }
                        Some(outputs)
                            if !ref_output.is_empty()
                                && !outputs.contains(&ref_output.to_string()) =>
                        {
                            return Err(ConfigError::UnresolvedReference {
                                reference: input.clone(),
                                location: location.clone(),
                                message: format!(
                                    "'{}' is not among {}'s outputs",
                                    ref_output, ref_phase
                                ),
                            });
                        }
                        _ => {}
                    }
                }
            }

            let on_failure = match &phase_doc.on_failure {
                Some(failure) => {
                    let max_retries =
                        context.resolve_retries(&failure.max_retries, &location)?;
                    Some(RetryPolicy {
                        retry_phase: failure.retry_phase.clone(),
                        max_retries,
                    })
                }
                None => None,
            };

            known_outputs.insert(phase_doc.name.clone(), phase_doc.outputs.clone());
            phases.push(CompiledPhase {
                name: phase_doc.name.clone(),
                agent: phase_doc.agent.clone(),
                model,
                tools: phase_doc.tools.clone(),
                inputs: phase_doc.inputs.clone(),
                outputs: phase_doc.outputs.clone(),
                human_approval: phase_doc.human_approval,
                enabled: true,
                max_iterations: phase_doc.max_iterations,
                on_failure,
            });
        }

        // Retry targets must name phases in the graph.
        for phase in &phases {
            if let Some(policy) = &phase.on_failure {
                if !phases.iter().any(|p| p.name == policy.retry_phase) {
                    return Err(ConfigError::UnresolvedReference {
                        reference: policy.retry_phase.clone(),
                        location: format!("phases.{}.on_failure.retry_phase", phase.name),
                        message: "retry target is not a phase in this workflow".to_string(),
                    });
                }
            }
        }

        Ok(Self {
            name: doc.name.clone(),
            phases,
            max_retries: doc.config.max_retries,
        })
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn phase(&self, name: &str) -> Option<&CompiledPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn first_phase(&self) -> Option<&CompiledPhase> {
        self.phases.first()
    }

    /// Decide the phase after `current` given the updated state.
    ///
    /// A phase that recorded a failure (failed status or a NO_GO decision in
    /// its output) and carries a retry policy re-enters its retry target
    /// while `retry_count` stays below the policy's bound; exhausting
    /// retries advances normally. `None` means the pipeline is done.
    pub fn next_phase(&self, current: &str, state: &WorkflowState) -> Option<&CompiledPhase> {
        let index = self.position(current)?;
        let phase = &self.phases[index];

        if let Some(policy) = &phase.on_failure {
            if phase_needs_retry(current, state) && state.retry_count < policy.max_retries {
                return self.phase(&policy.retry_phase);
            }
        }

        self.phases.get(index + 1)
    }
}

fn phase_needs_retry(phase: &str, state: &WorkflowState) -> bool {
    match state.phase_results.get(phase) {
        Some(result) if result.status == PhaseStatus::Failed => true,
        Some(result) => {
            let no_go_output = result
                .output
                .get("decision")
                .and_then(|d| d.as_str())
                .map(|d| d == "NO_GO")
                .unwrap_or(false);
            no_go_output || state.evaluation_result == Some(Evaluation::NoGo) && phase == "evaluate"
        }
        None => false,
    }
}

struct ReferenceContext<'a> {
    models: &'a BTreeMap<String, String>,
    max_retries: u32,
}

impl ReferenceContext<'_> {
    fn resolve_model(&self, reference: &str, location: &str) -> Result<String, ConfigError> {
        let path = reference.trim_start_matches('$');
        let Some(key) = path.strip_prefix("models.") else {
            return Err(ConfigError::UnresolvedReference {
                reference: reference.to_string(),
                location: location.to_string(),
                message: "model references must take the form $models.<name>".to_string(),
            });
        };
        self.models
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::UnresolvedReference {
                reference: reference.to_string(),
                location: location.to_string(),
                message: format!("key '{}' not found in models", key),
            })
    }

    fn resolve_retries(&self, value: &Value, location: &str) -> Result<u32, ConfigError> {
        match value {
            Value::Number(n) => {
                n.as_u64()
                    .map(|n| n as u32)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: format!("{}.on_failure.max_retries", location),
                        message: format!("must be a non-negative integer, got {}", n),
                    })
            }
            Value::String(s) if s == "$config.max_retries" => Ok(self.max_retries),
            Value::String(s) => Err(ConfigError::UnresolvedReference {
                reference: s.clone(),
                location: format!("{}.on_failure.max_retries", location),
                message: "only $config.max_retries may be referenced here".to_string(),
            }),
            other => Err(ConfigError::InvalidValue {
                field: format!("{}.on_failure.max_retries", location),
                message: format!("must be an integer or $reference, got {}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{create_initial_state, PhaseResult};
    use serde_json::{json, Map};

    fn default_graph() -> PhaseGraph {
        PhaseGraph::default_faber(&FaberConfig::default())
    }

    fn state_with_decision(decision: &str, retry_count: u32) -> WorkflowState {
        let mut state = create_initial_state("WF-1", "1", None);
        state.retry_count = retry_count;
        state.evaluation_result = Some(if decision == "GO" {
            Evaluation::Go
        } else {
            Evaluation::NoGo
        });
        let mut output = Map::new();
        output.insert("decision".to_string(), json!(decision));
        state.record_phase_result(PhaseResult::completed("evaluate", 10, output));
        state
    }

    #[test]
    fn test_default_graph_order() {
        let graph = default_graph();
        let names: Vec<&str> = graph.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["frame", "architect", "build", "evaluate", "release"]);
        assert_eq!(graph.max_retries, 3);
    }

    #[test]
    fn test_default_graph_linear_edges() {
        let graph = default_graph();
        let state = create_initial_state("WF-1", "1", None);
        assert_eq!(graph.next_phase("frame", &state).unwrap().name, "architect");
        assert_eq!(graph.next_phase("architect", &state).unwrap().name, "build");
        assert_eq!(graph.next_phase("build", &state).unwrap().name, "evaluate");
        assert!(graph.next_phase("release", &state).is_none());
    }

    #[test]
    fn test_evaluate_go_proceeds_to_release() {
        let graph = default_graph();
        let state = state_with_decision("GO", 0);
        assert_eq!(graph.next_phase("evaluate", &state).unwrap().name, "release");
    }

    #[test]
    fn test_evaluate_no_go_retries_build() {
        let graph = default_graph();
        let state = state_with_decision("NO_GO", 1);
        assert_eq!(graph.next_phase("evaluate", &state).unwrap().name, "build");
    }

    #[test]
    fn test_retry_exhaustion_proceeds_to_release() {
        let graph = default_graph();
        let state = state_with_decision("NO_GO", 3);
        assert_eq!(graph.next_phase("evaluate", &state).unwrap().name, "release");
    }

    #[test]
    fn test_zero_max_retries_goes_straight_to_release() {
        let mut config = FaberConfig::default();
        config.max_retries = 0;
        let graph = PhaseGraph::default_faber(&config);

        let state = state_with_decision("NO_GO", 0);
        assert_eq!(graph.next_phase("evaluate", &state).unwrap().name, "release");
    }

    #[test]
    fn test_failed_phase_with_policy_retries() {
        let graph = default_graph();
        let mut state = create_initial_state("WF-1", "1", None);
        state.retry_count = 1;
        state.record_phase_result(PhaseResult::failed("evaluate", "crashed"));
        assert_eq!(graph.next_phase("evaluate", &state).unwrap().name, "build");
    }

    #[test]
    fn test_default_graph_approval_flags_follow_config() {
        let graph = default_graph();
        assert!(graph.phase("architect").unwrap().human_approval);
        assert!(graph.phase("release").unwrap().human_approval);
        assert!(!graph.phase("build").unwrap().human_approval);
    }

    #[test]
    fn test_compile_custom_document() {
        let yaml = r#"
name: custom
models:
  default: anthropic:claude-sonnet-4-20250514
config:
  max_retries: 2
phases:
  - name: gather
    agent: gatherer
    model: $models.default
    outputs: [notes]
  - name: produce
    agent: producer
    inputs: [$gather.notes]
    on_failure:
      retry_phase: produce
      max_retries: $config.max_retries
"#;
        let doc: WorkflowDoc = serde_yaml::from_str(yaml).unwrap();
        let graph = PhaseGraph::compile(&doc).unwrap();

        assert_eq!(graph.name, "custom");
        assert_eq!(
            graph.phase("gather").unwrap().model.as_deref(),
            Some("anthropic:claude-sonnet-4-20250514")
        );
        let policy = graph.phase("produce").unwrap().on_failure.as_ref().unwrap();
        assert_eq!(policy.retry_phase, "produce");
        assert_eq!(policy.max_retries, 2);
    }

    #[test]
    fn test_compile_unresolved_model_reference_fails() {
        let yaml = r#"
name: broken
phases:
  - name: gather
    agent: gatherer
    model: $models.missing
"#;
        let doc: WorkflowDoc = serde_yaml::from_str(yaml).unwrap();
        let err = PhaseGraph::compile(&doc).unwrap_err();
        assert!(err.to_string().contains("$models.missing"));
    }

    #[test]
    fn test_compile_forward_input_reference_fails() {
        let yaml = r#"
name: broken
phases:
  - name: first
    agent: a
    inputs: [$later.thing]
  - name: later
    agent: b
    outputs: [thing]
"#;
        let doc: WorkflowDoc = serde_yaml::from_str(yaml).unwrap();
        let err = PhaseGraph::compile(&doc).unwrap_err();
        assert!(err.to_string().contains("not defined before"));
    }

    #[test]
    fn test_compile_unknown_output_reference_fails() {
        let yaml = r#"
name: broken
phases:
  - name: first
    agent: a
    outputs: [notes]
  - name: second
    agent: b
    inputs: [$first.missing]
"#;
        let doc: WorkflowDoc = serde_yaml::from_str(yaml).unwrap();
        let err = PhaseGraph::compile(&doc).unwrap_err();
        assert!(err.to_string().contains("not among"));
    }

    #[test]
    fn test_compile_unknown_retry_target_fails() {
        let yaml = r#"
name: broken
phases:
  - name: only
    agent: a
    on_failure:
      retry_phase: elsewhere
"#;
        let doc: WorkflowDoc = serde_yaml::from_str(yaml).unwrap();
        let err = PhaseGraph::compile(&doc).unwrap_err();
        assert!(err.to_string().contains("retry target"));
    }

    #[test]
    fn test_config_references_in_inputs_allowed() {
        let yaml = r#"
name: ok
phases:
  - name: only
    agent: a
    inputs: [$config.max_retries]
"#;
        let doc: WorkflowDoc = serde_yaml::from_str(yaml).unwrap();
        assert!(PhaseGraph::compile(&doc).is_ok());
    }
}
