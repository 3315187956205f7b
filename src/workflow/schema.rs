//! Custom workflow document schema.
//!
//! Users can supply a YAML workflow that enumerates phases, their agents or
//! steps, inputs/outputs, and failure handling. The document is validated
//! here and compiled into a `PhaseGraph` by the graph module.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::AutonomyLevel;
use crate::errors::ConfigError;

/// Trigger kinds for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    IssueLabeled,
    Webhook,
    Schedule,
}

/// Workflow trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

/// Global configuration carried by a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfigSection {
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for WorkflowConfigSection {
    fn default() -> Self {
        Self {
            autonomy: AutonomyLevel::default(),
            max_retries: default_max_retries(),
        }
    }
}

/// A step within a phase (agent or tool invocation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Agent,
    Tool,
}

/// Failure handling for a phase: re-enter `retry_phase` up to `max_retries`
/// times. `max_retries` may be an integer or a `$config.*` reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDoc {
    pub retry_phase: String,
    #[serde(default = "default_failure_retries")]
    pub max_retries: serde_json::Value,
}

fn default_failure_retries() -> serde_json::Value {
    serde_json::json!(3)
}

/// A phase in a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// `provider:model` or a `$models.*` reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// `$phase.output` references consumed by this phase.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepDoc>>,
    #[serde(default)]
    pub human_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_prompt: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailureDoc>,
}

fn default_max_iterations() -> u32 {
    50
}

/// Root of a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDoc {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub config: WorkflowConfigSection,
    #[serde(default)]
    pub models: BTreeMap<String, String>,
    pub phases: Vec<PhaseDoc>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDoc {
    /// Load and validate a workflow document from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let extension = path.extension().and_then(|e| e.to_str());
        if !matches!(extension, Some("yaml") | Some("yml")) {
            return Err(ConfigError::InvalidValue {
                field: "workflow_path".to_string(),
                message: format!("expected a .yaml or .yml file, got {}", path.display()),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Err(ConfigError::InvalidYaml {
                path: path.to_path_buf(),
                message: "empty workflow file".to_string(),
            });
        }

        let doc: WorkflowDoc =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidYaml {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        doc.validate()?;
        Ok(doc)
    }

    /// Structural validation (reference resolution happens at compile).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                message: "workflow name must not be empty".to_string(),
            });
        }
        if self.phases.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "phases".to_string(),
                message: "workflow must define at least one phase".to_string(),
            });
        }

        let mut seen = std::collections::BTreeSet::new();
        for phase in &self.phases {
            if !phase
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
                || phase.name.is_empty()
            {
                return Err(ConfigError::InvalidValue {
                    field: format!("phases.{}.name", phase.name),
                    message: "phase name must be alphanumeric with hyphens/underscores"
                        .to_string(),
                });
            }
            if !seen.insert(phase.name.clone()) {
                return Err(ConfigError::InvalidValue {
                    field: "phases".to_string(),
                    message: format!("duplicate phase name '{}'", phase.name),
                });
            }

            match &phase.steps {
                Some(steps) => {
                    for step in steps {
                        match step.step_type {
                            StepType::Agent if step.agent.is_none() => {
                                return Err(ConfigError::InvalidValue {
                                    field: format!(
                                        "phases.{}.steps.{}",
                                        phase.name, step.name
                                    ),
                                    message: "agent is required when type=agent".to_string(),
                                });
                            }
                            StepType::Tool if step.tool.is_none() => {
                                return Err(ConfigError::InvalidValue {
                                    field: format!(
                                        "phases.{}.steps.{}",
                                        phase.name, step.name
                                    ),
                                    message: "tool is required when type=tool".to_string(),
                                });
                            }
                            _ => {}
                        }
                        if step.agent.is_some() && step.tool.is_some() {
                            return Err(ConfigError::InvalidValue {
                                field: format!("phases.{}.steps.{}", phase.name, step.name),
                                message: "cannot specify both agent and tool".to_string(),
                            });
                        }
                    }
                }
                None => {
                    if phase.agent.is_none() {
                        return Err(ConfigError::InvalidValue {
                            field: format!("phases.{}", phase.name),
                            message: "phase must have either 'agent' or 'steps'".to_string(),
                        });
                    }
                }
            }

            if let Some(model) = &phase.model {
                if !model.starts_with('$') && !model.contains(':') {
                    return Err(ConfigError::InvalidValue {
                        field: format!("phases.{}.model", phase.name),
                        message: format!(
                            "model must be 'provider:model' or a $reference, got '{}'",
                            model
                        ),
                    });
                }
            }
        }

        for (name, model) in &self.models {
            if !model.contains(':') {
                return Err(ConfigError::InvalidValue {
                    field: format!("models.{}", name),
                    message: format!("model must be 'provider:model', got '{}'", model),
                });
            }
        }

        Ok(())
    }
}
