//! Engine configuration loaded from `.faber/config.yaml`.
//!
//! The configuration file has a `workflow` section (autonomy, retries,
//! per-phase models and approval gates, approval channels, checkpointing,
//! cost control) and an `observability` section:
//!
//! ```yaml
//! workflow:
//!   autonomy: assisted
//!   max_retries: 3
//!   models:
//!     frame: anthropic:claude-3-5-haiku-20241022
//!     build: anthropic:claude-sonnet-4-20250514
//!   human_approval:
//!     architect: true
//!     release: true
//!   approval:
//!     notify_channels: [cli]
//!     response_channels: [cli]
//!     timeout_minutes: 60
//!   checkpointing:
//!     backend: file
//!     file:
//!       path: .faber/checkpoints.json
//!   cost:
//!     budget_limit_usd: 10.0
//!     warning_threshold: 0.8
//!     require_approval_at: 0.9
//! observability:
//!   langsmith:
//!     enabled: true
//!     project: faber-workflows
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

pub const FABER_DIR: &str = ".faber";
pub const CONFIG_FILE: &str = "config.yaml";

/// The five pipeline phases, in execution order.
pub const PIPELINE: [&str; 5] = ["frame", "architect", "build", "evaluate", "release"];

/// Autonomy levels controlling which phases gate on human approval.
///
/// | Level        | Gated phases          |
/// |--------------|-----------------------|
/// | `Assisted`   | architect, release    |
/// | `Guarded`    | release               |
/// | `Autonomous` | none                  |
///
/// An explicit `human_approval.<phase>` entry always wins over the
/// autonomy default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    #[default]
    Assisted,
    Guarded,
    Autonomous,
}

impl AutonomyLevel {
    /// Phases gated by this autonomy level when no explicit override exists.
    pub fn default_gated_phases(&self) -> &'static [&'static str] {
        match self {
            AutonomyLevel::Assisted => &["architect", "release"],
            AutonomyLevel::Guarded => &["release"],
            AutonomyLevel::Autonomous => &[],
        }
    }
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutonomyLevel::Assisted => write!(f, "assisted"),
            AutonomyLevel::Guarded => write!(f, "guarded"),
            AutonomyLevel::Autonomous => write!(f, "autonomous"),
        }
    }
}

impl std::str::FromStr for AutonomyLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "assisted" => Ok(AutonomyLevel::Assisted),
            "guarded" => Ok(AutonomyLevel::Guarded),
            "autonomous" => Ok(AutonomyLevel::Autonomous),
            _ => anyhow::bail!(
                "Invalid autonomy level '{}'. Valid values: assisted, guarded, autonomous",
                s
            ),
        }
    }
}

/// Checkpoint backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    Memory,
    #[default]
    File,
    Network,
}

/// Configuration for a single pipeline phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSettings {
    /// Whether the phase runs at all. Disabled phases are recorded as skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Model selector in `provider:model` form.
    #[serde(default)]
    pub model: Option<String>,
    /// Gate this phase on human approval before running it. Unset defers
    /// to the autonomy level.
    #[serde(default)]
    pub human_approval: Option<bool>,
    /// Tool-use loop iteration cap for the phase agent.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    50
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            human_approval: None,
            max_iterations: default_max_iterations(),
        }
    }
}

/// Human-in-the-loop approval channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    #[serde(default = "default_channels")]
    pub notify_channels: Vec<String>,
    #[serde(default = "default_channels")]
    pub response_channels: Vec<String>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_channels() -> Vec<String> {
    vec!["cli".to_string()]
}

fn default_timeout_minutes() -> u64 {
    60
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            notify_channels: default_channels(),
            response_channels: default_channels(),
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Path for the file backend, relative to the project root.
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
    /// Base URL for the network backend.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_checkpoint_path() -> String {
    format!("{}/checkpoints.json", FABER_DIR)
}

/// Cost-control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSettings {
    /// Hard budget in USD. Values <= 0 disable all budget checks.
    #[serde(default = "default_budget_limit")]
    pub budget_limit_usd: f64,
    /// Fraction of budget at which a warning is emitted.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Fraction of budget at which human approval is required.
    #[serde(default = "default_require_approval_at")]
    pub require_approval_at: f64,
}

fn default_budget_limit() -> f64 {
    10.0
}

fn default_warning_threshold() -> f64 {
    0.8
}

fn default_require_approval_at() -> f64 {
    0.9
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            budget_limit_usd: default_budget_limit(),
            warning_threshold: default_warning_threshold(),
            require_approval_at: default_require_approval_at(),
        }
    }
}

/// Observability configuration. The project name is attached to the
/// workflow tracing span when enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LangsmithSettings {
    #[serde(default = "default_langsmith_enabled")]
    pub enabled: bool,
    #[serde(default = "default_langsmith_project")]
    pub project: String,
}

fn default_langsmith_enabled() -> bool {
    true
}

fn default_langsmith_project() -> String {
    "faber-workflows".to_string()
}

impl Default for LangsmithSettings {
    fn default() -> Self {
        Self {
            enabled: default_langsmith_enabled(),
            project: default_langsmith_project(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaberConfig {
    pub autonomy: AutonomyLevel,
    pub max_retries: u32,
    pub phases: BTreeMap<String, PhaseSettings>,
    pub approval: ApprovalSettings,
    pub checkpointing: CheckpointSettings,
    pub cost: CostSettings,
    pub langsmith: LangsmithSettings,
}

impl Default for FaberConfig {
    fn default() -> Self {
        let mut phases = BTreeMap::new();
        phases.insert(
            "frame".to_string(),
            PhaseSettings {
                model: Some("anthropic:claude-3-5-haiku-20241022".to_string()),
                ..Default::default()
            },
        );
        phases.insert(
            "architect".to_string(),
            PhaseSettings {
                model: Some("anthropic:claude-sonnet-4-20250514".to_string()),
                ..Default::default()
            },
        );
        phases.insert(
            "build".to_string(),
            PhaseSettings {
                model: Some("anthropic:claude-sonnet-4-20250514".to_string()),
                max_iterations: 100,
                ..Default::default()
            },
        );
        phases.insert(
            "evaluate".to_string(),
            PhaseSettings {
                model: Some("anthropic:claude-sonnet-4-20250514".to_string()),
                ..Default::default()
            },
        );
        phases.insert(
            "release".to_string(),
            PhaseSettings {
                model: Some("anthropic:claude-3-5-haiku-20241022".to_string()),
                ..Default::default()
            },
        );

        Self {
            autonomy: AutonomyLevel::default(),
            max_retries: 3,
            phases,
            approval: ApprovalSettings::default(),
            checkpointing: CheckpointSettings::default(),
            cost: CostSettings::default(),
            langsmith: LangsmithSettings::default(),
        }
    }
}

impl FaberConfig {
    /// Load configuration, searching standard locations under `project_root`
    /// when no explicit path is given. Missing files yield defaults.
    pub fn load(project_root: &Path, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match config_path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::ReadFailed {
                        path: p.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "configuration not found",
                        ),
                    });
                }
                p.to_path_buf()
            }
            None => {
                let candidates = [
                    project_root.join(FABER_DIR).join("config.yaml"),
                    project_root.join(FABER_DIR).join("config.yml"),
                    project_root.join("faber.yaml"),
                    project_root.join("faber.yml"),
                ];
                match candidates.into_iter().find(|p| p.exists()) {
                    Some(p) => p,
                    None => {
                        let mut config = Self::default();
                        config.apply_env_overrides();
                        return Ok(config);
                    }
                }
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFailed {
            path: path.clone(),
            source,
        })?;

        let raw: RawDocument =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidYaml {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let mut config = Self::from_raw(raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_raw(raw: RawDocument) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let workflow = raw.workflow.unwrap_or_default();

        if let Some(autonomy) = workflow.autonomy {
            config.autonomy = autonomy
                .parse()
                .map_err(|e: anyhow::Error| ConfigError::InvalidValue {
                    field: "workflow.autonomy".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Some(max_retries) = workflow.max_retries {
            config.max_retries = max_retries;
        }

        for phase in PIPELINE {
            if let Some(model) = workflow.models.get(phase) {
                if !model.contains(':') {
                    return Err(ConfigError::InvalidValue {
                        field: format!("workflow.models.{}", phase),
                        message: format!("model must be in 'provider:model' format, got: {}", model),
                    });
                }
                if let Some(settings) = config.phases.get_mut(phase) {
                    settings.model = Some(model.clone());
                }
            }
            if let Some(gated) = workflow.human_approval.get(phase) {
                if let Some(settings) = config.phases.get_mut(phase) {
                    settings.human_approval = Some(*gated);
                }
            }
        }

        if let Some(approval) = workflow.approval {
            config.approval = approval;
        }
        if let Some(checkpointing) = workflow.checkpointing {
            config.checkpointing = CheckpointSettings {
                backend: checkpointing.backend,
                path: checkpointing
                    .file
                    .and_then(|f| f.path)
                    .unwrap_or_else(default_checkpoint_path),
                url: checkpointing.network.and_then(|n| n.url),
            };
        }
        if let Some(cost) = workflow.cost {
            config.cost = cost;
        }
        if let Some(obs) = raw.observability {
            if let Some(langsmith) = obs.langsmith {
                config.langsmith = langsmith;
            }
        }

        Ok(config)
    }

    /// Apply recognised environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FABER_BUDGET_LIMIT_USD") {
            if let Ok(limit) = v.parse::<f64>() {
                self.cost.budget_limit_usd = limit;
            }
        }
        if let Ok(v) = std::env::var("FABER_APPROVAL_TIMEOUT_MINUTES") {
            if let Ok(minutes) = v.parse::<u64>() {
                self.approval.timeout_minutes = minutes;
            }
        }
        if let Ok(v) = std::env::var("FABER_CHECKPOINT_URL") {
            self.checkpointing.url = Some(v);
        }
        if let Ok(v) = std::env::var("FABER_LANGSMITH_PROJECT") {
            self.langsmith.project = v;
        }
    }

    /// Whether a phase requires a human-approval gate before it runs.
    /// An explicit `human_approval` setting wins over the autonomy default.
    pub fn requires_approval(&self, phase: &str) -> bool {
        if let Some(explicit) = self.phases.get(phase).and_then(|s| s.human_approval) {
            return explicit;
        }
        self.autonomy.default_gated_phases().contains(&phase)
    }

    /// Model selector for a phase, if configured.
    pub fn phase_model(&self, phase: &str) -> Option<&str> {
        self.phases.get(phase).and_then(|p| p.model.as_deref())
    }

    /// Validate the configuration, returning human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.cost.budget_limit_usd > 0.0 {
            if !(0.0..1.0).contains(&self.cost.warning_threshold)
                || self.cost.warning_threshold <= 0.0
            {
                errors.push(format!(
                    "cost.warning_threshold must be in (0, 1), got {}",
                    self.cost.warning_threshold
                ));
            }
            if !(0.0..1.0).contains(&self.cost.require_approval_at)
                || self.cost.require_approval_at <= 0.0
            {
                errors.push(format!(
                    "cost.require_approval_at must be in (0, 1), got {}",
                    self.cost.require_approval_at
                ));
            }
            if self.cost.require_approval_at < self.cost.warning_threshold {
                errors.push(
                    "cost.require_approval_at must be >= cost.warning_threshold".to_string(),
                );
            }
        }

        if self.checkpointing.backend == CheckpointBackend::Network
            && self.checkpointing.url.is_none()
        {
            errors.push("checkpointing.backend is 'network' but no url is configured".to_string());
        }

        for (name, settings) in &self.phases {
            if let Some(model) = &settings.model {
                if !model.contains(':') {
                    errors.push(format!(
                        "phases.{}.model must be 'provider:model', got: {}",
                        name, model
                    ));
                }
            }
            if settings.max_iterations == 0 {
                errors.push(format!("phases.{}.max_iterations must be >= 1", name));
            }
        }

        errors
    }

    /// Write the default configuration document to `.faber/config.yaml`.
    /// Refuses to overwrite an existing file unless `force` is set.
    pub fn init(project_root: &Path, force: bool) -> Result<PathBuf> {
        let config_dir = project_root.join(FABER_DIR);
        let config_file = config_dir.join(CONFIG_FILE);

        if config_file.exists() && !force {
            anyhow::bail!(
                "Configuration already exists at {}. Use --force to overwrite.",
                config_file.display()
            );
        }

        std::fs::create_dir_all(&config_dir).context("Failed to create .faber directory")?;
        std::fs::write(&config_file, default_document())
            .with_context(|| format!("Failed to write {}", config_file.display()))?;

        Ok(config_file)
    }
}

/// The default `.faber/config.yaml` document written by `config init`.
pub fn default_document() -> String {
    r#"workflow:
  autonomy: assisted
  max_retries: 3
  models:
    frame: anthropic:claude-3-5-haiku-20241022
    architect: anthropic:claude-sonnet-4-20250514
    build: anthropic:claude-sonnet-4-20250514
    evaluate: anthropic:claude-sonnet-4-20250514
    release: anthropic:claude-3-5-haiku-20241022
  human_approval:
    architect: true
    release: true
  approval:
    notify_channels:
      - cli
    response_channels:
      - cli
    timeout_minutes: 60
  checkpointing:
    backend: file
    file:
      path: .faber/checkpoints.json
  cost:
    budget_limit_usd: 10.0
    warning_threshold: 0.8
    require_approval_at: 0.9
observability:
  langsmith:
    enabled: true
    project: faber-workflows
"#
    .to_string()
}

// Raw serde mirror of the on-disk document layout. Converted to
// `FaberConfig` by `from_raw` so defaults and validation live in one place.

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    workflow: Option<RawWorkflow>,
    observability: Option<RawObservability>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWorkflow {
    autonomy: Option<String>,
    max_retries: Option<u32>,
    #[serde(default)]
    models: BTreeMap<String, String>,
    #[serde(default)]
    human_approval: BTreeMap<String, bool>,
    approval: Option<ApprovalSettings>,
    checkpointing: Option<RawCheckpointing>,
    cost: Option<CostSettings>,
}

#[derive(Debug, Deserialize)]
struct RawCheckpointing {
    #[serde(default)]
    backend: CheckpointBackend,
    file: Option<RawFileBackend>,
    network: Option<RawNetworkBackend>,
}

#[derive(Debug, Deserialize)]
struct RawFileBackend {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNetworkBackend {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawObservability {
    langsmith: Option<LangsmithSettings>,
}
