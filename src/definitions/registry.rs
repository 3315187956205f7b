//! Definition registry: discovery, indexing, and persistence of YAML
//! agent/tool definitions.
//!
//! The registry scans `.fractary/agents/` and `.fractary/tools/` under a
//! project root. A parse failure in one file never halts registration of
//! the others; the bad file is logged and its name is absent from the
//! index. Reloads build a fresh index and swap it atomically, so readers
//! observe either the pre- or post-reload state, never a partial one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::definitions::schema::{AgentDefinition, ToolDefinition};
use crate::errors::RegistryError;

pub const AGENTS_DIR: &str = ".fractary/agents";
pub const TOOLS_DIR: &str = ".fractary/tools";

#[derive(Debug, Default)]
struct Index {
    agents: BTreeMap<String, AgentDefinition>,
    tools: BTreeMap<String, ToolDefinition>,
}

/// Registry for agent and tool definitions.
pub struct DefinitionRegistry {
    project_root: PathBuf,
    index: RwLock<Index>,
}

impl DefinitionRegistry {
    /// Create a registry rooted at `project_root` and scan both definition
    /// directories.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let registry = Self {
            project_root: project_root.into(),
            index: RwLock::new(Index::default()),
        };
        registry.reload();
        registry
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn agents_dir(&self) -> PathBuf {
        self.project_root.join(AGENTS_DIR)
    }

    fn tools_dir(&self) -> PathBuf {
        self.project_root.join(TOOLS_DIR)
    }

    /// Discard the in-memory index and re-scan both directories. The new
    /// index is swapped in atomically.
    pub fn reload(&self) {
        let mut fresh = Index::default();

        for path in yaml_files(&self.agents_dir()) {
            match load_agent(&path) {
                Ok(agent) => {
                    debug!(name = %agent.name, path = %path.display(), "Loaded agent");
                    // Later files win on duplicate names
                    fresh.agents.insert(agent.name.clone(), agent);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load agent"),
            }
        }

        for path in yaml_files(&self.tools_dir()) {
            match load_tool(&path) {
                Ok(tool) => {
                    debug!(name = %tool.name, path = %path.display(), "Loaded tool");
                    fresh.tools.insert(tool.name.clone(), tool);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load tool"),
            }
        }

        *self.index.write().expect("registry lock poisoned") = fresh;
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    pub fn get_agent(&self, name: &str) -> Option<AgentDefinition> {
        self.index
            .read()
            .expect("registry lock poisoned")
            .agents
            .get(name)
            .cloned()
    }

    pub fn get_agent_or_raise(&self, name: &str) -> Result<AgentDefinition, RegistryError> {
        self.get_agent(name).ok_or_else(|| {
            let index = self.index.read().expect("registry lock poisoned");
            RegistryError::AgentNotFound {
                name: name.to_string(),
                available: available_names(index.agents.keys()),
            }
        })
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.index
            .read()
            .expect("registry lock poisoned")
            .tools
            .get(name)
            .cloned()
    }

    pub fn get_tool_or_raise(&self, name: &str) -> Result<ToolDefinition, RegistryError> {
        self.get_tool(name).ok_or_else(|| {
            let index = self.index.read().expect("registry lock poisoned");
            RegistryError::ToolNotFound {
                name: name.to_string(),
                available: available_names(index.tools.keys()),
            }
        })
    }

    /// List agents, optionally filtered by tags (OR semantics). Sorted by
    /// name.
    pub fn list_agents(&self, tags: Option<&[String]>) -> Vec<AgentDefinition> {
        let index = self.index.read().expect("registry lock poisoned");
        index
            .agents
            .values()
            .filter(|a| matches_tags(&a.tags, tags))
            .cloned()
            .collect()
    }

    /// List tools, optionally filtered by tags (OR semantics). Sorted by
    /// name.
    pub fn list_tools(&self, tags: Option<&[String]>) -> Vec<ToolDefinition> {
        let index = self.index.read().expect("registry lock poisoned");
        index
            .tools
            .values()
            .filter(|t| matches_tags(&t.tags, tags))
            .cloned()
            .collect()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist an agent definition to `.fractary/agents/<name>.yaml` and
    /// refresh the index.
    pub fn save_agent(&self, agent: &AgentDefinition) -> Result<PathBuf, RegistryError> {
        let errors = agent.validate();
        if !errors.is_empty() {
            return Err(RegistryError::InvalidDefinition {
                path: self.agents_dir().join(format!("{}.yaml", agent.name)),
                message: errors.join("; "),
            });
        }

        let dir = self.agents_dir();
        let path = dir.join(format!("{}.yaml", agent.name));
        write_definition(&dir, &path, agent)?;

        self.index
            .write()
            .expect("registry lock poisoned")
            .agents
            .insert(agent.name.clone(), agent.clone());
        Ok(path)
    }

    /// Persist a tool definition to `.fractary/tools/<name>.yaml` and
    /// refresh the index.
    pub fn save_tool(&self, tool: &ToolDefinition) -> Result<PathBuf, RegistryError> {
        let errors = tool.validate();
        if !errors.is_empty() {
            return Err(RegistryError::InvalidDefinition {
                path: self.tools_dir().join(format!("{}.yaml", tool.name)),
                message: errors.join("; "),
            });
        }

        let dir = self.tools_dir();
        let path = dir.join(format!("{}.yaml", tool.name));
        write_definition(&dir, &path, tool)?;

        self.index
            .write()
            .expect("registry lock poisoned")
            .tools
            .insert(tool.name.clone(), tool.clone());
        Ok(path)
    }

    /// Delete an agent definition from disk and the index. Returns false if
    /// the name is unknown.
    pub fn delete_agent(&self, name: &str) -> bool {
        let mut index = self.index.write().expect("registry lock poisoned");
        if index.agents.remove(name).is_none() {
            return false;
        }
        let path = self.agents_dir().join(format!("{}.yaml", name));
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        true
    }

    /// Delete a tool definition from disk and the index. Returns false if
    /// the name is unknown.
    pub fn delete_tool(&self, name: &str) -> bool {
        let mut index = self.index.write().expect("registry lock poisoned");
        if index.tools.remove(name).is_none() {
            return false;
        }
        let path = self.tools_dir().join(format!("{}.yaml", name));
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        true
    }
}

fn available_names<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let joined = names.cloned().collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined
    }
}

fn matches_tags(own: &[String], wanted: Option<&[String]>) -> bool {
    match wanted {
        None => true,
        Some(tags) => tags.iter().any(|t| own.contains(t)),
    }
}

fn yaml_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(dir = %dir.display(), "Definitions directory not found");
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml")
        })
        .collect();
    files.sort();
    files
}

fn load_agent(path: &Path) -> Result<AgentDefinition, RegistryError> {
    let agent: AgentDefinition = parse_yaml(path)?;
    let errors = agent.validate();
    if !errors.is_empty() {
        return Err(RegistryError::InvalidDefinition {
            path: path.to_path_buf(),
            message: errors.join("; "),
        });
    }
    Ok(agent)
}

fn load_tool(path: &Path) -> Result<ToolDefinition, RegistryError> {
    let tool: ToolDefinition = parse_yaml(path)?;
    let errors = tool.validate();
    if !errors.is_empty() {
        return Err(RegistryError::InvalidDefinition {
            path: path.to_path_buf(),
            message: errors.join("; "),
        });
    }
    Ok(tool)
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RegistryError> {
    let content = std::fs::read_to_string(path).map_err(|e| RegistryError::InvalidDefinition {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if content.trim().is_empty() {
        return Err(RegistryError::EmptyFile {
            path: path.to_path_buf(),
        });
    }

    serde_yaml::from_str(&content).map_err(|e| RegistryError::InvalidDefinition {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn write_definition<T: serde::Serialize>(
    dir: &Path,
    path: &Path,
    value: &T,
) -> Result<(), RegistryError> {
    std::fs::create_dir_all(dir).map_err(|source| RegistryError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;

    let yaml = serde_yaml::to_string(value).map_err(|e| RegistryError::InvalidDefinition {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    std::fs::write(path, yaml).map_err(|source| RegistryError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })
}
