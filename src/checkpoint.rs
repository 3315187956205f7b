//! Durable checkpoint persistence, keyed by logical thread id.
//!
//! A `put` is flushed before it returns, so the engine can rely on the
//! checkpoint surviving a process crash before the next phase starts.
//! Writes are atomic at the value level: the file backend writes a temp
//! file, syncs it, and renames it over the store, so a concurrent reader
//! sees either the pre- or post-value, never a torn write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::config::{CheckpointBackend, CheckpointSettings};
use crate::errors::WorkflowError;
use crate::workflow::state::WorkflowState;

/// Keyed checkpoint storage. One writer per thread id (the engine owning
/// that workflow); readers may be arbitrary.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the state under `thread_id`, overwriting any prior value.
    /// Durable (flushed) before returning.
    async fn put(&self, thread_id: &str, state: &WorkflowState) -> Result<(), WorkflowError>;

    /// Fetch the latest state for `thread_id`, or `None` if unknown.
    async fn get(&self, thread_id: &str) -> Result<Option<WorkflowState>, WorkflowError>;
}

/// Construct the configured checkpoint backend.
pub fn create_store(
    project_root: &Path,
    settings: &CheckpointSettings,
) -> Result<Box<dyn CheckpointStore>, WorkflowError> {
    match settings.backend {
        CheckpointBackend::Memory => Ok(Box::new(MemoryCheckpointStore::new())),
        CheckpointBackend::File => Ok(Box::new(FileCheckpointStore::new(
            project_root.join(&settings.path),
        ))),
        CheckpointBackend::Network => {
            let url = settings.url.clone().ok_or_else(|| {
                WorkflowError::Checkpoint("network backend requires a url".to_string())
            })?;
            Ok(Box::new(HttpCheckpointStore::new(url)))
        }
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory store; the default for tests.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    states: RwLock<HashMap<String, WorkflowState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, thread_id: &str, state: &WorkflowState) -> Result<(), WorkflowError> {
        self.states
            .write()
            .await
            .insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        Ok(self.states.read().await.get(thread_id).cloned())
    }
}

// ============================================================================
// Single-file backend
// ============================================================================

/// Single-file key-value store under `<project>/.faber/checkpoints.json`.
/// The default production backend.
pub struct FileCheckpointStore {
    path: PathBuf,
    // Serializes writers within this process; cross-process safety comes
    // from the atomic rename.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, WorkflowState>, WorkflowError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| WorkflowError::Checkpoint(format!("corrupt checkpoint store: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(WorkflowError::Checkpoint(e.to_string())),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, thread_id: &str, state: &WorkflowState) -> Result<(), WorkflowError> {
        let _guard = self.write_lock.lock().await;

        let mut all = self.read_all().await?;
        all.insert(thread_id.to_string(), state.clone());

        let serialized = serde_json::to_vec_pretty(&all)
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;
        }

        // Temp file in the same directory, fsync, then atomic rename.
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;
        file.write_all(&serialized)
            .await
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        Ok(self.read_all().await?.remove(thread_id))
    }
}

// ============================================================================
// Network backend
// ============================================================================

/// Network key-value backend: `PUT/GET <base>/checkpoints/<thread_id>`.
pub struct HttpCheckpointStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCheckpointStore {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url_for(&self, thread_id: &str) -> String {
        format!("{}/checkpoints/{}", self.base_url, thread_id)
    }
}

#[async_trait]
impl CheckpointStore for HttpCheckpointStore {
    async fn put(&self, thread_id: &str, state: &WorkflowState) -> Result<(), WorkflowError> {
        let response = self
            .client
            .put(self.url_for(thread_id))
            .json(state)
            .send()
            .await
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WorkflowError::Checkpoint(format!(
                "checkpoint server returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        let response = self
            .client
            .get(self.url_for(thread_id))
            .send()
            .await
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(WorkflowError::Checkpoint(format!(
                "checkpoint server returned {}",
                response.status()
            )));
        }

        let state = response
            .json::<WorkflowState>()
            .await
            .map_err(|e| WorkflowError::Checkpoint(e.to_string()))?;
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{create_initial_state, PhaseResult};
    use serde_json::Map;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_put_get_roundtrip() {
        let store = MemoryCheckpointStore::new();
        let state = create_initial_state("WF-1", "1", Some(10.0));

        store.put("WF-1", &state).await.unwrap();
        let loaded = store.get("WF-1").await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "WF-1");
        assert_eq!(loaded.budget_limit_usd, Some(10.0));
    }

    #[tokio::test]
    async fn test_memory_unknown_thread_returns_none() {
        let store = MemoryCheckpointStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_put_overwrites() {
        let store = MemoryCheckpointStore::new();
        let mut state = create_initial_state("WF-1", "1", None);

        store.put("WF-1", &state).await.unwrap();
        state.retry_count = 2;
        store.put("WF-1", &state).await.unwrap();

        let loaded = store.get("WF-1").await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
    }

    #[tokio::test]
    async fn test_file_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".faber/checkpoints.json");
        let store = FileCheckpointStore::new(path.clone());

        let mut state = create_initial_state("WF-1", "1", None);
        state.record_phase_result(PhaseResult::completed("frame", 42, Map::new()));
        store.put("WF-1", &state).await.unwrap();

        assert!(path.exists());
        let loaded = store.get("WF-1").await.unwrap().unwrap();
        assert!(loaded.is_phase_completed("frame"));
    }

    #[tokio::test]
    async fn test_file_survives_fresh_store_instance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".faber/checkpoints.json");

        {
            let store = FileCheckpointStore::new(path.clone());
            let state = create_initial_state("WF-1", "1", None);
            store.put("WF-1", &state).await.unwrap();
        }

        // A fresh instance (as after a process restart) observes the put.
        let store = FileCheckpointStore::new(path);
        let loaded = store.get("WF-1").await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_file_multiple_threads_coexist() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints.json"));

        let a = create_initial_state("WF-a", "1", None);
        let b = create_initial_state("WF-b", "2", None);
        store.put("WF-a", &a).await.unwrap();
        store.put("WF-b", &b).await.unwrap();

        assert_eq!(store.get("WF-a").await.unwrap().unwrap().work_id, "1");
        assert_eq!(store.get("WF-b").await.unwrap().unwrap().work_id, "2");
        assert!(store.get("WF-c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_no_leftover_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let store = FileCheckpointStore::new(path.clone());

        let state = create_initial_state("WF-1", "1", None);
        store.put("WF-1", &state).await.unwrap();

        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_create_store_backends() {
        let dir = tempdir().unwrap();

        let memory = CheckpointSettings {
            backend: CheckpointBackend::Memory,
            ..Default::default()
        };
        assert!(create_store(dir.path(), &memory).is_ok());

        let network_missing_url = CheckpointSettings {
            backend: CheckpointBackend::Network,
            ..Default::default()
        };
        assert!(create_store(dir.path(), &network_missing_url).is_err());

        let network = CheckpointSettings {
            backend: CheckpointBackend::Network,
            url: Some("http://checkpoints.example.com".to_string()),
            ..Default::default()
        };
        assert!(create_store(dir.path(), &network).is_ok());
    }
}
