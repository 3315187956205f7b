//! Function tool variant.
//!
//! Tool definitions are untrusted, so functions are never resolved by
//! dynamic lookup: trusted code registers callables (and allowlists their
//! module names) at program start, and a definition can only reference what
//! was registered. Module matching is exact: a hostile definition naming
//! `faber.tools.work_evil` does not match an allowlisted `faber.tools.work`
//! prefix, because there is no prefix matching at all.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

use crate::errors::ToolError;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

type SyncFn = dyn Fn(Map<String, Value>) -> anyhow::Result<Value> + Send + Sync;
type AsyncFn =
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

#[derive(Clone)]
enum Callable {
    /// Synchronous: dispatched to the blocking worker pool so it cannot
    /// stall the engine's cooperative scheduler.
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

/// Registry of in-process tool functions, keyed by (module, function).
#[derive(Default)]
pub struct FunctionRegistry {
    allowed_modules: RwLock<HashSet<String>>,
    functions: RwLock<HashMap<(String, String), Callable>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allowlist a module name. Only trusted startup code should call this.
    pub fn register_module(&self, module: &str) -> anyhow::Result<()> {
        if module.trim().is_empty() {
            anyhow::bail!("module name must not be empty");
        }
        self.allowed_modules
            .write()
            .expect("function registry lock poisoned")
            .insert(module.to_string());
        Ok(())
    }

    /// Whether a module name is allowlisted (exact equality).
    pub fn is_module_allowed(&self, module: &str) -> bool {
        self.allowed_modules
            .read()
            .expect("function registry lock poisoned")
            .contains(module)
    }

    /// Register a synchronous function and allowlist its module.
    pub fn register_sync<F>(&self, module: &str, function: &str, f: F) -> anyhow::Result<()>
    where
        F: Fn(Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_module(module)?;
        self.functions
            .write()
            .expect("function registry lock poisoned")
            .insert(
                (module.to_string(), function.to_string()),
                Callable::Sync(Arc::new(f)),
            );
        Ok(())
    }

    /// Register an asynchronous function and allowlist its module.
    pub fn register_async<F>(&self, module: &str, function: &str, f: F) -> anyhow::Result<()>
    where
        F: Fn(Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.register_module(module)?;
        self.functions
            .write()
            .expect("function registry lock poisoned")
            .insert(
                (module.to_string(), function.to_string()),
                Callable::Async(Arc::new(f)),
            );
        Ok(())
    }

    fn resolve(&self, module: &str, function: &str) -> Result<Callable, ToolError> {
        if !self.is_module_allowed(module) {
            return Err(ToolError::ModuleNotAllowed {
                module: module.to_string(),
            });
        }
        self.functions
            .read()
            .expect("function registry lock poisoned")
            .get(&(module.to_string(), function.to_string()))
            .cloned()
            .ok_or_else(|| ToolError::FunctionNotFound {
                module: module.to_string(),
                function: function.to_string(),
            })
    }

    /// Execute a registered function under a timeout. Non-object return
    /// values are wrapped as `{"result": value}`.
    pub async fn execute(
        &self,
        tool_name: &str,
        module: &str,
        function: &str,
        timeout_seconds: Option<u64>,
        params: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let callable = self.resolve(module, function)?;
        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS));

        let outcome = match callable {
            Callable::Async(f) => match tokio::time::timeout(timeout, (*f)(params)).await {
                Ok(result) => result,
                Err(_) => {
                    // The future is dropped here, cancelling it at its next
                    // suspension point.
                    return Err(ToolError::Timeout {
                        tool: tool_name.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
            },
            Callable::Sync(f) => {
                let task = tokio::task::spawn_blocking(move || (*f)(params));
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(anyhow::anyhow!(
                        "function task panicked: {}",
                        join_err
                    )),
                    Err(_) => {
                        // A blocking worker cannot be interrupted; it is
                        // left to finish on the pool and its result is
                        // abandoned.
                        warn!(
                            tool = tool_name,
                            "synchronous function timed out; worker left to finish"
                        );
                        return Err(ToolError::Timeout {
                            tool: tool_name.to_string(),
                            seconds: timeout.as_secs(),
                        });
                    }
                }
            }
        };

        match outcome {
            Ok(value) => Ok(wrap_result(value)),
            Err(e) => Err(ToolError::ExecutionFailed {
                tool: tool_name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn wrap_result(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        serde_json::json!({ "result": value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_module_validates_input() {
        let registry = FunctionRegistry::new();
        assert!(registry.register_module("").is_err());
        assert!(registry.register_module("   ").is_err());
        assert!(registry.register_module("faber.tools.work").is_ok());
        assert!(registry.is_module_allowed("faber.tools.work"));
    }

    #[test]
    fn test_module_match_is_exact_not_prefix() {
        let registry = FunctionRegistry::new();
        registry.register_module("faber.tools").unwrap();

        assert!(registry.is_module_allowed("faber.tools"));
        // Prefix-extension attacks must not match.
        assert!(!registry.is_module_allowed("faber.tools_evil"));
        assert!(!registry.is_module_allowed("faber.tools.sub"));
        assert!(!registry.is_module_allowed("faber"));
    }

    #[tokio::test]
    async fn test_execute_unallowed_module_rejected() {
        let registry = FunctionRegistry::new();
        let err = registry
            .execute("t", "os.system", "run", None, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ModuleNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_execute_unregistered_function_rejected() {
        let registry = FunctionRegistry::new();
        registry.register_module("faber.tools.work").unwrap();
        let err = registry
            .execute("t", "faber.tools.work", "missing", None, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::FunctionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_execute_sync_function() {
        let registry = FunctionRegistry::new();
        registry
            .register_sync("faber.tools.work", "fetch", |params| {
                let id = params.get("id").and_then(|v| v.as_str()).unwrap_or("?");
                Ok(json!({"issue": id, "state": "open"}))
            })
            .unwrap();

        let mut params = Map::new();
        params.insert("id".to_string(), json!("42"));
        let result = registry
            .execute("fetch", "faber.tools.work", "fetch", None, params)
            .await
            .unwrap();
        assert_eq!(result["issue"], "42");
    }

    #[tokio::test]
    async fn test_execute_async_function() {
        let registry = FunctionRegistry::new();
        registry
            .register_async("faber.tools.repo", "branch", |_params| {
                Box::pin(async { Ok(json!({"branch": "feature/x"})) })
            })
            .unwrap();

        let result = registry
            .execute("branch", "faber.tools.repo", "branch", None, Map::new())
            .await
            .unwrap();
        assert_eq!(result["branch"], "feature/x");
    }

    #[tokio::test]
    async fn test_non_object_result_is_wrapped() {
        let registry = FunctionRegistry::new();
        registry
            .register_sync("m", "count", |_| Ok(json!(7)))
            .unwrap();

        let result = registry
            .execute("count", "m", "count", None, Map::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"result": 7}));
    }

    #[tokio::test]
    async fn test_function_error_becomes_execution_failed() {
        let registry = FunctionRegistry::new();
        registry
            .register_sync("m", "boom", |_| Err(anyhow::anyhow!("kaput")))
            .unwrap();

        let err = registry
            .execute("boom", "m", "boom", None, Map::new())
            .await
            .unwrap_err();
        match err {
            ToolError::ExecutionFailed { message, .. } => assert!(message.contains("kaput")),
            other => panic!("Expected ExecutionFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_function_timeout() {
        let registry = FunctionRegistry::new();
        registry
            .register_async("m", "slow", |_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!({}))
                })
            })
            .unwrap();

        let err = registry
            .execute("slow", "m", "slow", Some(1), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { seconds: 1, .. }));
    }

    #[tokio::test]
    async fn test_sync_function_timeout_returns_promptly() {
        let registry = FunctionRegistry::new();
        registry
            .register_sync("m", "block", |_| {
                std::thread::sleep(Duration::from_secs(2));
                Ok(json!({}))
            })
            .unwrap();

        let start = std::time::Instant::now();
        let err = registry
            .execute("block", "m", "block", Some(1), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        // The engine regains control at the timeout, not when the worker
        // finishes.
        assert!(start.elapsed() < Duration::from_secs(2));

        // Let the abandoned worker finish so the runtime shuts down cleanly.
        tokio::time::sleep(Duration::from_millis(1500)).await;
    }
}
