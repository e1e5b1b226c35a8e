//! Adapter Framework (C4): pluggable abstraction over server transports.

pub mod stdio;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::LaunchSpec;
use crate::error::{Result, RouterError};

/// A tool normalized from whatever shape the wire protocol presents.
#[derive(Debug, Clone)]
pub struct NormalizedTool {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Fixed interface every transport adapter implements (§4.4).
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;

    fn can_handle(&self, spec: &LaunchSpec) -> bool;

    async fn connect(&self, server_id: &str, spec: &LaunchSpec) -> Result<()>;
    async fn disconnect(&self, server_id: &str) -> bool;
    async fn execute_tool(&self, server_id: &str, tool_name: &str, args: Value) -> Result<Value>;
    async fn list_tools(&self, server_id: &str) -> Result<Vec<NormalizedTool>>;
    /// Returns `(healthy, elapsed_seconds)`. Never returns an error — all
    /// failures are folded into `(false, elapsed)`.
    async fn probe_health(&self, server_id: &str, spec: &LaunchSpec) -> (bool, f64);
}

/// Indexes adapters by `kind`, and tracks which adapter owns each connected
/// server so later calls (`execute_tool`, `disconnect`) can be routed
/// without re-running selection.
pub struct AdapterManager {
    adapters: Vec<Arc<dyn Adapter>>,
    owning_adapter: RwLock<HashMap<String, Arc<dyn Adapter>>>,
}

impl AdapterManager {
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        Self {
            adapters,
            owning_adapter: RwLock::new(HashMap::new()),
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    /// Adapter selection (§4.4, Testable Properties §8): first the adapters
    /// whose `kind()` matches the launch spec's kind, in registration order;
    /// if none `can_handle`, fall back to every adapter in registration
    /// order.
    fn select(&self, spec: &LaunchSpec) -> Option<&Arc<dyn Adapter>> {
        let kind = spec.kind.as_str();
        self.adapters
            .iter()
            .filter(|a| a.kind() == kind)
            .find(|a| a.can_handle(spec))
            .or_else(|| self.adapters.iter().find(|a| a.can_handle(spec)))
    }

    pub async fn connect(&self, server_id: &str, spec: &LaunchSpec) -> Result<()> {
        let adapter = self
            .select(spec)
            .ok_or_else(|| RouterError::Adapter(server_id.to_string(), "no adapter can handle launch spec".into()))?
            .clone();
        adapter.connect(server_id, spec).await?;
        self.owning_adapter
            .write()
            .await
            .insert(server_id.to_string(), adapter);
        Ok(())
    }

    pub async fn disconnect(&self, server_id: &str) -> bool {
        match self.owning_adapter.write().await.remove(server_id) {
            Some(adapter) => adapter.disconnect(server_id).await,
            None => true,
        }
    }

    pub async fn execute_tool(&self, server_id: &str, tool_name: &str, args: Value) -> Result<Value> {
        let adapter = self
            .owning_adapter
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| RouterError::Validation(format!("unknown or unconnected server '{server_id}'")))?;
        adapter.execute_tool(server_id, tool_name, args).await
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<NormalizedTool>> {
        let adapter = self
            .owning_adapter
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| RouterError::Validation(format!("unknown or unconnected server '{server_id}'")))?;
        adapter.list_tools(server_id).await
    }

    /// Probes via the owning adapter if connected, else via the adapter
    /// selection algorithm for a transient connect/disconnect round-trip.
    pub async fn probe_health(&self, server_id: &str, spec: &LaunchSpec) -> (bool, f64) {
        let adapter = self.owning_adapter.read().await.get(server_id).cloned();
        let adapter = match adapter {
            Some(a) => a,
            None => match self.select(spec) {
                Some(a) => a.clone(),
                None => return (false, 0.0),
            },
        };
        adapter.probe_health(server_id, spec).await
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.owning_adapter.read().await.contains_key(server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransportKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        kind: &'static str,
        handles: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Adapter for FakeAdapter {
        fn kind(&self) -> &'static str {
            self.kind
        }
        fn name(&self) -> &'static str {
            "fake"
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn can_handle(&self, _spec: &LaunchSpec) -> bool {
            self.handles
        }
        async fn connect(&self, _server_id: &str, _spec: &LaunchSpec) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self, _server_id: &str) -> bool {
            true
        }
        async fn execute_tool(&self, _server_id: &str, _tool_name: &str, _args: Value) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn list_tools(&self, _server_id: &str) -> Result<Vec<NormalizedTool>> {
            Ok(vec![])
        }
        async fn probe_health(&self, _server_id: &str, _spec: &LaunchSpec) -> (bool, f64) {
            (true, 0.01)
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            kind: TransportKind::Stdio,
            command: Some("echo".into()),
            args: vec![],
            env: Default::default(),
            url: None,
        }
    }

    #[tokio::test]
    async fn selects_matching_kind_first() {
        let kind_match = Arc::new(FakeAdapter {
            kind: "stdio",
            handles: true,
            calls: AtomicUsize::new(0),
        });
        let fallback = Arc::new(FakeAdapter {
            kind: "other",
            handles: true,
            calls: AtomicUsize::new(0),
        });
        let manager = AdapterManager::new(vec![fallback.clone(), kind_match.clone()]);
        manager.connect("fs", &spec()).await.unwrap();
        assert_eq!(kind_match.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_to_can_handle_when_no_kind_match() {
        let fallback = Arc::new(FakeAdapter {
            kind: "other",
            handles: true,
            calls: AtomicUsize::new(0),
        });
        let manager = AdapterManager::new(vec![fallback.clone()]);
        manager.connect("fs", &spec()).await.unwrap();
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_adapter_handles_returns_adapter_error() {
        let none = Arc::new(FakeAdapter {
            kind: "stdio",
            handles: false,
            calls: AtomicUsize::new(0),
        });
        let manager = AdapterManager::new(vec![none]);
        let err = manager.connect("fs", &spec()).await.unwrap_err();
        assert!(matches!(err, RouterError::Adapter(_, _)));
    }
}
