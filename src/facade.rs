//! Router Facade (C8): the single entry point composing the Registry,
//! Metadata Store, Cache, Adapter Framework, Health Monitor, Intelligent
//! Router, and Plugin Manager into one cohesive API.
//!
//! Grounded in `mcp_router.py::MCPRouter` — same lifecycle
//! (`initialize`/`shutdown`), same method surface (`route_request` →
//! [`route`], `register_server`, `unregister_server`, the
//! `get_*`/`check_server_health` introspection calls). Two behaviors are
//! deliberately not reproduced: `get_confidence_score()`'s hardcoded `0.7`
//! (confidence now flows straight from analysis), and the original's
//! silent `except Exception: return False` around registration (connect
//! failures are logged and the server is left Offline/Unknown rather than
//! the registration itself failing, matching §4.8's failure semantics).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, AdapterManager, NormalizedTool};
use crate::cache::CacheManager;
use crate::config::RouterConfig;
use crate::domain::{HealthStatus, LaunchSpec, Server};
use crate::error::{Result, RouterError};
use crate::health::HealthMonitor;
use crate::metadata::{MetadataStore, NamedCount, ServerMetadata, ServerMetadataInput, ToolInput, UsageStats};
use crate::plugin::{Plugin, PluginManager};
use crate::registry::ServerRegistry;
use crate::router::analysis::AnalysisOutcome;
use crate::router::{IntelligentRouter, RoutingDecision};

fn launch_spec_from_config(server: &crate::config::ServerConfig) -> LaunchSpec {
    LaunchSpec {
        kind: server.transport_kind,
        command: server.command.clone(),
        args: server.args.clone(),
        env: server.env.clone(),
        url: server.url.clone(),
    }
}

/// Checks an incoming tool call's arguments against the subset of JSON
/// Schema the router cares about: required top-level properties present.
/// Anything richer (types, nested schemas) is left to the server itself.
fn validate_required_fields(schema: &Value, args: &Value) -> Result<()> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    let provided = args.as_object();
    for field in required {
        let Some(name) = field.as_str() else { continue };
        let present = provided.map(|obj| obj.contains_key(name)).unwrap_or(false);
        if !present {
            return Err(RouterError::Validation(format!("missing required argument '{name}'")));
        }
    }
    Ok(())
}

pub struct RouterFacade {
    pub registry: Arc<ServerRegistry>,
    pub metadata: Option<Arc<MetadataStore>>,
    pub cache: Arc<CacheManager>,
    pub adapters: Arc<AdapterManager>,
    pub health_monitor: Arc<HealthMonitor>,
    pub router: Arc<IntelligentRouter>,
    pub plugins: Arc<PluginManager>,
    cancel: CancellationToken,
}

impl RouterFacade {
    pub fn new(
        registry: Arc<ServerRegistry>,
        metadata: Option<Arc<MetadataStore>>,
        cache: Arc<CacheManager>,
        adapters: Arc<AdapterManager>,
        health_monitor: Arc<HealthMonitor>,
        router: Arc<IntelligentRouter>,
        plugins: Arc<PluginManager>,
    ) -> Self {
        Self {
            registry,
            metadata,
            cache,
            adapters,
            health_monitor,
            router,
            plugins,
            cancel: CancellationToken::new(),
        }
    }

    /// Loads every server in `config` into the registry and metadata store,
    /// attempts to connect each one, then starts the background health
    /// sweep and cache tier sweeps. A connect failure is logged and the
    /// server is left registered but unreachable — registration itself
    /// never fails because one server's launch command is broken.
    pub async fn initialize(&self, config: &RouterConfig) -> Result<()> {
        tracing::info!("initializing router facade");

        for (id, server) in &config.servers {
            let spec = launch_spec_from_config(server);
            self.register_server(
                id,
                spec,
                server.name.clone(),
                server.description.clone(),
                server.capabilities.clone(),
                server.tags.clone(),
            )
            .await?;
        }

        self.cache.spawn_sweeps(self.cancel.clone());
        self.health_monitor.clone().spawn(self.cancel.clone());

        tracing::info!(server_count = config.servers.len(), "router facade initialized");
        Ok(())
    }

    pub async fn shutdown(&self) {
        tracing::info!("shutting down router facade");
        self.cancel.cancel();
        self.plugins.shutdown().await;
        for id in self.registry.online_ids().await {
            self.adapters.disconnect(&id).await;
        }
    }

    /// Registers a server: adds it to the Registry (always, starting
    /// `Unknown`) and the Metadata Store (if configured), then attempts a
    /// connection. §4.8: connect failures don't roll back registration.
    pub async fn register_server(
        &self,
        id: &str,
        spec: LaunchSpec,
        display_name: String,
        description: String,
        capabilities: Vec<String>,
        tags: Vec<String>,
    ) -> Result<()> {
        let cap_set: HashSet<String> = capabilities.iter().cloned().collect();
        let tag_set: HashSet<String> = tags.iter().cloned().collect();

        self.registry
            .register(id, spec.clone(), display_name.clone(), description.clone(), cap_set, tag_set)
            .await?;

        if let Some(metadata) = &self.metadata {
            metadata
                .upsert_server(
                    id,
                    &ServerMetadataInput {
                        name: display_name,
                        description,
                        transport_kind: spec.kind.as_str().to_string(),
                        command: spec.command.clone(),
                        args: spec.args.clone(),
                        env: spec.env.clone(),
                        capabilities,
                        tools: Vec::new(),
                        tags,
                    },
                )
                .await?;
        }

        match self.adapters.connect(id, &spec).await {
            Ok(()) => {
                if let Ok(tools) = self.adapters.list_tools(id).await {
                    self.sync_tools(id, &tools).await;
                }
            }
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "connect failed during registration, server left offline");
            }
        }

        Ok(())
    }

    async fn sync_tools(&self, server_id: &str, tools: &[NormalizedTool]) {
        let Some(metadata) = &self.metadata else { return };
        let Some(current) = metadata.read_server(server_id).await.ok().flatten() else {
            return;
        };
        let input = ServerMetadataInput {
            name: current.name,
            description: current.description,
            transport_kind: current.transport_kind,
            command: current.command,
            args: current.args,
            env: current.env,
            capabilities: current.capabilities,
            tools: tools
                .iter()
                .map(|t| ToolInput {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    schema: t.schema.clone(),
                })
                .collect(),
            tags: current.tags,
        };
        if let Err(e) = metadata.upsert_server(server_id, &input).await {
            tracing::warn!(server = %server_id, error = %e, "failed to sync discovered tools to metadata store");
        }
    }

    /// Unregisters a server: disconnects its adapter, removes it from the
    /// Registry and Metadata Store, and purges any cache entries tagged
    /// with its id.
    pub async fn unregister_server(&self, id: &str) -> Result<bool> {
        self.adapters.disconnect(id).await;
        let removed = self.registry.unregister(id).await?;
        if let Some(metadata) = &self.metadata {
            metadata.delete_server(id).await?;
        }
        self.cache.invalidate_tag(id).await;
        Ok(removed)
    }

    /// Routes a query (§4.8), serving from cache under `route:{query}` when
    /// possible. On a cache hit the underlying router is never invoked; a
    /// miss calls it once and caches the decision for 60s under the
    /// `"route"` tag. Hand-rolled rather than routed through
    /// [`CacheManager::cached`] because `select_servers` is fallible and
    /// `cached`'s `compute` closure isn't.
    pub async fn route(&self, query: &str) -> Result<RoutingDecision> {
        let cache_key = format!("route:{query}");

        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(decision) = serde_json::from_value::<RoutingDecision>(cached) {
                return Ok(decision);
            }
        }

        let decision = self.router.select_servers(query).await?;
        if let Ok(value) = serde_json::to_value(&decision) {
            self.cache
                .set(&cache_key, value, Some(Duration::from_secs(60)), &["route".to_string()])
                .await;
        }
        Ok(decision)
    }

    pub async fn analyze_query(&self, query: &str) -> AnalysisOutcome {
        self.router.analyze_query(query).await
    }

    /// Executes a tool call, validating required arguments before touching
    /// the adapter, serving from cache when possible, and recording usage
    /// on success. `no_cache` forces a fresh call and skips the cache
    /// read, though the fresh result is still written back.
    pub async fn execute_tool(&self, server_id: &str, tool_name: &str, args: Value, no_cache: bool) -> Result<Value> {
        if let Some(metadata) = &self.metadata {
            if let Ok(Some(server)) = metadata.read_server(server_id).await {
                if let Some(tool) = server.tools.into_iter().find(|t| t.name == tool_name) {
                    validate_required_fields(&tool.schema, &args)?;
                }
            }
        }

        let cache_key = format!("tool:{server_id}:{tool_name}:{}", md5_hex(&args));

        if !no_cache {
            if let Some(cached) = self.cache.get(&cache_key).await {
                return Ok(cached);
            }
        }

        let started = std::time::Instant::now();
        let result = self.adapters.execute_tool(server_id, tool_name, args).await;
        let elapsed = started.elapsed().as_secs_f64();

        if let Some(metadata) = &self.metadata {
            let _ = metadata.append_usage(server_id, tool_name, elapsed, result.is_ok()).await;
        }

        let value = result?;
        self.cache
            .set(&cache_key, value.clone(), Some(Duration::from_secs(300)), &[server_id.to_string()])
            .await;
        Ok(value)
    }

    pub async fn get_server_health(&self, server_id: &str) -> Option<crate::domain::HealthSnapshot> {
        self.registry.health(server_id).await
    }

    pub async fn get_all_server_health(&self) -> std::collections::HashMap<String, crate::domain::HealthSnapshot> {
        self.registry.all_health().await
    }

    pub async fn check_server_health(&self, server_id: &str) -> Result<HealthStatus> {
        self.health_monitor.check(server_id).await
    }

    pub async fn get_server_metadata(&self, server_id: &str) -> Result<Option<ServerMetadata>> {
        match &self.metadata {
            Some(metadata) => metadata.read_server(server_id).await,
            None => Ok(None),
        }
    }

    pub async fn get_server(&self, server_id: &str) -> Option<Server> {
        self.registry.lookup(server_id).await
    }

    pub async fn get_servers_by_capability(&self, capability: &str) -> Vec<String> {
        self.registry.by_capability(capability).await
    }

    pub async fn get_servers_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        match &self.metadata {
            Some(metadata) => metadata.by_tag(tag).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_all_capabilities(&self) -> Result<Vec<NamedCount>> {
        match &self.metadata {
            Some(metadata) => metadata.all_capabilities().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_all_tags(&self) -> Result<Vec<NamedCount>> {
        match &self.metadata {
            Some(metadata) => metadata.all_tags().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_usage_stats(&self, server_id: &str, window_days: i64) -> Result<Option<UsageStats>> {
        match &self.metadata {
            Some(metadata) => metadata.usage_stats(server_id, window_days).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_tools(&self, server_id: &str) -> Result<Vec<NormalizedTool>> {
        self.adapters.list_tools(server_id).await
    }

    pub async fn get_cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await
    }

    pub async fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get_plugin(name).await
    }

    pub async fn get_all_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.get_all_plugins().await
    }

    pub fn get_adapter(&self, kind: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.adapters().iter().find(|a| a.kind() == kind).cloned()
    }

    pub fn get_all_adapters(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.adapters().to_vec()
    }
}

fn md5_hex(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", md5::compute(bytes))
}

pub fn default_cache_config_dir() -> PathBuf {
    crate::cache::default_cache_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheManager};
    use crate::domain::TransportKind;
    use async_trait::async_trait;

    struct StubAdapter {
        healthy: bool,
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn kind(&self) -> &'static str {
            "stdio"
        }
        fn name(&self) -> &'static str {
            "stub"
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn can_handle(&self, _spec: &LaunchSpec) -> bool {
            true
        }
        async fn connect(&self, _server_id: &str, _spec: &LaunchSpec) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self, _server_id: &str) -> bool {
            true
        }
        async fn execute_tool(&self, _server_id: &str, _tool_name: &str, _args: Value) -> Result<Value> {
            Ok(serde_json::json!({"ok": true}))
        }
        async fn list_tools(&self, _server_id: &str) -> Result<Vec<NormalizedTool>> {
            Ok(vec![])
        }
        async fn probe_health(&self, _server_id: &str, _spec: &LaunchSpec) -> (bool, f64) {
            (self.healthy, 0.01)
        }
    }

    async fn fixture() -> (tempfile::TempDir, RouterFacade) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::load(dir.path().join("registry.json")).await);
        let cache = Arc::new(
            CacheManager::new(CacheConfig {
                memory_max_size: 100,
                disk_max_size: 100,
                disk_dir: Some(dir.path().join("cache")),
                use_disk: false,
            })
            .await,
        );
        let adapters = Arc::new(AdapterManager::new(vec![Arc::new(StubAdapter { healthy: true })]));
        let health_monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            None,
            adapters.clone(),
            crate::health::HealthMonitorConfig::default(),
        ));
        let router = Arc::new(IntelligentRouter::new(registry.clone(), None, None));
        let plugins = Arc::new(PluginManager::new(dir.path().join("plugins")));
        let facade = RouterFacade::new(registry, None, cache, adapters, health_monitor, router, plugins);
        (dir, facade)
    }

    #[tokio::test]
    async fn register_then_execute_tool_caches_result() {
        let (_dir, facade) = fixture().await;
        facade
            .register_server(
                "fs",
                LaunchSpec {
                    kind: TransportKind::Stdio,
                    command: Some("echo".into()),
                    args: vec![],
                    env: Default::default(),
                    url: None,
                },
                "Filesystem".into(),
                "".into(),
                vec!["filesystem".into()],
                vec![],
            )
            .await
            .unwrap();

        let first = facade.execute_tool("fs", "read", serde_json::json!({}), false).await.unwrap();
        assert_eq!(first, serde_json::json!({"ok": true}));

        let stats_before = facade.get_cache_stats().await;
        let second = facade.execute_tool("fs", "read", serde_json::json!({}), false).await.unwrap();
        assert_eq!(second, first);
        let stats_after = facade.get_cache_stats().await;
        assert!(stats_after.memory.hits > stats_before.memory.hits);
    }

    #[tokio::test]
    async fn route_is_served_from_cache_on_second_call() {
        let (_dir, facade) = fixture().await;
        facade
            .register_server(
                "fs",
                LaunchSpec {
                    kind: TransportKind::Stdio,
                    command: Some("echo".into()),
                    args: vec![],
                    env: Default::default(),
                    url: None,
                },
                "Filesystem".into(),
                "".into(),
                vec!["filesystem".into()],
                vec![],
            )
            .await
            .unwrap();

        let first = facade.route("read a file please").await.unwrap();
        let stats_before = facade.get_cache_stats().await;
        let second = facade.route("read a file please").await.unwrap();
        let stats_after = facade.get_cache_stats().await;

        assert_eq!(first.servers, second.servers);
        assert!(stats_after.memory.hits > stats_before.memory.hits);
    }

    #[tokio::test]
    async fn unregister_purges_tagged_cache_entries() {
        let (_dir, facade) = fixture().await;
        facade
            .register_server(
                "fs",
                LaunchSpec {
                    kind: TransportKind::Stdio,
                    command: Some("echo".into()),
                    args: vec![],
                    env: Default::default(),
                    url: None,
                },
                "Filesystem".into(),
                "".into(),
                vec![],
                vec![],
            )
            .await
            .unwrap();
        facade.execute_tool("fs", "read", serde_json::json!({}), false).await.unwrap();

        facade.unregister_server("fs").await.unwrap();
        assert!(facade.get_server("fs").await.is_none());
        let stats = facade.get_cache_stats().await;
        assert_eq!(stats.tagged_keys, 0);
    }
}
