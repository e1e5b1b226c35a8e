//! Plugin System (C7): extension points for custom request handling,
//! custom transports, and custom routing strategies.
//!
//! Grounded in `plugin_interface.py`'s four-trait hierarchy
//! (`PluginInterface` + `RouterExtensionPlugin`/`ServerAdapterPlugin`/
//! `RoutingStrategyPlugin`). `plugin_manager.py`'s `discover_plugins`
//! dynamically imports every `.py` file under a plugins directory at
//! startup; this is the explicit redesign flag (§9) — plugins here are
//! registered statically by the code that builds the [`PluginManager`],
//! not discovered by scanning a directory at runtime.

pub mod config;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::LaunchSpec;
use crate::error::{Result, RouterError};
use crate::router::analysis::AnalysisOutcome;

pub use config::PluginConfigStore;

/// Identity and lifecycle every plugin kind shares.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn initialize(&self) -> Result<bool>;
    async fn shutdown(&self) -> Result<()>;
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn description(&self) -> &str;
}

/// Intercepts a query before normal routing. Returning `Some` short-circuits
/// the rest of the pipeline with the plugin's own response.
#[async_trait]
pub trait RouterExtensionPlugin: Plugin {
    async fn handle_request(&self, query: &str, context: &Value) -> Result<Option<Value>>;
}

/// Adds support for a server transport the built-in adapters don't cover.
#[async_trait]
pub trait ServerAdapterPlugin: Plugin {
    async fn can_handle_server(&self, launch_spec: &LaunchSpec) -> bool;
    async fn connect_to_server(&self, server_id: &str, launch_spec: &LaunchSpec) -> Result<()>;
    async fn disconnect_from_server(&self, server_id: &str) -> bool;
    async fn execute_tool(&self, server_id: &str, tool_name: &str, args: Value) -> Result<Value>;
}

/// Overrides server selection for a query. Returning `None` defers to the
/// router's own capability/metadata-based selection.
#[async_trait]
pub trait RoutingStrategyPlugin: Plugin {
    async fn select_servers(
        &self,
        query: &str,
        analysis: &AnalysisOutcome,
        available_servers: &[String],
    ) -> Option<Vec<String>>;

    /// Confidence in the last selection this plugin made. Used to break
    /// ties between competing routing strategy plugins (highest confidence
    /// wins; ties broken by plugin name, ascending).
    fn confidence_score(&self) -> f64;
}

/// Holds every registered plugin, indexed both by name (for introspection)
/// and by kind (for the façade to invoke the right hook).
pub struct PluginManager {
    all: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    extensions: RwLock<Vec<Arc<dyn RouterExtensionPlugin>>>,
    adapter_plugins: RwLock<Vec<Arc<dyn ServerAdapterPlugin>>>,
    routing_strategies: RwLock<Vec<Arc<dyn RoutingStrategyPlugin>>>,
    pub config: PluginConfigStore,
}

impl PluginManager {
    pub fn new(config_dir: std::path::PathBuf) -> Self {
        Self {
            all: RwLock::new(HashMap::new()),
            extensions: RwLock::new(Vec::new()),
            adapter_plugins: RwLock::new(Vec::new()),
            routing_strategies: RwLock::new(Vec::new()),
            config: PluginConfigStore::new(config_dir),
        }
    }

    /// Rejects a plugin whose name collides with one already registered
    /// (§4.7): the existing registration is kept, the new one is refused.
    async fn track(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if self.all.read().await.contains_key(plugin.name()) {
            tracing::warn!(plugin = %plugin.name(), "duplicate plugin name rejected");
            return Err(RouterError::Validation(format!("plugin '{}' is already registered", plugin.name())));
        }
        plugin.initialize().await?;
        self.all.write().await.insert(plugin.name().to_string(), plugin);
        Ok(())
    }

    pub async fn register_extension(&self, plugin: Arc<dyn RouterExtensionPlugin>) -> Result<()> {
        self.track(plugin.clone() as Arc<dyn Plugin>).await?;
        self.extensions.write().await.push(plugin);
        Ok(())
    }

    pub async fn register_adapter_plugin(&self, plugin: Arc<dyn ServerAdapterPlugin>) -> Result<()> {
        self.track(plugin.clone() as Arc<dyn Plugin>).await?;
        self.adapter_plugins.write().await.push(plugin);
        Ok(())
    }

    pub async fn register_routing_strategy(&self, plugin: Arc<dyn RoutingStrategyPlugin>) -> Result<()> {
        self.track(plugin.clone() as Arc<dyn Plugin>).await?;
        self.routing_strategies.write().await.push(plugin);
        Ok(())
    }

    pub async fn shutdown(&self) {
        for (name, plugin) in self.all.write().await.drain() {
            if let Err(e) = plugin.shutdown().await {
                tracing::warn!(plugin = %name, error = %e, "error shutting down plugin");
            }
        }
        self.extensions.write().await.clear();
        self.adapter_plugins.write().await.clear();
        self.routing_strategies.write().await.clear();
    }

    pub async fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.all.read().await.get(name).cloned()
    }

    pub async fn get_all_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.all.read().await.values().cloned().collect()
    }

    pub async fn extensions(&self) -> Vec<Arc<dyn RouterExtensionPlugin>> {
        self.extensions.read().await.clone()
    }

    pub async fn adapter_plugins(&self) -> Vec<Arc<dyn ServerAdapterPlugin>> {
        self.adapter_plugins.read().await.clone()
    }

    pub async fn routing_strategies(&self) -> Vec<Arc<dyn RoutingStrategyPlugin>> {
        self.routing_strategies.read().await.clone()
    }
}
