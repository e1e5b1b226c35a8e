//! MCP Router — registers heterogeneous Model Context Protocol tool
//! servers, analyzes natural-language queries to pick the right ones, and
//! dispatches tool calls across transports while keeping the fleet healthy
//! via caching, health monitoring, and a plugin system.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod ewma;
pub mod facade;
pub mod health;
pub mod metadata;
pub mod plugin;
pub mod registry;
pub mod router;

pub use adapter::{Adapter, AdapterManager, NormalizedTool};
pub use cache::{CacheConfig, CacheManager, CacheStats};
pub use config::RouterConfig;
pub use domain::{HealthSnapshot, HealthStatus, LaunchSpec, Server, TransportKind};
pub use error::{Result, RouterError};
pub use facade::RouterFacade;
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use metadata::MetadataStore;
pub use plugin::{Plugin, PluginManager, RouterExtensionPlugin, RoutingStrategyPlugin, ServerAdapterPlugin};
pub use registry::ServerRegistry;
pub use router::analysis::{AnalysisOutcome, LlmAnalyzer};
pub use router::IntelligentRouter;
