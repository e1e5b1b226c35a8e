//! Command-line interface for the MCP Router.
//!
//! Thin wrapper over [`mcp_router::RouterFacade`]: every subcommand loads
//! `config.json`, builds the façade's components, and calls exactly the
//! operation it names. No subcommand starts the background health sweep or
//! cache sweeps — those belong to a long-running process, and this CLI is
//! one-shot per invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_router::adapter::stdio::StdioAdapter;
use mcp_router::{
    Adapter, AdapterManager, CacheConfig, CacheManager, HealthMonitor, HealthMonitorConfig,
    IntelligentRouter, MetadataStore, PluginManager, RouterConfig, RouterFacade, ServerRegistry,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcp-router", version, about = "Router for Model Context Protocol tool servers")]
struct Cli {
    /// Path to config.json [default: ./config.json or ~/.config/mcp-router/config.json]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding registry.json and metadata.db [default: ~/.local/share/mcp-router]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a query and select the servers that should handle it
    Route { query: String },
    /// Register a stdio-transport server
    Register {
        id: String,
        #[arg(long)]
        command: String,
        #[arg(long = "arg")]
        args: Vec<String>,
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Unregister a server
    Unregister { id: String },
    /// Execute a tool on a registered server
    Execute {
        server_id: String,
        tool_name: String,
        /// JSON object of tool arguments
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long)]
        no_cache: bool,
    },
    /// Show health for one server, or every server if none is given
    Health { server_id: Option<String> },
    /// Show cache hit/miss statistics
    Stats,
    /// Clear the cache
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir);
    tokio::fs::create_dir_all(&data_dir).await.ok();

    let config_path = resolve_config_path(cli.config);
    let config = load_config(&config_path).await?;

    let registry = Arc::new(ServerRegistry::load(data_dir.join("registry.json")).await);
    let metadata = match MetadataStore::connect(&data_dir.join("metadata.db")).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(error = %e, "metadata store unavailable, continuing without it");
            None
        }
    };
    let cache = Arc::new(
        CacheManager::new(CacheConfig {
            disk_dir: Some(data_dir.join("cache")),
            ..Default::default()
        })
        .await,
    );
    let adapters = Arc::new(AdapterManager::new(vec![Arc::new(StdioAdapter::new()) as Arc<dyn Adapter>]));
    let health_monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        metadata.clone(),
        adapters.clone(),
        HealthMonitorConfig::default(),
    ));
    let router = Arc::new(IntelligentRouter::new(registry.clone(), metadata.clone(), None));
    let plugins = Arc::new(PluginManager::new(data_dir.join("plugins")));

    let facade = RouterFacade::new(registry, metadata, cache, adapters, health_monitor, router, plugins);

    for (id, server) in &config.servers {
        let spec = mcp_router::LaunchSpec {
            kind: server.transport_kind,
            command: server.command.clone(),
            args: server.args.clone(),
            env: server.env.clone(),
            url: server.url.clone(),
        };
        facade
            .register_server(
                id,
                spec,
                server.name.clone(),
                server.description.clone(),
                server.capabilities.clone(),
                server.tags.clone(),
            )
            .await
            .with_context(|| format!("failed to register configured server '{id}'"))?;
    }

    match cli.command {
        Commands::Route { query } => {
            let decision = facade.route(&query).await?;
            print_json(&serde_json::json!({
                "servers": decision.servers,
                "strategy": decision.strategy,
                "confidence": decision.analysis.confidence,
                "required_capabilities": decision.analysis.required_capabilities,
            }));
        }
        Commands::Register {
            id,
            command,
            args,
            capabilities,
            tags,
            description,
        } => {
            let spec = mcp_router::LaunchSpec {
                kind: mcp_router::TransportKind::Stdio,
                command: Some(command),
                args,
                env: Default::default(),
                url: None,
            };
            facade
                .register_server(&id, spec, id.clone(), description, capabilities, tags)
                .await?;
            println!("registered '{id}'");
        }
        Commands::Unregister { id } => {
            let removed = facade.unregister_server(&id).await?;
            println!("{}", if removed { "unregistered" } else { "not found" });
        }
        Commands::Execute {
            server_id,
            tool_name,
            args,
            no_cache,
        } => {
            let args: serde_json::Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = facade.execute_tool(&server_id, &tool_name, args, no_cache).await?;
            print_json(&result);
        }
        Commands::Health { server_id } => match server_id {
            Some(id) => match facade.get_server_health(&id).await {
                Some(snapshot) => print_json(&serde_json::json!({
                    "status": snapshot.status.as_str(),
                    "consecutive_errors": snapshot.consecutive_errors,
                    "ewma_response_time": snapshot.ewma_response_time,
                })),
                None => println!("unknown server '{id}'"),
            },
            None => {
                let all = facade.get_all_server_health().await;
                let map: serde_json::Map<String, serde_json::Value> = all
                    .into_iter()
                    .map(|(id, snapshot)| {
                        (
                            id,
                            serde_json::json!({
                                "status": snapshot.status.as_str(),
                                "consecutive_errors": snapshot.consecutive_errors,
                                "ewma_response_time": snapshot.ewma_response_time,
                            }),
                        )
                    })
                    .collect();
                print_json(&serde_json::Value::Object(map));
            }
        },
        Commands::Stats => {
            let stats = facade.get_cache_stats().await;
            print_json(&stats);
        }
        Commands::ClearCache => {
            facade.clear_cache().await;
            println!("cache cleared");
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("failed to serialize output: {e}"),
    }
}

fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let local = Path::new("config.json");
    if local.exists() {
        return local.to_path_buf();
    }
    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("mcp-router").join("config.json");
        if xdg.exists() {
            return xdg;
        }
    }
    local.to_path_buf()
}

fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcp-router")
    })
}

async fn load_config(path: &Path) -> Result<RouterConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config.json found, starting with an empty server set");
        return Ok(RouterConfig::default());
    }
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    RouterConfig::load_from_str(&contents).map_err(|e| anyhow::anyhow!("invalid config.json: {e}"))
}
