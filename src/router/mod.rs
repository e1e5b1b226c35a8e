//! Intelligent Router (C6): analyzes a query, then selects the servers that
//! should handle it.
//!
//! Grounded in `intelligent_router.py::select_servers`'s fallback chain:
//! try an AND match over required capabilities, then an OR match, then a
//! metadata-driven task search, then every online server. The original's
//! `get_confidence_score` is a hardcoded `0.7` stub disconnected from the
//! actual analysis — that defect isn't reproduced here: confidence is
//! threaded straight through from [`AnalysisOutcome`].

pub mod analysis;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::plugin::RoutingStrategyPlugin;
use crate::registry::ServerRegistry;
use analysis::{keyword_analysis, AnalysisOutcome, LlmAnalyzer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub servers: Vec<String>,
    pub analysis: AnalysisOutcome,
    pub strategy: String,
}

pub struct IntelligentRouter {
    registry: Arc<ServerRegistry>,
    metadata: Option<Arc<MetadataStore>>,
    analyzer: Option<Arc<dyn LlmAnalyzer>>,
    strategies: RwLock<Vec<Arc<dyn RoutingStrategyPlugin>>>,
}

impl IntelligentRouter {
    pub fn new(registry: Arc<ServerRegistry>, metadata: Option<Arc<MetadataStore>>, analyzer: Option<Arc<dyn LlmAnalyzer>>) -> Self {
        Self {
            registry,
            metadata,
            analyzer,
            strategies: RwLock::new(Vec::new()),
        }
    }

    pub async fn register_strategy(&self, strategy: Arc<dyn RoutingStrategyPlugin>) {
        self.strategies.write().await.push(strategy);
    }

    async fn available_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .flat_map(|s| s.capabilities.into_iter())
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// Analyze a query: try the injected LLM analyzer, fall back to keyword
    /// matching on any error or when no analyzer is configured (§4.6).
    pub async fn analyze_query(&self, query: &str) -> AnalysisOutcome {
        let capabilities = self.available_capabilities().await;

        if let Some(analyzer) = &self.analyzer {
            match analyzer.analyze(query, &capabilities).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    tracing::warn!(analyzer = analyzer.name(), error = %e, "LLM analysis failed, falling back to keyword match");
                }
            }
        }

        keyword_analysis(query, &capabilities)
    }

    /// Select servers for a query (§4.6 / §4.8). Routing strategy plugins
    /// get first refusal: the highest-confidence plugin response wins,
    /// ties broken by plugin name ascending. If no plugin claims the query,
    /// falls back to capability AND, then OR, then metadata task search,
    /// then every online server.
    pub async fn select_servers(&self, query: &str) -> Result<RoutingDecision> {
        let analysis = self.analyze_query(query).await;
        let online = self.registry.online_ids().await;

        let strategies = self.strategies.read().await;
        let mut best: Option<(f64, String, Vec<String>)> = None;
        for strategy in strategies.iter() {
            if let Some(servers) = strategy.select_servers(query, &analysis, &online).await {
                let confidence = strategy.confidence_score();
                let name = strategy.name().to_string();
                let replace = match &best {
                    None => true,
                    Some((best_confidence, best_name, _)) => {
                        confidence > *best_confidence || (confidence == *best_confidence && name < *best_name)
                    }
                };
                if replace {
                    best = Some((confidence, name, servers));
                }
            }
        }
        drop(strategies);

        if let Some((_, strategy_name, servers)) = best {
            return Ok(RoutingDecision {
                servers,
                analysis,
                strategy: strategy_name,
            });
        }

        let mut servers = if !analysis.required_capabilities.is_empty() {
            let mut candidates = self.registry.by_capabilities(&analysis.required_capabilities, true).await;
            if candidates.is_empty() {
                candidates = self.registry.by_capabilities(&analysis.required_capabilities, false).await;
            }
            candidates
        } else {
            Vec::new()
        };

        if servers.is_empty() {
            if let Some(metadata) = &self.metadata {
                servers = metadata.find_servers_for_task(query).await.unwrap_or_default();
            }
        }

        if servers.is_empty() {
            servers = online;
        }

        Ok(RoutingDecision {
            servers,
            analysis,
            strategy: "builtin".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LaunchSpec, TransportKind};
    use std::collections::HashSet;

    async fn registry_with(servers: &[(&str, &[&str])]) -> (tempfile::TempDir, Arc<ServerRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::load(dir.path().join("registry.json")).await);
        for (id, caps) in servers {
            registry
                .register(
                    id,
                    LaunchSpec {
                        kind: TransportKind::Stdio,
                        command: Some("echo".into()),
                        args: vec![],
                        env: Default::default(),
                        url: None,
                    },
                    id.to_string(),
                    "".into(),
                    caps.iter().map(|c| c.to_string()).collect::<HashSet<_>>(),
                    HashSet::new(),
                )
                .await
                .unwrap();
            registry.update_health(id, crate::domain::HealthStatus::Online, Some(0.01)).await.unwrap();
        }
        (dir, registry)
    }

    #[tokio::test]
    async fn falls_back_to_all_online_when_nothing_matches() {
        let (_dir, registry) = registry_with(&[("fs", &["filesystem"])]).await;
        let router = IntelligentRouter::new(registry, None, None);
        let decision = router.select_servers("play some music please").await.unwrap();
        assert_eq!(decision.servers, vec!["fs".to_string()]);
    }

    #[tokio::test]
    async fn and_match_wins_over_or_when_available() {
        let (_dir, registry) = registry_with(&[
            ("both", &["filesystem", "database"]),
            ("fs_only", &["filesystem"]),
        ])
        .await;
        let router = IntelligentRouter::new(registry, None, None);
        let decision = router.select_servers("filesystem database query please").await.unwrap();
        assert_eq!(decision.servers, vec!["both".to_string()]);
    }

    struct AlwaysPickFirst;

    #[async_trait::async_trait]
    impl crate::plugin::Plugin for AlwaysPickFirst {
        async fn initialize(&self) -> Result<bool> {
            Ok(true)
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "always-first"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn description(&self) -> &str {
            "always routes to the first available server"
        }
    }

    #[async_trait::async_trait]
    impl RoutingStrategyPlugin for AlwaysPickFirst {
        async fn select_servers(&self, _query: &str, _analysis: &AnalysisOutcome, available: &[String]) -> Option<Vec<String>> {
            available.first().cloned().map(|s| vec![s])
        }
        fn confidence_score(&self) -> f64 {
            0.9
        }
    }

    #[tokio::test]
    async fn routing_strategy_plugin_overrides_default_selection() {
        let (_dir, registry) = registry_with(&[("a", &["filesystem"]), ("b", &["database"])]).await;
        let router = IntelligentRouter::new(registry, None, None);
        router.register_strategy(Arc::new(AlwaysPickFirst)).await;
        let decision = router.select_servers("irrelevant query").await.unwrap();
        assert_eq!(decision.strategy, "always-first");
        assert_eq!(decision.servers.len(), 1);
    }
}
