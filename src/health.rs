//! Health Monitor (C5): periodically probes every registered server and
//! keeps the Registry and Metadata Store's health snapshots in sync.
//!
//! Grounded in the teacher's periodic-task shape (`cache::spawn_sweeps`,
//! `server::stdio::run_stdio_server`'s `tokio::select!` over a timer and a
//! `CancellationToken`), but the state model itself follows §4.2/§4.5:
//! four-state `HealthStatus` with EWMA response time, not the teacher's own
//! sliding-window `ErrorRateTracker`. Unlike the original implementation's
//! `_simulate_health_check`, failures are never randomly injected — a probe
//! result always reflects what the adapter actually observed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterManager;
use crate::domain::HealthStatus;
use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::registry::ServerRegistry;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often the background sweep probes every registered server.
    pub interval: Duration,
    /// Per-probe timeout; an expired probe counts as unhealthy.
    pub probe_timeout: Duration,
    /// Upper bound on probes running concurrently. Defaults to
    /// `num_cpus::get() * 4`, matching the teacher's CPU-scaled worker
    /// ceilings elsewhere in the pack.
    pub max_concurrency: Option<usize>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            max_concurrency: None,
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    metadata: Option<Arc<MetadataStore>>,
    adapters: Arc<AdapterManager>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        metadata: Option<Arc<MetadataStore>>,
        adapters: Arc<AdapterManager>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            metadata,
            adapters,
            config,
        }
    }

    fn concurrency_limit(&self) -> usize {
        self.config.max_concurrency.unwrap_or_else(|| num_cpus::get() * 4).max(1)
    }

    /// Probes a single server on demand (the ad-hoc `check` operation) and
    /// writes the result to both the Registry and the Metadata Store.
    pub async fn check(&self, server_id: &str) -> Result<HealthStatus> {
        let server = self
            .registry
            .lookup(server_id)
            .await
            .ok_or_else(|| crate::error::RouterError::Validation(format!("unknown server '{server_id}'")))?;
        let (healthy, elapsed) = tokio::time::timeout(
            self.config.probe_timeout,
            self.adapters.probe_health(server_id, &server.launch_spec),
        )
        .await
        .unwrap_or((false, self.config.probe_timeout.as_secs_f64()));

        let status = if healthy { HealthStatus::Online } else { HealthStatus::Error };
        self.record(server_id, status, elapsed).await;
        Ok(status)
    }

    async fn record(&self, server_id: &str, status: HealthStatus, response_time: f64) {
        if let Err(e) = self.registry.update_health(server_id, status, Some(response_time)).await {
            tracing::warn!(server = %server_id, error = %e, "failed to record health in registry");
        }
        if let Some(metadata) = &self.metadata {
            if let Err(e) = metadata.update_health(server_id, status, Some(response_time)).await {
                tracing::warn!(server = %server_id, error = %e, "failed to record health in metadata store");
            }
        }
    }

    async fn sweep(&self) {
        let servers = self.registry.list_all().await;
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit()));
        let mut tasks = Vec::with_capacity(servers.len());

        for server in servers {
            let semaphore = semaphore.clone();
            let adapters = self.adapters.clone();
            let timeout = self.config.probe_timeout;
            tasks.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let (healthy, elapsed) = tokio::time::timeout(timeout, adapters.probe_health(&server.id, &server.launch_spec))
                    .await
                    .unwrap_or((false, timeout.as_secs_f64()));
                (server.id, healthy, elapsed)
            });
        }

        let results = futures::future::join_all(tasks).await;
        for (server_id, healthy, elapsed) in results {
            let status = if healthy { HealthStatus::Online } else { HealthStatus::Error };
            self.record(&server_id, status, elapsed).await;
        }
    }

    /// Spawns the periodic sweep loop. Runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("health monitor sweep loop cancelled");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, NormalizedTool};
    use crate::domain::{LaunchSpec, TransportKind};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ToggleAdapter {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Adapter for ToggleAdapter {
        fn kind(&self) -> &'static str {
            "stdio"
        }
        fn name(&self) -> &'static str {
            "toggle"
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
            Ok(Value::Null)
        }
        async fn list_tools(&self, _server_id: &str) -> Result<Vec<NormalizedTool>> {
            Ok(vec![])
        }
        async fn probe_health(&self, _server_id: &str, _spec: &LaunchSpec) -> (bool, f64) {
            (self.healthy.load(Ordering::SeqCst), 0.02)
        }
    }

    async fn fixture(healthy: bool) -> (tempfile::TempDir, HealthMonitor) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::load(dir.path().join("registry.json")).await);
        registry
            .register(
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
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap();

        let adapters = Arc::new(AdapterManager::new(vec![Arc::new(ToggleAdapter {
            healthy: AtomicBool::new(healthy),
        })]));
        let monitor = HealthMonitor::new(registry, None, adapters, HealthMonitorConfig::default());
        (dir, monitor)
    }

    #[tokio::test]
    async fn check_marks_online_when_adapter_reports_healthy() {
        let (_dir, monitor) = fixture(true).await;
        let status = monitor.check("fs").await.unwrap();
        assert_eq!(status, HealthStatus::Online);
    }

    #[tokio::test]
    async fn check_marks_error_when_adapter_reports_unhealthy() {
        let (_dir, monitor) = fixture(false).await;
        let status = monitor.check("fs").await.unwrap();
        assert_eq!(status, HealthStatus::Error);
    }

    #[tokio::test]
    async fn sweep_updates_registry_for_all_servers() {
        let (_dir, monitor) = fixture(true).await;
        monitor.sweep().await;
        let snapshot = monitor.registry.health("fs").await.unwrap();
        assert_eq!(snapshot.status, HealthStatus::Online);
        assert_eq!(snapshot.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn check_unknown_server_errors() {
        let (_dir, monitor) = fixture(true).await;
        assert!(monitor.check("ghost").await.is_err());
    }
}
