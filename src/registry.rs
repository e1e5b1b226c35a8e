//! Server Registry (C2): in-process, disk-backed index of known servers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::{HealthSnapshot, HealthStatus, LaunchSpec, Server};
use crate::error::{Result, RouterError};

#[derive(Debug, Clone)]
struct RegistryEntry {
    launch_spec: LaunchSpec,
    display_name: String,
    description: String,
    capabilities: HashSet<String>,
    tags: HashSet<String>,
    health: HealthSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedServer {
    launch_spec: LaunchSpec,
    display_name: String,
    description: String,
    tags: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRegistry {
    servers: HashMap<String, PersistedServer>,
    server_capabilities: HashMap<String, Vec<String>>,
    server_health: HashMap<String, HealthSnapshot>,
}

/// In-process authoritative map of `server_id -> (launch_spec, capabilities,
/// health)`, eagerly persisted to a JSON file after every mutation.
pub struct ServerRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    registry_file: PathBuf,
}

impl ServerRegistry {
    /// Load from `registry_file` if present, falling back to a `.bak` copy
    /// on a corrupt/partial read, else starting empty.
    pub async fn load(registry_file: PathBuf) -> Self {
        let persisted = Self::load_persisted(&registry_file).await;
        let mut entries = HashMap::new();
        for (id, server) in persisted.servers {
            let capabilities = persisted
                .server_capabilities
                .get(&id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect();
            let health = persisted
                .server_health
                .get(&id)
                .cloned()
                .unwrap_or_else(HealthSnapshot::unknown);
            entries.insert(
                id,
                RegistryEntry {
                    launch_spec: server.launch_spec,
                    display_name: server.display_name,
                    description: server.description,
                    capabilities,
                    tags: server.tags.into_iter().collect(),
                    health,
                },
            );
        }
        Self {
            entries: RwLock::new(entries),
            registry_file,
        }
    }

    async fn load_persisted(path: &Path) -> PersistedRegistry {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(parsed) => return parsed,
                Err(e) => warn!(error = %e, "corrupt registry file, trying .bak"),
            },
            Err(_) => return PersistedRegistry::default(),
        }
        let bak = path.with_extension("json.bak");
        match tokio::fs::read_to_string(&bak).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt .bak registry file, starting empty");
                PersistedRegistry::default()
            }),
            Err(_) => {
                warn!("no .bak registry file found, starting empty");
                PersistedRegistry::default()
            }
        }
    }

    /// Serialize the current state to a temp file, then rename over the
    /// target. Readers never observe a torn write.
    async fn persist(&self) -> Result<()> {
        let entries = self.entries.read().await;
        let mut persisted = PersistedRegistry::default();
        for (id, entry) in entries.iter() {
            persisted.servers.insert(
                id.clone(),
                PersistedServer {
                    launch_spec: entry.launch_spec.clone(),
                    display_name: entry.display_name.clone(),
                    description: entry.description.clone(),
                    tags: entry.tags.iter().cloned().collect(),
                },
            );
            persisted
                .server_capabilities
                .insert(id.clone(), entry.capabilities.iter().cloned().collect());
            persisted.server_health.insert(id.clone(), entry.health.clone());
        }
        drop(entries);

        let json = serde_json::to_string_pretty(&persisted)
            .map_err(|e| RouterError::Registry(format!("failed to serialize registry: {e}")))?;

        if let Some(parent) = self.registry_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if self.registry_file.exists() {
            let bak = self.registry_file.with_extension("json.bak");
            let _ = tokio::fs::copy(&self.registry_file, &bak).await;
        }
        let tmp = self.registry_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| RouterError::Registry(format!("failed to write temp registry file: {e}")))?;
        tokio::fs::rename(&tmp, &self.registry_file)
            .await
            .map_err(|e| RouterError::Registry(format!("failed to rename registry file: {e}")))?;
        Ok(())
    }

    pub async fn register(
        &self,
        id: &str,
        launch_spec: LaunchSpec,
        display_name: String,
        description: String,
        capabilities: HashSet<String>,
        tags: HashSet<String>,
    ) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                id.to_string(),
                RegistryEntry {
                    launch_spec,
                    display_name,
                    description,
                    capabilities,
                    tags,
                    health: HealthSnapshot::unknown(),
                },
            );
        }
        self.persist().await
    }

    pub async fn unregister(&self, id: &str) -> Result<bool> {
        let found = {
            let mut entries = self.entries.write().await;
            entries.remove(id).is_some()
        };
        if found {
            self.persist().await?;
        }
        Ok(found)
    }

    pub async fn lookup(&self, id: &str) -> Option<Server> {
        self.entries.read().await.get(id).map(|e| to_server(id, e))
    }

    pub async fn list_all(&self) -> Vec<Server> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, e)| to_server(id, e))
            .collect()
    }

    pub async fn by_capability(&self, capability: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| {
                e.health.status == HealthStatus::Online && e.capabilities.contains(capability)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn by_capabilities(&self, caps: &[String], require_all: bool) -> Vec<String> {
        if caps.is_empty() {
            return self.online_ids().await;
        }
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| {
                if e.health.status != HealthStatus::Online {
                    return false;
                }
                if require_all {
                    caps.iter().all(|c| e.capabilities.contains(c))
                } else {
                    caps.iter().any(|c| e.capabilities.contains(c))
                }
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn update_capabilities(&self, id: &str, capabilities: HashSet<String>) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            match entries.get_mut(id) {
                Some(entry) => entry.capabilities = capabilities,
                None => {
                    return Err(RouterError::Validation(format!("unknown server id '{id}'")))
                }
            }
        }
        self.persist().await
    }

    /// Apply a health update per the Registry's algorithm (§4.2): only this
    /// function and [`crate::metadata::MetadataStore::update_health`] fold a
    /// probe measurement, and both defer to [`crate::ewma::fold`].
    pub async fn update_health(
        &self,
        id: &str,
        status: HealthStatus,
        response_time: Option<f64>,
    ) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            match entries.get_mut(id) {
                Some(entry) => entry.health.apply_probe(status, response_time, SystemTime::now()),
                None => {
                    return Err(RouterError::Validation(format!("unknown server id '{id}'")))
                }
            }
        }
        self.persist().await
    }

    pub async fn health(&self, id: &str) -> Option<HealthSnapshot> {
        self.entries.read().await.get(id).map(|e| e.health.clone())
    }

    pub async fn all_health(&self) -> HashMap<String, HealthSnapshot> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.health.clone()))
            .collect()
    }

    pub async fn online_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.health.status == HealthStatus::Online)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn offline_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.health.status != HealthStatus::Online)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn server_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn to_server(id: &str, entry: &RegistryEntry) -> Server {
    Server {
        id: id.to_string(),
        launch_spec: entry.launch_spec.clone(),
        capabilities: entry.capabilities.clone(),
        tags: entry.tags.clone(),
        display_name: entry.display_name.clone(),
        description: entry.description.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransportKind;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            kind: TransportKind::Stdio,
            command: Some("echo".to_string()),
            args: vec![],
            env: HashMap::new(),
            url: None,
        }
    }

    async fn registry() -> ServerRegistry {
        let dir = tempfile::tempdir().unwrap();
        ServerRegistry::load(dir.path().join("server_registry.json")).await
    }

    #[tokio::test]
    async fn register_starts_unknown() {
        let reg = registry().await;
        reg.register(
            "fs",
            spec(),
            "Filesystem".into(),
            "".into(),
            HashSet::new(),
            HashSet::new(),
        )
        .await
        .unwrap();
        let health = reg.health("fs").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn capability_queries_require_online() {
        let reg = registry().await;
        reg.register(
            "fs",
            spec(),
            "Filesystem".into(),
            "".into(),
            HashSet::from(["filesystem".to_string()]),
            HashSet::new(),
        )
        .await
        .unwrap();
        assert!(reg.by_capability("filesystem").await.is_empty());
        reg.update_health("fs", HealthStatus::Online, Some(0.1))
            .await
            .unwrap();
        assert_eq!(reg.by_capability("filesystem").await, vec!["fs".to_string()]);
    }

    #[tokio::test]
    async fn by_capabilities_and_then_or() {
        let reg = registry().await;
        reg.register(
            "a",
            spec(),
            "A".into(),
            "".into(),
            HashSet::from(["search".to_string()]),
            HashSet::new(),
        )
        .await
        .unwrap();
        reg.register(
            "b",
            spec(),
            "B".into(),
            "".into(),
            HashSet::from(["web_search".to_string()]),
            HashSet::new(),
        )
        .await
        .unwrap();
        reg.update_health("a", HealthStatus::Online, Some(0.1)).await.unwrap();
        reg.update_health("b", HealthStatus::Online, Some(0.1)).await.unwrap();

        let caps = vec!["search".to_string(), "web_search".to_string()];
        assert!(reg.by_capabilities(&caps, true).await.is_empty());
        let mut or_result = reg.by_capabilities(&caps, false).await;
        or_result.sort();
        assert_eq!(or_result, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn health_transition_sequence_matches_spec_scenario() {
        let reg = registry().await;
        reg.register(
            "fs",
            spec(),
            "Filesystem".into(),
            "".into(),
            HashSet::new(),
            HashSet::new(),
        )
        .await
        .unwrap();

        reg.update_health("fs", HealthStatus::Error, None).await.unwrap();
        assert_eq!(reg.health("fs").await.unwrap().consecutive_errors, 1);
        reg.update_health("fs", HealthStatus::Error, None).await.unwrap();
        assert_eq!(reg.health("fs").await.unwrap().consecutive_errors, 2);
        reg.update_health("fs", HealthStatus::Error, None).await.unwrap();
        assert_eq!(reg.health("fs").await.unwrap().consecutive_errors, 3);
        reg.update_health("fs", HealthStatus::Online, Some(0.05))
            .await
            .unwrap();
        let health = reg.health("fs").await.unwrap();
        assert_eq!(health.consecutive_errors, 0);
        assert_eq!(health.status, HealthStatus::Online);
        assert_eq!(health.ewma_response_time, Some(0.05));
    }

    #[tokio::test]
    async fn unregister_removes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_registry.json");
        let reg = ServerRegistry::load(path.clone()).await;
        reg.register(
            "fs",
            spec(),
            "Filesystem".into(),
            "".into(),
            HashSet::new(),
            HashSet::new(),
        )
        .await
        .unwrap();
        assert!(reg.unregister("fs").await.unwrap());
        assert!(reg.lookup("fs").await.is_none());

        let reloaded = ServerRegistry::load(path).await;
        assert_eq!(reloaded.server_count().await, 0);
    }

    #[tokio::test]
    async fn reload_restores_capabilities_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_registry.json");
        let reg = ServerRegistry::load(path.clone()).await;
        reg.register(
            "fs",
            spec(),
            "Filesystem".into(),
            "desc".into(),
            HashSet::from(["filesystem".to_string()]),
            HashSet::from(["local".to_string()]),
        )
        .await
        .unwrap();
        reg.update_health("fs", HealthStatus::Online, Some(0.2))
            .await
            .unwrap();

        let reloaded = ServerRegistry::load(path).await;
        let server = reloaded.lookup("fs").await.unwrap();
        assert!(server.capabilities.contains("filesystem"));
        assert_eq!(reloaded.health("fs").await.unwrap().status, HealthStatus::Online);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_bak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_registry.json");
        let reg = ServerRegistry::load(path.clone()).await;
        reg.register(
            "fs",
            spec(),
            "Filesystem".into(),
            "".into(),
            HashSet::new(),
            HashSet::new(),
        )
        .await
        .unwrap();
        // second mutation creates a .bak copy of the first write
        reg.update_health("fs", HealthStatus::Online, Some(0.1))
            .await
            .unwrap();
        // corrupt the live file
        tokio::fs::write(&path, b"not json").await.unwrap();

        let reloaded = ServerRegistry::load(path).await;
        assert_eq!(reloaded.server_count().await, 1);
    }
}
