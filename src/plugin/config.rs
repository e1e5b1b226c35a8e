//! Per-plugin JSON config store: `{plugin_name}.json` under a directory,
//! mirroring the disk cache tier's best-effort I/O discipline (§4.1) — a
//! plugin that can't read or write its config degrades to an empty config
//! rather than taking the router down.

use std::path::PathBuf;

use serde_json::Value;

pub struct PluginConfigStore {
    dir: PathBuf,
}

impl PluginConfigStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, plugin_name: &str) -> PathBuf {
        self.dir.join(format!("{plugin_name}.json"))
    }

    pub async fn get(&self, plugin_name: &str) -> Value {
        match tokio::fs::read_to_string(self.path_for(plugin_name)).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|_| Value::Object(Default::default())),
            Err(_) => Value::Object(Default::default()),
        }
    }

    pub async fn set(&self, plugin_name: &str, value: &Value) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::warn!(plugin = %plugin_name, error = %e, "failed to create plugin config directory");
            return;
        }
        let serialized = match serde_json::to_string_pretty(value) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(plugin = %plugin_name, error = %e, "failed to serialize plugin config");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(self.path_for(plugin_name), serialized).await {
            tracing::warn!(plugin = %plugin_name, error = %e, "failed to persist plugin config");
        }
    }

    pub async fn delete(&self, plugin_name: &str) -> bool {
        tokio::fs::remove_file(self.path_for(plugin_name)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_config_returns_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::new(dir.path().to_path_buf());
        assert_eq!(store.get("ghost").await, json!({}));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::new(dir.path().to_path_buf());
        store.set("keyword_routing", &json!({"boost": 1.5})).await;
        assert_eq!(store.get("keyword_routing").await, json!({"boost": 1.5}));
    }

    #[tokio::test]
    async fn delete_removes_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::new(dir.path().to_path_buf());
        store.set("p", &json!({"a": 1})).await;
        assert!(store.delete("p").await);
        assert_eq!(store.get("p").await, json!({}));
    }
}
