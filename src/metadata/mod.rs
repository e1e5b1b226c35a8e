//! Metadata Store (C3): durable relational ground truth for servers, tools,
//! usage telemetry, and tags.

mod schema;

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::domain::HealthStatus;
use crate::error::{Result, RouterError};

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn map_sqlx(e: sqlx::Error) -> RouterError {
    RouterError::Registry(format!("metadata store error: {e}"))
}

/// Input to [`MetadataStore::upsert_server`] — everything needed to
/// (re)write a server's full row set in one transaction.
#[derive(Debug, Clone)]
pub struct ServerMetadataInput {
    pub name: String,
    pub description: String,
    pub transport_kind: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub capabilities: Vec<String>,
    pub tools: Vec<ToolInput>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolInput {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub transport_kind: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub capabilities: Vec<String>,
    pub tools: Vec<ToolInput>,
    pub tags: Vec<String>,
    pub health: Option<HealthRow>,
}

impl Serialize for ToolInput {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("ToolInput", 3)?;
        st.serialize_field("name", &self.name)?;
        st.serialize_field("description", &self.description)?;
        st.serialize_field("schema", &self.schema)?;
        st.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRow {
    pub status: String,
    pub last_check: Option<String>,
    pub last_successful_connection: Option<String>,
    pub error_count: i64,
    pub average_response_time: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStats {
    pub total_calls: i64,
    pub successful_calls: i64,
    pub average_duration: f64,
    pub by_tool: Vec<ToolUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub calls: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub server_count: i64,
}

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    /// Idempotent: inserts or updates the server row, capability rows (and
    /// their links), tool rows, and tag rows atomically. Seeds
    /// `server_health` with `status='unknown'` if absent — new servers start
    /// unknown, never online (§3 invariant).
    pub async fn upsert_server(&self, id: &str, metadata: &ServerMetadataInput) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let now = now_iso();
        let args_json = serde_json::to_string(&metadata.args).unwrap_or_else(|_| "[]".into());
        let env_json = serde_json::to_string(&metadata.env).unwrap_or_else(|_| "{}".into());

        sqlx::query(
            r#"INSERT INTO servers (id, name, description, transport_kind, command, args, env, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name=excluded.name, description=excluded.description,
                 transport_kind=excluded.transport_kind, command=excluded.command,
                 args=excluded.args, env=excluded.env, updated_at=excluded.updated_at"#,
        )
        .bind(id)
        .bind(&metadata.name)
        .bind(&metadata.description)
        .bind(&metadata.transport_kind)
        .bind(&metadata.command)
        .bind(&args_json)
        .bind(&env_json)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for cap in &metadata.capabilities {
            sqlx::query("INSERT OR IGNORE INTO capabilities (name, created_at) VALUES (?, ?)")
                .bind(cap)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            let cap_id: i64 = sqlx::query("SELECT id FROM capabilities WHERE name = ?")
                .bind(cap)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx)?
                .try_get("id")
                .map_err(map_sqlx)?;
            sqlx::query(
                "INSERT OR IGNORE INTO server_capabilities (server_id, capability_id) VALUES (?, ?)",
            )
            .bind(id)
            .bind(cap_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        for tool in &metadata.tools {
            let schema_json = serde_json::to_string(&tool.schema).unwrap_or_else(|_| "{}".into());
            sqlx::query(
                r#"INSERT INTO tools (server_id, name, description, schema, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT(server_id, name) DO UPDATE SET
                     description=excluded.description, schema=excluded.schema, updated_at=excluded.updated_at"#,
            )
            .bind(id)
            .bind(&tool.name)
            .bind(&tool.description)
            .bind(&schema_json)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        sqlx::query("DELETE FROM server_tags WHERE server_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        for tag in &metadata.tags {
            sqlx::query("INSERT OR IGNORE INTO server_tags (server_id, tag) VALUES (?, ?)")
                .bind(id)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }

        sqlx::query(
            "INSERT OR IGNORE INTO server_health (server_id, status, error_count, average_response_time) VALUES (?, 'unknown', 0, 0.0)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn read_server(&self, id: &str) -> Result<Option<ServerMetadata>> {
        let row = sqlx::query(
            "SELECT id, name, description, transport_kind, command, args, env FROM servers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let Some(row) = row else { return Ok(None) };

        let args: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("args").map_err(map_sqlx)?).unwrap_or_default();
        let env: HashMap<String, String> =
            serde_json::from_str(&row.try_get::<String, _>("env").map_err(map_sqlx)?).unwrap_or_default();

        let capabilities: Vec<String> = sqlx::query(
            r#"SELECT c.name FROM capabilities c
               JOIN server_capabilities sc ON sc.capability_id = c.id
               WHERE sc.server_id = ?"#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .into_iter()
        .map(|r| r.try_get::<String, _>("name").unwrap_or_default())
        .collect();

        let tools: Vec<ToolInput> =
            sqlx::query("SELECT name, description, schema FROM tools WHERE server_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?
                .into_iter()
                .map(|r| ToolInput {
                    name: r.try_get("name").unwrap_or_default(),
                    description: r.try_get("description").unwrap_or_default(),
                    schema: serde_json::from_str(&r.try_get::<String, _>("schema").unwrap_or_default())
                        .unwrap_or(serde_json::Value::Null),
                })
                .collect();

        let tags: Vec<String> = sqlx::query("SELECT tag FROM server_tags WHERE server_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .into_iter()
            .map(|r| r.try_get::<String, _>("tag").unwrap_or_default())
            .collect();

        let health = sqlx::query(
            "SELECT status, last_check, last_successful_connection, error_count, average_response_time FROM server_health WHERE server_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(|r| HealthRow {
            status: r.try_get("status").unwrap_or_default(),
            last_check: r.try_get("last_check").ok(),
            last_successful_connection: r.try_get("last_successful_connection").ok(),
            error_count: r.try_get("error_count").unwrap_or_default(),
            average_response_time: r.try_get("average_response_time").unwrap_or_default(),
        });

        Ok(Some(ServerMetadata {
            id: id.to_string(),
            name: row.try_get("name").unwrap_or_default(),
            description: row.try_get("description").unwrap_or_default(),
            transport_kind: row.try_get("transport_kind").unwrap_or_default(),
            command: row.try_get("command").ok(),
            args,
            env,
            capabilities,
            tools,
            tags,
            health,
        }))
    }

    /// Tokenize `task` (tokens of length > 3), match against capability
    /// names and tool descriptions, and return distinct server ids whose
    /// health is `Online` or unrecorded (§4.3).
    pub async fn find_servers_for_task(&self, task: &str) -> Result<Vec<String>> {
        let tokens: Vec<String> = task
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.len() > 3)
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let cap_clauses: Vec<String> = tokens.iter().map(|_| "c.name LIKE ?".to_string()).collect();
        let tool_clauses: Vec<String> = tokens
            .iter()
            .map(|_| "t.description LIKE ?".to_string())
            .collect();
        let query = format!(
            r#"SELECT DISTINCT s.id FROM servers s
               LEFT JOIN server_capabilities sc ON sc.server_id = s.id
               LEFT JOIN capabilities c ON c.id = sc.capability_id
               LEFT JOIN tools t ON t.server_id = s.id
               LEFT JOIN server_health sh ON sh.server_id = s.id
               WHERE (sh.status = 'online' OR sh.status IS NULL) AND ({} OR {})"#,
            cap_clauses.join(" OR "),
            tool_clauses.join(" OR "),
        );
        let mut q = sqlx::query(&query);
        for token in &tokens {
            q = q.bind(format!("%{token}%"));
        }
        for token in &tokens {
            q = q.bind(format!("%{token}%"));
        }
        let rows = q.fetch_all(&self.pool).await.map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("id").unwrap_or_default())
            .collect())
    }

    /// Fold a probe measurement using the same EWMA helper as the Registry
    /// (§9: the two implementations must never drift).
    pub async fn update_health(
        &self,
        id: &str,
        status: HealthStatus,
        response_time: Option<f64>,
    ) -> Result<()> {
        let now = now_iso();
        let existing = sqlx::query(
            "SELECT error_count, average_response_time, last_successful_connection FROM server_health WHERE server_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let (mut error_count, prev_avg, mut last_success): (i64, f64, Option<String>) = match existing {
            Some(row) => (
                row.try_get("error_count").unwrap_or(0),
                row.try_get("average_response_time").unwrap_or(0.0),
                row.try_get("last_successful_connection").ok(),
            ),
            None => (0, 0.0, None),
        };

        let new_avg = if status == HealthStatus::Online {
            error_count = 0;
            last_success = Some(now.clone());
            match response_time {
                Some(t) => crate::ewma::fold(if prev_avg == 0.0 { None } else { Some(prev_avg) }, t),
                None => prev_avg,
            }
        } else {
            error_count += 1;
            prev_avg
        };

        sqlx::query(
            r#"INSERT INTO server_health (server_id, status, last_check, last_successful_connection, error_count, average_response_time)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(server_id) DO UPDATE SET
                 status=excluded.status, last_check=excluded.last_check,
                 last_successful_connection=excluded.last_successful_connection,
                 error_count=excluded.error_count, average_response_time=excluded.average_response_time"#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&now)
        .bind(&last_success)
        .bind(error_count)
        .bind(new_avg)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn append_usage(
        &self,
        server_id: &str,
        tool_name: &str,
        execution_time: f64,
        success: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO server_usage (server_id, tool_name, execution_time, success, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(server_id)
        .bind(tool_name)
        .bind(execution_time)
        .bind(success)
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn usage_stats(&self, server_id: &str, window_days: i64) -> Result<UsageStats> {
        let cutoff = (Utc::now() - chrono::Duration::days(window_days)).to_rfc3339();
        let row = sqlx::query(
            r#"SELECT COUNT(*) as total, SUM(CASE WHEN success THEN 1 ELSE 0 END) as successful,
                      COALESCE(AVG(execution_time), 0.0) as avg_duration
               FROM server_usage WHERE server_id = ? AND timestamp >= ?"#,
        )
        .bind(server_id)
        .bind(&cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let by_tool = sqlx::query(
            r#"SELECT tool_name, COUNT(*) as calls FROM server_usage
               WHERE server_id = ? AND timestamp >= ?
               GROUP BY tool_name ORDER BY calls DESC"#,
        )
        .bind(server_id)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .into_iter()
        .map(|r| ToolUsage {
            tool_name: r.try_get("tool_name").unwrap_or_default(),
            calls: r.try_get("calls").unwrap_or(0),
        })
        .collect();

        Ok(UsageStats {
            total_calls: row.try_get("total").unwrap_or(0),
            successful_calls: row.try_get::<Option<i64>, _>("successful").ok().flatten().unwrap_or(0),
            average_duration: row.try_get("avg_duration").unwrap_or(0.0),
            by_tool,
        })
    }

    pub async fn by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT server_id FROM server_tags WHERE tag = ?")
            .bind(tag)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("server_id").unwrap_or_default())
            .collect())
    }

    pub async fn by_capability(&self, capability: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT sc.server_id FROM server_capabilities sc
               JOIN capabilities c ON c.id = sc.capability_id
               WHERE c.name = ?"#,
        )
        .bind(capability)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("server_id").unwrap_or_default())
            .collect())
    }

    pub async fn all_capabilities(&self) -> Result<Vec<NamedCount>> {
        let rows = sqlx::query(
            r#"SELECT c.name as name,
                      (SELECT COUNT(*) FROM server_capabilities sc WHERE sc.capability_id = c.id) as server_count
               FROM capabilities c
               ORDER BY server_count DESC, c.name ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|r| NamedCount {
                name: r.try_get("name").unwrap_or_default(),
                server_count: r.try_get("server_count").unwrap_or(0),
            })
            .collect())
    }

    pub async fn all_tags(&self) -> Result<Vec<NamedCount>> {
        let rows = sqlx::query(
            r#"SELECT tag as name, COUNT(*) as server_count FROM server_tags
               GROUP BY tag ORDER BY server_count DESC, tag ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|r| NamedCount {
                name: r.try_get("name").unwrap_or_default(),
                server_count: r.try_get("server_count").unwrap_or(0),
            })
            .collect())
    }

    /// Relies on `ON DELETE CASCADE` to remove every dependent row.
    pub async fn delete_server(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> MetadataStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.db");
        std::mem::forget(dir);
        MetadataStore::connect(&path).await.unwrap()
    }

    fn input() -> ServerMetadataInput {
        ServerMetadataInput {
            name: "Filesystem".into(),
            description: "".into(),
            transport_kind: "stdio".into(),
            command: Some("echo".into()),
            args: vec![],
            env: HashMap::new(),
            capabilities: vec!["filesystem".into(), "file_read".into()],
            tools: vec![ToolInput {
                name: "read".into(),
                description: "reads a file path".into(),
                schema: serde_json::json!({"type": "object"}),
            }],
            tags: vec!["local".into()],
        }
    }

    #[tokio::test]
    async fn upsert_then_read_round_trips() {
        let store = store().await;
        store.upsert_server("fs", &input()).await.unwrap();
        let meta = store.read_server("fs").await.unwrap().unwrap();
        assert_eq!(meta.capabilities.len(), 2);
        assert_eq!(meta.tools.len(), 1);
        assert_eq!(meta.tags, vec!["local".to_string()]);
        assert_eq!(meta.health.unwrap().status, "unknown");
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = store().await;
        store.upsert_server("fs", &input()).await.unwrap();
        store.upsert_server("fs", &input()).await.unwrap();
        let meta = store.read_server("fs").await.unwrap().unwrap();
        assert_eq!(meta.capabilities.len(), 2);
    }

    #[tokio::test]
    async fn find_servers_for_task_matches_capability_tokens() {
        let store = store().await;
        store.upsert_server("fs", &input()).await.unwrap();
        store.update_health("fs", HealthStatus::Online, Some(0.1)).await.unwrap();
        let found = store.find_servers_for_task("please read a file").await.unwrap();
        assert_eq!(found, vec!["fs".to_string()]);
    }

    #[tokio::test]
    async fn cascade_delete_removes_dependent_rows() {
        let store = store().await;
        store.upsert_server("fs", &input()).await.unwrap();
        store.append_usage("fs", "read", 0.01, true).await.unwrap();
        assert!(store.delete_server("fs").await.unwrap());
        assert!(store.read_server("fs").await.unwrap().is_none());
        let stats = store.usage_stats("fs", 7).await.unwrap();
        assert_eq!(stats.total_calls, 0);
    }

    #[tokio::test]
    async fn usage_stats_breaks_down_by_tool() {
        let store = store().await;
        store.upsert_server("fs", &input()).await.unwrap();
        store.append_usage("fs", "read", 0.01, true).await.unwrap();
        store.append_usage("fs", "read", 0.02, false).await.unwrap();
        store.append_usage("fs", "write", 0.03, true).await.unwrap();
        let stats = store.usage_stats("fs", 7).await.unwrap();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.successful_calls, 2);
        assert_eq!(stats.by_tool[0].tool_name, "read");
        assert_eq!(stats.by_tool[0].calls, 2);
    }

    #[tokio::test]
    async fn update_health_ewma_matches_registry_formula() {
        let store = store().await;
        store.upsert_server("fs", &input()).await.unwrap();
        store.update_health("fs", HealthStatus::Online, Some(1.0)).await.unwrap();
        store.update_health("fs", HealthStatus::Online, Some(2.0)).await.unwrap();
        let meta = store.read_server("fs").await.unwrap().unwrap();
        let expected = crate::ewma::fold(Some(1.0), 2.0);
        assert!((meta.health.unwrap().average_response_time - expected).abs() < 1e-9);
    }
}
