//! Stdio transport adapter: launches an MCP server as a child process and
//! speaks line-delimited JSON-RPC over its stdin/stdout.
//!
//! Grounded in the teacher's subprocess transport: stdout is piped through a
//! filter task that silently discards non-JSON lines before rmcp ever sees
//! them, and stderr is drained to a bounded ring buffer for diagnostics.
//!
//! Unlike the teacher's own supervised server loop, `connect` here is a
//! single spawn-and-handshake attempt with no internal restart/backoff: the
//! Health Monitor (C5) owns retry cadence by re-probing and re-connecting on
//! its own schedule, and the façade (C8) owns what "degraded" means for a
//! server whose connect failed. Folding a private backoff loop into the
//! adapter would duplicate that state machine inside a component the
//! contract describes as stateless per call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::{Peer, RoleClient, ServiceExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, NormalizedTool};
use crate::domain::LaunchSpec;
use crate::error::{Result, RouterError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const STDERR_BUFFER_LINES: usize = 100;

struct StderrBuffer {
    lines: std::collections::VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

struct Connection {
    peer: Peer<RoleClient>,
    _running: RunningService<RoleClient, ()>,
    _child: Child,
    _stderr: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
}

fn spawn_child(spec: &LaunchSpec, server_id: &str) -> Result<Child> {
    let command = spec
        .command
        .as_ref()
        .ok_or_else(|| RouterError::Adapter(server_id.to_string(), "stdio transport requires 'command'".into()))?;

    let mut cmd = Command::new(command);
    if !spec.args.is_empty() {
        cmd.args(&spec.args);
    }
    if !spec.env.is_empty() {
        cmd.envs(&spec.env);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    cmd.spawn()
        .map_err(|e| RouterError::Connect(server_id.to_string(), e.to_string()))
}

/// Filters non-JSON lines out of the child's stdout before handing the
/// stream to rmcp as a transport. Noisy servers routinely print banners or
/// log lines on stdout; forwarding them verbatim would desync the framer.
fn start_stdout_filter(
    child_stdout: tokio::process::ChildStdout,
    server_id: String,
    cancel: CancellationToken,
) -> tokio::io::ReadHalf<tokio::io::DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (reader, _unused_writer) = tokio::io::split(client_side);
    let (_unused_reader, mut writer) = tokio::io::split(server_side);

    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if serde_json::from_str::<Value>(&line).is_ok() {
                                let framed = format!("{line}\n");
                                if writer.write_all(framed.as_bytes()).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::debug!(server = %server_id, %line, "discarding non-JSON stdout line");
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });

    reader
}

fn start_stderr_drain(
    child_stderr: tokio::process::ChildStderr,
    server_id: String,
    buffer: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %server_id, %line, "server stderr");
                            buffer.lock().await.push(line);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

async fn handshake(spec: &LaunchSpec, server_id: &str) -> Result<Connection> {
    let mut child = spawn_child(spec, server_id)?;
    let cancel = CancellationToken::new();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RouterError::Connect(server_id.to_string(), "failed to open stdin pipe".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RouterError::Connect(server_id.to_string(), "failed to open stdout pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RouterError::Connect(server_id.to_string(), "failed to open stderr pipe".into()))?;

    let stderr_buf = Arc::new(Mutex::new(StderrBuffer::new(STDERR_BUFFER_LINES)));
    let reader = start_stdout_filter(stdout, server_id.to_string(), cancel.clone());
    start_stderr_drain(stderr, server_id.to_string(), stderr_buf.clone(), cancel.clone());

    let transport = (reader, stdin);
    let running = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ().serve_with_ct(transport, cancel.clone())).await {
        Err(_) => {
            let _ = child.kill().await;
            return Err(RouterError::Connect(server_id.to_string(), "MCP handshake timed out".into()));
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(RouterError::Connect(server_id.to_string(), e.to_string()));
        }
        Ok(Ok(running)) => running,
    };

    let peer = running.peer().clone();

    Ok(Connection {
        peer,
        _running: running,
        _child: child,
        _stderr: stderr_buf,
        cancel,
    })
}

/// Transport adapter for MCP servers launched as a local child process.
pub struct StdioAdapter {
    connections: RwLock<HashMap<String, Connection>>,
    tool_cache: RwLock<HashMap<String, Vec<NormalizedTool>>>,
}

impl StdioAdapter {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            tool_cache: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for StdioAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for StdioAdapter {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    fn name(&self) -> &'static str {
        "stdio-adapter"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn can_handle(&self, spec: &LaunchSpec) -> bool {
        matches!(spec.kind, crate::domain::TransportKind::Stdio) && spec.command.is_some()
    }

    async fn connect(&self, server_id: &str, spec: &LaunchSpec) -> Result<()> {
        let connection = handshake(spec, server_id).await?;
        self.connections.write().await.insert(server_id.to_string(), connection);
        Ok(())
    }

    async fn disconnect(&self, server_id: &str) -> bool {
        self.tool_cache.write().await.remove(server_id);
        match self.connections.write().await.remove(server_id) {
            Some(conn) => {
                conn.cancel.cancel();
                let mut child = conn._child;
                let _ = child.kill().await;
                true
            }
            None => false,
        }
    }

    async fn execute_tool(&self, server_id: &str, tool_name: &str, args: Value) -> Result<Value> {
        let peer = {
            let guard = self.connections.read().await;
            let conn = guard
                .get(server_id)
                .ok_or_else(|| RouterError::Connect(server_id.to_string(), "not connected".into()))?;
            conn.peer.clone()
        };

        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(RouterError::Validation(format!(
                    "tool arguments must be a JSON object, got {other}"
                )));
            }
        };

        let params = CallToolRequestParam {
            meta: None,
            name: tool_name.to_string().into(),
            arguments,
            task: None,
        };

        let result = tokio::time::timeout(CALL_TIMEOUT, peer.call_tool(params)).await;
        match result {
            Err(_) => Err(RouterError::Tool(
                server_id.to_string(),
                tool_name.to_string(),
                "tool call timed out".into(),
            )),
            Ok(Err(e)) => Err(RouterError::Tool(server_id.to_string(), tool_name.to_string(), e.to_string())),
            Ok(Ok(result)) => serde_json::to_value(result)
                .map_err(|e| RouterError::Tool(server_id.to_string(), tool_name.to_string(), e.to_string())),
        }
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<NormalizedTool>> {
        if let Some(tools) = self.tool_cache.read().await.get(server_id) {
            return Ok(tools.clone());
        }

        let peer = {
            let guard = self.connections.read().await;
            let conn = guard
                .get(server_id)
                .ok_or_else(|| RouterError::Connect(server_id.to_string(), "not connected".into()))?;
            conn.peer.clone()
        };

        let tools = peer
            .list_all_tools()
            .await
            .map_err(|e| RouterError::Adapter(server_id.to_string(), e.to_string()))?;

        let normalized: Vec<NormalizedTool> = tools
            .into_iter()
            .map(|t| NormalizedTool {
                name: t.name.to_string(),
                description: t.description.clone().unwrap_or_default().to_string(),
                schema: serde_json::to_value(&*t.input_schema).unwrap_or(Value::Null),
            })
            .collect();

        self.tool_cache.write().await.insert(server_id.to_string(), normalized.clone());
        Ok(normalized)
    }

    async fn probe_health(&self, server_id: &str, spec: &LaunchSpec) -> (bool, f64) {
        let start = Instant::now();

        let existing_peer = {
            let guard = self.connections.read().await;
            guard.get(server_id).map(|c| c.peer.clone())
        };

        if let Some(peer) = existing_peer {
            let ok = tokio::time::timeout(Duration::from_secs(10), peer.list_all_tools())
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            return (ok, start.elapsed().as_secs_f64());
        }

        // Not currently connected: a transient connect/list/disconnect
        // round-trip is the only way to know the launch target is reachable.
        match handshake(spec, server_id).await {
            Ok(conn) => {
                let ok = conn.peer.list_all_tools().await.is_ok();
                conn.cancel.cancel();
                let mut child = conn._child;
                let _ = child.kill().await;
                (ok, start.elapsed().as_secs_f64())
            }
            Err(_) => (false, start.elapsed().as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransportKind;

    fn stdio_spec(command: &str) -> LaunchSpec {
        LaunchSpec {
            kind: TransportKind::Stdio,
            command: Some(command.to_string()),
            args: vec![],
            env: Default::default(),
            url: None,
        }
    }

    #[test]
    fn can_handle_requires_stdio_kind_and_command() {
        let adapter = StdioAdapter::new();
        assert!(adapter.can_handle(&stdio_spec("echo")));

        let mut http = stdio_spec("echo");
        http.kind = TransportKind::Http;
        assert!(!adapter.can_handle(&http));

        let mut missing_command = stdio_spec("echo");
        missing_command.command = None;
        assert!(!adapter.can_handle(&missing_command));
    }

    #[tokio::test]
    async fn connect_to_nonexistent_command_returns_connect_error() {
        let adapter = StdioAdapter::new();
        let spec = stdio_spec("/this/command/does/not/exist-mcp-router");
        let err = adapter.connect("fs", &spec).await.unwrap_err();
        assert!(matches!(err, RouterError::Connect(_, _)));
    }

    #[tokio::test]
    async fn execute_tool_without_connection_errors() {
        let adapter = StdioAdapter::new();
        let err = adapter
            .execute_tool("fs", "read_file", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Connect(_, _)));
    }

    #[tokio::test]
    async fn disconnect_without_connection_returns_false() {
        let adapter = StdioAdapter::new();
        assert!(!adapter.disconnect("fs").await);
    }

    #[tokio::test]
    async fn probe_health_on_unreachable_command_is_unhealthy() {
        let adapter = StdioAdapter::new();
        let spec = stdio_spec("/this/command/does/not/exist-mcp-router");
        let (healthy, _elapsed) = adapter.probe_health("fs", &spec).await;
        assert!(!healthy);
    }
}
