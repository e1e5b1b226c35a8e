//! Router configuration: `config.json` schema, parsing, and validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::TransportKind;
use crate::error::{Result, RouterError};

/// One entry under `"servers"` in `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub transport_kind: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Top-level `config.json` document (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl RouterConfig {
    /// Parse `config.json` contents, then apply the environment-variable
    /// overlay (§6: `OPENROUTER_API_KEY`, `OPENAI_API_KEY`,
    /// `ANTHROPIC_API_KEY` override file values when present) and validate.
    pub fn load_from_str(contents: &str) -> Result<Self> {
        let mut config: RouterConfig = serde_json::from_str(contents)
            .map_err(|e| RouterError::Config(format!("invalid config.json: {e}")))?;
        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overlay(&mut self) {
        if let Ok(v) = std::env::var("OPENROUTER_API_KEY") {
            self.openrouter_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(v);
        }
    }

    /// Fail-fast validation: one [`RouterError::Config`] per violation found.
    pub fn validate(&self) -> Result<()> {
        for (id, server) in &self.servers {
            if id.is_empty() {
                return Err(RouterError::Config("server id must not be empty".into()));
            }
            match server.transport_kind {
                TransportKind::Stdio => {
                    if server.command.as_deref().unwrap_or("").is_empty() {
                        return Err(RouterError::Config(format!(
                            "server '{id}': stdio transport requires 'command'"
                        )));
                    }
                }
                TransportKind::Http => {
                    if server.url.as_deref().unwrap_or("").is_empty() {
                        return Err(RouterError::Config(format!(
                            "server '{id}': http transport requires 'url'"
                        )));
                    }
                }
            }
            for cap in &server.capabilities {
                if cap != &cap.to_lowercase() {
                    return Err(RouterError::Config(format!(
                        "server '{id}': capability '{cap}' must be lowercase"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_stdio_server() {
        let json = r#"{
            "servers": {
                "fs": {
                    "name": "Filesystem",
                    "transport_kind": "stdio",
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
                    "capabilities": ["filesystem", "file_read"]
                }
            }
        }"#;
        let config = RouterConfig::load_from_str(json).unwrap();
        let fs = config.servers.get("fs").unwrap();
        assert_eq!(fs.command.as_deref(), Some("npx"));
        assert_eq!(fs.capabilities, vec!["filesystem", "file_read"]);
    }

    #[test]
    fn rejects_stdio_without_command() {
        let json = r#"{"servers": {"fs": {"name": "Filesystem", "transport_kind": "stdio"}}}"#;
        let err = RouterConfig::load_from_str(json).unwrap_err();
        assert!(err.to_string().contains("requires 'command'"));
    }

    #[test]
    fn rejects_http_without_url() {
        let json = r#"{"servers": {"fs": {"name": "Filesystem", "transport_kind": "http"}}}"#;
        let err = RouterConfig::load_from_str(json).unwrap_err();
        assert!(err.to_string().contains("requires 'url'"));
    }

    #[test]
    fn rejects_uppercase_capability() {
        let json = r#"{"servers": {"fs": {"name": "Filesystem", "transport_kind": "stdio", "command": "echo", "capabilities": ["FileSystem"]}}}"#;
        let err = RouterConfig::load_from_str(json).unwrap_err();
        assert!(err.to_string().contains("must be lowercase"));
    }

    #[test]
    fn env_overlay_overrides_file_value() {
        // SAFETY: test-only env mutation, not run concurrently with other
        // tests that read OPENAI_API_KEY.
        unsafe {
            std::env::set_var("OPENAI_API_KEY", "from-env");
        }
        let json = r#"{"openai_api_key": "from-file", "servers": {}}"#;
        let config = RouterConfig::load_from_str(json).unwrap();
        assert_eq!(config.openai_api_key.as_deref(), Some("from-env"));
        unsafe {
            std::env::remove_var("OPENAI_API_KEY");
        }
    }
}
