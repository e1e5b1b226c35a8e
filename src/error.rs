//! Error taxonomy for the MCP Router.

use thiserror::Error;

/// Main error type for Router operations.
///
/// Propagation follows the taxonomy: only [`RouterError::Tool`] and
/// [`RouterError::Validation`] are meant to surface to external callers of
/// the façade unchanged; the rest are logged and downgraded to a degraded
/// but consistent state by the component that produced them.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Malformed config file or missing required environment variable. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Corrupt registry file or disk full. Recoverable: falls back to `.bak` or an empty registry.
    #[error("registry error: {0}")]
    Registry(String),

    /// No adapter can handle a launch spec.
    #[error("no adapter can handle server '{0}': {1}")]
    Adapter(String, String),

    /// Child process failed to start, or the handshake timed out.
    #[error("connect error for server '{0}': {1}")]
    Connect(String, String),

    /// Adapter returned an error for `execute_tool`.
    #[error("tool error for '{0}::{1}': {2}")]
    Tool(String, String, String),

    /// Disk-tier cache I/O failure. Swallowed by the cache; never reaches callers.
    #[error("cache error: {0}")]
    Cache(String),

    /// LLM returned non-JSON or an HTTP error during query analysis.
    #[error("analysis error: {0}")]
    Analysis(String),

    /// Unknown server id, or a required tool argument missing per schema.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for Router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_display() {
        let err = RouterError::Config("missing servers map".to_string());
        assert_eq!(err.to_string(), "config error: missing servers map");
    }

    #[test]
    fn tool_display() {
        let err = RouterError::Tool(
            "fs".to_string(),
            "read".to_string(),
            "file not found".to_string(),
        );
        assert_eq!(err.to_string(), "tool error for 'fs::read': file not found");
    }

    #[test]
    fn validation_display() {
        let err = RouterError::Validation("missing required field 'path'".to_string());
        assert_eq!(
            err.to_string(),
            "validation error: missing required field 'path'"
        );
    }
}
