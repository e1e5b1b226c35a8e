//! Query analysis: an injected LLM-backed analyzer with a deterministic
//! keyword fallback, grounded in `intelligent_router.py`'s
//! `analyze_query`/`_keyword_analysis` pair.
//!
//! The original hard-wires three concrete HTTP clients (OpenAI, Anthropic,
//! OpenRouter) behind one method with duplicated prompt-building and
//! response-parsing code. Concrete HTTP clients are out of scope here (§9);
//! instead `LlmAnalyzer` is a trait the façade can wire to whatever client
//! it likes, keeping the routing logic itself free of any specific
//! provider's request/response shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of analyzing a query, independent of which method produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub required_capabilities: Vec<String>,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub method: String,
}

/// Pluggable query analyzer. A concrete implementation might call out to
/// OpenAI, Anthropic, or OpenRouter; the router only depends on this trait.
#[async_trait]
pub trait LlmAnalyzer: Send + Sync {
    async fn analyze(&self, query: &str, available_capabilities: &[String]) -> Result<AnalysisOutcome>;
    fn name(&self) -> &'static str;
}

/// Deterministic fallback used when no analyzer is configured, or when one
/// is configured but fails. Tokens longer than 3 characters are matched as
/// case-insensitive substrings of capability names — the same rule the
/// original's keyword path applies, but confidence is zero rather than a
/// fixed 0.5 when nothing matches, so a caller can tell "analyzed, nothing
/// matched" apart from "found something, low confidence in it."
pub fn keyword_analysis(query: &str, available_capabilities: &[String]) -> AnalysisOutcome {
    let keywords: Vec<String> = query
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .map(|w| w.to_lowercase())
        .collect();

    let matched: Vec<String> = available_capabilities
        .iter()
        .filter(|cap| {
            let lowered = cap.to_lowercase();
            keywords.iter().any(|k| lowered.contains(k.as_str()))
        })
        .cloned()
        .collect();

    let confidence = if matched.is_empty() { 0.0 } else { 0.5 };

    AnalysisOutcome {
        required_capabilities: matched,
        confidence,
        reasoning: None,
        method: "keyword".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_substring_case_insensitively() {
        let caps = vec!["FileSystem".to_string(), "database".to_string()];
        let outcome = keyword_analysis("please read a file for me", &caps);
        assert_eq!(outcome.required_capabilities, vec!["FileSystem".to_string()]);
        assert_eq!(outcome.confidence, 0.5);
    }

    #[test]
    fn short_words_are_ignored() {
        let caps = vec!["io".to_string()];
        let outcome = keyword_analysis("do io now", &caps);
        assert!(outcome.required_capabilities.is_empty());
    }

    #[test]
    fn no_match_yields_zero_confidence() {
        let caps = vec!["database".to_string()];
        let outcome = keyword_analysis("please dance around", &caps);
        assert!(outcome.required_capabilities.is_empty());
        assert_eq!(outcome.confidence, 0.0);
    }
}
