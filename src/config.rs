//! Configuration module for the L4 peek filter
//!
//! Configuration is loaded from Envoy plugin configuration,
//! NOT from external files. This avoids file I/O in the Wasm sandbox.

use serde::Deserialize;

use crate::peek::{BuildError, PartialRead, PatternSpec, PeekMatcher};

/// Filter configuration loaded from Envoy plugin configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeekConfig {
    /// Literal prefixes, tried first and in order
    #[serde(default)]
    pub prefixes: Vec<String>,

    /// Regex signatures, tried after all prefixes
    #[serde(default)]
    pub prefix_patterns: Vec<PrefixPattern>,

    /// Whether bytes from a read cut short by end of stream are kept
    #[serde(default)]
    pub partial_read: PartialRead,

    /// Close the downstream connection when nothing matches
    #[serde(default)]
    pub close_on_mismatch: bool,

    /// Whether to emit a telemetry event per decision
    #[serde(default = "default_log_matches")]
    pub log_matches: bool,
}

/// One `prefixPatterns` entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixPattern {
    #[serde(default)]
    pub pattern: String,

    /// 0 or missing means the default bound
    #[serde(default)]
    pub max_read: u32,
}

fn default_log_matches() -> bool {
    true
}

impl Default for PeekConfig {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            prefix_patterns: Vec::new(),
            partial_read: PartialRead::default(),
            close_on_mismatch: false,
            log_matches: default_log_matches(),
        }
    }
}

impl PeekConfig {
    /// Parse configuration from JSON bytes (from Envoy plugin configuration)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config_str =
            std::str::from_utf8(bytes).map_err(|e| ConfigError::InvalidUtf8(e.to_string()))?;

        serde_json::from_str(config_str).map_err(|e| ConfigError::InvalidJson(e.to_string()))
    }

    pub fn pattern_specs(&self) -> Vec<PatternSpec> {
        self.prefix_patterns
            .iter()
            .map(|p| PatternSpec::new(&p.pattern, p.max_read))
            .collect()
    }

    /// Compile every signature; fails on the first invalid pattern
    pub fn build_matcher(&self) -> Result<PeekMatcher, ConfigError> {
        let matcher = PeekMatcher::from_specs(&self.prefixes, &self.pattern_specs())
            .map_err(ConfigError::InvalidPattern)?;
        Ok(matcher.with_partial_read(self.partial_read))
    }
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    InvalidUtf8(String),
    InvalidJson(String),
    InvalidPattern(BuildError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidUtf8(e) => write!(f, "Invalid UTF-8: {}", e),
            ConfigError::InvalidJson(e) => write!(f, "Invalid JSON: {}", e),
            ConfigError::InvalidPattern(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
