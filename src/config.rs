//! Engine configuration
//!
//! Tier-up thresholds, polymorphism limits and the deopt-loop policy. The
//! configuration can be built in code with the `with_*` setters or loaded from
//! a JSON file; missing fields take their defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Highest accepted `max_call_depth`. Every engine call level nests several
/// native frames, so the host thread's stack has to fit this many levels.
pub const MAX_CALL_DEPTH_LIMIT: usize = 4096;

/// Configuration for an [`Engine`](crate::engine::Engine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Baseline invocations before a unit is considered hot
    pub tier_up_threshold: u32,
    /// Distinct kinds a feedback slot can hold before it turns megamorphic
    pub max_polymorphism: usize,
    /// Highest polymorphic arity the scheduler still optimizes
    pub max_optimizable_polymorphism: usize,
    /// Deopts tolerated at one site before the unit enters cooldown
    pub deopt_retry_budget: u32,
    /// Baseline invocations a unit waits in cooldown before re-optimizing
    pub cooldown_invocations: u32,
    /// Compile on a background thread instead of synchronously
    pub concurrent_compilation: bool,
    /// Maximum nesting of dispatcher calls, at most [`MAX_CALL_DEPTH_LIMIT`]
    pub max_call_depth: usize,
    /// Elide non-escaping allocations in optimized code
    pub enable_escape_analysis: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tier_up_threshold: 100,
            max_polymorphism: 4,
            max_optimizable_polymorphism: 4,
            deopt_retry_budget: 2,
            cooldown_invocations: 64,
            concurrent_compilation: false,
            max_call_depth: 256,
            enable_escape_analysis: true,
        }
    }
}

impl EngineConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject configurations the scheduler cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.tier_up_threshold == 0 {
            return Err(Error::Config("tier_up_threshold must be at least 1".into()));
        }
        if self.max_polymorphism == 0 {
            return Err(Error::Config("max_polymorphism must be at least 1".into()));
        }
        if self.max_optimizable_polymorphism > self.max_polymorphism {
            return Err(Error::Config(format!(
                "max_optimizable_polymorphism ({}) exceeds max_polymorphism ({})",
                self.max_optimizable_polymorphism, self.max_polymorphism
            )));
        }
        if self.max_call_depth == 0 {
            return Err(Error::Config("max_call_depth must be at least 1".into()));
        }
        if self.max_call_depth > MAX_CALL_DEPTH_LIMIT {
            return Err(Error::Config(format!(
                "max_call_depth ({}) exceeds the limit of {}",
                self.max_call_depth, MAX_CALL_DEPTH_LIMIT
            )));
        }
        Ok(())
    }

    pub fn with_tier_up_threshold(mut self, threshold: u32) -> Self {
        self.tier_up_threshold = threshold;
        self
    }

    pub fn with_deopt_retry_budget(mut self, budget: u32) -> Self {
        self.deopt_retry_budget = budget;
        self
    }

    pub fn with_cooldown_invocations(mut self, invocations: u32) -> Self {
        self.cooldown_invocations = invocations;
        self
    }

    pub fn with_concurrent_compilation(mut self, enabled: bool) -> Self {
        self.concurrent_compilation = enabled;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_escape_analysis(mut self, enabled: bool) -> Self {
        self.enable_escape_analysis = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "tier_up_threshold": 7 }"#).unwrap();
        assert_eq!(config.tier_up_threshold, 7);
        assert_eq!(config.deopt_retry_budget, 2);
        assert!(config.enable_escape_analysis);
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::from_json_str(r#"{ "tier_up_threshold": 0 }"#).is_err());
        let err = EngineConfig::from_json_str(
            r#"{ "max_polymorphism": 2, "max_optimizable_polymorphism": 3 }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_call_depth_is_bounded() {
        assert!(EngineConfig::default().with_max_call_depth(MAX_CALL_DEPTH_LIMIT).validate().is_ok());
        let err = EngineConfig::default()
            .with_max_call_depth(MAX_CALL_DEPTH_LIMIT + 1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(EngineConfig::from_json_str(r#"{ "max_call_depth": 1000000 }"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "cooldown_invocations": 5, "concurrent_compilation": true }}"#).unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cooldown_invocations, 5);
        assert!(config.concurrent_compilation);
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_file("/nonexistent/tierjit.json").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
