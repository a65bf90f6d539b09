//! Engine configuration
//!
//! Every section has documented defaults and loads from JSON with any field
//! omitted:
//!
//! ```json
//! {
//!   "executor":  {"max_steps": 32, "node_timeout_ms": 120000},
//!   "harness":   {"concurrency": 4, "pass_threshold": 1.0},
//!   "evolution": {"stagnation_window": 3, "stagnation_epsilon": 0.01, "target_score": 0.9}
//! }
//! ```

use crate::error::{Error, Result};
use evoforge_graph::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Evaluation harness settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Examples evaluated at once
    pub concurrency: usize,
    /// Minimum example score for a trace to count as passing
    pub pass_threshold: f64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            pass_threshold: 1.0,
        }
    }
}

impl HarnessConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }
}

/// Dual-loop policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Trailing evaluation rounds inspected for stagnation (W)
    pub stagnation_window: usize,
    /// Minimum relative improvement over the window (ε, 0.01 = 1%)
    pub stagnation_epsilon: f64,
    /// Aggregate score that ends evolution
    pub target_score: f64,
    /// Evaluation rounds before giving up
    pub max_rounds: usize,
    /// Mutation attempts per stagnation episode
    pub mutation_retries: usize,
    /// Consecutive "no viable mutation" episodes before giving up
    pub max_noop_episodes: usize,
    /// Passing traces handed to the inner optimizer
    pub max_training_traces: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            stagnation_window: 3,
            stagnation_epsilon: 0.01,
            target_score: 0.9,
            max_rounds: 20,
            mutation_retries: 3,
            max_noop_episodes: 3,
            max_training_traces: 8,
        }
    }
}

impl EvolutionConfig {
    pub fn with_stagnation(mut self, window: usize, epsilon: f64) -> Self {
        self.stagnation_window = window;
        self.stagnation_epsilon = epsilon;
        self
    }

    pub fn with_target_score(mut self, target: f64) -> Self {
        self.target_score = target;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_mutation_retries(mut self, retries: usize) -> Self {
        self.mutation_retries = retries;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stagnation_window < 2 {
            return Err(Error::config_invalid("stagnation_window must be at least 2"));
        }
        if self.stagnation_epsilon.is_nan() || self.stagnation_epsilon < 0.0 {
            return Err(Error::config_invalid("stagnation_epsilon must be non-negative"));
        }
        if self.mutation_retries == 0 || self.max_noop_episodes == 0 {
            return Err(Error::config_invalid(
                "mutation_retries and max_noop_episodes must be positive",
            ));
        }
        Ok(())
    }
}

/// All engine settings in one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub harness: HarnessConfig,
    pub evolution: EvolutionConfig,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config_invalid(format!("invalid engine config: {}", e)).set_source(e))?;
        config.evolution.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).with_context("path", path.display().to_string()))?;
        Self::from_json(&json).map_err(|e| e.with_context("path", path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.max_steps, 32);
        assert_eq!(config.harness.concurrency, 4);
        assert_eq!(config.evolution.stagnation_window, 3);
        assert_eq!(config.evolution.stagnation_epsilon, 0.01);
        assert_eq!(config.evolution.max_noop_episodes, 3);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"evolution": {"stagnation_epsilon": 0.02, "max_rounds": 5}, "harness": {"concurrency": 2}}"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.evolution.stagnation_epsilon, 0.02);
        assert_eq!(config.evolution.max_rounds, 5);
        assert_eq!(config.evolution.stagnation_window, 3);
        assert_eq!(config.harness.concurrency, 2);
        assert_eq!(config.executor.node_timeout_ms, 120_000);
    }

    #[test]
    fn test_rejects_degenerate_window() {
        let err = EngineConfig::from_json(r#"{"evolution": {"stagnation_window": 1}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }
}
