//! Executor configuration loaded from YAML or the environment
//!
//! [`ExecutorConfig`] is the serializable counterpart of
//! [`ExecutorOptions`](crate::executor::ExecutorOptions). Durations are
//! expressed in milliseconds.
//!
//! ```yaml
//! engine: dag
//! max_concurrency: 4
//! max_steps: 50
//! node_timeout_ms: 2000
//! checkpoint_cadence: every_step
//! event_buffer: 512
//! ```
//!
//! Environment overrides (applied on top of file values):
//!
//! | Variable                        | Field                |
//! |---------------------------------|----------------------|
//! | `STEPGRAPH_ENGINE`              | `engine` (`bsp`/`dag`) |
//! | `STEPGRAPH_MAX_CONCURRENCY`     | `max_concurrency`    |
//! | `STEPGRAPH_MAX_STEPS`           | `max_steps`          |
//! | `STEPGRAPH_STEP_TIMEOUT_MS`     | `step_timeout_ms`    |
//! | `STEPGRAPH_NODE_TIMEOUT_MS`     | `node_timeout_ms`    |
//! | `STEPGRAPH_CHECKPOINT_CADENCE`  | `checkpoint_cadence` |
//! | `STEPGRAPH_EVENT_BUFFER`        | `event_buffer`       |

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "STEPGRAPH_";

/// Scheduling engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Bulk-synchronous supersteps with a global barrier per round
    #[default]
    Bsp,
    /// Eager dependency-driven dispatch
    Dag,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Bsp => write!(f, "bsp"),
            Engine::Dag => write!(f, "dag"),
        }
    }
}

impl FromStr for Engine {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bsp" | "superstep" => Ok(Engine::Bsp),
            "dag" | "dataflow" => Ok(Engine::Dag),
            other => Err(GraphError::Configuration(format!("unknown engine '{}'", other))),
        }
    }
}

/// When checkpoints are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointCadence {
    /// Every BSP round / DAG completion, plus interrupts and the final state
    #[default]
    EveryStep,
    /// Only when a run suspends
    InterruptOnly,
}

impl FromStr for CheckpointCadence {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "every_step" | "every-step" | "step" => Ok(CheckpointCadence::EveryStep),
            "interrupt_only" | "interrupt-only" | "interrupt" => {
                Ok(CheckpointCadence::InterruptOnly)
            }
            other => Err(GraphError::Configuration(format!(
                "unknown checkpoint cadence '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub engine: Engine,
    pub max_concurrency: usize,
    /// Rounds (BSP) or node executions (DAG)
    pub max_steps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_timeout_ms: Option<u64>,
    pub checkpoint_cadence: CheckpointCadence,
    pub event_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            engine: Engine::Bsp,
            max_concurrency: 8,
            max_steps: 25,
            step_timeout_ms: None,
            node_timeout_ms: None,
            checkpoint_cadence: CheckpointCadence::EveryStep,
            event_buffer: 256,
        }
    }
}

impl ExecutorConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load a file, then apply `STEPGRAPH_*` overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `STEPGRAPH_*` overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    /// Apply overrides from any lookup, keyed by the unprefixed variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = lookup("ENGINE") {
            self.engine = engine.parse()?;
        }
        if let Some(value) = lookup("MAX_CONCURRENCY") {
            self.max_concurrency = parse_number("MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("MAX_STEPS") {
            self.max_steps = parse_number("MAX_STEPS", &value)?;
        }
        if let Some(value) = lookup("STEP_TIMEOUT_MS") {
            self.step_timeout_ms = Some(parse_number("STEP_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("NODE_TIMEOUT_MS") {
            self.node_timeout_ms = Some(parse_number("NODE_TIMEOUT_MS", &value)?);
        }
        if let Some(cadence) = lookup("CHECKPOINT_CADENCE") {
            self.checkpoint_cadence = cadence.parse()?;
        }
        if let Some(value) = lookup("EVENT_BUFFER") {
            self.event_buffer = parse_number("EVENT_BUFFER", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(GraphError::Configuration(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(GraphError::Configuration(
                "max_steps must be greater than 0".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(GraphError::Configuration(
                "event_buffer must be greater than 0".to_string(),
            ));
        }
        if self.step_timeout_ms == Some(0) || self.node_timeout_ms == Some(0) {
            return Err(GraphError::Configuration(
                "timeouts must be greater than 0 ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        GraphError::Configuration(format!(
            "{}{} must be a number, got '{}'",
            ENV_PREFIX, name, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine, Engine::Bsp);
        assert_eq!(config.max_concurrency, 8);
    }

    #[test]
    fn test_yaml_with_partial_fields() {
        let config = ExecutorConfig::from_yaml_str(
            "engine: dag\nmax_steps: 50\nnode_timeout_ms: 2000\ncheckpoint_cadence: interrupt_only\n",
        )
        .unwrap();

        assert_eq!(config.engine, Engine::Dag);
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.node_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.checkpoint_cadence, CheckpointCadence::InterruptOnly);
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_yaml_rejects_zero_concurrency() {
        let err = ExecutorConfig::from_yaml_str("max_concurrency: 0\n").unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = ExecutorConfig::from_yaml_str("engine: [nope").unwrap_err();
        assert!(matches!(err, GraphError::Yaml(_)));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ENGINE", "DAG"),
            ("MAX_CONCURRENCY", "3"),
            ("STEP_TIMEOUT_MS", "150"),
            ("CHECKPOINT_CADENCE", "interrupt-only"),
        ]
        .into_iter()
        .collect();

        let mut config = ExecutorConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.engine, Engine::Dag);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.step_timeout(), Some(Duration::from_millis(150)));
        assert_eq!(config.checkpoint_cadence, CheckpointCadence::InterruptOnly);
    }

    #[test]
    fn test_override_parse_errors() {
        let mut config = ExecutorConfig::default();
        let err = config
            .apply_overrides(|name| (name == "MAX_STEPS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STEPGRAPH_MAX_STEPS"));

        let err = config
            .apply_overrides(|name| (name == "ENGINE").then(|| "quantum".to_string()))
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }
}
