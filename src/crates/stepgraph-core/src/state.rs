//! Run state and resume input
//!
//! [`State`] is both the input to a run and the result it completes with. The
//! field values are an ordered map so snapshots serialize identically across
//! runs. Lineage id, checkpoint id and [`ResumeCommand`] are input-side
//! metadata: they tell the executor whether to start fresh or re-enter an
//! existing lineage.
//!
//! | lineage | checkpoint | resume | meaning                                   |
//! |---------|------------|--------|-------------------------------------------|
//! | -       | -          | -      | new run, new lineage                      |
//! | yes     | -          | -      | new run appended to an existing lineage   |
//! | yes     | -          | yes    | resume the lineage's latest checkpoint    |
//! | yes     | yes        | yes    | resume the named checkpoint               |
//! | -       | yes        | any    | usage error                               |
//! | yes     | yes        | -      | usage error                               |
//! | -       | -          | yes    | usage error                               |

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Caller answers to pending interrupts, keyed by interrupt key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeCommand {
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl ResumeCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an answer for an interrupt key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ResumeCommand {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Shared run state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub values: BTreeMap<String, Value>,
    pub lineage_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub resume: Option<ResumeCommand>,
}

/// How a run should begin, derived from the input state's metadata
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StartRequest {
    Fresh {
        lineage_id: Option<String>,
    },
    Resume {
        lineage_id: String,
        checkpoint_id: Option<String>,
        command: ResumeCommand,
    },
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON object
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_values(map.into_iter().collect())),
            Value::Null => Ok(Self::new()),
            other => Err(GraphError::state(
                None::<String>,
                format!("state must be a JSON object, got {}", other),
            )),
        }
    }

    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self {
            values,
            ..Default::default()
        }
    }

    /// Input for resuming `checkpoint_id` within `lineage_id`
    pub fn resume(
        lineage_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        command: ResumeCommand,
    ) -> Self {
        Self {
            values: BTreeMap::new(),
            lineage_id: Some(lineage_id.into()),
            checkpoint_id: Some(checkpoint_id.into()),
            resume: Some(command),
        }
    }

    /// Input for resuming the most recent checkpoint of `lineage_id`
    pub fn resume_latest(lineage_id: impl Into<String>, command: ResumeCommand) -> Self {
        Self {
            values: BTreeMap::new(),
            lineage_id: Some(lineage_id.into()),
            checkpoint_id: None,
            resume: Some(command),
        }
    }

    /// Set a field value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Start the run inside an existing lineage
    pub fn in_lineage(mut self, lineage_id: impl Into<String>) -> Self {
        self.lineage_id = Some(lineage_id.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Field values as a JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }

    pub(crate) fn start_request(&self) -> Result<StartRequest> {
        match (&self.lineage_id, &self.checkpoint_id, &self.resume) {
            (lineage_id, None, None) => Ok(StartRequest::Fresh {
                lineage_id: lineage_id.clone(),
            }),
            (Some(lineage_id), checkpoint_id, Some(command)) => {
                if !self.values.is_empty() {
                    return Err(GraphError::Usage(
                        "a resuming run restores its state from the checkpoint and cannot carry field values"
                            .to_string(),
                    ));
                }
                Ok(StartRequest::Resume {
                    lineage_id: lineage_id.clone(),
                    checkpoint_id: checkpoint_id.clone(),
                    command: command.clone(),
                })
            }
            (None, Some(_), _) => Err(GraphError::Usage(
                "checkpoint id supplied without a lineage id".to_string(),
            )),
            (Some(_), Some(_), None) => Err(GraphError::Usage(
                "checkpoint id supplied without a resume command".to_string(),
            )),
            (None, None, Some(_)) => Err(GraphError::Usage(
                "resume command supplied without a lineage id".to_string(),
            )),
        }
    }
}

impl From<BTreeMap<String, Value>> for State {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self::from_values(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_and_accessors() {
        let state = State::new().with("question", "ship it?").with("count", 2);
        assert_eq!(state.get_str("question"), Some("ship it?"));
        assert_eq!(state.to_json(), json!({"count": 2, "question": "ship it?"}));
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(State::from_json(json!({"a": 1})).is_ok());
        assert!(State::from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn test_start_requests() {
        assert_eq!(
            State::new().start_request().unwrap(),
            StartRequest::Fresh { lineage_id: None }
        );

        let resume = State::resume("l1", "c1", ResumeCommand::new().with("approval", "ok"));
        match resume.start_request().unwrap() {
            StartRequest::Resume {
                lineage_id,
                checkpoint_id,
                command,
            } => {
                assert_eq!(lineage_id, "l1");
                assert_eq!(checkpoint_id.as_deref(), Some("c1"));
                assert_eq!(command.get("approval"), Some(&json!("ok")));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_without_lineage_or_command_is_usage_error() {
        let mut state = State::new();
        state.checkpoint_id = Some("c1".to_string());
        assert!(matches!(state.start_request(), Err(GraphError::Usage(_))));

        state.lineage_id = Some("l1".to_string());
        assert!(matches!(state.start_request(), Err(GraphError::Usage(_))));

        let mut state = State::resume("l1", "c1", ResumeCommand::new());
        state.set("extra", 1);
        assert!(matches!(state.start_request(), Err(GraphError::Usage(_))));
    }

    #[test]
    fn test_resume_command_from_iter() {
        let command: ResumeCommand = vec![("a", json!(1)), ("b", json!("x"))].into_iter().collect();
        assert_eq!(command.values.len(), 2);
        assert!(!command.is_empty());
    }
}
