//! Run events and the stream that delivers them
//!
//! Every run produces an ordered stream of [`Event`]s. The caller drains the
//! [`EventStream`] until it closes. Ordering follows causality: a node's start
//! precedes its end, and a node's merge precedes the start of anything that
//! depends on it. Independent DAG branches interleave freely.
//!
//! ```text
//! Step(1) ─ NodeStart(a) ─ NodeEnd(a) ─ Checkpoint ─ Step(2) ─ ... ─ Completed
//!                                                              └──── Interrupt (suspended)
//!                                                              └──── Error     (failed)
//! ```
//!
//! A run ends with exactly one of: a [`Event::Completed`], one or more
//! [`Event::Interrupt`]s, or an [`Event::Error`].

use crate::error::{GraphError, Result};
use crate::graph::NodeId;
use crate::state::State;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use stepgraph_checkpoint::CheckpointSource;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone)]
pub enum Event {
    /// Round planned (BSP only)
    Step { step: u64, nodes: Vec<NodeId> },

    /// Node body about to run; `elapsed` is measured from run start
    NodeStart {
        node: NodeId,
        step: u64,
        elapsed: Duration,
        timestamp: DateTime<Utc>,
    },

    /// Node finished with an update or an error
    NodeEnd {
        node: NodeId,
        step: u64,
        elapsed: Duration,
        update: Option<Value>,
        error: Option<Arc<GraphError>>,
    },

    /// Checkpoint written to the store
    Checkpoint {
        lineage_id: String,
        checkpoint_id: String,
        parent_id: Option<String>,
        step: u64,
        source: CheckpointSource,
    },

    /// Node suspended; resume with these ids and an answer for `key`
    Interrupt {
        node: NodeId,
        key: String,
        prompt: Value,
        lineage_id: String,
        checkpoint_id: String,
    },

    /// Run failed
    Error {
        node: Option<NodeId>,
        error: Arc<GraphError>,
    },

    /// Run finished; `state` is the authoritative result
    Completed {
        state: State,
        lineage_id: String,
        checkpoint_id: Option<String>,
    },
}

impl Event {
    pub fn node(&self) -> Option<&str> {
        match self {
            Event::NodeStart { node, .. }
            | Event::NodeEnd { node, .. }
            | Event::Interrupt { node, .. } => Some(node),
            Event::Error { node, .. } => node.as_deref(),
            _ => None,
        }
    }

    /// Error carried by a node end or run error event
    pub fn error(&self) -> Option<&GraphError> {
        match self {
            Event::NodeEnd { error, .. } => error.as_deref(),
            Event::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Event::Completed { .. })
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Event::Interrupt { .. })
    }
}

/// A suspension reported by a run
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptInfo {
    pub node: NodeId,
    pub key: String,
    pub prompt: Value,
    pub lineage_id: String,
    pub checkpoint_id: String,
}

/// How a drained run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(State),
    Interrupted(Vec<InterruptInfo>),
}

impl RunOutcome {
    pub fn state(&self) -> Option<&State> {
        match self {
            RunOutcome::Completed(state) => Some(state),
            RunOutcome::Interrupted(_) => None,
        }
    }

    pub fn interrupts(&self) -> &[InterruptInfo] {
        match self {
            RunOutcome::Completed(_) => &[],
            RunOutcome::Interrupted(interrupts) => interrupts,
        }
    }
}

/// Receiving half of a run's events
pub struct EventStream {
    inner: ReceiverStream<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Drain every remaining event
    pub async fn collect_all(self) -> Vec<Event> {
        self.collect().await
    }

    /// Drain the stream and reduce it to the run outcome
    pub async fn outcome(mut self) -> Result<RunOutcome> {
        let mut completed = None;
        let mut interrupts = Vec::new();

        while let Some(event) = self.next().await {
            match event {
                Event::Completed { state, .. } => completed = Some(state),
                Event::Interrupt {
                    node,
                    key,
                    prompt,
                    lineage_id,
                    checkpoint_id,
                } => interrupts.push(InterruptInfo {
                    node,
                    key,
                    prompt,
                    lineage_id,
                    checkpoint_id,
                }),
                Event::Error { error, .. } => {
                    return Err(Arc::try_unwrap(error)
                        .unwrap_or_else(|shared| GraphError::Invariant(shared.to_string())))
                }
                _ => {}
            }
        }

        match completed {
            Some(state) => Ok(RunOutcome::Completed(state)),
            None if !interrupts.is_empty() => Ok(RunOutcome::Interrupted(interrupts)),
            None => Err(GraphError::Invariant(
                "event stream closed without a terminal event".to_string(),
            )),
        }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Sending half, shared by the coordinator and node tasks
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<Event>,
    started: Instant,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                started: Instant::now(),
            },
            EventStream::new(rx),
        )
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Deliver an event; a dropped receiver only silences the run
    pub async fn emit(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("Event stream receiver dropped, discarding event");
        }
    }

    pub async fn node_start(&self, node: &str, step: u64) {
        self.emit(Event::NodeStart {
            node: node.to_string(),
            step,
            elapsed: self.elapsed(),
            timestamp: Utc::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_outcome_completed() {
        let (sink, stream) = EventSink::channel(8);
        sink.node_start("a", 1).await;
        sink.emit(Event::Completed {
            state: State::new().with("x", 1),
            lineage_id: "l".into(),
            checkpoint_id: None,
        })
        .await;
        drop(sink);

        let outcome = stream.outcome().await.unwrap();
        assert_eq!(outcome.state().unwrap().get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_outcome_interrupted_and_error() {
        let (sink, stream) = EventSink::channel(8);
        sink.emit(Event::Interrupt {
            node: "ask".into(),
            key: "approval".into(),
            prompt: json!("?"),
            lineage_id: "l".into(),
            checkpoint_id: "c".into(),
        })
        .await;
        drop(sink);
        let outcome = stream.outcome().await.unwrap();
        assert_eq!(outcome.interrupts()[0].key, "approval");

        let (sink, stream) = EventSink::channel(8);
        sink.emit(Event::Error {
            node: None,
            error: Arc::new(GraphError::StepLimitExceeded { limit: 2 }),
        })
        .await;
        drop(sink);
        assert!(matches!(
            stream.outcome().await,
            Err(GraphError::StepLimitExceeded { limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_without_terminal_event() {
        let (sink, stream) = EventSink::channel(1);
        drop(sink);
        assert!(matches!(stream.outcome().await, Err(GraphError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_is_silent() {
        let (sink, stream) = EventSink::channel(1);
        drop(stream);
        sink.node_start("a", 1).await;
    }
}
