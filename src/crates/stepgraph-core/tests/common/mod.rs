//! Shared fixtures for the integration suites

#![allow(dead_code)]

use serde_json::{json, Value};
use std::time::Duration;
use stepgraph_core::{
    node_fn, Event, EventStream, Executor, ExecutorOptions, FieldType, Graph, NodeBody, Reducer,
    State, StateSchema,
};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepgraph_core=warn")),
        )
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Node that sleeps, then writes `{ <id>: true }` and appends to `trail`
pub fn visit(id: &'static str, delay_ms: u64) -> NodeBody {
    node_fn(move |_, _| async move {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let mut update = serde_json::Map::new();
        update.insert(id.to_string(), json!(true));
        update.insert("trail".to_string(), json!([id]));
        Ok(Value::Object(update))
    })
}

/// Schema with an appending `trail` that accepts any other field
pub fn trail_schema() -> StateSchema {
    StateSchema::new()
        .field_with_reducer("trail", FieldType::Array, Reducer::Append)
        .allow_undeclared()
}

/// Node that always fails
pub fn failing(message: &'static str) -> NodeBody {
    node_fn(move |ctx, _| async move {
        Err(stepgraph_core::GraphError::node_execution(ctx.node_id(), message))
    })
}

pub fn executor(graph: Graph, options: ExecutorOptions) -> Executor {
    init_tracing();
    Executor::new(graph, options).expect("valid options")
}

pub async fn run_events(executor: &Executor, state: State) -> Vec<Event> {
    let stream: EventStream = executor
        .execute(state, stepgraph_core::Invocation::new())
        .await
        .expect("run starts");
    stream.collect_all().await
}

/// Node ids in the order their NodeStart events were emitted
pub fn start_order(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::NodeStart { node, .. } => Some(node.clone()),
            _ => None,
        })
        .collect()
}

/// Run-relative start time of a node's first invocation
pub fn started_at(events: &[Event], id: &str) -> Duration {
    events
        .iter()
        .find_map(|event| match event {
            Event::NodeStart { node, elapsed, .. } if node == id => Some(*elapsed),
            _ => None,
        })
        .unwrap_or_else(|| panic!("node '{}' never started", id))
}

pub fn completed_state(events: &[Event]) -> State {
    events
        .iter()
        .find_map(|event| match event {
            Event::Completed { state, .. } => Some(state.clone()),
            _ => None,
        })
        .expect("run completed")
}

pub fn run_error(events: &[Event]) -> &stepgraph_core::GraphError {
    events
        .iter()
        .find_map(|event| match event {
            Event::Error { error, .. } => Some(error.as_ref()),
            _ => None,
        })
        .expect("run failed")
}

pub fn count<F: Fn(&Event) -> bool>(events: &[Event], predicate: F) -> usize {
    events.iter().filter(|event| predicate(event)).count()
}

pub fn trail(state: &State) -> Vec<Value> {
    state
        .get("trail")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
