//! BSP merge order does not depend on completion order

mod common;

use common::*;
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use stepgraph_core::{
    node_fn, ExecutorOptions, FieldType, Graph, GraphBuilder, NodeBody, Reducer, State,
    StateSchema, END, START,
};

fn writer(id: &'static str, delay_ms: u64) -> NodeBody {
    node_fn(move |_, _| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(json!({ "winner": id, "log": [id], "total": 1 }))
    })
}

/// fan -> {x, y, z} -> end, every branch writing the same fields
fn fan_out(delays: &[u64]) -> Graph {
    let schema = StateSchema::new()
        .field("winner", FieldType::String)
        .field_with_reducer("log", FieldType::Array, Reducer::Append)
        .field_with_reducer("total", FieldType::Integer, Reducer::Sum);
    let mut builder = GraphBuilder::new(schema);
    builder
        .add_node("fan", node_fn(|_, _| async { Ok(json!(null)) }))
        .add_node("x", writer("x", delays[0]))
        .add_node("y", writer("y", delays[1]))
        .add_node("z", writer("z", delays[2]))
        .add_edge(START, "fan");
    for id in ["x", "y", "z"] {
        builder.add_edge("fan", id).add_edge(id, END);
    }
    builder.compile().unwrap()
}

fn run_once(delays: Vec<u64>, max_concurrency: usize) -> State {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    runtime.block_on(async move {
        let executor = executor(
            fan_out(&delays),
            ExecutorOptions::default().with_max_concurrency(max_concurrency),
        );
        completed_state(&run_events(&executor, State::new()).await)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn merge_is_ordered_by_node_id(
        delays in prop::collection::vec(0u64..500, 3),
        max_concurrency in 1usize..4,
    ) {
        let state = run_once(delays, max_concurrency);
        prop_assert_eq!(state.get("winner"), Some(&json!("z")));
        prop_assert_eq!(state.get("log"), Some(&json!(["x", "y", "z"])));
        prop_assert_eq!(state.get("total"), Some(&json!(3)));
    }
}
