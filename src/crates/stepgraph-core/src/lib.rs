//! # stepgraph-core - Checkpointed Graph Execution
//!
//! Runs directed graphs of async node functions over a shared, schema-checked
//! state, with two interchangeable scheduling engines, durable checkpoints and
//! human-in-the-loop interrupts.
//!
//! ## Overview
//!
//! - **Graph compiler**: [`GraphBuilder`] collects nodes and edges;
//!   [`GraphBuilder::compile`] validates them into an immutable [`Graph`]
//! - **State schema**: [`StateSchema`] declares fields, their
//!   [`FieldType`]s and [`Reducer`]s; node results are partial updates
//! - **Engines**: [`Engine::Bsp`] runs synchronized rounds with a global
//!   barrier, [`Engine::Dag`] dispatches each node as soon as it is ready
//! - **Checkpoints**: every round (BSP) or completion (DAG) can be saved to a
//!   [`CheckpointStore`]; checkpoints of one run form a lineage
//! - **Interrupts**: a node calls [`NodeContext::interrupt`] to suspend the
//!   run; the caller resumes with a [`ResumeCommand`]
//! - **Events**: every run reports progress on an [`EventStream`]
//!
//! ## Execution Flow
//!
//! ```text
//! State ─> Executor::execute ─> coordinator task ─┬─> Step / NodeStart / NodeEnd
//!                                                 ├─> Checkpoint
//!                                                 └─> Completed | Interrupt | Error
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use stepgraph_core::{
//!     node_fn, Engine, Executor, ExecutorOptions, FieldType, GraphBuilder, Reducer,
//!     ResumeCommand, RunOutcome, State, StateSchema, END, START,
//! };
//!
//! #[tokio::main]
//! async fn main() -> stepgraph_core::Result<()> {
//!     let schema = StateSchema::new()
//!         .field("draft", FieldType::String)
//!         .field_with_reducer("log", FieldType::Array, Reducer::Append)
//!         .field("approval", FieldType::String);
//!
//!     let mut builder = GraphBuilder::new(schema);
//!     builder
//!         .add_node("write", node_fn(|_, _| async {
//!             Ok(json!({ "draft": "v1", "log": ["write"] }))
//!         }))
//!         .add_node("approve", node_fn(|ctx, state| async move {
//!             let answer = ctx.interrupt("approval", json!({ "draft": state.get("draft") }))?;
//!             Ok(json!({ "approval": answer, "log": ["approve"] }))
//!         }))
//!         .add_edge(START, "write")
//!         .add_edge("write", "approve")
//!         .add_edge("approve", END);
//!
//!     let executor = Executor::new(
//!         builder.compile()?,
//!         ExecutorOptions::default().with_engine(Engine::Dag),
//!     )?;
//!
//!     if let RunOutcome::Interrupted(interrupts) = executor.invoke(State::new()).await? {
//!         let pending = &interrupts[0];
//!         let resume = State::resume(
//!             &pending.lineage_id,
//!             &pending.checkpoint_id,
//!             ResumeCommand::new().with("approval", "ok"),
//!         );
//!         let done = executor.invoke(resume).await?;
//!         println!("{:?}", done.state());
//!     }
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod hooks;
pub(crate) mod lineage;
pub mod node;
pub mod retry;
pub(crate) mod scheduler;
pub mod schema;
pub mod state;

pub use builder::GraphBuilder;
pub use config::{CheckpointCadence, Engine, ExecutorConfig, ENV_PREFIX};
pub use error::{ErrorKind, GraphError, GraphInvalidError, Result};
pub use event::{Event, EventStream, InterruptInfo, RunOutcome};
pub use executor::{Executor, ExecutorOptions, Invocation};
pub use graph::{Edge, Graph, Node, NodeId, Route, RouterFn, END, START};
pub use hooks::{HookAction, NodeHooks};
pub use node::{node_fn, Interrupt, NodeBody, NodeContext, NodeFuture, NodeKind};
pub use retry::RetryPolicy;
pub use schema::{FieldSpec, FieldType, Reducer, ReducerFn, StateSchema};
pub use state::{ResumeCommand, State};

pub use stepgraph_checkpoint::{
    Checkpoint, CheckpointError, CheckpointId, CheckpointMetadata, CheckpointSource,
    CheckpointStore, CheckpointSummary, InMemoryCheckpointStore, LineageId, PendingWork,
};
