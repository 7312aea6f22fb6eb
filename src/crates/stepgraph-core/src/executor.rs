//! Run entry point: options, invocations and the run registry
//!
//! An [`Executor`] pairs a compiled [`Graph`] with [`ExecutorOptions`]. Every
//! call to [`Executor::execute`] spawns one coordinating task for the run and
//! returns its [`EventStream`] immediately.
//!
//! ```rust,no_run
//! use stepgraph_core::{node_fn, Executor, ExecutorOptions, GraphBuilder, State, StateSchema, END, START};
//! use serde_json::json;
//!
//! # async fn example() -> stepgraph_core::Result<()> {
//! let mut builder = GraphBuilder::new(StateSchema::new().allow_undeclared());
//! builder
//!     .add_node("greet", node_fn(|_ctx, state| async move {
//!         let name = state.get_str("name").unwrap_or("world").to_string();
//!         Ok(json!({ "greeting": format!("hello {}", name) }))
//!     }))
//!     .add_edge(START, "greet")
//!     .add_edge("greet", END);
//!
//! let executor = Executor::new(builder.compile()?, ExecutorOptions::default())?;
//! let outcome = executor.invoke(State::new().with("name", "ada")).await?;
//! assert_eq!(outcome.state().unwrap().get_str("greeting"), Some("hello ada"));
//! # Ok(())
//! # }
//! ```
//!
//! Each run gets a cancellation token derived from its [`Invocation`] and
//! registered under the invocation id for as long as the run is active.
//! [`Executor::cancel`] and the invocation deadline fire that token.

use crate::config::{CheckpointCadence, Engine, ExecutorConfig};
use crate::error::{GraphError, Result};
use crate::event::{Event, EventSink, EventStream, RunOutcome};
use crate::graph::Graph;
use crate::hooks::{HookChain, NodeHooks};
use crate::lineage::LineageManager;
use crate::retry::RetryPolicy;
use crate::scheduler::{self, RunContext, RunEnd};
use crate::state::{StartRequest, State};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use stepgraph_checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runtime options for an [`Executor`]
#[derive(Clone)]
pub struct ExecutorOptions {
    pub engine: Engine,
    /// Worker slots shared by the nodes of one run
    pub max_concurrency: usize,
    /// Rounds (BSP) or node executions (DAG)
    pub max_steps: u64,
    /// Bounds each BSP round; ignored by the DAG engine
    pub step_timeout: Option<Duration>,
    pub node_timeout: Option<Duration>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub checkpoint_cadence: CheckpointCadence,
    pub retry: Option<RetryPolicy>,
    pub hooks: Vec<Arc<dyn NodeHooks>>,
    pub event_buffer: usize,
}

impl fmt::Debug for ExecutorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorOptions")
            .field("engine", &self.engine)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_steps", &self.max_steps)
            .field("step_timeout", &self.step_timeout)
            .field("node_timeout", &self.node_timeout)
            .field("checkpoint_store", &"<store>")
            .field("checkpoint_cadence", &self.checkpoint_cadence)
            .field("retry", &self.retry)
            .field("hooks", &self.hooks.len())
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl ExecutorOptions {
    /// Options from a loaded configuration, with an in-memory store
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            engine: config.engine,
            max_concurrency: config.max_concurrency,
            max_steps: config.max_steps,
            step_timeout: config.step_timeout(),
            node_timeout: config.node_timeout(),
            checkpoint_store: Arc::new(InMemoryCheckpointStore::new()),
            checkpoint_cadence: config.checkpoint_cadence,
            retry: None,
            hooks: Vec::new(),
            event_buffer: config.event_buffer,
        }
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = store;
        self
    }

    pub fn with_checkpoint_cadence(mut self, cadence: CheckpointCadence) -> Self {
        self.checkpoint_cadence = cadence;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn NodeHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.event_buffer = buffer;
        self
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
        if self.step_timeout == Some(Duration::ZERO) || self.node_timeout == Some(Duration::ZERO) {
            return Err(GraphError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-call parameters
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: String,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub tags: BTreeMap<String, Value>,
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

impl Invocation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            deadline: None,
            cancel: CancellationToken::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancel the run whenever `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Active runs, keyed by invocation id
#[derive(Debug, Clone, Default)]
pub(crate) struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl RunRegistry {
    pub async fn register(&self, id: &str, token: CancellationToken) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(id) {
            return Err(GraphError::Usage(format!(
                "invocation '{}' is already running",
                id
            )));
        }
        runs.insert(id.to_string(), token);
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> bool {
        match self.runs.read().await.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) {
        self.runs.write().await.remove(id);
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Runs a compiled graph
#[derive(Debug, Clone)]
pub struct Executor {
    graph: Arc<Graph>,
    options: Arc<ExecutorOptions>,
    registry: RunRegistry,
}

impl Executor {
    pub fn new(graph: impl Into<Arc<Graph>>, options: ExecutorOptions) -> Result<Self> {
        options.validate()?;
        if options.engine == Engine::Dag && options.step_timeout.is_some() {
            tracing::warn!("step_timeout has no effect with the dag engine");
        }
        Ok(Self {
            graph: graph.into(),
            options: Arc::new(options),
            registry: RunRegistry::default(),
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Start a run and return its event stream
    ///
    /// Input and usage errors are returned directly; everything that happens
    /// after the run starts is reported on the stream.
    pub async fn execute(&self, state: State, invocation: Invocation) -> Result<EventStream> {
        let request = state.start_request()?;
        if matches!(request, StartRequest::Fresh { .. }) {
            self.graph.schema().validate_input(&state.values)?;
        }

        let token = invocation.cancel.child_token();
        self.registry.register(&invocation.id, token.clone()).await?;

        let (events, stream) = EventSink::channel(self.options.event_buffer);
        let run = PreparedRun {
            graph: self.graph.clone(),
            options: self.options.clone(),
            registry: self.registry.clone(),
            invocation,
            token,
            events,
            request,
            input: state.values,
        };
        tokio::spawn(run.coordinate());
        Ok(stream)
    }

    /// Run to the end and reduce the events to an outcome
    pub async fn invoke(&self, state: State) -> Result<RunOutcome> {
        self.invoke_with(state, Invocation::new()).await
    }

    pub async fn invoke_with(&self, state: State, invocation: Invocation) -> Result<RunOutcome> {
        self.execute(state, invocation).await?.outcome().await
    }

    /// Fire the token of an active run; false if no such run is active
    pub async fn cancel(&self, invocation_id: &str) -> bool {
        let found = self.registry.cancel(invocation_id).await;
        if found {
            tracing::info!(invocation_id = %invocation_id, "Run cancellation requested");
        }
        found
    }

    /// Invocation ids of the runs still in progress
    pub async fn active_runs(&self) -> Vec<String> {
        self.registry.ids().await
    }
}

/// Everything the coordinating task owns
struct PreparedRun {
    graph: Arc<Graph>,
    options: Arc<ExecutorOptions>,
    registry: RunRegistry,
    invocation: Invocation,
    token: CancellationToken,
    events: EventSink,
    request: StartRequest,
    input: BTreeMap<String, Value>,
}

impl PreparedRun {
    async fn coordinate(self) {
        let invocation_id = self.invocation.id.clone();
        let events = self.events.clone();
        let registry = self.registry.clone();
        let token = self.token.clone();

        let deadline_timer = self.invocation.deadline.map(|deadline| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                token.cancel();
            })
        });

        match self.drive().await {
            Ok((RunEnd::Completed { values, checkpoint_id }, lineage_id)) => {
                tracing::info!(
                    invocation_id = %invocation_id,
                    lineage_id = %lineage_id,
                    "Run completed"
                );
                let state = State {
                    values,
                    lineage_id: Some(lineage_id.clone()),
                    checkpoint_id: checkpoint_id.clone(),
                    resume: None,
                };
                events
                    .emit(Event::Completed {
                        state,
                        lineage_id,
                        checkpoint_id,
                    })
                    .await;
            }
            Ok((RunEnd::Suspended, lineage_id)) => {
                tracing::info!(
                    invocation_id = %invocation_id,
                    lineage_id = %lineage_id,
                    "Run suspended"
                );
            }
            Err(error) => {
                tracing::error!(invocation_id = %invocation_id, error = %error, "Run failed");
                let node = match &error {
                    GraphError::NodeExecution { node, .. } | GraphError::NodeTimeout { node, .. } => {
                        Some(node.clone())
                    }
                    _ => None,
                };
                events
                    .emit(Event::Error {
                        node,
                        error: Arc::new(error),
                    })
                    .await;
            }
        }

        if let Some(timer) = deadline_timer {
            timer.abort();
        }
        token.cancel();
        registry.remove(&invocation_id).await;
    }

    async fn drive(self) -> Result<(RunEnd, String)> {
        let (lineage, origin) = LineageManager::open(
            self.options.checkpoint_store.clone(),
            self.options.engine,
            &self.invocation.id,
            self.events.clone(),
            self.request,
        )
        .await?;
        let lineage = lineage.with_tags(self.invocation.tags.clone());
        let lineage_id = lineage.lineage_id().to_string();
        let scheduler = scheduler::for_engine(self.options.engine);
        tracing::info!(
            invocation_id = %self.invocation.id,
            lineage_id = %lineage_id,
            engine = %scheduler.engine(),
            "Run started"
        );

        let mut run = RunContext {
            graph: self.graph,
            hooks: Arc::new(HookChain::new(self.options.hooks.clone())),
            options: self.options.clone(),
            events: self.events,
            lineage,
            cancel: self.token,
            deadline: self.invocation.deadline,
        };
        let end = scheduler.run(&mut run, origin, self.input).await?;
        Ok((end, lineage_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_follow_config() {
        let config = ExecutorConfig {
            engine: Engine::Dag,
            node_timeout_ms: Some(250),
            ..Default::default()
        };
        let options = ExecutorOptions::from_config(&config);
        assert_eq!(options.engine, Engine::Dag);
        assert_eq!(options.node_timeout, Some(Duration::from_millis(250)));
        assert!(options.retry.is_none());
    }

    #[test]
    fn test_options_validation() {
        assert!(ExecutorOptions::default().validate().is_ok());
        let err = ExecutorOptions::default()
            .with_max_concurrency(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
        assert!(ExecutorOptions::default()
            .with_node_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates_and_cancels() {
        let registry = RunRegistry::default();
        let token = CancellationToken::new();
        registry.register("run-1", token.clone()).await.unwrap();

        let err = registry
            .register("run-1", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Usage(_)));

        assert!(registry.cancel("run-1").await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel("run-2").await);

        registry.remove("run-1").await;
        assert!(registry.ids().await.is_empty());
    }

    #[test]
    fn test_invocation_builder() {
        let parent = CancellationToken::new();
        let invocation = Invocation::new()
            .with_id("inv-7")
            .with_tag("tenant", "acme")
            .with_cancellation(parent.clone());
        assert_eq!(invocation.id, "inv-7");
        assert_eq!(invocation.tags["tenant"], Value::from("acme"));
        parent.cancel();
        assert!(invocation.cancel.is_cancelled());
    }
}
