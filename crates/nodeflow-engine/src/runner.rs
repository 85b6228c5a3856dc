use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use nodeflow_core::config::RunnerConfig;
use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::event::EventBus;
use nodeflow_core::graph::{NodeInstance, NodeMap};
use nodeflow_core::queue::{JobHandle, JobQueue};
use nodeflow_core::registry::NodeTypeRegistry;
use nodeflow_core::types::{JobId, Kwargs, NodeId, NodeStatus, RunEvent};

use crate::latch::CompletionLatch;
use crate::resolver;
use crate::submit::JobSubmitter;

/// How a run is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Evaluate in-process and block until every node is terminal.
    Sync,
    /// Evaluate in-process, returning a future the caller drives.
    Async,
    /// Submit every node to an external queue and block until submitted.
    Distributed,
    /// Submit every node, returning a future the caller drives.
    AsyncDistributed,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Distributed => "distributed",
            Self::AsyncDistributed => "async_distributed",
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed | Self::AsyncDistributed)
    }

    /// Whether `run` hands back a future instead of blocking.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Async | Self::AsyncDistributed)
    }
}

impl FromStr for RunMode {
    type Err = NodeflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "distributed" => Ok(Self::Distributed),
            "async_distributed" => Ok(Self::AsyncDistributed),
            other => Err(NodeflowError::UnsupportedMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a node publishes to its dependents when it signals its latch.
#[derive(Debug, Clone)]
pub(crate) struct NodeOutcome {
    pub status: NodeStatus,
    pub result_mapped: Kwargs,
    pub job_id: Option<JobId>,
}

impl NodeOutcome {
    pub fn of(node: &NodeInstance) -> Arc<Self> {
        Arc::new(Self {
            status: node.status,
            result_mapped: node.result_mapped.clone(),
            job_id: node.job_id.clone(),
        })
    }
}

/// One latch per node of a run, keyed by node id.
pub(crate) type Latches = HashMap<NodeId, CompletionLatch<Arc<NodeOutcome>>>;

pub(crate) fn latches_for(nodes: &NodeMap) -> Latches {
    nodes
        .keys()
        .map(|id| (id.clone(), CompletionLatch::new()))
        .collect()
}

pub(crate) fn latch_of<'a>(
    latches: &'a Latches,
    node_id: &str,
) -> Result<&'a CompletionLatch<Arc<NodeOutcome>>> {
    latches
        .get(node_id)
        .ok_or_else(|| NodeflowError::UnknownNode(node_id.to_string()))
}

/// Result of [`JobRunner::run`].
pub enum RunOutput {
    /// The node map was empty; nothing was scheduled.
    Empty,
    /// The mutated node map. In distributed mode nodes carry job ids
    /// rather than results.
    Completed(NodeMap),
    /// Not yet started. Await it to get the mutated node map.
    Pending(BoxFuture<'static, Result<NodeMap>>),
    /// Same-worker run: one job whose result is the whole mutated map.
    Job(Arc<dyn JobHandle>),
    /// Same-worker run, not yet submitted.
    PendingJob(BoxFuture<'static, Result<Arc<dyn JobHandle>>>),
}

impl RunOutput {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The node map, driving a pending run to completion if needed.
    /// Job outputs yield `None`.
    pub async fn into_nodes(self) -> Result<Option<NodeMap>> {
        match self {
            Self::Completed(nodes) => Ok(Some(nodes)),
            Self::Pending(fut) => fut.await.map(Some),
            Self::Empty | Self::Job(_) | Self::PendingJob(_) => Ok(None),
        }
    }

    /// The same-worker job handle, submitting it first if needed.
    pub async fn into_job(self) -> Result<Option<Arc<dyn JobHandle>>> {
        match self {
            Self::Job(handle) => Ok(Some(handle)),
            Self::PendingJob(fut) => fut.await.map(Some),
            Self::Empty | Self::Completed(_) | Self::Pending(_) => Ok(None),
        }
    }
}

impl std::fmt::Debug for RunOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("RunOutput::Empty"),
            Self::Completed(nodes) => f
                .debug_tuple("RunOutput::Completed")
                .field(&nodes.len())
                .finish(),
            Self::Pending(_) => f.write_str("RunOutput::Pending"),
            Self::Job(handle) => f.debug_tuple("RunOutput::Job").field(handle.id()).finish(),
            Self::PendingJob(_) => f.write_str("RunOutput::PendingJob"),
        }
    }
}

/// Runs node maps against a registry.
///
/// Construct once with a mode (and, for distributed modes, a default
/// queue), then call [`run`](Self::run) per node map. Each run works on
/// its own copy of the map, so one runner can serve concurrent runs.
#[derive(Clone)]
pub struct JobRunner {
    pub(crate) registry: Arc<NodeTypeRegistry>,
    mode: String,
    same_worker: bool,
    pub(crate) default_queue: Option<Arc<dyn JobQueue>>,
    pub(crate) queues: HashMap<String, Arc<dyn JobQueue>>,
    pub(crate) submitters: HashMap<String, Arc<dyn JobSubmitter>>,
    pub(crate) meta_data: Kwargs,
    event_bus: Option<Arc<EventBus>>,
}

impl JobRunner {
    /// A sync-mode runner.
    pub fn new(registry: Arc<NodeTypeRegistry>) -> Self {
        Self {
            registry,
            mode: RunMode::Sync.as_str().to_string(),
            same_worker: false,
            default_queue: None,
            queues: HashMap::new(),
            submitters: HashMap::new(),
            meta_data: Kwargs::new(),
            event_bus: None,
        }
    }

    pub fn builder(registry: Arc<NodeTypeRegistry>) -> JobRunnerBuilder {
        JobRunnerBuilder::new(registry)
    }

    /// Build a runner from the `[runner]` config section.
    pub fn from_config(
        config: &RunnerConfig,
        registry: Arc<NodeTypeRegistry>,
        queue: Option<Arc<dyn JobQueue>>,
    ) -> Result<Self> {
        let mut builder = Self::builder(registry)
            .mode(config.mode.clone())
            .same_worker(config.same_worker)
            .meta_data(config.meta.clone());
        if let Some(queue) = queue {
            builder = builder.default_queue(queue);
        }
        builder.build()
    }

    /// The configured mode string, as given.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn registry(&self) -> &NodeTypeRegistry {
        &self.registry
    }

    /// Publish this runner's status events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run a node map.
    ///
    /// With `selected`, only those nodes and everything they depend on are
    /// run. Node-level failures are recorded on the nodes; only an unknown
    /// mode, a missing node type, a dangling connection or a queue failure
    /// is returned as an error.
    pub fn run(&self, nodes: NodeMap, selected: Option<&[NodeId]>) -> Result<RunOutput> {
        if nodes.is_empty() {
            return Ok(RunOutput::Empty);
        }
        let mode: RunMode = self.mode.parse()?;

        let runner = self.clone();
        // The same-worker job always carries the whole map.
        if self.same_worker && mode.is_distributed() {
            if selected.is_some_and(|ids| !ids.is_empty()) {
                info!(total = nodes.len(), "Selection ignored, submitting the whole map");
            }
            return match mode {
                RunMode::AsyncDistributed => Ok(RunOutput::PendingJob(Box::pin(async move {
                    runner.submit_same_worker(nodes).await
                }))),
                _ => block_on(self.submit_same_worker(nodes))?.map(RunOutput::Job),
            };
        }

        let working = match selected {
            Some(ids) if !ids.is_empty() => {
                info!(
                    selected = ids.len(),
                    total = nodes.len(),
                    mode = %mode,
                    "Running selected nodes"
                );
                let closure = resolver::resolve(ids, &nodes);
                info!(count = closure.len(), "Resolved dependency closure");
                resolver::select(nodes, &closure)
            }
            _ => {
                info!(count = nodes.len(), mode = %mode, "Running nodes");
                nodes
            }
        };

        match mode {
            RunMode::Sync => block_on(self.execute(working))?.map(RunOutput::Completed),
            RunMode::Async => Ok(RunOutput::Pending(Box::pin(async move {
                runner.execute(working).await
            }))),
            RunMode::Distributed => block_on(self.submit(working))?.map(RunOutput::Completed),
            RunMode::AsyncDistributed => Ok(RunOutput::Pending(Box::pin(async move {
                runner.submit(working).await
            }))),
        }
    }

    /// The same runner in sync mode, for nested in-process runs.
    pub(crate) fn in_process(&self) -> Self {
        let mut runner = self.clone();
        runner.mode = RunMode::Sync.as_str().to_string();
        runner.same_worker = false;
        runner
    }

    pub(crate) fn default_queue(&self) -> Result<Arc<dyn JobQueue>> {
        self.default_queue.clone().ok_or_else(|| {
            NodeflowError::Configuration(
                "distributed runs need a default queue".to_string(),
            )
        })
    }

    pub(crate) fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    pub(crate) fn set_status(&self, node_id: &str, node: &mut NodeInstance, status: NodeStatus) {
        node.status = status;
        self.publish(RunEvent::NodeStatus {
            node_id: node_id.to_string(),
            status,
        });
    }
}

/// Drive a future to completion on a fresh single-threaded runtime.
fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(NodeflowError::Runtime(
            "blocking modes cannot run inside an async runtime; use async or async_distributed"
                .to_string(),
        ));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(fut))
}

/// Builder for [`JobRunner`].
pub struct JobRunnerBuilder {
    registry: Arc<NodeTypeRegistry>,
    mode: String,
    same_worker: bool,
    default_queue: Option<Arc<dyn JobQueue>>,
    queues: HashMap<String, Arc<dyn JobQueue>>,
    submitters: HashMap<String, Arc<dyn JobSubmitter>>,
    meta_data: Kwargs,
    event_bus: Option<Arc<EventBus>>,
}

impl JobRunnerBuilder {
    pub fn new(registry: Arc<NodeTypeRegistry>) -> Self {
        Self {
            registry,
            mode: RunMode::Sync.as_str().to_string(),
            same_worker: false,
            default_queue: None,
            queues: HashMap::new(),
            submitters: HashMap::new(),
            meta_data: Kwargs::new(),
            event_bus: None,
        }
    }

    /// Set the mode. Unknown modes are reported by `run`, not here.
    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn same_worker(mut self, same_worker: bool) -> Self {
        self.same_worker = same_worker;
        self
    }

    /// Queue used by nodes without a `settings.queue` override.
    pub fn default_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.default_queue = Some(queue);
        self
    }

    /// Register a queue that nodes can select by name via `settings.queue`.
    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queues.insert(queue.name().to_string(), queue);
        self
    }

    /// Submit nodes of `node_type` through a custom submitter.
    pub fn submitter(mut self, node_type: impl Into<String>, submitter: impl JobSubmitter) -> Self {
        self.submitters.insert(node_type.into(), Arc::new(submitter));
        self
    }

    /// Metadata merged into every submitted job.
    pub fn meta_data(mut self, meta: Kwargs) -> Self {
        self.meta_data = meta;
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<JobRunner> {
        if let Ok(mode) = self.mode.parse::<RunMode>() {
            if mode.is_distributed() && self.default_queue.is_none() {
                return Err(NodeflowError::Configuration(format!(
                    "mode '{}' requires a default queue",
                    mode
                )));
            }
        }
        Ok(JobRunner {
            registry: self.registry,
            mode: self.mode,
            same_worker: self.same_worker,
            default_queue: self.default_queue,
            queues: self.queues,
            submitters: self.submitters,
            meta_data: self.meta_data,
            event_bus: self.event_bus,
        })
    }
}
