//! Distributed runs: every node becomes a job on an external queue.
//!
//! Nodes are submitted in dependency order. A node waits only until each
//! upstream node has a job id, then submits with those ids as explicit
//! dependencies. Execution order after that is the queue's business.

use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use serde_json::Value;
use tracing::{debug, info};

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::graph::{to_wire, Connections, NodeInstance, NodeMap};
use nodeflow_core::queue::{JobHandle, JobMeta, JobPayload, JobQueue, JobRequest, TaskFn};
use nodeflow_core::registry::NodeTypeEntry;
use nodeflow_core::types::{JobId, Kwargs, NodeId, NodeStatus, RunEvent};

use crate::runner::{latch_of, latches_for, JobRunner, Latches, NodeOutcome};

/// Everything needed to enqueue one node.
#[derive(Debug, Clone)]
pub struct NodeSubmission {
    pub node_id: NodeId,
    pub node_type: String,
    pub entry: NodeTypeEntry,
    /// The node's connections, with upstream job ids filled in.
    pub connections: Connections,
    /// Literal arguments only; connection values are resolved by the worker.
    pub kwargs: Kwargs,
    pub depends_on: Vec<JobId>,
    /// Remaining `settings` keys, passed through as queue options.
    pub options: Kwargs,
    /// Runner-wide metadata.
    pub meta_data: Kwargs,
}

impl NodeSubmission {
    /// The request [`DefaultSubmitter`] sends.
    pub fn into_request(self) -> JobRequest {
        let meta = JobMeta {
            node_id: Some(self.node_id),
            node_connections: Some(self.connections),
            result_keys: self.entry.outputs.clone(),
            extra: self.meta_data,
        };
        JobRequest {
            payload: JobPayload::Node {
                node_type: self.node_type,
                entry: self.entry,
            },
            kwargs: self.kwargs,
            depends_on: self.depends_on,
            meta,
            options: self.options,
        }
    }
}

/// Enqueues a node job. Registered per node type to take control of how
/// jobs land on the queue.
pub trait JobSubmitter: Send + Sync + 'static {
    fn submit(
        &self,
        queue: Arc<dyn JobQueue>,
        job: NodeSubmission,
    ) -> BoxFuture<'_, Result<Arc<dyn JobHandle>>>;
}

/// Submits [`NodeSubmission::into_request`] unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSubmitter;

impl JobSubmitter for DefaultSubmitter {
    fn submit(
        &self,
        queue: Arc<dyn JobQueue>,
        job: NodeSubmission,
    ) -> BoxFuture<'_, Result<Arc<dyn JobHandle>>> {
        Box::pin(async move { queue.submit(job.into_request()).await })
    }
}

impl JobRunner {
    /// Submit every node of `nodes` and return the map with job ids and
    /// handles attached.
    pub async fn submit(&self, nodes: NodeMap) -> Result<NodeMap> {
        self.default_queue()?;
        let latches = latches_for(&nodes);
        let count = nodes.len();
        self.publish(RunEvent::RunStarted {
            mode: self.mode().to_string(),
            nodes: count,
        });

        let units = nodes
            .into_iter()
            .map(|(node_id, node)| self.submit_node_job(node_id, node, &latches));
        let submitted = try_join_all(units).await?;

        info!(nodes = count, "All nodes submitted");
        self.publish(RunEvent::RunFinished {
            nodes: count,
            failed: 0,
        });
        Ok(submitted.into_iter().collect())
    }

    async fn submit_node_job(
        &self,
        node_id: NodeId,
        mut node: NodeInstance,
        latches: &Latches,
    ) -> Result<(NodeId, NodeInstance)> {
        let latch = latch_of(latches, &node_id)?;
        if let Some(job_id) = &node.job_id {
            debug!(node_id = %node_id, job_id = %job_id, "Node already submitted");
            latch.signal(NodeOutcome::of(&node));
            return Ok((node_id, node));
        }

        self.set_status(&node_id, &mut node, NodeStatus::Started);
        let entry = self.registry.lookup(&node.node_type)?.clone();
        let kwargs = node.literal_args();

        let mut depends_on: Vec<JobId> = Vec::new();
        if node.upstream().next().is_some() {
            self.set_status(&node_id, &mut node, NodeStatus::Deferred);
        }
        for conns in node.connections.inputs.values_mut() {
            let Some(conn) = conns.first_mut() else {
                continue;
            };
            let upstream = latch_of(latches, &conn.node_id)?;
            info!(node_id = %node_id, upstream = %conn.node_id, "Waiting for upstream node to be submitted");
            let outcome = upstream.wait().await;
            if let Some(job_id) = &outcome.job_id {
                conn.job_id = Some(job_id.clone());
                if !depends_on.contains(job_id) {
                    depends_on.push(job_id.clone());
                }
            }
        }
        if node.status == NodeStatus::Deferred {
            self.set_status(&node_id, &mut node, NodeStatus::Started);
        }

        let mut options = node.settings.clone().unwrap_or_default();
        let queue = self.queue_for(&node_id, options.remove("queue"))?;
        extra_dependencies(&node_id, options.remove("depends_on"), &mut depends_on)?;

        let submission = NodeSubmission {
            node_id: node_id.clone(),
            node_type: node.node_type.clone(),
            entry,
            connections: node.connections.clone(),
            kwargs,
            depends_on,
            options,
            meta_data: self.meta_data.clone(),
        };
        let handle = match self.submitters.get(&node.node_type) {
            Some(custom) => custom.submit(queue.clone(), submission).await?,
            None => DefaultSubmitter.submit(queue.clone(), submission).await?,
        };

        let job_id = handle.id().clone();
        info!(node_id = %node_id, job_id = %job_id, queue = queue.name(), "Node submitted");
        for conns in node.connections.outputs.values_mut() {
            for conn in conns {
                conn.job_id = Some(job_id.clone());
            }
        }
        node.job_id = Some(job_id.clone());
        node.job = Some(handle);
        self.publish(RunEvent::JobSubmitted {
            node_id: node_id.clone(),
            job_id,
        });

        latch.signal(NodeOutcome::of(&node));
        Ok((node_id, node))
    }

    /// Resolve `settings.queue` to a registered queue, or the default one.
    fn queue_for(&self, node_id: &str, setting: Option<Value>) -> Result<Arc<dyn JobQueue>> {
        match setting {
            None | Some(Value::Null) => self.default_queue(),
            Some(Value::String(name)) => self.queues.get(&name).cloned().ok_or_else(|| {
                NodeflowError::Configuration(format!(
                    "node {} selects unknown queue '{}'",
                    node_id, name
                ))
            }),
            Some(other) => Err(NodeflowError::Configuration(format!(
                "node {}: settings.queue must be a queue name, got {}",
                node_id, other
            ))),
        }
    }

    /// Submit the whole in-process run as a single job.
    ///
    /// The job's result is the mutated node map in wire form.
    pub async fn submit_same_worker(&self, nodes: NodeMap) -> Result<Arc<dyn JobHandle>> {
        let queue = self.default_queue()?;
        let runner = self.in_process();
        let nodes = Arc::new(nodes);
        let run: TaskFn = Arc::new(move || -> BoxFuture<'static, anyhow::Result<Value>> {
            let runner = runner.clone();
            let nodes = NodeMap::clone(&nodes);
            Box::pin(async move {
                let evaluated = runner.execute(nodes).await?;
                let wire = to_wire(&evaluated)?;
                Ok::<_, anyhow::Error>(wire)
            })
        });

        let mut request = JobRequest::new(JobPayload::Task {
            name: "same_worker_run".to_string(),
            run,
        });
        request.meta.result_keys = vec!["result".to_string()];
        request.meta.extra = self.meta_data.clone();

        let handle = queue.submit(request).await?;
        info!(job_id = %handle.id(), queue = queue.name(), "Run submitted as a single job");
        Ok(handle)
    }
}

/// Append `settings.depends_on` job ids, which may be one id or a list.
fn extra_dependencies(node_id: &str, setting: Option<Value>, deps: &mut Vec<JobId>) -> Result<()> {
    let ids = match setting {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::String(id)) => vec![Value::String(id)],
        Some(Value::Array(ids)) => ids,
        Some(other) => {
            return Err(NodeflowError::Configuration(format!(
                "node {}: settings.depends_on must be a job id or a list of job ids, got {}",
                node_id, other
            )))
        }
    };
    for id in ids {
        let Value::String(id) = id else {
            return Err(NodeflowError::Configuration(format!(
                "node {}: settings.depends_on entries must be strings",
                node_id
            )));
        };
        let id = JobId(id);
        if !deps.contains(&id) {
            deps.push(id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::queue::JobStatus;
    use nodeflow_queue::LocalQueue;
    use nodeflow_test_utils::{add_registry, five_node_graph, node_map};
    use serde_json::json;

    fn runner(queue: Arc<LocalQueue>) -> JobRunner {
        JobRunner::builder(Arc::new(add_registry()))
            .mode("async_distributed")
            .default_queue(queue)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn submitted_nodes_carry_job_ids() {
        let queue = Arc::new(LocalQueue::default());
        let out = runner(queue.clone()).submit(five_node_graph()).await.unwrap();

        for node in out.values() {
            let job_id = node.job_id.as_ref().unwrap();
            assert!(queue.get(job_id).await.is_some());
        }
        let upstream = out["node_1"].job_id.clone();
        assert_eq!(out["node_2"].connections.inputs["b"][0].job_id, upstream);
    }

    #[tokio::test]
    async fn same_worker_fatal_error_fails_the_job() {
        let queue = Arc::new(LocalQueue::default());
        let nodes = node_map(vec![NodeInstance::new("n", "no_such_type")]);
        let job = runner(queue).submit_same_worker(nodes).await.unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().contains("no_such_type"));
    }

    #[tokio::test]
    async fn submit_without_queue_is_a_configuration_error() {
        let runner = JobRunner::new(Arc::new(add_registry()));
        let err = runner.submit(five_node_graph()).await.unwrap_err();
        assert!(matches!(err, NodeflowError::Configuration(_)));
    }

    #[test]
    fn depends_on_accepts_one_or_many() {
        let mut deps = vec![JobId::from("a")];
        extra_dependencies("n", Some(json!("b")), &mut deps).unwrap();
        extra_dependencies("n", Some(json!(["a", "c"])), &mut deps).unwrap();
        extra_dependencies("n", None, &mut deps).unwrap();
        assert_eq!(deps, vec![JobId::from("a"), JobId::from("b"), JobId::from("c")]);
    }

    #[test]
    fn depends_on_rejects_non_strings() {
        let mut deps = Vec::new();
        assert!(matches!(
            extra_dependencies("n", Some(json!(3)), &mut deps),
            Err(NodeflowError::Configuration(_))
        ));
        assert!(matches!(
            extra_dependencies("n", Some(json!([1])), &mut deps),
            Err(NodeflowError::Configuration(_))
        ));
    }
}
