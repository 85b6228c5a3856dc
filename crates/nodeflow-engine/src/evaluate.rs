//! In-process evaluation: one unit of work per node, all interleaved on the
//! calling task. Units only suspend while waiting on an upstream latch or
//! on an async callable.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use nodeflow_core::error::{NodeError, Result};
use nodeflow_core::graph::{NodeInstance, NodeMap};
use nodeflow_core::types::{Kwargs, NodeId, NodeStatus, RunEvent};

use crate::latch::CompletionLatch;
use crate::runner::{latch_of, latches_for, JobRunner, Latches, NodeOutcome};

impl JobRunner {
    /// Evaluate every node of `nodes` in-process and return the mutated map.
    ///
    /// Independent nodes interleave in no particular order. A node waits for
    /// all of its upstream nodes; if any of them failed it is marked failed
    /// without calling its callable.
    pub async fn execute(&self, nodes: NodeMap) -> Result<NodeMap> {
        let latches = latches_for(&nodes);
        let count = nodes.len();
        self.publish(RunEvent::RunStarted {
            mode: self.mode().to_string(),
            nodes: count,
        });

        let units = nodes
            .into_iter()
            .map(|(node_id, node)| self.evaluate_node(node_id, node, &latches));
        let evaluated = try_join_all(units).await?;

        let failed = evaluated
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Failed)
            .count();
        info!(nodes = count, failed, "Run finished");
        self.publish(RunEvent::RunFinished {
            nodes: count,
            failed,
        });

        Ok(evaluated.into_iter().collect())
    }

    async fn evaluate_node(
        &self,
        node_id: NodeId,
        mut node: NodeInstance,
        latches: &Latches,
    ) -> Result<(NodeId, NodeInstance)> {
        self.set_status(&node_id, &mut node, NodeStatus::Started);
        let entry = self.registry.lookup(&node.node_type)?;
        let latch = latch_of(latches, &node_id)?;
        info!(node_id = %node_id, node_type = %node.node_type, "Evaluating node");

        node.result = None;
        node.result_mapped = Kwargs::new();
        node.error = None;

        let mut args = node.literal_args();
        let upstream: Vec<(String, NodeId, String)> = node
            .upstream()
            .map(|(port, conn)| (port.to_string(), conn.node_id.clone(), conn.port_name.clone()))
            .collect();

        if !upstream.is_empty() {
            let waits = upstream
                .iter()
                .map(|(_, source, _)| latch_of(latches, source))
                .collect::<Result<Vec<_>>>()?;

            self.set_status(&node_id, &mut node, NodeStatus::Deferred);
            debug!(node_id = %node_id, upstream = upstream.len(), "Waiting for upstream nodes");
            let outcomes = join_all(waits.into_iter().map(|l| l.wait())).await;
            self.set_status(&node_id, &mut node, NodeStatus::Started);

            for ((port, source, source_port), outcome) in upstream.iter().zip(outcomes) {
                if outcome.status == NodeStatus::Failed {
                    warn!(node_id = %node_id, upstream = %source, "Upstream node failed, skipping");
                    node.error = Some(NodeError::DependentNode(source.clone()));
                    return Ok(self.finish(node_id, node, latch, NodeStatus::Failed));
                }
                match outcome.result_mapped.get(source_port) {
                    Some(value) => {
                        args.insert(port.clone(), value.clone());
                    }
                    None => {
                        error!(node_id = %node_id, upstream = %source, port = %source_port, "Upstream has no such output");
                        node.error = Some(NodeError::Execution(format!(
                            "node {} has no output '{}'",
                            source, source_port
                        )));
                        return Ok(self.finish(node_id, node, latch, NodeStatus::Failed));
                    }
                }
            }
        }

        let call = AssertUnwindSafe(entry.callable.invoke(args)).catch_unwind();
        match call.await {
            Ok(Ok(value)) => {
                node.result_mapped = entry.map_outputs(&value);
                node.result = Some(value);
                Ok(self.finish(node_id, node, latch, NodeStatus::Finished))
            }
            Ok(Err(e)) => {
                error!(node_id = %node_id, error = %e, "Execution of node failed");
                node.error = Some(NodeError::execution(&e));
                Ok(self.finish(node_id, node, latch, NodeStatus::Failed))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(node_id = %node_id, panic = %message, "Node callable panicked");
                node.error = Some(NodeError::Execution(format!("callable panicked: {}", message)));
                Ok(self.finish(node_id, node, latch, NodeStatus::Failed))
            }
        }
    }

    /// Enter a terminal state and release dependents.
    fn finish(
        &self,
        node_id: NodeId,
        mut node: NodeInstance,
        latch: &CompletionLatch<Arc<NodeOutcome>>,
        status: NodeStatus,
    ) -> (NodeId, NodeInstance) {
        self.set_status(&node_id, &mut node, status);
        latch.signal(NodeOutcome::of(&node));
        debug!(node_id = %node_id, status = %status, "Node done");
        (node_id, node)
    }
}
