//! Contract for external job queues.
//!
//! The engine only ever talks to a queue through [`JobQueue::submit`] and
//! [`JobQueue::fetch`], and only inspects jobs through [`JobHandle`].
//! Scheduling, retries and execution order after submission belong to the
//! queue.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::graph::Connections;
use crate::registry::{map_outputs, NodeTypeEntry};
use crate::types::{JobId, Kwargs, NodeId};

/// Lifecycle of a job inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    /// Waiting on `depends_on` jobs.
    Deferred,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Metadata attached to a submitted node job.
///
/// The worker uses `node_connections` to find, for each input port, which
/// upstream job result to read, and `result_keys` to key its own result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_connections: Option<Connections>,
    #[serde(default = "default_result_keys")]
    pub result_keys: Vec<String>,
    /// Caller-supplied metadata.
    #[serde(flatten)]
    pub extra: Kwargs,
}

fn default_result_keys() -> Vec<String> {
    vec!["result".to_string()]
}

/// An opaque unit of work run by the queue as-is.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// What a job executes.
#[derive(Clone)]
pub enum JobPayload {
    /// A registered node callable, invoked with the job's kwargs plus the
    /// connection-derived values the worker resolves at run time.
    Node {
        node_type: String,
        entry: NodeTypeEntry,
    },
    /// A self-contained task. Kwargs are ignored.
    Task { name: String, run: TaskFn },
}

impl JobPayload {
    pub fn name(&self) -> &str {
        match self {
            Self::Node { node_type, .. } => node_type,
            Self::Task { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node { node_type, .. } => f
                .debug_struct("JobPayload::Node")
                .field("node_type", node_type)
                .finish(),
            Self::Task { name, .. } => f
                .debug_struct("JobPayload::Task")
                .field("name", name)
                .finish(),
        }
    }
}

/// A submission to a [`JobQueue`].
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub payload: JobPayload,
    /// Literal keyword arguments known at submission time.
    pub kwargs: Kwargs,
    /// Jobs that must finish before this one may run.
    pub depends_on: Vec<JobId>,
    pub meta: JobMeta,
    /// Queue-specific options (timeouts, priorities, ...), passed through.
    pub options: Kwargs,
}

impl JobRequest {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            kwargs: Kwargs::new(),
            depends_on: Vec::new(),
            meta: JobMeta::default(),
            options: Kwargs::new(),
        }
    }
}

/// A job accepted by a queue.
pub trait JobHandle: Send + Sync + std::fmt::Debug + 'static {
    fn id(&self) -> &JobId;

    fn status(&self) -> JobStatus;

    /// Raw return value, once finished.
    fn result(&self) -> Option<Value>;

    /// Failure message, once failed.
    fn error(&self) -> Option<String>;

    fn meta(&self) -> JobMeta;

    /// Result keyed by the job's `result_keys`.
    fn result_mapped(&self) -> Option<Kwargs> {
        self.result()
            .map(|value| map_outputs(&value, &self.meta().result_keys))
    }
}

/// External job queue.
pub trait JobQueue: Send + Sync + 'static {
    /// Queue name, used in logs and node `settings.queue`.
    fn name(&self) -> &str;

    /// Accept a job. Must not run it before every `depends_on` job finished.
    fn submit(&self, request: JobRequest) -> BoxFuture<'_, Result<Arc<dyn JobHandle>>>;

    /// Look up a previously submitted job.
    fn fetch<'a>(&'a self, job_id: &'a JobId) -> BoxFuture<'a, Result<Arc<dyn JobHandle>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_flattens_extra_keys() {
        let mut extra = Kwargs::new();
        extra.insert("owner".into(), json!("editor"));
        let meta = JobMeta {
            node_id: Some("node_1".into()),
            node_connections: None,
            result_keys: vec!["sum".into(), "product".into()],
            extra,
        };

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["owner"], json!("editor"));
        assert_eq!(json["result_keys"], json!(["sum", "product"]));

        let parsed: JobMeta = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn meta_defaults_to_single_result_key() {
        let meta: JobMeta = serde_json::from_value(json!({})).unwrap();
        assert_eq!(meta.result_keys, vec!["result"]);
    }

    #[test]
    fn terminal_job_states() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Deferred.is_terminal());
    }
}
