use serde::{Deserialize, Serialize};

/// Node identity within one node map.
pub type NodeId = String;

/// Keyword arguments handed to a node callable, keyed by input port name.
pub type Kwargs = serde_json::Map<String, serde_json::Value>;

/// Identifier assigned to a job by an external queue.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-node run state.
///
/// `idle -> started -> {deferred <-> started} -> finished | failed`.
/// `finished` and `failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Started,
    Deferred,
    Finished,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Deferred => "deferred",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published on the [`EventBus`](crate::event::EventBus) while a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A run began with this many nodes in its working set.
    RunStarted { mode: String, nodes: usize },
    /// A node moved through its state machine.
    NodeStatus { node_id: NodeId, status: NodeStatus },
    /// A node's job was accepted by an external queue.
    JobSubmitted { node_id: NodeId, job_id: JobId },
    /// Every unit of the run has returned.
    RunFinished { nodes: usize, failed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&NodeStatus::Deferred).unwrap();
        assert_eq!(json, r#""deferred""#);
        let parsed: NodeStatus = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(parsed, NodeStatus::Failed);
        assert!(parsed.is_terminal());
        assert!(!NodeStatus::Started.is_terminal());
    }

    #[test]
    fn job_id_is_transparent() {
        let id = JobId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""abc""#);
        assert_eq!(id.to_string(), "abc");
    }
}
