use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors. These abort a run (or a runner's construction) and are
/// returned to the caller.
#[derive(Debug, Error)]
pub enum NodeflowError {
    // Runner errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported mode: {0} (expected one of sync, async, distributed, async_distributed)")]
    UnsupportedMode(String),

    #[error("Node type not found: {0}")]
    NodeTypeNotFound(String),

    #[error("Node not found in node map: {0}")]
    UnknownNode(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    // Queue errors
    #[error("Queue error: {queue}: {message}")]
    Queue { queue: String, message: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NodeflowError>;

/// Node-local failure, recorded on the node instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum NodeError {
    /// The node's own callable returned an error.
    #[error("{0}")]
    Execution(String),

    /// A required upstream node failed, so this node never ran.
    /// Carries the upstream node id.
    #[error("Error in node {0}")]
    DependentNode(String),
}

impl NodeError {
    pub fn execution(err: &anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line
        Self::Execution(format!("{:#}", err))
    }

    pub fn is_dependent(&self) -> bool {
        matches!(self, Self::DependentNode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_error_wire_format() {
        let err = NodeError::DependentNode("node_1".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "dependent_node", "message": "node_1"})
        );
        assert_eq!(err.to_string(), "Error in node node_1");
    }

    #[test]
    fn execution_error_keeps_context() {
        let err = anyhow::anyhow!("division by zero").context("divide failed");
        let node_err = NodeError::execution(&err);
        assert_eq!(
            node_err,
            NodeError::Execution("divide failed: division by zero".into())
        );
        assert!(!node_err.is_dependent());
    }
}
