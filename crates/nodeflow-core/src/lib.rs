pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod queue;
pub mod registry;
pub mod types;

pub use config::AppConfig;
pub use error::{NodeError, NodeflowError, Result};
pub use event::EventBus;
pub use graph::{Connection, Connections, NodeInstance, NodeMap};
pub use queue::{JobHandle, JobMeta, JobPayload, JobQueue, JobRequest, JobStatus};
pub use registry::{CallableKind, NodeTypeEntry, NodeTypeRegistry};
pub use types::*;
