pub mod evaluate;
pub mod latch;
pub mod resolver;
pub mod runner;
pub mod submit;

pub use latch::CompletionLatch;
pub use resolver::{resolve, select};
pub use runner::{JobRunner, JobRunnerBuilder, RunMode, RunOutput};
pub use submit::{DefaultSubmitter, JobSubmitter, NodeSubmission};
