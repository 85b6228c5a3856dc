pub mod local;

pub use local::{LocalJob, LocalQueue};
