//! Ready queues and per-core scheduling state.

pub mod queue;
pub mod scheduler;

pub use queue::MultiLevelQueue;
pub use scheduler::{GlobalScheduler, Scheduler};
