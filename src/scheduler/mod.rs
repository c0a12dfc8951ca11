pub mod job;
pub mod queue;

pub use job::{expand_tasks, total_tasks, Job, TaskSpec};
pub use queue::JobQueue;
