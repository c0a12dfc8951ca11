//! Master side of the cluster.
//!
//! [`MasterRegistry`] is the entry point: it accepts batches
//! ([`MasterRegistry::submit`]), serves worker connections
//! ([`MasterRegistry::serve_connection`]) and routes what workers report
//! back to the right [`Submission`]. [`MasterServer`] feeds it TCP
//! connections.

pub mod node_handle;
pub mod registry;
pub mod server;
pub mod status;
pub mod submission;

pub use node_handle::{EventRouter, NodeHandle};
pub use registry::MasterRegistry;
pub use server::MasterServer;
pub use status::{
    BatchState, ClusterStat, JobDetails, NoopStatusSink, StatusSink, TaskProgress, WorkerNode,
};
pub use submission::{BatchOutput, BatchRequest, Submission, TaskOutcome};
