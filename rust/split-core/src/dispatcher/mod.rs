// rust/split-core/src/dispatcher/mod.rs

//! Split dispatching for distributed_epoch jobs.
//!
//! This module owns the coordinator side of the service:
//!
//! - Worker registration, heartbeats and timeout eviction
//! - Split-provider trees built from registered pipelines
//! - Split leases, completion and redelivery after worker loss
//! - Job status and progress reporting

mod client;
pub mod protocol;
mod provider;
pub mod split;
mod state;

// Re-exports
pub use client::DispatcherClient;
pub use protocol::{JobProgress, JobStatus, WorkerInfo, WorkerRegistration};
pub use split::{calculate_splits, IndexRange, SourceId, Split, SplitRequest, SplitResponse};
pub use state::{Dispatcher, WorkerState};
