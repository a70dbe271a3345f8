// rust/split-core/src/lib.rs

//! Distributed-epoch split service - core library
//!
//! This crate lets a pool of workers jointly produce every element of an
//! input pipeline exactly once per epoch. It provides pipeline definitions,
//! the split-provider dispatcher, workers, client-side stream merging and an
//! in-process cluster tying them together.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::ServiceConfig;
pub use error::{Result, SplitError};

pub mod pipeline;
pub use pipeline::{Element, PipelineNode, PipelineSpec, ProcessingMode};

pub mod dispatcher;
pub use dispatcher::{Dispatcher, DispatcherClient, JobStatus, Split, SplitRequest, SplitResponse};

pub mod worker;
pub use worker::{execute_local, Worker};

pub mod client;
pub use client::ElementStream;

pub mod cluster;
pub use cluster::{Cluster, DistributedDataset};
