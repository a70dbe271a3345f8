// rust/split-core/src/cluster.rs

//! In-process service cluster.
//!
//! This module provides the `Cluster` struct that ties together a dispatcher,
//! a pool of workers and a timeout sweeper, and the `DistributedDataset`
//! handle used to read a pipeline through them.
//!
//! # Example
//!
//! ```no_run
//! use split_core::{Cluster, PipelineNode, ProcessingMode};
//!
//! let cluster = Cluster::new(2).unwrap();
//! let ds = cluster.distribute(PipelineNode::range(0, 100), ProcessingMode::DistributedEpoch);
//!
//! let mut seen = 0;
//! for element in ds.iter().unwrap() {
//!     let _ = element.unwrap();
//!     seen += 1;
//! }
//! assert_eq!(seen, 100);
//! ```

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::client::ElementStream;
use crate::config::ServiceConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, SplitError};
use crate::pipeline::{Element, ElementIter, PipelineNode, ProcessingMode, ServiceSource};
use crate::worker::Worker;

struct ClusterState {
    config: ServiceConfig,
    dispatcher: Arc<Dispatcher>,
    workers: RwLock<Vec<Arc<Worker>>>,
}

/// A dispatcher with its workers, all running in this process.
///
/// The `Cluster` owns every thread it starts and provides methods for:
/// - Stopping and adding workers
/// - Distributing pipelines in either processing mode
/// - Accessing the dispatcher for status and progress
pub struct Cluster {
    state: Arc<ClusterState>,
    sweeper_stop: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Creates a cluster with default configuration and `num_workers` workers.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker cannot be started.
    pub fn new(num_workers: usize) -> Result<Self> {
        Self::from_config(ServiceConfig::default(), num_workers)
    }

    /// Creates a cluster from a configuration file.
    ///
    /// The configuration file should be in TOML format. Environment variable
    /// overrides are applied after loading the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(path: impl AsRef<Path>, num_workers: usize) -> Result<Self> {
        let config = ServiceConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config, num_workers)
    }

    /// Creates a cluster from a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a worker cannot
    /// be started.
    pub fn from_config(config: ServiceConfig, num_workers: usize) -> Result<Self> {
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone()));
        let state = Arc::new(ClusterState {
            config,
            dispatcher,
            workers: RwLock::new(Vec::with_capacity(num_workers)),
        });

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let sweeper = {
            let dispatcher = state.dispatcher.clone();
            let interval = state.config.dispatcher.sweep_interval();
            thread::Builder::new()
                .name("timeout-sweeper".to_string())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            dispatcher.check_worker_timeouts();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                })
                .map_err(|e| SplitError::execution(format!("failed to spawn sweeper thread: {e}")))?
        };

        let cluster = Self {
            state,
            sweeper_stop: Mutex::new(Some(stop_tx)),
            sweeper: Mutex::new(Some(sweeper)),
        };
        for _ in 0..num_workers {
            cluster.add_worker()?;
        }

        info!(num_workers, "Cluster started");
        Ok(cluster)
    }

    /// Starts one more worker and returns its position.
    ///
    /// New workers serve jobs distributed after they joined.
    pub fn add_worker(&self) -> Result<usize> {
        let worker = Worker::start(
            self.state.dispatcher.clone(),
            self.state.config.worker.clone(),
        )?;
        let mut workers = self.state.workers.write();
        workers.push(Arc::new(worker));
        Ok(workers.len() - 1)
    }

    /// Stops the worker at position `index`. Its leased splits go back to
    /// the dispatcher's pending pools.
    ///
    /// # Errors
    ///
    /// Returns an error if no worker has that position.
    pub fn stop_worker(&self, index: usize) -> Result<()> {
        let worker = self
            .state
            .workers
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| SplitError::worker_unavailable(format!("#{index}")))?;
        worker.stop();
        Ok(())
    }

    /// Returns the worker at position `index`.
    pub fn worker(&self, index: usize) -> Option<Arc<Worker>> {
        self.state.workers.read().get(index).cloned()
    }

    /// Number of workers ever started, stopped ones included.
    pub fn num_workers(&self) -> usize {
        self.state.workers.read().len()
    }

    /// Number of workers that have not been stopped.
    pub fn live_workers(&self) -> usize {
        self.state
            .workers
            .read()
            .iter()
            .filter(|w| w.is_running())
            .count()
    }

    /// Wraps `node` for reading through this cluster.
    pub fn distribute(&self, node: PipelineNode, mode: ProcessingMode) -> DistributedDataset {
        DistributedDataset {
            cluster: self.state.clone(),
            node,
            mode,
        }
    }

    /// Returns a reference to the dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.state.dispatcher
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.state.config
    }

    /// Stops the sweeper and every worker.
    pub fn shutdown(&self) {
        self.sweeper_stop.lock().take();
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        let workers: Vec<_> = self.state.workers.read().clone();
        for worker in workers {
            worker.stop();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A pipeline bound to a cluster and a processing mode.
///
/// Every call to [`iter`](Self::iter) registers a new job.
#[derive(Clone)]
pub struct DistributedDataset {
    cluster: Arc<ClusterState>,
    node: PipelineNode,
    mode: ProcessingMode,
}

impl std::fmt::Debug for DistributedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedDataset")
            .field("node", &self.node)
            .field("mode", &self.mode)
            .finish()
    }
}

impl DistributedDataset {
    pub fn node(&self) -> &PipelineNode {
        &self.node
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// Registers the pipeline and starts a task on every live worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is rejected (for example
    /// `UnsupportedTopology` for a nested service under distributed_epoch)
    /// or no worker is available.
    pub fn iter(&self) -> Result<ElementStream> {
        let state = &self.cluster;
        let job_id = state.dispatcher.register_pipeline(&self.node, self.mode)?;

        let workers: Vec<_> = state
            .workers
            .read()
            .iter()
            .filter(|w| w.is_running())
            .cloned()
            .collect();

        let mut receivers = Vec::with_capacity(workers.len());
        for worker in &workers {
            match worker.start_task(&job_id, &self.node, self.mode) {
                Ok(rx) => receivers.push(rx),
                Err(e) if e.is_transient() => {
                    warn!(job_id = %job_id, worker_id = %worker.worker_id(), "Skipping stopped worker");
                }
                Err(e) => {
                    state.dispatcher.remove_job(&job_id);
                    return Err(e);
                }
            }
        }

        if receivers.is_empty() {
            state.dispatcher.remove_job(&job_id);
            return Err(SplitError::job_failed(job_id, "no live worker to run the job"));
        }

        Ok(ElementStream::new(
            job_id,
            state.dispatcher.clone(),
            receivers,
            state.config.client.stall_deadline(),
        ))
    }

    /// Reads the whole dataset, failing on the first error.
    pub fn collect(&self) -> Result<Vec<Element>> {
        self.iter()?.collect()
    }

    /// Exposes this dataset as a pipeline source, so that it can be read
    /// from inside another job.
    pub fn as_node(&self) -> PipelineNode {
        let ds = self.clone();
        let name = format!("{:?} job over {}", self.mode, self.node.kind_name());
        PipelineNode::data_service(ServiceSource::new(name, move || {
            Ok(Box::new(ds.iter()?) as ElementIter)
        }))
    }
}
