// rust/split-core/src/worker/task.rs

//! Task threads: one per (worker, job), streaming elements to the client.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{SendTimeoutError, Sender};
use tracing::{debug, warn};

use super::executor::{self, ExecMode};
use crate::error::Result;
use crate::pipeline::{Element, PipelineNode};

/// Keeps the worker's active task count in step with running task threads.
struct ActiveTask(Arc<AtomicU32>);

impl ActiveTask {
    fn enter(counter: Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) struct TaskRun {
    pub(crate) job_id: String,
    pub(crate) worker_id: String,
    pub(crate) node: PipelineNode,
    pub(crate) mode: ExecMode,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) active: Arc<AtomicU32>,
    pub(crate) send_timeout: Duration,
}

impl TaskRun {
    /// Executes the pipeline until it ends, the worker stops or the client
    /// goes away.
    pub(crate) fn run(self, tx: Sender<Result<Element>>) {
        let _active = ActiveTask::enter(self.active.clone());
        debug!(job_id = %self.job_id, worker_id = %self.worker_id, "Task started");

        let mut next_source = 0;
        let iter = match executor::build(&self.node, &self.mode, &mut next_source, &[]) {
            Ok(iter) => iter,
            Err(e) => {
                self.send(&tx, Err(e));
                return;
            }
        };

        let mut produced = 0u64;
        for item in iter {
            if let Err(e) = &item {
                if e.is_transient() {
                    warn!(job_id = %self.job_id, worker_id = %self.worker_id, error = %e, "Task lost its worker session");
                    break;
                }
            }
            if !self.send(&tx, item) {
                break;
            }
            produced += 1;
        }

        debug!(job_id = %self.job_id, worker_id = %self.worker_id, produced, "Task finished");
    }

    /// Blocks until the item is queued. Returns `false` when the client is
    /// gone or the worker was stopped while the channel was full.
    fn send(&self, tx: &Sender<Result<Element>>, item: Result<Element>) -> bool {
        let mut item = item;
        loop {
            match tx.send_timeout(item, self.send_timeout) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}
