// rust/split-core/src/worker/mod.rs

//! Data workers.
//!
//! A [`Worker`] registers with the dispatcher, heartbeats on a background
//! thread and runs one task thread per job. Tasks execute the whole pipeline
//! locally; in distributed_epoch mode every source pulls its splits from the
//! dispatcher.

mod executor;
mod task;

pub use executor::execute_local;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::dispatcher::{DispatcherClient, WorkerRegistration};
use crate::error::{Result, SplitError};
use crate::pipeline::{Element, PipelineNode, ProcessingMode};
use executor::{ExecMode, TaskContext};
use task::TaskRun;

/// A registered worker and its running tasks.
pub struct Worker {
    config: WorkerConfig,
    client: Arc<dyn DispatcherClient>,
    registration: WorkerRegistration,
    /// Set on stop or eviction; every task thread checks it.
    stop: Arc<AtomicBool>,
    active_tasks: Arc<AtomicU32>,
    heartbeat_stop: Mutex<Option<Sender<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Registers with the dispatcher and starts heartbeating.
    pub fn start(client: Arc<dyn DispatcherClient>, config: WorkerConfig) -> Result<Self> {
        let registration = client.register_worker(None, &config.hostname)?;
        let stop = Arc::new(AtomicBool::new(false));
        let active_tasks = Arc::new(AtomicU32::new(0));
        let (stop_tx, stop_rx) = channel::bounded(1);

        let heartbeat = {
            let client = client.clone();
            let worker_id = registration.worker_id.clone();
            let token = registration.session_token.clone();
            let interval = Duration::from_millis(registration.heartbeat_interval_ms.max(1));
            let stop = stop.clone();
            let active = active_tasks.clone();
            thread::Builder::new()
                .name(format!("heartbeat-{}", registration.worker_index))
                .spawn(move || heartbeat_loop(client, worker_id, token, interval, stop, active, stop_rx))
                .map_err(|e| SplitError::execution(format!("failed to spawn heartbeat thread: {e}")))?
        };

        info!(
            worker_id = %registration.worker_id,
            worker_index = registration.worker_index,
            "Worker started"
        );

        Ok(Self {
            config,
            client,
            registration,
            stop,
            active_tasks,
            heartbeat_stop: Mutex::new(Some(stop_tx)),
            heartbeat: Mutex::new(Some(heartbeat)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.registration.worker_id
    }

    pub fn worker_index(&self) -> u32 {
        self.registration.worker_index
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    pub fn active_tasks(&self) -> u32 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    /// Starts a task producing `node` for `job_id`.
    ///
    /// The returned channel closes when the task ends.
    pub fn start_task(
        &self,
        job_id: &str,
        node: &PipelineNode,
        mode: ProcessingMode,
    ) -> Result<Receiver<Result<Element>>> {
        if !self.is_running() {
            return Err(SplitError::worker_unavailable(self.worker_id()));
        }

        let exec_mode = match mode {
            ProcessingMode::ParallelEpochs => ExecMode::Local,
            ProcessingMode::DistributedEpoch => ExecMode::Split(Arc::new(TaskContext {
                client: self.client.clone(),
                job_id: job_id.to_string(),
                worker_id: self.worker_id().to_string(),
                stop: self.stop.clone(),
                job_done: AtomicBool::new(false),
                empty_pass_backoff: Duration::from_millis(self.config.empty_pass_backoff_ms),
                max_empty_pass_backoff: Duration::from_millis(self.config.max_empty_pass_backoff_ms),
            })),
        };

        let run = TaskRun {
            job_id: job_id.to_string(),
            worker_id: self.worker_id().to_string(),
            node: node.clone(),
            mode: exec_mode,
            stop: self.stop.clone(),
            active: self.active_tasks.clone(),
            send_timeout: self.config.send_timeout(),
        };

        let (tx, rx) = channel::bounded(self.config.buffer_size.max(1));
        let handle = thread::Builder::new()
            .name(format!("task-{}", self.worker_index()))
            .spawn(move || run.run(tx))
            .map_err(|e| SplitError::execution(format!("failed to spawn task thread: {e}")))?;

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        debug!(worker_id = %self.worker_id(), job_id, ?mode, "Task scheduled");
        Ok(rx)
    }

    /// Stops every task, releases the worker's leases and waits for its
    /// threads. Idempotent.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::Relaxed) {
            self.join();
            return;
        }

        if let Err(e) = self.client.unregister_worker(self.worker_id()) {
            warn!(worker_id = %self.worker_id(), error = %e, "Failed to unregister worker");
        }

        // Dropping the sender wakes the heartbeat thread.
        self.heartbeat_stop.lock().take();
        self.join();
        info!(worker_id = %self.worker_id(), worker_index = self.worker_index(), "Worker stopped");
    }

    fn join(&self) {
        self.heartbeat_stop.lock().take();
        if let Some(handle) = self.heartbeat.lock().take() {
            let _ = handle.join();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in tasks {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn heartbeat_loop(
    client: Arc<dyn DispatcherClient>,
    worker_id: String,
    token: String,
    interval: Duration,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicU32>,
    stop_rx: Receiver<()>,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        if stop.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = client.heartbeat(&worker_id, &token, active.load(Ordering::Relaxed)) {
            warn!(worker_id = %worker_id, error = %e, "Heartbeat rejected; stopping worker");
            stop.store(true, Ordering::Relaxed);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::{Dispatcher, JobStatus};

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(DispatcherConfig {
            heartbeat_interval_ms: 10,
            ..DispatcherConfig::default()
        }))
    }

    fn sorted_ints(rx: Receiver<Result<Element>>) -> Vec<i64> {
        let mut out: Vec<i64> = rx.iter().map(|r| r.unwrap().as_int().unwrap()).collect();
        out.sort();
        out
    }

    #[test]
    fn test_worker_registers_and_heartbeats() {
        let d = dispatcher();
        let worker = Worker::start(d.clone(), WorkerConfig::default()).unwrap();
        assert_eq!(worker.worker_index(), 0);

        thread::sleep(Duration::from_millis(50));
        let info = d.worker_info(worker.worker_id()).unwrap();
        assert!(info.last_heartbeat_ms >= info.registered_at_ms);

        worker.stop();
        assert!(d.worker_info(worker.worker_id()).is_none());
        assert!(!worker.is_running());
    }

    #[test]
    fn test_single_worker_distributed_task() {
        let d = dispatcher();
        let worker = Worker::start(d.clone(), WorkerConfig::default()).unwrap();
        let node = PipelineNode::range(0, 20).repeat(3);
        let job = d.register_pipeline(&node, ProcessingMode::DistributedEpoch).unwrap();

        let rx = worker.start_task(&job, &node, ProcessingMode::DistributedEpoch).unwrap();
        let items: Vec<i64> = rx.iter().map(|r| r.unwrap().as_int().unwrap()).collect();
        let expected: Vec<i64> = (0..3).flat_map(|_| 0..20).collect();
        assert_eq!(items, expected);
        assert_eq!(d.job_status(&job).unwrap(), JobStatus::Finished);
    }

    #[test]
    fn test_two_workers_share_one_epoch() {
        let d = dispatcher();
        let a = Worker::start(d.clone(), WorkerConfig::default()).unwrap();
        let b = Worker::start(d.clone(), WorkerConfig::default()).unwrap();
        let node = PipelineNode::range(0, 100);
        let job = d.register_pipeline(&node, ProcessingMode::DistributedEpoch).unwrap();

        let rx_a = a.start_task(&job, &node, ProcessingMode::DistributedEpoch).unwrap();
        let rx_b = b.start_task(&job, &node, ProcessingMode::DistributedEpoch).unwrap();
        let mut all = sorted_ints(rx_a);
        all.extend(sorted_ints(rx_b));
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_parallel_epochs_task_produces_everything() {
        let d = dispatcher();
        let worker = Worker::start(d.clone(), WorkerConfig::default()).unwrap();
        let node = PipelineNode::range(0, 5);
        let job = d.register_pipeline(&node, ProcessingMode::ParallelEpochs).unwrap();

        let rx = worker.start_task(&job, &node, ProcessingMode::ParallelEpochs).unwrap();
        assert_eq!(sorted_ints(rx), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stopped_worker_rejects_tasks() {
        let d = dispatcher();
        let worker = Worker::start(d.clone(), WorkerConfig::default()).unwrap();
        worker.stop();
        worker.stop();

        let err = worker
            .start_task("job", &PipelineNode::range(0, 1), ProcessingMode::ParallelEpochs)
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_evicted_worker_stops_itself() {
        let d = dispatcher();
        let worker = Worker::start(d.clone(), WorkerConfig::default()).unwrap();
        d.release_on_disconnect(worker.worker_id());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
    }
}
