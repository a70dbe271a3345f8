// rust/split-core/src/dispatcher/state.rs

//! In-memory dispatcher state.
//!
//! Lock order is always worker table, then job table, then a job's mutex.
//! Split issuance holds the worker table's read lock so that a concurrent
//! eviction cannot leave a lease behind for a worker that is already gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{JobProgress, JobStatus, WorkerInfo, WorkerRegistration};
use super::provider::ProviderTree;
use super::split::{Split, SplitRequest, SplitResponse};
use crate::config::DispatcherConfig;
use crate::error::{Result, SplitError};
use crate::pipeline::{PipelineNode, ProcessingMode};

/// Worker state tracked by the dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub worker_id: String,
    pub worker_index: u32,
    pub session_token: String,
    pub hostname: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub last_heartbeat_time: DateTime<Utc>,
    pub active_tasks: u32,
}

impl WorkerState {
    pub fn new(worker_id: String, worker_index: u32, hostname: String) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            worker_index,
            session_token: Uuid::new_v4().to_string(),
            hostname,
            registered_at: now,
            last_heartbeat: Instant::now(),
            last_heartbeat_time: now,
            active_tasks: 0,
        }
    }

    pub fn update_heartbeat(&mut self, active_tasks: u32) {
        self.last_heartbeat = Instant::now();
        self.last_heartbeat_time = Utc::now();
        self.active_tasks = active_tasks;
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() > timeout
    }

    pub fn to_worker_info(&self, leased_splits: usize) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id.clone(),
            worker_index: self.worker_index,
            hostname: self.hostname.clone(),
            registered_at_ms: self.registered_at.timestamp_millis(),
            last_heartbeat_ms: self.last_heartbeat_time.timestamp_millis(),
            active_tasks: self.active_tasks,
            leased_splits,
        }
    }
}

/// Split bookkeeping for one registered pipeline.
#[derive(Debug)]
pub(crate) struct JobState {
    job_id: String,
    mode: ProcessingMode,
    /// `None` in parallel_epochs mode.
    providers: Option<ProviderTree>,
    /// Outstanding splits per worker, keyed by split id.
    leases: HashMap<String, HashMap<u64, Split>>,
    next_split_id: u64,
    splits_issued: u64,
    splits_completed: u64,
    cancelled: bool,
    failure: Option<String>,
}

impl JobState {
    fn new(job_id: String, mode: ProcessingMode, providers: Option<ProviderTree>) -> Self {
        Self {
            job_id,
            mode,
            providers,
            leases: HashMap::new(),
            next_split_id: 0,
            splits_issued: 0,
            splits_completed: 0,
            cancelled: false,
            failure: None,
        }
    }

    fn next_split(&mut self, worker_id: &str, request: &SplitRequest) -> Result<SplitResponse> {
        if self.cancelled || self.failure.is_some() {
            return Ok(SplitResponse::EndOfJob);
        }

        let providers = self.providers.as_mut().ok_or_else(|| {
            SplitError::invalid_pipeline(format!(
                "job '{}' runs in {:?} mode and has no split providers",
                self.job_id, self.mode
            ))
        })?;

        let answer = providers.next(request, &mut self.next_split_id);
        let exhausted = matches!(answer, Ok(None)) && providers.path_exhausted(request.source);

        match answer {
            Ok(Some(split)) => {
                self.splits_issued += 1;
                self.leases
                    .entry(worker_id.to_string())
                    .or_default()
                    .insert(split.id, split.clone());
                Ok(SplitResponse::Split(split))
            }
            Ok(None) if exhausted && self.awaits_redelivery(worker_id, request) => {
                Ok(SplitResponse::Retry)
            }
            Ok(None) if exhausted => Ok(SplitResponse::EndOfJob),
            Ok(None) => Ok(SplitResponse::EndOfEpoch),
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Split provider failed; marking job failed");
                self.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn complete(&mut self, worker_id: &str, split_id: u64) -> bool {
        let removed = self
            .leases
            .get_mut(worker_id)
            .and_then(|lease| lease.remove(&split_id))
            .is_some();
        if removed {
            self.splits_completed += 1;
        }
        removed
    }

    /// Returns the worker's outstanding splits to their pending pools.
    fn release(&mut self, worker_id: &str) -> usize {
        let Some(lease) = self.leases.remove(worker_id) else {
            return 0;
        };
        let Some(providers) = self.providers.as_mut() else {
            return 0;
        };

        let mut splits: Vec<Split> = lease.into_values().collect();
        splits.sort_by_key(|s| s.id);
        let count = splits.len();
        for split in splits {
            if !providers.requeue(split) {
                warn!(job_id = %self.job_id, "Released split has no owning source");
            }
        }
        count
    }

    /// Whether `worker_id`, holding nothing itself, should keep asking for
    /// `request.source` because another worker still holds a split of it.
    /// Such a split returns to the pool if its holder is lost.
    fn awaits_redelivery(&self, worker_id: &str, request: &SplitRequest) -> bool {
        self.leased_by(worker_id) == 0
            && self.leases.iter().any(|(holder, lease)| {
                holder != worker_id && lease.values().any(|split| split.source == request.source)
            })
    }

    fn leased(&self) -> usize {
        self.leases.values().map(HashMap::len).sum()
    }

    fn leased_by(&self, worker_id: &str) -> usize {
        self.leases.get(worker_id).map_or(0, HashMap::len)
    }

    fn status(&self) -> JobStatus {
        if let Some(reason) = &self.failure {
            return JobStatus::Failed {
                reason: reason.clone(),
            };
        }
        if self.cancelled {
            return JobStatus::Cancelled;
        }
        match &self.providers {
            Some(p) if p.is_exhausted() && p.pending() == 0 && self.leased() == 0 => {
                JobStatus::Finished
            }
            _ => JobStatus::Running,
        }
    }

    fn progress(&self) -> JobProgress {
        JobProgress {
            job_id: self.job_id.clone(),
            mode: self.mode,
            splits_issued: self.splits_issued,
            splits_completed: self.splits_completed,
            splits_leased: self.leased(),
            splits_pending: self.providers.as_ref().map_or(0, ProviderTree::pending),
            epoch: self
                .providers
                .as_ref()
                .and_then(ProviderTree::outer_iteration)
                .unwrap_or(0),
        }
    }
}

/// Central coordinator: worker registry, jobs, provider trees and leases.
pub struct Dispatcher {
    config: DispatcherConfig,
    workers: RwLock<HashMap<String, WorkerState>>,
    jobs: RwLock<HashMap<String, Arc<Mutex<JobState>>>>,
    worker_index_counter: Mutex<u32>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            worker_index_counter: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Registers a worker, or refreshes the session of a known one.
    pub fn register_worker(&self, worker_id: Option<String>, hostname: &str) -> WorkerRegistration {
        let mut workers = self.workers.write();
        let worker_id = worker_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = workers.get_mut(&worker_id) {
            existing.session_token = Uuid::new_v4().to_string();
            existing.update_heartbeat(existing.active_tasks);
            info!(worker_id = %worker_id, worker_index = existing.worker_index, "Worker reconnected");
            return self.registration(existing, true);
        }

        let worker_index = {
            let mut counter = self.worker_index_counter.lock();
            let idx = *counter;
            *counter += 1;
            idx
        };

        let worker = WorkerState::new(worker_id.clone(), worker_index, hostname.to_string());
        let registration = self.registration(&worker, false);
        workers.insert(worker_id.clone(), worker);

        info!(worker_id = %worker_id, worker_index, hostname, "Worker registered");
        registration
    }

    fn registration(&self, worker: &WorkerState, reconnected: bool) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker.worker_id.clone(),
            worker_index: worker.worker_index,
            session_token: worker.session_token.clone(),
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            reconnected,
        }
    }

    pub fn heartbeat(&self, worker_id: &str, session_token: &str, active_tasks: u32) -> Result<()> {
        let mut workers = self.workers.write();
        match workers.get_mut(worker_id) {
            Some(worker) if worker.session_token == session_token => {
                worker.update_heartbeat(active_tasks);
                Ok(())
            }
            _ => Err(SplitError::worker_unavailable(worker_id)),
        }
    }

    /// Removes a worker and releases its leases. Returns whether it was known.
    pub fn unregister_worker(&self, worker_id: &str) -> bool {
        let mut workers = self.workers.write();
        let known = workers.remove(worker_id).is_some();
        let released = self.release_leases(worker_id);
        if known {
            info!(worker_id, released, "Worker unregistered");
        }
        known
    }

    /// Removes a lost worker and returns its in-flight splits to the pending
    /// pools of their sources. Returns the number of splits released.
    pub fn release_on_disconnect(&self, worker_id: &str) -> usize {
        let mut workers = self.workers.write();
        workers.remove(worker_id);
        let released = self.release_leases(worker_id);
        warn!(worker_id, released, "Worker disconnected; leases released");
        released
    }

    /// Must be called with the worker table write-locked.
    fn release_leases(&self, worker_id: &str) -> usize {
        let jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        let mut released = 0;
        for job in jobs {
            let mut job = job.lock();
            let n = job.release(worker_id);
            if n > 0 {
                debug!(job_id = %job.job_id, worker_id, splits = n, "Released leased splits");
            }
            released += n;
        }
        released
    }

    /// Evicts workers whose last heartbeat is older than the worker timeout
    /// and releases their leases. Returns the evicted worker ids.
    pub fn check_worker_timeouts(&self) -> Vec<String> {
        let timeout = self.config.worker_timeout();
        let mut workers = self.workers.write();

        let timed_out: Vec<String> = workers
            .values()
            .filter(|w| w.is_timed_out(timeout))
            .map(|w| w.worker_id.clone())
            .collect();

        for worker_id in &timed_out {
            workers.remove(worker_id);
            let released = self.release_leases(worker_id);
            warn!(worker_id = %worker_id, released, "Worker timed out");
        }

        timed_out
    }

    pub fn worker_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        let workers = self.workers.read();
        let worker = workers.get(worker_id)?;
        Some(worker.to_worker_info(self.leased_by(worker_id)))
    }

    /// Registered workers ordered by index.
    pub fn live_workers(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.read();
        let mut infos: Vec<_> = workers
            .values()
            .map(|w| w.to_worker_info(self.leased_by(&w.worker_id)))
            .collect();
        infos.sort_by_key(|w| w.worker_index);
        infos
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    fn leased_by(&self, worker_id: &str) -> usize {
        let jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.iter().map(|job| job.lock().leased_by(worker_id)).sum()
    }

    /// Validates `node` and registers it as a new job.
    ///
    /// In distributed_epoch mode this builds the split-provider tree; nodes
    /// without a splitting rule fail with `UnsupportedTopology` and no job is
    /// created.
    pub fn register_pipeline(&self, node: &PipelineNode, mode: ProcessingMode) -> Result<String> {
        node.validate()?;

        let providers = match mode {
            ProcessingMode::DistributedEpoch => Some(ProviderTree::build(node, self.config.split_size)?),
            ProcessingMode::ParallelEpochs => None,
        };

        let job_id = Uuid::new_v4().to_string();
        let sources = providers.as_ref().map_or(0, ProviderTree::num_sources);
        let job = JobState::new(job_id.clone(), mode, providers);
        self.jobs
            .write()
            .insert(job_id.clone(), Arc::new(Mutex::new(job)));

        info!(
            job_id = %job_id,
            ?mode,
            pipeline = node.kind_name(),
            sources,
            "Pipeline registered"
        );
        Ok(job_id)
    }

    fn job(&self, job_id: &str) -> Result<Arc<Mutex<JobState>>> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| SplitError::unknown_job(job_id))
    }

    /// Serves the next split of `request.source` to `worker_id`.
    pub fn get_next_split(
        &self,
        job_id: &str,
        worker_id: &str,
        request: &SplitRequest,
    ) -> Result<SplitResponse> {
        let workers = self.workers.read();
        if !workers.contains_key(worker_id) {
            return Err(SplitError::worker_unavailable(worker_id));
        }

        let job = self.job(job_id)?;
        let mut job = job.lock();
        job.next_split(worker_id, request)
    }

    /// Closes an assignment. Returns `false` when the lease was already
    /// revoked; the worker's result for that split should be discarded.
    pub fn complete_split(&self, job_id: &str, worker_id: &str, split_id: u64) -> Result<bool> {
        let job = self.job(job_id)?;
        let completed = job.lock().complete(worker_id, split_id);
        if !completed {
            debug!(job_id, worker_id, split_id, "Completion for revoked lease ignored");
        }
        Ok(completed)
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        Ok(self.job(job_id)?.lock().status())
    }

    pub fn job_progress(&self, job_id: &str) -> Result<JobProgress> {
        Ok(self.job(job_id)?.lock().progress())
    }

    /// Ends the job: every later split request gets `EndOfJob`.
    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        let job = self.job(job_id)?;
        let mut job = job.lock();
        if !job.cancelled {
            job.cancelled = true;
            info!(job_id, "Job cancelled");
        }
        Ok(())
    }

    pub fn fail_job(&self, job_id: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let job = self.job(job_id)?;
        error!(job_id, reason = %reason, "Job failed");
        job.lock().failure = Some(reason);
        Ok(())
    }

    pub fn remove_job(&self, job_id: &str) -> bool {
        let removed = self.jobs.write().remove(job_id).is_some();
        if removed {
            debug!(job_id, "Job removed");
        }
        removed
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::split::SourceId;
    use crate::pipeline::ServiceSource;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(DispatcherConfig::default())
    }

    fn req(source: u32, epoch: &[u64]) -> SplitRequest {
        SplitRequest::new(SourceId(source), epoch.to_vec())
    }

    #[test]
    fn test_worker_registration() {
        let d = dispatcher();
        let reg = d.register_worker(Some("worker-0".to_string()), "localhost");
        assert!(!reg.reconnected);
        assert_eq!(reg.worker_index, 0);

        let reg2 = d.register_worker(Some("worker-1".to_string()), "localhost");
        assert_eq!(reg2.worker_index, 1);
        assert_eq!(d.worker_count(), 2);

        let generated = d.register_worker(None, "localhost");
        assert_eq!(generated.worker_index, 2);
        assert!(!generated.worker_id.is_empty());
    }

    #[test]
    fn test_worker_reconnection() {
        let d = dispatcher();
        let first = d.register_worker(Some("worker-0".to_string()), "localhost");
        let second = d.register_worker(Some("worker-0".to_string()), "localhost");

        assert!(second.reconnected);
        assert_eq!(second.worker_index, 0);
        assert_ne!(second.session_token, first.session_token);
        assert!(d.heartbeat("worker-0", &first.session_token, 0).is_err());
        assert!(d.heartbeat("worker-0", &second.session_token, 0).is_ok());
    }

    #[test]
    fn test_heartbeat_requires_session() {
        let d = dispatcher();
        let reg = d.register_worker(Some("worker-0".to_string()), "localhost");

        d.heartbeat("worker-0", &reg.session_token, 2).unwrap();
        assert_eq!(d.worker_info("worker-0").unwrap().active_tasks, 2);

        let err = d.heartbeat("worker-0", "bogus", 0).unwrap_err();
        assert!(err.is_transient());
        assert!(d.heartbeat("worker-9", &reg.session_token, 0).is_err());
    }

    #[test]
    fn test_splits_leased_once() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        d.register_worker(Some("b".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 10), ProcessingMode::DistributedEpoch)
            .unwrap();

        let mut seen = Vec::new();
        for i in 0.. {
            let worker = if i % 2 == 0 { "a" } else { "b" };
            match d.get_next_split(&job, worker, &req(0, &[])).unwrap() {
                SplitResponse::Split(split) => seen.push(split.range.start),
                SplitResponse::EndOfJob => break,
                SplitResponse::EndOfEpoch | SplitResponse::Retry => {
                    panic!("root exhaustion must end the job")
                }
            }
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(d.worker_info("a").unwrap().leased_splits, 5);
        assert_eq!(d.job_status(&job).unwrap(), JobStatus::Running);
    }

    #[test]
    fn test_complete_split_and_finish() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 2), ProcessingMode::DistributedEpoch)
            .unwrap();

        let s0 = d.get_next_split(&job, "a", &req(0, &[])).unwrap().into_split().unwrap();
        let s1 = d.get_next_split(&job, "a", &req(0, &[])).unwrap().into_split().unwrap();
        assert!(d.complete_split(&job, "a", s0.id).unwrap());
        assert!(!d.complete_split(&job, "a", s0.id).unwrap());
        assert!(d.complete_split(&job, "a", s1.id).unwrap());

        assert_eq!(d.job_status(&job).unwrap(), JobStatus::Finished);
        let progress = d.job_progress(&job).unwrap();
        assert_eq!(progress.splits_issued, 2);
        assert_eq!(progress.splits_completed, 2);
        assert_eq!(progress.splits_leased, 0);
    }

    #[test]
    fn test_release_on_disconnect_redelivers() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        d.register_worker(Some("b".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 3), ProcessingMode::DistributedEpoch)
            .unwrap();

        let lost = d.get_next_split(&job, "a", &req(0, &[])).unwrap().into_split().unwrap();
        assert_eq!(d.release_on_disconnect("a"), 1);
        assert!(d.worker_info("a").is_none());
        assert_eq!(d.job_progress(&job).unwrap().splits_pending, 1);

        // The evicted worker can no longer lease or complete.
        assert!(d.get_next_split(&job, "a", &req(0, &[])).unwrap_err().is_transient());
        assert!(!d.complete_split(&job, "a", lost.id).unwrap());

        let redelivered = d.get_next_split(&job, "b", &req(0, &[])).unwrap().into_split().unwrap();
        assert_eq!(redelivered.range, lost.range);
        assert_eq!(redelivered.attempt, 1);
    }

    #[test]
    fn test_idle_worker_waits_for_outstanding_split() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        d.register_worker(Some("b".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 2), ProcessingMode::DistributedEpoch)
            .unwrap();

        let held = d.get_next_split(&job, "a", &req(0, &[])).unwrap().into_split().unwrap();
        let done = d.get_next_split(&job, "b", &req(0, &[])).unwrap().into_split().unwrap();
        assert!(d.complete_split(&job, "b", done.id).unwrap());

        // "a" still holds split 0, which comes back if "a" is lost.
        assert_eq!(d.get_next_split(&job, "b", &req(0, &[])).unwrap(), SplitResponse::Retry);

        assert_eq!(d.release_on_disconnect("a"), 1);
        let redelivered = d.get_next_split(&job, "b", &req(0, &[])).unwrap().into_split().unwrap();
        assert_eq!(redelivered.range, held.range);
        assert!(d.complete_split(&job, "b", redelivered.id).unwrap());

        assert_eq!(d.get_next_split(&job, "b", &req(0, &[])).unwrap(), SplitResponse::EndOfJob);
        assert_eq!(d.job_status(&job).unwrap(), JobStatus::Finished);
    }

    #[test]
    fn test_worker_with_leases_gets_end_of_job() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        d.register_worker(Some("b".to_string()), "localhost");
        let node = PipelineNode::zip([PipelineNode::range(0, 1), PipelineNode::range(0, 1)]);
        let job = d.register_pipeline(&node, ProcessingMode::DistributedEpoch).unwrap();

        d.get_next_split(&job, "a", &req(0, &[])).unwrap().into_split().unwrap();
        d.get_next_split(&job, "b", &req(1, &[])).unwrap().into_split().unwrap();

        // Both hold a lease, so neither waits on the other.
        assert_eq!(d.get_next_split(&job, "a", &req(0, &[])).unwrap(), SplitResponse::EndOfJob);
        assert_eq!(d.get_next_split(&job, "b", &req(0, &[])).unwrap(), SplitResponse::EndOfJob);
    }

    #[test]
    fn test_worker_timeouts_release_leases() {
        let config = DispatcherConfig {
            worker_timeout_ms: 20,
            heartbeat_interval_ms: 5,
            ..DispatcherConfig::default()
        };
        let d = Dispatcher::new(config);
        let reg = d.register_worker(Some("slow".to_string()), "localhost");
        let fast = d.register_worker(Some("fast".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 5), ProcessingMode::DistributedEpoch)
            .unwrap();
        d.get_next_split(&job, "slow", &req(0, &[])).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        d.heartbeat("fast", &fast.session_token, 0).unwrap();

        let timed_out = d.check_worker_timeouts();
        assert_eq!(timed_out, vec!["slow".to_string()]);
        assert!(d.heartbeat("slow", &reg.session_token, 0).is_err());
        assert_eq!(d.job_progress(&job).unwrap().splits_pending, 1);
    }

    #[test]
    fn test_register_rejects_nested_service() {
        let d = dispatcher();
        let nested = PipelineNode::data_service(ServiceSource::new("other", || {
            Ok(Box::new(std::iter::empty()) as crate::pipeline::ElementIter)
        }));

        let err = d
            .register_pipeline(&nested, ProcessingMode::DistributedEpoch)
            .unwrap_err();
        assert!(matches!(err, SplitError::UnsupportedTopology { .. }));
        assert!(d.job_ids().is_empty());

        // Reading another job locally is fine.
        assert!(d.register_pipeline(&nested, ProcessingMode::ParallelEpochs).is_ok());
    }

    #[test]
    fn test_register_rejects_invalid_parameters() {
        let d = dispatcher();
        let bad = PipelineNode::sample_from_datasets([PipelineNode::range(0, 1)], [0.5, 0.5], None);
        let err = d.register_pipeline(&bad, ProcessingMode::DistributedEpoch).unwrap_err();
        assert!(matches!(err, SplitError::InvalidPipeline { .. }));
    }

    #[test]
    fn test_provider_error_fails_job() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 3).repeat(2), ProcessingMode::DistributedEpoch)
            .unwrap();

        // Missing the repeat iteration.
        assert!(d.get_next_split(&job, "a", &req(0, &[])).is_err());
        assert!(matches!(d.job_status(&job).unwrap(), JobStatus::Failed { .. }));
        assert_eq!(
            d.get_next_split(&job, "a", &req(0, &[0])).unwrap(),
            SplitResponse::EndOfJob
        );
    }

    #[test]
    fn test_cancel_and_remove_job() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 1).repeat_forever(), ProcessingMode::DistributedEpoch)
            .unwrap();

        assert!(d.get_next_split(&job, "a", &req(0, &[0])).unwrap().into_split().is_some());
        d.cancel_job(&job).unwrap();
        assert_eq!(d.job_status(&job).unwrap(), JobStatus::Cancelled);
        assert_eq!(
            d.get_next_split(&job, "a", &req(0, &[1])).unwrap(),
            SplitResponse::EndOfJob
        );

        assert!(d.remove_job(&job));
        assert!(matches!(
            d.job_status(&job).unwrap_err(),
            SplitError::UnknownJob { .. }
        ));
    }

    #[test]
    fn test_parallel_epochs_job_has_no_splits() {
        let d = dispatcher();
        d.register_worker(Some("a".to_string()), "localhost");
        let job = d
            .register_pipeline(&PipelineNode::range(0, 3), ProcessingMode::ParallelEpochs)
            .unwrap();
        assert!(d.get_next_split(&job, "a", &req(0, &[])).is_err());
        assert_eq!(d.job_progress(&job).unwrap().mode, ProcessingMode::ParallelEpochs);
    }

    #[test]
    fn test_concurrent_requests_never_duplicate() {
        let d = Arc::new(dispatcher());
        let job = d
            .register_pipeline(&PipelineNode::range(0, 1000).repeat(3), ProcessingMode::DistributedEpoch)
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let d = d.clone();
                let job = job.clone();
                std::thread::spawn(move || {
                    let worker = format!("worker-{i}");
                    d.register_worker(Some(worker.clone()), "localhost");
                    let mut got = Vec::new();
                    let mut epoch = 0;
                    loop {
                        match d.get_next_split(&job, &worker, &req(0, &[epoch])).unwrap() {
                            SplitResponse::Split(split) => got.push((epoch, split.range.start)),
                            SplitResponse::EndOfEpoch => epoch += 1,
                            // Only the leases of other workers are left.
                            SplitResponse::EndOfJob | SplitResponse::Retry => break,
                        }
                        if epoch >= 3 {
                            break;
                        }
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        let expected: Vec<_> = (0..3).flat_map(|e| (0..1000).map(move |i| (e, i))).collect();
        assert_eq!(all, expected);
    }
}
