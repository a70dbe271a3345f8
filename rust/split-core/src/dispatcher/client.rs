// rust/split-core/src/dispatcher/client.rs

//! Worker-side view of the dispatcher.

use super::protocol::WorkerRegistration;
use super::split::{SplitRequest, SplitResponse};
use super::state::Dispatcher;
use crate::error::Result;

/// Trait for dispatcher client implementations.
pub trait DispatcherClient: Send + Sync {
    /// Register a worker, or reconnect a known one under a new session.
    fn register_worker(&self, worker_id: Option<String>, hostname: &str) -> Result<WorkerRegistration>;

    /// Send a liveness heartbeat.
    fn heartbeat(&self, worker_id: &str, session_token: &str, active_tasks: u32) -> Result<()>;

    /// Request the next split of one source for one job.
    fn get_next_split(
        &self,
        job_id: &str,
        worker_id: &str,
        request: &SplitRequest,
    ) -> Result<SplitResponse>;

    /// Report that a split has been fully produced.
    ///
    /// Returns `false` when the lease was revoked in the meantime.
    fn complete_split(&self, job_id: &str, worker_id: &str, split_id: u64) -> Result<bool>;

    /// Unregister a worker (graceful shutdown). Its leases are released.
    fn unregister_worker(&self, worker_id: &str) -> Result<bool>;
}

impl DispatcherClient for Dispatcher {
    fn register_worker(&self, worker_id: Option<String>, hostname: &str) -> Result<WorkerRegistration> {
        Ok(Dispatcher::register_worker(self, worker_id, hostname))
    }

    fn heartbeat(&self, worker_id: &str, session_token: &str, active_tasks: u32) -> Result<()> {
        Dispatcher::heartbeat(self, worker_id, session_token, active_tasks)
    }

    fn get_next_split(
        &self,
        job_id: &str,
        worker_id: &str,
        request: &SplitRequest,
    ) -> Result<SplitResponse> {
        Dispatcher::get_next_split(self, job_id, worker_id, request)
    }

    fn complete_split(&self, job_id: &str, worker_id: &str, split_id: u64) -> Result<bool> {
        Dispatcher::complete_split(self, job_id, worker_id, split_id)
    }

    fn unregister_worker(&self, worker_id: &str) -> Result<bool> {
        Ok(Dispatcher::unregister_worker(self, worker_id))
    }
}
