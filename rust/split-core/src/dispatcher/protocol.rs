// rust/split-core/src/dispatcher/protocol.rs

//! Messages exchanged between workers, clients and the dispatcher.

use serde::{Deserialize, Serialize};

use crate::pipeline::ProcessingMode;

/// Returned to a worker on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    /// 0-based, assigned in registration order; kept across reconnects.
    pub worker_index: u32,
    pub session_token: String,
    /// Recommended heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    pub reconnected: bool,
}

/// Snapshot of a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub worker_index: u32,
    pub hostname: String,
    pub registered_at_ms: i64,
    pub last_heartbeat_ms: i64,
    /// Tasks the worker reported running at its last heartbeat.
    pub active_tasks: u32,
    /// Splits currently leased to the worker across all jobs.
    pub leased_splits: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    /// Every split was issued and completed.
    Finished,
    Cancelled,
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Split accounting for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub mode: ProcessingMode,
    pub splits_issued: u64,
    pub splits_completed: u64,
    /// Issued and not yet completed or released.
    pub splits_leased: usize,
    /// Released and waiting for redelivery.
    pub splits_pending: usize,
    /// Iteration of the outermost repeat.
    pub epoch: u64,
}

impl JobProgress {
    /// Whether released splits were never handed out again.
    pub fn has_undelivered(&self) -> bool {
        self.splits_pending > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed {
            reason: "boom".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_registration_json() {
        let reg = WorkerRegistration {
            worker_id: "worker-0".into(),
            worker_index: 0,
            session_token: "token".into(),
            heartbeat_interval_ms: 5000,
            reconnected: false,
        };
        let json = serde_json::to_string(&reg).unwrap();
        let back: WorkerRegistration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reg);
    }
}
