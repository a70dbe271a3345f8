// rust/split-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplitError {

    #[error("Cannot create split providers for dataset of type {kind}: {message}")]
    UnsupportedTopology {
        kind: String,
        message: String,
    },

    #[error("Invalid pipeline: {message}")]
    InvalidPipeline {
        message: String,
    },

    #[error("Worker '{worker_id}' is unavailable")]
    WorkerUnavailable {
        worker_id: String,
    },

    #[error("Unknown job '{job_id}'")]
    UnknownJob {
        job_id: String,
    },

    #[error("Job '{job_id}' failed: {message}")]
    JobFailed {
        job_id: String,
        message: String,
    },

    #[error("Execution error: {message}")]
    Execution {
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error at '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, SplitError>;

// Convenience constructors
impl SplitError {

    pub fn unsupported_topology(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedTopology {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn invalid_pipeline(message: impl Into<String>) -> Self {
        Self::InvalidPipeline {
            message: message.into(),
        }
    }

    pub fn worker_unavailable(worker_id: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            worker_id: worker_id.into(),
        }
    }

    pub fn unknown_job(job_id: impl Into<String>) -> Self {
        Self::UnknownJob {
            job_id: job_id.into(),
        }
    }

    pub fn job_failed(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JobFailed {
            job_id: job_id.into(),
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn io_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the error is transient from the job's point of view.
    ///
    /// Worker loss only triggers lease release and redelivery; everything
    /// else is reported to the caller as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WorkerUnavailable { .. })
    }
}
