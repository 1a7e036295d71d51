//! Error types for remote execution.

use std::time::Duration;

use serde::Serialize;

use crate::cluster::{ClusterError, PodPhase};

/// Failure to turn a runnable or a value into its portable form, or back.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("runnable serialization failed: {0}")]
    Graph(String),

    #[error("value serialization failed: {0}")]
    Value(#[from] serde_json::Error),
}

impl SerializationError {
    pub fn graph(message: impl std::fmt::Display) -> Self {
        Self::Graph(message.to_string())
    }
}

/// Failures of a remote invocation, one per stage of the pod lifecycle.
///
/// None of these are retried internally: a partially started pod must not be
/// silently reused, so retry policy belongs to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to create worker pod {pod}: {source}")]
    PodCreateFailed { pod: String, source: ClusterError },

    #[error("failed to watch worker pod {pod}: {source}")]
    PodWatchFailed { pod: String, source: ClusterError },

    #[error("worker pod {pod} did not start within {timeout:?}")]
    PodStartTimeout { pod: String, timeout: Duration },

    #[error("worker pod {pod} was deleted before it started")]
    PodDeletedBeforeStart { pod: String },

    #[error("worker pod {pod} reached phase {phase} before it was running")]
    PodExitedBeforeStart { pod: String, phase: PodPhase },

    #[error("failed to attach to worker pod {pod}: {source}")]
    PodAttachFailed { pod: String, source: ClusterError },

    #[error("an error occurred in worker pod: {message}")]
    WorkerError { message: String },

    #[error("worker pod {pod} didn't output anything")]
    EmptyOutput { pod: String },

    #[error("failed to delete worker pod {pod}: {source}")]
    PodDeleteFailed { pod: String, source: ClusterError },

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("protocol error on worker pod {pod}: {message}")]
    Protocol { pod: String, message: String },

    #[error("invocation timed out after {0:?}")]
    InvocationTimeout(Duration),
}

/// Fieldless mirror of [`RemoteError`], recorded in the invocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PodCreateFailed,
    PodWatchFailed,
    PodStartTimeout,
    PodDeletedBeforeStart,
    PodExitedBeforeStart,
    PodAttachFailed,
    WorkerError,
    EmptyOutput,
    PodDeleteFailed,
    Serialization,
    Protocol,
    InvocationTimeout,
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PodCreateFailed { .. } => ErrorKind::PodCreateFailed,
            Self::PodWatchFailed { .. } => ErrorKind::PodWatchFailed,
            Self::PodStartTimeout { .. } => ErrorKind::PodStartTimeout,
            Self::PodDeletedBeforeStart { .. } => ErrorKind::PodDeletedBeforeStart,
            Self::PodExitedBeforeStart { .. } => ErrorKind::PodExitedBeforeStart,
            Self::PodAttachFailed { .. } => ErrorKind::PodAttachFailed,
            Self::WorkerError { .. } => ErrorKind::WorkerError,
            Self::EmptyOutput { .. } => ErrorKind::EmptyOutput,
            Self::PodDeleteFailed { .. } => ErrorKind::PodDeleteFailed,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::InvocationTimeout(_) => ErrorKind::InvocationTimeout,
        }
    }
}

/// Error returned by [`Runnable`](crate::runnable::Runnable) implementations.
#[derive(Debug, thiserror::Error)]
pub enum RunnableError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("runnable failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl RunnableError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// The remote failure behind this error, if it came from a worker pod.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}
