//! Per-invocation state machine.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::bridge::protocol::ExecutionMode;
use crate::error::{ErrorKind, RemoteError};

/// Where a remote invocation is in its pod lifecycle.
///
/// Stages advance strictly in declaration order; any stage short of `Done`
/// may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Idle,
    PodCreating,
    PodStarting,
    Attaching,
    Sending,
    Receiving,
    Deleting,
    Done,
    Failed(ErrorKind),
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    fn ordinal(&self) -> Option<u8> {
        Some(match self {
            Self::Idle => 0,
            Self::PodCreating => 1,
            Self::PodStarting => 2,
            Self::Attaching => 3,
            Self::Sending => 4,
            Self::Receiving => 5,
            Self::Deleting => 6,
            Self::Done => 7,
            Self::Failed(_) => return None,
        })
    }

    pub fn can_transition_to(&self, next: InvocationState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.ordinal(), next.ordinal()) {
            (_, None) => true,
            (Some(from), Some(to)) => to == from + 1,
            (None, Some(_)) => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PodCreating => "pod_creating",
            Self::PodStarting => "pod_starting",
            Self::Attaching => "attaching",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Deleting => "deleting",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed({kind:?})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Tracks one invocation from `Idle` to a terminal state.
#[derive(Debug)]
pub struct Invocation {
    id: Uuid,
    mode: ExecutionMode,
    state: InvocationState,
    pod_name: Option<String>,
    started_at: DateTime<Utc>,
}

impl Invocation {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            state: InvocationState::Idle,
            pod_name: None,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn pod_name(&self) -> Option<&str> {
        self.pod_name.as_deref()
    }

    pub fn set_pod_name(&mut self, name: impl Into<String>) {
        self.pod_name = Some(name.into());
    }

    pub fn advance(&mut self, next: InvocationState) {
        let valid = self.state.can_transition_to(next);
        debug_assert!(valid, "invalid transition {} -> {}", self.state, next);
        if !valid {
            tracing::error!(invocation = %self.id, from = %self.state, to = %next, "Invalid invocation state transition");
            return;
        }
        tracing::trace!(invocation = %self.id, from = %self.state, to = %next, "Invocation state");
        self.state = next;
    }

    /// Record `error` as the terminal state and hand it back.
    pub fn fail(&mut self, error: RemoteError) -> RemoteError {
        self.advance(InvocationState::Failed(error.kind()));
        tracing::warn!(invocation = %self.id, pod = ?self.pod_name, %error, "Remote invocation failed");
        error
    }

    pub fn outcome(&self, output: Value, deletion_error: Option<RemoteError>) -> InvocationOutcome {
        InvocationOutcome {
            output,
            pod_name: self.pod_name.clone().unwrap_or_default(),
            state: self.state,
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            deletion_error,
        }
    }
}

/// A successful one-shot invocation, with details a plain `invoke` drops.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub output: Value,
    pub pod_name: String,
    pub state: InvocationState,
    pub started_at: String,
    pub finished_at: String,
    /// Set when the result was delivered but the pod could not be deleted.
    pub deletion_error: Option<RemoteError>,
}
