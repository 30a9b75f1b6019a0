//! Core types: lifecycle phases, events, status snapshots, and errors.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where the client is in its lifecycle.
///
/// `Stopped` and `Running` are settled; `Starting` and `Stopping` mean a
/// connector call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl Phase {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Stopped | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation that caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Start,
    Stop,
    Restart,
    Retry,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications broadcast to every subscriber of
/// [`ClientInstance::subscribe_events`](crate::ClientInstance::subscribe_events).
///
/// A retry that fires has no caller to return an error to, so
/// `StartFailed { trigger: Trigger::Retry, .. }` is how integrators learn
/// about it.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Started { trigger: Trigger },
    Stopped { trigger: Trigger },
    StartFailed { trigger: Trigger, error: ConnectorError },
    StopFailed { trigger: Trigger, error: ConnectorError },
    RetryArmed { delay: Duration, replaced: bool },
    RetryCancelled { reason: &'static str },
    RetrySkipped { reason: &'static str },
}

/// What [`retry_with_seconds`](crate::ClientInstance::retry_with_seconds) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// A retry was armed; nothing was pending before.
    Armed,
    /// A pending retry was cancelled and this one took its slot.
    Replaced,
    /// A retry was already pending and the policy keeps it.
    KeptPending,
    /// The client is running, so there is nothing to retry.
    AlreadyRunning,
    /// The caller stopped the client; a supervisor re-arm was refused.
    Halted,
}

/// Point-in-time view of a client, safe to log (the key is masked).
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub dev_key: String,
    pub dev_sn: String,
    pub phase: Phase,
    pub running: bool,
    pub retry_pending: bool,
    pub retry_due_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// Errors a [`Connector`](crate::Connector) can report.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("failed: {0}")]
    Failed(String),
}

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Domain(#[from] cs_domain::Error),
    #[error("developer key {active} is already active (requested {requested})")]
    ConflictingDevKey { active: String, requested: String },
    #[error("open: {0}")]
    Open(ConnectorError),
    #[error("close: {0}")]
    Close(ConnectorError),
    #[error("restart: close: {close}; open: {open}")]
    Restart {
        close: ConnectorError,
        open: ConnectorError,
    },
    #[error("start interrupted by a concurrent stop")]
    Interrupted,
    #[error("no tokio runtime to schedule the retry on")]
    NoRuntime,
}

impl ClientError {
    pub fn is_missing_dev_key(&self) -> bool {
        matches!(self, Self::Domain(cs_domain::Error::MissingDevKey))
    }

    /// The connector error behind this failure, if any (the open side for
    /// a double restart failure).
    pub fn connector_error(&self) -> Option<&ConnectorError> {
        match self {
            Self::Open(e) | Self::Close(e) => Some(e),
            Self::Restart { open, .. } => Some(open),
            _ => None,
        }
    }
}
