//! Core types for the cronbeat library

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for cronbeat operations
pub type Result<T> = std::result::Result<T, CronError>;

/// Boxed future returned by a scheduled job
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A scheduled callback
///
/// Stored as an opaque async closure; each dispatch calls it to produce a
/// fresh future which runs on its own tokio task.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Cronbeat errors
#[derive(Debug, Error)]
pub enum CronError {
    /// Malformed six-field expression or out-of-range token
    #[error("invalid cron pattern: {0}")]
    InvalidPattern(String),

    /// Malformed `@every` duration argument
    #[error("invalid @every duration: {0}")]
    InvalidDuration(String),

    /// Unrecognized `@alias` (anything other than the predefined aliases and `@every`)
    #[error("unknown schedule alias: {0}")]
    UnknownAlias(String),

    /// An entry with this name is already registered
    #[error("entry already exists: {0}")]
    DuplicateName(String),

    /// No entry registered under this name
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Run count of zero passed to a bounded registration
    #[error("invalid run count: {0}")]
    InvalidTimes(usize),

    /// The scheduler has been closed and no longer accepts registrations
    #[error("scheduler is closed")]
    SchedulerClosed,
}

/// Lifecycle status shared by entries and the scheduler itself
///
/// `Ready` and `Running` are both dispatchable; `Stopped` suspends dispatch
/// without destroying anything; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created and dispatchable, no invocation currently running
    Ready,
    /// At least one invocation is currently running
    Running,
    /// Suspended; ticks are ignored until started again
    Stopped,
    /// Terminal; the entry (or scheduler) is shutting down
    Closed,
}

impl Status {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Status::Ready => 0,
            Status::Running => 1,
            Status::Stopped => 2,
            Status::Closed => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Ready,
            1 => Status::Running,
            2 => Status::Stopped,
            _ => Status::Closed,
        }
    }

    /// Whether ticks may dispatch in this state
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Status::Ready | Status::Running)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ready => write!(f, "ready"),
            Status::Running => write!(f, "running"),
            Status::Stopped => write!(f, "stopped"),
            Status::Closed => write!(f, "closed"),
        }
    }
}
