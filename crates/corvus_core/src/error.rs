use crate::job::JobState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    /// The launcher configuration, a resource request or a run specification is malformed.
    /// Fatal to the whole batch, **no submissions occur**.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Low-level I/O error while preparing the batch (e.g. output directory creation).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error while writing run bookkeeping.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The scheduler backend could not be initialized.
    /// Fatal to the whole batch, raised before any submission.
    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// Scheduler unavailability, quota exceeded, network timeouts.
    /// The submission is retried after a backoff.
    #[error("Transient submission failure: {0}")]
    Transient(String),

    /// The scheduler rejected the request itself (malformed script, bad partition).
    /// The job fails without retry.
    #[error("Submission rejected: {0}")]
    Permanent(String),
}

impl SubmissionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler client could not be reached or timed out.
    /// Polls and cancels are retried on the next cycle.
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),

    /// The scheduler answered with output that could not be interpreted.
    #[error("Unexpected scheduler response: {0}")]
    Protocol(String),
}

/// A state change that the job state machine does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid job transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}
