use crate::descriptor::JobDescriptor;
use crate::error::TransitionError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// The state of a job as reported by the external scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SchedulerState {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
    /// The scheduler has no record of the job. It may have finished and been
    /// purged, or the submission never registered.
    Unknown,
}

/// The result of a best-effort cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The scheduler no longer knows the job, it already finished.
    NoSuchJob,
}

/// Lifecycle of a [`Job`] inside the tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Built,
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the job occupies scheduler capacity.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Forward edges of the state machine. Retries are not edges, see [`Job::retry`].
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (Built, Pending | Failed | Cancelled) => true,
            (Pending, Running | Succeeded | Failed | Cancelled) => true,
            (Running, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    /// The scheduler refused the submission (permanently, or transiently until retries ran out).
    Submission,
    /// The program exited non-zero, its completion marker is missing, or the scheduler reported failure.
    Execution,
    /// The job did not reach a terminal scheduler state before its deadline.
    StallTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The outcome of one run, as reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { path: PathBuf },
    Failure(Failure),
    /// The batch was cancelled, interrupted or timed out before this run finished.
    NotCompleted,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Runtime record of a submitted run. Owned by the job tracker.
#[derive(Debug, Clone)]
pub struct Job {
    pub descriptor: Arc<JobDescriptor>,
    pub external_id: Option<String>,
    pub state: JobState,
    /// Retries consumed so far; `0` on the first submission.
    pub attempt: u32,
    /// External ids of earlier attempts, oldest first.
    pub previous_ids: Vec<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last message observed from the scheduler or the marker check.
    pub message: Option<String>,
    result_path: Option<PathBuf>,
    failure: Option<Failure>,
}

impl Job {
    pub fn new(descriptor: Arc<JobDescriptor>) -> Self {
        Self {
            descriptor,
            external_id: None,
            state: JobState::Built,
            attempt: 0,
            previous_ids: Vec::new(),
            submitted_at: None,
            last_polled_at: None,
            finished_at: None,
            message: None,
            result_path: None,
            failure: None,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.descriptor.ordinal
    }

    pub fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Records a successful `submit()`. An id is only ever assigned once per record.
    pub fn submitted(&mut self, external_id: String) -> Result<(), TransitionError> {
        if self.external_id.is_some() || !matches!(self.state, JobState::Built | JobState::Pending)
        {
            return Err(TransitionError {
                from: self.state,
                to: JobState::Pending,
            });
        }
        if self.state == JobState::Built {
            self.transition(JobState::Pending)?;
        }
        self.external_id = Some(external_id);
        self.submitted_at = Some(Utc::now());
        Ok(())
    }

    /// A submission attempt was refused transiently. The job stays where it is.
    pub fn submission_refused(&mut self, message: impl Into<String>) {
        self.attempt += 1;
        self.message = Some(message.into());
    }

    /// Builds the record for the next attempt after a failed execution.
    ///
    /// The new record has no external id, so a resubmission can never reuse an
    /// id that belongs to an earlier attempt.
    pub fn retry(&self, message: impl Into<String>) -> Result<Job, TransitionError> {
        if !matches!(
            self.state,
            JobState::Pending | JobState::Running | JobState::Failed
        ) {
            return Err(TransitionError {
                from: self.state,
                to: JobState::Pending,
            });
        }
        let mut previous_ids = self.previous_ids.clone();
        previous_ids.extend(self.external_id.clone());
        Ok(Job {
            descriptor: self.descriptor.clone(),
            external_id: None,
            state: JobState::Pending,
            attempt: self.attempt + 1,
            previous_ids,
            submitted_at: None,
            last_polled_at: None,
            finished_at: None,
            message: Some(message.into()),
            result_path: None,
            failure: None,
        })
    }

    pub fn succeed(&mut self, path: PathBuf) -> Result<(), TransitionError> {
        self.transition(JobState::Succeeded)?;
        self.result_path = Some(path);
        Ok(())
    }

    pub fn fail(&mut self, failure: Failure) -> Result<(), TransitionError> {
        self.transition(JobState::Failed)?;
        self.message = Some(failure.message.clone());
        self.failure = Some(failure);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Cancelled)
    }

    /// All external ids this run has been submitted under, oldest first.
    pub fn external_ids(&self) -> Vec<String> {
        let mut ids = self.previous_ids.clone();
        ids.extend(self.external_id.clone());
        ids
    }

    pub fn outcome(&self) -> Outcome {
        match (self.state, &self.result_path, &self.failure) {
            (JobState::Succeeded, Some(path), _) => Outcome::Success { path: path.clone() },
            (JobState::Failed, _, Some(failure)) => Outcome::Failure(failure.clone()),
            _ => Outcome::NotCompleted,
        }
    }
}

/// Why a batch stopped before all of its jobs finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller cancelled the batch (e.g. the process was interrupted).
    Interrupted,
    /// A job failed terminally while `fail_fast` was set.
    FailFast { ordinal: usize },
    BatchTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchEntry {
    pub ordinal: usize,
    pub outcome: Outcome,
    /// Number of submission calls made for this run.
    pub attempts: u32,
    pub external_ids: Vec<String>,
}

/// Outcomes of a batch, in the order the runs were requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchResult {
    pub entries: Vec<BatchEntry>,
    /// Highest number of jobs observed in `Pending`/`Running` at once.
    pub peak_in_flight: usize,
    pub cancelled: Option<CancelReason>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &Outcome> {
        self.entries.iter().map(|e| &e.outcome)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes().all(Outcome::is_success)
    }
}
