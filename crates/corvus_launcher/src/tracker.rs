use crate::schedule::PollSchedule;
use crate::signal::BatchSignal;
use crate::throttle::SubmissionThrottle;

use corvus_core::prelude::*;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, instrument, warn};

struct Entry {
    job: Job,
    submissions: u32,
}

struct Table {
    entries: Vec<Entry>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Owns the [`Job`] record of every run in a batch.
///
/// All state changes go through one lock, so a transition is applied atomically
/// and a poll result can never interleave with the resubmission of the same job.
pub struct JobTracker {
    table: Mutex<Table>,
}

impl JobTracker {
    pub fn new(descriptors: impl IntoIterator<Item = Arc<JobDescriptor>>) -> Self {
        let entries = descriptors
            .into_iter()
            .map(|d| Entry {
                job: Job::new(d),
                submissions: 0,
            })
            .collect();
        Self {
            table: Mutex::new(Table {
                entries,
                in_flight: 0,
                peak_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to one job and keeps the in-flight accounting current.
    fn update<R>(&self, index: usize, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut table = self.lock();
        let before = table.entries[index].job.state.is_in_flight();
        let result = f(&mut table.entries[index]);
        let after = table.entries[index].job.state.is_in_flight();

        match (before, after) {
            (false, true) => {
                table.in_flight += 1;
                table.peak_in_flight = table.peak_in_flight.max(table.in_flight);
            }
            (true, false) => table.in_flight -= 1,
            _ => {}
        }
        result
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the current record.
    pub fn job(&self, index: usize) -> Job {
        self.lock().entries[index].job.clone()
    }

    pub fn state(&self, index: usize) -> JobState {
        self.lock().entries[index].job.state
    }

    pub fn attempt(&self, index: usize) -> u32 {
        self.lock().entries[index].job.attempt
    }

    /// Jobs currently in `Pending` or `Running`.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    pub fn record_submission(&self, index: usize) -> u32 {
        self.update(index, |e| {
            e.submissions += 1;
            e.submissions
        })
    }

    pub fn submitted(&self, index: usize, external_id: String) -> Result<(), TransitionError> {
        self.update(index, |e| e.job.submitted(external_id))
    }

    /// Records a transient refusal and returns the retry number it consumed.
    pub fn submission_refused(&self, index: usize, message: &str) -> u32 {
        self.update(index, |e| {
            e.job.submission_refused(message);
            e.job.attempt
        })
    }

    pub fn polled(&self, index: usize, state: &SchedulerState) {
        self.update(index, |e| {
            e.job.last_polled_at = Some(chrono::Utc::now());
            if let SchedulerState::Failed(message) = state {
                e.job.message = Some(message.clone());
            }
        })
    }

    pub fn running(&self, index: usize) -> Result<(), TransitionError> {
        self.update(index, |e| match e.job.state {
            JobState::Running => Ok(()),
            _ => e.job.transition(JobState::Running),
        })
    }

    /// Replaces the record with a fresh one for the next attempt and returns its retry number.
    pub fn retry(&self, index: usize, message: &str) -> Result<u32, TransitionError> {
        self.update(index, |e| {
            let next = e.job.retry(message)?;
            let attempt = next.attempt;
            e.job = next;
            Ok(attempt)
        })
    }

    pub fn succeed(&self, index: usize, path: PathBuf) -> Result<(), TransitionError> {
        self.update(index, |e| e.job.succeed(path))
    }

    pub fn fail(&self, index: usize, failure: Failure) -> Result<(), TransitionError> {
        self.update(index, |e| e.job.fail(failure))
    }

    /// Cancels a job unless it already finished.
    pub fn cancel(&self, index: usize) {
        self.update(index, |e| {
            if !e.job.state.is_terminal() {
                // every non-terminal state has an edge to Cancelled
                let _ = e.job.cancel();
            }
        })
    }

    /// Scheduler ids of jobs that were submitted but never reached a terminal state.
    pub fn unfinished_ids(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .filter(|e| !e.job.state.is_terminal())
            .filter_map(|e| e.job.external_id.clone())
            .collect()
    }

    /// Cancels every job that has not finished.
    pub fn cancel_unfinished(&self) -> usize {
        let count = self.lock().entries.len();
        (0..count)
            .filter(|&index| {
                let unfinished = !self.state(index).is_terminal();
                if unfinished {
                    self.cancel(index);
                }
                unfinished
            })
            .count()
    }

    /// Assembles the ordered result, one entry per job in input order.
    pub fn results(&self, cancelled: Option<CancelReason>) -> BatchResult {
        let table = self.lock();
        let entries = table
            .entries
            .iter()
            .map(|e| BatchEntry {
                ordinal: e.job.ordinal(),
                outcome: e.job.outcome(),
                attempts: e.submissions,
                external_ids: e.job.external_ids(),
            })
            .collect();
        BatchResult {
            entries,
            peak_in_flight: table.peak_in_flight,
            cancelled,
        }
    }
}

/// What one submission of a job ended with.
enum Verdict {
    Succeeded(PathBuf),
    Failed(Failure),
    Cancelled,
}

/// Drives one job through its state machine, from admission to a terminal state.
pub(crate) struct JobDriver<B> {
    pub backend: Arc<B>,
    pub tracker: Arc<JobTracker>,
    pub throttle: Arc<SubmissionThrottle>,
    pub config: Arc<LauncherConfig>,
    pub signal: BatchSignal,
    pub descriptor: Arc<JobDescriptor>,
    pub index: usize,
}

impl<B: SchedulerBackend> JobDriver<B> {
    #[instrument(name = "job", skip_all, fields(ordinal = self.descriptor.ordinal, name = %self.descriptor.name))]
    pub async fn run(self) {
        let Some(_admission) = self.throttle.admit(self.signal.token()).await else {
            debug!("Batch cancelled before admission");
            self.tracker.cancel(self.index);
            return;
        };

        loop {
            let Some(external_id) = self.submit().await else {
                return;
            };

            match self.monitor(&external_id).await {
                Verdict::Succeeded(path) => {
                    info!(job_id = %external_id, result = %path.display(), "Job succeeded");
                    if let Err(e) = self.tracker.succeed(self.index, path) {
                        error!("{e}");
                    }
                    return;
                }
                Verdict::Cancelled => return,
                Verdict::Failed(failure) => {
                    if !self.retry_or_fail(failure).await {
                        return;
                    }
                }
            }
        }
    }

    /// Submits until the scheduler accepts the job. [`None`] means the job reached
    /// a terminal state instead.
    async fn submit(&self) -> Option<String> {
        loop {
            if let Err(e) = clear_marker(&self.descriptor.marker).await {
                warn!("Could not remove stale completion marker: {e}");
            }

            if !self.throttle.pace(self.signal.token()).await {
                self.tracker.cancel(self.index);
                return None;
            }

            let submission = self.tracker.record_submission(self.index);
            debug!(submission, "Submitting");

            match self.backend.submit(&self.descriptor).await {
                Ok(external_id) => {
                    if let Err(e) = self.tracker.submitted(self.index, external_id.clone()) {
                        error!(job_id = %external_id, "{e}");
                    }
                    info!(job_id = %external_id, attempt = self.tracker.attempt(self.index), "Submitted");
                    return Some(external_id);
                }
                Err(SubmissionError::Permanent(message)) => {
                    error!("Submission rejected: {message}");
                    self.finish_failed(Failure::new(FailureKind::Submission, message));
                    return None;
                }
                Err(SubmissionError::Transient(message)) => {
                    if self.tracker.attempt(self.index) >= self.config.max_retries {
                        error!("Submission failed, retries exhausted: {message}");
                        self.finish_failed(Failure::new(
                            FailureKind::Submission,
                            format!("Retries exhausted: {message}"),
                        ));
                        return None;
                    }
                    let retry = self.tracker.submission_refused(self.index, &message);
                    warn!(retry, "Submission refused: {message}");
                    if !self.backoff(retry).await {
                        self.tracker.cancel(self.index);
                        return None;
                    }
                }
            }
        }
    }

    /// Polls a submitted job until it finishes, stalls or the batch is cancelled.
    async fn monitor(&self, external_id: &str) -> Verdict {
        let schedule = PollSchedule::from_config(&self.config);
        let started = Instant::now();
        let deadline = self.config.per_job_timeout.map(|t| started + t);
        let mut unknown_polls = 0;

        loop {
            let mut wake = Instant::now() + schedule.next_delay(started.elapsed());
            if let Some(deadline) = deadline {
                wake = wake.min(deadline);
            }

            tokio::select! {
                biased;
                _ = self.signal.token().cancelled() => {
                    info!(job_id = %external_id, "Cancelling job");
                    self.cancel_remote(external_id).await;
                    self.tracker.cancel(self.index);
                    return Verdict::Cancelled;
                }
                _ = sleep_until(wake) => {}
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let timeout = self.config.per_job_timeout.unwrap_or_default();
                warn!(job_id = %external_id, "No terminal state within {timeout:?}");
                self.cancel_remote(external_id).await;
                return Verdict::Failed(Failure::new(
                    FailureKind::StallTimeout,
                    format!("Job {external_id} did not finish within {timeout:?}"),
                ));
            }

            let expired = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            };
            // an unanswered poll is dropped on cancellation or at the deadline
            let polled = tokio::select! {
                biased;
                _ = self.signal.token().cancelled() => continue,
                _ = expired => continue,
                polled = self.backend.poll(external_id) => polled,
            };
            let state = match polled {
                Ok(state) => state,
                Err(e) => {
                    warn!(job_id = %external_id, "Poll failed: {e}");
                    continue;
                }
            };
            self.tracker.polled(self.index, &state);
            debug!(job_id = %external_id, ?state, "Polled");

            match state {
                SchedulerState::Pending => unknown_polls = 0,
                SchedulerState::Running => {
                    unknown_polls = 0;
                    if let Err(e) = self.tracker.running(self.index) {
                        error!("{e}");
                    }
                }
                SchedulerState::Succeeded => {
                    return match inspect_marker(&self.descriptor).await {
                        Ok(MarkerStatus::Clean { result }) => Verdict::Succeeded(result),
                        Ok(MarkerStatus::Unclean { reason }) => {
                            Verdict::Failed(Failure::new(FailureKind::Execution, reason))
                        }
                        Ok(MarkerStatus::Missing) => Verdict::Failed(Failure::new(
                            FailureKind::Execution,
                            "Scheduler reported success but the completion marker is missing",
                        )),
                        Err(e) => Verdict::Failed(Failure::new(
                            FailureKind::Execution,
                            format!("Completion marker unreadable: {e}"),
                        )),
                    };
                }
                SchedulerState::Failed(message) => {
                    return Verdict::Failed(Failure::new(FailureKind::Execution, message));
                }
                SchedulerState::Cancelled => {
                    return Verdict::Failed(Failure::new(
                        FailureKind::Execution,
                        "Job was cancelled by the scheduler",
                    ));
                }
                SchedulerState::Unknown => match inspect_marker(&self.descriptor).await {
                    Ok(MarkerStatus::Clean { result }) => return Verdict::Succeeded(result),
                    Ok(MarkerStatus::Unclean { reason }) => {
                        return Verdict::Failed(Failure::new(FailureKind::Execution, reason));
                    }
                    Ok(MarkerStatus::Missing) | Err(_) => {
                        unknown_polls += 1;
                        if unknown_polls > self.config.unknown_grace_polls {
                            return Verdict::Failed(Failure::new(
                                FailureKind::Execution,
                                "Scheduler has no record of the job and no completion marker was written",
                            ));
                        }
                    }
                },
            }
        }
    }

    /// Resubmits if retries are left. Returns `false` once the job is terminal.
    async fn retry_or_fail(&self, failure: Failure) -> bool {
        if self.tracker.attempt(self.index) >= self.config.max_retries {
            error!(kind = ?failure.kind, "Job failed: {}", failure.message);
            self.finish_failed(failure);
            return false;
        }

        let retry = match self.tracker.retry(self.index, &failure.message) {
            Ok(retry) => retry,
            Err(e) => {
                error!("{e}");
                self.finish_failed(failure);
                return false;
            }
        };
        warn!(retry, kind = ?failure.kind, "Retrying job: {}", failure.message);

        if !self.backoff(retry).await {
            self.tracker.cancel(self.index);
            return false;
        }
        true
    }

    fn finish_failed(&self, failure: Failure) {
        if let Err(e) = self.tracker.fail(self.index, failure) {
            error!("{e}");
        }
        if self.config.fail_fast && !self.signal.is_cancelled() {
            warn!("Failing fast, cancelling the batch");
            self.signal.cancel(CancelReason::FailFast {
                ordinal: self.descriptor.ordinal,
            });
        }
    }

    /// Waits out the backoff before a retry. Returns `false` if cancelled meanwhile.
    async fn backoff(&self, retry: u32) -> bool {
        let delay = self.config.backoff(retry);
        if delay.is_zero() {
            return !self.signal.is_cancelled();
        }
        wait_or_cancel(delay, &self.signal).await
    }

    async fn cancel_remote(&self, external_id: &str) {
        match self.backend.cancel(external_id).await {
            Ok(CancelOutcome::Cancelled) => debug!(job_id = %external_id, "Cancelled"),
            Ok(CancelOutcome::NoSuchJob) => {
                debug!(job_id = %external_id, "Already gone from the scheduler")
            }
            Err(e) => warn!(job_id = %external_id, "Cancel failed: {e}"),
        }
    }
}

async fn wait_or_cancel(delay: Duration, signal: &BatchSignal) -> bool {
    tokio::select! {
        biased;
        _ = signal.token().cancelled() => false,
        _ = sleep(delay) => true,
    }
}
