//! # Corvus Mock
//!
//! A scripted, in-memory scheduler for development and testing.
//!
//! Jobs never run. The scheduler plays back a script per run ordinal and writes
//! completion markers itself, the way a real job would on exit.
//!
//! **DO NOT use this in production!!!**
//!
//! ## Usage
//!
//! ```rust
//! # use corvus_mock::{MockScheduler, Run, Submit};
//! # fn main() {
//! let scheduler = MockScheduler::new()
//!     .script(0, [Submit::Transient, Submit::Accept(Run::Succeed { polls: 2 })])
//!     .script(1, [Submit::Accept(Run::Fail { exit_code: 3 })]);
//! # }
//! ```

use corvus_core::prelude::*;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// How a submit call is answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Submit {
    Accept(Run),
    Transient,
    Permanent,
}

/// What an accepted job does once it is "running".
#[derive(Debug, Clone, PartialEq)]
pub enum Run {
    /// Runs for `polls` polls, writes a clean marker and succeeds.
    Succeed { polls: u32 },
    /// The scheduler reports success but the program never wrote its marker.
    SucceedWithoutMarker,
    /// Writes a marker with `exit_code` and is reported failed.
    Fail { exit_code: i32 },
    /// Stays running until cancelled.
    Hang,
    /// The scheduler forgets the job. With `marker` set the job finished cleanly first.
    Vanish { marker: bool },
    /// Polls never answer, like a hung scheduler command.
    Unresponsive,
    /// Polling the job panics. The job stays active until cancelled.
    Crash,
}

#[derive(Debug)]
struct MockJob {
    ordinal: usize,
    run: Run,
    marker: PathBuf,
    polls: u32,
    finished: bool,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<usize, VecDeque<Submit>>,
    jobs: HashMap<String, MockJob>,
    next_id: u64,
    submits: HashMap<usize, u32>,
    cancels: Vec<String>,
    active: usize,
    peak_active: usize,
}

impl State {
    fn finish(&mut self, external_id: &str) {
        if let Some(job) = self.jobs.get_mut(external_id) {
            if !job.finished {
                job.finished = true;
                self.active -= 1;
            }
        }
    }
}

/// Scheduler that answers from per-ordinal scripts. Unscripted submissions succeed after one poll.
#[derive(Debug)]
pub struct MockScheduler {
    state: Mutex<State>,
    default_run: Run,
    available: bool,
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

enum Action {
    Report(SchedulerState),
    WriteMarker(PathBuf, CompletionMarker, SchedulerState),
    Stall,
    Crash,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            default_run: Run::Succeed { polls: 1 },
            available: true,
        }
    }

    /// Answers for the submissions of one run, in order.
    pub fn script(self, ordinal: usize, submits: impl IntoIterator<Item = Submit>) -> Self {
        self.lock()
            .scripts
            .entry(ordinal)
            .or_default()
            .extend(submits);
        self
    }

    /// Behaviour of jobs without a script entry left.
    pub fn with_default(mut self, run: Run) -> Self {
        self.default_run = run;
        self
    }

    /// Makes [`SchedulerBackend::init`] fail.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of submit calls made for a run, refused ones included.
    pub fn submit_count(&self, ordinal: usize) -> u32 {
        self.lock().submits.get(&ordinal).copied().unwrap_or(0)
    }

    pub fn total_submits(&self) -> u32 {
        self.lock().submits.values().sum()
    }

    /// External ids `cancel` was called with, in call order.
    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancels.clone()
    }

    /// External ids accepted for a run, oldest first.
    pub fn ids_for(&self, ordinal: usize) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<(u64, String)> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.ordinal == ordinal)
            .filter_map(|(id, _)| id.parse().ok().map(|n| (n, id.clone())))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Highest number of accepted jobs that were not yet finished at the same time.
    pub fn peak_active(&self) -> usize {
        self.lock().peak_active
    }
}

impl SchedulerBackend for MockScheduler {
    fn name(&self) -> &str {
        "mock"
    }

    async fn init(&self) -> Result<(), SchedulerError> {
        if self.available {
            Ok(())
        } else {
            Err(SchedulerError::Unavailable("mock scheduler is offline".into()))
        }
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<String, SubmissionError> {
        let mut state = self.lock();
        *state.submits.entry(descriptor.ordinal).or_default() += 1;

        let next = state
            .scripts
            .get_mut(&descriptor.ordinal)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Submit::Accept(self.default_run.clone()));

        let run = match next {
            Submit::Accept(run) => run,
            Submit::Transient => {
                return Err(SubmissionError::Transient("QOSMaxSubmitJobPerUserLimit".into()));
            }
            Submit::Permanent => {
                return Err(SubmissionError::Permanent("Invalid partition name specified".into()));
            }
        };

        state.next_id += 1;
        let external_id = state.next_id.to_string();
        state.jobs.insert(
            external_id.clone(),
            MockJob {
                ordinal: descriptor.ordinal,
                run,
                marker: descriptor.marker.clone(),
                polls: 0,
                finished: false,
            },
        );
        state.active += 1;
        state.peak_active = state.peak_active.max(state.active);

        debug!(ordinal = descriptor.ordinal, job_id = %external_id, "Mock job accepted");
        Ok(external_id)
    }

    async fn poll(&self, external_id: &str) -> Result<SchedulerState, SchedulerError> {
        let action = {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(external_id) else {
                return Ok(SchedulerState::Unknown);
            };
            job.polls += 1;

            let action = match &job.run {
                _ if job.finished && job.run == Run::Hang => Action::Report(SchedulerState::Cancelled),
                Run::Hang => Action::Report(SchedulerState::Running),
                Run::Succeed { polls } if job.polls <= *polls => {
                    Action::Report(SchedulerState::Running)
                }
                Run::Succeed { .. } => Action::WriteMarker(
                    job.marker.clone(),
                    CompletionMarker::clean(),
                    SchedulerState::Succeeded,
                ),
                Run::SucceedWithoutMarker => Action::Report(SchedulerState::Succeeded),
                Run::Fail { exit_code } => Action::WriteMarker(
                    job.marker.clone(),
                    CompletionMarker::exited(*exit_code),
                    SchedulerState::Failed(format!("NonZeroExitCode {exit_code}")),
                ),
                Run::Vanish { marker: true } if !job.finished => Action::WriteMarker(
                    job.marker.clone(),
                    CompletionMarker::clean(),
                    SchedulerState::Unknown,
                ),
                Run::Vanish { .. } => Action::Report(SchedulerState::Unknown),
                Run::Unresponsive => Action::Stall,
                Run::Crash => Action::Crash,
            };

            let terminal = match &action {
                Action::Report(s) | Action::WriteMarker(_, _, s) => !matches!(
                    s,
                    SchedulerState::Running | SchedulerState::Pending
                ),
                Action::Stall | Action::Crash => false,
            };
            if terminal {
                state.finish(external_id);
            }
            action
        };

        match action {
            Action::Report(state) => Ok(state),
            Action::WriteMarker(path, marker, state) => {
                write_marker(&path, &marker)
                    .await
                    .map_err(|e| SchedulerError::Protocol(e.to_string()))?;
                Ok(state)
            }
            Action::Stall => std::future::pending().await,
            Action::Crash => panic!("mock scheduler crashed while polling job {external_id}"),
        }
    }

    async fn cancel(&self, external_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let mut state = self.lock();
        state.cancels.push(external_id.to_string());
        match state.jobs.get(external_id) {
            Some(job) if !job.finished => {
                state.finish(external_id);
                Ok(CancelOutcome::Cancelled)
            }
            _ => Ok(CancelOutcome::NoSuchJob),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn descriptor(ordinal: usize) -> JobDescriptor {
        let workdir = std::env::temp_dir().join(format!("corvus_mock_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&workdir).unwrap();
        JobDescriptor {
            ordinal,
            name: format!("job_{ordinal}"),
            argv: vec!["true".into()],
            env: BTreeMap::new(),
            resources: ResourceRequest::default(),
            walltime: Duration::from_secs(60),
            stdout: workdir.join("stdout.log"),
            stderr: workdir.join("stderr.log"),
            marker: workdir.join(".corvus_complete"),
            script: workdir.join("job.sh"),
            workdir,
        }
    }

    #[tokio::test]
    async fn plays_back_script_then_default() {
        let mock = MockScheduler::new().script(0, [Submit::Transient, Submit::Permanent]);
        let d = descriptor(0);

        assert!(mock.submit(&d).await.unwrap_err().is_transient());
        assert!(!mock.submit(&d).await.unwrap_err().is_transient());
        let id = mock.submit(&d).await.unwrap();

        assert_eq!(mock.poll(&id).await.unwrap(), SchedulerState::Running);
        assert_eq!(mock.poll(&id).await.unwrap(), SchedulerState::Succeeded);
        assert_eq!(
            inspect_marker(&d).await.unwrap(),
            MarkerStatus::Clean {
                result: d.workdir.clone()
            }
        );
        assert_eq!(mock.submit_count(0), 3);
        assert_eq!(mock.ids_for(0), vec![id]);
    }

    #[tokio::test]
    async fn cancel_finishes_hanging_job() {
        let mock = MockScheduler::new().with_default(Run::Hang);
        let d = descriptor(1);
        let id = mock.submit(&d).await.unwrap();

        assert_eq!(mock.poll(&id).await.unwrap(), SchedulerState::Running);
        assert_eq!(mock.cancel(&id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(mock.cancel(&id).await.unwrap(), CancelOutcome::NoSuchJob);
        assert_eq!(mock.poll(&id).await.unwrap(), SchedulerState::Cancelled);
        assert_eq!(mock.cancelled(), vec![id.clone(), id]);
        assert_eq!(mock.peak_active(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "crashed while polling")]
    async fn crashing_job_panics_on_poll() {
        let mock = MockScheduler::new().with_default(Run::Crash);
        let id = mock.submit(&descriptor(2)).await.unwrap();
        let _ = mock.poll(&id).await;
    }

    #[tokio::test]
    async fn unknown_ids_are_unknown() {
        let mock = MockScheduler::new();
        assert_eq!(mock.poll("404").await.unwrap(), SchedulerState::Unknown);
        assert_eq!(mock.cancel("404").await.unwrap(), CancelOutcome::NoSuchJob);
    }
}
