use crate::descriptor::JobDescriptor;
use crate::error::*;
use crate::job::{CancelOutcome, SchedulerState};

/// A trait for plugging an external batch scheduler into the launcher.
///
/// The scheduler is polled, never pushed to. Implementations must be safe to
/// call concurrently from many jobs' tasks and serialize internally if their
/// client requires it.
pub trait SchedulerBackend: Send + Sync + 'static {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Optional: Checks that the scheduler is reachable before a batch starts.
    fn init(&self) -> impl Future<Output = Result<(), SchedulerError>> + Send {
        async { Ok(()) }
    }

    /// Submits a job and returns its external id.
    fn submit(
        &self,
        descriptor: &JobDescriptor,
    ) -> impl Future<Output = Result<String, SubmissionError>> + Send;

    /// Queries the current state of a submitted job.
    fn poll(
        &self,
        external_id: &str,
    ) -> impl Future<Output = Result<SchedulerState, SchedulerError>> + Send;

    /// Best-effort cancellation. [`CancelOutcome::NoSuchJob`] is not an error.
    fn cancel(
        &self,
        external_id: &str,
    ) -> impl Future<Output = Result<CancelOutcome, SchedulerError>> + Send;

    /// Returns the script a submission would hand to the scheduler, for dry runs.
    fn render(&self, descriptor: &JobDescriptor) -> String {
        crate::script::render_script(&[], descriptor)
    }
}
