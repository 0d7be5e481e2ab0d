//! # Corvus Launcher
//!
//! Submits a batch of runs to an HPC scheduler and follows every job to a terminal state.
//!
//! Provides the [`BatchCoordinator`](coordinator::BatchCoordinator), which ties a
//! [`SchedulerBackend`](corvus_core::traits::SchedulerBackend) to a
//! [`LauncherConfig`](corvus_core::config::LauncherConfig).
//!
//! ## Lifecycle
//!
//! Each run gets its own task. The task waits for capacity in the
//! [`SubmissionThrottle`](throttle::SubmissionThrottle), submits, then polls until the
//! scheduler reports a terminal state. Failures are resubmitted with exponential
//! backoff until `max_retries` is spent. All state lives in the
//! [`JobTracker`](tracker::JobTracker).
//!
//! ## Example
//!
//! ```no_run
//! use corvus_launcher::prelude::*;
//! use corvus_mock::MockScheduler;
//!
//! # async fn run() -> Result<(), LaunchError> {
//! let config = LauncherConfig {
//!     command: vec!["python".into(), "train.py".into()],
//!     ..Default::default()
//! };
//! let specs = vec![RunSpec::new(0, "/scratch/sweep/0").with_param("lr", "0.1")];
//!
//! let result = BatchCoordinator::new(MockScheduler::new(), config).run(&specs).await?;
//! assert_eq!(result.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod schedule;
pub mod signal;
pub mod throttle;
pub mod tracker;

pub mod prelude {
    pub use crate::coordinator::BatchCoordinator;
    pub use crate::schedule::PollSchedule;
    pub use crate::signal::BatchSignal;
    pub use crate::throttle::SubmissionThrottle;
    pub use crate::tracker::JobTracker;
    pub use corvus_core::prelude::*;
    pub use tokio_util::sync::CancellationToken;
}
