//! # Corvus
//!
//! Runs parameter sweeps as batch jobs on HPC schedulers.
//!
//! Every run of a sweep becomes one scheduler job. Corvus keeps the number of
//! jobs in flight under a ceiling, resubmits failed jobs with backoff, confirms
//! success through a completion marker the job writes on clean exit, and hands
//! back one outcome per run in the order the runs were given.
//!
//! This crate serves as an entry point, re-exporting the core types and
//! optionally including the launcher and scheduler backends via feature flags.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **`launcher`** | Throttle, job tracker and batch coordinator (`corvus_launcher`). Enabled by default. |
//! | **`slurm`** | Scheduler backend for SLURM (`corvus_slurm`). |
//! | **`pbs`** | Scheduler backend for PBS Pro / Torque (`corvus_pbs`). |
//! | **`mock`** | Scripted in-memory scheduler for tests (`corvus_mock`). |
//!
//! ## Example
//!
//! ```toml
//! [dependencies]
//! corvus = { version = "0.3", features = ["slurm"] }
//! ```
//!
//! ```rust,ignore
//! use corvus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), LaunchError> {
//!     let config = LauncherConfig {
//!         command: vec!["python".into(), "train.py".into()],
//!         max_concurrent: 8,
//!         ..Default::default()
//!     };
//!     let specs: Vec<_> = (0..4)
//!         .map(|i| RunSpec::new(i, format!("/scratch/sweep/{i}")).with_param("seed", i.to_string()))
//!         .collect();
//!
//!     let result = BatchCoordinator::new(SlurmBackend::default(), config)
//!         .run(&specs)
//!         .await?;
//!
//!     for entry in &result.entries {
//!         println!("{}: {:?}", entry.ordinal, entry.outcome);
//!     }
//!     Ok(())
//! }
//! ```

pub use corvus_core::*;

#[cfg(feature = "launcher")]
pub mod launcher {
    pub use corvus_launcher::*;
}

#[cfg(feature = "slurm")]
pub mod slurm {
    pub use corvus_slurm::*;
}

#[cfg(feature = "pbs")]
pub mod pbs {
    pub use corvus_pbs::*;
}

#[cfg(feature = "mock")]
pub mod mock {
    pub use corvus_mock::*;
}

pub mod prelude {
    pub use corvus_core::prelude::*;

    #[cfg(feature = "launcher")]
    pub use corvus_launcher::prelude::*;

    #[cfg(feature = "slurm")]
    pub use corvus_slurm::{SlurmBackend, SlurmConfig};

    #[cfg(feature = "pbs")]
    pub use corvus_pbs::{PbsBackend, PbsConfig};

    #[cfg(feature = "mock")]
    pub use corvus_mock::MockScheduler;
}
