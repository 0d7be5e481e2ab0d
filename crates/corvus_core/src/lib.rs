//! # Corvus Core
//!
//! Types and traits of the corvus batch launcher.
//!
//! Defines the contract between the launcher and the schedulers it drives.
//!
//! - **[`RunSpec`](run::RunSpec)**: One resolved run of a sweep, with its parameters and output directory.
//! - **[`JobDescriptor`](descriptor::JobDescriptor)**: The submission unit built from a run, see [`DescriptorBuilder`](descriptor::DescriptorBuilder).
//! - **[`SchedulerBackend`](traits::SchedulerBackend)**: Trait for implementing scheduler adapters (e.g., SLURM, PBS).
//! - **[`BatchResult`](job::BatchResult)**: Ordered outcomes handed back to the caller.
//!
//! A job is only considered successful when the scheduler reports success *and*
//! its [completion marker](marker) says the program exited cleanly.

pub mod config;
pub mod constants;
pub mod descriptor;
pub mod error;
pub mod job;
pub mod marker;
pub mod run;
pub mod script;
pub mod traits;

pub mod prelude {
    pub use super::config::*;
    pub use super::constants;
    pub use super::descriptor::*;
    pub use super::error::*;
    pub use super::job::*;
    pub use super::marker::*;
    pub use super::run::*;
    pub use super::script::*;
    pub use super::traits::*;
}
