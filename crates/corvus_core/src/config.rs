use crate::descriptor::ResourceRequest;
use crate::error::LaunchError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The scheduler a batch is submitted to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Slurm,
    Pbs,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slurm => f.write_str("slurm"),
            Self::Pbs => f.write_str("pbs"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slurm" => Ok(Self::Slurm),
            "pbs" => Ok(Self::Pbs),
            other => Err(LaunchError::InvalidConfiguration(format!(
                "Unsupported scheduler backend '{other}'"
            ))),
        }
    }
}

/// Static configuration of a batch launch.
///
/// Durations are read and written as (fractional) seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub scheduler_backend: BackendKind,
    /// Ceiling on jobs in `Pending`/`Running` at once.
    pub max_concurrent: usize,
    /// Resubmissions allowed per run after the first submission.
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_backoff_base * 2^(n-1)`, capped by `max_backoff`.
    #[serde(with = "secs")]
    pub retry_backoff_base: Duration,
    #[serde(with = "secs")]
    pub max_backoff: Duration,
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Fraction of `poll_interval` used as +/- jitter.
    pub poll_jitter: f64,
    /// Jobs older than this are polled with a doubling interval.
    #[serde(with = "secs")]
    pub poll_backoff_after: Duration,
    #[serde(with = "secs")]
    pub max_poll_interval: Duration,
    /// Wall-clock deadline per submission, measured from a successful submit.
    #[serde(with = "secs::option")]
    pub per_job_timeout: Option<Duration>,
    #[serde(with = "secs::option")]
    pub batch_timeout: Option<Duration>,
    /// Minimum gap between two submit calls.
    #[serde(with = "secs")]
    pub min_submit_interval: Duration,
    /// Consecutive `Unknown` polls without a completion marker before a job is failed.
    pub unknown_grace_polls: u32,
    pub fail_fast: bool,
    pub resources: ResourceRequest,
    /// Queue names the scheduler accepts. Empty means any.
    pub known_queues: Vec<String>,
    /// Job names are `{job_name}_{ordinal}`.
    pub job_name: String,
    /// The target entry point. Run parameters are appended as `key=value`.
    pub command: Vec<String>,
    /// Runs console scripts from a `bin` directory as `<package_manager> run <name>`.
    pub package_manager: String,
    /// Extra environment exported in every job script.
    pub env: BTreeMap<String, String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            scheduler_backend: BackendKind::default(),
            max_concurrent: 16,
            max_retries: 2,
            retry_backoff_base: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            poll_interval: Duration::from_secs(30),
            poll_jitter: 0.1,
            poll_backoff_after: Duration::from_secs(600),
            max_poll_interval: Duration::from_secs(120),
            per_job_timeout: None,
            batch_timeout: None,
            min_submit_interval: Duration::from_millis(200),
            unknown_grace_polls: 3,
            fail_fast: false,
            resources: ResourceRequest::default(),
            known_queues: Vec::new(),
            job_name: "job".to_string(),
            command: Vec::new(),
            package_manager: "uv".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl LauncherConfig {
    pub fn validate(&self) -> Result<(), LaunchError> {
        let invalid = |msg: &str| -> Result<(), LaunchError> {
            Err(LaunchError::InvalidConfiguration(msg.to_string()))
        };

        if self.max_concurrent == 0 {
            return invalid("max_concurrent must be at least 1");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be positive");
        }
        if !(0.0..1.0).contains(&self.poll_jitter) {
            return invalid("poll_jitter must be in [0, 1)");
        }
        if self.command.is_empty() {
            return invalid("command must name the target entry point");
        }
        if self.job_name.trim().is_empty() {
            return invalid("job_name must not be empty");
        }
        if let Some(timeout) = self.per_job_timeout {
            if timeout.is_zero() {
                return invalid("per_job_timeout must be positive");
            }
        }
        self.resources.validate(&self.known_queues)
    }

    /// Backoff before the given retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.retry_backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&d.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(deserializer)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
                .transpose()
        }
    }
}
