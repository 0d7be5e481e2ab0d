use crate::config::LauncherConfig;
use crate::constants::{MAX_JOB_NAME_LEN, files, params};
use crate::error::LaunchError;
use crate::run::RunSpec;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Resources requested for every job of a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceRequest {
    pub cores: u32,
    /// Memory in GiB.
    pub memory_gb: u32,
    pub gpus: u32,
    /// `HH:MM:SS` or `D-HH:MM:SS`.
    pub walltime: String,
    /// Queue or partition. [`None`] uses the scheduler's default.
    pub queue: Option<String>,
    /// Optional node/GPU template, passed to backends that support it.
    pub template: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cores: 2,
            memory_gb: 16,
            gpus: 0,
            walltime: "48:00:00".to_string(),
            queue: None,
            template: None,
        }
    }
}

impl ResourceRequest {
    pub fn validate(&self, known_queues: &[String]) -> Result<(), LaunchError> {
        if self.cores == 0 {
            return Err(LaunchError::InvalidConfiguration(
                "resources.cores must be at least 1".into(),
            ));
        }
        if self.memory_gb == 0 {
            return Err(LaunchError::InvalidConfiguration(
                "resources.memory_gb must be at least 1".into(),
            ));
        }
        self.walltime()?;
        if let Some(queue) = &self.queue {
            if !known_queues.is_empty() && !known_queues.contains(queue) {
                return Err(LaunchError::InvalidConfiguration(format!(
                    "Unknown queue '{queue}', expected one of: {}",
                    known_queues.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn walltime(&self) -> Result<Duration, LaunchError> {
        parse_walltime(&self.walltime)
    }
}

/// Parses `HH:MM:SS`, `MM:SS` or `D-HH:MM:SS`. The result must be positive.
pub fn parse_walltime(raw: &str) -> Result<Duration, LaunchError> {
    let invalid = || LaunchError::InvalidConfiguration(format!("Invalid walltime '{raw}'"));

    let (days, clock) = match raw.trim().split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().map_err(|_| invalid())?, clock),
        None => (0, raw.trim()),
    };

    let parts = clock
        .split(':')
        .map(|p| p.parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;

    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return Err(invalid()),
    };
    if m >= 60 || s >= 60 {
        return Err(invalid());
    }

    let secs = days
        .checked_mul(24)
        .and_then(|hours| hours.checked_add(h))
        .and_then(|hours| hours.checked_mul(3600))
        .and_then(|secs| secs.checked_add(m * 60 + s))
        .ok_or_else(invalid)?;
    if secs == 0 {
        return Err(LaunchError::InvalidConfiguration(format!(
            "Walltime '{raw}' must be positive"
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Formats a duration as `HH:MM:SS`, hours unbounded.
pub fn format_walltime(walltime: Duration) -> String {
    let secs = walltime.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Serializes run parameters into `key=value` arguments for the target entry point.
///
/// Launcher-directed parameters (`+launch.<key>`) follow a `--` separator with
/// the prefix removed.
pub fn serialize_params(values: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(values.len() + 1);
    let mut launch = Vec::new();

    for (key, value) in values {
        match key.strip_prefix(params::LAUNCH_PREFIX) {
            Some(key) => launch.push(format!("{key}={value}")),
            None => args.push(format!("{key}={value}")),
        }
    }

    if !launch.is_empty() {
        args.push(params::SEPARATOR.to_string());
        args.extend(launch);
    }
    args
}

/// A self-contained submission unit derived from one [`RunSpec`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDescriptor {
    pub ordinal: usize,
    pub name: String,
    /// Full invocation: the configured command followed by the serialized parameters.
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
    pub resources: ResourceRequest,
    pub walltime: Duration,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Completion marker written on exit of the target program.
    pub marker: PathBuf,
    /// Where backends place the rendered job script.
    pub script: PathBuf,
}

/// Turns [`RunSpec`]s into [`JobDescriptor`]s for one batch.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder<'a> {
    config: &'a LauncherConfig,
    walltime: Duration,
}

impl<'a> DescriptorBuilder<'a> {
    /// Validates the static part of the configuration once for the whole batch.
    pub fn new(config: &'a LauncherConfig) -> Result<Self, LaunchError> {
        config.validate()?;
        let walltime = config.resources.walltime()?;
        Ok(Self { config, walltime })
    }

    pub fn job_name(&self, ordinal: usize) -> String {
        let mut name = format!("{}_{ordinal}", self.config.job_name.trim());
        if name.len() > MAX_JOB_NAME_LEN {
            let suffix = format!("_{ordinal}");
            let mut cut = MAX_JOB_NAME_LEN - suffix.len();
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
            name.push_str(&suffix);
        }
        name
    }

    /// Builds the descriptor and prepares the run's output directory.
    ///
    /// Creating an already existing directory is not an error.
    pub async fn build(&self, spec: &RunSpec) -> Result<JobDescriptor, LaunchError> {
        fs::create_dir_all(&spec.output_dir).await.map_err(|e| {
            LaunchError::InvalidConfiguration(format!(
                "Cannot create output directory {}: {e}",
                spec.output_dir.display()
            ))
        })?;
        let workdir = fs::canonicalize(&spec.output_dir).await?;

        write_params(&workdir, spec).await?;

        let mut values = spec.params.clone();
        let mut argv = match values.remove(params::SCRIPT_OVERRIDE) {
            Some(script) => self.entry_point(&script).await?,
            None => self.config.command.clone(),
        };
        argv.extend(serialize_params(&values));

        Ok(JobDescriptor {
            ordinal: spec.ordinal,
            name: self.job_name(spec.ordinal),
            argv,
            env: self.config.env.clone(),
            resources: self.config.resources.clone(),
            walltime: self.walltime,
            stdout: workdir.join(files::STDOUT),
            stderr: workdir.join(files::STDERR),
            marker: workdir.join(files::COMPLETION_MARKER),
            script: workdir.join(files::SCRIPT),
            workdir,
        })
    }

    /// The configured command with its last word replaced by `script`.
    ///
    /// A console script installed in a `bin` directory runs through the package
    /// manager instead.
    async fn entry_point(&self, script: &str) -> Result<Vec<String>, LaunchError> {
        let script = script.trim();
        if script.is_empty() {
            return Err(LaunchError::InvalidConfiguration(format!(
                "{} must name a script",
                params::SCRIPT_OVERRIDE
            )));
        }

        let path = Path::new(script);
        let resolved = fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let in_bin = resolved
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|dir| dir == "bin");

        if path.extension().is_none() && in_bin {
            let name = resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| script.to_string());
            return Ok(vec![self.config.package_manager.clone(), "run".into(), name]);
        }

        let mut argv = self.config.command.clone();
        match argv.last_mut() {
            Some(last) => *last = script.to_string(),
            None => argv.push(script.to_string()),
        }
        Ok(argv)
    }
}

async fn write_params(dir: &Path, spec: &RunSpec) -> Result<(), LaunchError> {
    let data = serde_json::to_vec_pretty(spec)?;
    atomic_write(&dir.join(files::PARAMS), &data).await?;
    Ok(())
}

/// Writes through a temporary file and a rename, so readers never see partial content.
pub async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, data).await?;
    fs::rename(&tmp_path, path).await
}
