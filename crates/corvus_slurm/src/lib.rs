//! # Corvus SLURM
//!
//! Scheduler backend for SLURM, driven through the `sbatch`, `squeue`, `sacct`
//! and `scancel` command line tools.
//!
//! ## Usage
//!
//! ```no_run
//! use corvus_slurm::{SlurmBackend, SlurmConfig};
//!
//! let backend = SlurmBackend::new(SlurmConfig::default().with_account("proj-42"));
//! ```

use corvus_core::prelude::*;

use std::io::ErrorKind;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Paths of the SLURM tools and site-wide submission settings.
#[derive(Debug, Clone)]
pub struct SlurmConfig {
    pub sbatch: String,
    pub squeue: String,
    pub sacct: String,
    pub scancel: String,
    /// Charged with `--account` when set.
    pub account: Option<String>,
    /// Passed to `sbatch` before the script path.
    pub extra_args: Vec<String>,
    /// Longest a single tool call may take. A slower call is killed and counts as transient.
    pub command_timeout: Duration,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
            account: None,
            extra_args: Vec::new(),
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl SlurmConfig {
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Points every tool at `dir`, e.g. a site install outside `PATH`.
    pub fn with_bin_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        let dir = dir.as_ref();
        let path = |tool: &str| dir.join(tool).to_string_lossy().into_owned();
        self.sbatch = path("sbatch");
        self.squeue = path("squeue");
        self.sacct = path("sacct");
        self.scancel = path("scancel");
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SlurmBackend {
    config: SlurmConfig,
}

impl SlurmBackend {
    pub fn new(config: SlurmConfig) -> Self {
        Self { config }
    }

    pub fn directives(&self, descriptor: &JobDescriptor) -> Vec<String> {
        let resources = &descriptor.resources;
        let mut lines = vec![
            format!("#SBATCH --job-name={}", descriptor.name),
            format!("#SBATCH --output={}", descriptor.stdout.display()),
            format!("#SBATCH --error={}", descriptor.stderr.display()),
            format!("#SBATCH --chdir={}", descriptor.workdir.display()),
            "#SBATCH --ntasks=1".to_string(),
            format!("#SBATCH --cpus-per-task={}", resources.cores),
            format!("#SBATCH --mem={}G", resources.memory_gb),
            format!("#SBATCH --time={}", slurm_time(descriptor.walltime)),
        ];
        if resources.gpus > 0 {
            lines.push(match &resources.template {
                Some(model) => format!("#SBATCH --gres=gpu:{model}:{}", resources.gpus),
                None => format!("#SBATCH --gres=gpu:{}", resources.gpus),
            });
        }
        if let Some(queue) = &resources.queue {
            lines.push(format!("#SBATCH --partition={queue}"));
        }
        if let Some(account) = &self.config.account {
            lines.push(format!("#SBATCH --account={account}"));
        }
        lines
    }

    async fn squeue(&self, external_id: &str) -> Result<Option<SchedulerState>, SchedulerError> {
        let out = self
            .run(&self.config.squeue, ["-h", "-j", external_id, "-o", "%T"])
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("squeue: {e}")))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if is_invalid_job(&stderr) {
                return Ok(None);
            }
            return Err(SchedulerError::Unavailable(format!(
                "squeue exited with {}: {}",
                out.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|state| parse_state(state, None)))
    }

    async fn sacct(&self, external_id: &str) -> Result<Option<SchedulerState>, SchedulerError> {
        let out = self
            .run(
                &self.config.sacct,
                ["-n", "-X", "-P", "-j", external_id, "-o", "State,ExitCode"],
            )
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("sacct: {e}")))?;

        if !out.status.success() {
            return Err(SchedulerError::Unavailable(format!(
                "sacct exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(parse_sacct(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn run<'a>(
        &self,
        program: &str,
        args: impl IntoIterator<Item = &'a str>,
    ) -> std::io::Result<Output> {
        let mut command = Command::new(program);
        command.args(args);
        output(command, self.config.command_timeout).await
    }
}

impl SchedulerBackend for SlurmBackend {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn init(&self) -> Result<(), SchedulerError> {
        let out = self
            .run(&self.config.sbatch, ["--version"])
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("sbatch: {e}")))?;
        if !out.status.success() {
            return Err(SchedulerError::Unavailable(format!(
                "sbatch --version exited with {}",
                out.status
            )));
        }
        debug!(version = %String::from_utf8_lossy(&out.stdout).trim(), "SLURM available");
        Ok(())
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<String, SubmissionError> {
        let script = self.render(descriptor);
        atomic_write(&descriptor.script, script.as_bytes())
            .await
            .map_err(|e| {
                SubmissionError::Permanent(format!(
                    "Cannot write job script {}: {e}",
                    descriptor.script.display()
                ))
            })?;

        let mut command = Command::new(&self.config.sbatch);
        command
            .arg("--parsable")
            .args(&self.config.extra_args)
            .arg(&descriptor.script)
            .current_dir(&descriptor.workdir);
        let out = output(command, self.config.command_timeout)
            .await
            .map_err(|e| spawn_error("sbatch", e))?;

        if !out.status.success() {
            return Err(classify_submit_error(&String::from_utf8_lossy(&out.stderr)));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        parse_sbatch_output(&stdout).ok_or_else(|| {
            SubmissionError::Permanent(format!("Unexpected sbatch output: {}", stdout.trim()))
        })
    }

    async fn poll(&self, external_id: &str) -> Result<SchedulerState, SchedulerError> {
        if let Some(state) = self.squeue(external_id).await? {
            return Ok(state);
        }
        // finished jobs leave squeue after MinJobAge, sacct keeps them longer
        Ok(self
            .sacct(external_id)
            .await?
            .unwrap_or(SchedulerState::Unknown))
    }

    async fn cancel(&self, external_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let out = self
            .run(&self.config.scancel, [external_id])
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("scancel: {e}")))?;
        if out.status.success() {
            return Ok(CancelOutcome::Cancelled);
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        if is_invalid_job(&stderr) || stderr.contains("already completing or completed") {
            return Ok(CancelOutcome::NoSuchJob);
        }
        Err(SchedulerError::Protocol(format!(
            "scancel exited with {}: {}",
            out.status,
            stderr.trim()
        )))
    }

    fn render(&self, descriptor: &JobDescriptor) -> String {
        render_script(&self.directives(descriptor), descriptor)
    }
}

/// Runs `command` to completion, killing it once `limit` has passed.
async fn output(mut command: Command, limit: Duration) -> std::io::Result<Output> {
    command.kill_on_drop(true);
    tokio::time::timeout(limit, command.output())
        .await
        .map_err(|_| {
            std::io::Error::new(ErrorKind::TimedOut, format!("no answer within {limit:?}"))
        })?
}

fn spawn_error(program: &str, e: std::io::Error) -> SubmissionError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            SubmissionError::Permanent(format!("Cannot run {program}: {e}"))
        }
        _ => SubmissionError::Transient(format!("Cannot run {program}: {e}")),
    }
}

fn is_invalid_job(stderr: &str) -> bool {
    stderr.contains("Invalid job id")
}

/// `--time` in `D-HH:MM:SS`.
pub fn slurm_time(walltime: Duration) -> String {
    let secs = walltime.as_secs();
    let days = secs / 86_400;
    let rest = secs % 86_400;
    format!(
        "{days}-{:02}:{:02}:{:02}",
        rest / 3600,
        (rest % 3600) / 60,
        rest % 60
    )
}

/// Reads the job id from `sbatch --parsable` (`id[;cluster]`) or plain `sbatch` output.
pub fn parse_sbatch_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    let id = line
        .strip_prefix("Submitted batch job ")
        .unwrap_or(line)
        .split(';')
        .next()?
        .trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| id.to_string())
}

/// Controller hiccups and submit limits clear up on their own; everything else is the script's fault.
pub fn classify_submit_error(stderr: &str) -> SubmissionError {
    const TRANSIENT: [&str; 7] = [
        "Socket timed out",
        "Unable to contact slurm controller",
        "slurm_load_jobs error",
        "QOSMaxSubmitJob",
        "AssocMaxSubmitJobLimit",
        "temporarily unavailable",
        "try again",
    ];
    let message = stderr.trim().to_string();
    if TRANSIENT
        .iter()
        .any(|pattern| message.to_lowercase().contains(&pattern.to_lowercase()))
    {
        SubmissionError::Transient(message)
    } else {
        SubmissionError::Permanent(message)
    }
}

/// Maps a SLURM job state (`squeue %T` or `sacct State`) to a [`SchedulerState`].
pub fn parse_state(state: &str, exit_code: Option<&str>) -> SchedulerState {
    // sacct reports e.g. "CANCELLED by 1000"
    let state = state.split_whitespace().next().unwrap_or_default();
    match state.trim_end_matches('+') {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESIZING" => {
            SchedulerState::Pending
        }
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "SUSPENDED" | "STOPPED" => {
            SchedulerState::Running
        }
        "COMPLETED" => SchedulerState::Succeeded,
        "CANCELLED" => SchedulerState::Cancelled,
        "BOOT_FAIL" | "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "TIMEOUT" | "DEADLINE"
        | "PREEMPTED" | "SPECIAL_EXIT" | "REVOKED" => SchedulerState::Failed(match exit_code {
            Some(code) => format!("{state} (exit code {code})"),
            None => state.to_string(),
        }),
        _ => SchedulerState::Unknown,
    }
}

/// Parses `sacct -n -X -P -o State,ExitCode`. [`None`] if sacct has no record.
pub fn parse_sacct(stdout: &str) -> Option<SchedulerState> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split('|');
    let state = fields.next()?;
    Some(parse_state(state, fields.next()))
}
