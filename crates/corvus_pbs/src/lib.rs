//! # Corvus PBS
//!
//! Scheduler backend for PBS Pro and Torque, driven through `qsub`, `qstat` and `qdel`.
//!
//! Finished jobs are looked up with `qstat -x`, which needs job history enabled on
//! the server. Torque keeps finished jobs as state `C` instead; turn history off
//! with [`PbsConfig::with_history`] there.

use corvus_core::prelude::*;

use std::io::ErrorKind;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PbsConfig {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
    pub account: Option<String>,
    pub extra_args: Vec<String>,
    /// Query finished jobs with `qstat -x`.
    pub history: bool,
    /// Longest a single tool call may take before it is killed.
    pub command_timeout: Duration,
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self {
            qsub: "qsub".to_string(),
            qstat: "qstat".to_string(),
            qdel: "qdel".to_string(),
            account: None,
            extra_args: Vec::new(),
            history: true,
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl PbsConfig {
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_history(mut self, history: bool) -> Self {
        self.history = history;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_bin_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        let dir = dir.as_ref();
        let path = |tool: &str| dir.join(tool).to_string_lossy().into_owned();
        self.qsub = path("qsub");
        self.qstat = path("qstat");
        self.qdel = path("qdel");
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PbsBackend {
    config: PbsConfig,
}

impl PbsBackend {
    pub fn new(config: PbsConfig) -> Self {
        Self { config }
    }

    pub fn directives(&self, descriptor: &JobDescriptor) -> Vec<String> {
        let resources = &descriptor.resources;

        let mut select = format!(
            "select=1:ncpus={}:mem={}gb",
            resources.cores, resources.memory_gb
        );
        if resources.gpus > 0 {
            select.push_str(&format!(":ngpus={}", resources.gpus));
            if let Some(model) = &resources.template {
                select.push_str(&format!(":gpu_model={model}"));
            }
        }

        let mut lines = vec![
            format!("#PBS -N {}", descriptor.name),
            format!("#PBS -o {}", descriptor.stdout.display()),
            format!("#PBS -e {}", descriptor.stderr.display()),
            format!("#PBS -l {select}"),
            format!("#PBS -l walltime={}", format_walltime(descriptor.walltime)),
        ];
        if let Some(queue) = &resources.queue {
            lines.push(format!("#PBS -q {queue}"));
        }
        if let Some(account) = &self.config.account {
            lines.push(format!("#PBS -A {account}"));
        }
        lines
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

impl SchedulerBackend for PbsBackend {
    fn name(&self) -> &str {
        "pbs"
    }

    async fn init(&self) -> Result<(), SchedulerError> {
        let out = self
            .run(&self.config.qstat, ["-B"])
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("qstat: {e}")))?;
        if !out.status.success() {
            return Err(SchedulerError::Unavailable(format!(
                "PBS server unreachable: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
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

        let mut command = Command::new(&self.config.qsub);
        command
            .args(&self.config.extra_args)
            .arg(&descriptor.script)
            .current_dir(&descriptor.workdir);
        let out = output(command, self.config.command_timeout)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    SubmissionError::Permanent(format!("Cannot run qsub: {e}"))
                }
                _ => SubmissionError::Transient(format!("Cannot run qsub: {e}")),
            })?;

        if !out.status.success() {
            return Err(classify_submit_error(&String::from_utf8_lossy(&out.stderr)));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        let id = stdout.trim();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(SubmissionError::Permanent(format!(
                "Unexpected qsub output: {id}"
            )));
        }
        Ok(id.to_string())
    }

    async fn poll(&self, external_id: &str) -> Result<SchedulerState, SchedulerError> {
        let mut args = vec!["-f"];
        if self.config.history {
            args.push("-x");
        }
        args.push(external_id);

        let out = self
            .run(&self.config.qstat, args)
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("qstat: {e}")))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if is_unknown_job(&stderr) {
                return Ok(SchedulerState::Unknown);
            }
            return Err(SchedulerError::Unavailable(format!(
                "qstat exited with {}: {}",
                out.status,
                stderr.trim()
            )));
        }

        let state = parse_qstat(&String::from_utf8_lossy(&out.stdout));
        debug!(job_id = external_id, ?state, "qstat");
        Ok(state)
    }

    async fn cancel(&self, external_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let out = self
            .run(&self.config.qdel, [external_id])
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("qdel: {e}")))?;
        if out.status.success() {
            return Ok(CancelOutcome::Cancelled);
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        if is_unknown_job(&stderr) {
            return Ok(CancelOutcome::NoSuchJob);
        }
        Err(SchedulerError::Protocol(format!(
            "qdel exited with {}: {}",
            out.status,
            stderr.trim()
        )))
    }

    fn render(&self, descriptor: &JobDescriptor) -> String {
        render_script(&self.directives(descriptor), descriptor)
    }
}

async fn output(mut command: Command, limit: Duration) -> std::io::Result<Output> {
    command.kill_on_drop(true);
    match tokio::time::timeout(limit, command.output()).await {
        Ok(out) => out,
        Err(_) => Err(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("no answer within {limit:?}"),
        )),
    }
}

fn is_unknown_job(stderr: &str) -> bool {
    stderr.contains("Unknown Job Id") || stderr.contains("Job has finished")
}

pub fn classify_submit_error(stderr: &str) -> SubmissionError {
    const TRANSIENT: [&str; 6] = [
        "maximum number of jobs",
        "per-user limit",
        "cannot connect to server",
        "connection refused",
        "server busy",
        "try again",
    ];
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if TRANSIENT.iter().any(|pattern| lower.contains(pattern)) {
        SubmissionError::Transient(message)
    } else {
        SubmissionError::Permanent(message)
    }
}

/// Maps the `job_state` and `Exit_status` attributes of `qstat -f` output.
pub fn parse_qstat(stdout: &str) -> SchedulerState {
    let mut job_state = None;
    let mut exit_status = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once(" = ") else {
            continue;
        };
        match key {
            "job_state" => job_state = Some(value.trim()),
            "Exit_status" => exit_status = value.trim().parse::<i32>().ok(),
            _ => {}
        }
    }

    match job_state {
        Some("Q" | "H" | "W" | "T") => SchedulerState::Pending,
        Some("R" | "E" | "S" | "U" | "B") => SchedulerState::Running,
        // finished subjob, without an exit status the marker decides
        Some("X") if exit_status.is_none() => SchedulerState::Unknown,
        Some("F" | "C" | "X") => match exit_status {
            Some(0) => SchedulerState::Succeeded,
            // PBS adds 256 to the number of the signal that killed the job
            Some(code) if code > 256 => {
                SchedulerState::Failed(format!("Killed by signal {}", code - 256))
            }
            Some(code) => SchedulerState::Failed(format!("Exit_status {code}")),
            None => SchedulerState::Cancelled,
        },
        _ => SchedulerState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn descriptor(workdir: PathBuf) -> JobDescriptor {
        JobDescriptor {
            ordinal: 0,
            name: "sweep_0".into(),
            argv: vec!["./simulate".into(), "steps=1000".into()],
            env: BTreeMap::new(),
            resources: ResourceRequest {
                cores: 4,
                memory_gb: 16,
                gpus: 1,
                walltime: "30:00:00".into(),
                queue: Some("workq".into()),
                template: None,
            },
            walltime: Duration::from_secs(30 * 3600),
            stdout: workdir.join("stdout.log"),
            stderr: workdir.join("stderr.log"),
            marker: workdir.join(".corvus_complete"),
            script: workdir.join("job.sh"),
            workdir,
        }
    }

    #[test]
    fn renders_directives() {
        let backend = PbsBackend::new(PbsConfig::default().with_account("hpc01"));
        let script = backend.render(&descriptor("/scratch/0".into()));

        assert!(script.starts_with("#!/bin/bash\n#PBS -N sweep_0\n"));
        assert!(script.contains("#PBS -l select=1:ncpus=4:mem=16gb:ngpus=1\n"));
        assert!(script.contains("#PBS -l walltime=30:00:00\n"));
        assert!(script.contains("#PBS -q workq\n"));
        assert!(script.contains("#PBS -A hpc01\n"));
        assert!(script.contains("#PBS -e /scratch/0/stderr.log\n"));
    }

    #[test]
    fn parses_qstat_full_output() {
        let running = "Job Id: 101.pbs01\n    Job_Name = sweep_0\n    job_state = R\n    queue = workq\n";
        assert_eq!(parse_qstat(running), SchedulerState::Running);

        let queued = "Job Id: 101.pbs01\n    job_state = Q\n";
        assert_eq!(parse_qstat(queued), SchedulerState::Pending);

        let done = "Job Id: 101.pbs01\n    job_state = F\n    Exit_status = 0\n";
        assert_eq!(parse_qstat(done), SchedulerState::Succeeded);

        let failed = "Job Id: 101.pbs01\n    job_state = F\n    Exit_status = 2\n";
        assert_eq!(
            parse_qstat(failed),
            SchedulerState::Failed("Exit_status 2".into())
        );

        let killed = "Job Id: 101.pbs01\n    job_state = F\n    Exit_status = 271\n";
        assert_eq!(
            parse_qstat(killed),
            SchedulerState::Failed("Killed by signal 15".into())
        );

        let subjob = "Job Id: 101[3].pbs01\n    job_state = X\n    Exit_status = 0\n";
        assert_eq!(parse_qstat(subjob), SchedulerState::Succeeded);

        let subjob = "Job Id: 101[4].pbs01\n    job_state = X\n";
        assert_eq!(parse_qstat(subjob), SchedulerState::Unknown);

        assert_eq!(parse_qstat(""), SchedulerState::Unknown);
    }

    #[test]
    fn classifies_submit_errors() {
        assert!(
            classify_submit_error("qsub: would exceed complex's per-user limit of jobs in 'Q' state")
                .is_transient()
        );
        assert!(classify_submit_error("qsub: cannot connect to server pbs01").is_transient());
        assert!(!classify_submit_error("qsub: Unknown queue").is_transient());
    }

    #[cfg(unix)]
    fn fake_tools<'a>(tools: impl IntoIterator<Item = (&'a str, &'a str)>) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = std::env::temp_dir().join(format!("corvus_pbs_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&bin).unwrap();
        for (name, body) in tools {
            let path = bin.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        bin
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drives_the_command_line_tools() {
        let bin = fake_tools([
            ("qsub", "echo 55.pbs01"),
            ("qstat", "printf 'Job Id: 55.pbs01\\n    job_state = F\\n    Exit_status = 1\\n'"),
            ("qdel", "echo 'qdel: Unknown Job Id 55.pbs01' >&2; exit 153"),
        ]);

        let workdir = bin.join("run");
        std::fs::create_dir_all(&workdir).unwrap();
        let backend = PbsBackend::new(PbsConfig::default().with_bin_dir(&bin));
        let d = descriptor(workdir);

        let id = backend.submit(&d).await.unwrap();
        assert_eq!(id, "55.pbs01");
        assert_eq!(
            backend.poll(&id).await.unwrap(),
            SchedulerState::Failed("Exit_status 1".into())
        );
        assert_eq!(backend.cancel(&id).await.unwrap(), CancelOutcome::NoSuchJob);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_qstat_is_killed_after_the_command_timeout() {
        let bin = fake_tools([("qstat", "exec sleep 30"), ("qdel", "exec sleep 30")]);
        let backend = PbsBackend::new(
            PbsConfig::default()
                .with_bin_dir(&bin)
                .with_command_timeout(Duration::from_millis(200)),
        );

        let polled = tokio::time::timeout(Duration::from_secs(5), backend.poll("55.pbs01"))
            .await
            .expect("poll did not return");
        assert!(matches!(polled, Err(SchedulerError::Unavailable(_))));

        let cancelled = tokio::time::timeout(Duration::from_secs(5), backend.cancel("55.pbs01"))
            .await
            .expect("cancel did not return");
        assert!(matches!(cancelled, Err(SchedulerError::Unavailable(_))));

        std::fs::remove_dir_all(bin).unwrap();
    }
}
