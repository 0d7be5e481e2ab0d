pub mod files {
    /// Written by the job (or its wrapper script) when the target program exits.
    pub const COMPLETION_MARKER: &str = ".corvus_complete";
    pub const PARAMS: &str = "params.json";
    pub const SCRIPT: &str = "job.sh";
    pub const STDOUT: &str = "stdout.log";
    pub const STDERR: &str = "stderr.log";
}

pub mod env {
    pub const OUTPUT_DIR: &str = "CORVUS_OUTPUT_DIR";
    pub const COMPLETION_MARKER: &str = "CORVUS_COMPLETION_MARKER";
    pub const ORDINAL: &str = "CORVUS_ORDINAL";
}

pub mod params {
    /// Parameters with this key prefix are forwarded after a `--` separator.
    pub const LAUNCH_PREFIX: &str = "+launch.";
    /// Replaces the entry point of a single run instead of being forwarded.
    pub const SCRIPT_OVERRIDE: &str = "+launch.script";
    pub const SEPARATOR: &str = "--";
}

/// Longest job name handed to a scheduler.
pub const MAX_JOB_NAME_LEN: usize = 200;
