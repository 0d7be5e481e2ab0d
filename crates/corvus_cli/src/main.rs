use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corvus_launcher::prelude::*;
use corvus_pbs::{PbsBackend, PbsConfig};
use corvus_slurm::{SlurmBackend, SlurmConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "corvus")]
#[command(about = "Launch parameter sweeps on HPC schedulers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a batch of runs and wait for all of them
    Run {
        /// Launcher configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Run specs (JSON array)
        #[arg(short, long)]
        runs: PathBuf,

        #[arg(long, env = "CORVUS_BACKEND")]
        backend: Option<BackendKind>,

        #[arg(long, env = "CORVUS_MAX_CONCURRENT")]
        max_concurrent: Option<usize>,

        #[arg(long, env = "CORVUS_MAX_RETRIES")]
        max_retries: Option<u32>,

        #[arg(long, env = "CORVUS_FAIL_FAST")]
        fail_fast: bool,

        /// Account charged for the jobs
        #[arg(long, env = "CORVUS_ACCOUNT")]
        account: Option<String>,

        /// Print the job scripts instead of submitting them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the default launcher configuration
    Defaults,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            runs,
            backend,
            max_concurrent,
            max_retries,
            fail_fast,
            account,
            dry_run,
        } => {
            let mut config: LauncherConfig = read_json(&config)?;
            let specs: Vec<RunSpec> = read_json(&runs)?;

            if let Some(backend) = backend {
                config.scheduler_backend = backend;
            }
            if let Some(max_concurrent) = max_concurrent {
                config.max_concurrent = max_concurrent;
            }
            if let Some(max_retries) = max_retries {
                config.max_retries = max_retries;
            }
            config.fail_fast |= fail_fast;

            match config.scheduler_backend {
                BackendKind::Slurm => {
                    let mut slurm = SlurmConfig::default();
                    slurm.account = account;
                    launch(SlurmBackend::new(slurm), config, specs, dry_run).await
                }
                BackendKind::Pbs => {
                    let mut pbs = PbsConfig::default();
                    pbs.account = account;
                    launch(PbsBackend::new(pbs), config, specs, dry_run).await
                }
            }
        }
        Commands::Defaults => {
            println!("{}", serde_json::to_string_pretty(&LauncherConfig::default())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn launch<B: SchedulerBackend>(
    backend: B,
    config: LauncherConfig,
    specs: Vec<RunSpec>,
    dry_run: bool,
) -> Result<ExitCode> {
    let coordinator = BatchCoordinator::new(backend, config);

    if dry_run {
        for (name, script) in coordinator.dry_run(&specs).await? {
            println!("# {name}\n{script}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling submitted jobs");
                cancel.cancel();
            }
        }
    });

    let result = coordinator
        .run_until(&specs, cancel)
        .await
        .context("Batch could not be launched")?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("Cannot parse {}", path.display()))
}
