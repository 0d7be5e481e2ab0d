use crate::signal::BatchSignal;
use crate::throttle::SubmissionThrottle;
use crate::tracker::{JobDriver, JobTracker};

use corvus_core::prelude::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Runs batches of [`RunSpec`]s against one scheduler backend.
pub struct BatchCoordinator<B> {
    backend: Arc<B>,
    config: Arc<LauncherConfig>,
}

impl<B> Clone for BatchCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: SchedulerBackend> BatchCoordinator<B> {
    pub fn new(backend: B, config: LauncherConfig) -> Self {
        Self::from_shared(Arc::new(backend), config)
    }

    /// Shares a backend that the caller keeps a handle to.
    pub fn from_shared(backend: Arc<B>, config: LauncherConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Builds the descriptor of every run. Fails as a whole if any run is invalid.
    pub async fn prepare(&self, specs: &[RunSpec]) -> Result<Vec<JobDescriptor>, LaunchError> {
        let builder = DescriptorBuilder::new(&self.config)?;

        let mut seen = HashSet::with_capacity(specs.len());
        if let Some(spec) = specs.iter().find(|spec| !seen.insert(spec.ordinal)) {
            return Err(LaunchError::InvalidConfiguration(format!(
                "Duplicate run ordinal {}",
                spec.ordinal
            )));
        }

        // Runs sharing a directory would share a completion marker.
        let mut workdirs = HashMap::with_capacity(specs.len());
        let mut descriptors = Vec::with_capacity(specs.len());
        for spec in specs {
            if let Ok(existing) = tokio::fs::canonicalize(&spec.output_dir).await {
                if let Some(other) = workdirs.get(&existing) {
                    return Err(LaunchError::InvalidConfiguration(format!(
                        "Runs {other} and {} share output directory {}",
                        spec.ordinal,
                        existing.display()
                    )));
                }
            }

            let descriptor = builder.build(spec).await.map_err(|e| match e {
                LaunchError::InvalidConfiguration(msg) => {
                    LaunchError::InvalidConfiguration(format!("Run {}: {msg}", spec.ordinal))
                }
                other => {
                    LaunchError::InvalidConfiguration(format!("Run {}: {other}", spec.ordinal))
                }
            })?;
            workdirs.insert(descriptor.workdir.clone(), spec.ordinal);
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    /// Renders the submission script of every run without contacting the scheduler.
    pub async fn dry_run(&self, specs: &[RunSpec]) -> Result<Vec<(String, String)>, LaunchError> {
        Ok(self
            .prepare(specs)
            .await?
            .into_iter()
            .map(|descriptor| {
                let script = self.backend.render(&descriptor);
                (descriptor.name, script)
            })
            .collect())
    }

    /// Runs a batch to completion.
    pub async fn run(&self, specs: &[RunSpec]) -> Result<BatchResult, LaunchError> {
        self.run_until(specs, CancellationToken::new()).await
    }

    /// Runs a batch until every job is terminal or `cancel` fires.
    ///
    /// Configuration errors are returned before anything is submitted. Once jobs are
    /// submitted the result always covers every run, in input order.
    #[instrument(skip_all, fields(backend = self.backend.name(), runs = specs.len()))]
    pub async fn run_until(
        &self,
        specs: &[RunSpec],
        cancel: CancellationToken,
    ) -> Result<BatchResult, LaunchError> {
        let descriptors = self.prepare(specs).await?;
        if descriptors.is_empty() {
            return Ok(BatchResult::default());
        }

        self.backend
            .init()
            .await
            .map_err(|e| LaunchError::SchedulerUnavailable(e.to_string()))?;

        let descriptors: Vec<_> = descriptors.into_iter().map(Arc::new).collect();
        let tracker = Arc::new(JobTracker::new(descriptors.iter().cloned()));
        let throttle = Arc::new(SubmissionThrottle::new(
            self.config.max_concurrent,
            self.config.min_submit_interval,
        ));
        let signal = BatchSignal::new(cancel.child_token());

        info!(
            max_concurrent = self.config.max_concurrent,
            max_retries = self.config.max_retries,
            "Launching batch"
        );

        let mut drivers = JoinSet::new();
        for (index, descriptor) in descriptors.into_iter().enumerate() {
            let driver = JobDriver {
                backend: self.backend.clone(),
                tracker: tracker.clone(),
                throttle: throttle.clone(),
                config: self.config.clone(),
                signal: signal.clone(),
                descriptor,
                index,
            };
            drivers.spawn(driver.run());
        }

        let deadline = self.config.batch_timeout.map(|t| Instant::now() + t);
        loop {
            let timeout = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                joined = drivers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => error!("Job driver stopped abnormally: {e}"),
                    None => break,
                },
                _ = timeout, if !signal.is_cancelled() => {
                    warn!("Batch timeout reached, cancelling remaining jobs");
                    signal.cancel(CancelReason::BatchTimeout);
                }
            }
        }

        for external_id in tracker.unfinished_ids() {
            match self.backend.cancel(&external_id).await {
                Ok(_) => warn!(job_id = %external_id, "Cancelled job left by a stopped driver"),
                Err(e) => warn!(job_id = %external_id, "Cancel failed: {e}"),
            }
        }
        let abandoned = tracker.cancel_unfinished();
        if abandoned > 0 {
            warn!(abandoned, "Jobs left unfinished");
        }

        let result = tracker.results(signal.reason());
        let succeeded = result.outcomes().filter(|o| o.is_success()).count();
        let not_completed = result
            .outcomes()
            .filter(|o| matches!(o, Outcome::NotCompleted))
            .count();
        info!(
            succeeded,
            failed = result.len() - succeeded - not_completed,
            not_completed,
            peak_in_flight = result.peak_in_flight,
            "Batch finished"
        );
        Ok(result)
    }
}
