//! Job pipeline: fetch → assemble → solve → convert.
//!
//! [`JobRunner`] is the seam the dispatcher drives. [`JobPipeline`] is the
//! production implementation; each stage fails closed for its own job.

mod error;
mod retry;

pub use error::PipelineError;
pub use retry::RetryPolicy;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::assemble::InputAssembler;
use crate::convert::{Artifacts, OutputConverter};
use crate::models::JobConfig;
use crate::repository::JobConfigRepository;
use crate::solver::{prepare_run_dir, write_inputs, SolverInvoker};

/// Terminal result of a job that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Artifacts),
    /// Inputs were written but no solver is configured.
    SolverUnavailable { run_dir: PathBuf },
}

/// Work performed for one queue message.
///
/// `fetch` resolves the configuration and runs on the dispatcher task, so it
/// must stay cheap. `run` does the heavy lifting on a worker.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn fetch(&self, job_id: &str) -> Result<JobConfig, PipelineError>;

    async fn run(&self, config: JobConfig) -> Result<JobOutcome, PipelineError>;
}

/// The production job pipeline.
#[derive(Clone)]
pub struct JobPipeline {
    configs: JobConfigRepository,
    assembler: InputAssembler,
    solver: SolverInvoker,
    converter: Arc<OutputConverter>,
    run_path: PathBuf,
    stamp_retry: RetryPolicy,
}

impl JobPipeline {
    pub fn new(
        configs: JobConfigRepository,
        assembler: InputAssembler,
        solver: SolverInvoker,
        converter: OutputConverter,
        run_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            configs,
            assembler,
            solver,
            converter: Arc::new(converter),
            run_path: run_path.into(),
            stamp_retry: RetryPolicy::default(),
        }
    }

    /// Retry settings for the completion stamp, which is written after the
    /// solver has already produced its outputs.
    pub fn with_stamp_retry(mut self, policy: RetryPolicy) -> Self {
        self.stamp_retry = policy;
        self
    }

    pub fn configs(&self) -> &JobConfigRepository {
        &self.configs
    }

    /// Fetch and run a job in one call, with no broker involved.
    pub async fn execute(&self, job_id: &str) -> Result<JobOutcome, PipelineError> {
        let config = self.fetch(job_id).await?;
        self.run(config).await
    }
}

#[async_trait]
impl JobRunner for JobPipeline {
    async fn fetch(&self, job_id: &str) -> Result<JobConfig, PipelineError> {
        Ok(self.configs.fetch(job_id).await?)
    }

    async fn run(&self, config: JobConfig) -> Result<JobOutcome, PipelineError> {
        config.validate()?;
        let job_id = config.run_id.clone();
        let input = Arc::new(self.assembler.assemble(&config).await?);

        let run_dir = prepare_run_dir(&self.run_path, &config.slug()).await?;
        {
            let (dir, input) = (run_dir.clone(), Arc::clone(&input));
            tokio::task::spawn_blocking(move || write_inputs(&dir, &input)).await??;
        }
        info!(job_id = %job_id, stage = "solve", run_dir = %run_dir.display(), "Wrote solver inputs");

        if !self.solver.is_configured() {
            warn!(job_id = %job_id, "No solver configured, leaving inputs in place");
            return Ok(JobOutcome::SolverUnavailable { run_dir });
        }

        if !self.configs.mark_started(&job_id, Utc::now()).await? {
            warn!(job_id = %job_id, "Run start already recorded");
        }
        let output = self.solver.invoke(&job_id, &run_dir).await?;

        let artifacts = {
            let converter = Arc::clone(&self.converter);
            let input = Arc::clone(&input);
            let config = config.clone();
            tokio::task::spawn_blocking(move || {
                converter.convert(&output, &input.terrain, &config)
            })
            .await??
        };

        // Outputs are final here; a missing end stamp does not fail the job.
        let finished_at = Utc::now();
        let (configs, id) = (&self.configs, job_id.as_str());
        let stamped = self
            .stamp_retry
            .run("mark_finished", move || async move {
                configs
                    .mark_finished(id, finished_at)
                    .await
                    .map_err(PipelineError::from)
            })
            .await;
        match stamped {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job_id, "Run end already recorded"),
            Err(e) => error!(
                job_id = %job_id,
                kind = e.kind(),
                archive = %artifacts.archive.display(),
                "Job completed but run end was not recorded: {}",
                e
            ),
        }
        Ok(JobOutcome::Completed(artifacts))
    }
}
