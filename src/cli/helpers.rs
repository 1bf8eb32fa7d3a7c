//! Shared helper functions for CLI commands.

use std::sync::Arc;

use anyhow::Context;

use citycatpg::assemble::InputAssembler;
use citycatpg::config::Settings;
use citycatpg::convert::OutputConverter;
use citycatpg::pipeline::JobPipeline;
use citycatpg::repository::{redact_url_password, DbPool, JobConfigRepository};
use citycatpg::solver::SolverInvoker;
use citycatpg::spatial::SpatialStore;

/// Open the job configuration table named in the settings.
pub fn open_repository(settings: &Settings) -> anyhow::Result<JobConfigRepository> {
    let url = settings.database_url();
    let pool = DbPool::from_url(&url, settings.pool_size, settings.no_tls)
        .with_context(|| format!("Failed to open {}", redact_url_password(&url)))?;
    Ok(JobConfigRepository::new(pool, &settings.run_table)?)
}

#[cfg(feature = "postgres")]
fn open_spatial_store(settings: &Settings) -> anyhow::Result<Arc<dyn SpatialStore>> {
    use citycatpg::repository::pool::PgPool;
    use citycatpg::spatial::PostgisStore;

    let url = settings
        .spatial_database_url
        .as_deref()
        .context("spatial_database_url is not set (config or SPATIAL_DATABASE_URL)")?;
    let pool = PgPool::new(url, settings.pool_size, settings.no_tls)
        .with_context(|| format!("Failed to open {}", redact_url_password(url)))?;
    Ok(Arc::new(PostgisStore::new(pool)))
}

#[cfg(not(feature = "postgres"))]
fn open_spatial_store(_settings: &Settings) -> anyhow::Result<Arc<dyn SpatialStore>> {
    anyhow::bail!("the spatial data store requires the `postgres` feature")
}

/// Wire the production pipeline from settings.
pub fn build_pipeline(settings: &Settings) -> anyhow::Result<JobPipeline> {
    settings.ensure_directories()?;

    let configs = open_repository(settings)?;
    let store = open_spatial_store(settings)?;
    let solver = SolverInvoker::new(settings.solver.clone(), settings.solver_timeout);
    if !solver.is_configured() {
        tracing::warn!("No solver configured; jobs will stop after writing inputs");
    }

    Ok(JobPipeline::new(
        configs,
        InputAssembler::new(store, settings.rainfall_unit),
        solver,
        OutputConverter::new(&settings.out_path),
        &settings.run_path,
    )
    .with_stamp_retry(settings.retry.clone()))
}
