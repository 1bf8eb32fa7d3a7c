//! Run a single job without the broker.

use console::style;

use crate::cli::helpers::build_pipeline;
use citycatpg::config::Settings;
use citycatpg::pipeline::JobOutcome;

pub async fn cmd_run(settings: &Settings, job_id: &str) -> anyhow::Result<()> {
    let pipeline = build_pipeline(settings)?;

    match pipeline.execute(job_id).await? {
        JobOutcome::Completed(artifacts) => {
            println!("{} Job {} completed", style("✓").green(), job_id);
            println!("  Archive:   {}", artifacts.archive.display());
            println!("  Max depth: {}", artifacts.max_depth.display());
            println!("  Timesteps: {}", artifacts.timesteps);
        }
        JobOutcome::SolverUnavailable { run_dir } => {
            println!(
                "{} No solver configured; inputs written to {}",
                style("!").yellow(),
                run_dir.display()
            );
        }
    }
    Ok(())
}
