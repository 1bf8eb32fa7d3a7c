//! Show command.

use crate::cli::helpers::open_repository;
use citycatpg::config::Settings;

/// Print a stored job configuration as JSON.
pub async fn cmd_show(settings: &Settings, job_id: &str) -> anyhow::Result<()> {
    let repo = open_repository(settings)?;
    let config = repo.fetch(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
