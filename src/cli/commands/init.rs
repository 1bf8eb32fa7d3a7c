//! Initialize command.

use console::style;

use crate::cli::helpers::open_repository;
use citycatpg::config::Settings;
use citycatpg::repository::redact_url_password;

/// Create the working directories and the job configuration table.
pub async fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    settings.ensure_directories()?;

    let repo = open_repository(settings)?;
    repo.ensure_table().await?;

    println!(
        "{} Table '{}' ready in {}",
        style("✓").green(),
        repo.table(),
        redact_url_password(&settings.database_url())
    );
    println!("  Runs:    {}", settings.run_path.display());
    println!("  Outputs: {}", settings.out_path.display());

    Ok(())
}
