//! Submit command.

use std::path::Path;

use anyhow::Context;
use console::style;

use crate::cli::helpers::open_repository;
use citycatpg::config::Settings;
use citycatpg::models::JobConfig;

/// Parse a job configuration file by extension.
fn parse_job(contents: &str, path: &Path) -> anyhow::Result<JobConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let config = match ext {
        "json" => serde_json::from_str(contents)?,
        "yaml" | "yml" => serde_yaml::from_str(contents)?,
        _ => toml::from_str(contents)?,
    };
    Ok(config)
}

/// Store a job configuration and publish its id.
pub async fn cmd_submit(settings: &Settings, file: &Path, publish: bool) -> anyhow::Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut config = parse_job(&contents, file)
        .with_context(|| format!("Invalid job configuration in {}", file.display()))?;

    if config.hostname.is_none() {
        config.hostname = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned());
    }

    let repo = open_repository(settings)?;
    repo.add(&config).await?;
    println!(
        "{} Stored job {} in '{}'",
        style("✓").green(),
        config.run_id,
        repo.table()
    );

    if publish {
        publish_job(settings, &config.run_id).await?;
        println!(
            "{} Queued {} on '{}'",
            style("✓").green(),
            config.run_id,
            settings.queue
        );
    }
    Ok(())
}

#[cfg(feature = "amqp-broker")]
async fn publish_job(settings: &Settings, job_id: &str) -> anyhow::Result<()> {
    citycatpg::dispatch::submit(&settings.broker_url, &settings.queue, job_id).await?;
    Ok(())
}

#[cfg(not(feature = "amqp-broker"))]
async fn publish_job(_settings: &Settings, _job_id: &str) -> anyhow::Result<()> {
    anyhow::bail!("publishing requires the `amqp-broker` feature; use --no-publish")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_formats() {
        let toml = r#"
            run_id = "abc"
            run_name = "storm"
            run_duration = 3600
            rain_total = 40.0
            rain_duration = 1800
        "#;
        let config = parse_job(toml, Path::new("job.toml")).unwrap();
        assert_eq!(config.run_id, "abc");
        assert_eq!(config.rain_total, Some(40.0));
        assert!(config.validate().is_ok());

        let json = r#"{"run_duration": 600, "rain_total": 5.0, "rain_duration": 60}"#;
        let config = parse_job(json, Path::new("job.json")).unwrap();
        assert!(!config.run_id.is_empty());
        assert_eq!(config.output_frequency, citycatpg::models::DEFAULT_OUTPUT_FREQUENCY);
    }

    #[test]
    fn test_parse_job_rejects_garbage() {
        assert!(parse_job("run_duration = \"soon\"", Path::new("job.toml")).is_err());
    }
}
