//! Dispatcher command.

use console::style;

use citycatpg::config::Settings;

/// Consume the queue until drained (with `close`) or interrupted.
#[cfg(feature = "amqp-broker")]
pub async fn cmd_serve(settings: &Settings) -> anyhow::Result<()> {
    use std::sync::Arc;

    use crate::cli::helpers::build_pipeline;
    use citycatpg::dispatch;
    use citycatpg::repository::redact_url_password;
    use citycatpg::shutdown::install_shutdown_handler;

    let pipeline = Arc::new(build_pipeline(settings)?);
    pipeline.configs().ensure_table().await?;

    let options = settings.dispatch_options();
    println!(
        "{} Consuming '{}' on {} ({} at a time{})",
        style("→").cyan(),
        options.queue,
        redact_url_password(&settings.broker_url),
        options.concurrency,
        if options.drain_on_empty { ", until drained" } else { "" }
    );
    if !options.drain_on_empty {
        println!("  Press Ctrl+C to stop");
    }

    let shutdown = install_shutdown_handler();
    let summary = dispatch::start(pipeline, &settings.broker_url, options, shutdown).await?;

    println!(
        "{} {} delivered: {} succeeded, {} failed, {} unresolved, {} duplicate, {} released",
        style("✓").green(),
        summary.delivered,
        summary.succeeded,
        summary.failed,
        summary.unresolved,
        summary.duplicates,
        summary.released
    );
    Ok(())
}

#[cfg(not(feature = "amqp-broker"))]
pub async fn cmd_serve(_settings: &Settings) -> anyhow::Result<()> {
    eprintln!("{} built without the `amqp-broker` feature", style("✗").red());
    anyhow::bail!("no broker support in this build")
}
