//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod execute;
mod init;
mod serve;
mod show;
mod submit;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use citycatpg::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "citycatpg")]
#[command(about = "Run CityCAT flood simulations from a work queue")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Create directories and the job configuration table
    Init,

    /// Store a job configuration and queue it
    Submit {
        /// Job configuration file (TOML, YAML or JSON)
        file: PathBuf,
        /// Store the configuration without publishing its id
        #[arg(long)]
        no_publish: bool,
    },

    /// Print a stored job configuration as JSON
    Show {
        job_id: String,
    },

    /// Run one job in-process, without the broker
    Run {
        job_id: String,
    },

    /// Consume the queue and run jobs
    Serve {
        /// Queue name (overrides config)
        #[arg(short, long)]
        queue: Option<String>,
        /// Jobs to run at once (overrides config)
        #[arg(short = 'j', long)]
        concurrency: Option<u16>,
        /// Exit once the queue is drained
        #[arg(long)]
        close: bool,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
    };
    let mut settings = load_settings_with_options(options)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Submit { file, no_publish } => {
            submit::cmd_submit(&settings, &file, !no_publish).await
        }
        Commands::Show { job_id } => show::cmd_show(&settings, &job_id).await,
        Commands::Run { job_id } => execute::cmd_run(&settings, &job_id).await,
        Commands::Serve {
            queue,
            concurrency,
            close,
        } => {
            if let Some(queue) = queue {
                settings.queue = queue;
            }
            if let Some(concurrency) = concurrency {
                settings.concurrency = concurrency;
            }
            settings.close |= close;
            serve::cmd_serve(&settings).await
        }
    }
}
