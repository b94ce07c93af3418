//! jobq CLI tool.

use anyhow::Context;
use clap::{Parser, Subcommand};
use jobq_config::{LogFormat, LoggingConfig, SystemConfig, load_system_config};
use jobq_db::{PgJobStore, create_pool};
use jobq_scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "jobq")]
#[command(about = "Persistent job queue administration", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, env = "JOBQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Submit a job
    Submit {
        /// Command the job runs
        command: String,
        /// Job arguments; JSON primitives are parsed, anything else is a string
        args: Vec<String>,
        /// Ids of jobs that must finish first
        #[arg(long = "after")]
        after: Vec<i64>,
        /// Reuse an existing job with the same command and arguments
        #[arg(long)]
        dedup: bool,
    },
    /// Show a job
    Show {
        /// Job ID
        id: i64,
    },
    /// List jobs
    List {
        /// Only show jobs in this state
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of jobs to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show the next startable job without claiming it
    Next,
    /// Close a job and cascade to its dependents
    Close {
        /// Job ID
        id: i64,
        /// Final state: finished, failed, terminated or canceled
        state: String,
    },
    /// Count jobs per state
    Stats,
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "jobq.kdl")]
        path: PathBuf,
    },
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn connect(config: &SystemConfig) -> anyhow::Result<Scheduler> {
    info!("Connecting to database...");
    let pool = create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    info!("Database connected");
    Ok(Scheduler::new(Arc::new(PgJobStore::new(pool))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }

    let config = load_system_config(cli.config.as_deref()).context("Failed to load config")?;
    init_tracing(&config.logging);

    if let Commands::Migrate = cli.command {
        return commands::migrate(&config).await;
    }

    let scheduler = connect(&config).await?;

    match cli.command {
        Commands::Submit {
            command,
            args,
            after,
            dedup,
        } => {
            commands::jobs::submit(&scheduler, &command, &args, &after, dedup).await?;
        }
        Commands::Show { id } => {
            commands::jobs::show(&scheduler, id).await?;
        }
        Commands::List { state, limit } => {
            commands::jobs::list(&scheduler, state.as_deref(), limit).await?;
        }
        Commands::Next => {
            commands::jobs::next(&scheduler).await?;
        }
        Commands::Close { id, state } => {
            commands::jobs::close(&scheduler, id, &state).await?;
        }
        Commands::Stats => {
            commands::jobs::stats(&scheduler).await?;
        }
        Commands::Migrate | Commands::Validate { .. } => {}
    }

    Ok(())
}
