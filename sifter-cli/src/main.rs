// Sifter command line interface
// Runs one pipeline stage per process, or the whole pipeline in one process

use anyhow::Context;
use clap::{Parser, Subcommand};
use sifter_core::PipelineConfig;
use sifter_queue::WorkQueue;
use sifter_stage::{run_extract, run_person, run_pipeline, run_scan, RunMode, StageContext};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sifter")]
#[command(about = "Queue-coordinated image filtering pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Debug logging, unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage 1: scan the collection and forward items showing a car
    Scan {
        /// Continue an interrupted scan: items it already enqueued are not sent again
        #[arg(long)]
        resume: bool,
    },

    /// Stage 2: forward scanned items that also show a person
    Filter {
        /// Continue an interrupted filter: items it already enqueued are not sent again
        #[arg(long)]
        resume: bool,
    },

    /// Stage 3: write the text found in each filtered item to the output file
    Extract {
        /// Append to the output file instead of starting it over
        #[arg(long)]
        resume: bool,
    },

    /// All three stages in this process
    Run {
        /// Continue an interrupted run, appending to the output file
        #[arg(long)]
        resume: bool,
    },

    /// Queue maintenance
    #[command(subcommand)]
    Queue(QueueCommands),
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show queue depth
    Stats {
        /// Queue name
        name: String,
    },

    /// Drop every message and dedup key of a queue
    Purge {
        /// Queue name
        name: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::from_env());
    };
    let mut config =
        PipelineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    config.apply_env();
    Ok(config)
}

fn init_logging(log_level: &str, verbose: bool) {
    let fallback = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn run_mode(resume: bool) -> RunMode {
    if resume {
        RunMode::Resume
    } else {
        RunMode::Fresh
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config.log_level, cli.verbose);

    let ctx = StageContext::from_config(config).context("invalid configuration")?;

    match cli.command {
        Commands::Scan { resume } => {
            let report = run_scan(&ctx, run_mode(resume))
                .await
                .context("scan stage failed")?;
            info!("Scan finished: {:?}", report);
        }
        Commands::Filter { resume } => {
            let report = run_person(&ctx, run_mode(resume))
                .await
                .context("filter stage failed")?;
            info!("Filter finished: {:?}", report);
        }
        Commands::Extract { resume } => {
            let report = run_extract(&ctx, run_mode(resume).sink_mode())
                .await
                .context("extraction stage failed")?;
            info!("Extraction finished: {:?}", report);
        }
        Commands::Run { resume } => {
            let report = run_pipeline(&ctx, run_mode(resume))
                .await
                .context("pipeline failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Queue(cmd) => handle_queue_command(&ctx, cmd).await?,
    }

    Ok(())
}

async fn handle_queue_command(ctx: &StageContext, cmd: QueueCommands) -> anyhow::Result<()> {
    let result = match cmd {
        QueueCommands::Stats { name } => match ctx.queue(&name).await {
            Ok(queue) => queue.stats().await.map_err(anyhow::Error::from).map(|stats| {
                println!("{}: {} visible, {} in flight", name, stats.visible, stats.in_flight);
            }),
            Err(e) => Err(e.into()),
        },
        QueueCommands::Purge { name } => match ctx.queue(&name).await {
            Ok(queue) => queue.purge().await.map_err(anyhow::Error::from).map(|()| {
                println!("Purged {}", name);
            }),
            Err(e) => Err(e.into()),
        },
    };

    ctx.close().await?;
    result
}
