//! Command-line interface for callforge.
//!
//! Provides the long-running `worker` command plus small operability
//! commands for enqueueing test jobs and inspecting queue depths.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config::WorkerConfig;
use crate::gateway::PostgresGateway;
use crate::pipeline::CampaignPipeline;
use crate::scheduler::{CampaignJob, CampaignQueue, CampaignType, EnqueueOptions};
use crate::scripts::ScriptLibrary;
use crate::telephony::HttpVoiceProvider;

/// Outbound voice-campaign worker.
#[derive(Parser)]
#[command(name = "callforge")]
#[command(about = "Schedule and execute outbound voice-call campaigns")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker process consuming all campaign queues.
    Worker,

    /// Enqueue a single campaign job.
    #[command(alias = "enq")]
    Enqueue(EnqueueArgs),

    /// Print depth counters for every campaign queue.
    Status(StatusArgs),
}

/// Arguments for `callforge enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Campaign type (e.g. REACTIVATION).
    #[arg(long)]
    pub campaign_type: CampaignType,

    /// Tenant to place the call for.
    #[arg(long)]
    pub tenant_id: String,

    /// Destination phone number (E.164).
    #[arg(long)]
    pub phone: String,

    /// Customer record id, when known.
    #[arg(long)]
    pub customer_id: Option<String>,

    /// Script language override.
    #[arg(long)]
    pub language: Option<String>,

    /// Delay before the job becomes visible, in seconds.
    #[arg(long)]
    pub delay_secs: Option<u64>,

    /// Priority hint; higher is dequeued sooner.
    #[arg(long, default_value = "0")]
    pub priority: i32,

    /// Queue service URL.
    #[arg(long, env = "CALLFORGE_REDIS_URL", default_value = "redis://localhost:6379/0")]
    pub redis_url: String,
}

/// Arguments for `callforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Queue service URL.
    #[arg(long, env = "CALLFORGE_REDIS_URL", default_value = "redis://localhost:6379/0")]
    pub redis_url: String,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker => run_worker().await,
        Commands::Enqueue(args) => run_enqueue(args).await,
        Commands::Status(args) => run_status(args).await,
    }
}

async fn run_worker() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("loading worker configuration")?;

    crate::metrics::init_metrics().context("initializing metrics")?;

    let gateway = PostgresGateway::connect(&config.database_url)
        .await
        .context("connecting to data store")?;
    let telephony = HttpVoiceProvider::new(&config.voice_api_url, &config.voice_api_token);
    let scripts = ScriptLibrary::load_default().context("loading call scripts")?;

    let pipeline = Arc::new(CampaignPipeline::new(
        Arc::new(gateway),
        Arc::new(telephony),
        Arc::new(scripts),
        config.callback_url.clone(),
    ));

    let manager = crate::lifecycle::build_worker(config, pipeline).await?;
    manager.run().await
}

async fn run_enqueue(args: EnqueueArgs) -> anyhow::Result<()> {
    let queue = CampaignQueue::connect(&args.redis_url, args.campaign_type)
        .await
        .context("connecting to queue service")?;

    let mut job = CampaignJob::new(args.campaign_type, args.tenant_id, args.phone);
    if let Some(customer_id) = args.customer_id {
        job = job.with_customer_id(customer_id);
    }
    if let Some(language) = args.language {
        job = job.with_language(language);
    }

    let mut options = EnqueueOptions::default().with_priority(args.priority);
    if let Some(secs) = args.delay_secs {
        options = options.with_delay(Duration::from_secs(secs));
    }

    let job_id = queue.enqueue(job, options).await?;
    info!(%job_id, queue = args.campaign_type.queue_name(), "Job enqueued");
    println!("{}", job_id);

    Ok(())
}

async fn run_status(args: StatusArgs) -> anyhow::Result<()> {
    println!(
        "{:<28} {:>8} {:>11} {:>8} {:>10} {:>7}",
        "queue", "pending", "processing", "delayed", "completed", "failed"
    );

    for campaign in CampaignType::ALL {
        let queue = CampaignQueue::connect(&args.redis_url, campaign)
            .await
            .context("connecting to queue service")?;
        let depths = queue.stats().await?;
        println!(
            "{:<28} {:>8} {:>11} {:>8} {:>10} {:>7}",
            depths.queue_name,
            depths.pending,
            depths.processing,
            depths.delayed,
            depths.completed,
            depths.failed
        );
    }

    Ok(())
}
