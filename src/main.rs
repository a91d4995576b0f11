use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use sifter::config::{load_dotenv, Config};
use sifter::database::Frequency;
use sifter::orchestrator::OrchestratorStage;
use sifter::queue::{InlineContext, Worker};
use sifter::services::Services;
use sifter::stages::{
    AnalysisStage, AssemblyStage, CurationStage, OrchestratorPayload, TranscriptionStage,
    ANALYSIS_QUEUE, CURATION_QUEUE, DIGEST_QUEUE, ORCHESTRATOR_QUEUE, TRANSCRIPTION_QUEUE,
};

#[derive(Parser)]
#[command(
    name = "sifter",
    version,
    about = "Personalized podcast audio digests: transcribe, curate, narrate, stitch"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and data directories
    Init,

    /// Run the queue workers until interrupted
    Serve,

    /// Run one digest pipeline for a user, end to end
    Digest {
        /// User id
        #[arg(long)]
        user: String,

        /// Episode window: daily (24h) or weekly (7d)
        #[arg(long, default_value = "daily")]
        frequency: String,
    },

    /// Show queue and episode status counts
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv(Path::new(".env"));
    let config = Config::from_env();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init(config).await,
        Commands::Serve => serve(config).await,
        Commands::Digest { user, frequency } => digest(config, &user, &frequency).await,
        Commands::Status => status(config),
    }
}

async fn init(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.temp_root)
        .with_context(|| format!("creating {:?}", config.temp_root))?;
    std::fs::create_dir_all(&config.digest_root)
        .with_context(|| format!("creating {:?}", config.digest_root))?;
    sifter::database::Database::new(&config.database_path)?;

    let audio = sifter::audio::AudioToolkit::new(config.ffmpeg_path, config.ffprobe_path);
    if !audio.available().await {
        log::warn!("ffmpeg not found; transcription chunking and assembly will fail");
    }
    println!("Initialized database and data directories");
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let transcription_concurrency = config.transcription_concurrency;
    let services = Services::from_config(config)?;
    let db = services.db.clone();

    let requeued = db.reset_stuck_jobs()?;
    if requeued > 0 {
        log::info!("Requeued {} jobs left active by a previous run", requeued);
    }

    let cancel = CancellationToken::new();
    let workers = [
        Worker::new(
            db.clone(),
            TRANSCRIPTION_QUEUE,
            Arc::new(TranscriptionStage::new(services.clone())),
            transcription_concurrency,
            cancel.clone(),
        ),
        Worker::new(
            db.clone(),
            ANALYSIS_QUEUE,
            Arc::new(AnalysisStage::new(services.clone())),
            2,
            cancel.clone(),
        ),
        Worker::new(
            db.clone(),
            CURATION_QUEUE,
            Arc::new(CurationStage::new(services.clone())),
            1,
            cancel.clone(),
        ),
        Worker::new(
            db.clone(),
            DIGEST_QUEUE,
            Arc::new(AssemblyStage::new(services.clone())),
            1,
            cancel.clone(),
        ),
        Worker::new(
            db.clone(),
            ORCHESTRATOR_QUEUE,
            Arc::new(OrchestratorStage::new(services.clone())),
            1,
            cancel.clone(),
        ),
    ];

    let mut handles = Vec::new();
    for worker in workers {
        handles.push(tokio::spawn(worker.run()));
    }
    log::info!("sifter worker process running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down workers");
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn digest(config: Config, user_id: &str, frequency: &str) -> anyhow::Result<()> {
    let frequency = Frequency::from(frequency.to_string());
    let services = Services::from_config(config)?;

    let stage = OrchestratorStage::new(services);
    let payload = OrchestratorPayload {
        user_id: user_id.to_string(),
        frequency,
    };
    let ctx = InlineContext::new(
        format!("cli-digest-{user_id}"),
        serde_json::to_value(&payload)?,
    );

    let outcome = stage.run_digest(&ctx, user_id, frequency).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn status(config: Config) -> anyhow::Result<()> {
    // Status only needs the store, not the adapter credentials
    let db = sifter::database::Database::new(&config.database_path)?;

    println!("queues:");
    for (queue, status, count) in db.queue_counts()? {
        println!("  {queue:<14} {status:<10} {count}");
    }
    println!("episodes:");
    for (status, count) in db.episode_status_counts()? {
        println!("  {status:<14} {count}");
    }
    Ok(())
}
