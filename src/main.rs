use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scene_narrator::config::NarratorConfig;
use scene_narrator::detection::{DetectionAdapter, Frame, ReplaySource};
use scene_narrator::pipeline::CommentaryPipeline;
use scene_narrator::provider::DescriptionProvider;
use scene_narrator::queue::DescriptionQueue;
use scene_narrator::remote_model::RemoteModel;

#[derive(Parser)]
#[command(name = "scene-narrator")]
#[command(about = "Throttled natural-language commentary over object detections")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "narrator.toml")]
    config: PathBuf,

    /// Recorded detections, one JSON record per line
    #[arg(short, long)]
    detections: PathBuf,

    /// Override the frame pace in milliseconds
    #[arg(long)]
    frame_interval_ms: Option<u64>,

    /// Describe scenery instead of people
    #[arg(long)]
    scenic: bool,

    /// Play the recording once, wait for outstanding commentary, then exit
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scene_narrator={}", log_level)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    info!("Starting scene-narrator");

    let mut config = NarratorConfig::load(&args.config).await?;
    if let Some(interval) = args.frame_interval_ms {
        config.sampling.frame_interval_ms = interval;
    }
    if args.scenic {
        config.commentary.scenic_mode = true;
    }
    // Recorded detections carry no pixels worth sending.
    config.commentary.attach_frames = false;
    info!("Configuration loaded successfully");

    let provider = build_provider(&config)?;
    let queue = DescriptionQueue::from_config(&config, provider);

    let mut source = ReplaySource::load(&args.detections)
        .await
        .with_context(|| format!("Failed to load detections from {}", args.detections.display()))?;
    if !args.once {
        source = source.repeating();
    }
    let faces = source.faces();
    let adapter = DetectionAdapter::new(
        Box::new(source),
        config.vision.confidence_threshold,
        config.vision.max_detections,
        config.vision.viewport(),
    );

    let (mut pipeline, mut commentary) =
        CommentaryPipeline::new(&config, adapter, Box::new(faces), queue.clone());

    let printer = tokio::spawn(async move {
        while let Some(line) = commentary.recv().await {
            println!("[{} people] {}", line.people, line.text);
        }
    });

    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop().await;
        }
    });

    let frames = spawn_frame_clock(&config);
    match pipeline.run(frames).await {
        Ok(count) => info!("Replay finished after {} frames", count),
        Err(e) => error!("Pipeline error: {}", e),
    }

    queue.close();
    queue.join().await;
    let stats = queue.stats();
    info!(
        "📊 Descriptions: {} succeeded, {} degraded, {} rate limited, {} backoff waits",
        stats.succeeded, stats.degraded, stats.rate_limited, stats.backoff_waits
    );

    drop(pipeline);
    if let Err(e) = printer.await {
        warn!("Commentary printer failed: {}", e);
    }
    Ok(())
}

/// `None` when no credential is configured, which keeps every description local.
fn build_provider(config: &NarratorConfig) -> Result<Option<Arc<dyn DescriptionProvider>>> {
    match config.resolve_api_key() {
        Some(key) => {
            let model = RemoteModel::new(&config.remote, &key)?;
            Ok(Some(Arc::new(model)))
        }
        None => {
            warn!("No API key configured, commentary will use local descriptions");
            Ok(None)
        }
    }
}

/// Stands in for a camera: blank viewport-sized frames at the configured pace.
fn spawn_frame_clock(config: &NarratorConfig) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(4);
    let interval = config.sampling.frame_interval().max(std::time::Duration::from_millis(1));
    let (width, height) = (config.vision.width, config.vision.height);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if tx.send(Frame::new(width, height, 3)).await.is_err() {
                break;
            }
        }
    });
    rx
}
