// Headless player for the playback engine
// Loads one file, plays it to the end and prints every notification

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tempoline::logging::init_logging;
use tempoline::{AudioEngine, DecoderKind, EngineConfig, EngineEvent, OutputKind};

/// Command-line arguments for tempoline-play
#[derive(Parser, Debug)]
#[command(author, version, about = "Play an audio file through the tempoline engine", long_about = None)]
struct Args {
    /// Audio file to play
    file: PathBuf,

    /// Directory holding engine.json
    #[arg(short, long, env = "TEMPOLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Use the WAV-only fallback decoder
    #[arg(long)]
    fallback: bool,

    /// Consume audio without an output device
    #[arg(long)]
    headless: bool,

    /// Start position in seconds
    #[arg(short, long)]
    seek: Option<f64>,

    /// Volume between 0 and 1
    #[arg(short, long)]
    volume: Option<f32>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "tempoline=info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(e) = init_logging(Some(&args.log)) {
        eprintln!("{}", e);
    }

    let mut config = match &args.config {
        Some(dir) => EngineConfig::load(dir)
            .with_context(|| format!("Failed to load config from {}", dir.display()))?,
        None => EngineConfig::default(),
    };
    if args.fallback {
        config.decoder = DecoderKind::Fallback;
    }
    if args.headless {
        config.output = OutputKind::Null;
    }

    let engine = AudioEngine::new(config).context("Failed to start audio engine")?;
    let mut events = engine.subscribe();

    engine
        .load_audio_file(&args.file)
        .with_context(|| format!("Failed to load {}", args.file.display()))?;
    info!(
        duration_s = engine.duration_seconds(),
        sample_rate = engine.sample_rate(),
        "Ready"
    );

    if let Some(volume) = args.volume {
        engine.set_volume(volume);
    }
    if let Some(seconds) = args.seek {
        engine.set_timeline_position(seconds);
    }
    engine.play().context("Failed to start playback")?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::PositionChanged { seconds }) => {
                    print!("\r{:>8.2}s / {:.2}s", seconds, engine.duration_seconds());
                }
                Ok(EngineEvent::PlaybackStateChanged { is_playing: false }) => {
                    println!();
                    info!("Playback finished");
                    break;
                }
                Ok(EngineEvent::AudioError { kind, message }) => {
                    println!();
                    anyhow::bail!("{}: {}", kind, message);
                }
                Ok(other) => info!(event = ?other, "Engine event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped notifications"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                engine.stop();
                break;
            }
        }
    }

    Ok(())
}
