//! Segue simulator (segue-sim) - Main entry point
//!
//! Drives one complete crossfade between two simulated tracks and prints
//! every engine event as a JSON line on stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use segue_common::config::TomlConfig;
use segue_common::events::EngineEvent;
use segue_engine::graph::VolumeState;
use segue_engine::host::sim::{SimAudioBackend, SimMediaElement, SimMediaHost};
use segue_engine::host::MediaElement;
use segue_engine::{CrossfadeEngine, TrackInfo, TransitionOutcome};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for segue-sim
#[derive(Parser, Debug)]
#[command(name = "segue-sim")]
#[command(about = "Simulated two-track crossfade for the Segue engine")]
#[command(version)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, env = "SEGUE_CONFIG")]
    config: Option<PathBuf>,

    /// Crossfade duration in seconds (overrides the config file)
    #[arg(short = 'x', long)]
    crossfade: Option<f64>,

    /// Length of each simulated track in seconds
    #[arg(short, long, default_value = "30")]
    track_secs: f64,

    /// Log level for the engine (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,
}

/// Level used until the config file has been read
const STARTUP_LEVEL: &str = "info";

fn engine_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!("segue_engine={level},segue_sim={level}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins, then --log-level; the config file's level is applied
    // once the file has been read
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = from_env.is_some() || args.log_level.is_some();
    let filter = from_env.unwrap_or_else(|| {
        args.log_level
            .as_deref()
            .map(engine_filter)
            .unwrap_or_else(|| engine_filter(STARTUP_LEVEL))
    });
    let (filter, filter_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = TomlConfig::load_or_default(args.config.as_deref());
    if !pinned {
        filter_handle
            .reload(engine_filter(&config.logging.level))
            .context("Failed to apply configured log level")?;
    }
    if let Some(secs) = args.crossfade {
        config.crossfade.duration_secs = secs;
    }

    run(config, args.track_secs).await
}

async fn run(config: TomlConfig, track_secs: f64) -> Result<()> {
    let backend = SimAudioBackend::new();
    let media = SimMediaHost::new();
    media.set_duration(track_secs);

    let engine = CrossfadeEngine::new(backend, media, &config)
        .context("Failed to create crossfade engine")?;
    let printer = tokio::spawn(print_events(engine.subscribe()));

    let (_volume, binding) = watch::channel(VolumeState::default());
    if !engine.initialize(binding) {
        anyhow::bail!("Simulated audio graph failed to initialize");
    }

    let timing = engine.crossfade().timing();
    if !timing.enabled {
        anyhow::bail!(
            "Crossfade of {:.2}s is disabled; nothing to simulate",
            config.crossfade.duration_secs
        );
    }
    let window = timing.trigger_window_secs(&config.engine);
    let start = (track_secs - window - 1.0).max(timing.fade_out_secs);
    if start >= track_secs {
        anyhow::bail!(
            "Track of {:.1}s is too short for a {:.2}s fade",
            track_secs,
            timing.fade_out_secs
        );
    }

    let current: Arc<dyn MediaElement> =
        SimMediaElement::playing("sim://tracks/current.ogg", track_secs, start);
    engine.attach_playing(&current, Some(-3.0));
    info!(
        "Playing current track from {:.1}s of {:.1}s (fade out {:.2}s)",
        start, track_secs, timing.fade_out_secs
    );

    let next = TrackInfo::new("next", "sim://tracks/next.ogg").with_normalization_db(-1.5);
    if !engine.preload_next(&next, None).await {
        warn!("Preload of {} failed; transition will fade without a successor", next.item_id);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let outcome = loop {
        ticker.tick().await;
        if let Some(outcome) = engine.on_position(&current).await {
            break outcome;
        }
        if current.current_time() >= track_secs {
            anyhow::bail!("Track ended without a transition");
        }
    };

    match &outcome {
        TransitionOutcome::Crossfading { incoming } => {
            info!("Crossfading into {} ({})", incoming.item_id, incoming.element.id())
        }
        other => warn!("Transition did not hand over: {:?}", other),
    }

    let limit = config
        .engine
        .safety_delay(timing.fade_out_secs, timing.sustain_secs)
        + Duration::from_secs(1);
    match tokio::time::timeout(limit, printer).await {
        Ok(joined) => joined.context("Event printer failed")?,
        Err(_) => warn!("Outgoing element was not released within {:?}", limit),
    }

    engine.stop();
    Ok(())
}

/// Print events as JSON lines until the outgoing element is released
async fn print_events(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize {}: {}", event.event_type(), e),
                }
                if matches!(event, EngineEvent::OutgoingReleased { .. }) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Skipped {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
