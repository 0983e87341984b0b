mod frames;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use frames::{build_frames, parse_log, restamp, ReplayFrame};
use mowertrack_ingestor::db::EventStore;
use mowertrack_ingestor::ingest::Ingestor;
use mowertrack_ingestor::state::MowerStates;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const IN_MEMORY: &str = "sqlite::memory:";

#[derive(Parser, Debug)]
#[command(
    name = "replay",
    about = "Replays a recorded mower session log through the ingest pipeline"
)]
struct Args {
    /// Session log CSV (id,mower_id,session_id,activity,lat,lon,timestamp)
    #[arg(default_value = "data.csv")]
    csv: PathBuf,

    /// Sleep between frames according to their recorded spacing
    #[arg(long, alias = "realtime")]
    real_time: bool,

    /// Playback speed factor, implies --real-time
    #[arg(long)]
    speed: Option<f64>,

    /// Longest pause between two frames in milliseconds, negative for no limit
    #[arg(long, default_value_t = 60_000, allow_negative_numbers = true)]
    max_delay: i64,

    /// Keep recorded timestamps instead of restamping frames to now
    #[arg(long)]
    use_recorded_timestamps: bool,

    /// Target database
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://db/mower-data.sqlite")]
    database: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pacing {
    speed: f64,
    max_delay: Option<Duration>,
}

impl Pacing {
    fn from_args(args: &Args) -> Option<Self> {
        let speed = args.speed.filter(|speed| speed.is_finite() && *speed > 0.0);
        if !args.real_time && speed.is_none() {
            return None;
        }
        Some(Self {
            speed: speed.unwrap_or(1.0),
            max_delay: u64::try_from(args.max_delay).ok().map(Duration::from_millis),
        })
    }

    /// Scaled, capped gap between two frame instants.
    fn delay(&self, previous: DateTime<Utc>, next: DateTime<Utc>) -> Duration {
        let gap_ms = (next - previous).num_milliseconds().max(0) as f64 / self.speed;
        let delay = Duration::from_secs_f64(gap_ms / 1000.0);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let content = std::fs::read_to_string(&args.csv)
        .with_context(|| format!("reading {}", args.csv.display()))?;
    let rows = parse_log(&content);
    if rows.is_empty() {
        warn!("No rows found in {}, nothing to replay", args.csv.display());
        return Ok(());
    }

    let store = if args.database == IN_MEMORY {
        EventStore::in_memory().await?
    } else {
        EventStore::connect(&args.database).await?
    };
    let ingestor = Ingestor::new(store.clone(), Arc::new(MowerStates::new()));

    let pacing = Pacing::from_args(&args);
    if let Some(pacing) = pacing {
        match pacing.max_delay {
            Some(max) => info!(
                "Real-time playback at {}x (max gap {}ms)",
                pacing.speed,
                max.as_millis()
            ),
            None => info!("Real-time playback at {}x with unlimited gaps", pacing.speed),
        }
    }

    let frames = build_frames(&rows);
    let total = frames.len();
    let counts = replay(&ingestor, frames, pacing, !args.use_recorded_timestamps).await;

    info!("Replayed {} events from {}", total, args.csv.display());
    for (kind, count) in &counts {
        info!("  {}: {}", kind, count);
    }

    store.close().await;
    Ok(())
}

/// Feeds frames through the ingest path in order, returning counts per kind.
async fn replay(
    ingestor: &Ingestor,
    frames: Vec<ReplayFrame>,
    pacing: Option<Pacing>,
    live_timestamps: bool,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    let mut previous: Option<DateTime<Utc>> = None;

    for mut frame in frames {
        if let (Some(pacing), Some(previous), Some(at)) = (pacing, previous, frame.at) {
            let delay = pacing.delay(previous, at);
            if delay > Duration::from_millis(1) {
                tokio::time::sleep(delay).await;
            }
        }
        if frame.at.is_some() {
            previous = frame.at;
        }

        if live_timestamps {
            restamp(&mut frame.body, Utc::now());
        }

        if let Err(e) = ingestor.handle_frame(&frame.body.to_string()).await {
            warn!("Failed to ingest {} frame: {}", frame.kind, e);
        }
        *counts.entry(frame.kind).or_insert(0) += 1;
    }

    counts
}
