//! Replay a recorded capture file through the stream runtime.
//!
//! Each non-empty line of the input is one capture payload. Candles and
//! ticks are persisted under `--data-dir` exactly as a live session would
//! write them, and a candle checksum is printed for regression checks.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use candle_stream::config::StreamConfig;
use candle_stream::decoder::FrameDecoder;
use candle_stream::events::LogEventSink;
use candle_stream::pipeline::StreamRuntime;
use candle_stream::replay::ReplayEngine;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use types::ids::AssetId;
use types::market::Timeframe;

#[derive(Parser, Debug)]
#[command(name = "replay-capture", version, about = "Replay recorded tick frames into candle chunks")]
struct Args {
    /// Newline-delimited capture payloads.
    #[arg(long)]
    input: PathBuf,

    /// Asset to stream; ticks for other assets are filtered.
    #[arg(long)]
    asset: String,

    #[arg(long, default_value_t = 60)]
    timeframe_seconds: u32,

    /// Overrides CANDLE_STREAM_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Skip writing chunks; only aggregate and fingerprint.
    #[arg(long, default_value_t = false)]
    no_persist: bool,

    /// Fail unless the candle checksum matches.
    #[arg(long)]
    expect_checksum: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let asset = AssetId::try_new(args.asset.as_str()).context("invalid --asset")?;
    let timeframe = Timeframe::from_seconds(args.timeframe_seconds)?;

    let mut config = StreamConfig::from_env()?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let payloads = read_payloads(&args.input)?;
    if payloads.is_empty() {
        bail!("{} contains no payloads", args.input.display());
    }

    let events = Arc::new(LogEventSink);
    let mut runtime = if args.no_persist {
        StreamRuntime::new(config, events, None)?
    } else {
        StreamRuntime::with_persistence(config, events)?
    };

    runtime.transport_connected();
    runtime.request_detection()?;
    runtime.resolve_detection(asset.clone())?;
    runtime.start_stream(Some(timeframe))?;

    let mut decoder = FrameDecoder::new();
    let mut ticks = Vec::new();
    for payload in &payloads {
        runtime.handle_payload(payload);
        ticks.extend(decoder.decode_all(payload));
    }

    let status = runtime.status();
    runtime.shutdown().await?;

    let mut engine = ReplayEngine::new();
    if let Some(expected) = args.expect_checksum {
        engine = engine.with_expected_checksum(expected);
    }
    let replay = engine.replay(&asset, timeframe, &ticks)?;

    info!(
        payloads = payloads.len(),
        ticks = ticks.len(),
        rejected = decoder.rejected_total(),
        candles = replay.closed.len() + usize::from(replay.current.is_some()),
        stale = replay.stale_ticks,
        filtered = replay.filtered_ticks,
        persistence = ?status.persistence,
        "Replay finished"
    );
    println!("{}", replay.metrics.checksum);
    Ok(())
}

fn read_payloads(path: &PathBuf) -> anyhow::Result<Vec<Vec<u8>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut payloads = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            payloads.push(trimmed.as_bytes().to_vec());
        }
    }
    Ok(payloads)
}
