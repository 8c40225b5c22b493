//! Seismic sonifier - CLI binary.
//!
//! Feeds a station stand-in (synthetic signal or recorded trace) through the
//! buffering pipeline and plays the result on an audio output device.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use feed::{read_trace, FeedPacing, SineSource, WavSource};
use sonifier::{
    list_output_devices, AudioOutput, PacketSink, Pipeline, PipelineConfig, ResampleQuality,
};
use sonify_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig, Packet};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Synthetic,
    Wav,
}

/// Seismic Sonifier - Play an irregular sensor feed as continuous audio
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Packet source
    #[arg(long, value_enum, default_value = "synthetic")]
    source: SourceKind,

    /// Recorded trace to replay (required with `--source wav`)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Replay the trace forever
    #[arg(long = "loop")]
    loop_input: bool,

    /// Native rate of the synthetic source in Hz
    #[arg(long, default_value = "20.0")]
    source_rate: f64,

    /// Frequency of the synthetic tone in Hz
    #[arg(long, default_value = "0.5")]
    tone_hz: f64,

    /// Peak amplitude of the synthetic tone in counts
    #[arg(long, default_value = "50000.0")]
    amplitude: f64,

    /// Feed delivery speed factor (1.0 is real time)
    #[arg(long, default_value = "1.0")]
    speedup: f64,

    /// Audio output device name (default device when omitted)
    #[arg(short, long)]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Target audio sample rate in Hz
    #[arg(long, default_value = "44100")]
    target_fs: u32,

    /// Frames per audio callback
    #[arg(long, default_value = "2048")]
    blocksize: u32,

    /// Output channels (the mono signal is copied to each)
    #[arg(long, default_value = "1")]
    channels: u16,

    /// Stored blocks required before playback is fed
    #[arg(long, default_value = "20")]
    block_delay: usize,

    /// Buffered seconds required before the first audible callback
    #[arg(long, default_value = "30.0")]
    min_queue_seconds: f64,

    /// Maximum number of stored blocks kept on disk
    #[arg(long, default_value = "100")]
    max_wav_files: usize,

    /// Fade at each block edge in milliseconds (0 disables)
    #[arg(long, default_value = "5.0")]
    taper: f64,

    /// Blocks held in memory ahead of playback
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Packets allowed to wait for conversion before new ones are dropped
    #[arg(long, default_value = "64")]
    ingest_backlog: usize,

    /// Directory for stored blocks
    #[arg(long, default_value = "wav_blocks")]
    store_dir: PathBuf,

    /// Keep and play blocks left over from a previous run
    #[arg(long)]
    keep_store: bool,

    /// Status snapshot file
    #[arg(long, default_value = "status.json")]
    status_file: PathBuf,

    /// Do not write a status snapshot file
    #[arg(long)]
    no_status_file: bool,

    /// Interval between status snapshots in milliseconds
    #[arg(long, default_value = "1000")]
    status_interval_ms: u64,

    /// Interpolation used between source and target rates
    #[arg(long, value_enum, default_value = "sinc")]
    resample_quality: ResampleQuality,

    /// Prometheus metrics bind address (serves `GET /metrics`), disabled when omitted
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Also append log output to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

impl Args {
    // ---
    fn pipeline_config(&self) -> PipelineConfig {
        // ---
        PipelineConfig {
            target_rate: self.target_fs,
            blocksize: self.blocksize,
            channels: self.channels,
            block_delay: self.block_delay,
            min_buffer_seconds: self.min_queue_seconds,
            max_blocks: self.max_wav_files,
            taper_ms: self.taper,
            queue_capacity: self.queue_capacity,
            ingest_backlog: self.ingest_backlog,
            store_dir: self.store_dir.clone(),
            clear_store_on_start: !self.keep_store,
            status_path: (!self.no_status_file).then(|| self.status_file.clone()),
            status_interval: Duration::from_millis(self.status_interval_ms),
            resample_quality: self.resample_quality,
            ..PipelineConfig::default()
        }
    }
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color, args.log_file.as_deref())?;

    if args.list_devices {
        for name in list_output_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    info!("Starting seismic sonifier v{VERSION}");
    let config = args.pipeline_config();
    config.validate().context("invalid configuration")?;
    info!("Source: {:?}", args.source);
    info!("Output: {} Hz, blocksize {}", config.target_rate, config.blocksize);
    info!(
        "Buffering: delay {} blocks, min {:.1}s, keep {} blocks, taper {} ms",
        config.block_delay, config.min_buffer_seconds, config.max_blocks, config.taper_ms
    );

    let metrics = MetricsContext::new("sonifier")?;
    if let Some(bind) = &args.metrics_bind {
        info!("Metrics bind: {}", bind);
        let addr = bind.parse().context("invalid metrics bind")?;
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(addr));
    }

    let (pipeline, renderer) = Pipeline::start(&config, Some(metrics))?;

    let output = match AudioOutput::open(args.device.as_deref(), &config, renderer) {
        Ok(output) => output,
        Err(e) => {
            error!("Audio device failed: {:#}", e);
            pipeline.shutdown().await?;
            return Err(e);
        }
    };

    let (feed_stop, feed_shutdown) = watch::channel(false);
    let feed = match spawn_feed(&args, pipeline.sink(), feed_shutdown).await {
        Ok(feed) => feed,
        Err(e) => {
            output.stop();
            pipeline.shutdown().await?;
            return Err(e);
        }
    };

    info!("Playing; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    // The device callback must be gone before the contexts feeding it stop
    output.stop();

    let _ = feed_stop.send(true);
    match feed.await {
        Ok(Ok(delivered)) => info!("Feed delivered {} packets", delivered),
        Ok(Err(e)) => warn!("Feed failed: {:#}", e),
        Err(e) => warn!("Feed task failed: {}", e),
    }

    pipeline.shutdown().await?;
    Ok(())
}

/// Builds the selected source and starts delivering into `sink`.
async fn spawn_feed(
    args: &Args,
    sink: PacketSink,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<Result<u64>>> {
    // ---
    let pacing = FeedPacing::new(3, 0.3, args.speedup);
    let on_packet = move |packet: Packet| {
        sink.try_send(packet);
    };

    match args.source {
        SourceKind::Synthetic => {
            let source = SineSource::new(args.source_rate, args.tone_hz, args.amplitude);
            Ok(tokio::spawn(feed::deliver(
                source, pacing, on_packet, shutdown,
            )))
        }
        SourceKind::Wav => {
            let path = args
                .input
                .clone()
                .context("--input is required with --source wav")?;
            let trace = tokio::task::spawn_blocking(move || read_trace(path))
                .await
                .context("trace loading task failed")??;
            info!(
                "Trace: {:.1}s at {} Hz{}",
                trace.duration_secs(),
                trace.sample_rate,
                if args.loop_input { ", looping" } else { "" }
            );
            let source = WavSource::new(trace, args.loop_input);
            Ok(tokio::spawn(feed::deliver(
                source, pacing, on_packet, shutdown,
            )))
        }
    }
}
