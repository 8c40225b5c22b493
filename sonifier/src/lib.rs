//! Seismic sonification pipeline.
//!
//! Turns an irregular, low-rate sensor feed into continuous audio:
//!
//! ```text
//! Packet -> Resampler -> BlockStore (disk) -> Loader -> playback queue -> Renderer -> device
//! ```
//!
//! Ingest, loading and status reporting each run on their own schedule; the
//! device callback only ever pops ready blocks and falls back to silence.

pub mod audio;
pub mod block;
pub mod config;
pub mod ingest;
pub mod loader;
pub mod playback;
pub mod resampler;
pub mod stats;
pub mod store;

pub use audio::{list_output_devices, AudioOutput};
pub use block::{Block, EntryId};
pub use config::PipelineConfig;
pub use ingest::{Ingestor, PacketSink};
pub use loader::{LoadReport, Loader};
pub use playback::{playback_queue, QueueWriter, RenderOutcome, Renderer};
pub use resampler::{apply_taper, resample, NormalizationContext, ResampleQuality, Resampler};
pub use sonify_common::Packet;
pub use stats::{PipelineCounters, StatusReporter, StatusSnapshot};
pub use store::{BlockStore, StoreEntry};

use anyhow::{anyhow, Context, Result};
use sonify_common::MetricsContext;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::info;

/// The background half of a running pipeline: ingest, loader and status.
///
/// The render half is handed out separately by [`Pipeline::start`] so it can
/// be moved into the audio callback.
pub struct Pipeline {
    // ---
    sink: PacketSink,
    store: BlockStore,
    counters: Arc<PipelineCounters>,
    shutdown_tx: watch::Sender<bool>,
    ingest: JoinHandle<()>,
    loader: JoinHandle<()>,
    status: tokio::task::JoinHandle<()>,
}

impl Pipeline {
    // ---
    /// Validates `config`, opens the store and starts every background context.
    ///
    /// Must be called from within a tokio runtime (the status reporter is a task).
    ///
    /// # Returns
    ///
    /// The running pipeline and the renderer to drive from the audio device.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the store cannot be
    /// opened, or a thread cannot be spawned.
    pub fn start(
        config: &PipelineConfig,
        metrics: Option<MetricsContext>,
    ) -> Result<(Self, Renderer)> {
        // ---
        config.validate().context("invalid pipeline configuration")?;

        let store = BlockStore::open(
            &config.store_dir,
            config.target_rate,
            config.clear_store_on_start,
        )?;
        let first_sequence = store.next_sequence()?;
        let newest = store.list()?.last().map(|entry| entry.id.created);
        if first_sequence > 0 {
            info!(
                "Resuming with {} stored blocks, next sequence {}",
                store.len()?,
                first_sequence
            );
        }

        let counters = PipelineCounters::new();

        let mut resampler = Resampler::new(
            config.target_rate,
            config.resample_quality,
            config.taper_len(),
        )
        .with_first_sequence(first_sequence);
        if let Some(created) = newest {
            resampler = resampler.with_last_created(created);
        }
        let mut ingestor =
            Ingestor::new(resampler, store.clone(), config.max_blocks, counters.clone());
        if let Some(metrics) = &metrics {
            ingestor = ingestor.with_metrics(metrics.clone());
        }

        let (sink, packets) = ingest::ingest_channel(config.ingest_backlog, counters.clone());
        let (writer, renderer) = playback_queue(
            config.queue_capacity,
            counters.clone(),
            config.min_buffer_samples(),
        );
        let block_loader = Loader::new(store.clone(), writer, config.block_delay, counters.clone())
            .with_min_buffer(config.min_buffer_samples());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingest = ingest::spawn_ingest(ingestor, packets, shutdown_rx.clone())?;
        let loader =
            loader::spawn_loader(block_loader, config.loader_interval, shutdown_rx.clone())?;

        let reporter = StatusReporter::new(config, counters.clone(), store.clone(), metrics);
        let status = tokio::spawn(stats::run_status(
            reporter,
            config.status_path.clone(),
            config.status_interval,
            shutdown_rx,
        ));

        info!(
            "Pipeline started: {} Hz out, delay {} blocks, min buffer {:.1}s, keep {} blocks in {}",
            config.target_rate,
            config.block_delay,
            config.min_buffer_seconds,
            config.max_blocks,
            store.dir().display()
        );

        let pipeline = Self {
            sink,
            store,
            counters,
            shutdown_tx,
            ingest,
            loader,
            status,
        };
        Ok((pipeline, renderer))
    }

    /// Non-blocking packet entry point for the feed.
    pub fn sink(&self) -> PacketSink {
        // ---
        self.sink.clone()
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        // ---
        self.counters.clone()
    }

    pub fn store(&self) -> &BlockStore {
        // ---
        &self.store
    }

    /// Stops the background contexts and waits for them.
    ///
    /// Stop the audio stream before calling this. A block write in progress
    /// finishes first; packets still waiting in the backlog are discarded.
    ///
    /// # Errors
    ///
    /// Returns error if a background context panicked.
    pub async fn shutdown(self) -> Result<()> {
        // ---
        let Self {
            sink,
            shutdown_tx,
            ingest,
            loader,
            status,
            ..
        } = self;

        info!("Stopping pipeline");
        // Receivers may already be gone; nothing left to notify then
        let _ = shutdown_tx.send(true);
        drop(sink);

        join_thread("ingest", ingest).await?;
        join_thread("loader", loader).await?;
        status.await.context("status reporter failed")?;

        info!("Pipeline stopped");
        Ok(())
    }
}

async fn join_thread(name: &'static str, handle: JoinHandle<()>) -> Result<()> {
    // ---
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .with_context(|| format!("failed to join {name} thread"))?
        .map_err(|_| anyhow!("{name} thread panicked"))
}
