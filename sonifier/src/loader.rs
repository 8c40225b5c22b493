//! Loader: moves stored blocks into the playback queue.
//!
//! Polls the store on its own thread. Nothing is loaded until `block_delay`
//! entries exist; after that every new entry is read and queued once, in
//! store order. Entries evicted before they could be read are skipped, never
//! waited for. Blocks the renderer has finished are freed here and their
//! store entries removed.

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::playback::QueueWriter;
use crate::stats::PipelineCounters;
use crate::store::BlockStore;

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    // ---
    /// Blocks pushed into the playback queue
    pub enqueued: usize,

    /// Entries given up on (vanished, unreadable or empty)
    pub skipped: usize,

    /// Still waiting for the initial block delay
    pub waiting: bool,

    /// Stopped early because the playback queue was full
    pub backpressured: bool,

    /// Store entries removed after playback
    pub cleaned: usize,

    /// The queue filled up while holding less than the minimum buffer, so
    /// playback starts on a shorter buffer than configured
    pub short_buffer: bool,
}

pub struct Loader {
    // ---
    store: BlockStore,
    queue: QueueWriter,
    block_delay: usize,
    counters: Arc<PipelineCounters>,

    /// Queued samples the renderer waits for before playing
    min_buffer_samples: u64,

    /// Set once `block_delay` entries were seen; never cleared
    primed: bool,

    /// Highest sequence number already queued or given up on
    high_water: Option<u64>,

    /// Whether the previous poll hit a full queue
    was_backpressured: bool,

    /// Whether a short starting buffer was already reported
    short_buffer_reported: bool,
}

impl Loader {
    // ---
    /// Creates a loader.
    ///
    /// # Arguments
    ///
    /// * `store` - Store to poll
    /// * `queue` - Writer end of the playback queue
    /// * `block_delay` - Stored entries required before the first block is queued
    /// * `counters` - Shared pipeline counters
    pub fn new(
        store: BlockStore,
        queue: QueueWriter,
        block_delay: usize,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        // ---
        Self {
            store,
            queue,
            block_delay,
            counters,
            primed: false,
            high_water: None,
            was_backpressured: false,
            min_buffer_samples: 0,
            short_buffer_reported: false,
        }
    }

    /// Minimum buffer the renderer waits for, checked against the queue capacity.
    pub fn with_min_buffer(mut self, samples: u64) -> Self {
        // ---
        self.min_buffer_samples = samples;
        self
    }

    pub fn is_primed(&self) -> bool {
        // ---
        self.primed
    }

    /// Runs one poll: cleanup of played blocks, then loading of new entries.
    ///
    /// # Errors
    ///
    /// Returns error only if the store cannot be listed; per-entry problems
    /// are skipped and counted.
    pub fn poll_once(&mut self) -> Result<LoadReport> {
        // ---
        let mut report = LoadReport {
            cleaned: self.clean_played(),
            ..LoadReport::default()
        };

        let entries = self.store.list()?;

        if !self.primed {
            if entries.len() < self.block_delay {
                debug!(
                    "Waiting for block delay: {}/{} stored",
                    entries.len(),
                    self.block_delay
                );
                report.waiting = true;
                return Ok(report);
            }
            self.primed = true;
            info!(
                "Block delay reached with {} blocks stored, feeding playback",
                entries.len()
            );
        }

        for entry in entries {
            let sequence = entry.id.sequence;
            if let Some(last) = self.high_water {
                if sequence <= last {
                    continue;
                }
                if sequence > last + 1 {
                    debug!("Blocks {}..{} missing, skipping ahead", last + 1, sequence);
                }
            }

            if self.queue.is_full() {
                report.backpressured = true;
                break;
            }

            let block = match self.store.read(&entry) {
                Ok(Some(block)) if !block.is_empty() => block,
                Ok(Some(_)) => {
                    warn!("Skipping empty block {}", sequence);
                    self.skip(sequence, &mut report);
                    continue;
                }
                Ok(None) => {
                    debug!("Block {} evicted before loading", sequence);
                    self.skip(sequence, &mut report);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping unreadable block {}: {:#}", sequence, e);
                    self.skip(sequence, &mut report);
                    continue;
                }
            };

            if let Err(block) = self.queue.try_push(block) {
                // Only this thread pushes, so this means the renderer has not caught up
                debug!("Playback queue full, holding block {}", block.sequence);
                report.backpressured = true;
                break;
            }

            self.high_water = Some(sequence);
            report.enqueued += 1;
            debug!("Queued block {} ({} queued)", sequence, self.queue.len());
        }

        if report.backpressured && !self.short_buffer_reported {
            let queued = self.counters.queued_samples.load(Ordering::Relaxed);
            let consumed = self.counters.blocks_consumed.load(Ordering::Relaxed);
            if consumed == 0 && queued < self.min_buffer_samples {
                warn!(
                    "Playback queue full with {} of {} samples buffered; raise queue capacity \
                     to reach the minimum buffer, playback starts early",
                    queued, self.min_buffer_samples
                );
                report.short_buffer = true;
                self.short_buffer_reported = true;
            }
        }

        if report.backpressured && !self.was_backpressured {
            debug!(
                "Playback queue full ({} blocks), loading paused",
                self.queue.capacity()
            );
        }
        self.was_backpressured = report.backpressured;

        Ok(report)
    }

    fn skip(&mut self, sequence: u64, report: &mut LoadReport) {
        // ---
        self.high_water = Some(sequence);
        self.counters.blocks_skipped.fetch_add(1, Ordering::Relaxed);
        report.skipped += 1;
    }

    /// Frees finished blocks and deletes their store entries.
    fn clean_played(&mut self) -> usize {
        // ---
        let mut cleaned = 0;
        for id in self.queue.drain_retired() {
            match self.store.remove(&id) {
                Ok(true) => cleaned += 1,
                // Already evicted by retention
                Ok(false) => {}
                Err(e) => warn!("Could not remove played block {}: {:#}", id.sequence, e),
            }
        }
        cleaned
    }
}

/// Polls `loader` every `interval` until shutdown.
pub fn run_loader(loader: &mut Loader, interval: Duration, shutdown: &watch::Receiver<bool>) {
    // ---
    while !*shutdown.borrow() {
        if let Err(e) = loader.poll_once() {
            warn!("Loader poll failed: {:#}", e);
        }
        thread::sleep(interval);
    }
}

/// Starts the loader thread.
///
/// # Errors
///
/// Returns error if the thread cannot be spawned.
pub fn spawn_loader(
    mut loader: Loader,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    // ---
    thread::Builder::new()
        .name("loader".into())
        .spawn(move || {
            info!(
                "Loader started (delay {} blocks, poll {:?})",
                loader.block_delay, interval
            );
            run_loader(&mut loader, interval, &shutdown);
            info!("Loader stopped");
        })
        .context("failed to spawn loader thread")
}
