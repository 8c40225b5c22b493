//! Ingest context: turns feed packets into stored blocks.
//!
//! The feed hands packets to a [`PacketSink`], which never blocks: when the
//! bounded backlog is full the packet is dropped and counted. A dedicated
//! thread drains the backlog, converts each packet, persists the block and
//! applies retention. Every failure here costs one packet and nothing more.

use anyhow::{Context, Result};
use chrono::Utc;
use sonify_common::{MetricsContext, Packet};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::block::EntryId;
use crate::resampler::Resampler;
use crate::stats::PipelineCounters;
use crate::store::BlockStore;

/// How long the ingest thread waits for a packet before rechecking shutdown
const RECV_POLL: Duration = Duration::from_millis(100);

/// Creates the bounded hand-off between the feed and the ingest thread.
pub fn ingest_channel(
    backlog: usize,
    counters: Arc<PipelineCounters>,
) -> (PacketSink, Receiver<Packet>) {
    // ---
    let (tx, rx) = mpsc::sync_channel(backlog.max(1));
    (PacketSink { tx, counters }, rx)
}

/// Non-blocking entry point for feed deliveries. Cheap to clone.
#[derive(Clone)]
pub struct PacketSink {
    // ---
    tx: SyncSender<Packet>,
    counters: Arc<PipelineCounters>,
}

impl PacketSink {
    // ---
    /// Queues a packet for conversion without waiting.
    ///
    /// # Returns
    ///
    /// `false` if the packet was dropped (backlog full or ingest stopped).
    pub fn try_send(&self, packet: Packet) -> bool {
        // ---
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);

        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                self.counters.packets_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Ingest backlog full, dropping packet of {} samples",
                    packet.len()
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.packets_rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Ingest stopped, dropping packet");
                false
            }
        }
    }
}

/// Converts, persists and retains blocks, one packet at a time.
pub struct Ingestor {
    // ---
    resampler: Resampler,
    store: BlockStore,
    max_blocks: usize,
    counters: Arc<PipelineCounters>,
    metrics: Option<MetricsContext>,
}

impl Ingestor {
    // ---
    /// Creates an ingestor.
    ///
    /// # Arguments
    ///
    /// * `resampler` - Conversion stage, owning normalization and sequence state
    /// * `store` - Block store to persist into
    /// * `max_blocks` - Retention limit applied after every write
    /// * `counters` - Shared pipeline counters
    pub fn new(
        resampler: Resampler,
        store: BlockStore,
        max_blocks: usize,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        // ---
        Self {
            resampler,
            store,
            max_blocks,
            counters,
            metrics: None,
        }
    }

    /// Records stage latencies into Prometheus histograms.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        self.metrics = Some(metrics);
        self
    }

    pub fn resampler(&self) -> &Resampler {
        // ---
        &self.resampler
    }

    /// Runs one packet through conversion, storage and retention.
    ///
    /// # Returns
    ///
    /// The stored entry, or `None` if the packet was dropped.
    pub fn handle_packet(&mut self, packet: Packet) -> Option<EntryId> {
        // ---
        if packet.is_empty() {
            debug!("Ignoring empty packet");
            return None;
        }

        let started = Instant::now();
        let block = match self.resampler.convert(&packet) {
            Ok(block) => block,
            Err(e) => {
                warn!(
                    "Dropping packet of {} samples at {} Hz: {:#}",
                    packet.len(),
                    packet.source_rate,
                    e
                );
                self.counters.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let converted = Instant::now();

        let entry = match self.store.put(&block) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping block {}: {:#}", block.sequence, e);
                self.counters.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let stored = Instant::now();

        match self.store.evict_if_over(self.max_blocks) {
            Ok(evicted) if !evicted.is_empty() => {
                self.counters
                    .blocks_evicted
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                debug!(
                    "Retention evicted {} block(s), oldest sequence {}",
                    evicted.len(),
                    evicted[0].sequence
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Retention check failed: {:#}", e),
        }

        self.counters.blocks_produced.fetch_add(1, Ordering::Relaxed);

        if let Some(metrics) = &self.metrics {
            metrics
                .resample_seconds
                .observe((converted - started).as_secs_f64());
            metrics
                .store_write_seconds
                .observe((stored - converted).as_secs_f64());
            // Includes time spent waiting in the backlog
            let since_arrival = (Utc::now() - packet.arrival).to_std().unwrap_or_default();
            metrics
                .ingest_pipeline_seconds
                .observe(since_arrival.as_secs_f64());
        }

        debug!(
            "Block {} stored: {} samples ({:.2}s) from {} at {} Hz",
            block.sequence,
            block.len(),
            block.duration_secs(),
            packet.len(),
            packet.source_rate
        );

        Some(entry.id)
    }
}

/// Drains `rx` into `ingestor` until shutdown or until every sender is gone.
///
/// # Returns
///
/// Number of packets taken off the backlog.
pub fn run_ingest(
    ingestor: &mut Ingestor,
    rx: &Receiver<Packet>,
    shutdown: &watch::Receiver<bool>,
) -> u64 {
    // ---
    let mut handled = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match rx.recv_timeout(RECV_POLL) {
            Ok(packet) => {
                ingestor.handle_packet(packet);
                handled += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("All packet senders dropped");
                break;
            }
        }
    }

    handled
}

/// Starts the ingest thread.
///
/// # Errors
///
/// Returns error if the thread cannot be spawned.
pub fn spawn_ingest(
    mut ingestor: Ingestor,
    rx: Receiver<Packet>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    // ---
    thread::Builder::new()
        .name("ingest".into())
        .spawn(move || {
            info!("Ingest started");
            let handled = run_ingest(&mut ingestor, &rx, &shutdown);
            info!(
                "Ingest stopped after {} packets, next sequence {}",
                handled,
                ingestor.resampler().next_sequence()
            );
        })
        .context("failed to spawn ingest thread")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::resampler::ResampleQuality;

    fn make_ingestor(
        dir: &std::path::Path,
        max_blocks: usize,
    ) -> (Ingestor, BlockStore, Arc<PipelineCounters>) {
        let store = BlockStore::open(dir, 1000, true).unwrap();
        let counters = PipelineCounters::new();
        let resampler = Resampler::new(1000, ResampleQuality::Linear, 0);
        let ingestor = Ingestor::new(resampler, store.clone(), max_blocks, counters.clone());
        (ingestor, store, counters)
    }

    fn packet(len: usize) -> Packet {
        Packet::new(20.0, (0..len as i32).map(|i| i * 10 - 500).collect())
    }

    #[test]
    fn test_packet_becomes_stored_block() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (mut ingestor, store, counters) = make_ingestor(dir.path(), 10);

        let id = ingestor.handle_packet(packet(100)).expect("stored");
        assert_eq!(id.sequence, 0);

        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        let block = store.read(&entries[0]).unwrap().unwrap();
        assert_eq!(block.len(), 5000);
        assert_eq!(counters.blocks_produced.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bad_packet_is_dropped_not_fatal() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (mut ingestor, store, counters) = make_ingestor(dir.path(), 10);

        let bad = Packet::new(0.0, vec![1, 2, 3]);
        assert!(ingestor.handle_packet(bad).is_none());
        assert!(ingestor.handle_packet(Packet::new(20.0, Vec::new())).is_none());
        assert_eq!(counters.blocks_dropped.load(Ordering::Relaxed), 1);

        // The sequence is not consumed by failures
        let id = ingestor.handle_packet(packet(10)).unwrap();
        assert_eq!(id.sequence, 0);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_retention_applied_after_each_put() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (mut ingestor, store, counters) = make_ingestor(dir.path(), 3);

        for _ in 0..7 {
            ingestor.handle_packet(packet(10));
            assert!(store.len().unwrap() <= 3);
        }

        let remaining: Vec<u64> = store.list().unwrap().iter().map(|e| e.id.sequence).collect();
        assert_eq!(remaining, vec![4, 5, 6]);
        assert_eq!(counters.blocks_evicted.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_sink_drops_when_backlog_full() {
        // ---
        let counters = PipelineCounters::new();
        let (sink, rx) = ingest_channel(2, counters.clone());

        assert!(sink.try_send(packet(1)));
        assert!(sink.try_send(packet(1)));
        assert!(!sink.try_send(packet(1)));

        assert_eq!(counters.packets_received.load(Ordering::Relaxed), 3);
        assert_eq!(counters.packets_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_run_ingest_drains_until_senders_gone() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (mut ingestor, store, counters) = make_ingestor(dir.path(), 10);
        let (sink, rx) = ingest_channel(8, counters);
        let (_tx, shutdown) = watch::channel(false);

        for _ in 0..3 {
            sink.try_send(packet(20));
        }
        drop(sink);

        assert_eq!(run_ingest(&mut ingestor, &rx, &shutdown), 3);
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_run_ingest_stops_on_shutdown() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (mut ingestor, _store, counters) = make_ingestor(dir.path(), 10);
        let (_sink, rx) = ingest_channel(8, counters);
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();

        assert_eq!(run_ingest(&mut ingestor, &rx, &shutdown), 0);
    }
}
