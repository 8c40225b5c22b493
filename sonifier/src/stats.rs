//! Pipeline health: shared counters and the periodic status reporter.
//!
//! Every stage bumps plain atomics in [`PipelineCounters`]; the render
//! callback only ever does relaxed loads and adds on them. The
//! [`StatusReporter`] is the single reader that turns them into a JSON status
//! snapshot, Prometheus metrics and a periodic log line.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sonify_common::MetricsContext;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::store::BlockStore;

/// Counters shared by every pipeline context.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    // ---
    /// Packets accepted from the feed
    pub packets_received: AtomicU64,

    /// Packets dropped because the ingest backlog was full
    pub packets_rejected: AtomicU64,

    /// Blocks converted and persisted
    pub blocks_produced: AtomicU64,

    /// Packets or blocks lost to conversion or write failures
    pub blocks_dropped: AtomicU64,

    /// Stored blocks removed by retention
    pub blocks_evicted: AtomicU64,

    /// Blocks moved into the playback queue
    pub blocks_enqueued: AtomicU64,

    /// Stored blocks that vanished or were unreadable when loading
    pub blocks_skipped: AtomicU64,

    /// Blocks played to the end
    pub blocks_consumed: AtomicU64,

    /// Played blocks that found the return ring full: freed by the renderer,
    /// their store entries left for retention
    pub blocks_unretired: AtomicU64,

    /// Blocks queued or playing
    pub queued_blocks: AtomicU64,

    /// Samples queued and not yet rendered
    pub queued_samples: AtomicU64,

    /// Render calls that ran out of audio
    pub underruns: AtomicU64,

    /// Render calls that delivered audio then silence
    pub partial_fills: AtomicU64,

    /// Silent samples emitted because of underruns
    pub underrun_samples: AtomicU64,

    /// Silent samples emitted while waiting for the minimum buffer
    pub prebuffer_samples: AtomicU64,

    /// Real samples rendered
    pub samples_rendered: AtomicU64,
}

impl PipelineCounters {
    // ---
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Reads every counter.
    pub fn totals(&self) -> CounterTotals {
        // ---
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterTotals {
            packets_received: load(&self.packets_received),
            packets_rejected: load(&self.packets_rejected),
            blocks_produced: load(&self.blocks_produced),
            blocks_dropped: load(&self.blocks_dropped),
            blocks_evicted: load(&self.blocks_evicted),
            blocks_enqueued: load(&self.blocks_enqueued),
            blocks_skipped: load(&self.blocks_skipped),
            blocks_consumed: load(&self.blocks_consumed),
            blocks_unretired: load(&self.blocks_unretired),
            queued_blocks: load(&self.queued_blocks),
            queued_samples: load(&self.queued_samples),
            underruns: load(&self.underruns),
            partial_fills: load(&self.partial_fills),
            underrun_samples: load(&self.underrun_samples),
            prebuffer_samples: load(&self.prebuffer_samples),
            samples_rendered: load(&self.samples_rendered),
        }
    }
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterTotals {
    // ---
    pub packets_received: u64,
    pub packets_rejected: u64,
    pub blocks_produced: u64,
    pub blocks_dropped: u64,
    pub blocks_evicted: u64,
    pub blocks_enqueued: u64,
    pub blocks_skipped: u64,
    pub blocks_consumed: u64,
    pub blocks_unretired: u64,
    pub queued_blocks: u64,
    pub queued_samples: u64,
    pub underruns: u64,
    pub partial_fills: u64,
    pub underrun_samples: u64,
    pub prebuffer_samples: u64,
    pub samples_rendered: u64,
}

/// Run parameters echoed into every snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSettings {
    // ---
    pub target_rate: u32,
    pub blocksize: u32,
    pub block_delay: usize,
    pub min_buffer_seconds: f64,
    pub max_blocks: usize,
    pub taper_ms: f64,
    pub queue_capacity: usize,
}

impl From<&PipelineConfig> for StatusSettings {
    fn from(config: &PipelineConfig) -> Self {
        // ---
        Self {
            target_rate: config.target_rate,
            blocksize: config.blocksize,
            block_delay: config.block_delay,
            min_buffer_seconds: config.min_buffer_seconds,
            max_blocks: config.max_blocks,
            taper_ms: config.taper_ms,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// The structured status record rewritten for external viewers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    // ---
    pub timestamp: DateTime<Utc>,
    pub settings: StatusSettings,

    /// Uptime as `DD:HH:MM:SS`
    pub uptime: String,
    pub uptime_sec: u64,

    /// Audio currently buffered in the playback queue
    pub queue_duration_sec: f64,

    /// Mean of every `queue_duration_sec` sampled so far
    pub queue_duration_avg_sec: f64,
    pub queue_blocks: u64,

    /// Entries currently in the block store (`None` if it could not be listed)
    pub block_count: Option<usize>,
    pub block_saved_total: u64,
    pub block_played_total: u64,
    pub block_evicted_total: u64,
    pub block_dropped_total: u64,
    pub block_skipped_total: u64,

    /// Played blocks whose store entries were not cleaned after playback
    pub block_unretired_total: u64,
    pub packets_received_total: u64,
    pub packets_rejected_total: u64,

    /// Silence emitted while waiting for the minimum buffer
    pub queue_empty_time_total_sec: f64,

    /// Silence emitted because playback ran dry
    pub stream_gap_total_sec: f64,
    pub underrun_count: u64,
}

/// Formats a duration as `DD:HH:MM:SS`.
pub fn format_uptime(uptime: Duration) -> String {
    // ---
    let secs = uptime.as_secs();
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    format!("{days:02}:{hours:02}:{minutes:02}:{seconds:02}")
}

/// Samples the pipeline counters and publishes them.
///
/// Purely an observer: nothing it does can stall or fail another stage.
pub struct StatusReporter {
    // ---
    counters: Arc<PipelineCounters>,
    store: BlockStore,
    metrics: Option<MetricsContext>,
    settings: StatusSettings,
    sample_rate: f64,
    started: Instant,

    buffered_sum: f64,
    samples_taken: u64,

    /// Totals already pushed into Prometheus counters
    mirrored: CounterTotals,

    /// Log a summary line every this many samples (0 disables)
    log_every: u64,
}

impl StatusReporter {
    // ---
    /// Creates a reporter.
    ///
    /// # Arguments
    ///
    /// * `config` - Pipeline parameters, echoed into snapshots
    /// * `counters` - Shared pipeline counters
    /// * `store` - Handle used to count stored entries
    /// * `metrics` - Optional Prometheus context to mirror into
    pub fn new(
        config: &PipelineConfig,
        counters: Arc<PipelineCounters>,
        store: BlockStore,
        metrics: Option<MetricsContext>,
    ) -> Self {
        // ---
        Self {
            counters,
            store,
            metrics,
            settings: StatusSettings::from(config),
            sample_rate: config.target_rate as f64,
            started: Instant::now(),
            buffered_sum: 0.0,
            samples_taken: 0,
            mirrored: CounterTotals::default(),
            log_every: 10,
        }
    }

    /// Sets how many samples pass between summary log lines.
    pub fn with_log_every(mut self, samples: u64) -> Self {
        // ---
        self.log_every = samples;
        self
    }

    /// Takes one snapshot and mirrors it into Prometheus.
    pub fn sample(&mut self) -> StatusSnapshot {
        // ---
        let totals = self.counters.totals();
        let uptime = self.started.elapsed();

        let block_count = match self.store.len() {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("Could not count stored blocks: {:#}", e);
                None
            }
        };

        let queue_duration_sec = totals.queued_samples as f64 / self.sample_rate;
        self.buffered_sum += queue_duration_sec;
        self.samples_taken += 1;

        let snapshot = StatusSnapshot {
            timestamp: Utc::now(),
            settings: self.settings.clone(),
            uptime: format_uptime(uptime),
            uptime_sec: uptime.as_secs(),
            queue_duration_sec,
            queue_duration_avg_sec: self.buffered_sum / self.samples_taken as f64,
            queue_blocks: totals.queued_blocks,
            block_count,
            block_saved_total: totals.blocks_produced,
            block_played_total: totals.blocks_consumed,
            block_evicted_total: totals.blocks_evicted,
            block_dropped_total: totals.blocks_dropped,
            block_skipped_total: totals.blocks_skipped,
            block_unretired_total: totals.blocks_unretired,
            packets_received_total: totals.packets_received,
            packets_rejected_total: totals.packets_rejected,
            queue_empty_time_total_sec: totals.prebuffer_samples as f64 / self.sample_rate,
            stream_gap_total_sec: totals.underrun_samples as f64 / self.sample_rate,
            underrun_count: totals.underruns,
        };

        self.mirror(&totals, &snapshot);

        if self.log_every > 0 && self.samples_taken % self.log_every == 0 {
            Self::log(&snapshot);
        }

        snapshot
    }

    /// Samples, rewrites the status file if configured, and returns the snapshot.
    ///
    /// A failed write is logged and otherwise ignored.
    pub fn report(&mut self, path: Option<&Path>) -> StatusSnapshot {
        // ---
        let snapshot = self.sample();
        if let Some(path) = path {
            if let Err(e) = write_snapshot(&snapshot, path) {
                warn!("Could not write status file: {:#}", e);
            }
        }
        snapshot
    }

    /// Logs a one-line summary.
    pub fn log(snapshot: &StatusSnapshot) {
        // ---
        info!(
            "Status: up {}, buffered {:.1}s (avg {:.1}s), {} saved, {} played, {} evicted, {} underruns ({:.1}s)",
            snapshot.uptime,
            snapshot.queue_duration_sec,
            snapshot.queue_duration_avg_sec,
            snapshot.block_saved_total,
            snapshot.block_played_total,
            snapshot.block_evicted_total,
            snapshot.underrun_count,
            snapshot.stream_gap_total_sec
        );
    }

    fn mirror(&mut self, totals: &CounterTotals, snapshot: &StatusSnapshot) {
        // ---
        let Some(metrics) = &self.metrics else {
            return;
        };

        let prev = self.mirrored;
        let delta = |now: u64, before: u64| now.saturating_sub(before);

        metrics
            .packets_received_total
            .inc_by(delta(totals.packets_received, prev.packets_received));
        metrics
            .packets_rejected_total
            .inc_by(delta(totals.packets_rejected, prev.packets_rejected));
        metrics
            .blocks_produced_total
            .inc_by(delta(totals.blocks_produced, prev.blocks_produced));
        metrics
            .blocks_dropped_total
            .inc_by(delta(totals.blocks_dropped, prev.blocks_dropped));
        metrics
            .blocks_evicted_total
            .inc_by(delta(totals.blocks_evicted, prev.blocks_evicted));
        metrics
            .blocks_enqueued_total
            .inc_by(delta(totals.blocks_enqueued, prev.blocks_enqueued));
        metrics
            .blocks_skipped_total
            .inc_by(delta(totals.blocks_skipped, prev.blocks_skipped));
        metrics
            .blocks_consumed_total
            .inc_by(delta(totals.blocks_consumed, prev.blocks_consumed));
        metrics
            .render_underruns_total
            .inc_by(delta(totals.underruns, prev.underruns));
        metrics
            .render_partial_fills_total
            .inc_by(delta(totals.partial_fills, prev.partial_fills));

        metrics.buffered_seconds.set(snapshot.queue_duration_sec);
        metrics.underrun_seconds.set(snapshot.stream_gap_total_sec);
        metrics.playback_queue_blocks.set(totals.queued_blocks as i64);
        if let Some(count) = snapshot.block_count {
            metrics.store_entries.set(count as i64);
        }

        self.mirrored = *totals;
    }
}

/// Writes a snapshot as pretty JSON, replacing `path` in one rename.
///
/// # Errors
///
/// Returns error if the snapshot cannot be serialized or written.
pub fn write_snapshot(snapshot: &StatusSnapshot, path: &Path) -> Result<()> {
    // ---
    let json = serde_json::to_vec_pretty(snapshot).context("failed to serialize status")?;

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    fs::write(&temp, json).with_context(|| format!("failed to write {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Reports every `interval` until shutdown, then writes a final snapshot.
pub async fn run_status(
    mut reporter: StatusReporter,
    path: Option<PathBuf>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    info!("Status reporter started (every {:?})", interval);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reporter.report(path.as_deref());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let last = reporter.report(path.as_deref());
    StatusReporter::log(&last);
    info!("Status reporter stopped");
}
