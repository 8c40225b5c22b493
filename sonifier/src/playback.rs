//! Playback queue and the real-time render state machine.
//!
//! Two lock-free single-producer/single-consumer rings connect the loader to
//! the audio callback: ready blocks travel forward, finished blocks travel
//! back so their memory is released on the loader thread. The render side
//! never allocates, frees, locks, logs or touches the filesystem.
//!
//! Per callback the renderer moves through `NEED_BLOCK -> HAVE_BLOCK` until the
//! request is filled, ending `PARTIAL` or `EXHAUSTED` when the queue runs dry.
//! Missing audio is always replaced by silence, never by stale samples.

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::block::{Block, EntryId};
use crate::stats::PipelineCounters;

/// Result of one render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    // ---
    /// Minimum buffer not reached yet: silence, not an underrun
    Prebuffering,

    /// Every requested frame carried real audio
    Full,

    /// The queue ran dry after `filled` frames; the rest is silence
    Partial { filled: usize },

    /// Nothing to play: the whole buffer is silence
    Exhausted,
}

impl RenderOutcome {
    // ---
    /// Returns true if the call ran out of buffered audio.
    pub fn is_underrun(&self) -> bool {
        // ---
        matches!(self, Self::Partial { .. } | Self::Exhausted)
    }
}

/// Creates a bounded playback queue.
///
/// # Arguments
///
/// * `capacity` - Blocks the queue holds (at least 1)
/// * `counters` - Shared counters updated by both ends
/// * `min_buffer_samples` - Queued samples required before playback starts
///
/// # Returns
///
/// The loader-side writer and the render-side reader.
pub fn playback_queue(
    capacity: usize,
    counters: Arc<PipelineCounters>,
    min_buffer_samples: u64,
) -> (QueueWriter, Renderer) {
    // ---
    let capacity = capacity.max(1);
    let (block_tx, block_rx) = HeapRb::<Block>::new(capacity).split();

    // Queued plus the one playing: everything that can finish before the
    // writer drains again
    let (retired_tx, retired_rx) = HeapRb::<Block>::new(capacity + 1).split();

    let writer = QueueWriter {
        blocks: block_tx,
        retired: retired_rx,
        finished: Vec::new(),
        counters: counters.clone(),
    };

    let renderer = Renderer {
        blocks: block_rx,
        retired: retired_tx,
        current: None,
        offset: 0,
        counters,
        min_buffer_samples,
        playing: false,
        underrun: false,
    };

    (writer, renderer)
}

/// Loader end of the playback queue.
pub struct QueueWriter {
    // ---
    blocks: HeapProd<Block>,
    retired: HeapCons<Block>,

    /// Identities of finished blocks collected but not yet handed out
    finished: Vec<EntryId>,
    counters: Arc<PipelineCounters>,
}

impl QueueWriter {
    // ---
    /// Appends a block. Hands it back if the queue is full.
    ///
    /// Finished blocks are collected first, so the return ring never holds
    /// more than the queue plus the block playing.
    pub fn try_push(&mut self, block: Block) -> Result<(), Block> {
        // ---
        self.collect_retired();
        let len = block.len() as u64;

        // Account first so the renderer never subtracts samples it was not told about
        self.counters.queued_samples.fetch_add(len, Ordering::Relaxed);
        self.counters.queued_blocks.fetch_add(1, Ordering::Relaxed);

        match self.blocks.try_push(block) {
            Ok(()) => {
                self.counters.blocks_enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(block) => {
                self.counters.queued_samples.fetch_sub(len, Ordering::Relaxed);
                self.counters.queued_blocks.fetch_sub(1, Ordering::Relaxed);
                Err(block)
            }
        }
    }

    /// Blocks waiting to be played (excludes the one playing).
    pub fn len(&self) -> usize {
        // ---
        self.blocks.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.blocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        // ---
        self.blocks.is_full()
    }

    pub fn capacity(&self) -> usize {
        // ---
        self.blocks.capacity().get()
    }

    /// Frees blocks the renderer has finished and returns their identities.
    pub fn drain_retired(&mut self) -> Vec<EntryId> {
        // ---
        self.collect_retired();
        std::mem::take(&mut self.finished)
    }

    fn collect_retired(&mut self) {
        // ---
        while let Some(block) = self.retired.try_pop() {
            self.finished.push(block.id());
        }
    }
}

/// Render end of the playback queue. Owned by the audio callback.
pub struct Renderer {
    // ---
    blocks: HeapCons<Block>,
    retired: HeapProd<Block>,

    /// Block being played and the read cursor into it
    current: Option<Block>,
    offset: usize,

    counters: Arc<PipelineCounters>,
    min_buffer_samples: u64,

    /// Set once the minimum buffer was first reached; never cleared
    playing: bool,

    /// Whether the last call ran out of audio
    underrun: bool,
}

impl Renderer {
    // ---
    /// Fills `out` with the next mono samples.
    ///
    /// Never blocks: whatever the queue cannot supply is silence.
    pub fn render(&mut self, out: &mut [f32]) -> RenderOutcome {
        // ---
        if !self.playing {
            let queued = self.counters.queued_samples.load(Ordering::Relaxed);
            if queued >= self.min_buffer_samples || self.blocks.is_full() {
                self.playing = true;
            } else {
                out.fill(0.0);
                self.counters
                    .prebuffer_samples
                    .fetch_add(out.len() as u64, Ordering::Relaxed);
                self.underrun = false;
                return RenderOutcome::Prebuffering;
            }
        }

        let mut filled = 0;
        while filled < out.len() {
            // NEED_BLOCK
            if self.current.is_none() {
                match self.blocks.try_pop() {
                    Some(next) => {
                        self.current = Some(next);
                        self.offset = 0;
                    }
                    None => break,
                }
            }
            let Some(block) = self.current.as_ref() else {
                break;
            };

            // HAVE_BLOCK
            let n = (out.len() - filled).min(block.len() - self.offset);
            out[filled..filled + n].copy_from_slice(&block.samples[self.offset..self.offset + n]);
            filled += n;
            self.offset += n;

            if self.offset >= block.len() {
                self.retire_current();
            }
        }

        let rendered = filled as u64;
        self.counters.queued_samples.fetch_sub(rendered, Ordering::Relaxed);
        self.counters.samples_rendered.fetch_add(rendered, Ordering::Relaxed);

        if filled == out.len() {
            self.underrun = false;
            return RenderOutcome::Full;
        }

        out[filled..].fill(0.0);
        self.underrun = true;
        self.counters.underruns.fetch_add(1, Ordering::Relaxed);
        self.counters
            .underrun_samples
            .fetch_add((out.len() - filled) as u64, Ordering::Relaxed);

        if filled > 0 {
            self.counters.partial_fills.fetch_add(1, Ordering::Relaxed);
            RenderOutcome::Partial { filled }
        } else {
            RenderOutcome::Exhausted
        }
    }

    /// Renders into an interleaved buffer, copying the mono signal to every channel.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) -> RenderOutcome {
        // ---
        if channels <= 1 {
            return self.render(out);
        }

        let frames = out.len() / channels;
        let outcome = self.render(&mut out[..frames]);

        // Spread in place from the back so no unread mono sample is overwritten
        for frame in (0..frames).rev() {
            let sample = out[frame];
            out[frame * channels..(frame + 1) * channels].fill(sample);
        }
        out[frames * channels..].fill(0.0);

        outcome
    }

    /// Returns true if the last call ran out of audio.
    pub fn is_underrun(&self) -> bool {
        // ---
        self.underrun
    }

    /// Returns true once the minimum buffer has been reached.
    pub fn is_playing(&self) -> bool {
        // ---
        self.playing
    }

    /// Sequence number and offset of the block being played.
    pub fn position(&self) -> Option<(u64, usize)> {
        // ---
        self.current.as_ref().map(|b| (b.sequence, self.offset))
    }

    fn retire_current(&mut self) {
        // ---
        let Some(block) = self.current.take() else {
            return;
        };
        self.offset = 0;
        self.counters.queued_blocks.fetch_sub(1, Ordering::Relaxed);
        self.counters.blocks_consumed.fetch_add(1, Ordering::Relaxed);

        // The writer collects before every push, so this only fails if it
        // stopped collecting; the block is then freed here
        if self.retired.try_push(block).is_err() {
            self.counters.blocks_unretired.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Utc;

    fn block(sequence: u64, len: usize) -> Block {
        // Each sample encodes its block and position
        let samples = (0..len)
            .map(|i| sequence as f32 + i as f32 / 10_000.0)
            .collect();
        Block {
            sequence,
            sample_rate: 1000,
            samples,
            created: Utc::now(),
        }
    }

    fn queue(capacity: usize, min_buffer: u64) -> (QueueWriter, Renderer, Arc<PipelineCounters>) {
        let counters = PipelineCounters::new();
        let (writer, renderer) = playback_queue(capacity, counters.clone(), min_buffer);
        (writer, renderer, counters)
    }

    #[test]
    fn test_empty_queue_underrun() {
        // ---
        let (_writer, mut renderer, counters) = queue(4, 0);
        let mut out = vec![1.0f32; 256];

        let outcome = renderer.render(&mut out);

        assert_eq!(outcome, RenderOutcome::Exhausted);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(counters.underruns.load(Ordering::Relaxed), 1);
        assert_eq!(counters.underrun_samples.load(Ordering::Relaxed), 256);
        assert!(renderer.is_underrun());
    }

    #[test]
    fn test_full_render_spans_blocks() {
        // ---
        let (mut writer, mut renderer, counters) = queue(4, 0);
        writer.try_push(block(0, 300)).unwrap();
        writer.try_push(block(1, 300)).unwrap();

        let mut out = vec![0.0f32; 500];
        assert_eq!(renderer.render(&mut out), RenderOutcome::Full);

        assert_eq!(out[0], 0.0);
        assert_eq!(out[299], 299.0 / 10_000.0);
        assert_eq!(out[300], 1.0);
        assert_eq!(renderer.position(), Some((1, 200)));
        assert_eq!(counters.blocks_consumed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.queued_samples.load(Ordering::Relaxed), 100);
        assert!(!renderer.is_underrun());
    }

    #[test]
    fn test_partial_fill_then_silence() {
        // ---
        let (mut writer, mut renderer, counters) = queue(4, 0);
        writer.try_push(block(7, 100)).unwrap();

        let mut out = vec![9.0f32; 256];
        assert_eq!(renderer.render(&mut out), RenderOutcome::Partial { filled: 100 });

        assert_eq!(out[0], 7.0);
        assert!(out[100..].iter().all(|&s| s == 0.0));
        assert_eq!(counters.partial_fills.load(Ordering::Relaxed), 1);
        assert_eq!(counters.underruns.load(Ordering::Relaxed), 1);
        assert_eq!(counters.underrun_samples.load(Ordering::Relaxed), 156);
    }

    #[test]
    fn test_blocks_play_in_order_exactly_once() {
        // ---
        let (mut writer, mut renderer, _) = queue(8, 0);
        for seq in 0..6 {
            writer.try_push(block(seq, 37)).unwrap();
        }

        let mut played = Vec::new();
        let mut out = vec![0.0f32; 64];
        while renderer.render(&mut out) != RenderOutcome::Exhausted {
            played.extend_from_slice(&out);
        }

        let expected: Vec<f32> = (0..6).flat_map(|seq| block(seq, 37).samples).collect();
        assert_eq!(&played[..expected.len()], &expected[..]);
        assert!(played[expected.len()..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_prebuffering_is_silent_and_not_underrun() {
        // ---
        let (mut writer, mut renderer, counters) = queue(8, 500);
        writer.try_push(block(0, 300)).unwrap();

        let mut out = vec![1.0f32; 128];
        assert_eq!(renderer.render(&mut out), RenderOutcome::Prebuffering);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(counters.underruns.load(Ordering::Relaxed), 0);
        assert_eq!(counters.prebuffer_samples.load(Ordering::Relaxed), 128);
        assert!(!renderer.is_playing());

        writer.try_push(block(1, 300)).unwrap();
        assert_eq!(renderer.render(&mut out), RenderOutcome::Full);
        assert!(renderer.is_playing());
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 1.0 / 10_000.0);
    }

    #[test]
    fn test_full_queue_opens_gate() {
        // ---
        let (mut writer, mut renderer, _) = queue(2, 1_000_000);
        writer.try_push(block(0, 10)).unwrap();
        writer.try_push(block(1, 10)).unwrap();
        assert!(writer.is_full());

        let mut out = vec![0.0f32; 5];
        assert_eq!(renderer.render(&mut out), RenderOutcome::Full);
    }

    #[test]
    fn test_gate_stays_open_after_underrun() {
        // ---
        let (mut writer, mut renderer, _) = queue(4, 100);
        writer.try_push(block(0, 100)).unwrap();

        let mut out = vec![0.0f32; 100];
        assert_eq!(renderer.render(&mut out), RenderOutcome::Full);
        assert_eq!(renderer.render(&mut out), RenderOutcome::Exhausted);

        writer.try_push(block(1, 10)).unwrap();
        assert_eq!(renderer.render(&mut out), RenderOutcome::Partial { filled: 10 });
    }

    #[test]
    fn test_push_rejected_when_full() {
        // ---
        let (mut writer, _renderer, counters) = queue(1, 0);
        writer.try_push(block(0, 10)).unwrap();

        let rejected = writer.try_push(block(1, 10)).unwrap_err();
        assert_eq!(rejected.sequence, 1);
        assert_eq!(counters.queued_samples.load(Ordering::Relaxed), 10);
        assert_eq!(counters.queued_blocks.load(Ordering::Relaxed), 1);
        assert_eq!(writer.len(), 1);
        assert_eq!(writer.capacity(), 1);
    }

    #[test]
    fn test_finished_blocks_come_back() {
        // ---
        let (mut writer, mut renderer, _) = queue(4, 0);
        writer.try_push(block(0, 10)).unwrap();
        writer.try_push(block(1, 10)).unwrap();

        let mut out = vec![0.0f32; 15];
        renderer.render(&mut out);

        let finished = writer.drain_retired();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].sequence, 0);
        assert!(writer.drain_retired().is_empty());
    }

    #[test]
    fn test_refills_without_draining_lose_no_finished_block() {
        // ---
        // The return ring holds two; five blocks finish before anyone drains
        let (mut writer, mut renderer, counters) = queue(1, 0);
        let mut out = vec![0.0f32; 10];
        for seq in 0..5 {
            writer.try_push(block(seq, 10)).unwrap();
            assert_eq!(renderer.render(&mut out), RenderOutcome::Full);
        }

        let finished: Vec<u64> = writer.drain_retired().iter().map(|id| id.sequence).collect();
        assert_eq!(finished, vec![0, 1, 2, 3, 4]);
        assert_eq!(counters.blocks_unretired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_interleaved_duplicates_channels() {
        // ---
        let (mut writer, mut renderer, _) = queue(4, 0);
        writer.try_push(block(2, 4)).unwrap();

        let mut out = vec![9.0f32; 8];
        assert_eq!(renderer.render_interleaved(&mut out, 2), RenderOutcome::Full);

        let expected = block(2, 4).samples;
        for (frame, pair) in out.chunks_exact(2).enumerate() {
            assert_eq!(pair[0], expected[frame]);
            assert_eq!(pair[1], expected[frame]);
        }
    }
}
