//! Packet to block conversion: normalization, resampling and edge tapering.
//!
//! Each packet is converted independently. Level continuity across blocks
//! comes from normalizing against the running peak of the whole stream
//! rather than the peak of each packet, and click suppression at block
//! boundaries comes from a short Hann fade at both ends.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use sonify_common::Packet;
use std::f64::consts::PI;
use tracing::{debug, warn};

use crate::block::Block;

/// Length of the windowed-sinc kernel in source frames
const SINC_LEN: usize = 128;

/// Source frames of held edge value added on each side of a sinc chunk
const EDGE_PAD: usize = SINC_LEN;

/// Upper bound on extra chunks pushed through when a padded chunk falls short
const MAX_EXTRA_CHUNKS: usize = 16;

/// Interpolation algorithm used when source and output rates differ.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleQuality {
    /// Band-limited windowed-sinc interpolation
    #[default]
    Sinc,

    /// Linear interpolation, cheap but aliases
    Linear,
}

/// Running peak of the stream, used as the normalization reference.
///
/// The peak only grows. A loud event therefore lowers the level of everything
/// after it, but no block is ever louder than full scale and adjacent blocks
/// never jump in level relative to each other.
#[derive(Debug, Clone, Default)]
pub struct NormalizationContext {
    // ---
    global_max: f64,
}

impl NormalizationContext {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Current reference peak in counts.
    pub fn global_max(&self) -> f64 {
        // ---
        self.global_max
    }

    /// Folds the packet's peak into the running peak, then scales the packet by it.
    pub fn normalize(&mut self, samples: &[i32]) -> Vec<f32> {
        // ---
        let peak = samples
            .iter()
            .map(|&s| (s as f64).abs())
            .fold(0.0_f64, f64::max);
        if peak > self.global_max {
            debug!("Normalization peak raised {} -> {}", self.global_max, peak);
            self.global_max = peak;
        }

        if self.global_max > 0.0 {
            samples
                .iter()
                .map(|&s| (s as f64 / self.global_max) as f32)
                .collect()
        } else {
            vec![0.0; samples.len()]
        }
    }
}

/// Output length for `len` input samples: `round(len * fs_out / fs_in)`.
pub fn expected_len(len: usize, fs_in: f64, fs_out: u32) -> usize {
    // ---
    (len as f64 * fs_out as f64 / fs_in).round() as usize
}

/// Converts `input` from `fs_in` to `fs_out`.
///
/// Equal rates pass the samples through untouched. Otherwise the output holds
/// exactly `expected_len(input.len(), fs_in, fs_out)` samples.
///
/// # Errors
///
/// Returns error if the source rate is not a positive finite number, the
/// input is too short to yield a single output sample, or the sinc
/// resampler cannot be built.
pub fn resample(
    input: &[f32],
    fs_in: f64,
    fs_out: u32,
    quality: ResampleQuality,
) -> Result<Vec<f32>> {
    // ---
    if !fs_in.is_finite() || fs_in <= 0.0 {
        anyhow::bail!("invalid source rate: {}", fs_in);
    }

    if fs_in == fs_out as f64 {
        return Ok(input.to_vec());
    }

    let target_len = expected_len(input.len(), fs_in, fs_out);
    if input.is_empty() || target_len == 0 {
        anyhow::bail!(
            "{} samples at {} Hz are too short to resample to {} Hz",
            input.len(),
            fs_in,
            fs_out
        );
    }

    let ratio = fs_out as f64 / fs_in;
    match quality {
        ResampleQuality::Sinc => resample_sinc(input, ratio, target_len),
        ResampleQuality::Linear => Ok(resample_linear(input, ratio, target_len)),
    }
}

/// Windowed-sinc resampling of one isolated chunk.
///
/// The filter needs `sinc_len / 2` source frames on either side of every
/// output frame, so the chunk is extended at both ends by repeating its edge
/// samples. The padded chunk goes through in one call, then the filter delay
/// and the padding are cut off the front and the result is cut to length.
/// Frames near the end of the chunk therefore see the held last sample
/// instead of the silence a flush would feed.
fn resample_sinc(input: &[f32], ratio: f64, target_len: usize) -> Result<Vec<f32>> {
    // ---
    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.925,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    let (Some(&first), Some(&last)) = (input.first(), input.last()) else {
        anyhow::bail!("cannot resample an empty chunk");
    };
    let mut padded = Vec::with_capacity(input.len() + 2 * EDGE_PAD);
    padded.resize(EDGE_PAD, first);
    padded.extend_from_slice(input);
    padded.resize(input.len() + 2 * EDGE_PAD, last);

    let chunk_len = padded.len();
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_len, 1)
        .context("failed to create sinc resampler")?;
    let skip = resampler.output_delay() + (EDGE_PAD as f64 * ratio).round() as usize;

    let waves_in = vec![padded];
    let mut output = resampler
        .process(&waves_in, None)
        .context("sinc resampling failed")?
        .swap_remove(0);

    // One padded chunk normally covers it; keep holding the last sample if not
    let hold = vec![vec![last; chunk_len]];
    for _ in 0..MAX_EXTRA_CHUNKS {
        if output.len() >= skip + target_len {
            break;
        }
        let more = resampler
            .process(&hold, None)
            .context("sinc resampling failed")?
            .swap_remove(0);
        if more.is_empty() {
            break;
        }
        output.extend_from_slice(&more);
    }

    let mut resampled: Vec<f32> = output.into_iter().skip(skip).take(target_len).collect();
    resampled.resize(target_len, last);
    Ok(resampled)
}

/// Linear interpolation between neighbouring input samples.
fn resample_linear(input: &[f32], ratio: f64, target_len: usize) -> Vec<f32> {
    // ---
    let step = 1.0 / ratio;
    let last = input.len() - 1;

    (0..target_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            if idx >= last {
                input[last]
            } else {
                let frac = (pos - idx as f64) as f32;
                input[idx] + (input[idx + 1] - input[idx]) * frac
            }
        })
        .collect()
}

/// Result of a taper request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaperOutcome {
    /// Fades applied to `len` samples at each end
    Applied { len: usize },

    /// Taper length is zero
    Disabled,

    /// Both fades would overlap; block left untouched
    Skipped { taper_len: usize, block_len: usize },
}

/// Fades in the first and fades out the last `taper_len` samples in place.
///
/// The fade shapes are the two halves of a Hann window of length
/// `2 * taper_len`. Samples between the fades are not modified.
pub fn apply_taper(samples: &mut [f32], taper_len: usize) -> TaperOutcome {
    // ---
    if taper_len == 0 {
        return TaperOutcome::Disabled;
    }
    if taper_len * 2 > samples.len() {
        return TaperOutcome::Skipped {
            taper_len,
            block_len: samples.len(),
        };
    }

    let window_len = taper_len * 2;
    let denom = (window_len - 1).max(1) as f64;
    let hann = |n: usize| (0.5 - 0.5 * (2.0 * PI * n as f64 / denom).cos()) as f32;

    let len = samples.len();
    for n in 0..taper_len {
        samples[n] *= hann(n);
        samples[len - taper_len + n] *= hann(taper_len + n);
    }

    TaperOutcome::Applied { len: taper_len }
}

/// Turns packets into blocks at the output rate.
///
/// Owns the normalization state and the sequence counter, so one instance
/// belongs to exactly one ingest context.
#[derive(Debug)]
pub struct Resampler {
    // ---
    target_rate: u32,
    quality: ResampleQuality,
    taper_len: usize,
    normalization: NormalizationContext,
    next_sequence: u64,

    /// Creation stamp of the previous block, at store (microsecond) precision
    last_created: Option<DateTime<Utc>>,
}

impl Resampler {
    // ---
    /// Creates a resampler producing blocks at `target_rate` Hz, numbered from zero.
    pub fn new(target_rate: u32, quality: ResampleQuality, taper_len: usize) -> Self {
        // ---
        Self {
            target_rate,
            quality,
            taper_len,
            normalization: NormalizationContext::new(),
            next_sequence: 0,
            last_created: None,
        }
    }

    /// Continues numbering from `sequence` (e.g. after a restart).
    pub fn with_first_sequence(mut self, sequence: u64) -> Self {
        // ---
        self.next_sequence = sequence;
        self
    }

    /// Stamps later blocks after `created` (the newest stored block on a restart).
    pub fn with_last_created(mut self, created: DateTime<Utc>) -> Self {
        // ---
        self.last_created = Some(created);
        self
    }

    /// Sequence number the next block will receive.
    pub fn next_sequence(&self) -> u64 {
        // ---
        self.next_sequence
    }

    /// Normalization state, for observability.
    pub fn normalization(&self) -> &NormalizationContext {
        // ---
        &self.normalization
    }

    /// Converts one packet into the next block.
    ///
    /// The sequence number advances only when a block is produced, so a
    /// dropped packet leaves no hole in the numbering.
    pub fn convert(&mut self, packet: &Packet) -> Result<Block> {
        // ---
        // Reject before the peak tracker sees samples that will never play
        if !packet.source_rate.is_finite() || packet.source_rate <= 0.0 {
            anyhow::bail!("invalid source rate {} Hz", packet.source_rate);
        }

        let normalized = self.normalization.normalize(&packet.samples);
        let mut samples = resample(
            &normalized,
            packet.source_rate,
            self.target_rate,
            self.quality,
        )?;

        if let TaperOutcome::Skipped {
            taper_len,
            block_len,
        } = apply_taper(&mut samples, self.taper_len)
        {
            warn!(
                "Taper of {} samples too long for block of {} samples, skipping taper",
                taper_len, block_len
            );
        }

        let block = Block {
            sequence: self.next_sequence,
            sample_rate: self.target_rate,
            samples,
            created: self.next_created(),
        };
        self.next_sequence += 1;

        debug!(
            "Packet of {} samples @ {} Hz -> block {} with {} samples @ {} Hz",
            packet.len(),
            packet.source_rate,
            block.sequence,
            block.len(),
            self.target_rate
        );

        Ok(block)
    }

    /// Wall-clock time truncated to microseconds, forced strictly past the
    /// previous block so a clock stepping backwards cannot reorder the store.
    fn next_created(&mut self) -> DateTime<Utc> {
        // ---
        let now = Utc::now();
        let now = DateTime::<Utc>::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        let created = match self.last_created {
            Some(last) if now <= last => {
                debug!("Clock at or behind previous block, stamping {} past it", last);
                last + ChronoDuration::microseconds(1)
            }
            _ => now,
        };
        self.last_created = Some(created);
        created
    }
}
