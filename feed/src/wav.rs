//! Replay of recorded traces stored as WAV files.
//!
//! Recorded seismic traces are often exported as WAV at the station's native
//! rate (20-100 Hz). Replaying one through the pipeline exercises exactly the
//! same path as a live station.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tracing::info;

use crate::{Packet, PacketSource};

/// Full scale used when mapping float recordings back to counts (24-bit digitizer)
const FLOAT_FULL_SCALE: f32 = 8_388_607.0;

/// A recorded trace: mono counts at the native rate.
#[derive(Debug, Clone)]
pub struct Trace {
    // ---
    /// Samples as digitizer counts
    pub samples: Vec<i32>,

    /// Native sample rate of the recording
    pub sample_rate: f64,

    /// Number of channels in the file before mono mixdown
    pub original_channels: u16,
}

impl Trace {
    // ---
    /// Returns the trace duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        // ---
        self.samples.len() as f64 / self.sample_rate
    }
}

/// Reads a WAV recording into a mono trace.
///
/// Integer files of 8 to 32 bits keep their counts as is. 32-bit float files
/// are assumed to be normalized to [-1, 1] and are scaled to 24-bit counts.
///
/// # Errors
///
/// Returns error if:
/// - File cannot be opened
/// - WAV format is invalid or unsupported
/// - The file holds no samples
pub fn read_trace<P: AsRef<Path>>(path: P) -> Result<Trace> {
    // ---
    let path = path.as_ref();
    info!("Reading trace: {}", path.display());

    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    info!(
        "WAV format: {}Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let interleaved: Vec<i32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 8..=32) => reader
            .samples::<i32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read integer WAV samples")?,

        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 32-bit float WAV samples")?
            .into_iter()
            .map(|s| (s.clamp(-1.0, 1.0) * FLOAT_FULL_SCALE).round() as i32)
            .collect(),

        (format, bits) => {
            anyhow::bail!("unsupported WAV sample format: {:?} {}-bit", format, bits);
        }
    };

    let samples = if spec.channels > 1 {
        info!("Averaging {} channels to mono", spec.channels);
        convert_to_mono(&interleaved, spec.channels as usize)
    } else {
        interleaved
    };

    if samples.is_empty() {
        anyhow::bail!("WAV file {} contains no samples", path.display());
    }

    Ok(Trace {
        samples,
        sample_rate: spec.sample_rate as f64,
        original_channels: spec.channels,
    })
}

/// Averages interleaved frames down to one channel.
fn convert_to_mono(samples: &[i32], channels: usize) -> Vec<i32> {
    // ---
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i64 = frame.iter().map(|&s| s as i64).sum();
            (sum / channels as i64) as i32
        })
        .collect()
}

/// Replays a trace as variable-length packets at its native rate.
pub struct WavSource {
    // ---
    trace: Trace,
    position: usize,
    min_len: usize,
    max_len: usize,
    looping: bool,
    rng: StdRng,
}

impl WavSource {
    // ---
    /// Creates a source over `trace`, cutting packets of 200..=500 samples.
    pub fn new(trace: Trace, looping: bool) -> Self {
        // ---
        Self {
            trace,
            position: 0,
            min_len: 200,
            max_len: 500,
            looping,
            rng: StdRng::from_entropy(),
        }
    }

    /// Opens and reads a WAV file into a source.
    pub fn open<P: AsRef<Path>>(path: P, looping: bool) -> Result<Self> {
        // ---
        Ok(Self::new(read_trace(path)?, looping))
    }

    /// Sets the inclusive packet length range (in samples).
    pub fn with_packet_len(mut self, min_len: usize, max_len: usize) -> Self {
        // ---
        self.min_len = min_len.max(1);
        self.max_len = max_len.max(self.min_len);
        self
    }

    /// Makes packet lengths reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        // ---
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl PacketSource for WavSource {
    // ---
    fn source_rate(&self) -> f64 {
        self.trace.sample_rate
    }

    fn next_packet(&mut self) -> Option<Packet> {
        // ---
        if self.position >= self.trace.samples.len() {
            if !self.looping {
                return None;
            }
            info!("Trace finished, looping");
            self.position = 0;
        }

        let len = self.rng.gen_range(self.min_len..=self.max_len);
        let end = (self.position + len).min(self.trace.samples.len());
        let samples = self.trace.samples[self.position..end].to_vec();
        self.position = end;

        Some(Packet::new(self.trace.sample_rate, samples))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, channels: u16, rate: u32, samples: &[i16]) {
        // ---
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).expect("create wav");
        for &s in samples {
            writer.write_sample(s).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }

    #[test]
    fn test_convert_to_mono_stereo() {
        // ---
        let stereo = vec![100, 200, 300, 400, 500, 600];
        assert_eq!(convert_to_mono(&stereo, 2), vec![150, 350, 550]);
    }

    #[test]
    fn test_read_trace_keeps_native_rate() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.wav");
        write_wav(&path, 1, 40, &[1, -2, 3, -4]);

        let trace = read_trace(&path).expect("trace should load");
        assert_eq!(trace.sample_rate, 40.0);
        assert_eq!(trace.samples, vec![1, -2, 3, -4]);
        assert!((trace.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_read_trace_averages_channels() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, 100, &[10, 20, 30, 40]);

        let trace = read_trace(&path).expect("trace should load");
        assert_eq!(trace.original_channels, 2);
        assert_eq!(trace.samples, vec![15, 35]);
    }

    #[test]
    fn test_read_missing_file_fails() {
        // ---
        assert!(read_trace("/nonexistent/trace.wav").is_err());
    }

    #[test]
    fn test_source_replays_whole_trace_once() {
        // ---
        let trace = Trace {
            samples: (0..1000).collect(),
            sample_rate: 20.0,
            original_channels: 1,
        };
        let mut source = WavSource::new(trace, false)
            .with_packet_len(100, 300)
            .with_seed(5);

        let mut replayed = Vec::new();
        while let Some(packet) = source.next_packet() {
            assert_eq!(packet.source_rate, 20.0);
            replayed.extend(packet.samples);
        }
        assert_eq!(replayed, (0..1000).collect::<Vec<i32>>());
    }

    #[test]
    fn test_source_loops() {
        // ---
        let trace = Trace {
            samples: vec![1, 2, 3],
            sample_rate: 20.0,
            original_channels: 1,
        };
        let mut source = WavSource::new(trace, true).with_packet_len(3, 3);
        assert_eq!(source.next_packet().unwrap().samples, vec![1, 2, 3]);
        assert_eq!(source.next_packet().unwrap().samples, vec![1, 2, 3]);
    }
}
