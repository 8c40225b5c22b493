//! Runtime configuration for the sonification pipeline.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::resampler::ResampleQuality;

/// Every tunable of the pipeline. Built by the CLI, validated before anything starts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // ---
    /// Output (device) sample rate in Hz
    pub target_rate: u32,

    /// Frames requested per device callback
    pub blocksize: u32,

    /// Output channels; the mono signal is copied to each
    pub channels: u16,

    /// Stored blocks required before the loader starts feeding playback
    pub block_delay: usize,

    /// Buffered audio required before the first non-silent callback
    pub min_buffer_seconds: f64,

    /// Retention limit of the block store
    pub max_blocks: usize,

    /// Fade in/out length at each block edge in milliseconds (0 disables)
    pub taper_ms: f64,

    /// Capacity of the in-memory playback queue, in blocks
    pub queue_capacity: usize,

    /// Packets allowed to wait for the ingest thread before new ones are dropped
    pub ingest_backlog: usize,

    /// Directory holding persisted blocks
    pub store_dir: PathBuf,

    /// Delete leftover blocks from a previous run at startup
    pub clear_store_on_start: bool,

    /// Where the status snapshot is rewritten (None disables the file)
    pub status_path: Option<PathBuf>,

    /// Interval between status snapshots
    pub status_interval: Duration,

    /// Loader poll interval
    pub loader_interval: Duration,

    /// Interpolation used when rates differ
    pub resample_quality: ResampleQuality,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // ---
        Self {
            target_rate: 44_100,
            blocksize: 2048,
            channels: 1,
            block_delay: 20,
            min_buffer_seconds: 30.0,
            max_blocks: 100,
            taper_ms: 5.0,
            queue_capacity: 64,
            ingest_backlog: 64,
            store_dir: PathBuf::from("wav_blocks"),
            clear_store_on_start: true,
            status_path: Some(PathBuf::from("status.json")),
            status_interval: Duration::from_secs(1),
            loader_interval: Duration::from_millis(100),
            resample_quality: ResampleQuality::Sinc,
        }
    }
}

impl PipelineConfig {
    // ---
    /// Checks the configuration is usable. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.target_rate == 0 {
            anyhow::bail!("target sample rate must be positive");
        }
        if self.blocksize == 0 {
            anyhow::bail!("blocksize must be positive");
        }
        if self.channels == 0 {
            anyhow::bail!("channel count must be positive");
        }
        if self.block_delay < 1 {
            anyhow::bail!("block delay must be at least 1");
        }
        if self.max_blocks < 1 {
            anyhow::bail!("max blocks must be at least 1");
        }
        if self.block_delay > self.max_blocks {
            anyhow::bail!(
                "block delay ({}) exceeds max blocks ({}); playback could never start",
                self.block_delay,
                self.max_blocks
            );
        }
        if !self.min_buffer_seconds.is_finite() || self.min_buffer_seconds < 0.0 {
            anyhow::bail!("minimum buffer must be a non-negative number of seconds");
        }
        if !self.taper_ms.is_finite() || self.taper_ms < 0.0 {
            anyhow::bail!("taper duration cannot be negative");
        }
        if self.queue_capacity < 1 {
            anyhow::bail!("playback queue capacity must be at least 1");
        }
        if self.ingest_backlog < 1 {
            anyhow::bail!("ingest backlog must be at least 1");
        }
        if self.loader_interval.is_zero() || self.status_interval.is_zero() {
            anyhow::bail!("poll intervals must be non-zero");
        }
        Ok(())
    }

    /// Taper length in output samples.
    pub fn taper_len(&self) -> usize {
        // ---
        (self.target_rate as f64 * self.taper_ms / 1000.0) as usize
    }

    /// Buffered samples required before playback starts.
    pub fn min_buffer_samples(&self) -> u64 {
        // ---
        (self.min_buffer_seconds * self.target_rate as f64).ceil() as u64
    }

    /// Deadline of one render callback.
    pub fn block_period(&self) -> Duration {
        // ---
        Duration::from_secs_f64(self.blocksize as f64 / self.target_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_default_is_valid() {
        // ---
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_taper_and_disabling_it() {
        // ---
        let config = PipelineConfig::default();
        assert_eq!(config.taper_ms, 5.0);
        assert_eq!(config.taper_len(), 220);

        let no_taper = PipelineConfig {
            taper_ms: 0.0,
            ..PipelineConfig::default()
        };
        assert!(no_taper.validate().is_ok());
        assert_eq!(no_taper.taper_len(), 0);
    }

    #[test]
    fn test_derived_values() {
        // ---
        let config = PipelineConfig {
            target_rate: 44_100,
            blocksize: 2048,
            taper_ms: 5.0,
            min_buffer_seconds: 2.0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.taper_len(), 220);
        assert_eq!(config.min_buffer_samples(), 88_200);
        let period = config.block_period().as_secs_f64();
        assert!((period - 2048.0 / 44_100.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_zero_rate() {
        // ---
        let config = PipelineConfig {
            target_rate: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_block_delay() {
        // ---
        let config = PipelineConfig {
            block_delay: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_delay_beyond_retention() {
        // ---
        let config = PipelineConfig {
            block_delay: 10,
            max_blocks: 5,
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("could never start"));
    }

    #[test]
    fn test_rejects_negative_taper_and_buffer() {
        // ---
        let taper = PipelineConfig {
            taper_ms: -1.0,
            ..PipelineConfig::default()
        };
        assert!(taper.validate().is_err());

        let buffer = PipelineConfig {
            min_buffer_seconds: f64::NAN,
            ..PipelineConfig::default()
        };
        assert!(buffer.validate().is_err());
    }
}
