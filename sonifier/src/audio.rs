//! Audio output using cpal.
//!
//! Opens an output device at the pipeline rate with a fixed callback size and
//! hands the [`Renderer`] to the device callback, which owns it from then on.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleRate, Stream, StreamConfig};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::playback::Renderer;

/// A running output stream driven by the render callback.
///
/// Dropping it stops the callback.
pub struct AudioOutput {
    // ---
    stream: Stream,
    device_name: String,
}

impl AudioOutput {
    // ---
    /// Opens an output device and starts playback.
    ///
    /// # Arguments
    ///
    /// * `device_name` - Output device to use, or `None` for the default one
    /// * `config` - Supplies rate, callback size and channel count
    /// * `renderer` - Render end of the playback queue, moved into the callback
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The named device does not exist, or there is no default device
    /// - The device rejects the stream configuration
    /// - The stream cannot be started
    pub fn open(
        device_name: Option<&str>,
        config: &PipelineConfig,
        mut renderer: Renderer,
    ) -> Result<Self> {
        // ---
        let host = cpal::default_host();
        let device = find_device(&host, device_name)?;
        let device_name = device.name().unwrap_or_else(|_| "<unnamed>".into());
        info!("Using audio device: {}", device_name);

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: SampleRate(config.target_rate),
            buffer_size: BufferSize::Fixed(config.blocksize),
        };
        debug!("Stream config: {:?}", stream_config);

        let channels = config.channels as usize;
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.render_interleaved(data, channels);
                },
                |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .with_context(|| {
                format!(
                    "failed to build output stream on {} ({} Hz, {} ch, {} frames)",
                    device_name, config.target_rate, config.channels, config.blocksize
                )
            })?;

        stream.play().context("failed to start audio stream")?;
        info!(
            "Audio stream started: {} Hz, {} frames per callback ({:.1} ms)",
            config.target_rate,
            config.blocksize,
            config.block_period().as_secs_f64() * 1000.0
        );

        Ok(Self {
            stream,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        // ---
        &self.device_name
    }

    /// Pauses the device and tears the stream down.
    pub fn stop(self) {
        // ---
        if let Err(e) = self.stream.pause() {
            debug!("Audio stream pause failed: {}", e);
        }
        drop(self.stream);
        info!("Audio stream stopped");
    }
}

/// Names of every output device on the default host.
pub fn list_output_devices() -> Result<Vec<String>> {
    // ---
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .context("failed to enumerate output devices")?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

fn find_device(host: &Host, name: Option<&str>) -> Result<Device> {
    // ---
    match name {
        None => host
            .default_output_device()
            .context("no output device available"),
        Some(wanted) => host
            .output_devices()
            .context("failed to enumerate output devices")?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .with_context(|| format!("output device not found: {wanted}")),
    }
}
