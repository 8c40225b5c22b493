//! Seismic feed stand-ins.
//!
//! A real deployment receives packets from a station server; this crate
//! provides sources that behave like one for local runs and tests: a synthetic
//! signal and a replay of a recorded trace. Both deliver variable-length
//! packets at irregular intervals to a single registered closure.

pub mod synthetic;
pub mod wav;

pub use sonify_common::Packet;
pub use synthetic::SineSource;
pub use wav::{read_trace, Trace, WavSource};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Something that yields feed packets in time order.
pub trait PacketSource: Send {
    // ---
    /// Native sample rate of the packets produced, in Hz.
    fn source_rate(&self) -> f64;

    /// Returns the next packet, or `None` when the source is exhausted.
    fn next_packet(&mut self) -> Option<Packet>;
}

/// Delivery timing model.
///
/// Station servers flush data in bursts: several packets back to back, then a
/// pause roughly as long as the audio they carried, give or take jitter.
#[derive(Debug)]
pub struct FeedPacing {
    // ---
    /// Maximum packets delivered back to back
    pub max_burst: usize,

    /// Relative jitter applied to each pause, in [0, 1)
    pub jitter: f64,

    /// Playback speed factor; 1.0 is real time
    pub speedup: f64,

    rng: StdRng,
}

impl FeedPacing {
    // ---
    /// Creates a pacing model seeded from OS entropy.
    pub fn new(max_burst: usize, jitter: f64, speedup: f64) -> Self {
        // ---
        Self::with_rng(max_burst, jitter, speedup, StdRng::from_entropy())
    }

    /// Creates a reproducible pacing model.
    pub fn with_seed(max_burst: usize, jitter: f64, speedup: f64, seed: u64) -> Self {
        // ---
        Self::with_rng(max_burst, jitter, speedup, StdRng::seed_from_u64(seed))
    }

    fn with_rng(max_burst: usize, jitter: f64, speedup: f64, rng: StdRng) -> Self {
        // ---
        Self {
            max_burst: max_burst.max(1),
            jitter: jitter.clamp(0.0, 0.99),
            speedup: if speedup > 0.0 { speedup } else { 1.0 },
            rng,
        }
    }

    /// Draws how many packets the next burst carries.
    pub fn next_burst(&mut self) -> usize {
        // ---
        self.rng.gen_range(1..=self.max_burst)
    }

    /// Pause after a burst that carried `signal_secs` of signal.
    pub fn pause_after(&mut self, signal_secs: f64) -> Duration {
        // ---
        let factor = if self.jitter > 0.0 {
            1.0 + self.rng.gen_range(-self.jitter..self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((signal_secs * factor / self.speedup).max(0.0))
    }
}

impl Default for FeedPacing {
    fn default() -> Self {
        // ---
        Self::new(3, 0.3, 1.0)
    }
}

/// Runs a source, handing every packet to `on_packet`.
///
/// The closure is the only coupling to the consumer; it must return quickly.
/// Stops when the source is exhausted or `shutdown` flips to `true`.
///
/// # Returns
///
/// Number of packets delivered.
pub async fn deliver<S, F>(
    mut source: S,
    mut pacing: FeedPacing,
    mut on_packet: F,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64>
where
    S: PacketSource,
    F: FnMut(Packet),
{
    // ---
    info!("Feed started at {} Hz", source.source_rate());
    let mut delivered: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let burst = pacing.next_burst();
        let mut signal_secs = 0.0;
        let mut exhausted = false;

        for _ in 0..burst {
            match source.next_packet() {
                Some(packet) => {
                    signal_secs += packet.duration_secs();
                    on_packet(packet);
                    delivered += 1;
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if exhausted {
            info!("Feed source exhausted after {} packets", delivered);
            break;
        }

        let pause = pacing.pause_after(signal_secs);
        debug!("Burst of {} packets, next delivery in {:?}", burst, pause);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown.changed() => {
                // Sender gone counts as shutdown too
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    Ok(delivered)
}
