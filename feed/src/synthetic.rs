//! Synthetic seismic-like signal.
//!
//! Generates a low-frequency sine (with a slow amplitude swell) in digitizer
//! counts, cut into packets of random length, the way a station server cuts
//! its data records.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;

use crate::{Packet, PacketSource};

/// Endless sine source at a fixed native rate.
///
/// # Example
///
/// ```
/// use feed::{PacketSource, SineSource};
///
/// let mut source = SineSource::new(20.0, 0.2, 50_000.0).with_packet_len(100, 100);
/// let packet = source.next_packet().unwrap();
/// assert_eq!(packet.samples.len(), 100);
/// assert_eq!(packet.source_rate, 20.0);
/// ```
#[derive(Debug)]
pub struct SineSource {
    // ---
    rate: f64,
    frequency: f64,
    amplitude: f64,
    min_len: usize,
    max_len: usize,
    sample_index: u64,
    limit: Option<u64>,
    rng: StdRng,
}

impl SineSource {
    // ---
    /// Creates a source at `rate` Hz producing a `frequency` Hz tone peaking at
    /// `amplitude` counts. Packet lengths default to 200..=500 samples.
    pub fn new(rate: f64, frequency: f64, amplitude: f64) -> Self {
        // ---
        Self {
            rate,
            frequency,
            amplitude,
            min_len: 200,
            max_len: 500,
            sample_index: 0,
            limit: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Sets the inclusive packet length range (in samples).
    pub fn with_packet_len(mut self, min_len: usize, max_len: usize) -> Self {
        // ---
        self.min_len = min_len.max(1);
        self.max_len = max_len.max(self.min_len);
        self
    }

    /// Stops after `packets` packets instead of running forever.
    pub fn with_limit(mut self, packets: u64) -> Self {
        // ---
        self.limit = Some(packets);
        self
    }

    /// Makes packet lengths reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        // ---
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn sample_at(&self, n: u64) -> i32 {
        // ---
        let t = n as f64 / self.rate;
        // 60 s amplitude swell so normalization has something to track
        let envelope = 0.55 + 0.45 * (TAU * t / 60.0).sin();
        (self.amplitude * envelope * (TAU * self.frequency * t).sin()).round() as i32
    }
}

impl PacketSource for SineSource {
    // ---
    fn source_rate(&self) -> f64 {
        self.rate
    }

    fn next_packet(&mut self) -> Option<Packet> {
        // ---
        if let Some(remaining) = self.limit.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        let len = self.rng.gen_range(self.min_len..=self.max_len);
        let start = self.sample_index;
        let samples = (start..start + len as u64)
            .map(|n| self.sample_at(n))
            .collect();
        self.sample_index += len as u64;

        Some(Packet::new(self.rate, samples))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_packet_lengths_in_range() {
        // ---
        let mut source = SineSource::new(40.0, 0.5, 1000.0)
            .with_packet_len(10, 20)
            .with_seed(3);
        for _ in 0..50 {
            let packet = source.next_packet().expect("endless source");
            assert!((10..=20).contains(&packet.len()));
        }
    }

    #[test]
    fn test_signal_is_continuous_across_packets() {
        // ---
        let mut source = SineSource::new(20.0, 0.2, 10_000.0)
            .with_packet_len(5, 5)
            .with_seed(1);
        let a = source.next_packet().unwrap();
        let b = source.next_packet().unwrap();
        let joined: Vec<i32> = a.samples.iter().chain(b.samples.iter()).copied().collect();

        let reference = SineSource::new(20.0, 0.2, 10_000.0);
        let expected: Vec<i32> = (0..10).map(|n| reference.sample_at(n)).collect();
        assert_eq!(joined, expected);
    }

    #[test]
    fn test_limit_exhausts_source() {
        // ---
        let mut source = SineSource::new(20.0, 0.2, 1.0).with_limit(2);
        assert!(source.next_packet().is_some());
        assert!(source.next_packet().is_some());
        assert!(source.next_packet().is_none());
    }

    #[test]
    fn test_amplitude_bounded() {
        // ---
        let mut source = SineSource::new(100.0, 1.0, 5000.0).with_seed(9);
        let packet = source.next_packet().unwrap();
        assert!(packet.samples.iter().all(|s| s.abs() <= 5000));
    }
}
