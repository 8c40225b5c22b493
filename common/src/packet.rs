//! Feed delivery unit.
//!
//! A `Packet` is one irregular burst of waveform samples as delivered by a
//! station feed, at the station's native sample rate. Packets are ephemeral:
//! the pipeline consumes and discards them once converted into audio.

use chrono::{DateTime, Utc};

/// One delivery from a seismic feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    // ---
    /// Native sample rate of the source in Hz (e.g. 20.0, 40.0, 100.0)
    pub source_rate: f64,

    /// Raw digitizer counts in time order
    pub samples: Vec<i32>,

    /// Wall-clock instant the packet reached us
    pub arrival: DateTime<Utc>,
}

impl Packet {
    // ---
    /// Creates a packet stamped with the current time.
    pub fn new(source_rate: f64, samples: Vec<i32>) -> Self {
        // ---
        Self {
            source_rate,
            samples,
            arrival: Utc::now(),
        }
    }

    /// Returns the number of samples carried.
    pub fn len(&self) -> usize {
        // ---
        self.samples.len()
    }

    /// Returns true if the packet carries no samples.
    pub fn is_empty(&self) -> bool {
        // ---
        self.samples.is_empty()
    }

    /// Returns the signal duration covered by this packet in seconds.
    ///
    /// Zero if the source rate is not a positive number.
    pub fn duration_secs(&self) -> f64 {
        // ---
        if self.source_rate > 0.0 {
            self.samples.len() as f64 / self.source_rate
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_packet_duration() {
        // ---
        let packet = Packet::new(20.0, vec![0; 100]);
        assert_eq!(packet.len(), 100);
        assert!((packet.duration_secs() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_packet_invalid_rate_has_no_duration() {
        // ---
        let packet = Packet::new(0.0, vec![1, 2, 3]);
        assert_eq!(packet.duration_secs(), 0.0);
    }

    #[test]
    fn test_empty_packet() {
        // ---
        let packet = Packet::new(100.0, Vec::new());
        assert!(packet.is_empty());
    }
}
