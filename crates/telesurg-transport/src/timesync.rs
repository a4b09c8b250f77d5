//! Clock offset and round-trip estimation from ping/pong exchanges

use std::collections::VecDeque;
use std::time::Duration;

use telesurg_core::Timestamp;
use telesurg_wire::Pong;

/// One completed exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    /// Remote clock minus local clock, µs
    pub offset_us: i64,
    /// Network round trip excluding responder hold time
    pub round_trip: Duration,
}

impl SyncSample {
    /// NTP-style estimate; `arrival` is the local receive time of the pong
    pub fn from_pong(pong: &Pong, arrival: Timestamp) -> Self {
        let t0 = pong.origin.as_micros() as i64;
        let t1 = pong.received.as_micros() as i64;
        let t2 = pong.transmitted.as_micros() as i64;
        let t3 = arrival.as_micros() as i64;

        let offset_us = ((t1 - t0) + (t2 - t3)) / 2;
        let round_trip = ((t3 - t0) - (t2 - t1)).max(0) as u64;
        SyncSample {
            offset_us,
            round_trip: Duration::from_micros(round_trip),
        }
    }
}

/// Median of recent offsets
#[derive(Debug, Clone)]
pub struct TimeSync {
    offsets: VecDeque<i64>,
    max_samples: usize,
}

impl TimeSync {
    pub fn new(max_samples: usize) -> Self {
        TimeSync {
            offsets: VecDeque::with_capacity(max_samples.max(1)),
            max_samples: max_samples.max(1),
        }
    }

    pub fn update(&mut self, sample: &SyncSample) {
        if self.offsets.len() == self.max_samples {
            self.offsets.pop_front();
        }
        self.offsets.push_back(sample.offset_us);
    }

    pub fn sample_count(&self) -> usize {
        self.offsets.len()
    }

    /// Remote minus local, µs
    pub fn offset_us(&self) -> Option<i64> {
        if self.offsets.is_empty() {
            return None;
        }
        let mut sorted: Vec<i64> = self.offsets.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2
        } else {
            sorted[mid]
        })
    }

    /// Convert a remote timestamp to the local clock
    pub fn to_local(&self, remote: Timestamp) -> Timestamp {
        let offset = self.offset_us().unwrap_or(0);
        Timestamp::from_micros((remote.as_micros() as i64 - offset).max(0) as u64)
    }
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new(32)
    }
}
