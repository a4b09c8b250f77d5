//! Latency and packet-loss monitors

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use telesurg_core::Timestamp;

/// Rolling window of one-way latency samples (ms)
#[derive(Debug, Clone)]
pub struct LatencyMonitor {
    samples: VecDeque<f32>,
    window: usize,
}

impl LatencyMonitor {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        LatencyMonitor {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn record(&mut self, latency_ms: f32) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f32>() / self.samples.len() as f32)
    }

    pub fn max(&self) -> Option<f32> {
        self.samples.iter().copied().reduce(f32::max)
    }

    /// Nearest-rank percentile, `p` in [0, 100]
    pub fn percentile(&self, p: f32) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f32> = self.samples.iter().copied().collect();
        sorted.sort_by(f32::total_cmp);
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f32).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Outstanding sent IDs; anything unacknowledged after the window is lost
#[derive(Debug, Clone)]
pub struct PacketLossMonitor {
    pending: HashMap<u32, Timestamp>,
    window: Duration,
    acked: u64,
    lost: u64,
}

impl PacketLossMonitor {
    pub fn new(window: Duration) -> Self {
        PacketLossMonitor {
            pending: HashMap::new(),
            window,
            acked: 0,
            lost: 0,
        }
    }

    pub fn record_sent(&mut self, id: u32, at: Timestamp) {
        self.pending.insert(id, at);
    }

    /// False for unknown or already-expired IDs
    pub fn acknowledge(&mut self, id: u32) -> bool {
        if self.pending.remove(&id).is_some() {
            self.acked += 1;
            true
        } else {
            false
        }
    }

    /// Expire IDs older than the window; returns how many were lost
    pub fn prune(&mut self, now: Timestamp) -> usize {
        let window = self.window;
        let before = self.pending.len();
        self.pending.retain(|_, sent| now.since(*sent) <= window);
        let expired = before - self.pending.len();
        self.lost += expired as u64;
        expired
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Loss over the period since the last call, resetting the counters
    pub fn take_loss_rate(&mut self) -> f32 {
        let total = self.acked + self.lost;
        let rate = if total == 0 {
            0.0
        } else {
            self.lost as f32 / total as f32
        };
        self.acked = 0;
        self.lost = 0;
        rate
    }
}

impl Default for PacketLossMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats() {
        let mut m = LatencyMonitor::new(4);
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            m.record(v);
        }
        assert_eq!(m.len(), 4);
        assert_eq!(m.average(), Some(35.0));
        assert_eq!(m.max(), Some(50.0));
        assert_eq!(m.percentile(50.0), Some(30.0));
        assert_eq!(m.percentile(100.0), Some(50.0));
        assert_eq!(m.percentile(0.0), Some(20.0));
    }

    #[test]
    fn test_latency_ignores_garbage() {
        let mut m = LatencyMonitor::default();
        m.record(f32::NAN);
        m.record(-1.0);
        assert!(m.is_empty());
        assert_eq!(m.average(), None);
    }

    #[test]
    fn test_loss_window() {
        let mut m = PacketLossMonitor::default();
        for id in 0..100 {
            m.record_sent(id, Timestamp::from_millis(id as u64));
        }
        for id in 0..98 {
            assert!(m.acknowledge(id));
        }
        assert!(!m.acknowledge(7));

        assert_eq!(m.prune(Timestamp::from_millis(500)), 0);
        assert_eq!(m.outstanding(), 2);
        assert_eq!(m.prune(Timestamp::from_millis(1200)), 2);
        assert!((m.take_loss_rate() - 0.02).abs() < 1e-6);
        assert_eq!(m.take_loss_rate(), 0.0);
    }
}
