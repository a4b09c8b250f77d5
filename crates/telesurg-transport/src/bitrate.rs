//! Adaptive bitrate and forward error correction control

use telesurg_core::StreamingParameters;

/// Latency above `target × LATENCY_FACTOR` triggers a reduction
pub const LATENCY_FACTOR: f32 = 1.5;
/// Loss above this fraction enables FEC
pub const LOSS_THRESHOLD: f32 = 0.01;
/// Reduction per degraded report
pub const REDUCTION: f32 = 0.20;
/// Recovery per healthy report
pub const RECOVERY: f32 = 0.05;

/// Outcome of one metrics report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateDecision {
    pub bitrate_kbps: u32,
    pub fec: bool,
    /// Latency or loss is outside its budget
    pub degraded: bool,
    pub bitrate_changed: bool,
    pub fec_changed: bool,
}

#[derive(Debug, Clone)]
pub struct AdaptiveBitrate {
    min_kbps: u32,
    max_kbps: u32,
    current_kbps: u32,
    target_latency_ms: f32,
    fec: bool,
}

impl AdaptiveBitrate {
    /// Starts at the configured maximum with FEC off
    pub fn new(params: &StreamingParameters) -> Self {
        AdaptiveBitrate {
            min_kbps: params.bitrate_min_kbps,
            max_kbps: params.bitrate_max_kbps.max(params.bitrate_min_kbps),
            current_kbps: params.bitrate_max_kbps.max(params.bitrate_min_kbps),
            target_latency_ms: params.target_latency_ms,
            fec: false,
        }
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.current_kbps
    }

    pub fn fec_enabled(&self) -> bool {
        self.fec
    }

    pub fn adjust(&mut self, avg_latency_ms: Option<f32>, loss_rate: f32) -> BitrateDecision {
        let previous = self.current_kbps;
        let previous_fec = self.fec;

        let slow = avg_latency_ms.map_or(false, |l| l > self.target_latency_ms * LATENCY_FACTOR);
        let within_target = avg_latency_ms.map_or(true, |l| l <= self.target_latency_ms);
        let lossy = loss_rate > LOSS_THRESHOLD;

        if slow {
            self.current_kbps = self.scale(1.0 - REDUCTION);
        } else if within_target && !lossy {
            self.current_kbps = self.scale(1.0 + RECOVERY);
        }
        self.fec = lossy;

        BitrateDecision {
            bitrate_kbps: self.current_kbps,
            fec: self.fec,
            degraded: slow || lossy,
            bitrate_changed: self.current_kbps != previous,
            fec_changed: self.fec != previous_fec,
        }
    }

    fn scale(&self, factor: f32) -> u32 {
        let scaled = (self.current_kbps as f32 * factor).round() as u32;
        scaled.clamp(self.min_kbps, self.max_kbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitrate() -> AdaptiveBitrate {
        AdaptiveBitrate::new(&StreamingParameters {
            target_latency_ms: 20.0,
            bitrate_min_kbps: 1000,
            bitrate_max_kbps: 10_000,
            ..Default::default()
        })
    }

    #[test]
    fn test_reduces_on_high_latency() {
        let mut b = bitrate();
        let d = b.adjust(Some(31.0), 0.0);
        assert_eq!(d.bitrate_kbps, 8000);
        assert!(d.degraded && d.bitrate_changed);

        // exactly 1.5× target is not over
        let d = b.adjust(Some(30.0), 0.0);
        assert_eq!(d.bitrate_kbps, 8000);
        assert!(!d.degraded);
    }

    #[test]
    fn test_bounded_by_min() {
        let mut b = bitrate();
        for _ in 0..50 {
            b.adjust(Some(500.0), 0.0);
        }
        assert_eq!(b.bitrate_kbps(), 1000);
    }

    #[test]
    fn test_recovers_when_healthy() {
        let mut b = bitrate();
        b.adjust(Some(100.0), 0.0);
        let d = b.adjust(Some(10.0), 0.0);
        assert_eq!(d.bitrate_kbps, 8400);
        for _ in 0..20 {
            b.adjust(Some(10.0), 0.0);
        }
        assert_eq!(b.bitrate_kbps(), 10_000);
    }

    #[test]
    fn test_fec_follows_loss() {
        let mut b = bitrate();
        let d = b.adjust(Some(10.0), 0.02);
        assert!(d.fec && d.fec_changed && d.degraded);
        assert_eq!(d.bitrate_kbps, 10_000);

        let d = b.adjust(Some(10.0), 0.005);
        assert!(!d.fec && d.fec_changed && !d.degraded);
    }
}
