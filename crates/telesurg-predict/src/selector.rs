//! Strategy selection from recent motion statistics

use serde::{Deserialize, Serialize};

use telesurg_core::PredictionAlgorithm;

use crate::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorThresholds {
    /// Mean jerk below which motion counts as smooth, mm/s³
    pub low_jerk: f32,
    /// Mean acceleration above which motion counts as aggressive, mm/s²
    pub high_acceleration: f32,
}

impl Default for SelectorThresholds {
    fn default() -> Self {
        SelectorThresholds {
            low_jerk: 1000.0,
            high_acceleration: 2000.0,
        }
    }
}

/// Mean magnitudes of the finite-difference derivatives
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionStatistics {
    pub acceleration: f32,
    pub jerk: f32,
}

impl MotionStatistics {
    /// `None` with fewer than four samples
    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        if samples.len() < 4 {
            return None;
        }

        let mut velocities = Vec::with_capacity(samples.len() - 1);
        for pair in samples.windows(2) {
            let dt = pair[1].0 - pair[0].0;
            if dt <= 0.0 {
                return None;
            }
            velocities.push(((pair[1].0 + pair[0].0) * 0.5, (pair[1].1 - pair[0].1) / dt));
        }

        let mut accelerations = Vec::with_capacity(velocities.len() - 1);
        for pair in velocities.windows(2) {
            let dt = pair[1].0 - pair[0].0;
            accelerations.push(((pair[1].0 + pair[0].0) * 0.5, (pair[1].1 - pair[0].1) / dt));
        }

        let jerks = accelerations.windows(2).map(|pair| {
            let dt = pair[1].0 - pair[0].0;
            ((pair[1].1 - pair[0].1) / dt).norm()
        });

        let acceleration = accelerations.iter().map(|(_, a)| a.norm()).sum::<f32>() / accelerations.len() as f32;
        let jerk = jerks.sum::<f32>() / (accelerations.len() - 1) as f32;

        Some(MotionStatistics { acceleration, jerk })
    }
}

/// Low jerk → linear, high acceleration → regression, otherwise polynomial
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveSelector {
    thresholds: SelectorThresholds,
}

impl AdaptiveSelector {
    pub fn new(thresholds: SelectorThresholds) -> Self {
        AdaptiveSelector { thresholds }
    }

    pub fn choose(&self, stats: &MotionStatistics) -> PredictionAlgorithm {
        if stats.jerk < self.thresholds.low_jerk {
            PredictionAlgorithm::Linear
        } else if stats.acceleration > self.thresholds.high_acceleration {
            PredictionAlgorithm::Regression
        } else {
            PredictionAlgorithm::Polynomial
        }
    }

    /// `None` when there is too little history to judge
    pub fn select(&self, samples: &[Sample]) -> Option<PredictionAlgorithm> {
        MotionStatistics::from_samples(samples).map(|stats| self.choose(&stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesurg_core::Vec3;

    /// Samples every 10 ms ending at t = 0
    fn sampled(f: impl Fn(f32) -> f32, count: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| {
                let t = -0.01 * (count - 1 - i) as f32;
                (t, Vec3::new(f(t), 0.0, 0.0))
            })
            .collect()
    }

    #[test]
    fn test_constant_velocity_is_linear() {
        let s = sampled(|t| 100.0 * t, 12);
        assert_eq!(AdaptiveSelector::default().select(&s), Some(PredictionAlgorithm::Linear));
    }

    #[test]
    fn test_fast_oscillation_is_regression() {
        let w = 2.0 * std::f32::consts::PI * 5.0;
        let s = sampled(|t| 10.0 * (w * t).sin(), 12);
        let stats = MotionStatistics::from_samples(&s).unwrap();
        assert!(stats.acceleration > 2000.0, "{:?}", stats);
        assert_eq!(AdaptiveSelector::default().choose(&stats), PredictionAlgorithm::Regression);
    }

    #[test]
    fn test_gentle_wobble_is_polynomial() {
        let w = 2.0 * std::f32::consts::PI * 3.0;
        let s = sampled(|t| (w * t).sin(), 12);
        let stats = MotionStatistics::from_samples(&s).unwrap();
        assert!(stats.jerk > 1000.0 && stats.acceleration < 2000.0, "{:?}", stats);
        assert_eq!(AdaptiveSelector::default().choose(&stats), PredictionAlgorithm::Polynomial);
    }

    #[test]
    fn test_too_few_samples() {
        let s = sampled(|t| t, 3);
        assert_eq!(AdaptiveSelector::default().select(&s), None);
    }
}
