//! Linear prediction: per-axis Kalman smoothing plus weighted velocity

use serde::{Deserialize, Serialize};

use telesurg_core::{InstrumentState, PredictionAlgorithm, Timestamp, Vec3};

use crate::{collect_samples, MotionPredictor, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KalmanConfig {
    /// Position process noise per update, mm²
    pub process_noise: f32,
    /// Measurement noise, mm²
    pub measurement_noise: f32,
    /// Samples used for the velocity estimate
    pub velocity_window: usize,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        KalmanConfig {
            process_noise: 1.0,
            measurement_noise: 0.05,
            velocity_window: 5,
        }
    }
}

/// Scalar random-walk filter for one axis
#[derive(Debug, Clone, Copy)]
struct AxisFilter {
    estimate: f32,
    variance: f32,
}

impl AxisFilter {
    fn update(&mut self, measurement: f32, q: f32, r: f32) {
        self.variance += q;
        let gain = self.variance / (self.variance + r);
        self.estimate += gain * (measurement - self.estimate);
        self.variance *= 1.0 - gain;
    }
}

#[derive(Debug, Clone)]
pub struct KalmanPredictor {
    config: KalmanConfig,
    axes: Option<[AxisFilter; 3]>,
    last_update: Option<Timestamp>,
    samples: Vec<Sample>,
}

impl KalmanPredictor {
    pub fn new(config: KalmanConfig) -> Self {
        KalmanPredictor {
            config,
            axes: None,
            last_update: None,
            samples: Vec::with_capacity(config.velocity_window.max(2)),
        }
    }

    fn filter(&mut self, current: &InstrumentState) -> Vec3 {
        let z = current.tip_position;
        let (q, r) = (self.config.process_noise, self.config.measurement_noise);

        let axes = self.axes.get_or_insert_with(|| {
            [z.x, z.y, z.z].map(|estimate| AxisFilter { estimate, variance: r })
        });

        let fresh = self.last_update.map_or(true, |t| current.timestamp > t);
        if fresh {
            axes[0].update(z.x, q, r);
            axes[1].update(z.y, q, r);
            axes[2].update(z.z, q, r);
            self.last_update = Some(current.timestamp);
        }
        Vec3::new(axes[0].estimate, axes[1].estimate, axes[2].estimate)
    }

    /// Recency-weighted mean of finite-difference velocities
    fn velocity(&mut self, current: &InstrumentState, history: &[InstrumentState]) -> Vec3 {
        collect_samples(current, history, self.config.velocity_window.max(2), &mut self.samples);
        if self.samples.len() < 2 {
            return current.linear_velocity.unwrap_or(Vec3::ZERO);
        }

        let mut sum = Vec3::ZERO;
        let mut weight_sum = 0.0;
        for (i, pair) in self.samples.windows(2).enumerate() {
            let dt = pair[1].0 - pair[0].0;
            if dt <= 0.0 {
                continue;
            }
            let w = (i + 1) as f32;
            sum += (pair[1].1 - pair[0].1) * (w / dt);
            weight_sum += w;
        }
        if weight_sum > 0.0 {
            sum / weight_sum
        } else {
            Vec3::ZERO
        }
    }
}

impl Default for KalmanPredictor {
    fn default() -> Self {
        Self::new(KalmanConfig::default())
    }
}

impl MotionPredictor for KalmanPredictor {
    fn algorithm(&self) -> PredictionAlgorithm {
        PredictionAlgorithm::Linear
    }

    fn predict_position(&mut self, current: &InstrumentState, history: &[InstrumentState], lead_s: f32) -> Vec3 {
        let smoothed = self.filter(current);
        let velocity = self.velocity(current, history);
        smoothed + velocity * lead_s
    }

    fn reset(&mut self) {
        self.axes = None;
        self.last_update = None;
    }
}
