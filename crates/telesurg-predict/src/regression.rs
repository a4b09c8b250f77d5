//! Regression prediction over a sliding window of motion deltas
//!
//! The window of the last `WINDOW` positions becomes `WINDOW - 1` per-step
//! deltas. A linear map (shared across axes) turns them into the expected next
//! delta, which is scaled to the requested lead time. The map starts as a
//! recency-weighted average and can be fitted to recorded trajectories.

use telesurg_core::{InstrumentState, PredictionAlgorithm, TeleopError, TeleopResult, Vec3};

use crate::linalg::least_squares;
use crate::{collect_samples, mean_interval, MotionPredictor, Sample};

/// Positions per window
pub const WINDOW: usize = 8;

const FEATURES: usize = WINDOW - 1;

#[derive(Debug, Clone)]
pub struct RegressionPredictor {
    /// Delta weights, oldest first
    weights: [f32; FEATURES],
    bias: f32,
    samples: Vec<Sample>,
}

impl RegressionPredictor {
    pub fn new() -> Self {
        let total: f32 = (1..=FEATURES).map(|k| k as f32).sum();
        let mut weights = [0.0; FEATURES];
        for (k, w) in weights.iter_mut().enumerate() {
            *w = (k + 1) as f32 / total;
        }
        RegressionPredictor {
            weights,
            bias: 0.0,
            samples: Vec::with_capacity(WINDOW),
        }
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Fit the delta map to uniformly sampled trajectories
    ///
    /// Returns the number of training rows used.
    pub fn fit(&mut self, trajectories: &[&[Vec3]]) -> TeleopResult<usize> {
        let mut rows = Vec::new();
        let mut targets = Vec::new();

        for trajectory in trajectories {
            if trajectory.len() < WINDOW + 1 {
                continue;
            }
            let deltas: Vec<Vec3> = trajectory.windows(2).map(|p| p[1] - p[0]).collect();
            for window in deltas.windows(FEATURES + 1) {
                for axis in 0..3 {
                    let mut row: Vec<f64> = window[..FEATURES].iter().map(|d| d.axis(axis) as f64).collect();
                    row.push(1.0);
                    rows.push(row);
                    targets.push(window[FEATURES].axis(axis) as f64);
                }
            }
        }

        if rows.len() < FEATURES + 1 {
            return Err(TeleopError::InvalidConfig(format!(
                "regression fit needs at least {} rows, got {}",
                FEATURES + 1,
                rows.len()
            )));
        }

        let solution = least_squares(&rows, &targets, 1e-6)
            .ok_or_else(|| TeleopError::InvalidConfig("regression fit is singular".into()))?;

        for (w, s) in self.weights.iter_mut().zip(&solution) {
            *w = *s as f32;
        }
        self.bias = solution[FEATURES] as f32;
        Ok(rows.len())
    }

    fn next_delta(&self, deltas: &[Vec3]) -> Vec3 {
        if deltas.len() < FEATURES {
            // Short history: plain mean
            let sum = deltas.iter().fold(Vec3::ZERO, |acc, d| acc + *d);
            return sum / deltas.len().max(1) as f32;
        }
        let mut out = Vec3::new(self.bias, self.bias, self.bias);
        for (d, w) in deltas.iter().zip(&self.weights) {
            out += *d * *w;
        }
        out
    }
}

impl Default for RegressionPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionPredictor for RegressionPredictor {
    fn algorithm(&self) -> PredictionAlgorithm {
        PredictionAlgorithm::Regression
    }

    fn predict_position(&mut self, current: &InstrumentState, history: &[InstrumentState], lead_s: f32) -> Vec3 {
        collect_samples(current, history, WINDOW, &mut self.samples);
        let Some(step) = mean_interval(&self.samples) else {
            return current.tip_position;
        };

        let mut deltas = [Vec3::ZERO; FEATURES];
        let n = self.samples.len() - 1;
        for (i, pair) in self.samples.windows(2).enumerate() {
            deltas[i] = pair[1].1 - pair[0].1;
        }

        let per_step = self.next_delta(&deltas[..n]);
        current.tip_position + per_step * (lead_s / step)
    }
}
