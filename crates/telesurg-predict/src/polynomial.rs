//! Polynomial extrapolation
//!
//! Per axis, a least-squares polynomial of degree <= 3 over the last
//! `degree + 1` samples (indexed 0..=degree), evaluated at the extrapolated
//! index `degree + lead / mean_interval`.

use telesurg_core::{InstrumentState, PredictionAlgorithm, Vec3};

use crate::linalg::least_squares;
use crate::{collect_samples, mean_interval, MotionPredictor, Sample};

pub const MAX_DEGREE: usize = 3;

#[derive(Debug, Clone)]
pub struct PolynomialPredictor {
    degree: usize,
    samples: Vec<Sample>,
}

impl PolynomialPredictor {
    /// Degree is clamped to 1..=3
    pub fn new(degree: usize) -> Self {
        let degree = degree.clamp(1, MAX_DEGREE);
        PolynomialPredictor {
            degree,
            samples: Vec::with_capacity(degree + 1),
        }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Coefficients (constant first) through `values` at indices 0..n
    fn fit_axis(values: &[f64], degree: usize) -> Option<Vec<f64>> {
        let rows: Vec<Vec<f64>> = (0..values.len())
            .map(|i| (0..=degree).map(|p| (i as f64).powi(p as i32)).collect())
            .collect();
        least_squares(&rows, values, 0.0)
    }
}

impl Default for PolynomialPredictor {
    fn default() -> Self {
        Self::new(2)
    }
}

impl MotionPredictor for PolynomialPredictor {
    fn algorithm(&self) -> PredictionAlgorithm {
        PredictionAlgorithm::Polynomial
    }

    fn predict_position(&mut self, current: &InstrumentState, history: &[InstrumentState], lead_s: f32) -> Vec3 {
        collect_samples(current, history, self.degree + 1, &mut self.samples);
        let Some(step) = mean_interval(&self.samples) else {
            return current.tip_position;
        };

        let n = self.samples.len();
        let degree = self.degree.min(n - 1);
        let at = (n - 1) as f64 + (lead_s / step) as f64;

        let mut out = current.tip_position;
        for axis in 0..3 {
            let values: Vec<f64> = self.samples.iter().map(|(_, p)| p.axis(axis) as f64).collect();
            let Some(coeffs) = Self::fit_axis(&values, degree) else {
                return current.tip_position;
            };
            let value: f64 = coeffs.iter().enumerate().map(|(p, c)| c * at.powi(p as i32)).sum();
            out.set_axis(axis, value as f32);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesurg_core::{InstrumentId, Timestamp};

    fn states(f: impl Fn(f32) -> f32, count: u64) -> Vec<InstrumentState> {
        (0..count)
            .map(|i| {
                InstrumentState::at_rest(InstrumentId::new(0), Vec3::new(f(i as f32), 0.0, 1.0), Timestamp::from_millis(i))
            })
            .collect()
    }

    #[test]
    fn test_quadratic_is_exact() {
        let history = states(|i| 0.5 * i * i, 10);
        let current = history[9];
        let mut p = PolynomialPredictor::new(2);
        // 3 steps ahead of index 9
        let out = p.predict_position(&current, &history, 0.003);
        assert!((out.x - 0.5 * 144.0).abs() < 1e-2, "got {}", out.x);
        assert!((out.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cubic() {
        let history = states(|i| 0.01 * i * i * i - i, 8);
        let current = history[7];
        let mut p = PolynomialPredictor::new(3);
        let out = p.predict_position(&current, &history, 0.002);
        let expected = 0.01 * 729.0 - 9.0;
        assert!((out.x - expected).abs() < 1e-2, "got {} want {}", out.x, expected);
    }

    #[test]
    fn test_degree_reduced_for_short_history() {
        let history = states(|i| 2.0 * i, 2);
        let mut p = PolynomialPredictor::new(3);
        let out = p.predict_position(&history[1], &history, 0.001);
        assert!((out.x - 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_degree_clamped() {
        assert_eq!(PolynomialPredictor::new(0).degree(), 1);
        assert_eq!(PolynomialPredictor::new(9).degree(), MAX_DEGREE);
    }
}
