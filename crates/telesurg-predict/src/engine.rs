//! Prediction engine: strategy dispatch, validation and statistics

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use telesurg_core::{InstrumentState, PredictionAlgorithm, StreamingParameters};

use crate::{
    collect_samples, AdaptiveSelector, KalmanConfig, KalmanPredictor, MotionPredictor, PolynomialPredictor,
    PredictionValidator, RegressionPredictor, Rejection, Sample, SelectorThresholds, ValidatorLimits,
};

/// Samples the adaptive selector looks at
const SELECTOR_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub algorithm: PredictionAlgorithm,
    pub lead_time_ms: f32,
    pub polynomial_degree: usize,
    /// Integrate angular velocity over the lead time instead of holding
    /// orientation constant
    pub extrapolate_orientation: bool,
    pub kalman: KalmanConfig,
    pub validator: ValidatorLimits,
    pub selector: SelectorThresholds,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig {
            algorithm: PredictionAlgorithm::Adaptive,
            lead_time_ms: 20.0,
            polynomial_degree: 2,
            extrapolate_orientation: false,
            kalman: KalmanConfig::default(),
            validator: ValidatorLimits::default(),
            selector: SelectorThresholds::default(),
        }
    }
}

impl PredictionConfig {
    pub fn from_streaming(params: &StreamingParameters) -> Self {
        PredictionConfig {
            algorithm: params.prediction,
            lead_time_ms: params.lead_time_ms,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionStats {
    pub predictions: u64,
    pub accepted: u64,
    pub rejected_non_finite: u64,
    pub rejected_displacement: u64,
    pub rejected_workspace: u64,
    pub strategy_switches: u64,
    pub linear: u64,
    pub regression: u64,
    pub polynomial: u64,
}

impl PredictionStats {
    pub fn rejected(&self) -> u64 {
        self.rejected_non_finite + self.rejected_displacement + self.rejected_workspace
    }

    fn record_rejection(&mut self, reason: Rejection) {
        match reason {
            Rejection::NonFinite => self.rejected_non_finite += 1,
            Rejection::Displacement => self.rejected_displacement += 1,
            Rejection::OutsideWorkspace => self.rejected_workspace += 1,
        }
    }

    fn record_algorithm(&mut self, algorithm: PredictionAlgorithm) {
        match algorithm {
            PredictionAlgorithm::Linear => self.linear += 1,
            PredictionAlgorithm::Regression => self.regression += 1,
            PredictionAlgorithm::Polynomial => self.polynomial += 1,
            PredictionAlgorithm::Adaptive => {}
        }
    }
}

/// Per-instrument prediction engine
pub struct PredictionEngine {
    config: PredictionConfig,
    kalman: KalmanPredictor,
    regression: RegressionPredictor,
    polynomial: PolynomialPredictor,
    validator: PredictionValidator,
    selector: AdaptiveSelector,
    /// Strategy used for the last prediction
    active: PredictionAlgorithm,
    samples: Vec<Sample>,
    stats: PredictionStats,
}

impl PredictionEngine {
    pub fn new(config: PredictionConfig) -> Self {
        let active = match config.algorithm {
            PredictionAlgorithm::Adaptive => PredictionAlgorithm::Linear,
            fixed => fixed,
        };
        PredictionEngine {
            kalman: KalmanPredictor::new(config.kalman),
            regression: RegressionPredictor::new(),
            polynomial: PolynomialPredictor::new(config.polynomial_degree),
            validator: PredictionValidator::new(config.validator),
            selector: AdaptiveSelector::new(config.selector),
            active,
            samples: Vec::with_capacity(SELECTOR_WINDOW),
            stats: PredictionStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    pub fn active_algorithm(&self) -> PredictionAlgorithm {
        self.active
    }

    pub fn stats(&self) -> &PredictionStats {
        &self.stats
    }

    /// Regression strategy, e.g. to fit it to recorded motion
    pub fn regression_mut(&mut self) -> &mut RegressionPredictor {
        &mut self.regression
    }

    /// Predict with the configured lead time
    pub fn predict(&mut self, current: &InstrumentState, history: &[InstrumentState]) -> InstrumentState {
        self.predict_ahead(current, history, self.config.lead_time_ms)
    }

    /// Predict `lead_ms` ahead; falls back to `current` when the prediction is rejected
    pub fn predict_ahead(&mut self, current: &InstrumentState, history: &[InstrumentState], lead_ms: f32) -> InstrumentState {
        let algorithm = self.pick(current, history);
        self.stats.predictions += 1;
        self.stats.record_algorithm(algorithm);

        let strategy: &mut dyn MotionPredictor = match algorithm {
            PredictionAlgorithm::Regression => &mut self.regression,
            PredictionAlgorithm::Polynomial => &mut self.polynomial,
            PredictionAlgorithm::Linear | PredictionAlgorithm::Adaptive => &mut self.kalman,
        };
        let mut predicted = strategy.predict(current, history, lead_ms);

        if self.config.extrapolate_orientation {
            if let Some(w) = current.angular_velocity {
                predicted.orientation = current.orientation.integrate(w, lead_ms.max(0.0) / 1000.0);
            }
        }

        match self.validator.check(current, &predicted) {
            Ok(()) => {
                self.stats.accepted += 1;
                predicted
            }
            Err(reason) => {
                trace!(instrument = %current.instrument_id, %reason, "prediction rejected");
                self.stats.record_rejection(reason);
                *current
            }
        }
    }

    fn pick(&mut self, current: &InstrumentState, history: &[InstrumentState]) -> PredictionAlgorithm {
        if self.config.algorithm != PredictionAlgorithm::Adaptive {
            return self.config.algorithm;
        }

        collect_samples(current, history, SELECTOR_WINDOW, &mut self.samples);
        if let Some(choice) = self.selector.select(&self.samples) {
            if choice != self.active {
                debug!(instrument = %current.instrument_id, from = ?self.active, to = ?choice, "prediction strategy switched");
                self.stats.strategy_switches += 1;
                self.active = choice;
            }
        }
        self.active
    }

    pub fn reset(&mut self) {
        self.kalman.reset();
        self.polynomial.reset();
        self.regression.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesurg_core::{InstrumentId, Quaternion, Timestamp, Vec3};

    fn at(ms: u64, x: f32) -> InstrumentState {
        InstrumentState::at_rest(InstrumentId::new(0), Vec3::new(x, 0.0, 0.0), Timestamp::from_millis(ms))
    }

    fn engine(algorithm: PredictionAlgorithm) -> PredictionEngine {
        PredictionEngine::new(PredictionConfig {
            algorithm,
            ..Default::default()
        })
    }

    #[test]
    fn test_fixed_strategy() {
        let mut e = engine(PredictionAlgorithm::Polynomial);
        let history: Vec<_> = (0..10).map(|i| at(i, i as f32 * 0.1)).collect();
        let out = e.predict(&history[9], &history);
        assert!((out.tip_position.x - 2.9).abs() < 1e-2);
        assert_eq!(e.stats().polynomial, 1);
        assert_eq!(e.stats().accepted, 1);
    }

    #[test]
    fn test_rejection_falls_back_to_current() {
        let mut e = engine(PredictionAlgorithm::Linear);
        // 10 m/s: 200 mm in 20 ms
        let history: Vec<_> = (0..5).map(|i| at(i, i as f32 * 10.0)).collect();
        let current = history[4];
        let out = e.predict(&current, &history);
        assert_eq!(out, current);
        assert_eq!(e.stats().rejected_displacement, 1);
        assert_eq!(e.stats().rejected(), 1);
    }

    #[test]
    fn test_workspace_rejection() {
        let mut e = engine(PredictionAlgorithm::Linear);
        let history: Vec<_> = (0..5).map(|i| at(i, 148.0 + i as f32 * 0.5)).collect();
        let out = e.predict(&history[4], &history);
        assert_eq!(out, history[4]);
        assert_eq!(e.stats().rejected_workspace, 1);
    }

    #[test]
    fn test_adaptive_switches() {
        let mut e = engine(PredictionAlgorithm::Adaptive);
        assert_eq!(e.active_algorithm(), PredictionAlgorithm::Linear);

        let w = 2.0 * std::f32::consts::PI * 3.0;
        let history: Vec<_> = (0..16u64)
            .map(|i| at(i * 10, (w * i as f32 * 0.01).sin()))
            .collect();
        e.predict(&history[15], &history);
        assert_eq!(e.active_algorithm(), PredictionAlgorithm::Polynomial);
        assert_eq!(e.stats().strategy_switches, 1);
    }

    #[test]
    fn test_orientation_extrapolation_opt_in() {
        let mut s = at(0, 0.0);
        s.angular_velocity = Some(Vec3::new(0.0, 0.0, 1.0));

        let mut held = engine(PredictionAlgorithm::Linear);
        assert_eq!(held.predict(&s, &[]).orientation, Quaternion::IDENTITY);

        let mut e = PredictionEngine::new(PredictionConfig {
            algorithm: PredictionAlgorithm::Linear,
            extrapolate_orientation: true,
            lead_time_ms: 100.0,
            ..Default::default()
        });
        let out = e.predict(&s, &[]);
        // 1 rad/s for 100 ms
        assert!((out.orientation.angle_to(Quaternion::IDENTITY) - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_from_streaming() {
        let params = StreamingParameters::long_distance();
        let config = PredictionConfig::from_streaming(&params);
        assert_eq!(config.lead_time_ms, 80.0);
        assert_eq!(config.algorithm, PredictionAlgorithm::Adaptive);
    }
}
