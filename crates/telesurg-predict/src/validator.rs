//! Prediction validation

use std::fmt;

use serde::{Deserialize, Serialize};

use telesurg_core::InstrumentState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorLimits {
    /// Largest accepted move away from the current position, mm
    pub max_displacement_mm: f32,
    /// Absolute per-axis workspace bound, mm
    pub workspace_bound_mm: f32,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        ValidatorLimits {
            max_displacement_mm: 50.0,
            workspace_bound_mm: 150.0,
        }
    }
}

/// Why a prediction was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    NonFinite,
    Displacement,
    OutsideWorkspace,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rejection::NonFinite => "non-finite",
            Rejection::Displacement => "displacement",
            Rejection::OutsideWorkspace => "outside-workspace",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PredictionValidator {
    limits: ValidatorLimits,
}

impl PredictionValidator {
    pub fn new(limits: ValidatorLimits) -> Self {
        PredictionValidator { limits }
    }

    pub fn limits(&self) -> &ValidatorLimits {
        &self.limits
    }

    pub fn check(&self, current: &InstrumentState, predicted: &InstrumentState) -> Result<(), Rejection> {
        let p = predicted.tip_position;
        if !p.is_finite() || !predicted.orientation.is_unit() {
            return Err(Rejection::NonFinite);
        }
        if p.distance(current.tip_position) > self.limits.max_displacement_mm {
            return Err(Rejection::Displacement);
        }
        if p.max_abs() > self.limits.workspace_bound_mm {
            return Err(Rejection::OutsideWorkspace);
        }
        Ok(())
    }

    /// `predicted` when valid, otherwise `current`
    pub fn validate(&self, current: &InstrumentState, predicted: InstrumentState) -> InstrumentState {
        match self.check(current, &predicted) {
            Ok(()) => predicted,
            Err(_) => *current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use telesurg_core::{InstrumentId, Timestamp, Vec3};

    fn at(x: f32) -> InstrumentState {
        InstrumentState::at_rest(InstrumentId::new(0), Vec3::new(x, 0.0, 0.0), Timestamp::ZERO)
    }

    #[test]
    fn test_accepts_small_moves() {
        let v = PredictionValidator::default();
        assert_eq!(v.check(&at(0.0), &at(49.0)), Ok(()));
    }

    #[test]
    fn test_rejects_large_jump() {
        let v = PredictionValidator::default();
        assert_eq!(v.check(&at(0.0), &at(51.0)), Err(Rejection::Displacement));
        assert_eq!(v.validate(&at(0.0), at(51.0)), at(0.0));
    }

    #[test]
    fn test_rejects_outside_workspace() {
        let v = PredictionValidator::default();
        assert_eq!(v.check(&at(140.0), &at(151.0)), Err(Rejection::OutsideWorkspace));
    }

    #[test]
    fn test_rejects_nan() {
        let v = PredictionValidator::default();
        assert_eq!(v.check(&at(0.0), &at(f32::NAN)), Err(Rejection::NonFinite));
    }

    proptest! {
        #[test]
        fn prop_validated_prediction_is_safe_to_send(
            current in -150.0f32..150.0,
            predicted in prop::num::f32::ANY,
        ) {
            let v = PredictionValidator::default();
            let out = v.validate(&at(current), at(predicted));
            let p = out.tip_position;
            prop_assert!(p.is_finite());
            prop_assert!(p.distance(at(current).tip_position) <= 50.0);
            prop_assert!(p.max_abs() <= 150.0);
        }
    }
}
