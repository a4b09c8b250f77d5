//! Predictor interface and shared sample handling

use std::time::Duration;

use telesurg_core::{InstrumentState, PredictionAlgorithm, Vec3};

/// One position sample: seconds relative to the current state (<= 0)
pub type Sample = (f32, Vec3);

/// Forward prediction strategy
pub trait MotionPredictor: Send {
    fn algorithm(&self) -> PredictionAlgorithm;

    /// Tip position `lead_s` seconds after `current`
    ///
    /// `history` is oldest first and may end with `current` itself.
    fn predict_position(&mut self, current: &InstrumentState, history: &[InstrumentState], lead_s: f32) -> Vec3;

    /// Predicted state `lead_ms` after `current`; orientation is held
    fn predict(&mut self, current: &InstrumentState, history: &[InstrumentState], lead_ms: f32) -> InstrumentState {
        let lead_ms = lead_ms.max(0.0);
        let tip_position = self.predict_position(current, history, lead_ms / 1000.0);
        InstrumentState {
            tip_position,
            timestamp: current.timestamp + Duration::from_micros((lead_ms * 1000.0) as u64),
            ..*current
        }
    }

    fn reset(&mut self) {}
}

/// Up to `max` samples ending at `current`, oldest first, with strictly
/// increasing timestamps
pub fn collect_samples(current: &InstrumentState, history: &[InstrumentState], max: usize, out: &mut Vec<Sample>) {
    out.clear();
    if max == 0 {
        return;
    }
    out.push((0.0, current.tip_position));

    let mut newest = current.timestamp;
    for state in history.iter().rev() {
        if out.len() >= max {
            break;
        }
        if state.timestamp < newest && state.tip_position.is_finite() {
            let t = -(current.timestamp.since(state.timestamp).as_secs_f32());
            out.push((t, state.tip_position));
            newest = state.timestamp;
        }
    }
    out.reverse();
}

/// Mean spacing of the samples in seconds
pub fn mean_interval(samples: &[Sample]) -> Option<f32> {
    if samples.len() < 2 {
        return None;
    }
    let span = samples[samples.len() - 1].0 - samples[0].0;
    let dt = span / (samples.len() - 1) as f32;
    (dt > 0.0).then_some(dt)
}
