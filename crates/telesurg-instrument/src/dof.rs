//! Degree-of-freedom channels
//!
//! Standard layout of a 7-DOF instrument:
//! - 0..3: tip x, y, z (mm)
//! - 3..6: roll, pitch, yaw (rad)
//! - 6: jaw opening (deg)
//!
//! Any further DOFs are auxiliary joints held at zero.

use std::f32::consts::{FRAC_PI_2, PI};

use serde::{Deserialize, Serialize};

use telesurg_core::{InstrumentConfig, Quaternion, Vec3};

use crate::{PidController, PidGains};

pub const DOF_X: usize = 0;
pub const DOF_ROLL: usize = 3;
pub const DOF_JAW: usize = 6;

/// DOFs every instrument must have
pub const STANDARD_DOF: usize = 7;

/// Linear travel either side of zero, mm
pub const LINEAR_TRAVEL_MM: f32 = 250.0;

/// Actuation type of a DOF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DofKind {
    Linear,
    Rotary,
    Jaw,
}

/// Per-DOF kinematic limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DofLimits {
    pub max_velocity: f32,
    pub max_acceleration: f32,
    pub min_position: f32,
    pub max_position: f32,
}

impl DofLimits {
    /// 200 mm/s, 1000 mm/s²
    pub fn linear() -> Self {
        DofLimits {
            max_velocity: 200.0,
            max_acceleration: 1000.0,
            min_position: -LINEAR_TRAVEL_MM,
            max_position: LINEAR_TRAVEL_MM,
        }
    }

    /// π rad/s over ±`range` rad
    pub fn rotary(range: f32) -> Self {
        DofLimits {
            max_velocity: PI,
            max_acceleration: 4.0 * PI,
            min_position: -range,
            max_position: range,
        }
    }

    pub fn jaw(max_angle_deg: f32) -> Self {
        DofLimits {
            max_velocity: 360.0,
            max_acceleration: 3600.0,
            min_position: 0.0,
            max_position: max_angle_deg,
        }
    }

    #[inline]
    pub fn clamp_position(&self, p: f32) -> f32 {
        p.clamp(self.min_position, self.max_position)
    }
}

/// One PID-controlled axis
#[derive(Debug, Clone)]
pub struct DofChannel {
    pub index: usize,
    pub kind: DofKind,
    pub limits: DofLimits,
    pub target: f32,
    pid: PidController,
}

impl DofChannel {
    pub fn new(index: usize, kind: DofKind, limits: DofLimits) -> Self {
        let gains = match kind {
            DofKind::Jaw => PidGains::jaw(),
            _ => PidGains::default(),
        };
        DofChannel {
            index,
            kind,
            limits,
            target: 0.0,
            pid: PidController::new(gains),
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = self.limits.clamp_position(target);
    }

    /// Velocity request toward the target, limited to the DOF max
    pub fn step(&mut self, measured: f32, dt: f32) -> f32 {
        self.step_with_feedforward(measured, 0.0, dt)
    }

    /// PID correction on top of a commanded velocity
    pub fn step_with_feedforward(&mut self, measured: f32, feedforward: f32, dt: f32) -> f32 {
        let v = feedforward + self.pid.step(self.target, measured, dt);
        v.clamp(-self.limits.max_velocity, self.limits.max_velocity)
    }

    pub fn reset(&mut self, target: f32) {
        self.target = self.limits.clamp_position(target);
        self.pid.reset();
    }
}

/// Build the channel set for an instrument
pub fn channels_for(config: &InstrumentConfig) -> Vec<DofChannel> {
    let deflection = if config.articulation.wristed {
        config.articulation.max_deflection_deg.to_radians().min(FRAC_PI_2)
    } else {
        0.0
    };

    (0..config.dof)
        .map(|i| match i {
            0..=2 => DofChannel::new(i, DofKind::Linear, DofLimits::linear()),
            3 => DofChannel::new(i, DofKind::Rotary, DofLimits::rotary(PI)),
            4 | 5 => DofChannel::new(i, DofKind::Rotary, DofLimits::rotary(deflection)),
            6 => DofChannel::new(
                i,
                DofKind::Jaw,
                DofLimits::jaw(config.instrument_type.max_jaw_angle_deg()),
            ),
            _ => DofChannel::new(i, DofKind::Rotary, DofLimits::rotary(PI)),
        })
        .collect()
}

/// Joint targets for a tip pose
pub fn pose_targets(position: Vec3, orientation: Quaternion) -> [f32; 6] {
    let (roll, pitch, yaw) = orientation.to_euler();
    [position.x, position.y, position.z, roll, pitch, yaw]
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesurg_core::InstrumentType;

    #[test]
    fn test_standard_layout() {
        let config = InstrumentConfig::new(0, InstrumentType::NeedleDriver, Vec3::ZERO);
        let channels = channels_for(&config);
        assert_eq!(channels.len(), STANDARD_DOF);
        assert_eq!(channels[DOF_X].kind, DofKind::Linear);
        assert_eq!(channels[DOF_ROLL].kind, DofKind::Rotary);
        assert_eq!(channels[DOF_JAW].kind, DofKind::Jaw);
        assert_eq!(channels[DOF_JAW].limits.max_position, 45.0);
        assert_eq!(channels[DOF_X].limits.max_velocity, 200.0);
        assert_eq!(channels[DOF_X].limits.max_acceleration, 1000.0);
        assert_eq!(channels[DOF_ROLL].limits.max_velocity, PI);
    }

    #[test]
    fn test_target_clamped_to_travel() {
        let mut ch = DofChannel::new(6, DofKind::Jaw, DofLimits::jaw(75.0));
        ch.set_target(120.0);
        assert_eq!(ch.target, 75.0);
        ch.set_target(-3.0);
        assert_eq!(ch.target, 0.0);
    }

    #[test]
    fn test_step_respects_max_velocity() {
        let mut ch = DofChannel::new(0, DofKind::Linear, DofLimits::linear());
        ch.set_target(200.0);
        let v = ch.step(0.0, 0.001);
        assert_eq!(v, 200.0);
    }

    #[test]
    fn test_unwristed_has_no_deflection() {
        let mut config = InstrumentConfig::new(0, InstrumentType::Scissors, Vec3::ZERO);
        config.articulation.wristed = false;
        let channels = channels_for(&config);
        assert_eq!(channels[4].limits.max_position, 0.0);
        assert_eq!(channels[5].limits.min_position, 0.0);
    }
}
