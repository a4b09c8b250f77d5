//! Actuator and sensor backends
//!
//! [`ActuatorBackend`] is what a hardware driver implements. [`SimulatedArm`]
//! is a kinematic stand-in with velocity and acceleration limits and fault
//! injection.

use telesurg_core::{InstrumentConfig, InstrumentId, TeleopError, TeleopResult, Vec3};

use crate::{channels_for, DofLimits};

/// Outcome of one range-of-motion test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeProbe {
    pub min: f32,
    pub max: f32,
    /// Worst tracking error seen while sweeping
    pub tracking_error: f32,
}

/// Motor and sensor access for one instrument
pub trait ActuatorBackend: Send {
    fn dof_count(&self) -> usize;

    /// Drive one DOF at `velocity` for `dt` seconds
    fn drive(&mut self, dof: usize, velocity: f32, dt: f32) -> TeleopResult<()>;

    fn position(&self, dof: usize) -> f32;

    fn velocity(&self, dof: usize) -> f32;

    /// Jaw force sensor readings, N
    fn jaw_forces(&self) -> &[f32];

    /// Tip contact force, N
    fn tip_force(&self) -> Vec3;

    /// Tip contact torque, N·mm
    fn tip_torque(&self) -> Vec3;

    /// Bounded sweep of one DOF
    fn probe_range(&mut self, dof: usize) -> TeleopResult<RangeProbe>;

    /// Move to `positions` at rest
    fn home(&mut self, positions: &[f32]);

    /// Zero every velocity and release jaw force
    fn stop(&mut self);
}

/// Simulated instrument
#[derive(Debug, Clone)]
pub struct SimulatedArm {
    id: InstrumentId,
    limits: Vec<DofLimits>,
    positions: Vec<f32>,
    velocities: Vec<f32>,
    jaw_forces: [f32; 2],
    tip_force: Vec3,
    tip_torque: Vec3,
    failing_dof: Option<usize>,
    drive_fault: Option<String>,
}

impl SimulatedArm {
    pub fn new(config: &InstrumentConfig) -> Self {
        let limits: Vec<DofLimits> = channels_for(config).iter().map(|c| c.limits).collect();
        let n = limits.len();
        SimulatedArm {
            id: config.id,
            limits,
            positions: vec![0.0; n],
            velocities: vec![0.0; n],
            jaw_forces: [0.0; 2],
            tip_force: Vec3::ZERO,
            tip_torque: Vec3::ZERO,
            failing_dof: None,
            drive_fault: None,
        }
    }

    /// The range test of `dof` fails
    pub fn fail_range_test(&mut self, dof: usize) {
        self.failing_dof = Some(dof);
    }

    /// Every drive call fails until cleared
    pub fn inject_fault(&mut self, reason: impl Into<String>) {
        self.drive_fault = Some(reason.into());
    }

    pub fn clear_faults(&mut self) {
        self.failing_dof = None;
        self.drive_fault = None;
    }

    /// Set the grasp load reported by both jaw sensors
    pub fn set_jaw_load(&mut self, left: f32, right: f32) {
        self.jaw_forces = [left, right];
    }

    pub fn set_tip_contact(&mut self, force: Vec3, torque: Vec3) {
        self.tip_force = force;
        self.tip_torque = torque;
    }
}

impl ActuatorBackend for SimulatedArm {
    fn dof_count(&self) -> usize {
        self.limits.len()
    }

    fn drive(&mut self, dof: usize, velocity: f32, dt: f32) -> TeleopResult<()> {
        if let Some(reason) = &self.drive_fault {
            return Err(TeleopError::InstrumentFault {
                instrument: self.id,
                reason: reason.clone(),
            });
        }
        let limits = self.limits.get(dof).copied().ok_or_else(|| TeleopError::InstrumentFault {
            instrument: self.id,
            reason: format!("no DOF {}", dof),
        })?;

        let requested = velocity.clamp(-limits.max_velocity, limits.max_velocity);
        let max_dv = limits.max_acceleration * dt;
        let prev = self.velocities[dof];
        let mut v = prev + (requested - prev).clamp(-max_dv, max_dv);

        let next = self.positions[dof] + v * dt;
        let clamped = limits.clamp_position(next);
        if clamped != next {
            // Hit the end stop
            v = 0.0;
        }
        self.positions[dof] = clamped;
        self.velocities[dof] = v;
        Ok(())
    }

    fn position(&self, dof: usize) -> f32 {
        self.positions.get(dof).copied().unwrap_or(0.0)
    }

    fn velocity(&self, dof: usize) -> f32 {
        self.velocities.get(dof).copied().unwrap_or(0.0)
    }

    fn jaw_forces(&self) -> &[f32] {
        &self.jaw_forces
    }

    fn tip_force(&self) -> Vec3 {
        self.tip_force
    }

    fn tip_torque(&self) -> Vec3 {
        self.tip_torque
    }

    fn probe_range(&mut self, dof: usize) -> TeleopResult<RangeProbe> {
        if self.failing_dof == Some(dof) {
            return Err(TeleopError::InstrumentFault {
                instrument: self.id,
                reason: "end stop not reached".into(),
            });
        }
        let limits = self.limits.get(dof).ok_or_else(|| TeleopError::InstrumentFault {
            instrument: self.id,
            reason: format!("no DOF {}", dof),
        })?;
        Ok(RangeProbe {
            min: limits.min_position,
            max: limits.max_position,
            tracking_error: (limits.max_position - limits.min_position).abs() * 1e-4,
        })
    }

    fn home(&mut self, positions: &[f32]) {
        for (i, limits) in self.limits.iter().enumerate() {
            self.positions[i] = limits.clamp_position(positions.get(i).copied().unwrap_or(0.0));
            self.velocities[i] = 0.0;
        }
    }

    fn stop(&mut self) {
        self.velocities.iter_mut().for_each(|v| *v = 0.0);
        self.jaw_forces = [0.0; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesurg_core::InstrumentType;

    fn arm() -> SimulatedArm {
        SimulatedArm::new(&InstrumentConfig::new(2, InstrumentType::Grasper, Vec3::ZERO))
    }

    #[test]
    fn test_acceleration_limited() {
        let mut arm = arm();
        arm.drive(0, 200.0, 0.001).unwrap();
        // 1000 mm/s² over 1 ms
        assert!((arm.velocity(0) - 1.0).abs() < 1e-4);
        assert!((arm.position(0) - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_velocity_limited() {
        let mut arm = arm();
        for _ in 0..1000 {
            arm.drive(0, 10_000.0, 0.001).unwrap();
        }
        assert!(arm.velocity(0) <= 200.0);
    }

    #[test]
    fn test_end_stop() {
        let mut arm = arm();
        arm.home(&[249.99, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        for _ in 0..100 {
            arm.drive(0, 200.0, 0.001).unwrap();
        }
        assert_eq!(arm.position(0), 250.0);
        assert_eq!(arm.velocity(0), 0.0);
    }

    #[test]
    fn test_injected_fault() {
        let mut arm = arm();
        arm.inject_fault("encoder lost");
        assert!(matches!(
            arm.drive(0, 1.0, 0.001),
            Err(TeleopError::InstrumentFault { .. })
        ));
        arm.clear_faults();
        assert!(arm.drive(0, 1.0, 0.001).is_ok());
    }

    #[test]
    fn test_stop_releases_jaw() {
        let mut arm = arm();
        arm.set_jaw_load(3.0, 4.0);
        arm.drive(1, 50.0, 0.001).unwrap();
        arm.stop();
        assert_eq!(arm.jaw_forces(), &[0.0, 0.0]);
        assert_eq!(arm.velocity(1), 0.0);
    }
}
