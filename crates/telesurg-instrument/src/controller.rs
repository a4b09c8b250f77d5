//! Per-arm instrument controller
//!
//! The controller exclusively owns its [`InstrumentState`]; everybody else gets
//! copies through [`InstrumentController::state`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use telesurg_core::{
    CalibrationData, HapticFeedback, InstrumentConfig, InstrumentId, InstrumentState,
    KinematicParameters, ProximityAlerts, Quaternion, SlaveCommand, TeleopError, TeleopResult,
    TissueType, Timestamp, Vec3,
};

use crate::{
    channels_for, pose_targets, ActuatorBackend, DofChannel, SimulatedArm, TissueThresholds,
    DOF_JAW, DOF_ROLL, DOF_X, STANDARD_DOF,
};

const MAX_STEP_TICKS: u32 = 10;

/// Controller settings shared by all arms of a session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Absolute per-axis workspace bound, mm
    pub workspace_bound_mm: f32,
    /// Step used when two commands carry the same timestamp
    pub tick_period: Duration,
    pub tissue: TissueThresholds,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            workspace_bound_mm: 150.0,
            tick_period: Duration::from_millis(1),
            tissue: TissueThresholds::default(),
        }
    }
}

/// One instrument: DOF channels, backend and calibration
pub struct InstrumentController<A: ActuatorBackend = SimulatedArm> {
    config: InstrumentConfig,
    settings: ControllerSettings,
    backend: A,
    channels: Vec<DofChannel>,
    state: InstrumentState,
    calibration: Option<CalibrationData>,
    tissue: Option<TissueType>,
    stopped: bool,
}

impl InstrumentController<SimulatedArm> {
    /// Controller over a simulated arm
    pub fn simulated(config: InstrumentConfig, settings: ControllerSettings) -> TeleopResult<Self> {
        let arm = SimulatedArm::new(&config);
        Self::new(config, settings, arm)
    }
}

impl<A: ActuatorBackend> InstrumentController<A> {
    pub fn new(config: InstrumentConfig, settings: ControllerSettings, mut backend: A) -> TeleopResult<Self> {
        if config.dof < STANDARD_DOF {
            return Err(TeleopError::InvalidConfig(format!(
                "{} has {} DOF, need at least {}",
                config.id, config.dof, STANDARD_DOF
            )));
        }
        if backend.dof_count() != config.dof {
            return Err(TeleopError::InvalidConfig(format!(
                "{} backend drives {} DOF, configured {}",
                config.id,
                backend.dof_count(),
                config.dof
            )));
        }

        let mut channels = channels_for(&config);
        let home = home_targets(&config);
        backend.home(&home);
        for (ch, target) in channels.iter_mut().zip(home.iter()) {
            ch.reset(*target);
        }

        let state = InstrumentState::at_rest(config.id, config.home_position, Timestamp::ZERO);

        Ok(InstrumentController {
            config,
            settings,
            backend,
            channels,
            state,
            calibration: None,
            tissue: None,
            stopped: false,
        })
    }

    #[inline]
    pub fn id(&self) -> InstrumentId {
        self.config.id
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Snapshot of the current state
    #[inline]
    pub fn state(&self) -> InstrumentState {
        self.state
    }

    pub fn calibration(&self) -> Option<&CalibrationData> {
        self.calibration.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Last tissue classification
    pub fn tissue(&self) -> Option<TissueType> {
        self.tissue
    }

    pub fn backend(&self) -> &A {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut A {
        &mut self.backend
    }

    /// Range-of-motion test on every DOF
    ///
    /// Any failing DOF fails the whole calibration and leaves the instrument
    /// uncalibrated.
    pub fn calibrate(&mut self, now: Timestamp) -> TeleopResult<CalibrationData> {
        if self.stopped {
            return Err(TeleopError::InstrumentStopped(self.id()));
        }
        self.calibration = None;

        let id = self.id();
        let home = home_targets(&self.config);
        self.backend.home(&home);

        let mut range_of_motion = Vec::with_capacity(self.channels.len());
        let mut accuracy = 0.0f32;
        for dof in 0..self.channels.len() {
            let probe = self.backend.probe_range(dof).map_err(|e| {
                let reason = match e {
                    TeleopError::InstrumentFault { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(instrument = %id, dof, %reason, "range test failed");
                TeleopError::CalibrationFailed {
                    instrument: id,
                    dof,
                    reason,
                }
            })?;
            range_of_motion.push((probe.min, probe.max));
            accuracy = accuracy.max(probe.tracking_error);
        }

        self.backend.home(&home);
        let joint_offsets = home
            .iter()
            .enumerate()
            .map(|(i, h)| self.backend.position(i) - h)
            .collect();
        for (ch, target) in self.channels.iter_mut().zip(home.iter()) {
            ch.reset(*target);
        }

        let data = CalibrationData {
            tool_center_point: self.config.home_position,
            kinematic_parameters: KinematicParameters {
                range_of_motion,
                joint_offsets,
            },
            last_calibration: now,
            accuracy,
        };

        self.state = InstrumentState::at_rest(id, self.config.home_position, now.max(self.state.timestamp));
        self.calibration = Some(data.clone());
        info!(instrument = %id, accuracy, "instrument calibrated");
        Ok(data)
    }

    /// Run one control step toward `command`
    pub fn execute(&mut self, command: &SlaveCommand, now: Timestamp) -> TeleopResult<InstrumentState> {
        let id = self.id();
        if self.stopped {
            return Err(TeleopError::InstrumentStopped(id));
        }
        if self.calibration.is_none() {
            return Err(TeleopError::NotCalibrated { instrument: id });
        }
        if command.instrument_id != id {
            return Err(TeleopError::UnknownInstrument(command.instrument_id));
        }

        // Long gaps (first step after calibration) count as a few ticks
        let elapsed = now.since(self.state.timestamp);
        let dt = if elapsed.is_zero() {
            self.settings.tick_period
        } else {
            elapsed.min(self.settings.tick_period * MAX_STEP_TICKS)
        }
        .as_secs_f32();

        let pose = pose_targets(command.position, command.orientation);
        for (ch, target) in self.channels.iter_mut().zip(pose.iter()) {
            ch.set_target(*target);
        }
        self.channels[DOF_JAW].set_target(command.jaw_angle);

        // Commanded velocity feeds the linear axes forward
        let feedforward = command.velocity.to_array();
        let mut fault = None;
        for ch in self.channels.iter_mut() {
            let measured = self.backend.position(ch.index);
            let ff = ch.index.checked_sub(DOF_X).and_then(|axis| feedforward.get(axis)).copied().unwrap_or(0.0);
            let v = ch.step_with_feedforward(measured, ff, dt);
            if let Err(e) = self.backend.drive(ch.index, v, dt) {
                fault = Some(e);
                break;
            }
        }
        if let Some(e) = fault {
            error!(instrument = %id, error = %e, "actuator fault, stopping arm");
            self.emergency_stop();
            return Err(e);
        }

        self.refresh_state(now);
        Ok(self.state)
    }

    fn refresh_state(&mut self, now: Timestamp) {
        let b = &self.backend;

        let tip_position = Vec3::new(b.position(DOF_X), b.position(DOF_X + 1), b.position(DOF_X + 2));
        let orientation = Quaternion::from_euler(
            b.position(DOF_ROLL),
            b.position(DOF_ROLL + 1),
            b.position(DOF_ROLL + 2),
        );
        let linear_velocity = Vec3::new(b.velocity(DOF_X), b.velocity(DOF_X + 1), b.velocity(DOF_X + 2));
        // Euler rates, close enough to body rates near the working pose
        let angular_velocity =
            Vec3::new(b.velocity(DOF_ROLL), b.velocity(DOF_ROLL + 1), b.velocity(DOF_ROLL + 2));

        let forces = b.jaw_forces();
        let grasp_force = if forces.is_empty() {
            None
        } else {
            Some(forces.iter().sum::<f32>() / forces.len() as f32)
        };

        let tissue = self.settings.tissue.classify(b.tip_force().norm());
        if tissue != self.tissue {
            debug!(instrument = %self.config.id, ?tissue, "tissue contact changed");
            self.tissue = tissue;
        }

        let bound = self.settings.workspace_bound_mm;
        let mut safety_status = self.state.safety_status;
        safety_status.in_workspace = tip_position.max_abs() <= bound;
        safety_status.force_limit = grasp_force.map_or(false, |f| f >= self.config.max_grasp_force_n);

        self.state = InstrumentState {
            instrument_id: self.config.id,
            timestamp: now.max(self.state.timestamp),
            tip_position,
            orientation,
            jaw_angle: Some(b.position(DOF_JAW)),
            grasp_force,
            linear_velocity: Some(linear_velocity),
            angular_velocity: Some(angular_velocity),
            safety_status,
        };
    }

    /// Record the collision assessment made for this tick
    pub fn apply_safety_assessment(&mut self, collision_risk: f32, alerts: ProximityAlerts) {
        self.state.safety_status.collision_risk = collision_risk.clamp(0.0, 1.0);
        self.state.safety_status.proximity_alerts = alerts;
    }

    /// Force feedback from the last step
    pub fn haptic_feedback(&self) -> HapticFeedback {
        HapticFeedback {
            instrument_id: self.config.id,
            timestamp: self.state.timestamp,
            force: self.backend.tip_force(),
            torque: self.backend.tip_torque(),
            grip_force: self.state.grasp_force.unwrap_or(0.0),
            tissue: self.tissue,
        }
    }

    /// Stop this arm where it is and release the jaw
    ///
    /// Idempotent; the arm stays latched until [`reset`](Self::reset).
    pub fn emergency_stop(&mut self) {
        self.backend.stop();
        for ch in self.channels.iter_mut() {
            let here = self.backend.position(ch.index);
            ch.reset(here);
        }

        self.state.linear_velocity = Some(Vec3::ZERO);
        self.state.angular_velocity = Some(Vec3::ZERO);
        self.state.grasp_force = Some(0.0);
        self.state.safety_status.force_limit = false;

        if !self.stopped {
            self.stopped = true;
            warn!(instrument = %self.config.id, "instrument emergency stopped");
        }
    }

    /// Clear the stop latch; the instrument must be recalibrated
    pub fn reset(&mut self) {
        self.stopped = false;
        self.calibration = None;
        self.tissue = None;
        for ch in self.channels.iter_mut() {
            let here = self.backend.position(ch.index);
            ch.reset(here);
        }
        info!(instrument = %self.config.id, "instrument reset");
    }
}

fn home_targets(config: &InstrumentConfig) -> Vec<f32> {
    let mut home = vec![0.0; config.dof];
    home[0] = config.home_position.x;
    home[1] = config.home_position.y;
    home[2] = config.home_position.z;
    home
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesurg_core::{ButtonStates, InstrumentType};

    fn controller() -> InstrumentController {
        let config = InstrumentConfig::new(1, InstrumentType::Grasper, Vec3::new(10.0, 0.0, 0.0));
        let mut c = InstrumentController::simulated(config, ControllerSettings::default()).unwrap();
        c.calibrate(Timestamp::ZERO).unwrap();
        c
    }

    fn command(c: &InstrumentController, position: Vec3, jaw: f32) -> SlaveCommand {
        SlaveCommand {
            instrument_id: c.id(),
            position,
            orientation: Quaternion::IDENTITY,
            jaw_angle: jaw,
            velocity: Vec3::ZERO,
            buttons: ButtonStates::NONE,
        }
    }

    #[test]
    fn test_requires_calibration() {
        let config = InstrumentConfig::new(1, InstrumentType::Grasper, Vec3::ZERO);
        let mut c = InstrumentController::simulated(config, ControllerSettings::default()).unwrap();
        let cmd = command(&c, Vec3::ZERO, 0.0);
        assert_eq!(
            c.execute(&cmd, Timestamp::from_millis(1)),
            Err(TeleopError::NotCalibrated {
                instrument: InstrumentId::new(1)
            })
        );
    }

    #[test]
    fn test_calibration_records_ranges() {
        let c = controller();
        let data = c.calibration().unwrap();
        assert_eq!(data.kinematic_parameters.range_of_motion.len(), 7);
        assert_eq!(data.kinematic_parameters.range_of_motion[DOF_JAW], (0.0, 75.0));
        assert_eq!(data.tool_center_point, Vec3::new(10.0, 0.0, 0.0));
        assert!(data.accuracy > 0.0);
    }

    #[test]
    fn test_calibration_names_failing_dof() {
        let config = InstrumentConfig::new(3, InstrumentType::Scissors, Vec3::ZERO);
        let mut c = InstrumentController::simulated(config, ControllerSettings::default()).unwrap();
        c.backend_mut().fail_range_test(4);

        match c.calibrate(Timestamp::ZERO) {
            Err(TeleopError::CalibrationFailed { instrument, dof, .. }) => {
                assert_eq!(instrument, InstrumentId::new(3));
                assert_eq!(dof, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!c.is_calibrated());
    }

    #[test]
    fn test_execute_tracks_target() {
        let mut c = controller();
        let target = Vec3::new(12.0, 0.0, 0.0);
        let mut now = Timestamp::ZERO;
        for _ in 0..2000 {
            now = now + Duration::from_millis(1);
            c.execute(&command(&c, target, 30.0), now).unwrap();
        }
        let state = c.state();
        assert!(state.tip_position.distance(target) < 0.1, "at {:?}", state.tip_position);
        assert!((state.jaw_angle.unwrap() - 30.0).abs() < 0.5);
        assert_eq!(state.timestamp, now);
        assert!(state.is_valid());
    }

    #[test]
    fn test_velocity_feedforward() {
        let mut c = controller();
        let velocity = Vec3::new(50.0, 0.0, 0.0);
        let mut now = Timestamp::ZERO;
        for _ in 0..300 {
            now = now + Duration::from_millis(1);
            let here = c.state().tip_position;
            let mut cmd = command(&c, here + velocity * 0.001, 0.0);
            cmd.velocity = velocity;
            c.execute(&cmd, now).unwrap();
        }
        // feedforward plus a small proportional term
        let vx = c.state().linear_velocity.unwrap().x;
        assert!(vx > 50.0 && vx < 54.0, "vx {}", vx);
    }

    #[test]
    fn test_grasp_force_is_sensor_mean() {
        let mut c = controller();
        c.backend_mut().set_jaw_load(4.0, 8.0);
        let state = c.execute(&command(&c, Vec3::new(10.0, 0.0, 0.0), 0.0), Timestamp::from_millis(1)).unwrap();
        assert_eq!(state.grasp_force, Some(6.0));
        assert!(!state.safety_status.force_limit);

        c.backend_mut().set_jaw_load(11.0, 11.0);
        let state = c.execute(&command(&c, Vec3::new(10.0, 0.0, 0.0), 0.0), Timestamp::from_millis(2)).unwrap();
        assert!(state.safety_status.force_limit);
    }

    #[test]
    fn test_tissue_feedback() {
        let mut c = controller();
        c.backend_mut().set_tip_contact(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO);
        c.execute(&command(&c, Vec3::new(10.0, 0.0, 0.0), 0.0), Timestamp::from_millis(1)).unwrap();
        let feedback = c.haptic_feedback();
        assert_eq!(feedback.tissue, Some(TissueType::Vessel));
        assert_eq!(feedback.force, Vec3::new(0.0, 0.0, 3.0));
    }

    #[test]
    fn test_emergency_stop_idempotent() {
        let mut c = controller();
        c.backend_mut().set_jaw_load(5.0, 5.0);
        c.execute(&command(&c, Vec3::new(20.0, 0.0, 0.0), 10.0), Timestamp::from_millis(1)).unwrap();

        c.emergency_stop();
        let once = c.state();
        c.emergency_stop();
        assert_eq!(c.state(), once);
        assert!(c.is_stopped());
        assert_eq!(once.grasp_force, Some(0.0));
        assert_eq!(once.linear_velocity, Some(Vec3::ZERO));

        let cmd = command(&c, Vec3::ZERO, 0.0);
        assert_eq!(
            c.execute(&cmd, Timestamp::from_millis(2)),
            Err(TeleopError::InstrumentStopped(InstrumentId::new(1)))
        );
    }

    #[test]
    fn test_fault_latches_stop() {
        let mut c = controller();
        c.backend_mut().inject_fault("motor overcurrent");
        let cmd = command(&c, Vec3::ZERO, 0.0);
        assert!(matches!(
            c.execute(&cmd, Timestamp::from_millis(1)),
            Err(TeleopError::InstrumentFault { .. })
        ));
        assert!(c.is_stopped());

        c.backend_mut().clear_faults();
        c.reset();
        assert!(!c.is_calibrated());
        c.calibrate(Timestamp::from_millis(5)).unwrap();
        assert!(c.execute(&cmd, Timestamp::from_millis(6)).is_ok());
    }

    #[test]
    fn test_rejects_short_dof() {
        let mut config = InstrumentConfig::new(0, InstrumentType::Grasper, Vec3::ZERO);
        config.dof = 5;
        assert!(InstrumentController::simulated(config, ControllerSettings::default()).is_err());
    }
}
