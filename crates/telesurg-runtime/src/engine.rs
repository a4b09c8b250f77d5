//! Teleoperation engine - one control tick
//!
//! The engine owns the console, every instrument controller and the safety
//! supervisor. [`TeleoperationEngine::tick`] is run once per control period by
//! the session; it never blocks and, once its buffers are warm, never
//! allocates.

use std::time::Duration;

use tracing::{debug, error, trace};

use telesurg_core::{
    AlertLevel, InstrumentId, InstrumentState, MasterConsole, MasterSample, Quaternion, SlaveCommand,
    TeleopError, TeleopResult, Timestamp, Vec3,
};
use telesurg_instrument::{ActuatorBackend, DofLimits, InstrumentController, SimulatedArm};
use telesurg_safety::SafetySupervisor;

use crate::{ControlEvent, SessionConfig};

/// 180° about the patient-frame z axis
pub const CONSOLE_TO_PATIENT: Quaternion = Quaternion::new(0.0, 0.0, 0.0, 1.0);

/// Master delta to slave delta, console frame
#[inline]
pub fn scale_delta(delta: Vec3, motion_scaling: f32) -> Vec3 {
    delta / motion_scaling
}

/// Console-frame vector into the patient frame
#[inline]
pub fn console_to_patient(v: Vec3) -> Vec3 {
    CONSOLE_TO_PATIENT.rotate(v)
}

/// Master rotation since `master_anchor`, applied to `slave_anchor` in the
/// patient frame
pub fn map_orientation(master: Quaternion, master_anchor: Quaternion, slave_anchor: Quaternion) -> Quaternion {
    let delta = master * master_anchor.conjugate();
    let patient_delta = CONSOLE_TO_PATIENT * delta * CONSOLE_TO_PATIENT.conjugate();
    (patient_delta * slave_anchor).normalized()
}

/// Gripper aperture (0..1) to jaw angle (degrees); closed inside the dead zone
pub fn gripper_to_jaw(gripper: f32, dead_zone: f32, max_angle: f32) -> f32 {
    if !gripper.is_finite() {
        return 0.0;
    }
    let g = gripper.clamp(0.0, 1.0);
    if g <= dead_zone {
        return 0.0;
    }
    (g - dead_zone) / (1.0 - dead_zone) * max_angle
}

/// Cap `v` to the speed from which the arm can stop within `distance` (mm)
/// decelerating at `decel` (mm/s²)
pub fn braking_limit(v: Vec3, distance: f32, decel: f32) -> Vec3 {
    let speed = v.norm();
    let cap = (2.0 * decel * distance.max(0.0)).sqrt();
    if speed > cap && speed > 0.0 {
        v * (cap / speed)
    } else {
        v
    }
}

/// Master and slave pose captured when a channel engages
#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    master: Vec3,
    master_orientation: Quaternion,
    slave: Vec3,
    slave_orientation: Quaternion,
}

struct Arm<A: ActuatorBackend> {
    channel: usize,
    controller: InstrumentController<A>,
    max_jaw_deg: f32,
    anchor: Option<Anchor>,
    last_sample: Option<Timestamp>,
}

impl<A: ActuatorBackend> Arm<A> {
    fn disengage(&mut self) {
        self.anchor = None;
        self.last_sample = None;
    }
}

/// Counters kept across ticks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks: u64,
    pub commands: u64,
    pub holds: u64,
    pub stale_samples: u64,
    pub console_errors: u64,
    pub instrument_faults: u64,
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Arms driven from a fresh sample
    pub commanded: usize,
    /// Arms held in place (no sample, stale sample or clutch)
    pub held: usize,
    /// Arms skipped because they are stopped
    pub skipped: usize,
    pub errors: usize,
    /// Some arm is closer to another than the minimum separation
    pub critical_proximity: bool,
}

pub struct TeleoperationEngine<C: MasterConsole, A: ActuatorBackend = SimulatedArm> {
    console: C,
    arms: Vec<Arm<A>>,
    safety: SafetySupervisor,
    motion_scaling: f32,
    dead_zone: f32,
    tick_period: Duration,
    /// Half the rated linear deceleration
    braking_decel: f32,
    snapshot: Vec<InstrumentState>,
    errors: Vec<TeleopError>,
    stats: EngineStats,
}

impl<C: MasterConsole> TeleoperationEngine<C, SimulatedArm> {
    /// Engine over simulated arms, one per configured instrument
    pub fn simulated(console: C, config: &SessionConfig) -> TeleopResult<Self> {
        let settings = config.controller_settings();
        let controllers = config
            .robot
            .instruments
            .iter()
            .map(|inst| InstrumentController::simulated(inst.clone(), settings))
            .collect::<TeleopResult<Vec<_>>>()?;
        Self::new(console, controllers, config)
    }
}

impl<C: MasterConsole, A: ActuatorBackend> TeleoperationEngine<C, A> {
    /// Controller `i` is driven from console channel `i`
    pub fn new(console: C, controllers: Vec<InstrumentController<A>>, config: &SessionConfig) -> TeleopResult<Self> {
        config.validate()?;
        let robot = &config.robot;
        if controllers.len() != robot.arm_count {
            return Err(TeleopError::InvalidConfig(format!(
                "{} controllers for {} arms",
                controllers.len(),
                robot.arm_count
            )));
        }
        if console.channel_count() < robot.arm_count {
            return Err(TeleopError::InvalidConfig(format!(
                "console has {} channels, need {}",
                console.channel_count(),
                robot.arm_count
            )));
        }

        let arms: Vec<Arm<A>> = controllers
            .into_iter()
            .enumerate()
            .map(|(channel, controller)| Arm {
                channel,
                max_jaw_deg: controller.config().instrument_type.max_jaw_angle_deg(),
                controller,
                anchor: None,
                last_sample: None,
            })
            .collect();

        let count = arms.len();
        Ok(TeleoperationEngine {
            console,
            arms,
            safety: SafetySupervisor::for_instruments(config.safety, &robot.instruments),
            motion_scaling: robot.motion_scaling,
            dead_zone: robot.gripper_dead_zone,
            tick_period: robot.tick_period(),
            braking_decel: 0.5 * DofLimits::linear().max_acceleration,
            snapshot: Vec::with_capacity(count),
            errors: Vec::with_capacity(count * 2),
            stats: EngineStats::default(),
        })
    }

    pub fn arm_count(&self) -> usize {
        self.arms.len()
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn safety(&self) -> &SafetySupervisor {
        &self.safety
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Errors raised by the last tick
    pub fn tick_errors(&self) -> &[TeleopError] {
        &self.errors
    }

    pub fn controller(&self, id: InstrumentId) -> Option<&InstrumentController<A>> {
        self.arms.iter().map(|a| &a.controller).find(|c| c.id() == id)
    }

    pub fn controller_mut(&mut self, id: InstrumentId) -> Option<&mut InstrumentController<A>> {
        self.arms.iter_mut().map(|a| &mut a.controller).find(|c| c.id() == id)
    }

    pub fn state(&self, id: InstrumentId) -> Option<InstrumentState> {
        self.controller(id).map(|c| c.state())
    }

    /// Copy every arm's state into `out`
    pub fn states_into(&self, out: &mut Vec<InstrumentState>) {
        out.clear();
        out.extend(self.arms.iter().map(|a| a.controller.state()));
    }

    /// Calibrate every arm; the first failure aborts and is returned
    pub fn calibrate_all(&mut self, now: Timestamp) -> TeleopResult<()> {
        for arm in self.arms.iter_mut() {
            arm.disengage();
            arm.controller.calibrate(now)?;
        }
        Ok(())
    }

    /// Stop every arm; idempotent
    pub fn emergency_stop_all(&mut self) {
        for arm in self.arms.iter_mut() {
            arm.controller.emergency_stop();
            arm.disengage();
        }
    }

    /// Clear stop latches; arms need recalibration afterwards
    pub fn reset_all(&mut self) {
        for arm in self.arms.iter_mut() {
            arm.controller.reset();
            arm.disengage();
        }
    }

    /// Run one control tick at `now`
    pub fn tick(&mut self, now: Timestamp, events: &mut Vec<ControlEvent>) -> TickReport {
        let mut report = TickReport::default();
        self.errors.clear();
        self.stats.ticks += 1;
        let dt = self.tick_period.as_secs_f32();

        // Stage 1: Snapshot every arm for cross-instrument checks
        self.snapshot.clear();
        self.snapshot.extend(self.arms.iter().map(|a| a.controller.state()));

        for i in 0..self.arms.len() {
            let arm = &mut self.arms[i];
            if arm.controller.is_stopped() {
                report.skipped += 1;
                continue;
            }
            let current = self.snapshot[i];
            let id = current.instrument_id;

            // Stage 2: Read master input
            let sample = match self.console.read_manipulator(arm.channel) {
                Ok(Some(s)) if arm.last_sample.map_or(true, |last| s.timestamp > last) => Some(s),
                Ok(Some(s)) => {
                    trace!(instrument = %id, ts = ?s.timestamp, "stale master sample");
                    self.stats.stale_samples += 1;
                    None
                }
                Ok(None) => None,
                Err(e) => {
                    self.stats.console_errors += 1;
                    self.errors.push(e);
                    None
                }
            };

            // Stage 3: Scale, transform and map the jaw
            let command = match sample {
                Some(s) if s.buttons.clutch() => {
                    if arm.anchor.take().is_some() {
                        debug!(instrument = %id, "clutch engaged");
                    }
                    arm.last_sample = Some(s.timestamp);
                    None
                }
                Some(s) => {
                    arm.last_sample = Some(s.timestamp);
                    Some(target_command(arm, &current, &s, self.motion_scaling, self.dead_zone))
                }
                None => None,
            };

            // Stage 4: Velocity estimate through the safety filter
            let command = match command {
                Some(mut cmd) => {
                    let offset = cmd.position - current.tip_position;
                    let proposed = braking_limit(offset / dt, offset.norm(), self.braking_decel);
                    let safe = self.safety.filter_velocity(&self.snapshot, id, proposed, dt);
                    cmd.position = current.tip_position + safe * dt;
                    cmd.velocity = safe;
                    report.commanded += 1;
                    self.stats.commands += 1;
                    cmd
                }
                None => {
                    report.held += 1;
                    self.stats.holds += 1;
                    SlaveCommand::hold(&current)
                }
            };

            // Stage 5: Execute
            match arm.controller.execute(&command, now) {
                Ok(_) => {}
                Err(e) => {
                    if let TeleopError::InstrumentFault { instrument, reason } = &e {
                        error!(instrument = %instrument, %reason, "arm faulted, continuing with remaining arms");
                        self.stats.instrument_faults += 1;
                        events.push(ControlEvent::InstrumentFault {
                            instrument: *instrument,
                            reason: reason.clone(),
                        });
                    }
                    arm.disengage();
                    self.errors.push(e);
                    continue;
                }
            }

            // Stage 6: Collision assessment and feedback
            let assessment = self.safety.assess(&self.snapshot, id);
            if assessment.alerts.most_severe() == Some(AlertLevel::Critical) {
                report.critical_proximity = true;
            }
            arm.controller.apply_safety_assessment(assessment.risk, assessment.alerts);
            let state = arm.controller.state();
            events.push(ControlEvent::InstrumentUpdate(state));

            let haptic = arm.controller.haptic_feedback();
            if let Err(e) = self.console.send_haptic(arm.channel, &haptic) {
                self.stats.console_errors += 1;
                self.errors.push(e);
            }
            events.push(ControlEvent::HapticFeedback(haptic));
        }

        report.errors = self.errors.len();
        report
    }
}

/// Target pose for a fresh, unclutched sample, anchoring if needed
fn target_command<A: ActuatorBackend>(
    arm: &mut Arm<A>,
    current: &InstrumentState,
    sample: &MasterSample,
    motion_scaling: f32,
    dead_zone: f32,
) -> SlaveCommand {
    let anchor = *arm.anchor.get_or_insert_with(|| {
        debug!(instrument = %current.instrument_id, "channel engaged");
        Anchor {
            master: sample.position,
            master_orientation: sample.orientation,
            slave: current.tip_position,
            slave_orientation: current.orientation,
        }
    });

    let delta = console_to_patient(scale_delta(sample.position - anchor.master, motion_scaling));
    SlaveCommand {
        instrument_id: current.instrument_id,
        position: anchor.slave + delta,
        orientation: map_orientation(sample.orientation, anchor.master_orientation, anchor.slave_orientation),
        jaw_angle: gripper_to_jaw(sample.gripper, dead_zone, arm.max_jaw_deg),
        velocity: Vec3::ZERO,
        buttons: sample.buttons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::f32::consts::FRAC_PI_2;
    use telesurg_core::{ButtonStates, ScriptedConsole};

    const TICK: Duration = Duration::from_millis(1);

    fn sample(ms: u64, position: Vec3, gripper: f32) -> MasterSample {
        MasterSample {
            timestamp: Timestamp::from_millis(ms),
            position,
            orientation: Quaternion::IDENTITY,
            gripper,
            buttons: ButtonStates::NONE,
        }
    }

    fn engine() -> (TeleoperationEngine<ScriptedConsole>, ScriptedConsole) {
        let script = ScriptedConsole::new(2);
        let mut engine = TeleoperationEngine::simulated(script.clone(), &SessionConfig::default()).unwrap();
        engine.calibrate_all(Timestamp::ZERO).unwrap();
        (engine, script)
    }

    fn run(engine: &mut TeleoperationEngine<ScriptedConsole>, from_ms: u64, ticks: u64) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        for t in 0..ticks {
            engine.tick(Timestamp::from_millis(from_ms + t), &mut events);
        }
        events
    }

    #[test]
    fn test_scale_delta() {
        assert_eq!(scale_delta(Vec3::new(5.0, 0.0, 0.0), 5.0), Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_braking_limit() {
        let v = Vec3::new(0.0, 0.0, 5000.0);
        // sqrt(2 * 500 * 4) = 63.2
        let out = braking_limit(v, 4.0, 500.0);
        assert!((out.norm() - 63.245).abs() < 1e-2);
        assert_eq!(out.x, 0.0);
        assert_eq!(braking_limit(Vec3::new(1.0, 0.0, 0.0), 4.0, 500.0), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(braking_limit(v, 0.0, 500.0), Vec3::ZERO);
    }

    #[test]
    fn test_console_to_patient_flips_x_and_y() {
        let v = console_to_patient(Vec3::new(1.0, 2.0, 3.0));
        assert!(v.distance(Vec3::new(-1.0, -2.0, 3.0)) < 1e-5, "{:?}", v);
    }

    #[test]
    fn test_orientation_delta_is_mirrored() {
        let roll = Quaternion::from_axis_angle(Vec3::new(1.0, 0.0, 0.0), FRAC_PI_2);
        let out = map_orientation(roll, Quaternion::IDENTITY, Quaternion::IDENTITY);
        let expected = Quaternion::from_axis_angle(Vec3::new(-1.0, 0.0, 0.0), FRAC_PI_2);
        assert!(out.angle_to(expected) < 1e-3);

        // no master motion, no slave motion
        let out = map_orientation(roll, roll, Quaternion::IDENTITY);
        assert!(out.angle_to(Quaternion::IDENTITY) < 1e-3);
    }

    #[test]
    fn test_gripper_dead_zone() {
        assert_eq!(gripper_to_jaw(0.05, 0.05, 45.0), 0.0);
        assert_eq!(gripper_to_jaw(0.0, 0.05, 45.0), 0.0);
        assert!((gripper_to_jaw(1.0, 0.05, 45.0) - 45.0).abs() < 1e-4);
        assert!((gripper_to_jaw(0.525, 0.05, 75.0) - 37.5).abs() < 1e-3);
        assert_eq!(gripper_to_jaw(f32::NAN, 0.05, 45.0), 0.0);
        assert!((gripper_to_jaw(3.0, 0.05, 55.0) - 55.0).abs() < 1e-4);
    }

    #[test]
    fn test_missing_sample_holds() {
        let (mut engine, _) = engine();
        let mut events = Vec::new();
        let report = engine.tick(Timestamp::from_millis(1), &mut events);
        assert_eq!(report.held, 2);
        assert_eq!(report.commanded, 0);
        assert_eq!(report.errors, 0);
        // one update and one haptic per arm
        assert_eq!(events.len(), 4);
        let home = Vec3::new(-40.0, 0.0, 0.0);
        assert!(engine.state(InstrumentId::new(0)).unwrap().tip_position.distance(home) < 1e-3);
    }

    #[test]
    fn test_master_motion_is_scaled_and_mirrored() {
        let (mut engine, script) = engine();
        // first sample anchors at the master origin
        script.push_sample(0, sample(1, Vec3::ZERO, 0.0));
        run(&mut engine, 1, 1);

        // 15 mm on the console at scale 3 is 5 mm at the tip, mirrored in x
        for ms in 2..400 {
            script.push_sample(0, sample(ms, Vec3::new(15.0, 0.0, 0.0), 0.0));
        }
        run(&mut engine, 2, 398);

        let tip = engine.state(InstrumentId::new(0)).unwrap().tip_position;
        assert!(tip.distance(Vec3::new(-45.0, 0.0, 0.0)) < 0.2, "tip {:?}", tip);
        // the other arm never moved
        let other = engine.state(InstrumentId::new(1)).unwrap().tip_position;
        assert!(other.distance(Vec3::new(40.0, 0.0, 0.0)) < 1e-3);
    }

    #[test]
    fn test_commanded_speed_is_clamped() {
        let (mut engine, script) = engine();
        script.push_sample(0, sample(1, Vec3::ZERO, 0.0));
        run(&mut engine, 1, 1);
        // 300 mm of master motion in one tick
        script.push_sample(0, sample(2, Vec3::new(0.0, 0.0, 300.0), 0.0));
        let mut events = Vec::new();
        let report = engine.tick(Timestamp::from_millis(2), &mut events);
        assert_eq!(report.commanded, 1);

        let v = engine.state(InstrumentId::new(0)).unwrap().linear_velocity.unwrap();
        assert!(v.norm() <= 200.0 + 1e-3);
    }

    #[test]
    fn test_stale_sample_is_ignored() {
        let (mut engine, script) = engine();
        script.push_sample(0, sample(5, Vec3::ZERO, 0.0));
        script.push_sample(0, sample(5, Vec3::new(30.0, 0.0, 0.0), 0.0));
        script.push_sample(0, sample(4, Vec3::new(30.0, 0.0, 0.0), 0.0));

        let mut events = Vec::new();
        assert_eq!(engine.tick(Timestamp::from_millis(1), &mut events).commanded, 1);
        assert_eq!(engine.tick(Timestamp::from_millis(2), &mut events).held, 2);
        assert_eq!(engine.tick(Timestamp::from_millis(3), &mut events).held, 2);
        assert_eq!(engine.stats().stale_samples, 2);
    }

    #[test]
    fn test_clutch_reanchors() {
        let (mut engine, script) = engine();
        let id = InstrumentId::new(0);
        script.push_sample(0, sample(1, Vec3::ZERO, 0.0));
        for ms in 2..300 {
            script.push_sample(0, sample(ms, Vec3::new(0.0, 0.0, 30.0), 0.0));
        }
        run(&mut engine, 1, 299);
        let before = engine.state(id).unwrap().tip_position;
        assert!((before.z - 10.0).abs() < 0.2, "{:?}", before);

        // clutch, reposition the hand, release
        let mut clutched = sample(300, Vec3::new(0.0, 0.0, -60.0), 0.0);
        clutched.buttons = ButtonStates::new(ButtonStates::CLUTCH);
        script.push_sample(0, clutched);
        for ms in 301..600 {
            script.push_sample(0, sample(ms, Vec3::new(0.0, 0.0, -60.0), 0.0));
        }
        run(&mut engine, 300, 300);

        let after = engine.state(id).unwrap().tip_position;
        assert!(after.distance(before) < 0.5, "moved to {:?}", after);
    }

    #[test]
    fn test_jaw_follows_gripper() {
        let (mut engine, script) = engine();
        for ms in 1..1000 {
            script.push_sample(0, sample(ms, Vec3::ZERO, 1.0));
        }
        run(&mut engine, 1, 999);
        let jaw = engine.state(InstrumentId::new(0)).unwrap().jaw_angle.unwrap();
        assert!((jaw - 45.0).abs() < 0.5, "jaw {}", jaw);
    }

    #[test]
    fn test_console_errors_are_reported() {
        let (mut engine, script) = engine();
        script.fail_reads(1);
        let mut events = Vec::new();
        let report = engine.tick(Timestamp::from_millis(1), &mut events);
        assert_eq!(report.errors, 1);
        assert_eq!(report.held, 2);
        assert!(matches!(engine.tick_errors(), [TeleopError::Console(_)]));

        let report = engine.tick(Timestamp::from_millis(2), &mut events);
        assert_eq!(report.errors, 0);
        assert!(engine.tick_errors().is_empty());
    }

    #[test]
    fn test_arm_fault_is_isolated() {
        let (mut engine, script) = engine();
        engine
            .controller_mut(InstrumentId::new(1))
            .unwrap()
            .backend_mut()
            .inject_fault("encoder lost");

        let mut events = Vec::new();
        let report = engine.tick(Timestamp::from_millis(1), &mut events);
        assert_eq!(report.errors, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            ControlEvent::InstrumentFault { instrument, .. } if *instrument == InstrumentId::new(1)
        )));

        // the faulted arm is skipped from now on, the other keeps working
        script.push_sample(0, sample(2, Vec3::ZERO, 0.0));
        let report = engine.tick(Timestamp::from_millis(2), &mut events);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.commanded, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(engine.stats().instrument_faults, 1);
    }

    #[test]
    fn test_emergency_stop_all() {
        let (mut engine, _) = engine();
        engine.emergency_stop_all();
        engine.emergency_stop_all();
        let mut events = Vec::new();
        let report = engine.tick(Timestamp::from_millis(1), &mut events);
        assert_eq!(report.skipped, 2);
        assert!(events.is_empty());

        engine.reset_all();
        assert!(engine.controller(InstrumentId::new(0)).map_or(false, |c| !c.is_calibrated()));
        engine.calibrate_all(Timestamp::from_millis(2)).unwrap();
        assert_eq!(engine.tick(Timestamp::from_millis(3), &mut events).held, 2);
    }

    #[test]
    fn test_rejects_short_console() {
        let config = SessionConfig::default();
        assert!(TeleoperationEngine::simulated(ScriptedConsole::new(1), &config).is_err());
    }

    #[test]
    fn test_haptics_reach_console() {
        let (mut engine, script) = engine();
        engine
            .controller_mut(InstrumentId::new(0))
            .unwrap()
            .backend_mut()
            .set_tip_contact(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO);
        run(&mut engine, 1, 1);
        let haptics = script.haptics();
        assert_eq!(haptics.len(), 2);
        assert_eq!(haptics[0].0, 0);
        assert_eq!(haptics[0].1.force, Vec3::new(0.0, 0.0, 3.0));
    }

    proptest! {
        #[test]
        fn prop_jaw_always_in_range(gripper in prop::num::f32::ANY, dead_zone in 0.0f32..0.99) {
            let jaw = gripper_to_jaw(gripper, dead_zone, 45.0);
            prop_assert!((0.0..=45.0).contains(&jaw), "jaw {}", jaw);
        }

        #[test]
        fn prop_mapping_shrinks_by_scale(
            x in -500.0f32..500.0,
            y in -500.0f32..500.0,
            z in -500.0f32..500.0,
            scale in 1.0f32..=10.0,
        ) {
            let delta = Vec3::new(x, y, z);
            let mapped = console_to_patient(scale_delta(delta, scale));
            prop_assert!((mapped.norm() * scale - delta.norm()).abs() < 1e-3 * (1.0 + delta.norm()));
            prop_assert!((mapped.z * scale - z).abs() < 1e-3 * (1.0 + z.abs()));
        }
    }
}
