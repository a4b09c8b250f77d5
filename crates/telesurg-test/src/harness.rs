//! Control session on a manual clock
//!
//! Every tick advances the clock by one control period, feeds the current
//! master pose of each channel to the scripted console and steps the session.
//! Heartbeats are sent on a fixed tick interval unless switched off.

use std::time::Duration;

use telesurg_core::{
    ButtonStates, Clock, InstrumentId, InstrumentState, ManualClock, MasterSample, Quaternion, ScriptedConsole, SessionId,
    SystemState, TeleopResult, Timestamp, Vec3,
};
use telesurg_instrument::{InstrumentController, SimulatedArm};
use telesurg_runtime::{ControlEvent, ControlSession, SessionCommand, SessionConfig, TickReport};

/// Ticks between heartbeats by default
pub const DEFAULT_HEARTBEAT_TICKS: u32 = 10;

/// Where the surgeon holds one master manipulator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterPose {
    pub position: Vec3,
    pub orientation: Quaternion,
    pub gripper: f32,
    pub clutch: bool,
}

impl MasterPose {
    pub fn at(position: Vec3) -> Self {
        MasterPose {
            position,
            orientation: Quaternion::IDENTITY,
            gripper: 0.0,
            clutch: false,
        }
    }

    pub fn with_gripper(mut self, gripper: f32) -> Self {
        self.gripper = gripper;
        self
    }

    pub fn with_orientation(mut self, orientation: Quaternion) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn clutched(mut self) -> Self {
        self.clutch = true;
        self
    }

    fn sample(&self, timestamp: Timestamp) -> MasterSample {
        MasterSample {
            timestamp,
            position: self.position,
            orientation: self.orientation,
            gripper: self.gripper,
            buttons: if self.clutch {
                ButtonStates::new(ButtonStates::CLUTCH)
            } else {
                ButtonStates::NONE
            },
        }
    }
}

pub struct SimulatedSession {
    clock: ManualClock,
    console: ScriptedConsole,
    session: ControlSession<ScriptedConsole>,
    ids: Vec<InstrumentId>,
    poses: Vec<Option<MasterPose>>,
    heartbeat_ticks: Option<u32>,
    events: Vec<ControlEvent>,
    ticks: u64,
}

impl SimulatedSession {
    pub fn new(config: SessionConfig) -> TeleopResult<Self> {
        let channels = config.robot.arm_count;
        let ids = config.robot.instruments.iter().map(|i| i.id).collect();
        let console = ScriptedConsole::new(channels);
        let session = ControlSession::simulated(config, console.clone())?;
        Ok(SimulatedSession {
            clock: ManualClock::starting_at(Timestamp::from_millis(1)),
            console,
            session,
            ids,
            poses: vec![None; channels],
            heartbeat_ticks: Some(DEFAULT_HEARTBEAT_TICKS),
            events: Vec::new(),
            ticks: 0,
        })
    }

    /// Default dual-arm setup
    pub fn dual_arm() -> TeleopResult<Self> {
        Self::new(SessionConfig::default())
    }

    /// Connect and start the procedure
    pub fn start(&mut self) -> TeleopResult<()> {
        let now = self.clock.now();
        self.session.connect(now)?;
        self.session.start_procedure(now)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn state(&self) -> SystemState {
        self.session.state()
    }

    pub fn session_id(&self) -> SessionId {
        self.session.session_id()
    }

    pub fn session(&self) -> &ControlSession<ScriptedConsole> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ControlSession<ScriptedConsole> {
        &mut self.session
    }

    pub fn console(&self) -> &ScriptedConsole {
        &self.console
    }

    pub fn instrument_id(&self, channel: usize) -> InstrumentId {
        self.ids[channel]
    }

    pub fn arm(&mut self, channel: usize) -> Option<&mut InstrumentController<SimulatedArm>> {
        let id = self.ids.get(channel).copied()?;
        self.session.engine_mut().controller_mut(id)
    }

    /// Stream `pose` on `channel` every tick until changed or cleared
    pub fn set_pose(&mut self, channel: usize, pose: MasterPose) {
        self.poses[channel] = Some(pose);
    }

    /// The surgeon lets go of `channel`; no more samples arrive
    pub fn clear_pose(&mut self, channel: usize) {
        self.poses[channel] = None;
    }

    /// Heartbeat every `ticks` ticks, or never
    pub fn set_heartbeat_interval(&mut self, ticks: Option<u32>) {
        self.heartbeat_ticks = ticks.filter(|t| *t > 0);
    }

    pub fn command(&mut self, command: SessionCommand) -> TeleopResult<()> {
        let now = self.clock.now();
        self.session.handle_command(command, now, &mut self.events)
    }

    /// Let time pass without ticking
    pub fn advance(&mut self, duration: Duration) {
        self.clock.advance(duration);
    }

    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.advance(self.session.engine().tick_period());
        self.ticks += 1;

        for (channel, pose) in self.poses.iter().enumerate() {
            if let Some(pose) = pose {
                self.console.push_sample(channel, pose.sample(now));
            }
        }
        if let Some(every) = self.heartbeat_ticks {
            if self.ticks % u64::from(every) == 0 {
                // Only rejected in states where a heartbeat means nothing
                let _ = self.session.handle_command(SessionCommand::Heartbeat, now, &mut self.events);
            }
        }
        self.session.step(now, &mut self.events)
    }

    /// Run `ticks` ticks; returns the last report
    pub fn run(&mut self, ticks: u32) -> TickReport {
        let mut report = TickReport::default();
        for _ in 0..ticks {
            report = self.tick();
        }
        report
    }

    pub fn instrument(&self, channel: usize) -> Option<InstrumentState> {
        self.session.engine().state(*self.ids.get(channel)?)
    }

    pub fn tip(&self, channel: usize) -> Option<Vec3> {
        self.instrument(channel).map(|s| s.tip_position)
    }

    pub fn jaw(&self, channel: usize) -> Option<f32> {
        self.instrument(channel).and_then(|s| s.jaw_angle)
    }

    pub fn events(&self) -> &[ControlEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<ControlEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn count_events<F: Fn(&ControlEvent) -> bool>(&self, f: F) -> usize {
        self.events.iter().filter(|e| f(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_tick() {
        let mut sim = SimulatedSession::dual_arm().unwrap();
        sim.start().unwrap();
        assert_eq!(sim.state(), SystemState::Operating);

        let start = sim.now();
        let report = sim.run(5);
        assert_eq!(sim.ticks(), 5);
        assert_eq!(sim.now().since(start), Duration::from_millis(5));
        // no poses: both arms hold
        assert_eq!(report.held, 2);
        assert_eq!(sim.count_events(|e| matches!(e, ControlEvent::InstrumentUpdate(_))), 10);
    }

    #[test]
    fn test_poses_become_commands() {
        let mut sim = SimulatedSession::dual_arm().unwrap();
        sim.start().unwrap();
        sim.set_pose(0, MasterPose::at(Vec3::ZERO));
        let report = sim.tick();
        assert_eq!(report.commanded, 1);
        assert_eq!(report.held, 1);
        assert_eq!(sim.console().pending(0), 0);
    }

    #[test]
    fn test_heartbeats_keep_session_alive() {
        let mut sim = SimulatedSession::dual_arm().unwrap();
        sim.start().unwrap();
        sim.run(500);
        assert_eq!(sim.state(), SystemState::Operating);

        sim.set_heartbeat_interval(None);
        sim.run(150);
        assert_eq!(sim.state(), SystemState::EmergencyStop);
    }
}
