//! Control session: engine plus system supervisor
//!
//! A session is what the control thread owns. Each [`ControlSession::step`]
//! runs the heartbeat watchdog, one engine tick and the error bookkeeping, and
//! converges every fatal path on a single global emergency stop.

use tracing::{debug, error, info, warn};

use telesurg_core::{MasterConsole, SessionId, SystemState, TeleopError, TeleopResult, Timestamp};
use telesurg_instrument::{ActuatorBackend, SimulatedArm};
use telesurg_transport::TransportHandle;

use crate::{
    ControlEvent, SessionCommand, SessionConfig, StopReason, SystemSupervisor, TeleoperationEngine, TickReport,
};

/// Counters for requests the transport queue refused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub states: u64,
    pub haptics: u64,
    pub dropped: u64,
}

pub struct ControlSession<C: MasterConsole, A: ActuatorBackend = SimulatedArm> {
    config: SessionConfig,
    engine: TeleoperationEngine<C, A>,
    supervisor: SystemSupervisor,
    transport: Option<TransportHandle>,
    publish: PublishStats,
}

impl<C: MasterConsole> ControlSession<C, SimulatedArm> {
    /// Session over simulated arms
    pub fn simulated(config: SessionConfig, console: C) -> TeleopResult<Self> {
        let engine = TeleoperationEngine::simulated(console, &config)?;
        Ok(Self::new(config, engine))
    }
}

impl<C: MasterConsole, A: ActuatorBackend> ControlSession<C, A> {
    pub fn new(config: SessionConfig, engine: TeleoperationEngine<C, A>) -> Self {
        let supervisor = SystemSupervisor::new(&config.robot, SessionId::new(1));
        ControlSession {
            config,
            engine,
            supervisor,
            transport: None,
            publish: PublishStats::default(),
        }
    }

    /// Publish states and forward emergency stops through a running transport
    pub fn attach_transport(&mut self, handle: TransportHandle) {
        self.transport = Some(handle);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> SystemState {
        self.supervisor.state()
    }

    pub fn session_id(&self) -> SessionId {
        self.supervisor.session_id()
    }

    pub fn supervisor(&self) -> &SystemSupervisor {
        &self.supervisor
    }

    pub fn engine(&self) -> &TeleoperationEngine<C, A> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TeleoperationEngine<C, A> {
        &mut self.engine
    }

    pub fn publish_stats(&self) -> PublishStats {
        self.publish
    }

    /// Calibrate every arm and move to Ready
    ///
    /// Any calibration failure leaves the session Idle with no arm calibrated.
    pub fn connect(&mut self, now: Timestamp) -> TeleopResult<()> {
        if self.state() != SystemState::Idle {
            return Err(TeleopError::InvalidTransition {
                from: self.state().to_string(),
                event: "connect".into(),
            });
        }
        let console = self.engine.console().get_version();
        info!(session = %self.session_id(), %console, arms = self.engine.arm_count(), "connecting");

        if let Err(e) = self.engine.calibrate_all(now) {
            error!(session = %self.session_id(), error = %e, "calibration failed, session not started");
            self.engine.reset_all();
            return Err(e);
        }
        self.supervisor.on_connected()
    }

    pub fn start_procedure(&mut self, now: Timestamp) -> TeleopResult<()> {
        self.supervisor.start_procedure(now)
    }

    /// Leave EmergencyStop: fresh session id, reconnect and recalibrate
    pub fn reinitialize(&mut self, now: Timestamp) -> TeleopResult<SessionId> {
        let session = self.supervisor.reinitialize()?;
        self.engine.reset_all();
        self.connect(now)?;
        Ok(session)
    }

    /// Global emergency stop; safe to call any number of times
    pub fn emergency_stop(&mut self, reason: StopReason, events: &mut Vec<ControlEvent>) {
        let before = self.state();
        self.supervisor.emergency_stop(reason);
        self.converge(before, events);
    }

    /// Apply one command from outside the control thread
    pub fn handle_command(
        &mut self,
        command: SessionCommand,
        now: Timestamp,
        events: &mut Vec<ControlEvent>,
    ) -> TeleopResult<()> {
        debug!(%command, "session command");
        let before = self.state();
        let result = match command {
            SessionCommand::Heartbeat => {
                self.supervisor.heartbeat(now);
                Ok(())
            }
            SessionCommand::StartProcedure => self.supervisor.start_procedure(now),
            SessionCommand::EmergencyStop => {
                self.supervisor.emergency_stop(StopReason::Requested);
                Ok(())
            }
            SessionCommand::RemoteEmergencyStop => {
                self.supervisor.emergency_stop(StopReason::Remote);
                Ok(())
            }
            SessionCommand::LatencyWarning(ms) => {
                events.push(ControlEvent::LatencyWarning(ms));
                Ok(())
            }
            // The runner ends the loop; nothing to do here
            SessionCommand::Shutdown => Ok(()),
        };
        self.converge(before, events);
        result
    }

    /// One control period at `now`
    pub fn step(&mut self, now: Timestamp, events: &mut Vec<ControlEvent>) -> TickReport {
        let before = self.state();
        let first_event = events.len();

        if self.engine.console_mut().take_emergency_stop() {
            self.supervisor.emergency_stop(StopReason::Console);
        }
        // Heartbeat loss stops everything before any arm moves
        if let Err(e) = self.supervisor.check_heartbeat(now) {
            error!(session = %self.session_id(), error = %e, "heartbeat watchdog fired");
        }

        let mut report = TickReport::default();
        if self.state().is_active() {
            report = self.engine.tick(now, events);
            for e in self.engine.tick_errors() {
                self.supervisor.record_error(e);
            }
            if report.critical_proximity {
                self.supervisor.emergency_stop(StopReason::SafetyAlert);
            } else if report.errors == 0 {
                self.supervisor.tick_ok();
            }
        }

        self.publish_events(&events[first_event..]);
        self.converge(before, events);
        report
    }

    fn publish_events(&mut self, events: &[ControlEvent]) {
        let Some(handle) = &self.transport else {
            return;
        };
        let mut published = false;
        for event in events {
            let sent = match event {
                ControlEvent::InstrumentUpdate(state) => {
                    self.publish.states += 1;
                    published = true;
                    handle.publish_state(*state)
                }
                ControlEvent::HapticFeedback(feedback) => {
                    self.publish.haptics += 1;
                    handle.send_haptic(*feedback)
                }
                _ => Ok(()),
            };
            if sent.is_err() {
                self.publish.dropped += 1;
            }
        }
        if published && handle.end_tick().is_err() {
            self.publish.dropped += 1;
        }
    }

    /// Emit state changes and, on entering EmergencyStop, stop every arm and
    /// tell the remote site
    fn converge(&mut self, before: SystemState, events: &mut Vec<ControlEvent>) {
        let now = self.state();
        if now == SystemState::EmergencyStop {
            // idempotent on the arms
            self.engine.emergency_stop_all();
        }
        if now == before {
            return;
        }
        events.push(ControlEvent::StateChanged { from: before, to: now });

        if now == SystemState::EmergencyStop {
            events.push(ControlEvent::EmergencyStop);
            if let Some(handle) = &self.transport {
                if let Err(e) = handle.emergency_stop() {
                    warn!(error = %e, "could not signal emergency stop to the remote site");
                }
            }
        }
    }
}
