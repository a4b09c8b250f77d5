//! System supervisor: session state machine, heartbeat watchdog and error budget
//!
//! ```text
//! Idle --connected--> Ready --start_procedure--> Operating <--> Error
//!                                                    |            |
//!                       any state --emergency stop--> EmergencyStop
//! ```
//!
//! EmergencyStop is left only through [`SystemSupervisor::reinitialize`].

use std::fmt;
use std::time::Duration;

use tracing::{error, info, warn};

use telesurg_core::{RobotConfiguration, SessionId, SystemState, TeleopError, TeleopResult, Timestamp};

/// Why the system went to emergency stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator or UI request
    Requested,
    /// Emergency stop received from the remote site
    Remote,
    /// Stop pressed at the surgeon console
    Console,
    HeartbeatLost { gap_ms: u64 },
    ErrorBudgetExceeded { errors: u32 },
    /// Safety alert raised by the control loop
    SafetyAlert,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("requested"),
            StopReason::Remote => f.write_str("remote"),
            StopReason::Console => f.write_str("console"),
            StopReason::HeartbeatLost { gap_ms } => write!(f, "heartbeat lost ({} ms)", gap_ms),
            StopReason::ErrorBudgetExceeded { errors } => write!(f, "error budget exceeded ({} errors)", errors),
            StopReason::SafetyAlert => f.write_str("safety alert"),
        }
    }
}

pub struct SystemSupervisor {
    state: SystemState,
    session: SessionId,
    heartbeat_timeout: Duration,
    error_budget: u32,
    last_heartbeat: Option<Timestamp>,
    errors: u32,
    stop_reason: Option<StopReason>,
}

impl SystemSupervisor {
    pub fn new(robot: &RobotConfiguration, session: SessionId) -> Self {
        SystemSupervisor {
            state: SystemState::Idle,
            session,
            heartbeat_timeout: robot.heartbeat_timeout(),
            error_budget: robot.error_budget,
            last_heartbeat: None,
            errors: 0,
            stop_reason: None,
        }
    }

    #[inline]
    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Control errors counted this session
    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn last_heartbeat(&self) -> Option<Timestamp> {
        self.last_heartbeat
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    fn invalid(&self, event: &str) -> TeleopError {
        TeleopError::InvalidTransition {
            from: self.state.to_string(),
            event: event.into(),
        }
    }

    fn enter(&mut self, next: SystemState) {
        if self.state != next {
            info!(session = %self.session, from = %self.state, to = %next, "system state changed");
            self.state = next;
        }
    }

    /// Connection and calibration succeeded
    pub fn on_connected(&mut self) -> TeleopResult<()> {
        if self.state != SystemState::Idle {
            return Err(self.invalid("connected"));
        }
        self.enter(SystemState::Ready);
        Ok(())
    }

    /// Arms the heartbeat watchdog from `now`
    pub fn start_procedure(&mut self, now: Timestamp) -> TeleopResult<()> {
        if self.state != SystemState::Ready {
            return Err(self.invalid("start-procedure"));
        }
        self.last_heartbeat = Some(now);
        self.enter(SystemState::Operating);
        Ok(())
    }

    pub fn heartbeat(&mut self, now: Timestamp) {
        if self.last_heartbeat.map_or(true, |last| now > last) {
            self.last_heartbeat = Some(now);
        }
    }

    /// Heartbeat watchdog, run at the start of every tick
    ///
    /// Only armed while operating. A gap strictly longer than the timeout stops
    /// the system.
    pub fn check_heartbeat(&mut self, now: Timestamp) -> TeleopResult<()> {
        if !self.state.is_active() {
            return Ok(());
        }
        let Some(last) = self.last_heartbeat else {
            return Ok(());
        };
        let gap = now.since(last);
        if gap > self.heartbeat_timeout {
            let gap_ms = gap.as_millis() as u64;
            self.emergency_stop(StopReason::HeartbeatLost { gap_ms });
            return Err(TeleopError::HeartbeatLost { gap_ms });
        }
        Ok(())
    }

    /// Count one control-loop error
    ///
    /// Exceeding the budget stops the system; otherwise an operating system
    /// moves to Error until the next clean tick.
    pub fn record_error(&mut self, err: &TeleopError) -> SystemState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.errors = self.errors.saturating_add(1);
        warn!(session = %self.session, errors = self.errors, budget = self.error_budget, error = %err, "control error");

        if self.errors > self.error_budget {
            let errors = self.errors;
            self.emergency_stop(StopReason::ErrorBudgetExceeded { errors });
        } else if self.state == SystemState::Operating {
            self.enter(SystemState::Error);
        }
        self.state
    }

    /// A tick completed without errors
    pub fn tick_ok(&mut self) {
        if self.state == SystemState::Error {
            self.enter(SystemState::Operating);
        }
    }

    /// Enter EmergencyStop from any state; true only on the first call
    pub fn emergency_stop(&mut self, reason: StopReason) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        error!(session = %self.session, %reason, from = %self.state, "EMERGENCY STOP");
        self.stop_reason = Some(reason);
        self.enter(SystemState::EmergencyStop);
        true
    }

    /// Back to Idle with a fresh session id and cleared counters
    ///
    /// The caller still has to reconnect and recalibrate.
    pub fn reinitialize(&mut self) -> TeleopResult<SessionId> {
        if self.state.is_active() {
            return Err(self.invalid("reinitialize"));
        }
        self.session = self.session.next();
        self.errors = 0;
        self.last_heartbeat = None;
        self.stop_reason = None;
        self.enter(SystemState::Idle);
        Ok(self.session)
    }
}
