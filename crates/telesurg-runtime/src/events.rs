//! Messages between the control task and everybody else
//!
//! The control task never calls into collaborators. What it has to say goes
//! out as [`ControlEvent`]s, and what it is told comes in as
//! [`SessionCommand`]s, both over bounded channels.

use std::fmt;

use telesurg_core::{HapticFeedback, InstrumentId, InstrumentState, SystemState};

/// Output of the control task
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Fresh state after a tick
    InstrumentUpdate(InstrumentState),
    HapticFeedback(HapticFeedback),
    /// Average link latency above target, ms
    LatencyWarning(f32),
    EmergencyStop,
    StateChanged {
        from: SystemState,
        to: SystemState,
    },
    /// One arm faulted and was stopped; the others continue
    InstrumentFault {
        instrument: InstrumentId,
        reason: String,
    },
}

/// Input to the control task
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    /// Console or remote-site liveness beat
    Heartbeat,
    StartProcedure,
    /// Operator or UI stop
    EmergencyStop,
    /// Stop received from the remote site
    RemoteEmergencyStop,
    /// Link latency crossed the warning threshold, ms
    LatencyWarning(f32),
    Shutdown,
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCommand::Heartbeat => f.write_str("heartbeat"),
            SessionCommand::StartProcedure => f.write_str("start-procedure"),
            SessionCommand::EmergencyStop => f.write_str("emergency-stop"),
            SessionCommand::RemoteEmergencyStop => f.write_str("remote-emergency-stop"),
            SessionCommand::LatencyWarning(ms) => write!(f, "latency-warning({:.1} ms)", ms),
            SessionCommand::Shutdown => f.write_str("shutdown"),
        }
    }
}
