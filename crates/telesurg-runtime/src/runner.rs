//! Fixed-period control thread
//!
//! The session runs on a dedicated OS thread paced against absolute deadlines.
//! It only ever touches the async side through `try_recv`/`try_send`, so a
//! stalled consumer costs dropped events, never a late tick.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, info, trace, warn};

use telesurg_core::{Clock, MasterConsole, TeleopError, TeleopResult};
use telesurg_instrument::ActuatorBackend;
use telesurg_transport::TransportEvent;

use crate::{ControlEvent, ControlSession, SessionCommand, StopReason};

/// Events buffered per tick before they are handed to the channel
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    /// Ticks that finished after their deadline
    pub overruns: u64,
    pub longest_tick: Duration,
    pub commands: u64,
    /// Events the consumer had no room for
    pub dropped_events: u64,
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    /// Every command sender was dropped
    Disconnected,
}

pub struct LoopOutcome<C: MasterConsole, A: ActuatorBackend> {
    pub session: ControlSession<C, A>,
    pub stats: LoopStats,
    pub exit: LoopExit,
}

/// Sender side for a running control loop
pub struct ControlLoop<C: MasterConsole, A: ActuatorBackend> {
    commands: mpsc::Sender<SessionCommand>,
    thread: JoinHandle<LoopOutcome<C, A>>,
}

impl<C, A> ControlLoop<C, A>
where
    C: MasterConsole + 'static,
    A: ActuatorBackend + 'static,
{
    /// Start the control thread
    ///
    /// Returns the loop and the receiver for everything the session emits.
    pub fn spawn(
        session: ControlSession<C, A>,
        clock: Arc<dyn Clock>,
        command_capacity: usize,
        event_capacity: usize,
    ) -> TeleopResult<(Self, mpsc::Receiver<ControlEvent>)> {
        let (commands, command_rx) = mpsc::channel(command_capacity);
        let (event_tx, event_rx) = mpsc::channel(event_capacity);

        let thread = thread::Builder::new()
            .name("telesurg-control".into())
            .spawn(move || run_control_loop(session, clock, command_rx, event_tx))?;
        Ok((ControlLoop { commands, thread }, event_rx))
    }

    /// Clonable sender for session commands
    pub fn commands(&self) -> mpsc::Sender<SessionCommand> {
        self.commands.clone()
    }

    /// Non-blocking send; a full queue is reported, not waited on
    pub fn send(&self, command: SessionCommand) -> TeleopResult<()> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TeleopError::Transport("control command queue full".into()),
            mpsc::error::TrySendError::Closed(_) => TeleopError::ChannelClosed,
        })
    }

    /// Ask the loop to stop and wait for it
    ///
    /// Blocks the calling thread; not for use inside an async task.
    pub fn shutdown(self) -> TeleopResult<LoopOutcome<C, A>> {
        match self.commands.try_send(SessionCommand::Shutdown) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                // the loop drains the whole queue every tick
                debug!("command queue full, waiting to queue shutdown");
                if self.commands.blocking_send(command).is_err() {
                    debug!("control loop already exiting");
                }
            }
            Err(TrySendError::Closed(_)) => debug!("control loop already exiting"),
        }
        drop(self.commands);
        self.thread
            .join()
            .map_err(|_| TeleopError::Transport("control thread panicked".into()))
    }
}

/// Body of the control thread; returns once shut down
pub fn run_control_loop<C: MasterConsole, A: ActuatorBackend>(
    mut session: ControlSession<C, A>,
    clock: Arc<dyn Clock>,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<ControlEvent>,
) -> LoopOutcome<C, A> {
    let period = session.engine().tick_period();
    let mut stats = LoopStats::default();
    let mut buffer = Vec::with_capacity(EVENT_BUFFER);
    let mut deadline = Instant::now() + period;
    info!(session = %session.session_id(), ?period, "control loop started");

    let exit = 'run: loop {
        let started = Instant::now();
        let now = clock.now();

        loop {
            match commands.try_recv() {
                Ok(SessionCommand::Shutdown) => break 'run LoopExit::Shutdown,
                Ok(command) => {
                    stats.commands += 1;
                    if let Err(e) = session.handle_command(command, now, &mut buffer) {
                        warn!(%command, error = %e, "session command rejected");
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'run LoopExit::Disconnected,
            }
        }

        session.step(now, &mut buffer);
        stats.ticks += 1;

        for event in buffer.drain(..) {
            if events.try_send(event).is_err() {
                stats.dropped_events += 1;
            }
        }

        let finished = Instant::now();
        stats.longest_tick = stats.longest_tick.max(finished - started);
        if finished > deadline {
            stats.overruns += 1;
            trace!(late = ?(finished - deadline), "control tick overran");
            // Skip missed periods rather than bursting to catch up
            deadline = finished + period;
        } else {
            thread::sleep(deadline - finished);
            deadline += period;
        }
    };

    if session.state().is_active() {
        debug!("stopping arms on loop exit");
        let mut tail = Vec::new();
        session.emergency_stop(StopReason::Requested, &mut tail);
        for event in tail {
            if events.try_send(event).is_err() {
                stats.dropped_events += 1;
            }
        }
    }

    info!(
        ticks = stats.ticks,
        overruns = stats.overruns,
        dropped = stats.dropped_events,
        ?exit,
        "control loop stopped"
    );
    LoopOutcome { session, stats, exit }
}

/// Turn what the transport learns into session commands
///
/// Peer liveness counts as a heartbeat. Runs until either side closes.
pub async fn forward_transport_events(
    mut transport: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Sender<SessionCommand>,
) {
    while let Some(event) = transport.recv().await {
        let command = match event {
            TransportEvent::EmergencyStop => SessionCommand::RemoteEmergencyStop,
            TransportEvent::LatencyWarning(ms) => SessionCommand::LatencyWarning(ms),
            TransportEvent::Heartbeat { .. } => SessionCommand::Heartbeat,
            TransportEvent::StateChanged(state) => {
                debug!(%state, "transport state changed");
                continue;
            }
            other => {
                trace!(?other, "transport event not relevant to the control loop");
                continue;
            }
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }
}
