//! Master console capability
//!
//! The control loop talks to the surgeon console only through [`MasterConsole`].
//! Drivers must answer without blocking: `read_manipulator` returns the newest
//! sample received since the previous read, or `None`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{HapticFeedback, MasterSample, TeleopError, TeleopResult};

/// Console firmware/protocol identification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleVersion {
    pub vendor: String,
    pub firmware: String,
    pub protocol: u16,
}

impl fmt::Display for ConsoleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (protocol v{})", self.vendor, self.firmware, self.protocol)
    }
}

/// Surgeon console: manipulator input and haptic output
pub trait MasterConsole: Send {
    /// Newest sample for `channel` since the last call, never blocks
    fn read_manipulator(&mut self, channel: usize) -> TeleopResult<Option<MasterSample>>;

    /// Queue force feedback for `channel`, never blocks
    fn send_haptic(&mut self, channel: usize, feedback: &HapticFeedback) -> TeleopResult<()>;

    fn get_version(&self) -> ConsoleVersion;

    /// Number of manipulator channels
    fn channel_count(&self) -> usize;

    /// True once if the surgeon hit the console stop since the last call
    fn take_emergency_stop(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    queues: Vec<VecDeque<MasterSample>>,
    haptics: Vec<(usize, HapticFeedback)>,
    failing_reads: u32,
    emergency_stop: bool,
}

/// Console test double fed from a script
///
/// Clones share the script, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Clone)]
pub struct ScriptedConsole {
    state: Arc<Mutex<ScriptState>>,
    channels: usize,
}

impl ScriptedConsole {
    pub fn new(channels: usize) -> Self {
        ScriptedConsole {
            state: Arc::new(Mutex::new(ScriptState {
                queues: vec![VecDeque::new(); channels],
                ..Default::default()
            })),
            channels,
        }
    }

    /// Queue a sample to be returned by a later read of `channel`
    pub fn push_sample(&self, channel: usize, sample: MasterSample) {
        if let Some(queue) = self.state.lock().queues.get_mut(channel) {
            queue.push_back(sample);
        }
    }

    /// The next `count` reads (any channel) fail
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().failing_reads = count;
    }

    /// Latch a console emergency stop for the next poll
    pub fn press_emergency_stop(&self) {
        self.state.lock().emergency_stop = true;
    }

    pub fn pending(&self, channel: usize) -> usize {
        self.state.lock().queues.get(channel).map_or(0, |q| q.len())
    }

    /// Haptic feedback sent so far, in order
    pub fn haptics(&self) -> Vec<(usize, HapticFeedback)> {
        self.state.lock().haptics.clone()
    }
}

impl MasterConsole for ScriptedConsole {
    fn read_manipulator(&mut self, channel: usize) -> TeleopResult<Option<MasterSample>> {
        let mut state = self.state.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(TeleopError::Console(format!("scripted read failure on channel {}", channel)));
        }
        state
            .queues
            .get_mut(channel)
            .ok_or_else(|| TeleopError::Console(format!("no channel {}", channel)))
            .map(|q| q.pop_front())
    }

    fn send_haptic(&mut self, channel: usize, feedback: &HapticFeedback) -> TeleopResult<()> {
        self.state.lock().haptics.push((channel, *feedback));
        Ok(())
    }

    fn get_version(&self) -> ConsoleVersion {
        ConsoleVersion {
            vendor: "scripted".into(),
            firmware: "0.0.0".into(),
            protocol: 1,
        }
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn take_emergency_stop(&mut self) -> bool {
        std::mem::take(&mut self.state.lock().emergency_stop)
    }
}
