//! Identity types for the teleoperation core
//!
//! Instrument ids are 32-bit to match the wire record layout; session ids are
//! 64-bit and never leave the local process.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of patient-side arms a session can drive
pub const MAX_INSTRUMENTS: usize = 4;

/// Instrument (arm) identity
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct InstrumentId(pub u32);

impl InstrumentId {
    pub const ZERO: InstrumentId = InstrumentId(0);

    #[inline]
    pub fn new(id: u32) -> Self {
        InstrumentId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        InstrumentId(u32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instrument({})", self.0)
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arm{}", self.0)
    }
}

/// Session identity - one connect/calibrate/operate lifecycle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const ZERO: SessionId = SessionId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }

    /// Next session id, used on explicit reinitialization
    #[inline]
    pub fn next(self) -> Self {
        SessionId(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:016x})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
