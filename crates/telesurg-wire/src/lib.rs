//! Telesurg Wire Protocol - Binary telemetry messages
//!
//! Every message is little-endian and starts with a one-byte type tag:
//! - `0x01` instrument state (51 bytes)
//! - `0x02` haptic feedback (42 bytes)
//! - `0x03` surgeon command (58 bytes)
//! - `0x04` batch update (10 + 50 per instrument)
//! - `0x05` ping / `0x06` pong (liveness, RTT and clock offset)
//! - `0xFF` emergency stop (tag only)

pub mod flags;
pub mod message;
pub mod record;

pub use flags::*;
pub use message::*;
pub use record::*;
