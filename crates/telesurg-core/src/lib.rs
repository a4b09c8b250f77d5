//! Telesurg Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the teleoperation core:
//! - Identifiers (InstrumentId, SessionId)
//! - Time primitives (Timestamp) and injectable clocks
//! - Geometry (Vec3, Quaternion)
//! - Instrument state, safety status, slave commands and calibration records
//! - Session configuration
//! - The master console capability
//! - Errors

pub mod config;
pub mod console;
pub mod error;
pub mod geometry;
pub mod id;
pub mod state;
pub mod time;

pub use config::*;
pub use console::*;
pub use error::*;
pub use geometry::*;
pub use id::*;
pub use state::*;
pub use time::*;
