//! Telesurg Runtime - The control side of a teleoperation session
//!
//! This crate ties the leaf crates together:
//! - [`TeleoperationEngine`]: one control tick (input, scaling, frame
//!   transform, safety filter, instrument execution, feedback)
//! - [`SystemSupervisor`]: session state machine, heartbeat watchdog and
//!   error budget
//! - [`ControlSession`]: engine and supervisor with a single emergency-stop path
//! - [`ControlLoop`]: the fixed-period control thread
//! - [`SessionConfig`]: JSON-loadable session configuration
//! - Tracing setup for binaries

pub mod config;
pub mod engine;
pub mod events;
pub mod logging;
pub mod runner;
pub mod session;
pub mod supervisor;

pub use config::*;
pub use engine::*;
pub use events::*;
pub use logging::*;
pub use runner::*;
pub use session::*;
pub use supervisor::*;
