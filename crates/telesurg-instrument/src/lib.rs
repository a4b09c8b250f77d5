//! Telesurg Instrument - Patient-side instrument control
//!
//! Each instrument is a set of independent PID-controlled degrees of freedom
//! over an [`ActuatorBackend`]. The controller reads back positions and jaw
//! force sensors after every step, classifies tissue contact and keeps the
//! instrument's safety status current.

pub mod actuator;
pub mod controller;
pub mod dof;
pub mod pid;
pub mod tissue;

pub use actuator::*;
pub use controller::*;
pub use dof::*;
pub use pid::*;
pub use tissue::*;
