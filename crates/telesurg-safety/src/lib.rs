//! Telesurg Safety - Velocity safety filter
//!
//! A pure, deterministic mapping from (instrument snapshots, proposed
//! velocity) to a safe velocity. Three stages compose in order:
//!
//! 1. Max-speed clamp
//! 2. Workspace hard stop with a quadratic soft zone
//! 3. Inter-instrument collision damping
//!
//! No stage increases the velocity magnitude.

pub mod limits;
pub mod supervisor;

pub use limits::*;
pub use supervisor::*;
