//! Telesurg Test Harness - Simulation and end-to-end validation
//!
//! This crate provides:
//! - Deterministic network chaos (latency, jitter, loss bursts, duplication, blackouts)
//! - A two-ended link simulator driving the transport core through the chaos network
//! - A control session harness on a manual clock with a scripted surgeon

pub mod chaos;
pub mod harness;
pub mod link;

pub use chaos::*;
pub use harness::*;
pub use link::*;
