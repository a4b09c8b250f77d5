//! Telesurg Transport - Telemetry streaming between control and execution sites
//!
//! This crate provides:
//! - Datagram (primary) and ordered, reconnecting (fallback) channels
//! - Per-instrument state rings with outbound motion prediction
//! - Latency, loss and clock-offset monitoring driven by ping/pong
//! - Adaptive bitrate and FEC decisions with a degraded connection state
//! - Emergency stop broadcast on every live channel
//! - A datagram surgeon console driver

pub mod bitrate;
pub mod channel;
pub mod connection;
pub mod console;
pub mod monitor;
pub mod ring;
pub mod stream;
pub mod timesync;
pub mod transport;

pub use bitrate::*;
pub use channel::*;
pub use connection::*;
pub use console::*;
pub use monitor::*;
pub use ring::*;
pub use stream::*;
pub use timesync::*;
pub use transport::*;
