//! Session configuration consumed at construction
//!
//! Configuration is immutable once a session is built. Every struct has a
//! `Default` suited to a dual-arm setup on a local network; named presets cover
//! the other common cases.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{InstrumentId, TeleopError, TeleopResult, Vec3, MAX_INSTRUMENTS};

/// Instrument family, determines jaw range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    NeedleDriver,
    Grasper,
    Scissors,
}

impl InstrumentType {
    /// Fully open jaw angle, degrees
    pub fn max_jaw_angle_deg(self) -> f32 {
        match self {
            InstrumentType::NeedleDriver => 45.0,
            InstrumentType::Grasper => 75.0,
            InstrumentType::Scissors => 55.0,
        }
    }
}

/// Wrist articulation limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Articulation {
    pub wristed: bool,
    /// Max pitch/yaw deflection, degrees
    pub max_deflection_deg: f32,
}

impl Default for Articulation {
    fn default() -> Self {
        Articulation {
            wristed: true,
            max_deflection_deg: 90.0,
        }
    }
}

/// One patient-side instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub id: InstrumentId,
    pub instrument_type: InstrumentType,
    /// 3 position + 3 orientation + 1 jaw
    pub dof: usize,
    pub articulation: Articulation,
    /// Bounding sphere radius used for collision checks, mm
    pub bounding_radius_mm: f32,
    /// Tip position at power-up, mm
    pub home_position: Vec3,
    /// Grasp force at which `force_limit` is raised, N
    pub max_grasp_force_n: f32,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        InstrumentConfig {
            id: InstrumentId::ZERO,
            instrument_type: InstrumentType::Grasper,
            dof: 7,
            articulation: Articulation::default(),
            bounding_radius_mm: 5.0,
            home_position: Vec3::ZERO,
            max_grasp_force_n: 10.0,
        }
    }
}

impl InstrumentConfig {
    pub fn new(id: u32, instrument_type: InstrumentType, home_position: Vec3) -> Self {
        InstrumentConfig {
            id: InstrumentId::new(id),
            instrument_type,
            home_position,
            ..Default::default()
        }
    }
}

/// Endoscope parameters, passed through to visualization collaborators
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    pub field_of_view_deg: f32,
    pub resolution: (u32, u32),
    pub frame_rate: u32,
    pub stereo: bool,
}

impl Default for CameraParameters {
    fn default() -> Self {
        CameraParameters {
            field_of_view_deg: 70.0,
            resolution: (1920, 1080),
            frame_rate: 60,
            stereo: true,
        }
    }
}

/// Robot-side session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfiguration {
    pub arm_count: usize,
    pub instruments: Vec<InstrumentConfig>,
    pub camera: CameraParameters,
    /// Master-to-slave motion ratio, 1..=10
    pub motion_scaling: f32,
    /// Gripper aperture below which the jaw stays closed, 0..1
    pub gripper_dead_zone: f32,
    pub tick_period_us: u64,
    pub heartbeat_timeout_ms: u64,
    /// Control errors tolerated per session before emergency stop
    pub error_budget: u32,
}

impl Default for RobotConfiguration {
    fn default() -> Self {
        RobotConfiguration {
            arm_count: 2,
            instruments: vec![
                InstrumentConfig::new(0, InstrumentType::NeedleDriver, Vec3::new(-40.0, 0.0, 0.0)),
                InstrumentConfig::new(1, InstrumentType::Grasper, Vec3::new(40.0, 0.0, 0.0)),
            ],
            camera: CameraParameters::default(),
            motion_scaling: 3.0,
            gripper_dead_zone: 0.05,
            tick_period_us: 1000,
            heartbeat_timeout_ms: 100,
            error_budget: 10,
        }
    }
}

impl RobotConfiguration {
    /// Three arms: needle driver, grasper and scissors
    pub fn three_arm() -> Self {
        RobotConfiguration {
            arm_count: 3,
            instruments: vec![
                InstrumentConfig::new(0, InstrumentType::NeedleDriver, Vec3::new(-50.0, 0.0, 0.0)),
                InstrumentConfig::new(1, InstrumentType::Grasper, Vec3::new(50.0, 0.0, 0.0)),
                InstrumentConfig::new(2, InstrumentType::Scissors, Vec3::new(0.0, 50.0, 0.0)),
            ],
            ..Default::default()
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(self.tick_period_us)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn validate(&self) -> TeleopResult<()> {
        if self.arm_count == 0 || self.arm_count > MAX_INSTRUMENTS {
            return Err(TeleopError::InvalidConfig(format!(
                "arm_count must be 1..={}, got {}",
                MAX_INSTRUMENTS, self.arm_count
            )));
        }
        if self.instruments.len() != self.arm_count {
            return Err(TeleopError::InvalidConfig(format!(
                "arm_count {} does not match {} instrument entries",
                self.arm_count,
                self.instruments.len()
            )));
        }
        for (i, inst) in self.instruments.iter().enumerate() {
            if self.instruments[..i].iter().any(|o| o.id == inst.id) {
                return Err(TeleopError::InvalidConfig(format!("duplicate instrument id {}", inst.id)));
            }
            if inst.dof == 0 {
                return Err(TeleopError::InvalidConfig(format!("{} has no DOF", inst.id)));
            }
        }
        if !(1.0..=10.0).contains(&self.motion_scaling) {
            return Err(TeleopError::InvalidConfig(format!(
                "motion_scaling must be within 1..=10, got {}",
                self.motion_scaling
            )));
        }
        if !(0.0..1.0).contains(&self.gripper_dead_zone) {
            return Err(TeleopError::InvalidConfig(format!(
                "gripper_dead_zone must be within [0, 1), got {}",
                self.gripper_dead_zone
            )));
        }
        if self.tick_period_us == 0 {
            return Err(TeleopError::InvalidConfig("tick_period_us must be > 0".into()));
        }
        Ok(())
    }
}

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    /// Unordered, no retransmission
    Datagram,
    /// Ordered, reconnecting
    Ordered,
    /// Datagram first, ordered if the datagram probe fails
    Auto,
}

/// What the sender optimizes for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// One datagram per instrument per tick
    Latency,
    /// All instruments of a tick batched into one datagram
    Throughput,
}

/// Forward prediction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionAlgorithm {
    Linear,
    Regression,
    Polynomial,
    /// Chosen per prediction from recent motion statistics
    Adaptive,
}

/// Streaming session parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingParameters {
    pub protocol: StreamProtocol,
    pub target_latency_ms: f32,
    pub max_latency_ms: f32,
    /// 0 (off) to 9
    pub compression_level: u8,
    pub priority: PriorityMode,
    pub bitrate_min_kbps: u32,
    pub bitrate_max_kbps: u32,
    pub prediction: PredictionAlgorithm,
    pub lead_time_ms: f32,
}

impl Default for StreamingParameters {
    fn default() -> Self {
        StreamingParameters {
            protocol: StreamProtocol::Auto,
            target_latency_ms: 20.0,
            max_latency_ms: 100.0,
            compression_level: 0,
            priority: PriorityMode::Latency,
            bitrate_min_kbps: 500,
            bitrate_max_kbps: 20_000,
            prediction: PredictionAlgorithm::Adaptive,
            lead_time_ms: 20.0,
        }
    }
}

impl StreamingParameters {
    /// Long-haul link: higher latency budget, batched sends
    pub fn long_distance() -> Self {
        StreamingParameters {
            target_latency_ms: 80.0,
            max_latency_ms: 250.0,
            priority: PriorityMode::Throughput,
            bitrate_max_kbps: 8_000,
            lead_time_ms: 80.0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> TeleopResult<()> {
        if self.target_latency_ms <= 0.0 || self.target_latency_ms > self.max_latency_ms {
            return Err(TeleopError::InvalidConfig(format!(
                "target latency {} ms must be positive and <= max latency {} ms",
                self.target_latency_ms, self.max_latency_ms
            )));
        }
        if self.bitrate_min_kbps == 0 || self.bitrate_min_kbps > self.bitrate_max_kbps {
            return Err(TeleopError::InvalidConfig(format!(
                "bitrate bounds {}..{} kbps are invalid",
                self.bitrate_min_kbps, self.bitrate_max_kbps
            )));
        }
        if self.compression_level > 9 {
            return Err(TeleopError::InvalidConfig(format!(
                "compression_level must be 0..=9, got {}",
                self.compression_level
            )));
        }
        if self.lead_time_ms < 0.0 {
            return Err(TeleopError::InvalidConfig("lead_time_ms must be >= 0".into()));
        }
        Ok(())
    }
}
