//! Instrument state, commands and per-tick records
//!
//! Everything read inside the control tick is `Copy` so snapshots are taken by
//! value without allocating.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{InstrumentId, Quaternion, Timestamp, Vec3, MAX_INSTRUMENTS};

/// Severity of a proximity alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    /// Inside the damping band
    Caution,
    /// Below the minimum separation
    Critical,
}

/// Another instrument is close to this one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityAlert {
    pub other: InstrumentId,
    /// Surface separation (center distance minus both bounding radii), mm
    pub separation_mm: f32,
    pub level: AlertLevel,
}

/// Fixed-capacity alert list (one slot per possible other arm)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProximityAlerts {
    slots: [Option<ProximityAlert>; MAX_INSTRUMENTS],
    len: usize,
}

impl ProximityAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when full
    pub fn push(&mut self, alert: ProximityAlert) -> bool {
        if self.len >= MAX_INSTRUMENTS {
            return false;
        }
        self.slots[self.len] = Some(alert);
        self.len += 1;
        true
    }

    pub fn clear(&mut self) {
        self.slots = [None; MAX_INSTRUMENTS];
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProximityAlert> {
        self.slots[..self.len].iter().flatten()
    }

    pub fn most_severe(&self) -> Option<AlertLevel> {
        self.iter().map(|a| a.level).max()
    }
}

/// Safety status, recomputed every tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyStatus {
    pub in_workspace: bool,
    /// 0.0 (clear) to 1.0 (at minimum separation)
    pub collision_risk: f32,
    pub proximity_alerts: ProximityAlerts,
    /// Grasp force at or above the instrument limit
    pub force_limit: bool,
}

impl Default for SafetyStatus {
    fn default() -> Self {
        SafetyStatus {
            in_workspace: true,
            collision_risk: 0.0,
            proximity_alerts: ProximityAlerts::new(),
            force_limit: false,
        }
    }
}

/// Coarse tissue classification from contact force
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TissueType {
    SoftTissue = 1,
    Vessel = 2,
    Tumor = 3,
    Bone = 4,
}

impl TissueType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(TissueType::SoftTissue),
            2 => Some(TissueType::Vessel),
            3 => Some(TissueType::Tumor),
            4 => Some(TissueType::Bone),
            _ => None,
        }
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Snapshot of one instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentState {
    pub instrument_id: InstrumentId,
    pub timestamp: Timestamp,
    /// Tip position, mm
    pub tip_position: Vec3,
    pub orientation: Quaternion,
    /// Jaw opening, degrees
    pub jaw_angle: Option<f32>,
    /// Mean jaw sensor force, N
    pub grasp_force: Option<f32>,
    /// mm/s
    pub linear_velocity: Option<Vec3>,
    /// rad/s
    pub angular_velocity: Option<Vec3>,
    pub safety_status: SafetyStatus,
}

impl InstrumentState {
    /// Instrument at rest at `position` with identity orientation
    pub fn at_rest(instrument_id: InstrumentId, position: Vec3, timestamp: Timestamp) -> Self {
        InstrumentState {
            instrument_id,
            timestamp,
            tip_position: position,
            orientation: Quaternion::IDENTITY,
            jaw_angle: Some(0.0),
            grasp_force: Some(0.0),
            linear_velocity: Some(Vec3::ZERO),
            angular_velocity: Some(Vec3::ZERO),
            safety_status: SafetyStatus::default(),
        }
    }

    /// Unit orientation and finite position
    pub fn is_valid(&self) -> bool {
        self.orientation.is_unit() && self.tip_position.is_finite()
    }
}

/// Console buttons, one bit each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct ButtonStates(pub u8);

impl ButtonStates {
    pub const NONE: ButtonStates = ButtonStates(0);

    pub const CLUTCH: u8 = 0b0000_0001;
    pub const CAMERA: u8 = 0b0000_0010;
    pub const ENERGY: u8 = 0b0000_0100;
    pub const ARM_SWAP: u8 = 0b0000_1000;

    #[inline]
    pub fn new(bits: u8) -> Self {
        ButtonStates(bits)
    }

    #[inline]
    pub fn is_pressed(self, button: u8) -> bool {
        self.0 & button != 0
    }

    #[inline]
    pub fn clutch(self) -> bool {
        self.is_pressed(Self::CLUTCH)
    }
}

/// One command for one arm, produced and consumed within a single tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaveCommand {
    pub instrument_id: InstrumentId,
    /// Target tip position, mm
    pub position: Vec3,
    pub orientation: Quaternion,
    /// Target jaw angle, degrees
    pub jaw_angle: f32,
    /// Commanded velocity, mm/s
    pub velocity: Vec3,
    pub buttons: ButtonStates,
}

impl SlaveCommand {
    /// Keep the arm where it is
    pub fn hold(state: &InstrumentState) -> Self {
        SlaveCommand {
            instrument_id: state.instrument_id,
            position: state.tip_position,
            orientation: state.orientation,
            jaw_angle: state.jaw_angle.unwrap_or(0.0),
            velocity: Vec3::ZERO,
            buttons: ButtonStates::NONE,
        }
    }

    pub fn is_hold(&self) -> bool {
        self.velocity == Vec3::ZERO
    }
}

/// One sample from a master manipulator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterSample {
    pub timestamp: Timestamp,
    /// Console frame, mm
    pub position: Vec3,
    pub orientation: Quaternion,
    /// Gripper aperture, 0.0 (closed) to 1.0 (open)
    pub gripper: f32,
    pub buttons: ButtonStates,
}

/// Force feedback for the surgeon's hand
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticFeedback {
    pub instrument_id: InstrumentId,
    pub timestamp: Timestamp,
    /// Tip contact force, N
    pub force: Vec3,
    /// Tip torque, N·mm
    pub torque: Vec3,
    /// Jaw grasp force, N
    pub grip_force: f32,
    pub tissue: Option<TissueType>,
}

/// Kinematic parameters recorded during calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinematicParameters {
    /// Measured (min, max) travel per DOF
    pub range_of_motion: Vec<(f32, f32)>,
    /// Zero offset per DOF
    pub joint_offsets: Vec<f32>,
}

/// Calibration record for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub tool_center_point: Vec3,
    pub kinematic_parameters: KinematicParameters,
    pub last_calibration: Timestamp,
    /// Worst tracking error seen during the range test, mm (or rad)
    pub accuracy: f32,
}

/// System-level session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemState {
    Idle,
    Ready,
    Operating,
    Error,
    EmergencyStop,
}

impl SystemState {
    pub fn is_terminal(self) -> bool {
        self == SystemState::EmergencyStop
    }

    /// States in which the control loop drives the arms
    pub fn is_active(self) -> bool {
        matches!(self, SystemState::Operating | SystemState::Error)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemState::Idle => "idle",
            SystemState::Ready => "ready",
            SystemState::Operating => "operating",
            SystemState::Error => "error",
            SystemState::EmergencyStop => "emergency-stop",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(id: u32) -> ProximityAlert {
        ProximityAlert {
            other: InstrumentId::new(id),
            separation_mm: 20.0,
            level: AlertLevel::Caution,
        }
    }

    #[test]
    fn test_alerts_capacity() {
        let mut alerts = ProximityAlerts::new();
        for i in 0..MAX_INSTRUMENTS as u32 {
            assert!(alerts.push(alert(i)));
        }
        assert!(!alerts.push(alert(99)));
        assert_eq!(alerts.len(), MAX_INSTRUMENTS);

        alerts.clear();
        assert!(alerts.is_empty());
        assert_eq!(alerts.iter().count(), 0);
    }

    #[test]
    fn test_most_severe() {
        let mut alerts = ProximityAlerts::new();
        alerts.push(alert(1));
        alerts.push(ProximityAlert {
            level: AlertLevel::Critical,
            ..alert(2)
        });
        assert_eq!(alerts.most_severe(), Some(AlertLevel::Critical));
    }

    #[test]
    fn test_hold_command_has_zero_velocity() {
        let state = InstrumentState::at_rest(InstrumentId::new(1), Vec3::new(1.0, 2.0, 3.0), Timestamp::ZERO);
        let hold = SlaveCommand::hold(&state);
        assert!(hold.is_hold());
        assert_eq!(hold.position, state.tip_position);
    }

    #[test]
    fn test_tissue_u8_roundtrip() {
        for t in [TissueType::SoftTissue, TissueType::Vessel, TissueType::Tumor, TissueType::Bone] {
            assert_eq!(TissueType::from_u8(t.to_u8()), Some(t));
        }
        assert_eq!(TissueType::from_u8(0), None);
    }
}
