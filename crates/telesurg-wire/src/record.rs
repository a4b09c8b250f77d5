//! Fixed-layout records
//!
//! Records are the message bodies after the type tag. All integers and floats
//! are little-endian; optional floats travel as NaN when absent.

use bytes::{Buf, BufMut};

use telesurg_core::{
    ButtonStates, HapticFeedback, InstrumentId, InstrumentState, MasterSample, Quaternion,
    SafetyStatus, SlaveCommand, TeleopError, TeleopResult, TissueType, Timestamp, Vec3,
};

use crate::{decode_risk, encode_risk, SafetyFlags};

/// A record with a fixed wire size
pub trait WireRecord: Sized {
    const WIRE_SIZE: usize;

    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Decode from the front of `buf`; extra trailing bytes are ignored
    fn decode(buf: &[u8]) -> TeleopResult<Self>;
}

#[inline]
fn ensure_len(buf: &[u8], expected: usize) -> TeleopResult<()> {
    if buf.len() < expected {
        Err(TeleopError::BufferTooShort {
            expected,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn put_vec3<B: BufMut>(buf: &mut B, v: Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

#[inline]
fn get_vec3<B: Buf>(buf: &mut B) -> Vec3 {
    Vec3::new(buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le())
}

#[inline]
fn put_quat<B: BufMut>(buf: &mut B, q: Quaternion) {
    buf.put_f32_le(q.w);
    buf.put_f32_le(q.x);
    buf.put_f32_le(q.y);
    buf.put_f32_le(q.z);
}

#[inline]
fn get_quat<B: Buf>(buf: &mut B) -> Quaternion {
    Quaternion::new(buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le())
}

#[inline]
fn put_opt_f32<B: BufMut>(buf: &mut B, v: Option<f32>) {
    buf.put_f32_le(v.unwrap_or(f32::NAN));
}

#[inline]
fn get_opt_f32<B: Buf>(buf: &mut B) -> Option<f32> {
    let v = buf.get_f32_le();
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

/// Instrument state body (50 bytes):
/// - Bytes 0-7: timestamp (µs)
/// - Bytes 8-11: instrument id
/// - Bytes 12-23: tip position (3×f32, mm)
/// - Bytes 24-39: orientation (w, x, y, z)
/// - Bytes 40-43: jaw angle (deg, NaN = none)
/// - Bytes 44-47: grasp force (N, NaN = none)
/// - Byte 48: safety flags
/// - Byte 49: collision risk (0-255)
///
/// Velocities and proximity alerts are local-only and decode as absent.
impl WireRecord for InstrumentState {
    const WIRE_SIZE: usize = 50;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.timestamp.as_micros());
        buf.put_u32_le(self.instrument_id.0);
        put_vec3(buf, self.tip_position);
        put_quat(buf, self.orientation);
        put_opt_f32(buf, self.jaw_angle);
        put_opt_f32(buf, self.grasp_force);
        buf.put_u8(SafetyFlags::from_status(&self.safety_status).0);
        buf.put_u8(encode_risk(self.safety_status.collision_risk));
    }

    fn decode(buf: &[u8]) -> TeleopResult<Self> {
        ensure_len(buf, Self::WIRE_SIZE)?;
        let mut cur = buf;

        let timestamp = Timestamp::from_micros(cur.get_u64_le());
        let instrument_id = InstrumentId::new(cur.get_u32_le());
        let tip_position = get_vec3(&mut cur);
        let orientation = get_quat(&mut cur);
        let jaw_angle = get_opt_f32(&mut cur);
        let grasp_force = get_opt_f32(&mut cur);
        let flags = SafetyFlags::new(cur.get_u8());
        let risk = decode_risk(cur.get_u8());

        Ok(InstrumentState {
            instrument_id,
            timestamp,
            tip_position,
            orientation,
            jaw_angle,
            grasp_force,
            linear_velocity: None,
            angular_velocity: None,
            safety_status: SafetyStatus {
                in_workspace: flags.in_workspace(),
                force_limit: flags.force_limit(),
                collision_risk: risk,
                ..SafetyStatus::default()
            },
        })
    }
}

/// Haptic feedback body (41 bytes):
/// - Bytes 0-7: timestamp
/// - Bytes 8-11: instrument id
/// - Bytes 12-23: tip force (N)
/// - Bytes 24-35: tip torque (N·mm)
/// - Bytes 36-39: grip force (N)
/// - Byte 40: tissue class (0 = no contact)
impl WireRecord for HapticFeedback {
    const WIRE_SIZE: usize = 41;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.timestamp.as_micros());
        buf.put_u32_le(self.instrument_id.0);
        put_vec3(buf, self.force);
        put_vec3(buf, self.torque);
        buf.put_f32_le(self.grip_force);
        buf.put_u8(self.tissue.map_or(0, TissueType::to_u8));
    }

    fn decode(buf: &[u8]) -> TeleopResult<Self> {
        ensure_len(buf, Self::WIRE_SIZE)?;
        let mut cur = buf;

        Ok(HapticFeedback {
            timestamp: Timestamp::from_micros(cur.get_u64_le()),
            instrument_id: InstrumentId::new(cur.get_u32_le()),
            force: get_vec3(&mut cur),
            torque: get_vec3(&mut cur),
            grip_force: cur.get_f32_le(),
            tissue: TissueType::from_u8(cur.get_u8()),
        })
    }
}

/// Surgeon command body (57 bytes)
///
/// From the console bridge the jaw field carries the raw gripper aperture
/// (0..1); from the control site it carries a jaw angle in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurgeonCommand {
    pub timestamp: Timestamp,
    pub instrument_id: InstrumentId,
    pub position: Vec3,
    pub orientation: Quaternion,
    pub jaw: f32,
    pub velocity: Vec3,
    pub buttons: ButtonStates,
}

impl SurgeonCommand {
    pub fn from_command(command: &SlaveCommand, timestamp: Timestamp) -> Self {
        SurgeonCommand {
            timestamp,
            instrument_id: command.instrument_id,
            position: command.position,
            orientation: command.orientation,
            jaw: command.jaw_angle,
            velocity: command.velocity,
            buttons: command.buttons,
        }
    }

    pub fn from_master_sample(instrument_id: InstrumentId, sample: &MasterSample) -> Self {
        SurgeonCommand {
            timestamp: sample.timestamp,
            instrument_id,
            position: sample.position,
            orientation: sample.orientation,
            jaw: sample.gripper,
            velocity: Vec3::ZERO,
            buttons: sample.buttons,
        }
    }

    pub fn to_command(&self) -> SlaveCommand {
        SlaveCommand {
            instrument_id: self.instrument_id,
            position: self.position,
            orientation: self.orientation,
            jaw_angle: self.jaw,
            velocity: self.velocity,
            buttons: self.buttons,
        }
    }

    pub fn to_master_sample(&self) -> MasterSample {
        MasterSample {
            timestamp: self.timestamp,
            position: self.position,
            orientation: self.orientation,
            gripper: self.jaw.clamp(0.0, 1.0),
            buttons: self.buttons,
        }
    }
}

impl WireRecord for SurgeonCommand {
    const WIRE_SIZE: usize = 57;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.timestamp.as_micros());
        buf.put_u32_le(self.instrument_id.0);
        put_vec3(buf, self.position);
        put_quat(buf, self.orientation);
        buf.put_f32_le(self.jaw);
        put_vec3(buf, self.velocity);
        buf.put_u8(self.buttons.0);
    }

    fn decode(buf: &[u8]) -> TeleopResult<Self> {
        ensure_len(buf, Self::WIRE_SIZE)?;
        let mut cur = buf;

        Ok(SurgeonCommand {
            timestamp: Timestamp::from_micros(cur.get_u64_le()),
            instrument_id: InstrumentId::new(cur.get_u32_le()),
            position: get_vec3(&mut cur),
            orientation: get_quat(&mut cur),
            jaw: cur.get_f32_le(),
            velocity: get_vec3(&mut cur),
            buttons: ButtonStates::new(cur.get_u8()),
        })
    }
}

/// Ping body (12 bytes): sequence id + sender timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub seq: u32,
    pub origin: Timestamp,
}

impl WireRecord for Ping {
    const WIRE_SIZE: usize = 12;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.seq);
        buf.put_u64_le(self.origin.as_micros());
    }

    fn decode(buf: &[u8]) -> TeleopResult<Self> {
        ensure_len(buf, Self::WIRE_SIZE)?;
        let mut cur = buf;
        Ok(Ping {
            seq: cur.get_u32_le(),
            origin: Timestamp::from_micros(cur.get_u64_le()),
        })
    }
}

/// Pong body (28 bytes): echoed ping plus responder receive/transmit times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub seq: u32,
    pub origin: Timestamp,
    pub received: Timestamp,
    pub transmitted: Timestamp,
}

impl Pong {
    pub fn answer(ping: &Ping, received: Timestamp, transmitted: Timestamp) -> Self {
        Pong {
            seq: ping.seq,
            origin: ping.origin,
            received,
            transmitted,
        }
    }
}

impl WireRecord for Pong {
    const WIRE_SIZE: usize = 28;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.seq);
        buf.put_u64_le(self.origin.as_micros());
        buf.put_u64_le(self.received.as_micros());
        buf.put_u64_le(self.transmitted.as_micros());
    }

    fn decode(buf: &[u8]) -> TeleopResult<Self> {
        ensure_len(buf, Self::WIRE_SIZE)?;
        let mut cur = buf;
        Ok(Pong {
            seq: cur.get_u32_le(),
            origin: Timestamp::from_micros(cur.get_u64_le()),
            received: Timestamp::from_micros(cur.get_u64_le()),
            transmitted: Timestamp::from_micros(cur.get_u64_le()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_state_record_size() {
        let state = InstrumentState::at_rest(InstrumentId::new(3), Vec3::new(1.0, 2.0, 3.0), Timestamp::from_micros(42));
        let mut buf = BytesMut::new();
        state.encode(&mut buf);
        assert_eq!(buf.len(), InstrumentState::WIRE_SIZE);
    }

    #[test]
    fn test_absent_optionals_survive() {
        let mut state = InstrumentState::at_rest(InstrumentId::new(1), Vec3::ZERO, Timestamp::ZERO);
        state.jaw_angle = None;
        state.grasp_force = Some(2.5);

        let mut buf = BytesMut::new();
        state.encode(&mut buf);
        let decoded = InstrumentState::decode(&buf).unwrap();
        assert_eq!(decoded.jaw_angle, None);
        assert_eq!(decoded.grasp_force, Some(2.5));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let err = HapticFeedback::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            TeleopError::BufferTooShort {
                expected: HapticFeedback::WIRE_SIZE,
                actual: 10
            }
        );
    }

    #[test]
    fn test_surgeon_command_as_master_sample() {
        let cmd = SurgeonCommand {
            timestamp: Timestamp::from_millis(5),
            instrument_id: InstrumentId::new(0),
            position: Vec3::new(10.0, 0.0, 0.0),
            orientation: Quaternion::IDENTITY,
            jaw: 0.4,
            velocity: Vec3::ZERO,
            buttons: ButtonStates::new(ButtonStates::CLUTCH),
        };
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        assert_eq!(buf.len(), SurgeonCommand::WIRE_SIZE);

        let sample = SurgeonCommand::decode(&buf).unwrap().to_master_sample();
        assert_eq!(sample.gripper, 0.4);
        assert!(sample.buttons.clutch());
    }
}
