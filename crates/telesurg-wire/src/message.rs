//! Tagged telemetry messages

use bytes::{BufMut, Bytes, BytesMut};

use telesurg_core::{
    HapticFeedback, InstrumentState, TeleopError, TeleopResult, Timestamp, MAX_INSTRUMENTS,
};

use crate::{Ping, Pong, SurgeonCommand, WireRecord};

/// Message type tag (byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    InstrumentState = 0x01,
    HapticFeedback = 0x02,
    SurgeonCommand = 0x03,
    BatchUpdate = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    EmergencyStop = 0xFF,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(MessageType::InstrumentState),
            0x02 => Some(MessageType::HapticFeedback),
            0x03 => Some(MessageType::SurgeonCommand),
            0x04 => Some(MessageType::BatchUpdate),
            0x05 => Some(MessageType::Ping),
            0x06 => Some(MessageType::Pong),
            0xFF => Some(MessageType::EmergencyStop),
            _ => None,
        }
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Send priority, higher goes first
    pub fn priority(self) -> u8 {
        match self {
            MessageType::EmergencyStop => 255,
            MessageType::SurgeonCommand => 200,
            MessageType::HapticFeedback => 150,
            MessageType::InstrumentState | MessageType::BatchUpdate => 100,
            MessageType::Ping | MessageType::Pong => 50,
        }
    }
}

/// Batch header size after the tag: timestamp + count
const BATCH_HEADER_SIZE: usize = 9;

/// All arms of one tick in a single message
#[derive(Debug, Clone, PartialEq)]
pub struct BatchUpdate {
    pub timestamp: Timestamp,
    states: Vec<InstrumentState>,
}

impl BatchUpdate {
    pub fn new(timestamp: Timestamp, states: &[InstrumentState]) -> TeleopResult<Self> {
        if states.len() > MAX_INSTRUMENTS {
            return Err(TeleopError::InvalidWireFormat(format!(
                "Batch of {} states exceeds {}",
                states.len(),
                MAX_INSTRUMENTS
            )));
        }
        Ok(BatchUpdate {
            timestamp,
            states: states.to_vec(),
        })
    }

    pub fn states(&self) -> &[InstrumentState] {
        &self.states
    }

    pub fn into_states(self) -> Vec<InstrumentState> {
        self.states
    }

    fn wire_size(&self) -> usize {
        BATCH_HEADER_SIZE + self.states.len() * InstrumentState::WIRE_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.timestamp.as_micros());
        buf.put_u8(self.states.len() as u8);
        for state in &self.states {
            state.encode(buf);
        }
    }

    fn decode(buf: &[u8]) -> TeleopResult<Self> {
        if buf.len() < BATCH_HEADER_SIZE {
            return Err(TeleopError::BufferTooShort {
                expected: BATCH_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[..8]);
        let timestamp = Timestamp::from_micros(u64::from_le_bytes(ts));
        let count = buf[8] as usize;
        if count > MAX_INSTRUMENTS {
            return Err(TeleopError::InvalidWireFormat(format!(
                "Batch count {} exceeds {}",
                count, MAX_INSTRUMENTS
            )));
        }

        let expected = BATCH_HEADER_SIZE + count * InstrumentState::WIRE_SIZE;
        if buf.len() < expected {
            return Err(TeleopError::BufferTooShort {
                expected,
                actual: buf.len(),
            });
        }

        let states = buf[BATCH_HEADER_SIZE..expected]
            .chunks_exact(InstrumentState::WIRE_SIZE)
            .map(InstrumentState::decode)
            .collect::<TeleopResult<Vec<_>>>()?;

        Ok(BatchUpdate { timestamp, states })
    }
}

/// Telemetry message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    InstrumentState(InstrumentState),
    HapticFeedback(HapticFeedback),
    SurgeonCommand(SurgeonCommand),
    BatchUpdate(BatchUpdate),
    Ping(Ping),
    Pong(Pong),
    EmergencyStop,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::InstrumentState(_) => MessageType::InstrumentState,
            Message::HapticFeedback(_) => MessageType::HapticFeedback,
            Message::SurgeonCommand(_) => MessageType::SurgeonCommand,
            Message::BatchUpdate(_) => MessageType::BatchUpdate,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::EmergencyStop => MessageType::EmergencyStop,
        }
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.message_type().priority()
    }

    /// Total encoded size including the tag
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Message::InstrumentState(_) => InstrumentState::WIRE_SIZE,
            Message::HapticFeedback(_) => HapticFeedback::WIRE_SIZE,
            Message::SurgeonCommand(_) => SurgeonCommand::WIRE_SIZE,
            Message::BatchUpdate(batch) => batch.wire_size(),
            Message::Ping(_) => Ping::WIRE_SIZE,
            Message::Pong(_) => Pong::WIRE_SIZE,
            Message::EmergencyStop => 0,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.message_type().to_u8());
        match self {
            Message::InstrumentState(state) => state.encode(buf),
            Message::HapticFeedback(feedback) => feedback.encode(buf),
            Message::SurgeonCommand(command) => command.encode(buf),
            Message::BatchUpdate(batch) => batch.encode(buf),
            Message::Ping(ping) => ping.encode(buf),
            Message::Pong(pong) => pong.encode(buf),
            Message::EmergencyStop => {}
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> TeleopResult<Self> {
        let (&tag, body) = buf.split_first().ok_or(TeleopError::BufferTooShort {
            expected: 1,
            actual: 0,
        })?;

        let msg_type = MessageType::from_u8(tag).ok_or(TeleopError::UnknownMessageType(tag))?;

        let msg = match msg_type {
            MessageType::InstrumentState => Message::InstrumentState(InstrumentState::decode(body)?),
            MessageType::HapticFeedback => Message::HapticFeedback(HapticFeedback::decode(body)?),
            MessageType::SurgeonCommand => Message::SurgeonCommand(SurgeonCommand::decode(body)?),
            MessageType::BatchUpdate => Message::BatchUpdate(BatchUpdate::decode(body)?),
            MessageType::Ping => Message::Ping(Ping::decode(body)?),
            MessageType::Pong => Message::Pong(Pong::decode(body)?),
            MessageType::EmergencyStop => Message::EmergencyStop,
        };

        Ok(msg)
    }

    /// True for the single-byte emergency stop, checked without a full decode
    #[inline]
    pub fn is_emergency_stop(buf: &[u8]) -> bool {
        buf.first() == Some(&MessageType::EmergencyStop.to_u8())
    }
}
