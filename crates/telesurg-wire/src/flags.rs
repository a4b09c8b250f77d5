//! Safety flag byte carried by instrument state records

use telesurg_core::SafetyStatus;

/// Safety flags (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SafetyFlags(pub u8);

impl SafetyFlags {
    pub const NONE: SafetyFlags = SafetyFlags(0);

    pub const IN_WORKSPACE: u8 = 0b0000_0001;
    pub const FORCE_LIMIT: u8 = 0b0000_0010;

    #[inline]
    pub fn new(bits: u8) -> Self {
        SafetyFlags(bits)
    }

    #[inline]
    pub fn in_workspace(self) -> bool {
        self.0 & Self::IN_WORKSPACE != 0
    }

    #[inline]
    pub fn force_limit(self) -> bool {
        self.0 & Self::FORCE_LIMIT != 0
    }

    #[inline]
    pub fn set_in_workspace(&mut self, value: bool) {
        if value {
            self.0 |= Self::IN_WORKSPACE;
        } else {
            self.0 &= !Self::IN_WORKSPACE;
        }
    }

    #[inline]
    pub fn set_force_limit(&mut self, value: bool) {
        if value {
            self.0 |= Self::FORCE_LIMIT;
        } else {
            self.0 &= !Self::FORCE_LIMIT;
        }
    }

    pub fn from_status(status: &SafetyStatus) -> Self {
        let mut flags = SafetyFlags::NONE;
        flags.set_in_workspace(status.in_workspace);
        flags.set_force_limit(status.force_limit);
        flags
    }
}

/// Quantize a collision risk in [0, 1] to one byte
#[inline]
pub fn encode_risk(risk: f32) -> u8 {
    if risk.is_nan() {
        return 0;
    }
    (risk.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[inline]
pub fn decode_risk(byte: u8) -> f32 {
    byte as f32 / 255.0
}
