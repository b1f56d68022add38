use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::types::SupportedPowerRange;

/// Length of the Supported Power Range characteristic value
pub const POWER_RANGE_SIZE: usize = 6;

/// Opcode prefixing every control point indication response
pub const RESPONSE_OPCODE: u8 = 0x80;

/// Fitness Machine Control Point opcodes used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Take ownership of the control point
    RequestControl = 0x00,
    /// Reset the fitness machine
    Reset = 0x01,
    /// Set an absolute power target
    SetTargetPower = 0x05,
    /// Start or resume the session
    StartResume = 0x07,
}

impl OpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::StartResume),
            _ => None,
        }
    }
}

/// A command written to the Fitness Machine Control Point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointCommand {
    /// Request control (0x00)
    RequestControl,
    /// Reset (0x01)
    Reset,
    /// Set target power (0x05) with signed watts
    SetTargetPower(i16),
    /// Start or resume (0x07)
    StartResume,
}

impl ControlPointCommand {
    /// Opcode of this command
    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        match self {
            Self::RequestControl => OpCode::RequestControl,
            Self::Reset => OpCode::Reset,
            Self::SetTargetPower(_) => OpCode::SetTargetPower,
            Self::StartResume => OpCode::StartResume,
        }
    }

    /// Serialize to the on-wire representation
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(self.opcode() as u8);
        if let Self::SetTargetPower(watts) = self {
            buf.put_i16_le(*watts);
        }
        buf.freeze()
    }
}

/// Result codes carried by control point responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Command accepted
    Success,
    /// Opcode not supported by the machine
    OpCodeNotSupported,
    /// Parameter out of range
    InvalidParameter,
    /// Machine failed to carry out the command
    OperationFailed,
    /// Client does not own the control point
    ControlNotPermitted,
    /// Any other code
    Unknown(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::OpCodeNotSupported => write!(f, "OpCodeNotSupported"),
            Self::InvalidParameter => write!(f, "InvalidParameter"),
            Self::OperationFailed => write!(f, "OperationFailed"),
            Self::ControlNotPermitted => write!(f, "ControlNotPermitted"),
            Self::Unknown(code) => write!(f, "Unknown(0x{code:02X})"),
        }
    }
}

/// A control point indication answering a previously written command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Opcode of the command being answered
    pub request_opcode: u8,
    /// Outcome reported by the machine
    pub result: ResultCode,
}

impl ControlPointResponse {
    /// Parse an indication; returns `None` for anything that is not a response
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 || data[0] != RESPONSE_OPCODE {
            return None;
        }
        Some(Self {
            request_opcode: data[1],
            result: ResultCode::from(data[2]),
        })
    }
}

impl SupportedPowerRange {
    /// Parse the Supported Power Range characteristic
    ///
    /// Layout: signed 16-bit min, signed 16-bit max, unsigned 16-bit increment,
    /// all little-endian. Returns `None` when the payload is too short.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < POWER_RANGE_SIZE {
            return None;
        }
        let mut buf = data;
        let min_watts = buf.get_i16_le();
        let max_watts = buf.get_i16_le();
        let increment_watts = buf.get_u16_le().max(1);
        Some(Self {
            min_watts,
            max_watts,
            increment_watts,
        })
    }

    /// Clamp and align a requested target to this range
    #[must_use]
    pub fn normalize(&self, requested_watts: i32) -> i32 {
        normalize_power_target(
            requested_watts,
            i32::from(self.min_watts),
            i32::from(self.max_watts),
            i32::from(self.increment_watts),
        )
    }
}

/// Clamp `requested_watts` into `[min, max]` and round it to the nearest
/// multiple of `increment` counted from `min`.
///
/// An increment of zero or less is treated as 1. Halfway values round up.
#[must_use]
pub fn normalize_power_target(requested_watts: i32, min: i32, max: i32, increment: i32) -> i32 {
    let increment = i64::from(increment.max(1));
    let (min, max) = (i64::from(min), i64::from(max));
    let clamp = |v: i64| v.max(min).min(max);

    let offset = clamp(i64::from(requested_watts)) - min;
    let steps = (2 * offset + increment).div_euclid(2 * increment);
    let normalized = clamp(min + steps * increment);
    // clamp keeps us within the i32 inputs
    i32::try_from(normalized).unwrap_or(requested_watts)
}
