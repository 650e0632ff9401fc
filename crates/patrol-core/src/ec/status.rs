//! EC host-command status codes.
//!
//! These values are part of the firmware contract and travel in the
//! 16-bit `result` field of the response header.

use serde::{Deserialize, Serialize};

/// Result of one EC host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcStatus {
    /// Host command was successful.
    Success,
    /// The specified command id is not recognized or supported.
    InvalidCommand,
    /// Generic error.
    Error,
    /// One or more of the input request parameters is invalid.
    InvalidParam,
    /// Host command is not permitted.
    AccessDenied,
    /// Response was invalid.
    InvalidResponse,
    /// Host command id version unsupported.
    InvalidVersion,
    /// Checksum did not match.
    InvalidChecksum,
    /// A host command is currently being processed.
    InProgress,
    /// Requested information is currently unavailable.
    Unavailable,
    /// Timeout during processing.
    Timeout,
    /// Data or table overflow.
    Overflow,
    /// Header is invalid or unsupported.
    InvalidHeader,
    /// Did not receive all expected request data.
    RequestTruncated,
    /// Response was too big to send within one response packet.
    ResponseTooBig,
    /// Error on underlying communication bus.
    BusError,
    /// System busy, retry later.
    Busy,
    /// Header version invalid.
    InvalidHeaderVersion,
    /// Header CRC invalid.
    InvalidHeaderCrc,
    /// Data CRC invalid.
    InvalidDataCrc,
    /// Can't resend response.
    DupUnavailable,
}

impl EcStatus {
    /// Maps the wire `result` field to a status.
    ///
    /// Values outside the firmware catalog map to [`EcStatus::Error`];
    /// newer firmware may grow codes this build does not know.
    #[must_use]
    pub fn from_wire(value: u16) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::InvalidCommand,
            2 => Self::Error,
            3 => Self::InvalidParam,
            4 => Self::AccessDenied,
            5 => Self::InvalidResponse,
            6 => Self::InvalidVersion,
            7 => Self::InvalidChecksum,
            8 => Self::InProgress,
            9 => Self::Unavailable,
            10 => Self::Timeout,
            11 => Self::Overflow,
            12 => Self::InvalidHeader,
            13 => Self::RequestTruncated,
            14 => Self::ResponseTooBig,
            15 => Self::BusError,
            16 => Self::Busy,
            17 => Self::InvalidHeaderVersion,
            18 => Self::InvalidHeaderCrc,
            19 => Self::InvalidDataCrc,
            20 => Self::DupUnavailable,
            _ => Self::Error,
        }
    }

    /// The wire value of this status.
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::InvalidCommand => 1,
            Self::Error => 2,
            Self::InvalidParam => 3,
            Self::AccessDenied => 4,
            Self::InvalidResponse => 5,
            Self::InvalidVersion => 6,
            Self::InvalidChecksum => 7,
            Self::InProgress => 8,
            Self::Unavailable => 9,
            Self::Timeout => 10,
            Self::Overflow => 11,
            Self::InvalidHeader => 12,
            Self::RequestTruncated => 13,
            Self::ResponseTooBig => 14,
            Self::BusError => 15,
            Self::Busy => 16,
            Self::InvalidHeaderVersion => 17,
            Self::InvalidHeaderCrc => 18,
            Self::InvalidDataCrc => 19,
            Self::DupUnavailable => 20,
        }
    }

    /// Returns `true` for [`EcStatus::Success`].
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for EcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?} ({})", self.to_wire())
    }
}
