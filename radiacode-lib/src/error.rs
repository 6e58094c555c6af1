use crate::command::Opcode;
use nusb::transfer::TransferError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// The primary error type for the `radiacode-lib` library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("RadiaCode device not found. Is it connected?")]
    DeviceNotFound,

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[source] Box<Error>),

    #[error("Incompatible firmware version {major}.{minor}, >= 4.8 required")]
    IncompatibleFirmware { major: u16, minor: u16 },

    #[error("USB transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Also carries USB errors, which `nusb` reports as `io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("No response to {opcode} within {after:?}")]
    Timeout {
        opcode: Opcode,
        after: Duration,
        /// The command mutates device state and may or may not have been applied.
        state_unknown: bool,
        /// Last invalid input discarded while waiting, if any.
        #[source]
        discarded: Option<FrameError>,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid parameter: {0}")]
    Validation(String),

    #[error("Device rejected {opcode}: return code {code}")]
    Rejected { opcode: Opcode, code: u32 },

    #[error("Session degraded, reconnect required")]
    ReconnectRequired,

    #[error("Not connected")]
    NotConnected,
}

impl Error {
    /// Transport failures that leave the channel in an unknown condition.
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            Error::Transfer(_) | Error::Serial(_) | Error::Io(_) | Error::Channel(_)
        )
    }

    /// Failures of a connect or reconnect attempt.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotFound | Error::Connect(_) | Error::Handshake(_) | Error::IncompatibleFirmware { .. }
        )
    }
}

/// Why a run of bytes could not be accepted as a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("{skipped} byte(s) before start marker")]
    Unsynchronized { skipped: usize },

    #[error("declared length {length} below header size")]
    TooShort { length: usize },

    #[error("declared length {length} exceeds maximum {max}")]
    TooLong { length: usize, max: usize },

    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("frame of length {length} abandoned for a complete frame at offset {next}")]
    Abandoned { length: usize, next: usize },
}

/// A payload that does not match the layout of the record it claims to be.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("{record}: need {needed} bytes, have {available}")]
    Truncated {
        record: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{record}: {message}")]
    Inconsistent { record: &'static str, message: String },

    #[error("unsupported spectrum format version {0}")]
    UnsupportedFormat(u32),

    #[error("unsupported spectrum value width code {0}")]
    UnsupportedWidth(u8),

    #[error("device return code {0}")]
    ReturnCode(u32),

    #[error("sample at tick {got} is not after previous sample at tick {previous}")]
    OutOfOrder { previous: i32, got: i32 },
}
