use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transport error on register {register:#04X}: {source}")]
    Transport {
        register: u8,
        #[source]
        source: TransportError,
    },
    #[error("usb error: {0}")]
    Usb(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timed out after {waited:?} waiting for {flag}")]
    MeasurementTimeout { flag: &'static str, waited: Duration },
    #[error("{field} value {value} does not fit in {bits} bits")]
    EncodingOverflow {
        field: &'static str,
        value: u64,
        bits: u8,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("sweep cancelled")]
    Cancelled,
    #[error("calibration error: {0}")]
    Calibration(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("device not found: {vid:04x}:{pid:04x}")]
    NotFound { vid: u16, pid: u16 },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("control transfer failed: {0}")]
    Usb(#[from] rusb::Error),
    #[error("short transfer: expected {expected} byte(s), got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("more than one device matches {vid:04x}:{pid:04x}; disconnect the others")]
    Ambiguous { vid: u16, pid: u16 },
    #[error("kernel driver active on interface {0}")]
    KernelDriverActive(u8),
    #[error("device disconnected")]
    Disconnected,
}

impl TransportError {
    /// Attach the register that was being accessed.
    pub fn at(self, register: u8) -> DriverError {
        DriverError::Transport {
            register,
            source: self,
        }
    }
}

/// A configuration write that did not read back as written.
///
/// Read-only and self-clearing bits make this expected on some registers,
/// so it is reported rather than raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationMismatch {
    pub register: u8,
    pub written: u8,
    pub read_back: u8,
}

pub type Result<T> = std::result::Result<T, DriverError>;
