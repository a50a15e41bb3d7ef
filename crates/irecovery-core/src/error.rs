//! Error taxonomy with stable integer codes.
//!
//! Every failure the library can report maps to a fixed code carried over
//! from the original C ABI, and `strerror` returns the matching stable
//! English phrase for any code.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Library error. The `#[error]` phrases are ABI-stable; tools parse them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Unable to find device")]
    NoDevice,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Unable to connect to device")]
    UnableToConnect,
    #[error("Invalid input")]
    InvalidInput,
    #[error("File not found")]
    FileNotFound,
    #[error("Unable to upload data to device")]
    UsbUpload,
    #[error("Unable to get device status")]
    UsbStatus,
    #[error("Unable to set device interface")]
    UsbInterface,
    #[error("Unable to set device configuration")]
    UsbConfiguration,
    #[error("Broken pipe")]
    Pipe,
    #[error("Timeout talking to device")]
    Timeout,
    #[error("Operation unsupported by driver")]
    Unsupported,
    #[error("Unknown error")]
    Unknown,
}

impl Error {
    /// Fixed integer code for this error.
    pub fn code(self) -> i32 {
        match self {
            Error::NoDevice => -1,
            Error::OutOfMemory => -2,
            Error::UnableToConnect => -3,
            Error::InvalidInput => -4,
            Error::FileNotFound => -5,
            Error::UsbUpload => -6,
            Error::UsbStatus => -7,
            Error::UsbInterface => -8,
            Error::UsbConfiguration => -9,
            Error::Pipe => -10,
            Error::Timeout => -11,
            Error::Unsupported => -254,
            Error::Unknown => -255,
        }
    }

    /// Map an integer code back to an error. Zero (success) and unknown
    /// codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Error::NoDevice,
            -2 => Error::OutOfMemory,
            -3 => Error::UnableToConnect,
            -4 => Error::InvalidInput,
            -5 => Error::FileNotFound,
            -6 => Error::UsbUpload,
            -7 => Error::UsbStatus,
            -8 => Error::UsbInterface,
            -9 => Error::UsbConfiguration,
            -10 => Error::Pipe,
            -11 => Error::Timeout,
            -254 => Error::Unsupported,
            -255 => Error::Unknown,
            _ => return None,
        })
    }
}

/// Stable English phrase for an integer error code.
pub fn strerror(code: i32) -> &'static str {
    if code == 0 {
        return "Command completed successfully";
    }
    match Error::from_code(code) {
        Some(Error::NoDevice) => "Unable to find device",
        Some(Error::OutOfMemory) => "Out of memory",
        Some(Error::UnableToConnect) => "Unable to connect to device",
        Some(Error::InvalidInput) => "Invalid input",
        Some(Error::FileNotFound) => "File not found",
        Some(Error::UsbUpload) => "Unable to upload data to device",
        Some(Error::UsbStatus) => "Unable to get device status",
        Some(Error::UsbInterface) => "Unable to set device interface",
        Some(Error::UsbConfiguration) => "Unable to set device configuration",
        Some(Error::Pipe) => "Broken pipe",
        Some(Error::Timeout) => "Timeout talking to device",
        Some(Error::Unsupported) => "Operation unsupported by driver",
        _ => "Unknown error",
    }
}
