//! Abstract USB transport interface.

use std::time::Duration;
use thiserror::Error;

use crate::error::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device is gone")]
    NoDevice,
    #[error("Endpoint stalled")]
    Pipe,
    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("Interface error: {0}")]
    Interface(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Transfer failed: {0}")]
    TransferFailed(String),
    #[error("Operation unsupported by this backend")]
    Unsupported,
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoDevice => Error::NoDevice,
            TransportError::Pipe => Error::Pipe,
            TransportError::Timeout(_) => Error::Timeout,
            TransportError::Interface(_) => Error::UsbInterface,
            TransportError::Configuration(_) => Error::UsbConfiguration,
            TransportError::TransferFailed(_) => Error::Unknown,
            TransportError::Unsupported => Error::Unsupported,
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Synchronous USB operations over an open device.
///
/// The protocol engines drive everything through this trait; backends only
/// translate the calls, never interpret them.
pub trait UsbTransport: Send {
    /// Control transfer, device to host. Returns bytes received.
    fn control_in(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize>;

    /// Control transfer, host to device. Returns bytes sent.
    fn control_out(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> TransportResult<usize>;

    /// Bulk read from an IN endpoint (address has bit 7 set).
    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> TransportResult<usize>;

    /// Bulk write to an OUT endpoint. A zero-length `data` sends a ZLP.
    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> TransportResult<usize>;

    /// Select a configuration; backends only switch when it differs from
    /// the active one.
    fn set_configuration(&mut self, configuration: u8) -> TransportResult<()>;

    /// Claim an interface and, for interface 1, select the alt setting.
    fn set_interface(&mut self, interface: u8, alt_setting: u8) -> TransportResult<()>;

    /// Release the claimed interface, if any.
    fn release_interface(&mut self) -> TransportResult<()>;

    /// Reset the device. A device that stops responding because it is
    /// rebooting is not an error.
    fn reset(&self) -> TransportResult<()>;

    /// Read a string descriptor and narrow it to ASCII: first the language
    /// table, then the UTF-16LE string in the first language; any unit with
    /// a non-zero high byte becomes `'?'`.
    fn get_string_descriptor_ascii(&self, index: u8) -> TransportResult<String> {
        let mut data = [0u8; 255];
        let len = self.control_in(
            0x80,
            0x06,
            0x0300,
            0,
            &mut data,
            crate::protocol::USB_TIMEOUT,
        )?;
        if len < 4 {
            return Err(TransportError::TransferFailed(
                "short language descriptor".into(),
            ));
        }
        let langid = u16::from_le_bytes([data[2], data[3]]);

        let mut data = [0u8; 255];
        let len = self.control_in(
            0x80,
            0x06,
            0x0300 | index as u16,
            langid,
            &mut data,
            crate::protocol::USB_TIMEOUT,
        )?;
        if data[1] != 0x03 || data[0] as usize > len {
            return Err(TransportError::TransferFailed(
                "malformed string descriptor".into(),
            ));
        }

        let mut out = String::new();
        let mut si = 2;
        while si + 1 < data[0] as usize {
            if data[si + 1] != 0 {
                out.push('?');
            } else {
                out.push(data[si] as char);
            }
            si += 2;
        }
        Ok(out)
    }

    /// Index of the serial number string in the device descriptor.
    fn serial_number_index(&self) -> TransportResult<u8> {
        let mut desc = [0u8; 18];
        let len = self.control_in(
            0x80,
            0x06,
            0x0100,
            0,
            &mut desc,
            crate::protocol::USB_TIMEOUT,
        )?;
        if len < 18 {
            return Err(TransportError::TransferFailed(
                "short device descriptor".into(),
            ));
        }
        Ok(desc[16])
    }
}
