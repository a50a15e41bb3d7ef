//! Stub transport for builds without a USB backend.
//!
//! Every operation reports `unsupported`, so a session constructed over
//! this transport turns the whole public surface into polite failures
//! without a single conditional in the core logic.

use std::time::Duration;

use super::traits::{TransportError, TransportResult, UsbTransport};

/// Transport that supports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubTransport;

impl UsbTransport for StubTransport {
    fn control_in(
        &self,
        _bm_request_type: u8,
        _b_request: u8,
        _w_value: u16,
        _w_index: u16,
        _buf: &mut [u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        Err(TransportError::Unsupported)
    }

    fn control_out(
        &self,
        _bm_request_type: u8,
        _b_request: u8,
        _w_value: u16,
        _w_index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        Err(TransportError::Unsupported)
    }

    fn bulk_in(&self, _endpoint: u8, _buf: &mut [u8], _timeout: Duration) -> TransportResult<usize> {
        Err(TransportError::Unsupported)
    }

    fn bulk_out(&self, _endpoint: u8, _data: &[u8], _timeout: Duration) -> TransportResult<usize> {
        Err(TransportError::Unsupported)
    }

    fn set_configuration(&mut self, _configuration: u8) -> TransportResult<()> {
        Err(TransportError::Unsupported)
    }

    fn set_interface(&mut self, _interface: u8, _alt_setting: u8) -> TransportResult<()> {
        Err(TransportError::Unsupported)
    }

    fn release_interface(&mut self) -> TransportResult<()> {
        Err(TransportError::Unsupported)
    }

    fn reset(&self) -> TransportResult<()> {
        Err(TransportError::Unsupported)
    }
}
