//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, warn};

use super::traits::{TransportError, TransportResult, UsbTransport};
use crate::protocol::constants::{APPLE_VENDOR_ID, RECOGNISED_PIDS};

/// Production transport over an open nusb device.
pub struct NusbTransport {
    device: Device,
    interface: Option<Interface>,
    pid: u16,
}

/// Enumerate attached Apple devices in a recognised boot mode.
pub fn list_recognised_devices() -> TransportResult<Vec<DeviceInfo>> {
    let devices = list_devices()
        .wait()
        .map_err(|e| TransportError::TransferFailed(e.to_string()))?;
    Ok(devices
        .filter(|d| d.vendor_id() == APPLE_VENDOR_ID && RECOGNISED_PIDS.contains(&d.product_id()))
        .collect())
}

impl NusbTransport {
    /// Open a device previously discovered by [`list_recognised_devices`].
    pub fn open(device_info: &DeviceInfo) -> TransportResult<Self> {
        let pid = device_info.product_id();
        debug!(
            vid = format!("{:04x}", device_info.vendor_id()),
            pid = format!("{:04x}", pid),
            "opening device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::TransferFailed(e.to_string()))?;

        info!(pid = format!("{:04x}", pid), "device opened");

        Ok(Self {
            device,
            interface: None,
            pid,
        })
    }

    /// Product id the device was opened with.
    pub fn product_id(&self) -> u16 {
        self.pid
    }

    fn claimed(&self) -> TransportResult<&Interface> {
        self.interface
            .as_ref()
            .ok_or_else(|| TransportError::Interface("no interface claimed".into()))
    }
}

fn control_type_of(bm_request_type: u8) -> ControlType {
    match (bm_request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    }
}

fn recipient_of(bm_request_type: u8) -> Recipient {
    match bm_request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    }
}

fn map_transfer_error(err: nusb::transfer::TransferError, timeout: Duration) -> TransportError {
    use nusb::transfer::TransferError;
    match err {
        TransferError::Stall => TransportError::Pipe,
        TransferError::Disconnected => TransportError::NoDevice,
        // Blocking transfers are cancelled when their deadline passes.
        TransferError::Cancelled => TransportError::Timeout(timeout),
        other => TransportError::TransferFailed(other.to_string()),
    }
}

impl UsbTransport for NusbTransport {
    fn control_in(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        let data = self
            .device
            .control_in(
                ControlIn {
                    control_type: control_type_of(bm_request_type),
                    recipient: recipient_of(bm_request_type),
                    request: b_request,
                    value: w_value,
                    index: w_index,
                    length: buf.len() as u16,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout))?;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        debug!(
            bm_request_type,
            b_request,
            bytes = n,
            "control transfer in"
        );
        Ok(n)
    }

    fn control_out(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        self.device
            .control_out(
                ControlOut {
                    control_type: control_type_of(bm_request_type),
                    recipient: recipient_of(bm_request_type),
                    request: b_request,
                    value: w_value,
                    index: w_index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout))?;

        debug!(
            bm_request_type,
            b_request,
            bytes = data.len(),
            "control transfer out"
        );
        Ok(data.len())
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        let mut ep = self
            .claimed()?
            .endpoint::<Bulk, In>(endpoint)
            .map_err(|e| TransportError::Interface(e.to_string()))?;

        // IN transfers must request a multiple of the max packet size.
        let max_packet = ep.max_packet_size();
        let requested = buf.len().div_ceil(max_packet).max(1) * max_packet;
        let mut transfer = Buffer::new(requested);
        transfer.set_requested_len(requested);

        let completion = ep.transfer_blocking(transfer, timeout);
        let data = completion.into_result().map_err(|e| {
            // Recover the endpoint before reporting, matching the libusb
            // clear-halt-on-error behavior.
            let _ = ep.clear_halt().wait();
            map_transfer_error(e, timeout)
        })?;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> TransportResult<usize> {
        let mut ep = self
            .claimed()?
            .endpoint::<Bulk, Out>(endpoint)
            .map_err(|e| TransportError::Interface(e.to_string()))?;

        let mut transfer = Buffer::new(data.len());
        transfer.extend_from_slice(data);

        let completion = ep.transfer_blocking(transfer, timeout);
        completion.into_result().map_err(|e| {
            let _ = ep.clear_halt().wait();
            map_transfer_error(e, timeout)
        })?;
        Ok(data.len())
    }

    fn set_configuration(&mut self, configuration: u8) -> TransportResult<()> {
        debug!(configuration, "setting configuration");
        let current = self
            .device
            .active_configuration()
            .map(|c| c.configuration_value())
            .unwrap_or(0);
        if current != configuration {
            self.device
                .set_configuration(configuration)
                .wait()
                .map_err(|e| TransportError::Configuration(e.to_string()))?;
        }
        Ok(())
    }

    fn set_interface(&mut self, interface: u8, alt_setting: u8) -> TransportResult<()> {
        debug!(interface, alt_setting, "setting interface");
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| TransportError::Interface(e.to_string()))?;

        if interface == 1 {
            claimed
                .set_alt_setting(alt_setting)
                .wait()
                .map_err(|e| TransportError::Interface(e.to_string()))?;
        }

        self.interface = Some(claimed);
        Ok(())
    }

    fn release_interface(&mut self) -> TransportResult<()> {
        self.interface = None;
        Ok(())
    }

    fn reset(&self) -> TransportResult<()> {
        // The device drops off the bus while rebooting; errors here only
        // mean it already left.
        if let Err(e) = self.device.reset().wait() {
            warn!(error = %e, "device reset reported an error (ignored)");
        }
        Ok(())
    }
}
