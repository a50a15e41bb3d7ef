//! Upload engine: text commands, the two firmware-upload flows, response
//! reads and the environment-variable commands.
//!
//! Recovery mode uploads over bulk endpoint 0x04 with a ZLP terminator;
//! DFU-like modes upload over control transfers with a CRC-32 trailer on
//! the final packet; KIS sessions delegate to the KIS chunk protocol.

use bitflags::bitflags;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::kis;
use crate::protocol::constants::{
    DFU_MAGIC, DFU_PACKET_SIZE, DFU_SMALL_PACKET_SIZE, DFU_STATE_ERROR, DFU_STATE_IDLE,
    DFU_STATUS_OK, RECEIVE_TIMEOUT, RECOVERY_PACKET_SIZE, RECOVERY_RECV_PACKET_SIZE,
    RECOVERY_RESPONSE_ENDPOINT, RECOVERY_UPLOAD_ENDPOINT,
};
use crate::protocol::{CRC32_INIT, USB_TIMEOUT, crc32_update};
use crate::transport::UsbTransport;

bitflags! {
    /// Options for `send_buffer`/`send_file`. The bit values are part of
    /// the original library's ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendOptions: u32 {
        /// Issue the finish-notify sequence after the data.
        const DFU_NOTIFY_FINISH = 1;
        /// Additionally send an empty control transfer at the end.
        const DFU_FORCE_ZLP = 2;
        /// Use 0x40-byte packets and skip the CRC trailer.
        const DFU_SMALL_PKT = 4;
    }
}

/// Longest accepted command, including the terminating NUL.
const MAX_COMMAND_LEN: usize = 0x100;

/// Scratch size for `receive`.
const RECEIVE_BUFFER_SIZE: usize = 0x1000;

impl<T: UsbTransport> Client<T> {
    fn send_command_raw(&self, command: &str, b_request: u8) -> Result<()> {
        if command.len() >= MAX_COMMAND_LEN {
            return Err(Error::InvalidInput);
        }
        if command.is_empty() {
            return Ok(());
        }

        // The terminating NUL is part of the transfer.
        let mut bytes = Vec::with_capacity(command.len() + 1);
        bytes.extend_from_slice(command.as_bytes());
        bytes.push(0);
        self.usb_control_out(0x40, b_request, 0, 0, &bytes, USB_TIMEOUT)?;
        Ok(())
    }

    /// Send a text command with an explicit `bRequest` byte.
    ///
    /// The `pre_command` observer hook may consume the command; a stalled
    /// pipe is not fatal, since commands like `reboot` take the device
    /// away mid-transfer.
    pub fn send_command_breq(&self, command: &str, b_request: u8) -> Result<()> {
        if command.len() >= MAX_COMMAND_LEN {
            return Err(Error::InvalidInput);
        }

        if self.pre_command(command) {
            return Ok(());
        }

        match self.send_command_raw(command, b_request) {
            Ok(()) | Err(Error::Pipe) => {}
            Err(e) => {
                debug!(command, "failed to send command");
                return Err(e);
            }
        }

        self.post_command(command);
        Ok(())
    }

    /// Send a text command to the bootloader shell.
    pub fn send_command(&self, command: &str) -> Result<()> {
        self.send_command_breq(command, 0)
    }

    fn get_status(&self) -> Result<u8> {
        let mut buf = [0u8; 6];
        if self
            .usb_control_in(0xA1, 3, 0, 0, &mut buf, USB_TIMEOUT)
            .unwrap_or(0)
            != 6
        {
            return Err(Error::UsbStatus);
        }
        Ok(buf[4])
    }

    /// Upload a firmware buffer using the flow for the session's mode.
    pub fn send_buffer(&mut self, buffer: &[u8], options: SendOptions) -> Result<()> {
        if self.is_kis() {
            return self.kis_send_buffer(buffer, options);
        }
        if self.mode().is_recovery() {
            self.recovery_send_buffer(buffer)
        } else {
            self.dfu_send_buffer(buffer, options)
        }
    }

    fn kis_send_buffer(&mut self, buffer: &[u8], options: SendOptions) -> Result<()> {
        let observer = self.observer.clone();
        let total = buffer.len() as f64;
        kis::upload(
            &self.transport,
            &mut self.kis_sequence,
            buffer,
            options.contains(SendOptions::DFU_NOTIFY_FINISH),
            |sent| {
                if let Some(observer) = &observer {
                    observer.on_progress(sent as f64 / total * 100.0, sent, "Uploading");
                }
            },
        )
    }

    fn recovery_send_buffer(&mut self, buffer: &[u8]) -> Result<()> {
        let packet_size = RECOVERY_PACKET_SIZE;
        let (packets, last) = packetise(buffer.len(), packet_size);

        // Tell iBoot an image is coming.
        self.usb_control_out(0x41, 0, 0, 0, &[], USB_TIMEOUT)?;

        let mut count = 0u64;
        for i in 0..packets {
            let size = if i + 1 < packets { packet_size } else { last };
            let chunk = &buffer[i * packet_size..i * packet_size + size];
            let sent = self
                .usb_bulk_out(RECOVERY_UPLOAD_ENDPOINT, chunk, USB_TIMEOUT)
                .map_err(|_| Error::UsbUpload)?;
            if sent != size {
                return Err(Error::UsbUpload);
            }
            count += size as u64;
            self.emit_progress(count as f64 / buffer.len() as f64 * 100.0, count, "Uploading");
        }

        // A transfer that is a multiple of the 512-byte max packet size
        // needs a zero-length packet as terminator.
        if buffer.len() % 512 == 0 {
            self.usb_bulk_out(RECOVERY_UPLOAD_ENDPOINT, &[], USB_TIMEOUT)
                .map_err(|_| Error::UsbUpload)?;
        }
        Ok(())
    }

    fn dfu_send_buffer(&mut self, buffer: &[u8], options: SendOptions) -> Result<()> {
        let small_packets = options.contains(SendOptions::DFU_SMALL_PKT);
        let packet_size = if small_packets {
            DFU_SMALL_PACKET_SIZE
        } else {
            DFU_PACKET_SIZE
        };
        let (packets, last) = packetise(buffer.len(), packet_size);

        let mut state = [0u8; 1];
        if self
            .usb_control_in(0xA1, 5, 0, 0, &mut state, USB_TIMEOUT)
            .unwrap_or(0)
            != 1
        {
            return Err(Error::UsbUpload);
        }
        match state[0] {
            DFU_STATE_IDLE => {}
            DFU_STATE_ERROR => {
                debug!("DFU error state, issuing CLRSTATUS");
                let _ = self.usb_control_out(0x21, 4, 0, 0, &[], USB_TIMEOUT);
                return Err(Error::UsbUpload);
            }
            other => {
                debug!(state = other, "unexpected DFU state, issuing ABORT");
                let _ = self.usb_control_out(0x21, 6, 0, 0, &[], USB_TIMEOUT);
                return Err(Error::UsbUpload);
            }
        }

        let mut crc = CRC32_INIT;
        let mut count = 0u64;
        for i in 0..packets {
            let mut size = if i + 1 < packets { packet_size } else { last };
            let chunk = &buffer[i * packet_size..i * packet_size + size];

            if !small_packets {
                crc = crc32_update(crc, chunk);
            }

            let sent;
            if i + 1 == packets && !small_packets {
                let mut trailing = chunk;
                if size + 16 > packet_size {
                    // No room for the trailer; flush the data first and
                    // send the trailer alone under the same index.
                    let flushed = self
                        .usb_control_out(0x21, 1, i as u16, 0, chunk, USB_TIMEOUT)
                        .map_err(|_| Error::UsbUpload)?;
                    if flushed != size {
                        return Err(Error::UsbUpload);
                    }
                    count += size as u64;
                    size = 0;
                    trailing = &[];
                }

                // The CRC runs over the magic as two six-byte rounds.
                crc = crc32_update(crc, &DFU_MAGIC[..6]);
                crc = crc32_update(crc, &DFU_MAGIC[6..]);

                let mut packet = Vec::with_capacity(size + 16);
                packet.extend_from_slice(trailing);
                packet.extend_from_slice(&DFU_MAGIC);
                packet.extend_from_slice(&crc.to_le_bytes());
                size += 16;
                sent = self
                    .usb_control_out(0x21, 1, i as u16, 0, &packet, USB_TIMEOUT)
                    .map_err(|_| Error::UsbUpload)?;
            } else {
                sent = self
                    .usb_control_out(0x21, 1, i as u16, 0, chunk, USB_TIMEOUT)
                    .map_err(|_| Error::UsbUpload)?;
            }

            if sent != size {
                return Err(Error::UsbUpload);
            }

            let mut status = self.get_status()?;
            if status != DFU_STATUS_OK {
                let mut retry = 0;
                while retry < 20 {
                    status = self.get_status().unwrap_or(0);
                    if status == DFU_STATUS_OK {
                        break;
                    }
                    thread::sleep(Duration::from_secs(1));
                    retry += 1;
                }
                if status != DFU_STATUS_OK {
                    return Err(Error::UsbUpload);
                }
            }

            count += size as u64;
            self.emit_progress(count as f64 / buffer.len() as f64 * 100.0, count, "Uploading");
        }

        if options.contains(SendOptions::DFU_NOTIFY_FINISH) {
            self.usb_control_out(0x21, 1, packets as u16, 0, &[], USB_TIMEOUT)
                .map_err(|_| Error::UsbUpload)?;

            for _ in 0..2 {
                self.get_status()?;
            }

            if options.contains(SendOptions::DFU_FORCE_ZLP) {
                // A pseudo ZLP, just in case.
                let _ = self.usb_control_out(0x21, 1, 0, 0, &[], USB_TIMEOUT);
            }

            self.reset()?;
        }

        Ok(())
    }

    /// Read a file and upload it.
    pub fn send_file(&mut self, path: impl AsRef<std::path::Path>, options: SendOptions) -> Result<()> {
        let buffer = std::fs::read(path.as_ref()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound,
            std::io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ => Error::Unknown,
        })?;
        self.send_buffer(&buffer, options)
    }

    /// Drain the device's bulk response endpoint, dispatching each chunk
    /// to the `received` observer hook. Stops on a zero-byte read, a
    /// transfer error, or when the hook asks to.
    pub fn receive(&mut self) -> Result<()> {
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let _ = self.usb_set_interface(1, 1);
            let read = self.usb_bulk_in(RECOVERY_RESPONSE_ENDPOINT, &mut buffer, RECEIVE_TIMEOUT);
            let _ = self.usb_set_interface(0, 0);

            match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if self.emit_received(&buffer[..n]) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Packetised control read of `length` bytes from the device.
    pub fn recv_buffer(&self, length: usize) -> Result<Vec<u8>> {
        let packet_size = if self.mode().is_recovery() {
            RECOVERY_RECV_PACKET_SIZE
        } else {
            DFU_PACKET_SIZE
        };
        let (packets, last) = packetise(length, packet_size);

        let mut buffer = vec![0u8; length];
        let mut count = 0u64;
        for i in 0..packets {
            let size = if i + 1 < packets { packet_size } else { last };
            let chunk = &mut buffer[i * packet_size..i * packet_size + size];
            let read = self
                .usb_control_in(0xA1, 2, 0, 0, chunk, USB_TIMEOUT)
                .map_err(|_| Error::UsbUpload)?;
            if read != size {
                return Err(Error::UsbUpload);
            }
            count += size as u64;
            self.emit_progress(count as f64 / length as f64 * 100.0, count, "Downloading");
        }
        Ok(buffer)
    }

    fn read_response(&self) -> String {
        let mut buf = [0u8; 256];
        let _ = self.usb_control_in(0xC0, 0, 0, 0, &mut buf[..255], USB_TIMEOUT);
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    /// Query an environment variable. A stalled pipe yields an empty
    /// value rather than an error.
    pub fn getenv(&self, variable: &str) -> Result<String> {
        match self.send_command_raw(&format!("getenv {variable}"), 0) {
            Ok(()) => {}
            Err(Error::Pipe) => return Ok(String::new()),
            Err(e) => return Err(e),
        }
        Ok(self.read_response())
    }

    /// Numeric return value of the last command.
    pub fn getret(&self) -> Result<u32> {
        let mut buf = [0u8; 256];
        let _ = self.usb_control_in(0xC0, 0, 0, 0, &mut buf[..255], USB_TIMEOUT);
        Ok(buf[0] as u32)
    }

    /// Set an environment variable. Some assignments make the device drop
    /// the connection, so a stalled pipe counts as success.
    pub fn setenv(&self, variable: &str, value: &str) -> Result<()> {
        match self.send_command_raw(&format!("setenv {variable} {value}"), 0) {
            Ok(()) | Err(Error::Pipe) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `setenv` variant that skips the bootloader's NVRAM proxy.
    pub fn setenv_np(&self, variable: &str, value: &str) -> Result<()> {
        match self.send_command_raw(&format!("setenvnp {variable} {value}"), 0) {
            Ok(()) | Err(Error::Pipe) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Persist the environment.
    pub fn saveenv(&self) -> Result<()> {
        self.send_command_raw("saveenv", 0)
    }

    /// Reboot the device. The connection going away is expected.
    pub fn reboot(&self) -> Result<()> {
        match self.send_command_raw("reboot", 0) {
            Ok(()) | Err(Error::Pipe) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run a script: one command per line, `#` comments skipped, draining
    /// the response after each command.
    pub fn execute_script(&mut self, script: &str) -> Result<()> {
        for line in script.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.send_command(line)?;
            self.receive()?;
        }
        Ok(())
    }

    /// Kick the legacy bootrom race. Backend cancellation is not
    /// available here, so this issues the single synchronous transfer
    /// with a short timeout and leaves the endpoint state to the device.
    pub fn trigger_limera1n_exploit(&self) -> Result<()> {
        if let Err(e) = self.usb_control_out(0x21, 2, 0, 0, &[], Duration::from_millis(100)) {
            warn!(error = %e, "limera1n trigger transfer did not complete (expected)");
        }
        Ok(())
    }

    /// Clear the DFU transfer counters. A no-op outside DFU/WTF.
    pub fn reset_counters(&self) -> Result<()> {
        if matches!(self.mode(), crate::protocol::Mode::Dfu | crate::protocol::Mode::Wtf) {
            let _ = self.usb_control_out(0x21, 4, 0, 0, &[], USB_TIMEOUT);
        }
        Ok(())
    }

    /// Finish an upload out-of-band: zero-length packet, drain status
    /// three times, reset.
    pub fn finish_transfer(&self) -> Result<()> {
        let _ = self.usb_control_out(0x21, 1, 0, 0, &[], USB_TIMEOUT);
        for _ in 0..3 {
            let _ = self.get_status();
        }
        self.reset()
    }
}

/// Split `length` into `(packet count, size of the last packet)`.
fn packetise(length: usize, packet_size: usize) -> (usize, usize) {
    let last = length % packet_size;
    let packets = length / packet_size;
    if last != 0 {
        (packets + 1, last)
    } else {
        (packets, packet_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventObserver;
    use crate::protocol::Mode;
    use crate::transport::TransportError;
    use crate::transport::mock::{MockOp, MockTransport};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DFU_STATE_IDLE_REPLY: [u8; 1] = [2];
    const DFU_STATUS_OK_REPLY: [u8; 6] = [0, 0, 0, 0, 5, 0];

    fn dfu_client() -> Client<MockTransport> {
        Client::with_transport(MockTransport::new(), Mode::Dfu)
    }

    fn control_outs(client: &Client<MockTransport>) -> Vec<(u8, u8, u16, Vec<u8>)> {
        client
            .transport
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::ControlOut {
                    bm_request_type,
                    b_request,
                    w_value,
                    data,
                    ..
                } => Some((bm_request_type, b_request, w_value, data)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_command_length_boundary() {
        let client = dfu_client();
        let too_long = "a".repeat(0x100);
        assert_eq!(client.send_command(&too_long).unwrap_err(), Error::InvalidInput);

        let just_fits = "a".repeat(0xFF);
        client.send_command(&just_fits).unwrap();
        let outs = control_outs(&client);
        assert_eq!(outs.len(), 1);
        let (bm, breq, _, data) = &outs[0];
        assert_eq!((*bm, *breq), (0x40, 0));
        // 0xFF characters plus the trailing NUL.
        assert_eq!(data.len(), 0x100);
        assert_eq!(data[0xFF], 0);
    }

    #[test]
    fn test_send_command_breq_byte() {
        let client = dfu_client();
        client.send_command_breq("go", 1).unwrap();
        let outs = control_outs(&client);
        assert_eq!(outs[0].1, 1);
    }

    #[test]
    fn test_pre_command_consumes() {
        struct Consume;
        impl EventObserver for Consume {
            fn on_pre_command(&self, _command: &str) -> bool {
                true
            }
        }

        let mut client = dfu_client();
        client.set_observer(Arc::new(Consume));
        client.send_command("reboot").unwrap();
        assert!(control_outs(&client).is_empty());
    }

    #[test]
    fn test_command_pipe_stall_not_fatal() {
        let client = dfu_client();
        client.transport.queue_control_out_err(TransportError::Pipe);
        client.send_command("reboot").unwrap();
    }

    #[test]
    fn test_dfu_upload_single_packet_trailer_inline() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&DFU_STATE_IDLE_REPLY);
        client.transport.queue_control_in(&DFU_STATUS_OK_REPLY);

        let payload: Vec<u8> = (0u8..0x10).collect();
        client.send_buffer(&payload, SendOptions::empty()).unwrap();

        let outs = control_outs(&client);
        assert_eq!(outs.len(), 1);
        let (bm, breq, index, data) = &outs[0];
        assert_eq!((*bm, *breq, *index), (0x21, 1, 0));
        assert_eq!(data.len(), 0x10 + 16);
        assert_eq!(&data[..0x10], payload.as_slice());
        assert_eq!(&data[0x10..0x1C], &DFU_MAGIC);

        let mut crc = crc32_update(CRC32_INIT, &payload);
        crc = crc32_update(crc, &DFU_MAGIC[..6]);
        crc = crc32_update(crc, &DFU_MAGIC[6..]);
        assert_eq!(&data[0x1C..], &crc.to_le_bytes());
    }

    #[test]
    fn test_dfu_upload_full_packet_trailer_separate() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&DFU_STATE_IDLE_REPLY);
        client.transport.queue_control_in(&DFU_STATUS_OK_REPLY);

        // Exactly one full packet: the trailer cannot fit and goes out in
        // a second transfer under the same index.
        let payload = vec![0xA5u8; DFU_PACKET_SIZE];
        client.send_buffer(&payload, SendOptions::empty()).unwrap();

        let outs = control_outs(&client);
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].2, 0);
        assert_eq!(outs[0].3.len(), DFU_PACKET_SIZE);
        assert_eq!(outs[1].2, 0);
        assert_eq!(outs[1].3.len(), 16);
        assert_eq!(&outs[1].3[..12], &DFU_MAGIC);
    }

    #[test]
    fn test_dfu_small_packets_skip_trailer() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&DFU_STATE_IDLE_REPLY);
        for _ in 0..3 {
            client.transport.queue_control_in(&DFU_STATUS_OK_REPLY);
        }

        let payload = vec![1u8; DFU_SMALL_PACKET_SIZE * 2 + 4];
        client
            .send_buffer(&payload, SendOptions::DFU_SMALL_PKT)
            .unwrap();

        let outs = control_outs(&client);
        assert_eq!(outs.len(), 3);
        assert_eq!(outs[0].3.len(), DFU_SMALL_PACKET_SIZE);
        assert_eq!(outs[1].3.len(), DFU_SMALL_PACKET_SIZE);
        // Last packet carries only the residue, no trailer.
        assert_eq!(outs[2].3.len(), 4);
    }

    #[test]
    fn test_dfu_error_state_clears_status() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&[10]);

        let err = client.send_buffer(&[0u8; 4], SendOptions::empty()).unwrap_err();
        assert_eq!(err, Error::UsbUpload);

        let outs = control_outs(&client);
        assert_eq!(outs.len(), 1);
        assert_eq!((outs[0].0, outs[0].1), (0x21, 4)); // CLRSTATUS
    }

    #[test]
    fn test_dfu_unexpected_state_aborts() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&[4]);
        let err = client.send_buffer(&[0u8; 4], SendOptions::empty()).unwrap_err();
        assert_eq!(err, Error::UsbUpload);
        let outs = control_outs(&client);
        assert_eq!((outs[0].0, outs[0].1), (0x21, 6)); // ABORT
    }

    #[test]
    fn test_dfu_empty_buffer_notify_finish() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&DFU_STATE_IDLE_REPLY);
        client.transport.queue_control_in(&DFU_STATUS_OK_REPLY);
        client.transport.queue_control_in(&DFU_STATUS_OK_REPLY);

        client
            .send_buffer(&[], SendOptions::DFU_NOTIFY_FINISH)
            .unwrap();

        // Exactly one zero-data packet (the notify), then a reset.
        let outs = control_outs(&client);
        assert_eq!(outs.len(), 1);
        assert_eq!((outs[0].0, outs[0].1, outs[0].2), (0x21, 1, 0));
        assert!(outs[0].3.is_empty());
        assert!(client.transport.ops().contains(&MockOp::Reset));
    }

    #[test]
    fn test_dfu_empty_buffer_without_notify_sends_nothing() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&DFU_STATE_IDLE_REPLY);
        client.send_buffer(&[], SendOptions::empty()).unwrap();
        assert!(control_outs(&client).is_empty());
    }

    #[test]
    fn test_dfu_force_zlp() {
        let mut client = dfu_client();
        client.transport.queue_control_in(&DFU_STATE_IDLE_REPLY);
        for _ in 0..3 {
            client.transport.queue_control_in(&DFU_STATUS_OK_REPLY);
        }

        client
            .send_buffer(
                &[7u8; 8],
                SendOptions::DFU_NOTIFY_FINISH | SendOptions::DFU_FORCE_ZLP,
            )
            .unwrap();

        let zero_len: Vec<_> = control_outs(&client)
            .into_iter()
            .filter(|(bm, breq, _, data)| (*bm, *breq) == (0x21, 1) && data.is_empty())
            .collect();
        // The notify packet (index = packet count) plus the forced ZLP.
        assert_eq!(zero_len.len(), 2);
        assert_eq!(zero_len[0].2, 1);
        assert_eq!(zero_len[1].2, 0);
    }

    #[test]
    fn test_recovery_upload_with_zlp_terminator() {
        let mut client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client
            .send_buffer(&vec![9u8; RECOVERY_PACKET_SIZE], SendOptions::empty())
            .unwrap();

        let ops = client.transport.ops();
        assert!(matches!(
            ops[0],
            MockOp::ControlOut {
                bm_request_type: 0x41,
                b_request: 0,
                ..
            }
        ));
        match &ops[1] {
            MockOp::BulkOut { endpoint, data } => {
                assert_eq!(*endpoint, RECOVERY_UPLOAD_ENDPOINT);
                assert_eq!(data.len(), RECOVERY_PACKET_SIZE);
            }
            other => panic!("unexpected op {other:?}"),
        }
        match &ops[2] {
            MockOp::BulkOut { endpoint, data } => {
                assert_eq!(*endpoint, RECOVERY_UPLOAD_ENDPOINT);
                assert!(data.is_empty());
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_recovery_upload_odd_length_skips_zlp() {
        let mut client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.send_buffer(&[1u8; 100], SendOptions::empty()).unwrap();
        let bulk_count = client
            .transport
            .ops()
            .iter()
            .filter(|op| matches!(op, MockOp::BulkOut { .. }))
            .count();
        assert_eq!(bulk_count, 1);
    }

    #[test]
    fn test_kis_session_delegates_upload() {
        let mut client = Client::with_transport(MockTransport::new(), Mode::PortDfu);
        client.is_kis = true;

        // One chunk plus the boot notify, each with a 16-byte reply.
        let mut reply = vec![0u8; kis::HEADER_SIZE + 4];
        reply[2] = 0xA0;
        client.transport.queue_bulk_in(&reply);
        client.transport.queue_bulk_in(&reply);

        client
            .send_buffer(&[3u8; 0x200], SendOptions::DFU_NOTIFY_FINISH)
            .unwrap();

        let ops = client.transport.ops();
        assert!(ops.iter().all(|op| !matches!(op, MockOp::ControlOut { .. })));
        let outs: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op, MockOp::BulkOut { endpoint: 0x03, .. }))
            .collect();
        assert_eq!(outs.len(), 2);
    }

    #[test]
    fn test_progress_reported_per_chunk() {
        #[derive(Default)]
        struct Progress(AtomicU32);
        impl EventObserver for Progress {
            fn on_progress(&self, percent: f64, _bytes: u64, operation: &str) {
                assert_eq!(operation, "Uploading");
                if (percent - 100.0).abs() < 1.0 {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let observer = Arc::new(Progress::default());
        let mut client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.set_observer(observer.clone());
        client.send_buffer(&[1u8; 100], SendOptions::empty()).unwrap();
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recv_buffer_packetised() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client
            .transport
            .queue_control_in(&vec![0x11u8; RECOVERY_RECV_PACKET_SIZE]);
        client.transport.queue_control_in(&[0x22u8; 4]);

        let data = client.recv_buffer(RECOVERY_RECV_PACKET_SIZE + 4).unwrap();
        assert_eq!(data.len(), RECOVERY_RECV_PACKET_SIZE + 4);
        assert_eq!(data[0], 0x11);
        assert_eq!(data[RECOVERY_RECV_PACKET_SIZE], 0x22);

        let reads: Vec<_> = client
            .transport
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::ControlIn {
                    bm_request_type: 0xA1,
                    b_request: 2,
                    len,
                    ..
                } => Some(len),
                _ => None,
            })
            .collect();
        assert_eq!(reads, vec![RECOVERY_RECV_PACKET_SIZE, 4]);
    }

    #[test]
    fn test_receive_dispatches_until_drained() {
        struct Collect(std::sync::Mutex<Vec<Vec<u8>>>);
        impl EventObserver for Collect {
            fn on_received(&self, data: &[u8]) -> bool {
                self.0.lock().unwrap().push(data.to_vec());
                false
            }
        }

        let observer = Arc::new(Collect(std::sync::Mutex::new(Vec::new())));
        let mut client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.set_observer(observer.clone());
        client.transport.queue_bulk_in(b"] hello");
        client.transport.queue_bulk_in(b"");

        client.receive().unwrap();

        assert_eq!(observer.0.lock().unwrap().as_slice(), &[b"] hello".to_vec()]);
        // The read is bracketed by interface switches 1/1 and 0/0.
        let ops = client.transport.ops();
        assert_eq!(ops[0], MockOp::SetInterface(1, 1));
        assert!(matches!(ops[1], MockOp::BulkIn { endpoint: 0x81, .. }));
        assert_eq!(ops[2], MockOp::SetInterface(0, 0));
    }

    #[test]
    fn test_getenv_reads_response() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.transport.queue_control_in(b"bar\0");

        let value = client.getenv("foo").unwrap();
        assert_eq!(value, "bar");

        let outs = control_outs(&client);
        assert_eq!(outs[0].3, b"getenv foo\0");
        assert!(client.transport.ops().iter().any(|op| matches!(
            op,
            MockOp::ControlIn {
                bm_request_type: 0xC0,
                b_request: 0,
                len: 255,
                ..
            }
        )));
    }

    #[test]
    fn test_getenv_pipe_stall_is_empty_success() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.transport.queue_control_out_err(TransportError::Pipe);
        assert_eq!(client.getenv("foo").unwrap(), "");
    }

    #[test]
    fn test_getret_first_byte() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.transport.queue_control_in(&[3, 0, 0, 0]);
        assert_eq!(client.getret().unwrap(), 3);
    }

    #[test]
    fn test_setenv_formats_command() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.setenv("auto-boot", "true").unwrap();
        client.setenv_np("boot-args", "-v").unwrap();
        let outs = control_outs(&client);
        assert_eq!(outs[0].3, b"setenv auto-boot true\0");
        assert_eq!(outs[1].3, b"setenvnp boot-args -v\0");
    }

    #[test]
    fn test_reboot_demotes_pipe() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.transport.queue_control_out_err(TransportError::Pipe);
        client.reboot().unwrap();
    }

    #[test]
    fn test_send_file_missing() {
        let mut client = dfu_client();
        let err = client
            .send_file("/nonexistent/image.img4", SendOptions::empty())
            .unwrap_err();
        assert_eq!(err, Error::FileNotFound);
    }

    #[test]
    fn test_execute_script_skips_comments() {
        let mut client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        // receive() after each command fails fast on the empty bulk queue.
        client
            .execute_script("# comment\nsetenv a 1\n\nsaveenv\n")
            .unwrap();
        let outs = control_outs(&client);
        let commands: Vec<_> = outs
            .iter()
            .filter(|(bm, _, _, _)| *bm == 0x40)
            .map(|(_, _, _, data)| data.clone())
            .collect();
        assert_eq!(commands, vec![b"setenv a 1\0".to_vec(), b"saveenv\0".to_vec()]);
    }

    #[test]
    fn test_reset_counters_mode_gate() {
        let client = dfu_client();
        client.reset_counters().unwrap();
        let outs = control_outs(&client);
        assert_eq!((outs[0].0, outs[0].1), (0x21, 4));

        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        client.reset_counters().unwrap();
        assert!(control_outs(&client).is_empty());
    }

    #[test]
    fn test_finish_transfer_sequence() {
        let client = dfu_client();
        for _ in 0..3 {
            client.transport.queue_control_in(&DFU_STATUS_OK_REPLY);
        }
        client.finish_transfer().unwrap();

        let ops = client.transport.ops();
        assert!(matches!(
            ops[0],
            MockOp::ControlOut {
                bm_request_type: 0x21,
                b_request: 1,
                ..
            }
        ));
        let status_reads = ops
            .iter()
            .filter(|op| matches!(op, MockOp::ControlIn { b_request: 3, .. }))
            .count();
        assert_eq!(status_reads, 3);
        assert_eq!(ops.last(), Some(&MockOp::Reset));
    }

    #[test]
    fn test_limera1n_trigger_swallows_timeout() {
        let client = dfu_client();
        client
            .transport
            .queue_control_out_err(TransportError::Timeout(Duration::from_millis(100)));
        client.trigger_limera1n_exploit().unwrap();
        let outs = control_outs(&client);
        assert_eq!((outs[0].0, outs[0].1), (0x21, 2));
    }
}
