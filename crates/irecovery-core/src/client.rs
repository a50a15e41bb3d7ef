//! Client sessions: discovery, mode-aware open, reconnect and teardown.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::EventObserver;
use crate::info::DeviceInfo;
use crate::kis;
use crate::protocol::Mode;
use crate::transport::nusb::list_recognised_devices;
use crate::transport::{NusbTransport, UsbTransport};

/// Passing this in place of an ECID asks for a WTF-mode device only;
/// the ECID filter is disabled (it cannot be read in WTF mode).
pub const ECID_WTF_MODE: u64 = 0x1222;

/// A live connection to a device in one of the recognised boot modes.
///
/// The session is owned by one caller; the library never touches it from
/// another thread. All I/O goes through the transport the session owns.
pub struct Client<T: UsbTransport = NusbTransport> {
    pub(crate) transport: T,
    pub(crate) mode: Mode,
    pub(crate) is_kis: bool,
    pub(crate) usb_config: u8,
    pub(crate) usb_interface: u8,
    pub(crate) usb_alt_interface: u8,
    pub(crate) kis_sequence: u16,
    pub(crate) device_info: DeviceInfo,
    pub(crate) observer: Option<Arc<dyn EventObserver>>,
}

impl<T: UsbTransport> Client<T> {
    /// Wrap an already-open transport. This is how alternative backends
    /// (and the test mock) enter the library.
    pub fn with_transport(transport: T, mode: Mode) -> Self {
        let device_info = DeviceInfo {
            pid: mode.pid(),
            ..Default::default()
        };
        Self {
            transport,
            mode,
            is_kis: false,
            usb_config: 0,
            usb_interface: 0,
            usb_alt_interface: 0,
            kis_sequence: 0,
            device_info,
            observer: None,
        }
    }

    /// The boot mode the device was found in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The mode's USB product id.
    pub fn get_mode(&self) -> u32 {
        self.mode.pid() as u32
    }

    /// Whether the session completed the KIS handshake.
    pub fn is_kis(&self) -> bool {
        self.is_kis
    }

    /// Identity parsed at open time.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Install the observer receiving this session's events.
    pub fn set_observer(&mut self, observer: Arc<dyn EventObserver>) {
        self.observer = Some(observer);
    }

    /// Remove the observer; later events are dropped.
    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    /// Select a USB configuration.
    pub fn usb_set_configuration(&mut self, configuration: u8) -> Result<()> {
        debug!(configuration, "setting configuration");
        self.transport
            .set_configuration(configuration)
            .map_err(|_| Error::UsbConfiguration)?;
        self.usb_config = configuration;
        Ok(())
    }

    /// Claim an interface and select its alt setting.
    pub fn usb_set_interface(&mut self, interface: u8, alt_setting: u8) -> Result<()> {
        debug!(interface, alt_setting, "setting interface");
        self.transport
            .set_interface(interface, alt_setting)
            .map_err(|_| Error::UsbInterface)?;
        self.usb_interface = interface;
        self.usb_alt_interface = alt_setting;
        Ok(())
    }

    /// Synchronous control transfer, device to host.
    pub fn usb_control_in(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .transport
            .control_in(bm_request_type, b_request, w_value, w_index, buf, timeout)?)
    }

    /// Synchronous control transfer, host to device.
    pub fn usb_control_out(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .transport
            .control_out(bm_request_type, b_request, w_value, w_index, data, timeout)?)
    }

    /// Synchronous bulk read.
    pub fn usb_bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.transport.bulk_in(endpoint, buf, timeout)?)
    }

    /// Synchronous bulk write.
    pub fn usb_bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.transport.bulk_out(endpoint, data, timeout)?)
    }

    /// Reset the device. The device dropping off the bus to reboot is the
    /// expected outcome, not an error.
    pub fn reset(&self) -> Result<()> {
        self.transport.reset()?;
        Ok(())
    }

    /// Tear the session down, firing the `disconnected` event first.
    pub fn close(mut self) {
        self.emit_disconnected();
        // DFU, WTF and KIS sessions never claimed an interface worth
        // releasing; everything else did.
        if !matches!(self.mode, Mode::Dfu | Mode::Wtf) && !self.is_kis {
            debug!(
                config = self.usb_config,
                interface = self.usb_interface,
                alt = self.usb_alt_interface,
                "releasing interface"
            );
            let _ = self.transport.release_interface();
        }
    }

    /// Read the serial string and the nonce descriptor, populating the
    /// identity record. Unreadable descriptors leave fields empty.
    pub(crate) fn load_identity(&mut self) {
        let serial = self
            .transport
            .serial_number_index()
            .and_then(|index| self.transport.get_string_descriptor_ascii(index))
            .unwrap_or_default();

        self.device_info = DeviceInfo::from_iboot_string(&serial);
        self.device_info.pid = self.mode.pid();

        // Nonces are published separately, in string descriptor 1.
        if let Ok(nonce_buf) = self.transport.get_string_descriptor_ascii(1) {
            self.device_info.ap_nonce = crate::info::extract_nonce(&nonce_buf, "NONC");
            self.device_info.sep_nonce = crate::info::extract_nonce(&nonce_buf, "SNON");
        }
    }

    /// Run the KIS enable handshake and replace the identity with the one
    /// from the KIS info block.
    pub(crate) fn kis_handshake(&mut self) -> Result<()> {
        kis::enable(&self.transport, &mut self.kis_sequence)?;
        let (_descriptor, mut device_info) =
            kis::load_device_info(&self.transport, &mut self.kis_sequence)?;
        device_info.pid = self.mode.pid();
        self.device_info = device_info;
        self.is_kis = true;
        Ok(())
    }

    pub(crate) fn emit_connected(&self) {
        if let Some(observer) = &self.observer {
            observer.on_connected();
        }
    }

    pub(crate) fn emit_disconnected(&self) {
        if let Some(observer) = &self.observer {
            observer.on_disconnected();
        }
    }

    pub(crate) fn emit_progress(&self, percent: f64, bytes: u64, operation: &str) {
        if let Some(observer) = &self.observer {
            observer.on_progress(percent, bytes, operation);
        } else {
            debug!(bytes, operation, "{:.1}%", percent);
        }
    }

    pub(crate) fn pre_command(&self, command: &str) -> bool {
        match &self.observer {
            Some(observer) => observer.on_pre_command(command),
            None => false,
        }
    }

    pub(crate) fn post_command(&self, command: &str) -> bool {
        match &self.observer {
            Some(observer) => observer.on_post_command(command),
            None => false,
        }
    }

    pub(crate) fn emit_received(&self, data: &[u8]) -> bool {
        match &self.observer {
            Some(observer) => observer.on_received(data),
            None => false,
        }
    }
}

impl Client<NusbTransport> {
    /// Find and open a device.
    ///
    /// `ecid` zero accepts any device; [`ECID_WTF_MODE`] restricts the scan
    /// to WTF-mode devices and disables the ECID filter. WTF-mode devices
    /// are otherwise skipped when a specific ECID is wanted, since their
    /// ECID cannot be read.
    pub fn open_with_ecid(mut ecid: u64) -> Result<Self> {
        crate::ensure_init();

        let wtf_only = ecid == ECID_WTF_MODE;
        if wtf_only {
            ecid = 0;
        }

        let candidates = list_recognised_devices().map_err(|_| Error::UnableToConnect)?;

        for candidate in candidates {
            let Some(mode) = Mode::from_pid(candidate.product_id()) else {
                continue;
            };
            if wtf_only && mode != Mode::Wtf {
                continue;
            }
            if ecid != 0 && mode == Mode::Wtf {
                continue;
            }

            let transport = match NusbTransport::open(&candidate) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "cannot connect to candidate");
                    if ecid != 0 {
                        continue;
                    }
                    return Err(Error::UnableToConnect);
                }
            };

            let mut client = Client::with_transport(transport, mode);
            client.load_identity();

            // In KIS mode the ECID is unknown until the info block loads.
            if ecid != 0 && mode != Mode::PortDfu && client.device_info.ecid != Some(ecid) {
                client.close();
                continue;
            }

            client.usb_set_configuration(1)?;
            client.usb_set_interface(0, 0)?;
            if matches!(mode, Mode::Recovery3 | Mode::Recovery4) {
                client.usb_set_interface(1, 1)?;
            }

            if mode == Mode::PortDfu {
                // The enable sequence is what tells KIS apart from plain
                // Port DFU on the shared product id. A rejected handshake
                // means the latter: keep the identity parsed from the
                // serial string and stay in the candidate loop.
                if let Err(e) = client.kis_handshake() {
                    debug!(error = %e, "KIS handshake rejected, plain Port DFU device");
                }
                if ecid != 0 && client.device_info.ecid != Some(ecid) {
                    client.close();
                    continue;
                }
            }

            if let Some(found) = client.device_info.ecid {
                info!(ecid = format!("{found:016x}"), mode = %mode, "device opened");
            }
            client.emit_connected();
            return Ok(client);
        }

        Err(Error::UnableToConnect)
    }

    /// `open_with_ecid` in a retry loop with one-second back-off.
    pub fn open_with_ecid_and_attempts(ecid: u64, attempts: u32) -> Result<Self> {
        for _ in 0..attempts {
            match Self::open_with_ecid(ecid) {
                Ok(client) => return Ok(client),
                Err(_) => {
                    debug!("connection failed, waiting 1 sec before retry");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        Err(Error::UnableToConnect)
    }

    /// Close and reopen the same device (by ECID), preserving the
    /// observer. Waits `initial_pause` before the first attempt to give a
    /// rebooting device time to drop off the bus.
    pub fn reconnect(self, initial_pause: Duration) -> Result<Self> {
        let observer = self.observer.clone();
        let ecid = self.device_info.ecid.unwrap_or(0);

        self.close();

        if !initial_pause.is_zero() {
            debug!(pause = ?initial_pause, "waiting for the device to pop up");
            thread::sleep(initial_pause);
        }

        let mut client = Self::open_with_ecid_and_attempts(ecid, 10)?;
        client.observer = observer;
        client.emit_connected();
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockOp, MockTransport};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        connected: AtomicU32,
        disconnected: AtomicU32,
    }

    impl EventObserver for CountingObserver {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_configuration_and_interface_selection() {
        let mut client = Client::with_transport(MockTransport::new(), Mode::Recovery4);
        client.usb_set_configuration(1).unwrap();
        client.usb_set_interface(0, 0).unwrap();
        client.usb_set_interface(1, 1).unwrap();
        assert_eq!(client.usb_config, 1);
        assert_eq!(client.usb_interface, 1);
        assert_eq!(client.usb_alt_interface, 1);
        assert_eq!(
            client.transport.ops(),
            vec![
                MockOp::SetConfiguration(1),
                MockOp::SetInterface(0, 0),
                MockOp::SetInterface(1, 1),
            ]
        );
    }

    #[test]
    fn test_close_releases_interface_in_recovery_only() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery2);
        let ops = client.transport.ops.clone();
        client.close();
        assert_eq!(ops.lock().unwrap().last(), Some(&MockOp::ReleaseInterface));

        let client = Client::with_transport(MockTransport::new(), Mode::Dfu);
        let ops = client.transport.ops.clone();
        client.close();
        assert!(ops.lock().unwrap().is_empty());
    }

    #[test]
    fn test_close_fires_disconnected() {
        let observer = Arc::new(CountingObserver::default());
        let mut client = Client::with_transport(MockTransport::new(), Mode::Dfu);
        client.set_observer(observer.clone());
        client.emit_connected();
        client.close();
        assert_eq!(observer.connected.load(Ordering::SeqCst), 1);
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_mode_reports_pid() {
        let client = Client::with_transport(MockTransport::new(), Mode::Recovery1);
        assert_eq!(client.get_mode(), 0x1280);
        let client = Client::with_transport(MockTransport::new(), Mode::Dfu);
        assert_eq!(client.get_mode(), 0x1227);
    }

    #[test]
    fn test_load_identity_parses_serial_and_nonces() {
        let mock = MockTransport::new();
        // Device descriptor with iSerialNumber = 3.
        let mut descriptor = [0u8; 18];
        descriptor[0] = 18;
        descriptor[1] = 1;
        descriptor[16] = 3;
        mock.queue_control_in(&descriptor);
        mock.queue_language_descriptor();
        mock.queue_string_descriptor("CPID:8010 BDID:0E ECID:001122334455AABB SRTG:[iBoot-3401.0.0.1.16]");
        mock.queue_language_descriptor();
        mock.queue_string_descriptor("NONC:0102AABB SNON:DEADBEEF");

        let mut client = Client::with_transport(mock, Mode::Recovery2);
        client.load_identity();

        let info = client.device_info();
        assert_eq!(info.cpid, Some(0x8010));
        assert_eq!(info.bdid, Some(0x0E));
        assert_eq!(info.ecid, Some(0x001122334455AABB));
        assert_eq!(info.srtg.as_deref(), Some("iBoot-3401.0.0.1.16"));
        assert_eq!(info.ap_nonce, Some(vec![0x01, 0x02, 0xAA, 0xBB]));
        assert_eq!(info.sep_nonce, Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(info.pid, 0x1281);
    }

    #[test]
    fn test_failed_kis_handshake_keeps_serial_identity() {
        let mock = MockTransport::new();
        let mut descriptor = [0u8; 18];
        descriptor[0] = 18;
        descriptor[1] = 1;
        descriptor[16] = 3;
        mock.queue_control_in(&descriptor);
        mock.queue_language_descriptor();
        mock.queue_string_descriptor("CPID:8015 BDID:06 ECID:00AA11BB22CC33DD");
        mock.queue_language_descriptor();
        mock.queue_string_descriptor("NONC:0102AABB");
        // No bulk replies queued: the enable write gets no answer, the
        // way a plain Port DFU device rejects the KIS handshake.

        let mut client = Client::with_transport(mock, Mode::PortDfu);
        client.load_identity();
        assert!(client.kis_handshake().is_err());

        assert!(!client.is_kis());
        assert_eq!(client.device_info().cpid, Some(0x8015));
        assert_eq!(client.device_info().bdid, Some(0x06));
        assert_eq!(client.device_info().ecid, Some(0x00AA11BB22CC33DD));
        assert_eq!(client.device_info().ap_nonce, Some(vec![0x01, 0x02, 0xAA, 0xBB]));
    }

    #[test]
    fn test_load_identity_survives_unreadable_descriptors() {
        let mut client = Client::with_transport(MockTransport::new(), Mode::Dfu);
        client.load_identity();
        assert_eq!(client.device_info().ecid, None);
        assert_eq!(client.device_info().serial_string.as_deref(), Some(""));
    }
}
