//! USB identifiers and protocol constants for Apple boot-mode devices.

use std::fmt;
use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Apple Inc. vendor id.
pub const APPLE_VENDOR_ID: u16 = 0x05AC;

/// DFU mode product id.
pub const PID_DFU: u16 = 0x1227;
/// WTF mode product id (older devices, between DFU and Recovery).
pub const PID_WTF: u16 = 0x1222;
/// Port DFU / KIS ("Debug USB") product id.
pub const PID_PORT_DFU: u16 = 0x1881;
/// Recovery mode product ids.
pub const PID_RECOVERY_1: u16 = 0x1280;
pub const PID_RECOVERY_2: u16 = 0x1281;
pub const PID_RECOVERY_3: u16 = 0x1282;
pub const PID_RECOVERY_4: u16 = 0x1283;

/// All product ids the library recognises during discovery.
pub const RECOGNISED_PIDS: &[u16] = &[
    PID_DFU,
    PID_WTF,
    PID_PORT_DFU,
    PID_RECOVERY_1,
    PID_RECOVERY_2,
    PID_RECOVERY_3,
    PID_RECOVERY_4,
];

// ============================================================================
// Timing
// ============================================================================

/// Default timeout for USB transfers.
pub const USB_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the bulk reads in `receive`.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Upload engine
// ============================================================================

/// Bulk chunk size in Recovery mode.
pub const RECOVERY_PACKET_SIZE: usize = 0x8000;
/// Control chunk size in DFU/WTF mode.
pub const DFU_PACKET_SIZE: usize = 0x800;
/// Control chunk size under the small-packet option.
pub const DFU_SMALL_PACKET_SIZE: usize = 0x40;
/// Control chunk size when reading back in Recovery mode.
pub const RECOVERY_RECV_PACKET_SIZE: usize = 0x2000;

/// Recovery mode bulk upload endpoint.
pub const RECOVERY_UPLOAD_ENDPOINT: u8 = 0x04;
/// Recovery mode bulk response endpoint.
pub const RECOVERY_RESPONSE_ENDPOINT: u8 = 0x81;

/// Fixed 12-byte trailer prefix ("DFU magic") appended to the last packet.
pub const DFU_MAGIC: [u8; 12] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xAC, 0x05, 0x00, 0x01, 0x55, 0x46, 0x44, 0x10,
];

/// DFU state machine values read via DFU_GETSTATE.
pub const DFU_STATE_IDLE: u8 = 2;
pub const DFU_STATE_ERROR: u8 = 10;

/// Expected DFU status byte after a data packet.
pub const DFU_STATUS_OK: u8 = 5;

// ============================================================================
// Modes
// ============================================================================

/// Boot mode a device was found in, keyed by its USB product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Dfu,
    Wtf,
    /// Port DFU / KIS share a product id; a session that completed the KIS
    /// handshake additionally carries the `is_kis` flag.
    PortDfu,
    Recovery1,
    Recovery2,
    Recovery3,
    Recovery4,
}

impl Mode {
    /// Map a product id to a mode, if recognised.
    pub fn from_pid(pid: u16) -> Option<Self> {
        match pid {
            PID_DFU => Some(Mode::Dfu),
            PID_WTF => Some(Mode::Wtf),
            PID_PORT_DFU => Some(Mode::PortDfu),
            PID_RECOVERY_1 => Some(Mode::Recovery1),
            PID_RECOVERY_2 => Some(Mode::Recovery2),
            PID_RECOVERY_3 => Some(Mode::Recovery3),
            PID_RECOVERY_4 => Some(Mode::Recovery4),
            _ => None,
        }
    }

    /// The USB product id of this mode.
    pub fn pid(self) -> u16 {
        match self {
            Mode::Dfu => PID_DFU,
            Mode::Wtf => PID_WTF,
            Mode::PortDfu => PID_PORT_DFU,
            Mode::Recovery1 => PID_RECOVERY_1,
            Mode::Recovery2 => PID_RECOVERY_2,
            Mode::Recovery3 => PID_RECOVERY_3,
            Mode::Recovery4 => PID_RECOVERY_4,
        }
    }

    /// Recovery modes expose the iBoot shell with bulk upload.
    pub fn is_recovery(self) -> bool {
        matches!(
            self,
            Mode::Recovery1 | Mode::Recovery2 | Mode::Recovery3 | Mode::Recovery4
        )
    }

    /// DFU-like modes use the control-transfer upload with CRC trailer.
    pub fn is_dfu_like(self) -> bool {
        matches!(self, Mode::Dfu | Mode::Wtf | Mode::PortDfu)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Dfu => write!(f, "DFU"),
            Mode::Wtf => write!(f, "WTF"),
            Mode::PortDfu => write!(f, "Port DFU"),
            Mode::Recovery1 | Mode::Recovery2 | Mode::Recovery3 | Mode::Recovery4 => {
                write!(f, "Recovery")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_roundtrip() {
        for &pid in RECOGNISED_PIDS {
            let mode = Mode::from_pid(pid).unwrap();
            assert_eq!(mode.pid(), pid);
        }
        assert_eq!(Mode::from_pid(0x12A8), None);
    }

    #[test]
    fn test_mode_classes() {
        assert!(Mode::Dfu.is_dfu_like());
        assert!(Mode::Wtf.is_dfu_like());
        assert!(Mode::PortDfu.is_dfu_like());
        assert!(!Mode::Recovery2.is_dfu_like());
        assert!(Mode::Recovery1.is_recovery());
        assert!(Mode::Recovery4.is_recovery());
        assert!(!Mode::Dfu.is_recovery());
    }
}
