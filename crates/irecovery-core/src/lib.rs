//! irecovery-core: client library for the low-level boot environments of
//! Apple mobile devices over USB.
//!
//! Supports discovery and identification of devices in DFU, WTF, Recovery
//! and KIS ("Debug USB") modes, firmware uploads over the mode-specific
//! wire protocols, bootloader shell commands and environment variables,
//! and hot-plug tracking of arrivals and removals.
//!
//! # Architecture
//!
//! - **Protocol**: mode constants, CRC-32, the KIS request framing
//! - **Transport**: USB abstraction (nusb in production, a mock in tests)
//! - **Client**: discovery, mode-aware open, reconnect, teardown
//! - **Upload**: the DFU/Recovery/KIS upload flows and shell commands
//! - **Hotplug**: background add/remove tracking with listener fan-out
//! - **Devices**: the static hardware database
//!
//! # Example
//!
//! ```no_run
//! use irecovery_core::{Client, SendOptions};
//!
//! let mut client = Client::open_with_ecid(0).expect("no device found");
//! println!("mode: {:#06x}", client.get_mode());
//! client.send_file("ibec.img4", SendOptions::DFU_NOTIFY_FINISH).unwrap();
//! ```

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, Ordering};

pub mod client;
pub mod devices;
pub mod error;
pub mod events;
pub mod hotplug;
pub mod info;
pub mod kis;
pub mod protocol;
pub mod transport;
pub mod upload;

// Re-exports for convenience
pub use client::{Client, ECID_WTF_MODE};
pub use devices::{
    DeviceEntry, all_devices, lookup_by_client, lookup_by_hardware_model, lookup_by_product_type,
};
pub use error::{Error, Result, strerror};
pub use events::{EventObserver, TracingObserver};
pub use hotplug::{DeviceEvent, EventContext, device_event_subscribe, device_event_unsubscribe};
pub use info::DeviceInfo;
pub use protocol::Mode;
pub use transport::{MockTransport, NusbTransport, StubTransport, TransportError, UsbTransport};
pub use upload::SendOptions;

static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(0);

/// Run-once process-level initialisation: pick up the debug level from
/// the environment. Open paths call this on their own; the legacy
/// [`init`]/[`exit`] entry points exist only for API parity.
pub(crate) fn ensure_init() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        if let Ok(value) = std::env::var("LIBIRECOVERY_DEBUG_LEVEL") {
            set_debug_level(parse_c_int(&value));
        }
    });
}

/// Parse an integer the way C's `strtol(s, NULL, 0)` does: decimal by
/// default, hex with a `0x` prefix, zero on garbage.
fn parse_c_int(s: &str) -> i32 {
    let s = s.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        let end = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        s[..end].parse::<i64>().unwrap_or(0)
    };
    let value = if negative { -value } else { value };
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Legacy entry point; initialisation is automatic.
pub fn init() {
    ensure_init();
}

/// Legacy entry point; finalisation is automatic.
pub fn exit() {}

/// Set the process-wide debug level. Higher values produce more
/// diagnostics on standard error (via `tracing`).
pub fn set_debug_level(level: i32) {
    DEBUG_LEVEL.store(level, Ordering::Relaxed);
}

/// Current process-wide debug level.
pub fn debug_level() -> i32 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

/// Library version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
