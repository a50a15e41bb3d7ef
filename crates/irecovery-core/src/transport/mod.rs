//! USB transport layer.
//!
//! [`UsbTransport`] is the seam between the protocol engines and the host
//! platform: one production backend (nusb) and one scripted backend for
//! tests. The core logic above this module contains no platform branches.

pub mod mock;
pub mod nusb;
pub mod stub;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use stub::StubTransport;
pub use traits::{TransportError, UsbTransport};
