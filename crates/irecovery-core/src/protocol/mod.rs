//! Protocol-level constants and primitives shared by the upload engine,
//! the connection manager and the KIS framing.

pub mod constants;
pub mod crc32;

pub use constants::{APPLE_VENDOR_ID, Mode, USB_TIMEOUT};
pub use crc32::{CRC32_INIT, crc32_update};
