//! Device identity parsing.
//!
//! iBoot and DFU devices publish their identity as a space-delimited list
//! of `TAG:VALUE` and `TAG:[VALUE]` fields in the USB serial string, with
//! per-boot nonces in string descriptor 1. KIS devices return the same
//! information inside a binary info reply. Both paths fill the same
//! [`DeviceInfo`] record; absent tags simply leave their field empty.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Identity of a connected device, filled on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub cpid: Option<u32>,
    pub cprv: Option<u32>,
    pub cpfm: Option<u32>,
    pub scep: Option<u32>,
    pub bdid: Option<u32>,
    pub ibfl: Option<u32>,
    pub ecid: Option<u64>,
    /// USB product id the device was observed with.
    pub pid: u16,
    pub srnm: Option<String>,
    pub imei: Option<String>,
    pub srtg: Option<String>,
    /// The raw serial string the fields were parsed from.
    pub serial_string: Option<String>,
    pub ap_nonce: Option<Vec<u8>>,
    pub sep_nonce: Option<Vec<u8>>,
}

impl DeviceInfo {
    /// Parse the known tags out of an iBoot serial string.
    pub fn from_iboot_string(iboot_string: &str) -> Self {
        let mut info = DeviceInfo {
            serial_string: Some(iboot_string.to_string()),
            ..Default::default()
        };

        info.cpid = hex_tag_u32(iboot_string, "CPID:");
        info.cprv = hex_tag_u32(iboot_string, "CPRV:");
        info.cpfm = hex_tag_u32(iboot_string, "CPFM:");
        info.scep = hex_tag_u32(iboot_string, "SCEP:");
        info.bdid = hex_tag_u32(iboot_string, "BDID:");
        info.ibfl = hex_tag_u32(iboot_string, "IBFL:");
        info.ecid = hex_tag_u64(iboot_string, "ECID:");

        info.srnm = bracket_tag(iboot_string, "SRNM:[");
        info.imei = bracket_tag(iboot_string, "IMEI:[");
        info.srtg = bracket_tag(iboot_string, "SRTG:[");

        info
    }
}

/// Locate `tag` (ending in `:`) and parse the hex digits after it.
fn hex_tag_u64(s: &str, tag: &str) -> Option<u64> {
    let rest = &s[s.find(tag)? + tag.len()..];
    let rest = rest.trim_start_matches(' ');
    let end = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    u64::from_str_radix(&rest[..end], 16).ok()
}

fn hex_tag_u32(s: &str, tag: &str) -> Option<u32> {
    hex_tag_u64(s, tag).map(|v| v as u32)
}

/// Extract a `TAG:[value]` field.
fn bracket_tag(s: &str, tag: &str) -> Option<String> {
    let rest = &s[s.find(tag)? + tag.len()..];
    let end = rest.find(']')?;
    Some(rest[..end].to_string())
}

/// Extract a nonce published as `TAG:<hex pairs>` in a nonce buffer.
///
/// The tag only matches when the `taglen` characters before a colon equal
/// it literally and the match starts the buffer or follows a space;
/// `SNONC:` must not satisfy a lookup for `NONC`.
pub fn extract_nonce(buf: &str, tag: &str) -> Option<Vec<u8>> {
    let bytes = buf.as_bytes();
    let mut start = 0usize;
    while let Some(rel) = buf[start..].find(':') {
        let colon = start + rel;
        if colon >= tag.len()
            && &buf[colon - tag.len()..colon] == tag
            && (colon == tag.len() || bytes[colon - tag.len() - 1] == b' ')
        {
            let value = buf[colon + 1..].trim_start_matches(' ');
            let value = match value.find(' ') {
                Some(sp) => &value[..sp],
                None => value,
            };
            return decode_hex_pairs(value);
        }
        // Skip ahead to the token after the next space.
        match buf[colon..].find(' ') {
            Some(rel_sp) => start = colon + rel_sp + 1,
            None => break,
        }
    }
    debug!(tag, "nonce tag not found");
    None
}

fn decode_hex_pairs(s: &str) -> Option<Vec<u8>> {
    let len = s.len() / 2;
    if len == 0 {
        return None;
    }
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        match u8::from_str_radix(&s[i * 2..i * 2 + 2], 16) {
            Ok(b) => out.push(b),
            Err(_) => {
                warn!(pair = &s[i * 2..i * 2 + 2], "unexpected data in nonce");
                return None;
            }
        }
    }
    Some(out)
}

/// Serialise a nonce back to its normalised form: upper-case hex pairs.
pub fn format_nonce(nonce: &[u8]) -> String {
    nonce.iter().map(|b| format!("{b:02X}")).collect()
}

// ============================================================================
// KIS info reply
// ============================================================================

/// Byte length of the standard USB device descriptor embedded in the reply.
const KIS_DEVICE_DESCRIPTOR_SIZE: usize = 18;

/// Offsets into the GET_INFO reply payload (after the 16-byte header).
const KIS_INFO_MANUFACTURER_OFFSET: usize = 0x14;
const KIS_INFO_PRODUCT_OFFSET: usize = 0x94;
const KIS_INFO_SERIAL_OFFSET: usize = 0x114;
const KIS_INFO_NONCES_OFFSET: usize = 0x214;

/// Total payload size of a GET_INFO reply.
pub const KIS_INFO_PAYLOAD_SIZE: usize = 0x314;

/// USB device descriptor fields carried in the KIS info reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KisDeviceDescriptor {
    pub bcd_usb: u16,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
}

impl KisDeviceDescriptor {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < KIS_DEVICE_DESCRIPTOR_SIZE {
            return Err(Error::InvalidInput);
        }
        let mut cursor = Cursor::new(data);
        let _b_length = cursor.read_u8().map_err(|_| Error::InvalidInput)?;
        let _b_descriptor_type = cursor.read_u8().map_err(|_| Error::InvalidInput)?;
        let bcd_usb = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidInput)?;
        // class / subclass / protocol / ep0 max packet size
        cursor.set_position(8);
        let id_vendor = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidInput)?;
        let id_product = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidInput)?;
        let bcd_device = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidInput)?;
        let i_manufacturer = cursor.read_u8().map_err(|_| Error::InvalidInput)?;
        let i_product = cursor.read_u8().map_err(|_| Error::InvalidInput)?;
        let i_serial_number = cursor.read_u8().map_err(|_| Error::InvalidInput)?;
        Ok(Self {
            bcd_usb,
            id_vendor,
            id_product,
            bcd_device,
            i_manufacturer,
            i_product,
            i_serial_number,
        })
    }
}

/// Read a 16-bit length-prefixed UTF-16LE string field at `offset`.
fn read_utf16_field(payload: &[u8], offset: usize) -> Result<String> {
    if payload.len() < offset + 2 {
        return Err(Error::InvalidInput);
    }
    let len = u16::from_le_bytes([payload[offset], payload[offset + 1]]) as usize;
    let start = offset + 2;
    if len % 2 != 0 || payload.len() < start + len {
        return Err(Error::InvalidInput);
    }
    let units: Vec<u16> = payload[start..start + len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Parse a KIS GET_INFO reply payload into a device-info record.
///
/// The serial text goes through the iBoot parser; the nonce buffer goes
/// through the regular nonce extractor.
pub fn device_info_from_kis_payload(payload: &[u8]) -> Result<(KisDeviceDescriptor, DeviceInfo)> {
    if payload.len() < KIS_INFO_PAYLOAD_SIZE {
        return Err(Error::InvalidInput);
    }

    let descriptor = KisDeviceDescriptor::parse(payload)?;
    let _manufacturer = read_utf16_field(payload, KIS_INFO_MANUFACTURER_OFFSET)?;
    let _product = read_utf16_field(payload, KIS_INFO_PRODUCT_OFFSET)?;
    let serial = read_utf16_field(payload, KIS_INFO_SERIAL_OFFSET)?;

    let nonces_raw = &payload[KIS_INFO_NONCES_OFFSET..KIS_INFO_NONCES_OFFSET + 0x100];
    let nul = nonces_raw
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(nonces_raw.len());
    let nonces = String::from_utf8_lossy(&nonces_raw[..nul]).into_owned();

    let mut info = DeviceInfo::from_iboot_string(&serial);
    info.ap_nonce = extract_nonce(&nonces, "NONC");
    info.sep_nonce = extract_nonce(&nonces, "SNON");

    Ok((descriptor, info))
}
