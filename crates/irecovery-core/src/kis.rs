//! KIS ("Debug USB") protocol: request/reply framing, the enable
//! sequence, info retrieval and the chunked upload.
//!
//! Requests are little-endian packed: a 16-byte header, then the argument
//! words, then the payload. The portal selects the bulk endpoint pair;
//! replies come back on the matching IN endpoint.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::info::{self, DeviceInfo, KisDeviceDescriptor};
use crate::protocol::USB_TIMEOUT;
use crate::transport::UsbTransport;

/// Configuration portal, endpoint 1.
pub const PORTAL_CONFIG: u8 = 0x01;
/// Restore state machine portal, endpoint 3.
pub const PORTAL_RSM: u8 = 0x10;

/// Indices used by this library.
pub const INDEX_ENABLE_A: u16 = 0x0A;
pub const INDEX_ENABLE_B: u16 = 0x14;
pub const INDEX_UPLOAD_CHUNK: u16 = 0x0D;
pub const INDEX_GET_INFO: u16 = 0x100;
pub const INDEX_BOOT_IMAGE: u16 = 0x103;

const KIS_VERSION: u8 = 0xA0;

/// Packed request/reply header size.
pub const HEADER_SIZE: usize = 16;

/// Upload chunk size.
pub const CHUNK_SIZE: usize = 0x4000;

fn endpoint_for_portal(portal: u8) -> Result<u8> {
    match portal {
        PORTAL_CONFIG => Ok(0x01),
        PORTAL_RSM => Ok(0x03),
        _ => Err(Error::InvalidInput),
    }
}

/// A KIS request before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KisRequest {
    pub sequence: u16,
    pub portal: u8,
    pub index: u16,
    /// Number of 32-bit words the device should reply with.
    pub reply_words: u32,
    pub args: Vec<u32>,
    pub payload: Vec<u8>,
}

impl KisRequest {
    /// Encode to wire bytes, enforcing the header's field ranges:
    /// at most 255 arguments, a 10-bit index, a 14-bit reply word count,
    /// and a total size that fits the 32-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.args.len() > 0xFF
            || self.index >= 1 << 10
            || self.reply_words >= 1 << 14
            || (self.payload.len() as u64) + 4 * (self.args.len() as u64) > u32::MAX as u64
        {
            return Err(Error::InvalidInput);
        }

        let req_size = HEADER_SIZE as u32 + 4 * self.args.len() as u32 + self.payload.len() as u32;

        let mut out = Vec::with_capacity(req_size as usize);
        out.write_u16::<LittleEndian>(self.sequence)
            .map_err(|_| Error::Unknown)?;
        out.push(KIS_VERSION);
        out.push(self.portal);
        out.push(self.args.len() as u8);
        out.push((self.index & 0xFF) as u8);
        out.push((((self.index >> 8) & 0x03) as u8) | (((self.reply_words << 2) & 0xFC) as u8));
        out.push(((self.reply_words >> 6) & 0xFF) as u8);
        out.write_u32::<LittleEndian>(req_size)
            .map_err(|_| Error::Unknown)?;
        out.write_u32::<LittleEndian>(0).map_err(|_| Error::Unknown)?;
        for &arg in &self.args {
            out.write_u32::<LittleEndian>(arg)
                .map_err(|_| Error::Unknown)?;
        }
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// A decoded reply: the echoed header fields plus the data words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KisReply {
    pub sequence: u16,
    pub portal: u8,
    pub reply_size: u32,
    pub data: Vec<u8>,
}

/// Parse a raw reply buffer.
pub fn parse_reply(bytes: &[u8]) -> Result<KisReply> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::InvalidInput);
    }
    let mut cursor = Cursor::new(bytes);
    let sequence = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| Error::InvalidInput)?;
    let _version = cursor.read_u8().map_err(|_| Error::InvalidInput)?;
    let portal = cursor.read_u8().map_err(|_| Error::InvalidInput)?;
    cursor.set_position(12);
    let reply_size = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::InvalidInput)?;
    Ok(KisReply {
        sequence,
        portal,
        reply_size,
        data: bytes[HEADER_SIZE..].to_vec(),
    })
}

/// Issue one request and read its reply.
pub fn request<T: UsbTransport>(
    transport: &T,
    sequence: &mut u16,
    portal: u8,
    index: u16,
    reply_words: u32,
    args: &[u32],
    payload: &[u8],
) -> Result<KisReply> {
    let endpoint = endpoint_for_portal(portal)?;
    let req = KisRequest {
        sequence: *sequence,
        portal,
        index,
        reply_words,
        args: args.to_vec(),
        payload: payload.to_vec(),
    };
    let bytes = req.encode()?;
    *sequence = sequence.wrapping_add(1);

    trace!(portal, index, len = bytes.len(), "KIS request");
    let sent = transport.bulk_out(endpoint, &bytes, USB_TIMEOUT)?;
    if sent != bytes.len() {
        return Err(Error::UsbUpload);
    }

    let mut reply = vec![0u8; HEADER_SIZE + reply_words as usize * 4];
    let received = transport.bulk_in(endpoint | 0x80, &mut reply, USB_TIMEOUT)?;
    if received < HEADER_SIZE {
        return Err(Error::UsbStatus);
    }
    reply.truncate(received);
    parse_reply(&reply)
}

/// Write a single 32-bit value to a portal index.
pub fn config_write32<T: UsbTransport>(
    transport: &T,
    sequence: &mut u16,
    portal: u8,
    index: u16,
    value: u32,
) -> Result<()> {
    request(transport, sequence, portal, index, 1, &[value], &[])?;
    Ok(())
}

/// The mode-enable handshake run right after opening a KIS device.
pub fn enable<T: UsbTransport>(transport: &T, sequence: &mut u16) -> Result<()> {
    debug!("enabling KIS mode");
    config_write32(transport, sequence, PORTAL_CONFIG, INDEX_ENABLE_A, 0x21)?;
    config_write32(transport, sequence, PORTAL_CONFIG, INDEX_ENABLE_B, 0x01)?;
    Ok(())
}

/// Fetch and parse the device info block.
pub fn load_device_info<T: UsbTransport>(
    transport: &T,
    sequence: &mut u16,
) -> Result<(KisDeviceDescriptor, DeviceInfo)> {
    debug!("loading device info over KIS");
    let reply_words = ((HEADER_SIZE + info::KIS_INFO_PAYLOAD_SIZE) / 4) as u32;
    let reply = request(
        transport,
        sequence,
        PORTAL_RSM,
        INDEX_GET_INFO,
        reply_words,
        &[],
        &[],
    )?;
    info::device_info_from_kis_payload(&reply.data)
}

/// Upload a buffer in `CHUNK_SIZE` pieces.
///
/// Each chunk is an upload request with three argument words: the 64-bit
/// destination offset split low/high, then the chunk length. `on_chunk`
/// runs after every acknowledged chunk with the running byte count. When
/// `notify_finish` is set the total length is written to the boot-image
/// index afterwards.
pub fn upload<T: UsbTransport>(
    transport: &T,
    sequence: &mut u16,
    buffer: &[u8],
    notify_finish: bool,
    mut on_chunk: impl FnMut(u64),
) -> Result<()> {
    let mut offset = 0usize;
    while offset < buffer.len() {
        let chunk = &buffer[offset..buffer.len().min(offset + CHUNK_SIZE)];
        let address = offset as u64;
        let args = [
            (address & 0xFFFF_FFFF) as u32,
            (address >> 32) as u32,
            chunk.len() as u32,
        ];
        request(
            transport,
            sequence,
            PORTAL_RSM,
            INDEX_UPLOAD_CHUNK,
            1,
            &args,
            chunk,
        )?;
        offset += chunk.len();
        on_chunk(offset as u64);
    }

    if notify_finish {
        config_write32(
            transport,
            sequence,
            PORTAL_RSM,
            INDEX_BOOT_IMAGE,
            buffer.len() as u32,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockOp, MockTransport};

    fn reply_bytes(sequence: u16, portal: u8, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&sequence.to_le_bytes());
        out.push(KIS_VERSION);
        out.push(portal);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&((HEADER_SIZE + data.len()) as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_request_encoding() {
        let req = KisRequest {
            sequence: 0x0102,
            portal: PORTAL_RSM,
            index: 0x103,
            reply_words: 1,
            args: vec![0x4000],
            payload: vec![0xAA, 0xBB],
        };
        let bytes = req.encode().unwrap();
        // 16-byte header + one argument word + two payload bytes.
        assert_eq!(bytes.len(), 22);
        assert_eq!(&bytes[0..2], &[0x02, 0x01]);
        assert_eq!(bytes[2], 0xA0);
        assert_eq!(bytes[3], PORTAL_RSM);
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 0x03); // index low byte
        // index high bits (0x103 >> 8 = 1) in bits 0-1, reply words in 2-7.
        assert_eq!(bytes[6], 0x01 | (1 << 2));
        assert_eq!(bytes[7], 0x00);
        assert_eq!(&bytes[8..12], &22u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        assert_eq!(&bytes[16..20], &0x4000u32.to_le_bytes());
        assert_eq!(&bytes[20..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_request_field_ranges() {
        let base = KisRequest {
            sequence: 0,
            portal: PORTAL_CONFIG,
            index: 0,
            reply_words: 0,
            args: vec![],
            payload: vec![],
        };

        let mut req = base.clone();
        req.index = 1 << 10;
        assert_eq!(req.encode().unwrap_err(), Error::InvalidInput);

        let mut req = base.clone();
        req.reply_words = 1 << 14;
        assert_eq!(req.encode().unwrap_err(), Error::InvalidInput);

        let mut req = base.clone();
        req.args = vec![0; 256];
        assert_eq!(req.encode().unwrap_err(), Error::InvalidInput);

        let mut req = base;
        req.index = (1 << 10) - 1;
        req.reply_words = (1 << 14) - 1;
        assert!(req.encode().is_ok());
    }

    #[test]
    fn test_reply_parse() {
        let raw = reply_bytes(7, PORTAL_RSM, &[1, 2, 3, 4]);
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.sequence, 7);
        assert_eq!(reply.portal, PORTAL_RSM);
        assert_eq!(reply.reply_size, 20);
        assert_eq!(reply.data, vec![1, 2, 3, 4]);
        assert!(parse_reply(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_enable_sequence_targets_config_portal() {
        let mock = MockTransport::new();
        mock.queue_bulk_in(&reply_bytes(0, PORTAL_CONFIG, &[0, 0, 0, 0]));
        mock.queue_bulk_in(&reply_bytes(1, PORTAL_CONFIG, &[0, 0, 0, 0]));

        let mut seq = 0u16;
        enable(&mock, &mut seq).unwrap();
        assert_eq!(seq, 2);

        let ops = mock.ops();
        // Two requests on endpoint 1, each followed by a read on 0x81.
        match &ops[0] {
            MockOp::BulkOut { endpoint, data } => {
                assert_eq!(*endpoint, 0x01);
                assert_eq!(data[5], INDEX_ENABLE_A as u8);
                assert_eq!(&data[16..20], &0x21u32.to_le_bytes());
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert!(matches!(ops[1], MockOp::BulkIn { endpoint: 0x81, .. }));
        match &ops[2] {
            MockOp::BulkOut { endpoint, data } => {
                assert_eq!(*endpoint, 0x01);
                assert_eq!(data[5], INDEX_ENABLE_B as u8);
                assert_eq!(&data[16..20], &0x01u32.to_le_bytes());
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_upload_chunking_and_notify() {
        let mock = MockTransport::new();
        // Two chunks plus the boot notify, each wanting a reply.
        for i in 0..3u16 {
            mock.queue_bulk_in(&reply_bytes(i, PORTAL_RSM, &[0, 0, 0, 0]));
        }

        let buffer = vec![0x5Au8; CHUNK_SIZE + 0x100];
        let mut seq = 0u16;
        let mut progress = Vec::new();
        upload(&mock, &mut seq, &buffer, true, |sent| progress.push(sent)).unwrap();

        assert_eq!(progress, vec![CHUNK_SIZE as u64, buffer.len() as u64]);

        let outs: Vec<_> = mock
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::BulkOut { endpoint, data } => Some((endpoint, data)),
                _ => None,
            })
            .collect();
        assert_eq!(outs.len(), 3);

        // First chunk: address 0, full chunk size, payload inline.
        let (ep, data) = &outs[0];
        assert_eq!(*ep, 0x03);
        assert_eq!(data[4], 3); // three argument words
        assert_eq!(&data[16..20], &0u32.to_le_bytes());
        assert_eq!(&data[20..24], &0u32.to_le_bytes());
        assert_eq!(&data[24..28], &(CHUNK_SIZE as u32).to_le_bytes());
        assert_eq!(data.len(), HEADER_SIZE + 12 + CHUNK_SIZE);

        // Second chunk: address advanced, short length.
        let (_, data) = &outs[1];
        assert_eq!(&data[16..20], &(CHUNK_SIZE as u32).to_le_bytes());
        assert_eq!(&data[24..28], &0x100u32.to_le_bytes());

        // Boot notify carries the total length.
        let (_, data) = &outs[2];
        assert_eq!(data[5], (INDEX_BOOT_IMAGE & 0xFF) as u8);
        assert_eq!(data[6] & 0x03, (INDEX_BOOT_IMAGE >> 8) as u8);
        assert_eq!(&data[16..20], &(buffer.len() as u32).to_le_bytes());
    }

    #[test]
    fn test_unknown_portal_rejected() {
        let mock = MockTransport::new();
        let mut seq = 0;
        let err = request(&mock, &mut seq, 0x7F, 0, 0, &[], &[]).unwrap_err();
        assert_eq!(err, Error::InvalidInput);
    }
}
