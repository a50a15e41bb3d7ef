//! Scripted USB transport for unit-testing the protocol engines.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, TransportResult, UsbTransport};

/// One operation the engine performed against the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    ControlIn {
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        len: usize,
    },
    ControlOut {
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: Vec<u8>,
    },
    BulkIn {
        endpoint: u8,
        len: usize,
    },
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    SetConfiguration(u8),
    SetInterface(u8, u8),
    ReleaseInterface,
    Reset,
}

/// Mock transport: captures every operation and replays queued replies.
///
/// IN transfers pop from their reply queue and fail fast when it runs dry;
/// OUT transfers succeed unless a result was queued for them.
#[derive(Default)]
pub struct MockTransport {
    pub(crate) ops: Arc<Mutex<Vec<MockOp>>>,
    control_in_replies: Arc<Mutex<VecDeque<TransportResult<Vec<u8>>>>>,
    control_out_results: Arc<Mutex<VecDeque<TransportResult<()>>>>,
    bulk_in_replies: Arc<Mutex<VecDeque<TransportResult<Vec<u8>>>>>,
    bulk_out_results: Arc<Mutex<VecDeque<TransportResult<()>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next control IN transfer.
    pub fn queue_control_in(&self, bytes: &[u8]) {
        self.control_in_replies
            .lock()
            .unwrap()
            .push_back(Ok(bytes.to_vec()));
    }

    /// Queue an error for the next control IN transfer.
    pub fn queue_control_in_err(&self, err: TransportError) {
        self.control_in_replies.lock().unwrap().push_back(Err(err));
    }

    /// Queue a result for the next control OUT transfer.
    pub fn queue_control_out_err(&self, err: TransportError) {
        self.control_out_results.lock().unwrap().push_back(Err(err));
    }

    /// Queue a reply for the next bulk IN transfer.
    pub fn queue_bulk_in(&self, bytes: &[u8]) {
        self.bulk_in_replies
            .lock()
            .unwrap()
            .push_back(Ok(bytes.to_vec()));
    }

    /// Queue an error for the next bulk IN transfer.
    pub fn queue_bulk_in_err(&self, err: TransportError) {
        self.bulk_in_replies.lock().unwrap().push_back(Err(err));
    }

    /// Queue an error for the next bulk OUT transfer.
    pub fn queue_bulk_out_err(&self, err: TransportError) {
        self.bulk_out_results.lock().unwrap().push_back(Err(err));
    }

    /// Queue the language-table reply used by string descriptor reads.
    pub fn queue_language_descriptor(&self) {
        // 4 bytes: length, type STRING, langid 0x0409.
        self.queue_control_in(&[0x04, 0x03, 0x09, 0x04]);
    }

    /// Queue a UTF-16LE string descriptor reply carrying `s`.
    pub fn queue_string_descriptor(&self, s: &str) {
        let mut desc = vec![0u8, 0x03];
        for unit in s.encode_utf16() {
            desc.extend_from_slice(&unit.to_le_bytes());
        }
        desc[0] = desc.len() as u8;
        self.queue_control_in(&desc);
    }

    /// Everything the engine did, in order.
    pub fn ops(&self) -> Vec<MockOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    fn record(&self, op: MockOp) {
        self.ops.lock().unwrap().push(op);
    }
}

impl UsbTransport for MockTransport {
    fn control_in(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        self.record(MockOp::ControlIn {
            bm_request_type,
            b_request,
            w_value,
            w_index,
            len: buf.len(),
        });
        let reply = self
            .control_in_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError::TransferFailed(
                    "mock: no queued control reply".into(),
                ))
            })?;
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn control_out(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        self.record(MockOp::ControlOut {
            bm_request_type,
            b_request,
            w_value,
            w_index,
            data: data.to_vec(),
        });
        match self.control_out_results.lock().unwrap().pop_front() {
            Some(result) => result.map(|()| data.len()),
            None => Ok(data.len()),
        }
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> TransportResult<usize> {
        self.record(MockOp::BulkIn {
            endpoint,
            len: buf.len(),
        });
        let reply = self
            .bulk_in_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError::TransferFailed(
                    "mock: no queued bulk reply".into(),
                ))
            })?;
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> TransportResult<usize> {
        self.record(MockOp::BulkOut {
            endpoint,
            data: data.to_vec(),
        });
        match self.bulk_out_results.lock().unwrap().pop_front() {
            Some(result) => result.map(|()| data.len()),
            None => Ok(data.len()),
        }
    }

    fn set_configuration(&mut self, configuration: u8) -> TransportResult<()> {
        self.record(MockOp::SetConfiguration(configuration));
        Ok(())
    }

    fn set_interface(&mut self, interface: u8, alt_setting: u8) -> TransportResult<()> {
        self.record(MockOp::SetInterface(interface, alt_setting));
        Ok(())
    }

    fn release_interface(&mut self) -> TransportResult<()> {
        self.record(MockOp::ReleaseInterface);
        Ok(())
    }

    fn reset(&self) -> TransportResult<()> {
        self.record(MockOp::Reset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::USB_TIMEOUT;

    #[test]
    fn test_mock_replays_control_replies_in_order() {
        let mock = MockTransport::new();
        mock.queue_control_in(b"one");
        mock.queue_control_in(b"two");

        let mut buf = [0u8; 8];
        let n = mock.control_in(0xC0, 0, 0, 0, &mut buf, USB_TIMEOUT).unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = mock.control_in(0xC0, 0, 0, 0, &mut buf, USB_TIMEOUT).unwrap();
        assert_eq!(&buf[..n], b"two");
        assert!(mock.control_in(0xC0, 0, 0, 0, &mut buf, USB_TIMEOUT).is_err());
    }

    #[test]
    fn test_mock_captures_ops() {
        let mut mock = MockTransport::new();
        mock.bulk_out(0x04, b"data", USB_TIMEOUT).unwrap();
        mock.set_interface(1, 1).unwrap();
        assert_eq!(
            mock.ops(),
            vec![
                MockOp::BulkOut {
                    endpoint: 0x04,
                    data: b"data".to_vec()
                },
                MockOp::SetInterface(1, 1),
            ]
        );
    }

    #[test]
    fn test_string_descriptor_helper_roundtrip() {
        let mock = MockTransport::new();
        mock.queue_language_descriptor();
        mock.queue_string_descriptor("CPID:8010 BDID:0E");
        let s = mock.get_string_descriptor_ascii(3).unwrap();
        assert_eq!(s, "CPID:8010 BDID:0E");
    }

    #[test]
    fn test_string_descriptor_high_bytes_become_question_marks() {
        let mock = MockTransport::new();
        mock.queue_language_descriptor();
        mock.queue_string_descriptor("Ap\u{2764}le");
        let s = mock.get_string_descriptor_ascii(2).unwrap();
        assert_eq!(s, "Ap?le");
    }
}
