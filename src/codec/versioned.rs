//! Versioned length-field framing.
//!
//! ```text
//! ┌───────────┬────────────┬──────────────┬────────────────────┐
//! │  Version  │ ActionType │  DataLength  │ Data               │
//! │ u16 (BE)  │  u16 (BE)  │   u32 (BE)   │ DataLength bytes   │
//! └───────────┴────────────┴──────────────┴────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tracing::error;

use super::{command, Codec};
use crate::{
    buffer::ReadBuffer,
    error::{Error, Result},
};

pub const HEADER_LEN: usize = 8;
pub const PROTOCOL_VERSION: u16 = 0x8001;
pub const DEFAULT_MAX_DATA_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedFrame {
    pub version: u16,
    pub action: u16,
    pub data: Bytes,
}

impl VersionedFrame {
    pub fn new(action: u16, data: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            action,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VersionedCodec {
    max_data_len: usize,
}

impl Default for VersionedCodec {
    fn default() -> Self {
        Self {
            max_data_len: DEFAULT_MAX_DATA_LEN,
        }
    }
}

impl VersionedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the payload size; a header announcing more is a protocol
    /// violation rather than a reason to buffer without bound.
    pub fn max_data_len(mut self, max: usize) -> Self {
        self.max_data_len = max.min(u32::MAX as usize);
        self
    }

    fn violation(input: &mut dyn ReadBuffer, reason: String) -> Error {
        input.reset_buffer();
        error!(%reason, "rejecting versioned frame");
        Error::ProtocolViolation(reason)
    }
}

impl Codec for VersionedCodec {
    type Frame = VersionedFrame;

    fn encode(&self, frame: &VersionedFrame) -> Result<Bytes> {
        let len = frame.data.len();
        if len > self.max_data_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_data_len,
            });
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + len);
        out.put_u16(frame.version);
        out.put_u16(frame.action);
        out.put_u32(len as u32);
        out.put_slice(&frame.data);
        Ok(out.freeze())
    }

    fn decode(&self, input: &mut dyn ReadBuffer) -> Result<Option<VersionedFrame>> {
        let (size, header) = input.read_n(HEADER_LEN);
        if size < HEADER_LEN {
            return Ok(None);
        }

        let version = u16::from_be_bytes([header[0], header[1]]);
        let action = u16::from_be_bytes([header[2], header[3]]);
        let data_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        if version != PROTOCOL_VERSION {
            return Err(Self::violation(
                input,
                format!("unsupported protocol version {version:#06x}"),
            ));
        }
        if !command::KNOWN.contains(&action) {
            return Err(Self::violation(
                input,
                format!("unknown action type {action:#06x}"),
            ));
        }
        if data_len > self.max_data_len {
            return Err(Self::violation(
                input,
                format!("data length {data_len} exceeds {}", self.max_data_len),
            ));
        }

        let frame_len = HEADER_LEN + data_len;
        let (size, bytes) = input.read_n(frame_len);
        if size < frame_len {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&bytes[HEADER_LEN..frame_len]);
        input.shift_n(frame_len);

        Ok(Some(VersionedFrame {
            version,
            action,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;

    #[test]
    fn test_round_trip() {
        let codec = VersionedCodec::new();
        let frame = VersionedFrame::new(command::PING, &b"ping"[..]);
        let mut buf = RingBuffer::default();
        buf.append(&codec.encode(&frame).unwrap());

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_waits_for_full_payload() {
        let codec = VersionedCodec::new();
        let wire = codec
            .encode(&VersionedFrame::new(command::DATA, vec![9u8; 32]))
            .unwrap();
        let mut buf = RingBuffer::default();

        buf.append(&wire[..5]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.append(&wire[5..20]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 20);
        buf.append(&wire[20..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().data.len(), 32);
    }

    #[test]
    fn test_wrong_version_resets() {
        let codec = VersionedCodec::new();
        let mut frame = VersionedFrame::new(command::DATA, &b"x"[..]);
        frame.version = 0x0001;
        let mut buf = RingBuffer::default();
        buf.append(&codec.encode(&frame).unwrap());

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_announcement_is_rejected_before_buffering() {
        let codec = VersionedCodec::new().max_data_len(16);
        let mut buf = RingBuffer::default();
        buf.append(&[0x80, 0x01, 0x00, 0xF0, 0x00, 0x00, 0x10, 0x00]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(buf.is_empty());
    }
}
