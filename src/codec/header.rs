//! Length-prefixed framing with a self-describing header length.
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────┬─────────────────────┐
//! │ HeaderLength │  CommandId  │  BodyLength  │ Body                │
//! │   u16 (BE)   │  u16 (BE)   │   u16 (BE)   │ BodyLength bytes    │
//! └──────────────┴─────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! `HeaderLength` is the size of the header in bytes, 6 for every frame this
//! codec writes. Larger values are accepted on decode and the extra header
//! bytes are skipped, which leaves room for future header fields.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::error;

use super::{command, Codec};
use crate::{
    buffer::ReadBuffer,
    error::{Error, Result},
};

pub const HEADER_LEN: usize = 6;
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFrame {
    header_length: u16,
    pub command_id: u16,
    pub body: Bytes,
}

impl HeaderFrame {
    pub fn new(command_id: u16, body: impl Into<Bytes>) -> Self {
        Self {
            header_length: HEADER_LEN as u16,
            command_id,
            body: body.into(),
        }
    }

    /// Header length as received on the wire.
    pub fn header_length(&self) -> u16 {
        self.header_length
    }

    pub fn body_length(&self) -> usize {
        self.body.len()
    }
}

/// Codec for [`HeaderFrame`]s. Rejects any command id outside its set.
#[derive(Debug, Clone)]
pub struct HeaderCodec {
    commands: Vec<u16>,
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec {
    /// Accepts [`command::PING`], [`command::PONG`] and [`command::DATA`].
    pub fn new() -> Self {
        Self::with_commands(command::KNOWN)
    }

    pub fn with_commands(commands: impl IntoIterator<Item = u16>) -> Self {
        let mut commands: Vec<u16> = commands.into_iter().collect();
        commands.sort_unstable();
        commands.dedup();
        Self { commands }
    }

    pub fn is_known(&self, command_id: u16) -> bool {
        self.commands.binary_search(&command_id).is_ok()
    }
}

impl Codec for HeaderCodec {
    type Frame = HeaderFrame;

    fn encode(&self, frame: &HeaderFrame) -> Result<Bytes> {
        let len = frame.body.len();
        if len > MAX_BODY_LEN {
            return Err(Error::FrameTooLarge {
                len,
                max: MAX_BODY_LEN,
            });
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + len);
        out.put_u16(HEADER_LEN as u16);
        out.put_u16(frame.command_id);
        out.put_u16(len as u16);
        out.put_slice(&frame.body);
        Ok(out.freeze())
    }

    fn decode(&self, input: &mut dyn ReadBuffer) -> Result<Option<HeaderFrame>> {
        let (size, header) = input.read_n(HEADER_LEN);
        if size < HEADER_LEN {
            return Ok(None);
        }

        let header_length = u16::from_be_bytes([header[0], header[1]]);
        let command_id = u16::from_be_bytes([header[2], header[3]]);
        let body_length = u16::from_be_bytes([header[4], header[5]]) as usize;

        if (header_length as usize) < HEADER_LEN {
            input.reset_buffer();
            error!(header_length, "header length shorter than fixed header");
            return Err(Error::ProtocolViolation(format!(
                "header length {header_length} is shorter than {HEADER_LEN}"
            )));
        }
        if !self.is_known(command_id) {
            input.reset_buffer();
            error!(command_id, "unknown command id");
            return Err(Error::ProtocolViolation(format!(
                "unknown command id {command_id:#06x}"
            )));
        }

        let frame_len = header_length as usize + body_length;
        let (size, data) = input.read_n(frame_len);
        if size < frame_len {
            return Ok(None);
        }

        let body = Bytes::copy_from_slice(&data[header_length as usize..frame_len]);
        input.shift_n(frame_len);

        Ok(Some(HeaderFrame {
            header_length,
            command_id,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use proptest::prelude::*;

    fn encoded(command_id: u16, body: &[u8]) -> Vec<u8> {
        HeaderCodec::new()
            .encode(&HeaderFrame::new(command_id, body.to_vec()))
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_wire_layout_is_big_endian() {
        let bytes = encoded(command::DATA, b"hi");
        assert_eq!(bytes, vec![0x00, 0x06, 0x00, 0xF0, 0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_short_header_is_insufficient() {
        let codec = HeaderCodec::new();
        let mut buf = RingBuffer::default();
        buf.append(&[0x00, 0x06, 0x00]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_partial_body_consumes_nothing() {
        let codec = HeaderCodec::new();
        let bytes = encoded(command::DATA, b"0123456789");
        let mut buf = RingBuffer::default();
        buf.append(&bytes[..HEADER_LEN + 3]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), HEADER_LEN + 3);

        buf.append(&bytes[HEADER_LEN + 3..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"0123456789");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = HeaderCodec::new();
        let mut buf = RingBuffer::default();
        buf.append(&encoded(command::DATA, b"hello"));
        buf.append(&encoded(command::DATA, b"world"));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.body[..], b"hello");
        assert_eq!(&second.body[..], b"world");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_command_resets_buffer() {
        let codec = HeaderCodec::new();
        let mut buf = RingBuffer::default();
        buf.append(&[0x00, 0x06, 0x12, 0x34, 0x00, 0x01, 0xAA]);
        buf.append(&encoded(command::DATA, b"after"));

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(buf.read_n(1).0, 0);
    }

    #[test]
    fn test_header_length_below_minimum_is_violation() {
        let codec = HeaderCodec::new();
        let mut buf = RingBuffer::default();
        buf.append(&[0x00, 0x04, 0x00, 0xF0, 0x00, 0x00]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extended_header_bytes_are_skipped() {
        let codec = HeaderCodec::new();
        let mut buf = RingBuffer::default();
        // header length 8: two trailing header bytes before the body
        buf.append(&[0x00, 0x08, 0x00, 0x01, 0x00, 0x03, 0xEE, 0xEE, b'a', b'b', b'c']);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header_length(), 8);
        assert_eq!(frame.command_id, command::PING);
        assert_eq!(&frame.body[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_custom_command_set() {
        let codec = HeaderCodec::with_commands([0x0100]);
        let mut buf = RingBuffer::default();
        buf.append(&encoded(0x0100, b"x"));
        assert!(codec.decode(&mut buf).unwrap().is_some());

        buf.append(&encoded(command::DATA, b"x"));
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let frame = HeaderFrame::new(command::DATA, vec![0u8; MAX_BODY_LEN + 1]);
        assert!(matches!(
            HeaderCodec::new().encode(&frame),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            body in prop::collection::vec(any::<u8>(), 0..=MAX_BODY_LEN),
            command_id in prop::sample::select(command::KNOWN.to_vec()),
        ) {
            let codec = HeaderCodec::new();
            let frame = HeaderFrame::new(command_id, body);
            let mut buf = RingBuffer::default();
            buf.append(&codec.encode(&frame).unwrap());

            prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_partial_reads_reassemble(
            body in prop::collection::vec(any::<u8>(), 0..512),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let codec = HeaderCodec::new();
            let frame = HeaderFrame::new(command::DATA, body);
            let wire = codec.encode(&frame).unwrap();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len())).collect();
            points.push(wire.len());
            points.sort_unstable();
            points.dedup();

            let mut buf = RingBuffer::with_capacity(16);
            let mut start = 0;
            let mut decoded = Vec::new();
            for end in points {
                buf.append(&wire[start..end]);
                start = end;
                if let Some(out) = codec.decode(&mut buf).unwrap() {
                    decoded.push((end, out));
                }
            }

            prop_assert_eq!(decoded.len(), 1);
            let (at, out) = decoded.pop().unwrap();
            prop_assert_eq!(at, wire.len());
            prop_assert_eq!(out, frame);
            prop_assert!(buf.is_empty());
        }
    }
}
