//! Pluggable framing protocols.
//!
//! A [`Codec`] turns the byte stream buffered on a connection into typed
//! frames and back. The server holds one codec instance behind
//! `Arc<dyn Codec>` and shares it between all loops, so codecs carry no
//! per-connection state: everything they know about a stream is in the
//! buffer they are handed.
//!
//! Decoding contract:
//!
//! - `Ok(None)`: not enough bytes yet. Nothing was consumed; the loop calls
//!   `decode` again after the next read.
//! - `Ok(Some(frame))`: exactly one frame was consumed from the buffer.
//! - `Err(_)`: the stream is unrecoverable. The codec has already reset the
//!   buffer and the loop closes the connection.

pub mod header;
pub mod versioned;

pub use header::{HeaderCodec, HeaderFrame};
pub use versioned::{VersionedCodec, VersionedFrame};

use bytes::Bytes;

use crate::{buffer::ReadBuffer, error::Result};

/// Command identifiers understood by the bundled codecs.
pub mod command {
    pub const PING: u16 = 0x0001;
    pub const PONG: u16 = 0x0002;
    pub const DATA: u16 = 0x00F0;

    pub const KNOWN: [u16; 3] = [PING, PONG, DATA];
}

pub trait Codec: Send + Sync + 'static {
    type Frame: Send + 'static;

    /// Serialises `frame` into the exact bytes to put on the wire.
    fn encode(&self, frame: &Self::Frame) -> Result<Bytes>;

    /// Parses at most one frame out of `input`. Must never block.
    fn decode(&self, input: &mut dyn ReadBuffer) -> Result<Option<Self::Frame>>;
}
