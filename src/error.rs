use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine.
///
/// Most kinds are connection-scoped: they close one connection and are
/// reported through [`EventHandler::on_closed`](crate::EventHandler::on_closed).
/// Only [`Error::PollerCreate`] (and a failed bind) abort server start.
#[derive(Debug, Error)]
pub enum Error {
    /// `accept` failed with something other than would-block.
    #[error("failed to accept socket: {0}")]
    AcceptSocket(#[source] io::Error),

    /// The poller refused to register or re-arm a descriptor.
    #[error("failed to register socket with poller: {0}")]
    Registration(#[source] io::Error),

    /// The codec rejected the stream; the input buffer has been discarded.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer closed while part of a frame was still buffered.
    #[error("peer closed with {buffered} bytes of an incomplete frame buffered")]
    IncompleteFrame { buffered: usize },

    #[error("failed to create readiness poller: {0}")]
    PollerCreate(#[source] io::Error),

    /// The target event loop no longer accepts injected tasks.
    #[error("event loop {0} is not running")]
    LoopStopped(usize),

    #[error("frame of {len} bytes exceeds the maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("worker pool is shut down")]
    WorkerPoolClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for kinds that only ever affect a single connection.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Error::Registration(_)
                | Error::ProtocolViolation(_)
                | Error::IncompleteFrame { .. }
                | Error::FrameTooLarge { .. }
                | Error::Io(_)
        )
    }
}
