//! Per-socket state owned by one event loop.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    io::{self, Write},
    mem,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::{Buf, Bytes};
use mio::{net::TcpStream, Interest, Token};

use crate::{
    buffer::{ReadBuffer, RingBuffer},
    error::{Error, Result},
    event_loop::{LoopStats, Task},
    object_pool::PooledObject,
    poll::Trigger,
};

/// Unique identifier of an accepted connection, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub(crate) enum ReadStatus {
    /// Socket drained until it would block.
    Open { read: usize },
    /// Read budget spent; the socket may still hold data.
    Paused { read: usize },
    /// Peer closed its write half.
    Eof { read: usize },
}

/// One accepted socket plus its buffers.
///
/// A connection is created by the acceptor and from then on only touched by
/// the thread of the loop it was assigned to. Codecs see it through
/// [`ReadBuffer`]; handlers additionally get the context slot and the write
/// path.
///
/// A connection counts against its loop's load from creation until it is
/// closed or dropped, including while its registration is still in flight.
pub struct Connection<F> {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    owner: Weak<LoopStats>,
    counted: bool,
    trigger: Trigger<Task<F>>,
    inbound: PooledObject<RingBuffer>,
    outbound: VecDeque<Bytes>,
    context: Option<Box<dyn Any + Send>>,
    interest: Interest,
    closing: bool,
    close_reason: Option<Error>,
    closed: bool,
}

impl<F> fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("buffered", &self.inbound.len())
            .field("pending_writes", &self.outbound.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<F: Send + 'static> Connection<F> {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        owner: &Arc<LoopStats>,
        trigger: Trigger<Task<F>>,
        inbound: PooledObject<RingBuffer>,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        owner.opened();
        Self {
            id,
            stream,
            peer_addr,
            local_addr,
            owner: Arc::downgrade(owner),
            counted: true,
            trigger,
            inbound,
            outbound: VecDeque::new(),
            context: None,
            interest: Interest::READABLE,
            closing: false,
            close_reason: None,
            closed: false,
        }
    }

    /// Queues `frame` for this connection through its loop's task queue.
    ///
    /// Safe to call from the loop thread itself; the frame is written after
    /// the current dispatch returns, after anything already queued.
    pub fn async_write(&self, frame: F) -> Result<()> {
        self.trigger.trigger(Task::AsyncWrite {
            id: self.id,
            frame,
        })
    }

    /// Asks the owning loop to close this connection after pending writes.
    pub fn close(&self) -> Result<()> {
        self.trigger.trigger(Task::Close { id: self.id })
    }

    /// Sendable handle for replying from other threads.
    pub fn handle(&self) -> ConnectionHandle<F> {
        ConnectionHandle::new(self.id, self.trigger.clone())
    }
}

impl<F> Connection<F> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Index of the event loop that owns this connection.
    pub fn loop_index(&self) -> usize {
        self.trigger.id()
    }

    /// Live connection count of the owning loop, if it is still running.
    pub fn loop_connection_count(&self) -> Option<usize> {
        self.owner.upgrade().map(|stats| stats.connections())
    }

    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        self.context = Some(Box::new(value));
    }

    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.context.as_deref().and_then(|ctx| ctx.downcast_ref())
    }

    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.context.as_deref_mut().and_then(|ctx| ctx.downcast_mut())
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send>> {
        self.context.take()
    }

    /// Bytes queued for writing but not yet accepted by the socket.
    pub fn pending_write_bytes(&self) -> usize {
        self.outbound.iter().map(Bytes::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn token(&self) -> Token {
        self.id.token()
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn interest(&self) -> Interest {
        self.interest
    }

    pub(crate) fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    /// Stops reading; the loop closes the connection with `reason` once the
    /// outbound queue drains. The first reason given wins.
    pub(crate) fn mark_closing(&mut self, reason: Option<Error>) {
        self.closing = true;
        if self.close_reason.is_none() {
            self.close_reason = reason;
        }
    }

    pub(crate) fn take_close_reason(&mut self) -> Option<Error> {
        self.close_reason.take()
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Gives the slot in the owning loop's count back. Only the first call
    /// does anything.
    pub(crate) fn release_slot(&mut self) {
        if mem::take(&mut self.counted) {
            if let Some(stats) = self.owner.upgrade() {
                stats.closed();
            }
        }
    }

    /// Reads until the socket would block, reports EOF, or `budget` bytes
    /// were read.
    pub(crate) fn fill_inbound(
        &mut self,
        chunk: usize,
        budget: usize,
    ) -> io::Result<ReadStatus> {
        let mut read = 0;
        loop {
            if read >= budget {
                return Ok(ReadStatus::Paused { read });
            }
            match self.inbound.read_from(&mut self.stream, chunk) {
                Ok(0) => return Ok(ReadStatus::Eof { read }),
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Open { read })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn queue(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.outbound.push_back(bytes);
        }
    }

    /// Writes as much of the outbound queue as the socket accepts. Returns
    /// `true` once the queue is empty; `false` means write interest is needed.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        while let Some(front) = self.outbound.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    front.advance(n);
                    if front.is_empty() {
                        self.outbound.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl<F> Drop for Connection<F> {
    fn drop(&mut self) {
        self.release_slot();
    }
}

impl<F> ReadBuffer for Connection<F> {
    fn read_n(&self, n: usize) -> (usize, &[u8]) {
        self.inbound.read_n(n)
    }

    fn shift_n(&mut self, n: usize) -> usize {
        self.inbound.shift_n(n)
    }

    fn reset_buffer(&mut self) {
        self.inbound.reset_buffer();
    }

    fn buffered(&self) -> usize {
        self.inbound.len()
    }
}

/// Thread-safe handle to a connection.
///
/// Every operation is injected into the owning loop, which preserves the
/// single-writer rule and the order of queued frames. Operations on a
/// connection that has since closed are silently dropped by the loop.
pub struct ConnectionHandle<F> {
    id: ConnectionId,
    trigger: Trigger<Task<F>>,
}

impl<F> Clone for ConnectionHandle<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            trigger: self.trigger.clone(),
        }
    }
}

impl<F> fmt::Debug for ConnectionHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("loop", &self.trigger.id())
            .finish()
    }
}

impl<F> ConnectionHandle<F> {
    pub(crate) fn new(id: ConnectionId, trigger: Trigger<Task<F>>) -> Self {
        Self { id, trigger }
    }
}

impl<F: Send + 'static> ConnectionHandle<F> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn async_write(&self, frame: F) -> Result<()> {
        self.trigger.trigger(Task::AsyncWrite { id: self.id, frame })
    }

    pub fn close(&self) -> Result<()> {
        self.trigger.trigger(Task::Close { id: self.id })
    }

    /// Runs `call` on the owning loop's thread, after already queued tasks.
    pub fn call<C>(&self, call: C) -> Result<()>
    where
        C: FnOnce() + Send + 'static,
    {
        self.trigger.trigger(Task::Call(Box::new(call)))
    }
}
