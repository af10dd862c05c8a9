//! The per-thread event loop.
//!
//! A loop owns a [`Poller`], the connections the acceptor assigned to it, and
//! (in single-loop mode) the listener itself. Connections never migrate, so
//! everything in here is touched by exactly one thread; other threads reach a
//! loop only by triggering a [`Task`].

use std::{
    collections::{hash_map::Entry, HashMap},
    io, mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::{Interest, Token};
use tracing::{debug, error, info, trace, warn};

use crate::{
    buffer::ReadBuffer,
    codec::Codec,
    connection::{Connection, ConnectionId, ReadStatus},
    error::{Error, Result},
    event::Readiness,
    handler::{Action, EventHandler},
    net::acceptor::{Acceptor, LISTENER_TOKEN},
    poll::Poller,
    server::Stopper,
};

/// Work injected into a loop from another thread (or from the loop itself).
pub(crate) enum Task<F> {
    /// Adopt a freshly accepted connection.
    Register(Connection<F>),
    AsyncWrite {
        id: ConnectionId,
        frame: F,
    },
    Close {
        id: ConnectionId,
    },
    /// Arbitrary work that must run on the loop thread.
    Call(Box<dyn FnOnce() + Send>),
}

/// Shared, read-only view of a loop's load. The balancer reads it from the
/// acceptor thread while the loop updates it.
#[derive(Debug)]
pub struct LoopStats {
    index: usize,
    connections: AtomicUsize,
}

impl LoopStats {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Connections owned by the loop, counting those accepted for it whose
    /// registration has not run yet.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// How many `read_chunk`s one connection may read per turn before the loop
/// moves on to the others.
pub(crate) const READ_BUDGET_CHUNKS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopSettings {
    pub read_chunk: usize,
    pub poll_timeout: Option<Duration>,
}

impl LoopSettings {
    fn read_budget(&self) -> usize {
        self.read_chunk.max(1).saturating_mul(READ_BUDGET_CHUNKS)
    }
}

/// What reading a connection decided.
enum Next {
    Keep,
    /// Drop the connection now, queued writes included.
    Close(Option<Error>),
    /// Close once the outbound queue drains.
    CloseAfterFlush(Option<Error>),
}

pub(crate) struct EventLoop<H: EventHandler> {
    index: usize,
    poller: Poller<Task<H::Frame>>,
    stats: Arc<LoopStats>,
    connections: HashMap<Token, Connection<H::Frame>>,
    handler: Arc<H>,
    codec: Arc<dyn Codec<Frame = H::Frame>>,
    stopper: Stopper,
    acceptor: Option<Acceptor<H::Frame>>,
    settings: LoopSettings,
    ready: Vec<Readiness>,
    tasks: Vec<Task<H::Frame>>,
    /// Connections that ran out of read budget and still have input waiting.
    backlog: Vec<Token>,
}

impl<H: EventHandler> EventLoop<H> {
    pub(crate) fn new(
        poller: Poller<Task<H::Frame>>,
        stats: Arc<LoopStats>,
        handler: Arc<H>,
        codec: Arc<dyn Codec<Frame = H::Frame>>,
        stopper: Stopper,
        settings: LoopSettings,
    ) -> Self {
        Self {
            index: stats.index(),
            poller,
            stats,
            connections: HashMap::new(),
            handler,
            codec,
            stopper,
            acceptor: None,
            settings,
            ready: Vec::new(),
            tasks: Vec::new(),
            backlog: Vec::new(),
        }
    }

    /// Single-loop mode: the listener is registered on this loop's poller.
    pub(crate) fn with_acceptor(mut self, acceptor: Acceptor<H::Frame>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub(crate) fn run(mut self) -> Result<()> {
        info!(event_loop = self.index, "event loop started");

        while !self.stopper.is_stopping() {
            if let Err(e) = self.turn() {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(event_loop = self.index, error = %e, "poll failed");
                self.stopper.stop();
                self.shutdown();
                return Err(e.into());
            }
        }

        self.shutdown();
        Ok(())
    }

    /// One pass: wait, run injected tasks, dispatch readiness, then resume
    /// connections left over from the previous pass.
    fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.backlog.is_empty() {
            self.settings.poll_timeout
        } else {
            Some(Duration::ZERO)
        };

        let mut ready = mem::take(&mut self.ready);
        let waited = self.poller.wait(timeout, &mut ready);
        if waited.is_ok() {
            let backlog = mem::take(&mut self.backlog);
            self.run_tasks();
            for readiness in &ready {
                self.dispatch(*readiness);
            }
            for token in backlog {
                self.on_readable(token);
            }
        }
        self.ready = ready;
        waited
    }

    fn dispatch(&mut self, readiness: Readiness) {
        let token = readiness.token();
        if token == LISTENER_TOKEN {
            self.accept();
            return;
        }

        if readiness.is_readable() || readiness.is_closed() {
            self.on_readable(token);
        }
        if readiness.is_writable() {
            self.flush(token);
        }
    }

    fn accept(&mut self) {
        let Some(acceptor) = self.acceptor.as_mut() else {
            return;
        };
        match acceptor.drain() {
            Ok(accepted) => trace!(event_loop = self.index, accepted, "accept drained"),
            Err(e) => warn!(event_loop = self.index, error = %e, "accept failed"),
        }
        // our own registrations were queued while draining
        self.run_tasks();
    }

    fn run_tasks(&mut self) {
        let mut tasks = mem::take(&mut self.tasks);
        self.poller.drain_tasks(|task| tasks.push(task));
        for task in tasks.drain(..) {
            self.run_task(task);
        }
        self.tasks = tasks;
    }

    fn run_task(&mut self, task: Task<H::Frame>) {
        match task {
            Task::Register(conn) => self.register(conn),
            Task::AsyncWrite { id, frame } => {
                let token = id.token();
                let encoded = match self.connections.get_mut(&token) {
                    Some(conn) if !conn.is_closing() => self.codec.encode(&frame).map(|bytes| {
                        conn.queue(bytes);
                    }),
                    _ => {
                        trace!(event_loop = self.index, conn = %id, "write for closed connection dropped");
                        return;
                    }
                };
                match encoded {
                    Ok(()) => self.flush(token),
                    Err(e) => self.close(token, Some(e)),
                }
            }
            Task::Close { id } => self.close_after_flush(id.token(), None),
            Task::Call(call) => call(),
        }
    }

    fn register(&mut self, mut conn: Connection<H::Frame>) {
        let token = conn.token();
        let id = conn.id();

        if let Err(e) = self.poller.add_read(conn.stream_mut(), token) {
            let err = Error::Registration(e);
            error!(event_loop = self.index, conn = %id, error = %err, "dropping connection");
            // dropping closes the socket, returns its buffer to the pool and
            // gives back its slot in the loop count
            return;
        }

        let conn = match self.connections.entry(token) {
            Entry::Vacant(slot) => slot.insert(conn),
            Entry::Occupied(_) => {
                error!(event_loop = self.index, conn = %id, "duplicate connection id");
                let _ = self.poller.remove(conn.stream_mut());
                return;
            }
        };
        debug!(
            event_loop = self.index,
            conn = %id,
            peer = %conn.peer_addr(),
            "connection opened"
        );

        let action = self.handler.on_opened(conn);
        self.apply(token, action);
    }

    fn apply(&mut self, token: Token, action: Action) {
        match action {
            Action::None => {}
            Action::Close => self.close_after_flush(token, None),
            Action::Shutdown => self.stopper.stop(),
        }
    }

    fn on_readable(&mut self, token: Token) {
        let (status, next, shutdown) = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            if conn.is_closing() {
                return;
            }

            let settings = self.settings;
            let status = match conn.fill_inbound(settings.read_chunk, settings.read_budget()) {
                Ok(status) => status,
                Err(e) => return self.close(token, Some(Error::Io(e))),
            };
            let (next, shutdown) = deliver(conn, &*self.codec, &*self.handler);
            (status, next, shutdown)
        };

        if shutdown {
            self.stopper.stop();
        }

        match next {
            Next::Close(err) => return self.close(token, err),
            Next::CloseAfterFlush(err) => return self.close_after_flush(token, err),
            Next::Keep => {}
        }

        match status {
            ReadStatus::Open { read } => {
                trace!(event_loop = self.index, ?token, read, "read");
                self.flush(token);
            }
            ReadStatus::Paused { read } => {
                trace!(event_loop = self.index, ?token, read, "read budget spent");
                if !self.backlog.contains(&token) {
                    self.backlog.push(token);
                }
                self.flush(token);
            }
            ReadStatus::Eof { read } => {
                trace!(event_loop = self.index, ?token, read, "peer closed");
                let buffered = self
                    .connections
                    .get(&token)
                    .map_or(0, |conn| conn.buffered());
                let err = (buffered > 0).then_some(Error::IncompleteFrame { buffered });
                // replies to frames already decoded still go out
                self.close_after_flush(token, err);
            }
        }
    }

    /// Writes pending bytes and keeps the registered interest in step with
    /// what is left. Completes a deferred close once the queue is empty.
    fn flush(&mut self, token: Token) {
        let next = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            match conn.flush() {
                Ok(true) if conn.is_closing() => Next::Close(conn.take_close_reason()),
                Ok(drained) => {
                    let wanted = if drained {
                        Interest::READABLE
                    } else {
                        Interest::READABLE | Interest::WRITABLE
                    };
                    if conn.interest() == wanted {
                        Next::Keep
                    } else {
                        match self.poller.modify(conn.stream_mut(), token, wanted) {
                            Ok(()) => {
                                conn.set_interest(wanted);
                                Next::Keep
                            }
                            Err(e) => Next::Close(Some(Error::Registration(e))),
                        }
                    }
                }
                Err(e) => Next::Close(Some(Error::Io(e))),
            }
        };

        if let Next::Close(err) = next {
            self.close(token, err);
        }
    }

    /// Stops reading from the connection and closes it with `reason` once
    /// everything queued has been written.
    fn close_after_flush(&mut self, token: Token, reason: Option<Error>) {
        match self.connections.get_mut(&token) {
            Some(conn) => conn.mark_closing(reason),
            None => return,
        }
        self.flush(token);
    }

    /// Removes the connection and runs `on_closed`. A second call for the
    /// same token finds nothing and does nothing.
    fn close(&mut self, token: Token, err: Option<Error>) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        conn.mark_closed();
        if let Err(e) = self.poller.remove(conn.stream_mut()) {
            trace!(event_loop = self.index, conn = %conn.id(), error = %e, "deregister failed");
        }
        conn.release_slot();

        match &err {
            Some(e) => debug!(event_loop = self.index, conn = %conn.id(), error = %e, "connection closed"),
            None => debug!(event_loop = self.index, conn = %conn.id(), "connection closed"),
        }

        if self.handler.on_closed(&mut conn, err.as_ref()) == Action::Shutdown {
            self.stopper.stop();
        }
    }

    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            let reason = match self.connections.get_mut(&token) {
                Some(conn) => {
                    match conn.flush() {
                        Ok(true) => {}
                        Ok(false) => warn!(
                            event_loop = self.index,
                            conn = %conn.id(),
                            unsent = conn.pending_write_bytes(),
                            "dropping unsent bytes at shutdown"
                        ),
                        Err(e) => debug!(
                            event_loop = self.index,
                            conn = %conn.id(),
                            error = %e,
                            "final flush failed"
                        ),
                    }
                    conn.take_close_reason()
                }
                None => continue,
            };
            self.close(token, reason);
        }

        let dropped = self.poller.close();
        if let Some(mut acceptor) = self.acceptor.take() {
            let _ = self.poller.remove(acceptor.listener_mut());
        }
        info!(event_loop = self.index, dropped_tasks = dropped, "event loop stopped");
    }
}

/// Decodes and reacts to every complete frame buffered on `conn`.
fn deliver<H: EventHandler>(
    conn: &mut Connection<H::Frame>,
    codec: &dyn Codec<Frame = H::Frame>,
    handler: &H,
) -> (Next, bool) {
    let mut shutdown = false;
    loop {
        let frame = match codec.decode(&mut *conn) {
            Ok(Some(frame)) => frame,
            Ok(None) => return (Next::Keep, shutdown),
            Err(e) => return (Next::Close(Some(e)), shutdown),
        };

        let (reply, action) = handler.react(frame, conn);
        if let Some(reply) = reply {
            match codec.encode(&reply) {
                Ok(bytes) => conn.queue(bytes),
                Err(e) => return (Next::Close(Some(e)), shutdown),
            }
        }

        match action {
            Action::None => {}
            Action::Close => return (Next::CloseAfterFlush(None), shutdown),
            Action::Shutdown => shutdown = true,
        }
    }
}
