//! Readiness poller with a cross-thread task injection queue.
//!
//! Each event loop owns exactly one [`Poller`]. Other threads reach the loop
//! only through a cloned [`Trigger`]: the task is pushed onto a lock-free FIFO
//! and the blocked [`Poller::wait`] is woken through a `mio::Waker`. Tasks are
//! executed by the owning thread in [`Poller::drain_tasks`], so loop-private
//! state is never touched concurrently.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use lockfree::queue::Queue;
use mio::{event::Source, Events, Interest, Poll, Registry, Token, Waker};

use crate::{
    error::{Error, Result},
    event::Readiness,
};

/// Token reserved for the poller's own waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

pub struct Poller<T> {
    poll: Poll,
    events: Events,
    trigger: Trigger<T>,
}

impl<T: Send + 'static> Poller<T> {
    /// Creates the poll instance and its waker. Fails with
    /// [`Error::PollerCreate`]; callers treat that as fatal at startup.
    pub fn new(id: usize, events_capacity: usize) -> Result<Self> {
        let poll = Poll::new().map_err(Error::PollerCreate)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(Error::PollerCreate)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity.max(1)),
            trigger: Trigger {
                inner: Arc::new(TriggerInner {
                    id,
                    queue: Queue::new(),
                    waker: Arc::new(waker),
                    notified: AtomicBool::new(false),
                    closed: AtomicBool::new(false),
                }),
            },
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn add_read<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)
    }

    pub fn modify<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn remove<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Blocks until a registered source is ready, a trigger fires, or the
    /// timeout elapses. Ready events are appended to `out`; the waker event
    /// itself is filtered out.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<()> {
        out.clear();
        self.poll.poll(&mut self.events, timeout)?;
        out.extend(
            self.events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(Readiness::from),
        );
        Ok(())
    }

    pub fn trigger(&self) -> Trigger<T> {
        self.trigger.clone()
    }

    /// Runs every queued task in submission order on the calling thread.
    /// Returns how many ran.
    pub fn drain_tasks<F>(&self, mut run: F) -> usize
    where
        F: FnMut(T),
    {
        let inner = &self.trigger.inner;
        inner.notified.store(false, Ordering::SeqCst);

        let mut ran = 0;
        while let Some(task) = inner.queue.pop() {
            run(task);
            ran += 1;
        }
        ran
    }

    /// Refuses further triggers and drops whatever is still queued.
    pub fn close(&self) -> usize {
        let inner = &self.trigger.inner;
        inner.closed.store(true, Ordering::SeqCst);

        let mut dropped = 0;
        while inner.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }
}

/// Thread-safe entry point into an event loop.
pub struct Trigger<T> {
    inner: Arc<TriggerInner<T>>,
}

struct TriggerInner<T> {
    id: usize,
    queue: Queue<T>,
    waker: Arc<Waker>,
    notified: AtomicBool,
    closed: AtomicBool,
}

impl<T> Clone for Trigger<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Trigger<T> {
    /// Queues `task` for the owning loop and interrupts its `wait`.
    ///
    /// Tasks from one producer run in the order they were triggered. Wakes are
    /// coalesced: a second trigger before the loop drains does not wake again.
    ///
    /// If the loop closes concurrently, the task is dropped here rather than
    /// stranded in a queue nobody drains.
    pub fn trigger(&self, task: T) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::LoopStopped(inner.id));
        }

        inner.queue.push(task);
        if inner.closed.load(Ordering::SeqCst) {
            // `close` may have emptied the queue before the push landed
            while inner.queue.pop().is_some() {}
            return Err(Error::LoopStopped(inner.id));
        }

        if !inner.notified.swap(true, Ordering::SeqCst) {
            inner.waker.wake()?;
        }
        Ok(())
    }
}

impl<T> Trigger<T> {
    /// Index of the loop this trigger feeds.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.inner.waker)
    }
}
