//! Worker threads for blocking application work.
//!
//! Event-loop hooks must not block. A handler that needs to do slow work
//! hands it to a [`WorkerPool`]; [`WorkerPool::reply`] runs the work on a
//! worker and routes the resulting frame back to the connection's own loop
//! through its [`ConnectionHandle`].

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
    thread::{self, Builder, JoinHandle},
};

use tracing::{debug, error};

use crate::{
    connection::ConnectionHandle,
    error::{Error, Result},
};

/// Worker count when the available parallelism cannot be queried.
pub const DEFAULT_WORKERS: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Named worker threads pulling jobs from one shared queue.
///
/// Whichever worker is idle takes the next job, so one slow job never holds
/// up the jobs queued behind it. A job that panics is logged and the worker
/// carries on. Dropping the pool runs every job already submitted, then
/// joins the workers.
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads named `mill-worker-{i}` (at least one).
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut pool = Self {
            jobs: Some(sender),
            workers: Vec::with_capacity(workers),
        };
        for id in 0..workers {
            let receiver = Arc::clone(&receiver);
            // on failure `pool` drops here, which joins the workers already running
            let thread = Builder::new()
                .name(format!("mill-worker-{id}"))
                .spawn(move || work(id, &receiver))?;
            pool.workers.push(thread);
        }
        debug!(workers, "worker pool started");
        Ok(pool)
    }

    /// One worker per available core.
    pub fn with_available_parallelism() -> Result<Self> {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_WORKERS);
        Self::new(workers)
    }

    pub fn submit<J>(&self, job: J) -> Result<()>
    where
        J: FnOnce() + Send + 'static,
    {
        self.jobs
            .as_ref()
            .ok_or(Error::WorkerPoolClosed)?
            .send(Box::new(job))
            .map_err(|_| Error::WorkerPoolClosed)
    }

    /// Runs `job` on a worker and writes the frame it returns, if any, to the
    /// connection behind `handle`. A connection that closed in the meantime
    /// silently drops the reply.
    pub fn reply<F, J>(&self, handle: ConnectionHandle<F>, job: J) -> Result<()>
    where
        F: Send + 'static,
        J: FnOnce() -> Option<F> + Send + 'static,
    {
        self.submit(move || {
            let Some(frame) = job() else {
                return;
            };
            if let Err(e) = handle.async_write(frame) {
                debug!(conn = %handle.id(), error = %e, "reply dropped");
            }
        })
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // workers exit once the queue is empty and the sender is gone
        drop(self.jobs.take());
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().map(str::to_owned);
            if worker.join().is_err() {
                error!(worker = ?name, "worker thread panicked");
            }
        }
    }
}

fn work(id: usize, jobs: &Mutex<Receiver<Job>>) {
    loop {
        // the lock is held only while waiting; the job runs after it is released
        let job = jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = job else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker = id, "job panicked");
        }
    }
}
