//! Server composition and lifecycle.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{Builder, JoinHandle},
};

use mio::{net::TcpListener, Waker};
use tracing::{error, info};

use crate::{
    buffer::RingBuffer,
    codec::Codec,
    error::{Error, Result},
    event_loop::{EventLoop, LoopSettings, LoopStats},
    handler::{Action, EventHandler},
    net::{
        acceptor::{Acceptor, SocketOptions},
        balancer::{LoadBalancer, LoadBalancing},
        config::ServerConfig,
    },
    object_pool::ObjectPool,
    poll::Poller,
};

/// Snapshot of a started server, handed to `on_init_complete` and
/// `on_shutdown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub local_addr: SocketAddr,
    pub multicore: bool,
    pub num_event_loop: usize,
    pub load_balancing: LoadBalancing,
}

/// Cloneable stop trigger shared by every loop and the acceptor.
///
/// Stopping is one-way: the flag is set once and every poller is woken so
/// the loops notice without waiting for their poll timeout.
#[derive(Clone)]
pub struct Stopper {
    inner: Arc<StopperInner>,
}

struct StopperInner {
    stopping: AtomicBool,
    wakers: Vec<Arc<Waker>>,
}

impl fmt::Debug for Stopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stopper")
            .field("stopping", &self.is_stopping())
            .field("pollers", &self.inner.wakers.len())
            .finish()
    }
}

impl Stopper {
    pub(crate) fn new(wakers: Vec<Arc<Waker>>) -> Self {
        Self {
            inner: Arc::new(StopperInner {
                stopping: AtomicBool::new(false),
                wakers,
            }),
        }
    }

    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server stopping");
        for waker in &self.inner.wakers {
            if let Err(e) = waker.wake() {
                error!(error = %e, "failed to wake poller for shutdown");
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }
}

/// A configured server, ready to bind.
pub struct Server<H: EventHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    codec: Arc<dyn Codec<Frame = H::Frame>>,
}

impl<H: EventHandler> Server<H> {
    pub fn new<C>(config: ServerConfig, handler: H, codec: C) -> Self
    where
        C: Codec<Frame = H::Frame>,
    {
        Self {
            config,
            handler: Arc::new(handler),
            codec: Arc::new(codec),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener, creates every poller, and spawns the loop threads.
    ///
    /// Failing to bind or to create any poller aborts start before a single
    /// thread is spawned. Returns as soon as the threads are running.
    pub fn start(self) -> Result<ServerHandle> {
        let Self {
            config,
            handler,
            codec,
        } = self;

        let loops = config.event_loop_count();
        let listener = TcpListener::bind(config.address)?;
        let local_addr = listener.local_addr()?;

        let mut pollers = Vec::with_capacity(loops);
        for index in 0..loops {
            pollers.push(Poller::new(index, config.events_capacity)?);
        }
        let stats: Vec<Arc<LoopStats>> = (0..loops).map(|i| Arc::new(LoopStats::new(i))).collect();
        let triggers: Vec<_> = pollers.iter().map(Poller::trigger).collect();
        let mut wakers: Vec<_> = triggers.iter().map(|trigger| trigger.waker()).collect();

        let read_chunk = config.read_buffer_size;
        let buffers = ObjectPool::new(config.buffer_pool_size, move || {
            RingBuffer::with_capacity(read_chunk)
        });
        let mut acceptor = Acceptor::new(
            listener,
            LoadBalancer::new(config.load_balancing, stats.clone()),
            triggers,
            buffers,
            SocketOptions::from(&config),
        );

        let acceptor_poller = if config.multicore {
            let poller = Poller::<()>::new(loops, 64)?;
            acceptor.register(poller.registry())?;
            wakers.push(poller.trigger().waker());
            Some(poller)
        } else {
            acceptor.register(pollers[0].registry())?;
            None
        };

        let stopper = Stopper::new(wakers);
        let info = ServerInfo {
            local_addr,
            multicore: config.multicore,
            num_event_loop: loops,
            load_balancing: config.load_balancing,
        };
        info!(
            addr = %local_addr,
            multicore = info.multicore,
            loops,
            balancing = ?info.load_balancing,
            "server listening"
        );

        if handler.on_init_complete(&info) == Action::Shutdown {
            stopper.stop();
        }

        let settings = LoopSettings {
            read_chunk,
            poll_timeout: Some(config.poll_timeout),
        };
        let on_shutdown = {
            let handler = Arc::clone(&handler);
            let info = info.clone();
            Box::new(move || handler.on_shutdown(&info)) as Box<dyn FnOnce() + Send>
        };
        let mut handle = ServerHandle {
            info,
            stopper: stopper.clone(),
            threads: Vec::with_capacity(loops + 1),
            on_shutdown: Some(on_shutdown),
        };

        let mut acceptor = Some(acceptor);
        for (poller, stats) in pollers.into_iter().zip(stats) {
            let index = stats.index();
            let mut event_loop = EventLoop::new(
                poller,
                stats,
                Arc::clone(&handler),
                Arc::clone(&codec),
                stopper.clone(),
                settings,
            );
            if acceptor_poller.is_none() {
                if let Some(acceptor) = acceptor.take() {
                    event_loop = event_loop.with_acceptor(acceptor);
                }
            }
            handle.spawn(format!("mill-loop-{index}"), move || event_loop.run())?;
        }

        if let (Some(poller), Some(acceptor)) = (acceptor_poller, acceptor) {
            let timeout = Some(config.poll_timeout);
            let stopper = stopper.clone();
            handle.spawn("mill-acceptor".to_string(), move || {
                acceptor.run(poller, stopper, timeout)
            })?;
        }

        Ok(handle)
    }

    /// Starts the server and blocks until it stops.
    pub fn run(self) -> Result<()> {
        self.start()?.wait()
    }
}

/// Builds a server and runs it on the calling thread until it stops.
pub fn serve<H, C>(handler: H, codec: C, config: ServerConfig) -> Result<()>
where
    H: EventHandler,
    C: Codec<Frame = H::Frame>,
{
    Server::new(config, handler, codec).run()
}

/// A running server. Dropping the handle stops the server and joins it.
pub struct ServerHandle {
    info: ServerInfo,
    stopper: Stopper,
    threads: Vec<JoinHandle<Result<()>>>,
    on_shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("info", &self.info)
            .field("stopping", &self.stopper.is_stopping())
            .finish()
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.info.local_addr
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// A stop trigger that outlives the handle, e.g. for a signal handler.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Blocks until every loop has stopped, then runs `on_shutdown`.
    /// Returns the first error any loop or the acceptor stopped with.
    pub fn wait(mut self) -> Result<()> {
        self.join()
    }

    fn spawn<F>(&mut self, name: String, run: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match Builder::new().name(name).spawn(run) {
            Ok(thread) => {
                self.threads.push(thread);
                Ok(())
            }
            Err(e) => {
                // `self` is dropped by the caller's `?`, which stops and joins
                // whatever already started
                error!(error = %e, "failed to spawn server thread");
                Err(Error::Io(e))
            }
        }
    }

    fn join(&mut self) -> Result<()> {
        let mut outcome = Ok(());
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("mill").to_string();
            let result = match thread.join() {
                Ok(result) => result,
                Err(_) => Err(Error::Io(io::Error::other(format!("{name} panicked")))),
            };
            if let Err(e) = result {
                error!(thread = %name, error = %e, "server thread failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        if let Some(on_shutdown) = self.on_shutdown.take() {
            on_shutdown();
            info!(addr = %self.info.local_addr, "server stopped");
        }
        outcome
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stopper.stop();
        let _ = self.join();
    }
}
