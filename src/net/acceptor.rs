use std::{io, net::SocketAddr, time::Duration};

use mio::{
    net::{TcpListener, TcpStream},
    Interest, Token,
};
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, info, warn};

use crate::{
    buffer::RingBuffer,
    connection::{Connection, ConnectionId},
    error::{Error, Result},
    event_loop::Task,
    net::{balancer::LoadBalancer, config::ServerConfig},
    object_pool::ObjectPool,
    poll::{Poller, Trigger},
    server::Stopper,
};

/// Token of the listening socket, on whichever poller drives the acceptor.
pub const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketOptions {
    pub no_delay: bool,
    pub keep_alive: Option<Duration>,
    pub max_connections: Option<usize>,
}

impl From<&ServerConfig> for SocketOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            no_delay: config.no_delay,
            keep_alive: config.tcp_keep_alive,
            max_connections: config.max_connections,
        }
    }
}

/// Accepts connections and hands each one to an event loop.
///
/// The acceptor never touches a connection after triggering its
/// registration; from then on it belongs to the chosen loop.
pub(crate) struct Acceptor<F> {
    listener: TcpListener,
    balancer: LoadBalancer,
    loops: Vec<Trigger<Task<F>>>,
    buffers: ObjectPool<RingBuffer>,
    options: SocketOptions,
    next_id: u64,
}

impl<F: Send + 'static> Acceptor<F> {
    pub(crate) fn new(
        listener: TcpListener,
        balancer: LoadBalancer,
        loops: Vec<Trigger<Task<F>>>,
        buffers: ObjectPool<RingBuffer>,
        options: SocketOptions,
    ) -> Self {
        debug_assert_eq!(balancer.len(), loops.len());
        Self {
            listener,
            balancer,
            loops,
            buffers,
            options,
            next_id: 1,
        }
    }

    pub(crate) fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    pub(crate) fn register(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
    }

    /// Accepts until the listener would block. Returns how many connections
    /// were handed to loops.
    pub(crate) fn drain(&mut self) -> Result<usize> {
        let mut handed = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.dispatch(stream, peer) {
                        handed += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(handed),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(error = %e, "peer went away before accept completed");
                }
                Err(e) => return Err(Error::AcceptSocket(e)),
            }
        }
    }

    /// A connection counts against its loop as soon as it is built here, so
    /// the limit and the least-connections policy see every connection still
    /// in flight. Dropping it on any failure path gives the slot back.
    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) -> bool {
        if let Some(max) = self.options.max_connections {
            if self.balancer.total_connections() >= max {
                warn!(%peer, max, "connection limit reached, rejecting");
                return false;
            }
        }

        self.apply_options(&stream, peer);

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let index = self.balancer.next(&peer);
        let (Some(trigger), Some(stats)) = (self.loops.get(index), self.balancer.loop_stats(index))
        else {
            warn!(%peer, index, "balancer picked a loop that does not exist");
            return false;
        };

        let conn = Connection::new(
            id,
            stream,
            peer,
            stats,
            trigger.clone(),
            self.buffers.acquire(),
        );
        match trigger.trigger(Task::Register(conn)) {
            Ok(()) => {
                debug!(conn = %id, %peer, event_loop = index, "accepted");
                true
            }
            Err(e) => {
                warn!(conn = %id, %peer, error = %e, "dropping accepted connection");
                false
            }
        }
    }

    fn apply_options(&self, stream: &TcpStream, peer: SocketAddr) {
        if self.options.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
        }
        if let Some(idle) = self.options.keep_alive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                warn!(%peer, error = %e, "failed to set SO_KEEPALIVE");
            }
        }
    }

    /// Multicore mode: runs on a dedicated thread with its own poller until
    /// the server stops.
    pub(crate) fn run(
        mut self,
        mut poller: Poller<()>,
        stopper: Stopper,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, loops = self.loops.len(), "acceptor running");
        }

        let mut ready = Vec::new();
        while !stopper.is_stopping() {
            if let Err(e) = poller.wait(timeout, &mut ready) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                stopper.stop();
                return Err(e.into());
            }

            if ready.iter().any(|r| r.token() == LISTENER_TOKEN) {
                match self.drain() {
                    Ok(accepted) => debug!(accepted, "accept drained"),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        let _ = poller.remove(&mut self.listener);
        info!("acceptor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_loop::LoopStats, net::balancer::LoadBalancing};
    use std::{net::TcpStream as StdStream, sync::Arc, thread, time::Instant};

    fn acceptor(
        pollers: &[Poller<Task<()>>],
        options: SocketOptions,
    ) -> (Acceptor<()>, Vec<Arc<LoopStats>>) {
        balanced_acceptor(pollers, options, LoadBalancing::RoundRobin)
    }

    fn balanced_acceptor(
        pollers: &[Poller<Task<()>>],
        options: SocketOptions,
        policy: LoadBalancing,
    ) -> (Acceptor<()>, Vec<Arc<LoopStats>>) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let stats: Vec<_> = (0..pollers.len())
            .map(|i| Arc::new(LoopStats::new(i)))
            .collect();
        let acceptor = Acceptor::new(
            listener,
            LoadBalancer::new(policy, stats.clone()),
            pollers.iter().map(Poller::trigger).collect(),
            ObjectPool::new(4, RingBuffer::default),
            options,
        );
        (acceptor, stats)
    }

    fn options() -> SocketOptions {
        SocketOptions {
            no_delay: true,
            keep_alive: Some(Duration::from_secs(30)),
            max_connections: None,
        }
    }

    /// Accepts until `want` connections were handed over or two seconds pass;
    /// the kernel may not have completed every handshake on the first call.
    fn drain_until(acceptor: &mut Acceptor<()>, want: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut total = 0;
        while total < want && Instant::now() < deadline {
            total += acceptor.drain().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        total
    }

    fn registrations(poller: &Poller<Task<()>>) -> Vec<ConnectionId> {
        let mut ids = Vec::new();
        poller.drain_tasks(|task| {
            if let Task::Register(conn) = task {
                ids.push(conn.id());
            }
        });
        ids
    }

    #[test]
    fn test_drain_hands_every_connection_to_a_loop() {
        let pollers = vec![Poller::new(0, 16).unwrap()];
        let (mut acceptor, _) = acceptor(&pollers, options());
        let addr = acceptor.listener.local_addr().unwrap();

        let _clients: Vec<_> = (0..3).map(|_| StdStream::connect(addr).unwrap()).collect();

        assert_eq!(drain_until(&mut acceptor, 3), 3);
        // nothing left: the listener would block
        assert_eq!(acceptor.drain().unwrap(), 0);
        assert_eq!(
            registrations(&pollers[0]),
            vec![ConnectionId(1), ConnectionId(2), ConnectionId(3)]
        );
    }

    #[test]
    fn test_connections_are_spread_round_robin() {
        let pollers: Vec<_> = (0..2).map(|i| Poller::new(i, 16).unwrap()).collect();
        let (mut acceptor, _) = acceptor(&pollers, options());
        let addr = acceptor.listener.local_addr().unwrap();

        let _clients: Vec<_> = (0..4).map(|_| StdStream::connect(addr).unwrap()).collect();
        assert_eq!(drain_until(&mut acceptor, 4), 4);

        assert_eq!(registrations(&pollers[0]).len(), 2);
        assert_eq!(registrations(&pollers[1]).len(), 2);
    }

    #[test]
    fn test_connection_limit_rejects_excess() {
        let pollers = vec![Poller::new(0, 16).unwrap()];
        let (mut acceptor, stats) = acceptor(
            &pollers,
            SocketOptions {
                max_connections: Some(1),
                ..options()
            },
        );
        stats[0].opened();
        let addr = acceptor.listener.local_addr().unwrap();

        let _client = StdStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(acceptor.drain().unwrap(), 0);
        assert!(registrations(&pollers[0]).is_empty());
    }

    #[test]
    fn test_connection_limit_holds_within_one_burst() {
        let pollers = vec![Poller::new(0, 16).unwrap()];
        let (mut acceptor, stats) = acceptor(
            &pollers,
            SocketOptions {
                max_connections: Some(2),
                ..options()
            },
        );
        let addr = acceptor.listener.local_addr().unwrap();

        let _clients: Vec<_> = (0..5).map(|_| StdStream::connect(addr).unwrap()).collect();
        thread::sleep(Duration::from_millis(50));

        // nothing registered yet: the loop has not run
        assert_eq!(acceptor.drain().unwrap(), 2);
        assert_eq!(stats[0].connections(), 2);
        assert_eq!(registrations(&pollers[0]).len(), 2);
        // dropping the queued registrations gives their slots back
        assert_eq!(stats[0].connections(), 0);
    }

    #[test]
    fn test_least_connections_spreads_one_burst() {
        let pollers: Vec<_> = (0..2).map(|i| Poller::new(i, 16).unwrap()).collect();
        let (mut acceptor, stats) =
            balanced_acceptor(&pollers, options(), LoadBalancing::LeastConnections);
        let addr = acceptor.listener.local_addr().unwrap();

        let _clients: Vec<_> = (0..4).map(|_| StdStream::connect(addr).unwrap()).collect();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(acceptor.drain().unwrap(), 4);
        assert_eq!(stats[0].connections(), 2);
        assert_eq!(stats[1].connections(), 2);
        assert_eq!(registrations(&pollers[0]).len(), 2);
        assert_eq!(registrations(&pollers[1]).len(), 2);
    }

    #[test]
    fn test_stopped_loop_drops_connection() {
        let pollers = vec![Poller::new(0, 16).unwrap()];
        let (mut acceptor, stats) = acceptor(&pollers, options());
        pollers[0].close();
        let addr = acceptor.listener.local_addr().unwrap();

        let _client = StdStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(acceptor.drain().unwrap(), 0);
        assert_eq!(stats[0].connections(), 0);
    }
}
