use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    thread,
    time::Duration,
};

use crate::{
    buffer::DEFAULT_BUFFER_SIZE,
    error::{Error, Result},
    net::balancer::LoadBalancing,
};

/// Server configuration.
///
/// Controls the listen address, how many event loops run and how
/// connections are spread over them, socket options, and buffer sizing.
/// Use [`ServerConfig::builder`] for ergonomic construction.
///
/// ## Event loops
///
/// - `multicore: false` runs a single loop that also accepts connections.
/// - `multicore: true` runs `num_event_loop` loops (0 means one per available
///   core) plus a dedicated acceptor thread.
///
/// ## Socket options
///
/// - `no_delay`: disables Nagle's algorithm (default on)
/// - `tcp_keep_alive`: SO_KEEPALIVE idle time, `None` leaves it off
///
/// ## Resource limits
///
/// - `read_buffer_size`: initial input buffer capacity and per-read chunk
/// - `buffer_pool_size`: input buffers preallocated and recycled between
///   connections
/// - `max_connections`: hard limit across all loops (`None` for unlimited)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub multicore: bool,
    pub num_event_loop: usize,
    pub load_balancing: LoadBalancing,
    pub tcp_keep_alive: Option<Duration>,
    pub no_delay: bool,
    pub read_buffer_size: usize,
    pub buffer_pool_size: usize,
    pub max_connections: Option<usize>,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
    /// Upper bound on one poll; loops re-check the stop flag at least this often.
    pub poll_timeout: Duration,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Number of loops the server will actually start.
    pub fn event_loop_count(&self) -> usize {
        if !self.multicore {
            return 1;
        }
        match self.num_event_loop {
            0 => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            n => n,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
            multicore: false,
            num_event_loop: 0,
            load_balancing: LoadBalancing::RoundRobin,
            tcp_keep_alive: Some(Duration::from_secs(60)),
            no_delay: true,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_pool_size: 64,
            max_connections: None,
            events_capacity: 1024,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Builder for [`ServerConfig`].
///
/// Every field is optional and falls back to [`ServerConfig::default`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    address: Option<SocketAddr>,
    multicore: Option<bool>,
    num_event_loop: Option<usize>,
    load_balancing: Option<LoadBalancing>,
    tcp_keep_alive: Option<Option<Duration>>,
    no_delay: Option<bool>,
    read_buffer_size: Option<usize>,
    buffer_pool_size: Option<usize>,
    max_connections: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn multicore(mut self, enabled: bool) -> Self {
        self.multicore = Some(enabled);
        self
    }

    /// Loop count in multicore mode; 0 means one per available core.
    pub fn num_event_loop(mut self, loops: usize) -> Self {
        self.num_event_loop = Some(loops);
        self
    }

    pub fn load_balancing(mut self, policy: LoadBalancing) -> Self {
        self.load_balancing = Some(policy);
        self
    }

    pub fn tcp_keep_alive(mut self, idle: Option<Duration>) -> Self {
        self.tcp_keep_alive = Some(idle);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = Some(size);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            address: self.address.unwrap_or(default.address),
            multicore: self.multicore.unwrap_or(default.multicore),
            num_event_loop: self.num_event_loop.unwrap_or(default.num_event_loop),
            load_balancing: self.load_balancing.unwrap_or(default.load_balancing),
            tcp_keep_alive: self.tcp_keep_alive.unwrap_or(default.tcp_keep_alive),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            read_buffer_size: self
                .read_buffer_size
                .unwrap_or(default.read_buffer_size)
                .max(1),
            buffer_pool_size: self.buffer_pool_size.unwrap_or(default.buffer_pool_size),
            max_connections: self.max_connections.or(default.max_connections),
            events_capacity: self
                .events_capacity
                .unwrap_or(default.events_capacity)
                .max(1),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
        }
    }
}

/// Parses a listen address.
///
/// Accepts `tcp://host:port`, `host:port`, and the host-less forms
/// `tcp://:port` / `:port`, which bind every IPv4 interface.
pub fn parse_address(input: &str) -> Result<SocketAddr> {
    let trimmed = input.trim();
    let rest = match trimmed.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(Error::InvalidAddress(input.to_string())),
        None => trimmed,
    };

    if let Some(port) = rest.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(input.to_string()))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    rest.parse()
        .map_err(|_| Error::InvalidAddress(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_forms() {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);

        assert_eq!(parse_address("tcp://:9000").unwrap(), any);
        assert_eq!(parse_address(":9000").unwrap(), any);
        assert_eq!(parse_address("tcp://127.0.0.1:9000").unwrap(), local);
        assert_eq!(parse_address("127.0.0.1:9000").unwrap(), local);
        assert_eq!(
            parse_address("tcp://[::1]:9000").unwrap(),
            "[::1]:9000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        for bad in ["udp://:9000", "tcp://", ":http", "localhost", ":70000"] {
            assert!(
                matches!(parse_address(bad), Err(Error::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config = ServerConfig::builder().build();
        assert_eq!(config.address.port(), 9000);
        assert!(!config.multicore);
        assert_eq!(config.event_loop_count(), 1);
        assert_eq!(config.load_balancing, LoadBalancing::RoundRobin);
        assert_eq!(config.tcp_keep_alive, Some(Duration::from_secs(60)));
        assert!(config.no_delay);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.max_connections, None);
    }

    #[test]
    fn test_loop_count_follows_multicore() {
        let config = ServerConfig::builder()
            .num_event_loop(4)
            .build();
        assert_eq!(config.event_loop_count(), 1);

        let config = ServerConfig::builder()
            .multicore(true)
            .num_event_loop(4)
            .build();
        assert_eq!(config.event_loop_count(), 4);

        let config = ServerConfig::builder().multicore(true).build();
        assert!(config.event_loop_count() >= 1);
    }
}
