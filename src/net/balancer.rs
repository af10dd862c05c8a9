use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::Arc,
};

use crate::event_loop::LoopStats;

/// Policy for spreading new connections over event loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    /// Loop with the fewest live connections, lowest index on ties.
    LeastConnections,
    /// Hash of the peer IP, so one client host always lands on one loop.
    SourceAddrHash,
}

/// Picks the loop for each accepted connection. Only the acceptor calls
/// [`next`](Self::next); loop counts are read through their atomics.
#[derive(Debug)]
pub struct LoadBalancer {
    policy: LoadBalancing,
    loops: Vec<Arc<LoopStats>>,
    cursor: usize,
}

impl LoadBalancer {
    pub fn new(policy: LoadBalancing, loops: Vec<Arc<LoopStats>>) -> Self {
        debug_assert!(!loops.is_empty(), "balancer needs at least one loop");
        Self {
            policy,
            loops,
            cursor: 0,
        }
    }

    pub fn policy(&self) -> LoadBalancing {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn loop_stats(&self, index: usize) -> Option<&Arc<LoopStats>> {
        self.loops.get(index)
    }

    /// Live connections across every loop.
    pub fn total_connections(&self) -> usize {
        self.loops.iter().map(|stats| stats.connections()).sum()
    }

    /// Index of the loop that should own a connection from `peer`.
    pub fn next(&mut self, peer: &SocketAddr) -> usize {
        let len = self.loops.len().max(1);
        match self.policy {
            LoadBalancing::RoundRobin => {
                let index = self.cursor % len;
                self.cursor = self.cursor.wrapping_add(1);
                index
            }
            LoadBalancing::LeastConnections => self
                .loops
                .iter()
                .enumerate()
                .min_by_key(|(_, stats)| stats.connections())
                .map_or(0, |(index, _)| index),
            LoadBalancing::SourceAddrHash => {
                let mut hasher = DefaultHasher::new();
                peer.ip().hash(&mut hasher);
                (hasher.finish() % len as u64) as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loops(n: usize) -> Vec<Arc<LoopStats>> {
        (0..n).map(|i| Arc::new(LoopStats::new(i))).collect()
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 7], port))
    }

    #[test]
    fn test_round_robin_is_even() {
        let mut balancer = LoadBalancer::new(LoadBalancing::RoundRobin, loops(4));
        let mut counts = [0usize; 4];
        for port in 0..100 {
            counts[balancer.next(&peer(port))] += 1;
        }
        assert_eq!(counts, [25, 25, 25, 25]);
    }

    #[test]
    fn test_least_connections_prefers_idle_loop() {
        let stats = loops(3);
        for (stats, open) in stats.iter().zip([5, 2, 9]) {
            (0..open).for_each(|_| stats.opened());
        }

        let mut balancer = LoadBalancer::new(LoadBalancing::LeastConnections, stats.clone());
        assert_eq!(balancer.next(&peer(1)), 1);

        (0..5).for_each(|_| stats[1].opened());
        assert_eq!(balancer.next(&peer(1)), 0);
        assert_eq!(balancer.total_connections(), 21);
    }

    #[test]
    fn test_source_hash_ignores_port() {
        let mut balancer = LoadBalancer::new(LoadBalancing::SourceAddrHash, loops(8));
        let first = balancer.next(&peer(1000));
        for port in 1001..1100 {
            assert_eq!(balancer.next(&peer(port)), first);
        }
        assert!(first < 8);
    }
}
