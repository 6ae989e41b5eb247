use std::net::SocketAddr;
use std::time::Duration;

use crate::scheduler::AllocationAlgorithm;

/// Runtime configuration for a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Address the datagram endpoint binds to
    pub listen_addr: SocketAddr,
    /// Algorithm used to pick a node for the job at the head of the queue
    pub algorithm: AllocationAlgorithm,
    /// Period between `IS_ALIVE` probes sent to each node
    pub heartbeat_interval_ms: u64,
    /// Upper bound of the random delay added before a node's first probe
    pub heartbeat_jitter_ms: u64,
    /// Unanswered probes tolerated before a node is evicted
    pub max_warnings: u32,
    /// How long the dispatch loop sleeps when it has nothing to do
    pub idle_tick_ms: u64,
    /// Receive buffer size; longer datagrams are truncated
    pub max_datagram_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50000"
                .parse()
                .expect("default listen address is valid"),
            algorithm: AllocationAlgorithm::WeightedRoundRobin,
            heartbeat_interval_ms: 30_000,
            heartbeat_jitter_ms: 250,
            max_warnings: 3,
            idle_tick_ms: 250,
            max_datagram_size: 1024,
        }
    }
}

impl DispatcherConfig {
    pub fn new(listen_addr: SocketAddr, algorithm: AllocationAlgorithm) -> Self {
        Self {
            listen_addr,
            algorithm,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_heartbeat_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.heartbeat_jitter_ms = jitter_ms;
        self
    }

    pub fn with_max_warnings(mut self, max_warnings: u32) -> Self {
        self.max_warnings = max_warnings;
        self
    }

    pub fn with_idle_tick_ms(mut self, idle_tick_ms: u64) -> Self {
        self.idle_tick_ms = idle_tick_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        // Never zero
        Duration::from_millis(self.idle_tick_ms.max(1))
    }
}
