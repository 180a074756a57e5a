use std::net::SocketAddr;

use crate::error::{RawError, Result};
use crate::thread_pool::DEFAULT_POOL_CAPACITY;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Configuration shared by raw servers, raw clients and the event loop.
///
/// Use [`RawConfig::builder()`] for construction; `build()` validates the
/// values and rejects out-of-range ones.
///
/// ## Loss simulation
///
/// - `udp_loss_sim_rx_percent`: chance (0-100) that an inbound datagram is
///   dropped before reaching the application. 0 disables the simulation.
/// - `rng_seed`: fixes the random draws so drop patterns are reproducible.
#[derive(Debug, Clone)]
pub struct RawConfig {
    /// Address to bind to (servers) or connect to (clients)
    pub address: SocketAddr,
    /// Size of pooled read buffers
    pub buffer_size: usize,
    /// Inbound datagram drop probability, in percent
    pub udp_loss_sim_rx_percent: u8,
    /// Seed for the loss simulation RNG
    pub rng_seed: Option<u64>,
    /// Event loop worker threads
    pub workers: usize,
    /// Events fetched per poll
    pub events_capacity: usize,
    /// Poll timeout in milliseconds
    pub poll_timeout_ms: u64,
    /// Maximum number of live connections, accepted or adopted
    pub max_connections: Option<usize>,
    /// Cap on received bytes held for a later pass, preamble included
    pub max_buffered_input: Option<usize>,
    /// Enable TCP_NODELAY on accepted and connected streams
    pub no_delay: bool,
}

impl RawConfig {
    /// Create a new builder for RawConfig
    pub fn builder() -> RawConfigBuilder {
        RawConfigBuilder::new()
    }

    fn validate(&self) -> Result<()> {
        if self.udp_loss_sim_rx_percent > 100 {
            return Err(RawError::Configuration(format!(
                "udp loss percentage {} is above 100",
                self.udp_loss_sim_rx_percent
            )));
        }
        if self.buffer_size == 0 {
            return Err(RawError::Configuration("buffer size must be non-zero".into()));
        }
        if self.workers == 0 {
            return Err(RawError::Configuration("at least one worker is required".into()));
        }
        if self.max_buffered_input == Some(0) {
            return Err(RawError::Configuration("buffered input cap must be non-zero".into()));
        }
        if self.events_capacity == 0 {
            return Err(RawError::Configuration("events capacity must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            buffer_size: DEFAULT_BUFFER_SIZE,
            udp_loss_sim_rx_percent: 0,
            rng_seed: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_POOL_CAPACITY),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            max_connections: None,
            max_buffered_input: None,
            no_delay: true,
        }
    }
}

/// Builder for RawConfig.
///
/// Unset fields fall back to RawConfig::default().
#[derive(Default)]
pub struct RawConfigBuilder {
    address: Option<SocketAddr>,
    buffer_size: Option<usize>,
    udp_loss_sim_rx_percent: Option<u8>,
    rng_seed: Option<u64>,
    workers: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout_ms: Option<u64>,
    max_connections: Option<usize>,
    max_buffered_input: Option<usize>,
    no_delay: Option<bool>,
}

impl RawConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn udp_loss_sim_rx_percent(mut self, percent: u8) -> Self {
        self.udp_loss_sim_rx_percent = Some(percent);
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout_ms(mut self, timeout: u64) -> Self {
        self.poll_timeout_ms = Some(timeout);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn max_buffered_input(mut self, bytes: usize) -> Self {
        self.max_buffered_input = Some(bytes);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Build and validate the RawConfig
    pub fn build(self) -> Result<RawConfig> {
        let default = RawConfig::default();
        let config = RawConfig {
            address: self.address.unwrap_or(default.address),
            buffer_size: self.buffer_size.unwrap_or(default.buffer_size),
            udp_loss_sim_rx_percent: self
                .udp_loss_sim_rx_percent
                .unwrap_or(default.udp_loss_sim_rx_percent),
            rng_seed: self.rng_seed.or(default.rng_seed),
            workers: self.workers.unwrap_or(default.workers),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout_ms: self.poll_timeout_ms.unwrap_or(default.poll_timeout_ms),
            max_connections: self.max_connections.or(default.max_connections),
            max_buffered_input: self.max_buffered_input.or(default.max_buffered_input),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
        };
        config.validate()?;
        Ok(config)
    }
}
