//! # Mill-Raw
//! Raw socket connections driven by a reactor-based event loop built on top
//! of [`mio`]: no framing, no handshake of its own, bytes in and bytes out.
//!
//! A connection is adopted into a *role* ([`role::RawSkt`]) that reacts to
//! readiness, and bound to an application *protocol* ([`protocol::RawHandler`])
//! that receives the role's events.
//! ## Guarantees
//! - **Output first**: while bytes are queued for a connection, no new input
//!   is read for it
//! - **One-shot writable**: every `on_writable` must be asked for with
//!   `request_writable`
//! - **Close on zero**: a zero-length read tears the connection down in the
//!   same dispatch
//! - **Single teardown**: `on_close` runs at most once per connection
//! - **No overlap**: one connection never sees two callbacks at once
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ EventLoop   │───▶│   Reactor    │───▶│ PollHandle  │
//! └─────────────┘    └──────────────┘    └─────────────┘
//!                             │ keyed by token
//!                             ▼
//!                    ┌──────────────┐    ┌───────────────────┐
//!                    │ ThreadPool   │───▶│ ConnectionService │
//!                    └──────────────┘    └─────────┬─────────┘
//!                                                  ▼
//!                                     Role ──▶ RawHandler callbacks
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_raw::prelude::*;
//!
//! struct Echo;
//!
//! impl RawHandler for Echo {
//!     fn on_rx(&self, ctx: &mut ConnCtx<'_>, data: &[u8]) -> Result<()> {
//!         ctx.write(data)?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = RawConfig::builder()
//!         .address("127.0.0.1:7681".parse().unwrap())
//!         .udp_loss_sim_rx_percent(0)
//!         .build()?;
//!     let event_loop = EventLoop::from_config(&config)?;
//!
//!     let vhost = Vhost::single("default", Protocol::new("echo", Echo));
//!     let server = RawServer::new(config, vhost)?;
//!     server.start(&event_loop, mio::Token(0))?;
//!
//!     event_loop.run()
//! }
//! ```
//!
//! - [`EventLoop`]: registers sources and runs the reactor
//! - [`role`]: role descriptors, adoption and client bind, the readiness dispatcher
//! - [`conn`]: the connection handle and its buffers
//! - [`protocol`]: application callbacks, protocols and vhosts
//! - [`net`]: TCP/UDP server and TCP client
//! - [`config`]: runtime configuration
//! - [`error`]: error types and result handling

use std::sync::Arc;

use mio::{Interest, Registry, Token};

pub mod config;
pub mod conn;
pub mod error;
pub mod event;
pub mod handler;
pub mod net;
pub mod object_pool;
pub mod poll;
pub mod protocol;
pub mod reactor;
pub mod role;
pub mod stats;
pub mod thread_pool;

#[cfg(test)]
mod test_support;

pub use handler::EventHandler;
pub use object_pool::{ObjectPool, PooledObject};

use crate::{config::RawConfig, error::Result, poll::PollHandle};

/// Commonly used items.
///
/// ```rust
/// use mill_raw::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RawConfig, RawConfigBuilder};
    pub use crate::conn::{Connection, ConnectionId, RoleState, Side};
    pub use crate::error::{RawError, Result};
    pub use crate::event::{ReadinessEvent, Subscription, UnifiedEvent};
    pub use crate::handler::EventHandler;
    pub use crate::net::{RawClient, RawServer};
    pub use crate::protocol::{ConnCtx, Protocol, RawEvent, RawHandler, Vhost};
    pub use crate::role::{AdoptType, ConnectInfo, HandleOutcome, RawSkt, Role};
    pub use crate::EventLoop;
}

/// The main event loop structure for registering I/O sources and handling events.
///
/// I/O events are detected by the poller on the thread calling
/// [`run()`](Self::run) and dispatched to registered handlers on a worker
/// pool. Events for one token always go to the same worker, in order.
///
/// ```rust,no_run
/// use mill_raw::EventLoop;
///
/// let event_loop = EventLoop::new(
///     4,      // 4 worker threads
///     512,    // Buffer for 512 events per poll
///     50      // 50ms poll timeout
/// )?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EventLoop {
    reactor: reactor::Reactor,
}

impl EventLoop {
    /// Creates a new `EventLoop` with custom configuration.
    ///
    /// ## Arguments
    /// * `workers` - Number of worker threads in the thread pool
    /// * `events_capacity` - Maximum number of events to poll per iteration
    /// * `poll_timeout_ms` - Poll timeout in milliseconds
    pub fn new(workers: usize, events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        let reactor = reactor::Reactor::new(workers, events_capacity, poll_timeout_ms)?;
        Ok(Self { reactor })
    }

    pub fn from_config(config: &RawConfig) -> Result<Self> {
        Self::new(config.workers, config.events_capacity, config.poll_timeout_ms)
    }

    /// Registers an I/O source with the event loop and associates it with a handler.
    ///
    /// When events occur on the source, the handler is invoked on a worker
    /// thread. Tokens from [`conn::CONNECTION_TOKEN_BASE`] upwards are used
    /// by connections.
    pub fn register<H, S>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
        handler: H,
    ) -> Result<()>
    where
        H: EventHandler + Send + Sync + 'static,
        S: mio::event::Source + ?Sized,
    {
        self.reactor
            .poll_handle
            .register(source, token, interests, handler)
    }

    /// Deregisters an I/O source and drops its handler.
    pub fn deregister<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.reactor.poll_handle.deregister(source, token)
    }

    pub fn registry(&self) -> Result<Registry> {
        self.reactor.poll_handle.registry()
    }

    /// Runs the event loop, blocking the current thread until
    /// [`stop()`](Self::stop) is called or polling fails.
    pub fn run(&self) -> Result<()> {
        self.reactor.run()
    }

    /// Signals the event loop to stop. Callable from any thread; `run`
    /// returns after the current polling cycle.
    pub fn stop(&self) {
        let shutdown_handler = self.reactor.get_shutdown_handle();
        shutdown_handler.shutdown();
    }

    pub(crate) fn poll_handle(&self) -> &Arc<PollHandle> {
        &self.reactor.poll_handle
    }
}
