//! Raw socket servers and clients on top of the event loop.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌─────────────────┐              │
//! │  │ RawServer/   │────────▶│ Your RawHandler │              │
//! │  │ RawClient    │          │ (per Protocol)  │              │
//! │  └──────────────┘          └─────────────────┘              │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ adopt / connect      │ on_adopt, on_rx,
//!              ▼                      │ on_writable, on_close ...
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ConnectionService (one per connection, EventHandler)       │
//! │     ReadinessEvent ──▶ Role::handle_readiness ──▶ outcome   │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ registered with
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   EventLoop: Reactor (mio Poll) ──▶ keyed ThreadPool        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every connection gets a token derived from its [`ConnectionId`]
//! (`CONNECTION_TOKEN_BASE + id`); listener tokens must stay below
//! [`CONNECTION_TOKEN_BASE`].
//!
//! # Example
//!
//! ```rust,no_run
//! use mill_raw::net::RawServer;
//! use mill_raw::protocol::{ConnCtx, Protocol, RawHandler, Vhost};
//! use mill_raw::{config::RawConfig, error::Result, EventLoop};
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
//! # fn main() -> Result<()> {
//! let config = RawConfig::builder()
//!     .address("127.0.0.1:7681".parse().unwrap())
//!     .build()?;
//!
//! let event_loop = EventLoop::from_config(&config)?;
//! let server = RawServer::new(config, Vhost::single("default", Protocol::new("echo", Echo)))?;
//!
//! server.start(&event_loop, mio::Token(0))?;
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`ConnectionId`]: crate::conn::ConnectionId
//! [`CONNECTION_TOKEN_BASE`]: crate::conn::CONNECTION_TOKEN_BASE

pub mod client;
pub mod server;
pub mod service;

pub use client::RawClient;
pub use server::RawServer;
pub use service::ConnectionService;
