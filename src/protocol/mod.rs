//! Application-facing callbacks for raw connections.
//!
//! The role never talks to application code directly: it names an event
//! ([`RawEvent`]) and [`deliver`] routes it to the bound protocol's
//! [`RawHandler`]. Every handler method returns `Result<()>`; an error means
//! "close this connection now" and is treated exactly like an I/O failure.
//!
//! ```rust,no_run
//! use mill_raw::protocol::{ConnCtx, Protocol, RawHandler, Vhost};
//! use mill_raw::error::Result;
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
//! let vhost = Vhost::single("default", Protocol::new("echo", Echo));
//! ```

pub mod vhost;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::conn::{Connection, ConnectionId, RoleState, Side};
use crate::error::Result;

pub use vhost::{Protocol, Vhost};

/// Events the raw role emits towards the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEvent {
    /// A client connection finished connecting
    Connected,
    /// A server-side connection was adopted
    Adopt,
    /// Bytes arrived
    Rx,
    /// The connection asked for, and got, a writable notification
    Writable,
    /// The connection is being torn down
    Close,
    /// A protocol was bound to the connection
    BindProtocol,
    /// The previous protocol was unbound
    DropProtocol,
}

/// Handler for raw connection events.
///
/// Only `on_rx` is required. Handlers run on the worker thread that owns the
/// connection; a connection never sees two callbacks at once.
pub trait RawHandler: Send + Sync + 'static {
    fn on_adopt(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn on_connected(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn on_rx(&self, ctx: &mut ConnCtx<'_>, data: &[u8]) -> Result<()>;

    fn on_writable(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once during teardown. The return value is ignored.
    fn on_close(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn on_bind_protocol(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn on_drop_protocol(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// The slice of a [`Connection`] a handler may touch during a callback.
pub struct ConnCtx<'a> {
    conn: &'a mut Connection,
}

impl<'a> ConnCtx<'a> {
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn side(&self) -> Side {
        self.conn.side()
    }

    pub fn state(&self) -> RoleState {
        self.conn.state()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Writes now if possible; whatever the socket does not take is queued
    /// and drained before any further input is processed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.conn.write(data)
    }

    /// Asks for one writable callback.
    pub fn request_writable(&mut self) -> Result<()> {
        self.conn.request_writable()
    }

    /// Pauses (`false`) or resumes (`true`) receive processing once the
    /// current callback returns.
    pub fn rx_flow_control(&mut self, enable: bool) {
        self.conn.set_rx_flow_change(enable);
    }

    pub fn has_pending_output(&self) -> bool {
        self.conn.has_pending_output()
    }

    pub fn user_space(&mut self) -> Option<&mut [u8]> {
        self.conn.user_space_mut()
    }
}

/// Delivers `event` to the connection's bound protocol, then applies any
/// receive flow change the handler asked for.
///
/// A connection with no protocol bound swallows the event.
pub fn deliver(conn: &mut Connection, event: RawEvent, data: &[u8]) -> Result<()> {
    let Some(protocol) = conn.protocol().cloned() else {
        return Ok(());
    };
    let handler = Arc::clone(&protocol.handler);

    let result = {
        let mut ctx = ConnCtx { conn: &mut *conn };
        match event {
            RawEvent::Connected => handler.on_connected(&mut ctx),
            RawEvent::Adopt => handler.on_adopt(&mut ctx),
            RawEvent::Rx => handler.on_rx(&mut ctx, data),
            RawEvent::Writable => handler.on_writable(&mut ctx),
            RawEvent::Close => handler.on_close(&mut ctx),
            RawEvent::BindProtocol => handler.on_bind_protocol(&mut ctx),
            RawEvent::DropProtocol => handler.on_drop_protocol(&mut ctx),
        }
    };

    if let Some(enable) = conn.take_rx_flow_change() {
        conn.apply_rx_flow(enable)?;
    }
    result
}
