//! The connection handle the framework owns and roles act upon.
//!
//! ```text
//! Connection
//!   ├── socket ─────────── Box<dyn RawSocket>  (mio TcpStream / UdpSocket)
//!   ├── subscription ───── logical read/write interest
//!   ├── registration ───── PollHandle + Token, synced on every change
//!   ├── buflist_out ────── bytes the socket did not take yet
//!   ├── buflist_in ─────── bytes received but not yet delivered
//!   ├── protocol ───────── bound application handler + user space
//!   └── flags ──────────── favoured_read / seen_zero_length_read /
//!                          could_have_pending_write
//! ```
//!
//! Roles never own a connection. They request transitions (role, state,
//! subscription) and, on failure, the single teardown path
//! [`Connection::close_and_free`]. Once that has run the handle is inert.

pub mod buflist;
pub mod read;
pub mod socket;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::Token;
use tracing::{debug, trace, warn};

use crate::error::{RawError, Result};
use crate::event::Subscription;
use crate::poll::PollHandle;
use crate::protocol::{deliver, Protocol, Vhost};
use crate::role::{ConnectInfo, RoleInfo};

pub use buflist::BufList;
pub use read::{ConsumeOutcome, ReadBuf, ReadOutcome};
pub use socket::RawSocket;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Tokens below this value are free for listeners and user sources.
pub const CONNECTION_TOKEN_BASE: usize = 1024;

/// Unique identifier for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    /// Allocates a process-wide unique id.
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn token(&self) -> Token {
        Token(CONNECTION_TOKEN_BASE + self.0 as usize)
    }
}

/// Which side originated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Lifecycle states relevant to the raw role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Unconnected,
    SslInit,
    SslAckPending,
    WaitingConnect,
    Established,
    Dead,
}

/// Sticky per-connection flags the dispatcher reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFlags {
    /// A receive was serviced while write readiness was also pending
    pub favoured_read: bool,
    /// A zero-length read was observed; the connection is closing
    pub seen_zero_length_read: bool,
    /// Output was left buffered since the last writable service
    pub could_have_pending_write: bool,
}

/// Auxiliary state for datagram connections.
#[derive(Debug, Clone, Default)]
pub struct UdpState {
    /// Sender of the most recent datagram; replies go here
    pub peer: Option<SocketAddr>,
}

/// What a client asked for at connect time.
#[derive(Debug, Clone)]
pub struct ConnectStash {
    pub address: SocketAddr,
    pub method: Option<String>,
    pub protocol: Option<String>,
}

impl From<&ConnectInfo> for ConnectStash {
    fn from(info: &ConnectInfo) -> Self {
        Self {
            address: info.address,
            method: info.method.clone(),
            protocol: info.protocol.clone(),
        }
    }
}

struct Registration {
    poll: Arc<PollHandle>,
    token: Token,
    attached: bool,
}

pub struct Connection {
    id: ConnectionId,
    side: Side,
    state: RoleState,
    role_info: Option<&'static RoleInfo>,
    pub flags: RawFlags,
    socket: Box<dyn RawSocket>,
    subscription: Subscription,
    registration: Option<Registration>,
    buflist_out: BufList,
    buflist_in: BufList,
    vhost: Arc<Vhost>,
    protocol: Option<Arc<Protocol>>,
    protocol_bound: bool,
    fallback_bound: bool,
    user_space: Option<Vec<u8>>,
    stash: Option<ConnectStash>,
    udp: Option<UdpState>,
    rx_flow_change: Option<bool>,
    writable_requested_at: Option<Instant>,
    destroyed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("state", &self.state)
            .field("role", &self.role_info.map(|r| r.name))
            .field("flags", &self.flags)
            .field("subscription", &self.subscription)
            .field("pending_output", &self.buflist_out.len())
            .field("pending_input", &self.buflist_in.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Connection {
    pub fn new(id: ConnectionId, socket: Box<dyn RawSocket>, vhost: Arc<Vhost>) -> Self {
        Self {
            id,
            side: Side::Server,
            state: RoleState::Unconnected,
            role_info: None,
            flags: RawFlags::default(),
            socket,
            subscription: Subscription::NONE,
            registration: None,
            buflist_out: BufList::new(),
            buflist_in: BufList::new(),
            vhost,
            protocol: None,
            protocol_bound: false,
            fallback_bound: false,
            user_space: None,
            stash: None,
            udp: None,
            rx_flow_change: None,
            writable_requested_at: None,
            destroyed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_client(&self) -> bool {
        self.side == Side::Client
    }

    pub fn state(&self) -> RoleState {
        self.state
    }

    pub fn set_state(&mut self, state: RoleState) {
        trace!(conn = ?self.id, from = ?self.state, to = ?state, "state change");
        self.state = state;
    }

    pub fn role_info(&self) -> Option<&'static RoleInfo> {
        self.role_info
    }

    /// Attaches a role and puts the connection in its initial state.
    pub fn role_transition(&mut self, side: Side, state: RoleState, role: &'static RoleInfo) {
        debug!(conn = ?self.id, role = role.name, ?side, ?state, "role transition");
        self.side = side;
        self.role_info = Some(role);
        self.state = state;
    }

    pub fn vhost(&self) -> &Arc<Vhost> {
        &self.vhost
    }

    pub fn socket(&self) -> &dyn RawSocket {
        &*self.socket
    }

    pub fn socket_mut(&mut self) -> &mut dyn RawSocket {
        &mut *self.socket
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.udp
            .as_ref()
            .and_then(|u| u.peer)
            .or_else(|| self.socket.peer_addr().ok())
    }

    pub fn is_datagram(&self) -> bool {
        self.udp.is_some()
    }

    pub fn udp(&self) -> Option<&UdpState> {
        self.udp.as_ref()
    }

    pub fn udp_mut(&mut self) -> Option<&mut UdpState> {
        self.udp.as_mut()
    }

    pub fn set_udp(&mut self, udp: UdpState) {
        self.udp = Some(udp);
    }

    pub fn stash(&self) -> Option<&ConnectStash> {
        self.stash.as_ref()
    }

    pub fn set_stash(&mut self, stash: ConnectStash) {
        self.stash = Some(stash);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn token(&self) -> Option<Token> {
        self.registration.as_ref().map(|r| r.token)
    }

    // ---- subscription -------------------------------------------------

    pub fn subscription(&self) -> Subscription {
        self.subscription
    }

    /// Clears the bits in `remove`, then sets the bits in `add`, and pushes
    /// the result to the poller.
    pub fn change_subscription(&mut self, remove: Subscription, add: Subscription) -> Result<()> {
        self.subscription = Subscription {
            read: (self.subscription.read && !remove.read) || add.read,
            write: (self.subscription.write && !remove.write) || add.write,
        };
        self.rearm()
    }

    /// Registers the socket with `poll` under `token`.
    pub fn attach(
        &mut self,
        poll: Arc<PollHandle>,
        token: Token,
        subscription: Subscription,
    ) -> Result<()> {
        self.registration = Some(Registration {
            poll,
            token,
            attached: false,
        });
        self.subscription = subscription;
        self.rearm()
    }

    /// Interest actually handed to the poller. Read is masked while output
    /// is queued: nothing can be received until the backlog drains.
    fn poll_interest(&self) -> Option<mio::Interest> {
        let mut sub = self.subscription;
        if !self.buflist_out.is_empty() {
            sub.read = false;
            sub.write = true;
        }
        sub.to_interest()
    }

    /// Re-registers with the current interest. The poller is edge
    /// triggered; re-registering makes it report readiness that is still
    /// present, which gives level semantics across dispatches.
    pub fn rearm(&mut self) -> Result<()> {
        let interest = self.poll_interest();
        let Some(reg) = self.registration.as_mut() else {
            return Ok(());
        };
        match (interest, reg.attached) {
            (Some(interest), true) => reg.poll.reregister(&mut *self.socket, reg.token, interest)?,
            (Some(interest), false) => {
                reg.poll.attach(&mut *self.socket, reg.token, interest)?;
                reg.attached = true;
            }
            (None, true) => {
                reg.poll.detach(&mut *self.socket)?;
                reg.attached = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    fn detach(&mut self) {
        let Some(reg) = self.registration.take() else {
            return;
        };
        if reg.attached {
            if let Err(e) = reg.poll.detach(&mut *self.socket) {
                debug!(conn = ?self.id, error = %e, "deregister failed");
            }
        }
        if let Err(e) = reg.poll.unregister(reg.token) {
            debug!(conn = ?self.id, error = %e, "handler removal failed");
        }
    }

    /// Arms write interest for one writable callback.
    pub fn request_writable(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        self.writable_requested_at.get_or_insert_with(Instant::now);
        self.change_subscription(Subscription::NONE, Subscription::WRITE)
    }

    pub(crate) fn take_writable_request(&mut self) -> Option<Instant> {
        self.writable_requested_at.take()
    }

    pub(crate) fn set_rx_flow_change(&mut self, enable: bool) {
        self.rx_flow_change = Some(enable);
    }

    pub(crate) fn take_rx_flow_change(&mut self) -> Option<bool> {
        self.rx_flow_change.take()
    }

    pub(crate) fn apply_rx_flow(&mut self, enable: bool) -> Result<()> {
        trace!(conn = ?self.id, enable, "rx flow control");
        if enable {
            self.change_subscription(Subscription::NONE, Subscription::READ)
        } else {
            self.change_subscription(Subscription::READ, Subscription::NONE)
        }
    }

    // ---- output ---------------------------------------------------------

    pub fn has_pending_output(&self) -> bool {
        !self.buflist_out.is_empty()
    }

    pub fn pending_output_len(&self) -> usize {
        self.buflist_out.len()
    }

    /// Writes `data`, queueing whatever the socket does not accept.
    ///
    /// Data is queued behind any existing backlog so ordering holds. Returns
    /// the number of bytes accepted, which is all of them unless the socket
    /// failed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.destroyed || self.state == RoleState::Dead {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        if data.is_empty() {
            return Ok(0);
        }

        if !self.buflist_out.is_empty() {
            if self.flags.could_have_pending_write {
                warn!(conn = ?self.id, len = data.len(), "write on top of buffered output");
            }
            self.buflist_out.append(data)?;
            self.flags.could_have_pending_write = true;
            return Ok(data.len());
        }

        let peer = self.udp.as_ref().and_then(|u| u.peer);
        let sent = match self.socket.send(data, peer) {
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                0
            }
            Err(e) => return Err(e.into()),
        };

        if sent < data.len() {
            trace!(conn = ?self.id, sent, queued = data.len() - sent, "truncated send");
            self.buflist_out.append(&data[sent..])?;
            self.flags.could_have_pending_write = true;
            self.request_writable()?;
        }
        Ok(data.len())
    }

    /// Pushes queued output to the socket until it is empty or the socket
    /// stops accepting. Always re-arms write interest afterwards so the
    /// application hears about writability once the backlog is gone.
    pub fn flush_pending_output(&mut self) -> Result<usize> {
        let peer = self.udp.as_ref().and_then(|u| u.peer);
        let mut written = 0;

        while let Some(head) = self.buflist_out.head() {
            match self.socket.send(head, peer) {
                Ok(0) => break,
                Ok(n) => {
                    written += n;
                    self.buflist_out.consume(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if self.buflist_out.is_empty() {
            debug!(conn = ?self.id, written, "partial send completed");
        } else {
            trace!(conn = ?self.id, written, left = self.buflist_out.len(), "backlog remains");
        }
        self.request_writable()?;
        Ok(written)
    }

    // ---- input ----------------------------------------------------------

    pub fn has_pending_input(&self) -> bool {
        !self.buflist_in.is_empty()
    }

    /// Seeds buffered input, e.g. bytes read by the caller before adoption.
    /// Caps the input held between passes; see [`BufList::set_limit`].
    pub fn set_input_limit(&mut self, limit: Option<usize>) {
        self.buflist_in.set_limit(limit);
    }

    pub fn preload_input(&mut self, data: &[u8]) -> Result<()> {
        self.buflist_in.append(data)
    }

    pub(crate) fn input_mut(&mut self) -> &mut BufList {
        &mut self.buflist_in
    }

    pub(crate) fn input(&self) -> &BufList {
        &self.buflist_in
    }

    // ---- protocol binding ------------------------------------------------

    pub fn protocol(&self) -> Option<&Arc<Protocol>> {
        self.protocol.as_ref()
    }

    pub fn user_space(&self) -> Option<&[u8]> {
        self.user_space.as_deref()
    }

    pub fn user_space_mut(&mut self) -> Option<&mut [u8]> {
        self.user_space.as_deref_mut()
    }

    /// Allocates the bound protocol's per-session storage if it is missing.
    pub fn ensure_user_space(&mut self) -> Result<()> {
        if self.user_space.is_some() {
            return Ok(());
        }
        let Some(protocol) = self.protocol.as_ref() else {
            return Ok(());
        };
        let size = protocol.per_session_data_size();
        if size == 0 {
            return Ok(());
        }

        let mut space = Vec::new();
        space.try_reserve_exact(size).map_err(|e| {
            RawError::Allocation(format!("{} bytes of user space: {}", size, e))
        })?;
        space.resize(size, 0);
        self.user_space = Some(space);
        Ok(())
    }

    /// Binds `protocol`, unbinding the previous one first.
    pub fn bind_protocol(&mut self, protocol: Arc<Protocol>) -> Result<()> {
        self.unbind_protocol();
        debug!(conn = ?self.id, protocol = protocol.name(), "bind protocol");
        self.protocol = Some(protocol);
        self.ensure_user_space()?;
        self.protocol_bound = true;

        if let Some(role) = self.role_info {
            deliver(self, role.callbacks.protocol_bind.for_side(self.side), &[])?;
        }
        Ok(())
    }

    /// Binds the vhost's raw fallback protocol. Happens at most once per
    /// connection; later calls are no-ops.
    pub fn bind_fallback_protocol(&mut self) -> Result<()> {
        if self.fallback_bound {
            return Ok(());
        }
        self.fallback_bound = true;
        let protocol = Arc::clone(self.vhost.raw_protocol());
        self.bind_protocol(protocol)
    }

    fn unbind_protocol(&mut self) {
        if !self.protocol_bound {
            return;
        }
        self.protocol_bound = false;
        if let Some(role) = self.role_info {
            if let Err(e) = deliver(self, role.callbacks.protocol_unbind.for_side(self.side), &[])
            {
                debug!(conn = ?self.id, error = %e, "drop protocol callback failed");
            }
        }
        self.user_space = None;
    }

    // ---- teardown -------------------------------------------------------

    /// Tears the connection down: deregisters it, delivers the close event
    /// and unbinds the protocol. Runs once; later calls do nothing.
    pub fn close_and_free(&mut self, reason: &str) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let prior = self.state;
        debug!(conn = ?self.id, reason, state = ?prior, "closing connection");

        self.detach();

        if let Some(role) = self.role_info {
            let was_up = match self.side {
                Side::Server => true,
                Side::Client => prior == RoleState::Established,
            };
            if self.protocol_bound && was_up {
                // the close callback cannot veto teardown
                let _ = deliver(self, role.callbacks.close.for_side(self.side), &[]);
            }
        }
        self.unbind_protocol();

        self.state = RoleState::Dead;
        self.buflist_out.clear();
        self.buflist_in.clear();
        self.vhost.stats().bump_close();
    }
}
