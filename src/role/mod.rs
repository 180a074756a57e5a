//! Connection roles.
//!
//! A role is the behaviour profile attached to a connection: how it adopts
//! or binds, how it reacts to readiness, and which [`RawEvent`]s it emits
//! for each lifecycle step. Roles are built once, shared read-only by every
//! connection they serve, and chosen when the connection is created.

pub mod handshake;
pub mod loss;
pub mod raw_skt;

use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};

use crate::conn::{Connection, Side};
use crate::error::Result;
use crate::event::ReadinessEvent;
use crate::protocol::RawEvent;

pub use handshake::{ConnectCompletion, ConnectStep, NoTls, ServerHandshake, SocketConnect};
pub use loss::LossSimulator;
pub use raw_skt::{RawSkt, RAW_PROXY, RAW_SKT};

/// Result of one readiness dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Nothing more to do until the next readiness event
    Handled,
    /// The caller must tear the connection down
    PleaseClose,
    /// Teardown already ran; the handle must not be touched again
    AlreadyDestroyed,
    /// A client connect completed; the caller finishes binding it
    FinalizeConnect,
}

/// One event id per side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackPair {
    pub client: RawEvent,
    pub server: RawEvent,
}

impl CallbackPair {
    pub const fn same(event: RawEvent) -> Self {
        Self {
            client: event,
            server: event,
        }
    }

    pub fn for_side(&self, side: Side) -> RawEvent {
        match side {
            Side::Client => self.client,
            Side::Server => self.server,
        }
    }
}

/// Events a role emits at each lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackTable {
    pub adoption: CallbackPair,
    pub rx: CallbackPair,
    pub writable: CallbackPair,
    pub close: CallbackPair,
    pub protocol_bind: CallbackPair,
    pub protocol_unbind: CallbackPair,
}

/// Static identity of a role.
#[derive(Debug)]
pub struct RoleInfo {
    pub name: &'static str,
    pub callbacks: CallbackTable,
}

/// Flags describing what the framework is asking a role to adopt.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AdoptType(u32);

impl AdoptType {
    pub const HTTP: AdoptType = AdoptType(1 << 0);
    pub const SOCKET: AdoptType = AdoptType(1 << 1);
    pub const ALLOW_SSL: AdoptType = AdoptType(1 << 2);
    pub const UDP: AdoptType = AdoptType(1 << 4);
    /// Set by the framework for the closing phase of an adoption
    pub const FINISH: AdoptType = AdoptType(1 << 24);

    pub const fn empty() -> Self {
        AdoptType(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        AdoptType(bits & Self::all().0)
    }

    pub const fn all() -> Self {
        AdoptType(
            Self::HTTP.0 | Self::SOCKET.0 | Self::ALLOW_SSL.0 | Self::UDP.0 | Self::FINISH.0,
        )
    }

    pub const fn contains(self, other: AdoptType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AdoptType {
    type Output = AdoptType;

    fn bitor(self, rhs: AdoptType) -> AdoptType {
        AdoptType(self.0 | rhs.0)
    }
}

impl BitOrAssign for AdoptType {
    fn bitor_assign(&mut self, rhs: AdoptType) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AdoptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (AdoptType::HTTP, "HTTP"),
            (AdoptType::SOCKET, "SOCKET"),
            (AdoptType::ALLOW_SSL, "ALLOW_SSL"),
            (AdoptType::UDP, "UDP"),
            (AdoptType::FINISH, "FINISH"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AdoptType({})", set.join(" | "))
    }
}

/// Parameters of an outgoing connection.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub address: SocketAddr,
    /// Name of the local protocol the caller wants; `raw-proxy` opts out of
    /// the raw role
    pub local_protocol_name: Option<String>,
    /// Connect method; when set, per-session storage is allocated at
    /// finalize time
    pub method: Option<String>,
    /// Vhost protocol to bind; defaults to the raw fallback
    pub protocol: Option<String>,
}

impl ConnectInfo {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            local_protocol_name: None,
            method: None,
            protocol: None,
        }
    }

    pub fn local_protocol_name(mut self, name: impl Into<String>) -> Self {
        self.local_protocol_name = Some(name.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// Capabilities a role offers the framework. Roles that do not support a
/// capability keep the default, which declines.
pub trait Role: Send + Sync {
    fn info(&self) -> &'static RoleInfo;

    fn name(&self) -> &'static str {
        self.info().name
    }

    /// Services one readiness event.
    fn handle_readiness(&self, conn: &mut Connection, event: &ReadinessEvent) -> HandleOutcome {
        let _ = (conn, event);
        HandleOutcome::Handled
    }

    /// Claims a server-side connection. Never fails; `false` means "not
    /// mine" and leaves the connection untouched.
    fn adoption_bind(
        &self,
        conn: &mut Connection,
        adopt: AdoptType,
        vh_prot_name: Option<&str>,
    ) -> bool {
        let _ = (conn, adopt, vh_prot_name);
        false
    }

    /// With `Some(info)`: claims an outgoing connection before connect.
    /// With `None`: finalizes a connection whose connect completed.
    fn client_bind(&self, conn: &mut Connection, info: Option<&ConnectInfo>) -> Result<bool> {
        let _ = (conn, info);
        Ok(false)
    }
}
