use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use lockfree::map::Map as LockfreeMap;
use mio::Token;
use tracing::{debug, trace, warn};

use crate::conn::{Connection, ConnectionId};
use crate::error::{RawError, Result};
use crate::event::{ReadinessEvent, Subscription, UnifiedEvent};
use crate::handler::EventHandler;
use crate::poll::PollHandle;
use crate::protocol::deliver;
use crate::role::{AdoptType, HandleOutcome, Role};

pub(crate) type ConnectionMap = LockfreeMap<u64, Arc<ConnectionService>>;

/// Event handler that owns one connection and drives its role.
///
/// The connection sits behind a mutex so the application can write to it
/// from outside the event loop; the keyed thread pool already guarantees
/// readiness dispatches for one token never overlap.
pub struct ConnectionService {
    id: ConnectionId,
    token: Token,
    conn: Mutex<Option<Connection>>,
    role: Arc<dyn Role>,
    connections: Weak<ConnectionMap>,
}

impl ConnectionService {
    pub(crate) fn new(
        conn: Connection,
        role: Arc<dyn Role>,
        connections: Weak<ConnectionMap>,
    ) -> Arc<Self> {
        let id = conn.id();
        Arc::new(Self {
            id,
            token: id.token(),
            conn: Mutex::new(Some(conn)),
            role,
            connections,
        })
    }

    /// Runs server-side adoption for `conn` and starts serving it.
    ///
    /// `preamble` is input the caller already read from the socket; it is
    /// delivered before anything new is read.
    pub(crate) fn adopt(
        mut conn: Connection,
        role: Arc<dyn Role>,
        adopt: AdoptType,
        vh_prot_name: Option<&str>,
        preamble: &[u8],
        poll: &Arc<PollHandle>,
        connections: &Arc<ConnectionMap>,
    ) -> Result<Arc<Self>> {
        if !role.adoption_bind(&mut conn, adopt, vh_prot_name) {
            return Err(RawError::rejected(format!(
                "role {} declined {:?}",
                role.name(),
                adopt
            )));
        }
        if !preamble.is_empty() {
            conn.preload_input(preamble)?;
        }

        let service = Self::new(conn, role, Arc::downgrade(connections));
        connections.insert(service.id.as_u64(), Arc::clone(&service));
        if let Err(e) = service.start(poll, Subscription::READ) {
            service.forget();
            return Err(e);
        }

        let mut guard = service.lock();
        let Some(conn) = guard.as_mut() else {
            return Err(RawError::PeerClosed);
        };
        let adopted = service.role.info().callbacks.adoption.for_side(conn.side());
        if let Err(e) = deliver(conn, adopted, &[]) {
            debug!(conn = ?service.id, error = %e, "adopt callback refused connection");
            conn.close_and_free("adopt callback failed");
            *guard = None;
            drop(guard);
            service.forget();
            return Err(e);
        }

        if conn.has_pending_input() {
            let readiness = ReadinessEvent::new(service.token, true, false, conn.subscription());
            if !service.drive(conn, readiness) {
                *guard = None;
                drop(guard);
                service.forget();
                return Ok(service);
            }
        }
        drop(guard);
        Ok(service)
    }

    /// Installs the handler and registers the socket with `subscription`.
    pub(crate) fn start(self: &Arc<Self>, poll: &Arc<PollHandle>, subscription: Subscription) -> Result<()> {
        let interest = subscription
            .to_interest()
            .ok_or_else(|| RawError::Configuration("empty initial subscription".into()))?;
        let handler: Arc<dyn EventHandler + Send + Sync> = self.clone();
        poll.set_handler(self.token, handler, interest)?;

        let mut guard = self.lock();
        match guard.as_mut() {
            Some(conn) => conn.attach(Arc::clone(poll), self.token, subscription),
            None => Err(RawError::PeerClosed),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Writes to the connection; see [`Connection::write`].
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.with_connection(|conn| conn.write(data))
            .unwrap_or_else(|| Err(RawError::PeerClosed))
    }

    pub fn request_writable(&self) -> Result<()> {
        self.with_connection(|conn| conn.request_writable())
            .unwrap_or_else(|| Err(RawError::PeerClosed))
    }

    /// Tears the connection down from outside the event loop.
    pub fn close(&self) {
        let mut guard = self.lock();
        if let Some(conn) = guard.as_mut() {
            conn.close_and_free("closed locally");
        }
        if guard.take().is_some() {
            drop(guard);
            self.forget();
        }
    }

    /// Runs `f` against the live connection, if there still is one.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.lock().as_mut().map(f)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self) {
        if let Some(connections) = self.connections.upgrade() {
            connections.remove(&self.id.as_u64());
        }
    }

    /// Feeds `readiness` to the role, then keeps running receive passes
    /// while buffered input remains, since the poller will not report it.
    /// Returns `false` once the connection has been torn down.
    fn drive(&self, conn: &mut Connection, mut readiness: ReadinessEvent) -> bool {
        loop {
            let outcome = self.role.handle_readiness(conn, &readiness);
            trace!(conn = ?self.id, ?outcome, "dispatched");
            match outcome {
                HandleOutcome::Handled => {}
                HandleOutcome::PleaseClose => {
                    conn.close_and_free("role requested close");
                    return false;
                }
                HandleOutcome::AlreadyDestroyed => return false,
                HandleOutcome::FinalizeConnect => {
                    if let Err(e) = self.finalize_connect(conn) {
                        warn!(conn = ?self.id, error = %e, "connect finalize failed");
                        conn.close_and_free("connect finalize failed");
                        return false;
                    }
                }
            }

            let sub = conn.subscription();
            if !conn.has_pending_input() || conn.has_pending_output() || !sub.read {
                break;
            }
            readiness = ReadinessEvent::new(self.token, true, false, sub);
        }

        if let Err(e) = conn.rearm() {
            warn!(conn = ?self.id, error = %e, "rearm failed");
            conn.close_and_free("rearm failed");
            return false;
        }
        true
    }

    fn finalize_connect(&self, conn: &mut Connection) -> Result<()> {
        if !self.role.client_bind(conn, None)? {
            return Err(RawError::Connect("role refused to finalize".into()));
        }
        let connected = self.role.info().callbacks.adoption.for_side(conn.side());
        deliver(conn, connected, &[])
    }
}

impl EventHandler for ConnectionService {
    fn handle_event(&self, event: &UnifiedEvent) {
        let mut guard = self.lock();
        let Some(conn) = guard.as_mut() else {
            trace!(conn = ?self.id, "event for closed connection");
            return;
        };

        let readiness = ReadinessEvent::from_polled(event, conn.subscription());
        if !self.drive(conn, readiness) {
            *guard = None;
            drop(guard);
            self.forget();
        }
    }
}
