use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Token};
use tracing::{debug, info, warn};

use crate::config::RawConfig;
use crate::conn::{Connection, ConnectionId, RawSocket, CONNECTION_TOKEN_BASE};
use crate::error::{RawError, Result};
use crate::event::UnifiedEvent;
use crate::handler::EventHandler;
use crate::net::service::{ConnectionMap, ConnectionService};
use crate::poll::PollHandle;
use crate::protocol::Vhost;
use crate::role::{AdoptType, RawSkt, Role};
use crate::EventLoop;

/// Raw socket server: accepts TCP connections and adopts them, plus any
/// TCP or UDP socket handed to it, into a role.
pub struct RawServer {
    listener: Arc<Mutex<TcpListener>>,
    connections: Arc<ConnectionMap>,
    vhost: Arc<Vhost>,
    role: Arc<dyn Role>,
    config: RawConfig,
    adopter: OnceLock<Adopter>,
}

impl RawServer {
    /// Binds `config.address` and serves connections with the raw role.
    pub fn new(config: RawConfig, vhost: Vhost) -> Result<Self> {
        let role = RawSkt::new(&config);
        Self::with_role(config, vhost, role)
    }

    pub fn with_role<R: Role + 'static>(config: RawConfig, vhost: Vhost, role: R) -> Result<Self> {
        let listener = TcpListener::bind(config.address)?;
        Ok(Self {
            listener: Arc::new(Mutex::new(listener)),
            connections: Arc::new(ConnectionMap::new()),
            vhost: Arc::new(vhost),
            role: Arc::new(role),
            config,
            adopter: OnceLock::new(),
        })
    }

    /// Start the server by registering with the event loop
    pub fn start(&self, event_loop: &EventLoop, listener_token: Token) -> Result<()> {
        if listener_token.0 >= CONNECTION_TOKEN_BASE {
            return Err(RawError::Configuration(format!(
                "listener token {} collides with connection tokens",
                listener_token.0
            )));
        }

        let adopter = Adopter {
            connections: Arc::clone(&self.connections),
            vhost: Arc::clone(&self.vhost),
            role: Arc::clone(&self.role),
            poll: Arc::clone(event_loop.poll_handle()),
            max_connections: self.config.max_connections,
            max_buffered_input: self.config.max_buffered_input,
        };
        if self.adopter.set(adopter.clone()).is_err() {
            return Err(RawError::Configuration("server already started".into()));
        }

        let listener_handler = RawListenerHandler {
            listener: Arc::clone(&self.listener),
            adopter,
            no_delay: self.config.no_delay,
        };
        event_loop.register(
            &mut *self.listener.lock()?,
            listener_token,
            Interest::READABLE,
            listener_handler,
        )?;

        info!(address = %self.local_addr()?, vhost = self.vhost.name(), "raw server listening");
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.lock()?.local_addr()?)
    }

    pub fn vhost(&self) -> &Arc<Vhost> {
        &self.vhost
    }

    /// Adopts an already connected stream. `preamble` holds bytes the
    /// caller read from it before handing it over.
    pub fn adopt_stream(&self, stream: TcpStream, preamble: &[u8]) -> Result<ConnectionId> {
        self.adopter()?
            .adopt(Box::new(stream), AdoptType::SOCKET, preamble)
    }

    /// Adopts a bound UDP socket; every datagram is delivered as one read
    /// and replies go to the last sender.
    pub fn adopt_udp(&self, socket: UdpSocket) -> Result<ConnectionId> {
        self.adopter()?
            .adopt(Box::new(socket), AdoptType::SOCKET | AdoptType::UDP, &[])
    }

    /// Get active connection count
    pub fn connection_count(&self) -> usize {
        self.connections.iter().count()
    }

    /// Send data to a specific connection
    pub fn send_to(&self, conn_id: ConnectionId, data: &[u8]) -> Result<usize> {
        self.service(conn_id)?.write(data)
    }

    /// Ask for a writable callback on a specific connection
    pub fn request_writable(&self, conn_id: ConnectionId) -> Result<()> {
        self.service(conn_id)?.request_writable()
    }

    /// Close a specific connection
    pub fn close_connection(&self, conn_id: ConnectionId) -> Result<()> {
        self.service(conn_id)?.close();
        Ok(())
    }

    /// Broadcast data to all connections
    pub fn broadcast(&self, data: &[u8]) -> Result<()> {
        let services: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.val()))
            .collect();
        for service in services {
            if let Err(e) = service.write(data) {
                debug!(conn = ?service.id(), error = %e, "broadcast write failed");
            }
        }
        Ok(())
    }

    fn service(&self, conn_id: ConnectionId) -> Result<Arc<ConnectionService>> {
        self.connections
            .get(&conn_id.as_u64())
            .map(|entry| Arc::clone(entry.val()))
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected).into())
    }

    fn adopter(&self) -> Result<&Adopter> {
        self.adopter
            .get()
            .ok_or_else(|| RawError::Configuration("server not started".into()))
    }
}

/// Everything needed to turn a socket into a served connection.
#[derive(Clone)]
struct Adopter {
    connections: Arc<ConnectionMap>,
    vhost: Arc<Vhost>,
    role: Arc<dyn Role>,
    poll: Arc<PollHandle>,
    max_connections: Option<usize>,
    max_buffered_input: Option<usize>,
}

impl Adopter {
    /// Accepted, stream and UDP adoptions all pass through here, so the
    /// connection cap holds for every one of them.
    fn adopt(
        &self,
        socket: Box<dyn RawSocket>,
        adopt: AdoptType,
        preamble: &[u8],
    ) -> Result<ConnectionId> {
        if let Some(max) = self.max_connections {
            if self.connections.iter().count() >= max {
                return Err(RawError::rejected(format!("max connections {} reached", max)));
            }
        }
        if let Some(cap) = self.max_buffered_input {
            if preamble.len() > cap {
                return Err(RawError::Allocation(format!(
                    "{} byte preamble exceeds the {} byte cap",
                    preamble.len(),
                    cap
                )));
            }
        }

        let mut conn = Connection::new(ConnectionId::next(), socket, Arc::clone(&self.vhost));
        conn.set_input_limit(self.max_buffered_input);
        let service = ConnectionService::adopt(
            conn,
            Arc::clone(&self.role),
            adopt,
            None,
            preamble,
            &self.poll,
            &self.connections,
        )?;
        Ok(service.id())
    }
}

/// Handler for accepting new connections
struct RawListenerHandler {
    listener: Arc<Mutex<TcpListener>>,
    adopter: Adopter,
    no_delay: bool,
}

impl EventHandler for RawListenerHandler {
    fn handle_event(&self, event: &UnifiedEvent) {
        if !event.is_readable() {
            return;
        }

        loop {
            let accepted = match self.listener.lock() {
                Ok(listener) => listener.accept(),
                Err(e) => {
                    warn!(error = %e, "listener lock poisoned");
                    return;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(self.no_delay) {
                        warn!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
                    }

                    match self.adopter.adopt(Box::new(stream), AdoptType::SOCKET, &[]) {
                        Ok(conn_id) => info!(%peer_addr, ?conn_id, "new connection"),
                        Err(e) => warn!(%peer_addr, error = %e, "adoption failed"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }
}
