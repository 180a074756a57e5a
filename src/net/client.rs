use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::RawConfig;
use crate::conn::{ConnectStash, Connection, ConnectionId, RoleState};
use crate::error::{RawError, Result};
use crate::event::Subscription;
use crate::net::service::ConnectionService;
use crate::protocol::Vhost;
use crate::role::{ConnectInfo, RawSkt, Role};
use crate::EventLoop;

/// Outgoing raw connection.
///
/// The connect is non-blocking: [`RawClient::connect`] returns at once and
/// the bound protocol hears `on_connected` when the socket is up, or
/// nothing but `on_drop_protocol` if the connect fails. Dropping the client
/// closes the connection.
pub struct RawClient {
    service: Arc<ConnectionService>,
    vhost: Arc<Vhost>,
}

impl RawClient {
    pub fn connect(
        event_loop: &EventLoop,
        config: &RawConfig,
        vhost: Vhost,
        info: ConnectInfo,
    ) -> Result<Self> {
        let role = Arc::new(RawSkt::new(config));
        Self::connect_with_role(event_loop, config, Arc::new(vhost), role, info)
    }

    /// Connects with `role` in place of the raw role. `config` supplies the
    /// stream options and the buffered-input cap.
    pub fn connect_with_role(
        event_loop: &EventLoop,
        config: &RawConfig,
        vhost: Arc<Vhost>,
        role: Arc<dyn Role>,
        info: ConnectInfo,
    ) -> Result<Self> {
        let stream = open_stream(info.address, config.no_delay)?;
        let mut conn = Connection::new(ConnectionId::next(), Box::new(stream), Arc::clone(&vhost));
        conn.set_input_limit(config.max_buffered_input);
        conn.set_stash(ConnectStash::from(&info));

        if !role.client_bind(&mut conn, Some(&info))? {
            return Err(RawError::Connect(format!(
                "role {} declined local protocol {:?}",
                role.name(),
                info.local_protocol_name
            )));
        }

        match info.protocol.as_deref() {
            Some(name) => {
                let protocol = vhost.protocol(name).cloned().ok_or_else(|| {
                    RawError::Configuration(format!("no protocol named {}", name))
                })?;
                conn.bind_protocol(protocol)?;
            }
            None => conn.bind_fallback_protocol()?,
        }
        conn.set_state(RoleState::WaitingConnect);

        let service = ConnectionService::new(conn, role, Weak::new());
        service.start(event_loop.poll_handle(), Subscription::BOTH)?;
        info!(conn = ?service.id(), address = %info.address, "connecting");

        Ok(Self { service, vhost })
    }

    pub fn id(&self) -> ConnectionId {
        self.service.id()
    }

    pub fn vhost(&self) -> &Arc<Vhost> {
        &self.vhost
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.service.write(data)
    }

    pub fn request_writable(&self) -> Result<()> {
        self.service.request_writable()
    }

    pub fn state(&self) -> Option<RoleState> {
        self.service.with_connection(|conn| conn.state())
    }

    pub fn is_closed(&self) -> bool {
        self.service.is_closed()
    }

    pub fn close(&self) {
        self.service.close();
    }
}

/// Starts a non-blocking connect to `address`.
fn open_stream(address: SocketAddr, no_delay: bool) -> Result<TcpStream> {
    let stream = TcpStream::connect(address)?;
    if let Err(e) = stream.set_nodelay(no_delay) {
        warn!(%address, error = %e, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

impl Drop for RawClient {
    fn drop(&mut self) {
        if !self.service.is_closed() {
            debug!(conn = ?self.service.id(), "client dropped, closing");
            self.service.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_stream_applies_no_delay() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let stream = open_stream(address, true).unwrap();
        let _accepted = listener.accept().unwrap();
        assert!(stream.nodelay().unwrap());

        let stream = open_stream(address, false).unwrap();
        let _accepted = listener.accept().unwrap();
        assert!(!stream.nodelay().unwrap());
    }
}
