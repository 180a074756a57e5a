use std::io;

use tracing::debug;

use crate::conn::{Connection, RoleState};
use crate::error::{RawError, Result};

/// Server-side handshake collaborator, serviced while an adopted
/// connection is not yet established.
///
/// Implementations advance the handshake as far as the socket allows and
/// move the connection to `Established` when done. An error closes the
/// connection.
pub trait ServerHandshake: Send + Sync {
    fn service(&self, conn: &mut Connection) -> Result<()>;
}

/// No TLS layer is linked in: any connection left in a handshake state is
/// rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTls;

impl ServerHandshake for NoTls {
    fn service(&self, conn: &mut Connection) -> Result<()> {
        Err(RawError::Handshake(format!(
            "no TLS layer for connection in {:?}",
            conn.state()
        )))
    }
}

/// Progress of an outgoing connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    /// Not there yet; wait for the next writable event
    Pending,
    /// Connected; carry on with the writable pass in the same dispatch
    Proceed,
    /// Connected; hand the connection back to be finalized
    Finalize,
}

/// Client connect-completion collaborator, called on writable readiness
/// while the connection is waiting to connect.
pub trait ConnectCompletion: Send + Sync {
    fn complete(&self, conn: &mut Connection) -> Result<ConnectStep>;
}

/// Completes a non-blocking connect by checking the socket error and
/// whether the peer address is known yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnect;

impl ConnectCompletion for SocketConnect {
    fn complete(&self, conn: &mut Connection) -> Result<ConnectStep> {
        match conn.socket().take_error() {
            Ok(Some(e)) | Err(e) => return Err(RawError::Connect(e.to_string())),
            Ok(None) => {}
        }

        match conn.socket().peer_addr() {
            Ok(peer) => {
                debug!(conn = ?conn.id(), %peer, "connect completed");
                conn.set_state(RoleState::Established);
                Ok(ConnectStep::Finalize)
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(ConnectStep::Pending)
            }
            Err(e) => Err(RawError::Connect(e.to_string())),
        }
    }
}
