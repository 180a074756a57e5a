use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpStream, UdpSocket};

/// Non-blocking byte transport under a connection.
///
/// `recv` reports the sender for datagram sockets so replies can be routed
/// back; stream sockets return `None`.
pub trait RawSocket: mio::event::Source + Send {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)>;

    /// Sends to `to` when given (unconnected datagram sockets), otherwise to
    /// the connected peer.
    fn send(&mut self, buf: &[u8], to: Option<SocketAddr>) -> io::Result<usize>;

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl RawSocket for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        self.read(buf).map(|n| (n, None))
    }

    fn send(&mut self, buf: &[u8], _to: Option<SocketAddr>) -> io::Result<usize> {
        self.write(buf)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl RawSocket for UdpSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        self.recv_from(buf).map(|(n, from)| (n, Some(from)))
    }

    fn send(&mut self, buf: &[u8], to: Option<SocketAddr>) -> io::Result<usize> {
        match to {
            Some(addr) => self.send_to(buf, addr),
            None => UdpSocket::send(self, buf),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        UdpSocket::take_error(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::peer_addr(self)
    }
}
