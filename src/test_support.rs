//! Scripted sockets and recording handlers for unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::conn::{Connection, ConnectionId, RawSocket, RoleState, Side};
use crate::error::{RawError, Result};
use crate::event::Subscription;
use crate::protocol::{ConnCtx, Protocol, RawEvent, RawHandler, Vhost};
use crate::role::RAW_SKT;

pub fn peer() -> SocketAddr {
    "127.0.0.1:9".parse().unwrap()
}

/// What the scripted socket will do next.
pub struct Script {
    /// Results handed out by `recv`, front first; empty means would-block
    pub reads: VecDeque<io::Result<Vec<u8>>>,
    pub sent: Vec<u8>,
    /// Individual send calls that went through, with their destination
    pub datagrams: Vec<(Vec<u8>, Option<SocketAddr>)>,
    /// Per-call cap on accepted bytes
    pub send_limit: Option<usize>,
    /// Total bytes accepted before sends start blocking
    pub send_budget: Option<usize>,
    pub would_block_sends: usize,
    pub send_error: Option<io::ErrorKind>,
    pub send_calls: usize,
    pub recv_calls: usize,
    pub datagram: bool,
    pub connected: bool,
    pub connect_error: Option<io::ErrorKind>,
    /// Error returned by every `reregister` while set
    pub reregister_error: Option<io::ErrorKind>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            reads: VecDeque::new(),
            sent: Vec::new(),
            datagrams: Vec::new(),
            send_limit: None,
            send_budget: None,
            would_block_sends: 0,
            send_error: None,
            send_calls: 0,
            recv_calls: 0,
            datagram: false,
            connected: true,
            connect_error: None,
            reregister_error: None,
        }
    }
}

pub type SharedScript = Arc<Mutex<Script>>;

pub struct ScriptedSocket {
    script: SharedScript,
}

impl ScriptedSocket {
    pub fn new() -> (Self, SharedScript) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                script: Arc::clone(&script),
            },
            script,
        )
    }
}

impl mio::event::Source for ScriptedSocket {
    fn register(
        &mut self,
        _registry: &mio::Registry,
        _token: mio::Token,
        _interests: mio::Interest,
    ) -> io::Result<()> {
        Ok(())
    }

    fn reregister(
        &mut self,
        _registry: &mio::Registry,
        _token: mio::Token,
        _interests: mio::Interest,
    ) -> io::Result<()> {
        match self.script.lock().unwrap().reregister_error {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    fn deregister(&mut self, _registry: &mio::Registry) -> io::Result<()> {
        Ok(())
    }
}

impl RawSocket for ScriptedSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let mut script = self.script.lock().unwrap();
        script.recv_calls += 1;
        let from = script.datagram.then(peer);
        match script.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Err(e)) => Err(e),
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() && !script.datagram {
                    script.reads.push_front(Ok(data[n..].to_vec()));
                }
                Ok((n, from))
            }
        }
    }

    fn send(&mut self, buf: &[u8], to: Option<SocketAddr>) -> io::Result<usize> {
        let mut script = self.script.lock().unwrap();
        script.send_calls += 1;
        if let Some(kind) = script.send_error {
            return Err(kind.into());
        }
        if script.would_block_sends > 0 {
            script.would_block_sends -= 1;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut n = script.send_limit.map_or(buf.len(), |l| l.min(buf.len()));
        if let Some(budget) = script.send_budget {
            if budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            n = n.min(budget);
            script.send_budget = Some(budget - n);
        }
        script.sent.extend_from_slice(&buf[..n]);
        script.datagrams.push((buf[..n].to_vec(), to));
        Ok(n)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(self
            .script
            .lock()
            .unwrap()
            .connect_error
            .take()
            .map(io::Error::from))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        if self.script.lock().unwrap().connected {
            Ok(peer())
        } else {
            Err(io::ErrorKind::NotConnected.into())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Connected,
    Adopt,
    Rx(Vec<u8>),
    Writable,
    Close,
    BindProtocol,
    DropProtocol,
}

#[derive(Default)]
pub struct LogState {
    pub events: Vec<RecordedEvent>,
    pub fail_on: Vec<RawEvent>,
    pub echo: bool,
    pub pause_rx: bool,
    pub reply_on_writable: Option<Vec<u8>>,
}

/// Shared view of everything a [`RecordingHandler`] saw.
#[derive(Clone, Default)]
pub struct EventLog(pub Arc<Mutex<LogState>>);

impl EventLog {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.0.lock().unwrap().events.clone()
    }

    pub fn count(&self, event: RecordedEvent) -> usize {
        self.events().iter().filter(|e| **e == event).count()
    }

    pub fn rx_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RecordedEvent::Rx(_)))
            .count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().events.clear();
    }

    pub fn fail_on(&self, event: RawEvent) {
        self.0.lock().unwrap().fail_on.push(event);
    }

    pub fn echo(&self) {
        self.0.lock().unwrap().echo = true;
    }

    pub fn pause_rx(&self) {
        self.0.lock().unwrap().pause_rx = true;
    }

    pub fn reply_on_writable(&self, data: &[u8]) {
        self.0.lock().unwrap().reply_on_writable = Some(data.to_vec());
    }
}

pub struct RecordingHandler {
    log: EventLog,
}

impl RecordingHandler {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    fn record(&self, raw: RawEvent, recorded: RecordedEvent) -> Result<()> {
        let mut state = self.log.0.lock().unwrap();
        state.events.push(recorded);
        if state.fail_on.contains(&raw) {
            return Err(RawError::rejected(format!("{:?} refused", raw)));
        }
        Ok(())
    }
}

impl RawHandler for RecordingHandler {
    fn on_adopt(&self, _ctx: &mut ConnCtx<'_>) -> Result<()> {
        self.record(RawEvent::Adopt, RecordedEvent::Adopt)
    }

    fn on_connected(&self, _ctx: &mut ConnCtx<'_>) -> Result<()> {
        self.record(RawEvent::Connected, RecordedEvent::Connected)
    }

    fn on_rx(&self, ctx: &mut ConnCtx<'_>, data: &[u8]) -> Result<()> {
        self.record(RawEvent::Rx, RecordedEvent::Rx(data.to_vec()))?;
        let (echo, pause) = {
            let state = self.log.0.lock().unwrap();
            (state.echo, state.pause_rx)
        };
        if echo {
            ctx.write(data)?;
        }
        if pause {
            ctx.rx_flow_control(false);
        }
        Ok(())
    }

    fn on_writable(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        self.record(RawEvent::Writable, RecordedEvent::Writable)?;
        let reply = self.log.0.lock().unwrap().reply_on_writable.clone();
        if let Some(reply) = reply {
            ctx.write(&reply)?;
        }
        Ok(())
    }

    fn on_close(&self, _ctx: &mut ConnCtx<'_>) -> Result<()> {
        self.record(RawEvent::Close, RecordedEvent::Close)
    }

    fn on_bind_protocol(&self, _ctx: &mut ConnCtx<'_>) -> Result<()> {
        self.record(RawEvent::BindProtocol, RecordedEvent::BindProtocol)
    }

    fn on_drop_protocol(&self, _ctx: &mut ConnCtx<'_>) -> Result<()> {
        self.record(RawEvent::DropProtocol, RecordedEvent::DropProtocol)
    }
}

/// Vhost whose protocols all record into `log`: `raw` (the fallback) and
/// `named`, which carries `session_data` bytes of user space.
pub fn recording_vhost(log: &EventLog, session_data: usize) -> Arc<Vhost> {
    let raw = Protocol::new("raw", RecordingHandler::new(log.clone()))
        .with_session_data(session_data);
    let named = Protocol::new("named", RecordingHandler::new(log.clone()))
        .with_session_data(session_data);
    Arc::new(Vhost::new("test", vec![raw, named], 0).unwrap())
}

/// Connection with no role attached yet.
pub fn raw_conn() -> (Connection, SharedScript, EventLog) {
    conn_with_session_data(0)
}

pub fn conn_with_session_data(size: usize) -> (Connection, SharedScript, EventLog) {
    let log = EventLog::default();
    let (socket, script) = ScriptedSocket::new();
    let conn = Connection::new(
        ConnectionId::next(),
        Box::new(socket),
        recording_vhost(&log, size),
    );
    (conn, script, log)
}

/// Established server connection bound to the fallback protocol and
/// subscribed to read. The log starts empty.
pub fn established_conn() -> (Connection, SharedScript, EventLog) {
    let (mut conn, script, log) = raw_conn();
    conn.role_transition(Side::Server, RoleState::Established, &RAW_SKT);
    conn.bind_fallback_protocol().unwrap();
    conn.change_subscription(Subscription::NONE, Subscription::READ)
        .unwrap();
    log.clear();
    (conn, script, log)
}
