//! The raw socket role: unframed bytes in both directions.
//!
//! Each readiness event runs through four guarded stages, each of which
//! may end the dispatch early:
//!
//! 1. drain: queued output is flushed before anything else, and nothing else
//!    runs in a dispatch that found output queued
//! 2. handshake: server connections that are not established yet only
//!    service their handshake
//! 3. receive: one read, delivered as [`RawEvent::Rx`]
//! 4. write: one-shot [`RawEvent::Writable`], or connect completion for
//!    clients still waiting to connect
//!
//! Every fatal path goes through [`Connection::close_and_free`] and reports
//! [`HandleOutcome::AlreadyDestroyed`].

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::RawConfig;
use crate::conn::read::{aware_read, finished_consuming};
use crate::conn::{ConsumeOutcome, Connection, ReadOutcome, RoleState, Side, UdpState};
use crate::error::Result;
use crate::event::{ReadinessEvent, Subscription};
use crate::object_pool::ObjectPool;
use crate::protocol::{deliver, RawEvent};
use crate::role::handshake::{ConnectCompletion, ConnectStep, NoTls, ServerHandshake, SocketConnect};
use crate::role::loss::LossSimulator;
use crate::role::{AdoptType, CallbackPair, CallbackTable, ConnectInfo, HandleOutcome, Role, RoleInfo};

/// Local protocol name with which a client opts out of the raw role.
pub const RAW_PROXY: &str = "raw-proxy";

pub static RAW_SKT: RoleInfo = RoleInfo {
    name: "raw-skt",
    callbacks: CallbackTable {
        adoption: CallbackPair {
            client: RawEvent::Connected,
            server: RawEvent::Adopt,
        },
        rx: CallbackPair::same(RawEvent::Rx),
        writable: CallbackPair::same(RawEvent::Writable),
        close: CallbackPair::same(RawEvent::Close),
        protocol_bind: CallbackPair::same(RawEvent::BindProtocol),
        protocol_unbind: CallbackPair::same(RawEvent::DropProtocol),
    },
};

pub struct RawSkt {
    handshake: Arc<dyn ServerHandshake>,
    connect: Arc<dyn ConnectCompletion>,
    loss: LossSimulator,
    pool: ObjectPool<Vec<u8>>,
    buffer_size: usize,
}

impl RawSkt {
    pub fn new(config: &RawConfig) -> Self {
        let size = config.buffer_size;
        Self {
            handshake: Arc::new(NoTls),
            connect: Arc::new(SocketConnect),
            loss: LossSimulator::from_config(config),
            pool: ObjectPool::new(config.workers.max(1), move || vec![0u8; size]),
            buffer_size: size,
        }
    }

    pub fn with_handshake<H: ServerHandshake + 'static>(mut self, handshake: H) -> Self {
        self.handshake = Arc::new(handshake);
        self
    }

    pub fn with_connect_completion<C: ConnectCompletion + 'static>(mut self, connect: C) -> Self {
        self.connect = Arc::new(connect);
        self
    }

    pub fn loss(&self) -> &LossSimulator {
        &self.loss
    }

    fn fail(conn: &mut Connection, reason: &str) -> HandleOutcome {
        conn.close_and_free(reason);
        HandleOutcome::AlreadyDestroyed
    }

    /// Stage 3. `None` means carry on with the write stage.
    fn receive(&self, conn: &mut Connection, event: &ReadinessEvent) -> Option<HandleOutcome> {
        let read = match aware_read(conn, &self.pool, self.buffer_size) {
            ReadOutcome::Data(read) => read,
            ReadOutcome::EndOfStream => {
                info!(conn = ?conn.id(), "read 0 len");
                conn.flags.seen_zero_length_read = true;
                if let Err(e) = conn.change_subscription(Subscription::READ, Subscription::NONE) {
                    debug!(conn = ?conn.id(), error = %e, "read interest change failed");
                }
                // the only reliable sign the peer has gone
                return Some(Self::fail(conn, "peer closed"));
            }
            ReadOutcome::Error(e) => {
                debug!(conn = ?conn.id(), error = %e, "read failed");
                return Some(Self::fail(conn, "read failed"));
            }
            ReadOutcome::Retry => return None,
        };

        if conn.is_datagram() && self.loss.should_drop() {
            warn!(conn = ?conn.id(), len = read.len(), "dropping udp rx");
            conn.vhost().stats().bump_rx_dropped();
        } else {
            conn.vhost().stats().add_rx_bytes(read.len());
            let rx = self.info().callbacks.rx.for_side(conn.side());
            if let Err(e) = deliver(conn, rx, read.as_slice()) {
                info!(conn = ?conn.id(), error = %e, "rx callback failed");
                return Some(Self::fail(conn, "rx callback failed"));
            }
            if event.write_ready() {
                conn.flags.favoured_read = true;
            }
        }

        if finished_consuming(conn, read.len(), &read) == ConsumeOutcome::Close {
            return Some(HandleOutcome::PleaseClose);
        }
        None
    }

    /// Stage 4.
    fn write(&self, conn: &mut Connection, event: &ReadinessEvent) -> HandleOutcome {
        if !event.write_signalled() {
            return HandleOutcome::Handled;
        }

        if conn.state() == RoleState::WaitingConnect {
            match self.connect.complete(conn) {
                Ok(ConnectStep::Pending) => return HandleOutcome::Handled,
                Ok(ConnectStep::Finalize) => return HandleOutcome::FinalizeConnect,
                Ok(ConnectStep::Proceed) => {}
                Err(e) => {
                    info!(conn = ?conn.id(), error = %e, "connect failed");
                    return Self::fail(conn, "connect failed");
                }
            }
        }

        // one shot
        if let Err(e) = conn.change_subscription(Subscription::WRITE, Subscription::NONE) {
            warn!(conn = ?conn.id(), error = %e, "write interest change failed");
            return Self::fail(conn, "write interest change failed");
        }
        conn.flags.could_have_pending_write = false;

        let stats = Arc::clone(conn.vhost().stats());
        stats.bump_writable_callback();
        if let Some(requested) = conn.take_writable_request() {
            stats.record_writable_delay(requested.elapsed());
        }

        let writable = self.info().callbacks.writable.for_side(conn.side());
        if let Err(e) = deliver(conn, writable, &[]) {
            info!(conn = ?conn.id(), error = %e, "writable callback failed");
            return Self::fail(conn, "writable callback failed");
        }
        HandleOutcome::Handled
    }
}

impl Default for RawSkt {
    fn default() -> Self {
        Self::new(&RawConfig::default())
    }
}

impl Role for RawSkt {
    fn info(&self) -> &'static RoleInfo {
        &RAW_SKT
    }

    fn handle_readiness(&self, conn: &mut Connection, event: &ReadinessEvent) -> HandleOutcome {
        if conn.is_destroyed() {
            return HandleOutcome::AlreadyDestroyed;
        }

        // truncated sends go first; input must not get ahead of the backlog
        if conn.has_pending_output() {
            if !event.write_signalled() {
                return HandleOutcome::Handled;
            }
            if let Err(e) = conn.flush_pending_output() {
                debug!(conn = ?conn.id(), error = %e, "flush failed");
                return Self::fail(conn, "flush failed");
            }
            return HandleOutcome::Handled;
        }

        if conn.side() == Side::Server && conn.state() != RoleState::Established {
            trace!(conn = ?conn.id(), state = ?conn.state(), "handshake pending");
            if conn.state() != RoleState::SslInit {
                if let Err(e) = self.handshake.service(conn) {
                    debug!(conn = ?conn.id(), error = %e, "handshake failed");
                    return HandleOutcome::PleaseClose;
                }
            }
            return HandleOutcome::Handled;
        }

        let state = conn.state();
        let owed_write = conn.flags.favoured_read && event.write_ready();
        if event.read_ready()
            && state != RoleState::SslAckPending
            && state != RoleState::WaitingConnect
            && !owed_write
        {
            if let Some(outcome) = self.receive(conn, event) {
                return outcome;
            }
        } else if owed_write {
            // balances the last favouring of read
            conn.flags.favoured_read = false;
        }

        self.write(conn, event)
    }

    fn adoption_bind(
        &self,
        conn: &mut Connection,
        adopt: AdoptType,
        vh_prot_name: Option<&str>,
    ) -> bool {
        if adopt.contains(AdoptType::HTTP)
            || !adopt.contains(AdoptType::SOCKET)
            || adopt.contains(AdoptType::FINISH)
        {
            return false;
        }

        if adopt.contains(AdoptType::UDP) {
            conn.set_udp(UdpState::default());
        }

        let state = if adopt.contains(AdoptType::ALLOW_SSL) {
            RoleState::SslInit
        } else {
            RoleState::Established
        };
        conn.role_transition(Side::Server, state, self.info());

        let named = vh_prot_name
            .and_then(|name| conn.vhost().protocol(name).cloned())
            .or_else(|| conn.protocol().cloned());
        let bound = match named {
            Some(protocol) => conn.bind_protocol(protocol),
            None => conn.bind_fallback_protocol(),
        };
        if let Err(e) = bound {
            warn!(conn = ?conn.id(), error = %e, "protocol bind failed during adoption");
        }
        true
    }

    fn client_bind(&self, conn: &mut Connection, info: Option<&ConnectInfo>) -> Result<bool> {
        let Some(info) = info else {
            // finalize
            let wants_space = conn.stash().is_some_and(|s| s.method.is_some());
            if conn.user_space().is_none() && wants_space {
                conn.ensure_user_space()?;
            }
            return Ok(true);
        };

        if info.local_protocol_name.as_deref() == Some(RAW_PROXY) {
            debug!(conn = ?conn.id(), "raw-proxy requested, declining");
            return Ok(false);
        }
        conn.role_transition(Side::Client, RoleState::Unconnected, self.info());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use mio::Token;
    use proptest::prelude::*;

    use super::*;
    use crate::conn::ConnectStash;
    use crate::poll::PollHandle;
    use crate::test_support::*;

    fn readiness(conn: &Connection, readable: bool, writable: bool) -> ReadinessEvent {
        ReadinessEvent::new(Token(1), readable, writable, conn.subscription())
    }

    fn lossy(percent: u8) -> RawSkt {
        let config = RawConfig::builder()
            .udp_loss_sim_rx_percent(percent)
            .rng_seed(7)
            .build()
            .unwrap();
        RawSkt::new(&config)
    }

    fn udp_conn(role: &RawSkt) -> (Connection, SharedScript, EventLog) {
        let (mut conn, script, log) = raw_conn();
        script.lock().unwrap().datagram = true;
        assert!(role.adoption_bind(&mut conn, AdoptType::SOCKET | AdoptType::UDP, None));
        conn.change_subscription(Subscription::NONE, Subscription::READ)
            .unwrap();
        log.clear();
        (conn, script, log)
    }

    struct CompletesHandshake;

    impl ServerHandshake for CompletesHandshake {
        fn service(&self, conn: &mut Connection) -> Result<()> {
            conn.set_state(RoleState::Established);
            Ok(())
        }
    }

    #[test]
    fn test_pending_output_flushed_before_input() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().would_block_sends = 1;
        conn.write(b"0123456789").unwrap();
        assert_eq!(conn.pending_output_len(), 10);
        script.lock().unwrap().reads.push_back(Ok(b"input".to_vec()));

        let sends_before = script.lock().unwrap().send_calls;
        let ev = readiness(&conn, false, true);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);

        let script = script.lock().unwrap();
        assert_eq!(script.send_calls, sends_before + 1);
        assert_eq!(script.sent, b"0123456789");
        assert_eq!(script.recv_calls, 0);
        assert_eq!(log.rx_count(), 0);
        assert_eq!(log.count(RecordedEvent::Writable), 0);
    }

    #[test]
    fn test_pending_output_blocks_reads_without_write_readiness() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().would_block_sends = 1;
        conn.write(b"queued").unwrap();
        script.lock().unwrap().reads.push_back(Ok(b"input".to_vec()));

        let ev = ReadinessEvent::new(Token(1), true, false, Subscription::BOTH);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(script.lock().unwrap().recv_calls, 0);
        assert_eq!(log.rx_count(), 0);
        assert!(conn.has_pending_output());
    }

    #[test]
    fn test_partial_drain_keeps_waiting() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().would_block_sends = 1;
        conn.write(b"abcdefgh").unwrap();
        script.lock().unwrap().send_budget = Some(3);

        let ev = readiness(&conn, true, true);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert!(conn.has_pending_output());
        assert!(conn.subscription().write);

        script.lock().unwrap().send_budget = None;
        let ev = readiness(&conn, true, true);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert!(!conn.has_pending_output());
        assert_eq!(script.lock().unwrap().sent, b"abcdefgh");
        assert_eq!(log.rx_count(), 0);
    }

    #[test]
    fn test_flush_failure_destroys() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().would_block_sends = 1;
        conn.write(b"queued").unwrap();
        script.lock().unwrap().send_error = Some(io::ErrorKind::ConnectionReset);

        let ev = readiness(&conn, false, true);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert!(conn.is_destroyed());
        assert_eq!(log.count(RecordedEvent::Close), 1);
    }

    #[test]
    fn test_writable_is_one_shot() {
        let role = RawSkt::default();
        let (mut conn, _script, log) = established_conn();
        conn.request_writable().unwrap();
        assert!(conn.subscription().write);

        let ev = readiness(&conn, false, true);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(log.count(RecordedEvent::Writable), 1);
        assert!(!conn.subscription().write);
        assert!(conn.subscription().read);

        let stats = conn.vhost().stats().snapshot();
        assert_eq!(stats.writable_callbacks, 1);
        assert_eq!(stats.writable_delay_samples, 1);
    }

    #[test]
    fn test_write_interest_failure_destroys() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        let token = conn.id().token();
        conn.attach(Arc::new(PollHandle::new().unwrap()), token, Subscription::READ)
            .unwrap();
        conn.request_writable().unwrap();
        script.lock().unwrap().reregister_error = Some(io::ErrorKind::Other);

        let ev = readiness(&conn, false, true);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert!(conn.is_destroyed());
        assert_eq!(log.count(RecordedEvent::Writable), 0);
        assert_eq!(log.count(RecordedEvent::Close), 1);
    }

    #[test]
    fn test_writable_clears_back_to_back_flag() {
        let role = RawSkt::default();
        let (mut conn, script, _log) = established_conn();
        script.lock().unwrap().send_limit = Some(2);
        conn.write(b"abcd").unwrap();
        assert!(conn.flags.could_have_pending_write);

        script.lock().unwrap().send_limit = None;
        let ev = readiness(&conn, false, true);
        role.handle_readiness(&mut conn, &ev);
        assert!(!conn.has_pending_output());

        let ev = readiness(&conn, false, true);
        role.handle_readiness(&mut conn, &ev);
        assert!(!conn.flags.could_have_pending_write);
    }

    #[test]
    fn test_zero_length_read_closes() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().reads.push_back(Ok(Vec::new()));

        let ev = readiness(&conn, true, false);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert!(conn.flags.seen_zero_length_read);
        assert!(!conn.subscription().read);
        assert!(conn.is_destroyed());
        assert_eq!(log.count(RecordedEvent::Close), 1);
        assert_eq!(log.rx_count(), 0);
    }

    #[test]
    fn test_destroyed_handle_is_left_alone() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().reads.push_back(Ok(Vec::new()));
        let ev = readiness(&conn, true, true);
        role.handle_readiness(&mut conn, &ev);

        script.lock().unwrap().reads.push_back(Ok(b"late".to_vec()));
        let ev = ReadinessEvent::new(Token(1), true, true, Subscription::BOTH);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert_eq!(log.count(RecordedEvent::Close), 1);
        assert_eq!(conn.vhost().stats().snapshot().closes, 1);
        assert_eq!(script.lock().unwrap().recv_calls, 1);
    }

    #[test]
    fn test_read_error_destroys() {
        let role = RawSkt::default();
        let (mut conn, script, _log) = established_conn();
        script
            .lock()
            .unwrap()
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));

        let ev = readiness(&conn, true, false);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert!(!conn.flags.seen_zero_length_read);
    }

    #[test]
    fn test_rx_delivered_and_counted() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().reads.push_back(Ok(b"hello".to_vec()));

        let ev = readiness(&conn, true, false);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(log.events(), vec![RecordedEvent::Rx(b"hello".to_vec())]);
        assert_eq!(conn.vhost().stats().snapshot().rx_bytes, 5);
    }

    #[test]
    fn test_rx_rejection_closes() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        log.fail_on(RawEvent::Rx);
        script.lock().unwrap().reads.push_back(Ok(b"bad".to_vec()));

        let ev = readiness(&conn, true, false);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert_eq!(log.count(RecordedEvent::Close), 1);
    }

    #[test]
    fn test_writable_rejection_closes() {
        let role = RawSkt::default();
        let (mut conn, _script, log) = established_conn();
        log.fail_on(RawEvent::Writable);
        conn.request_writable().unwrap();

        let ev = readiness(&conn, false, true);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert!(conn.is_destroyed());
    }

    #[test]
    fn test_retry_falls_through_to_write() {
        let role = RawSkt::default();
        let (mut conn, _script, log) = established_conn();
        conn.request_writable().unwrap();

        let ev = readiness(&conn, true, true);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(log.events(), vec![RecordedEvent::Writable]);
    }

    #[test]
    fn test_rx_flow_control_pauses_reads() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        log.pause_rx();
        script.lock().unwrap().reads.push_back(Ok(b"one".to_vec()));

        let ev = readiness(&conn, true, false);
        role.handle_readiness(&mut conn, &ev);
        assert!(!conn.subscription().read);

        script.lock().unwrap().reads.push_back(Ok(b"two".to_vec()));
        let ev = readiness(&conn, true, false);
        role.handle_readiness(&mut conn, &ev);
        assert_eq!(log.rx_count(), 1);
    }

    #[test]
    fn test_favoured_read_alternates_with_write() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        {
            let mut script = script.lock().unwrap();
            script.reads.push_back(Ok(b"a".to_vec()));
            script.reads.push_back(Ok(b"b".to_vec()));
        }

        conn.request_writable().unwrap();
        let ev = readiness(&conn, true, true);
        role.handle_readiness(&mut conn, &ev);
        assert!(conn.flags.favoured_read);
        assert_eq!(
            log.events(),
            vec![RecordedEvent::Rx(b"a".to_vec()), RecordedEvent::Writable]
        );
        log.clear();

        // both ready again: the owed write cycle skips the read
        conn.request_writable().unwrap();
        let ev = readiness(&conn, true, true);
        role.handle_readiness(&mut conn, &ev);
        assert!(!conn.flags.favoured_read);
        assert_eq!(log.events(), vec![RecordedEvent::Writable]);
        log.clear();

        let ev = readiness(&conn, true, false);
        role.handle_readiness(&mut conn, &ev);
        assert_eq!(log.events(), vec![RecordedEvent::Rx(b"b".to_vec())]);
    }

    #[test]
    fn test_favoured_read_only_yields_to_ready_write() {
        let role = RawSkt::default();
        let (mut conn, script, log) = established_conn();
        conn.flags.favoured_read = true;
        script.lock().unwrap().reads.push_back(Ok(b"x".to_vec()));

        let ev = readiness(&conn, true, false);
        role.handle_readiness(&mut conn, &ev);
        assert_eq!(log.rx_count(), 1);
        assert!(conn.flags.favoured_read);
    }

    #[test]
    fn test_full_loss_drops_every_datagram() {
        let role = lossy(100);
        let (mut conn, script, log) = udp_conn(&role);
        for i in 0..5u8 {
            script.lock().unwrap().reads.push_back(Ok(vec![i; 4]));
        }

        for _ in 0..5 {
            let ev = readiness(&conn, true, false);
            assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        }
        assert_eq!(log.rx_count(), 0);
        let stats = conn.vhost().stats().snapshot();
        assert_eq!(stats.rx_dropped, 5);
        assert_eq!(stats.rx_bytes, 0);
        assert!(!conn.is_destroyed());
    }

    #[test]
    fn test_no_loss_delivers_and_tracks_peer() {
        let role = lossy(0);
        let (mut conn, script, log) = udp_conn(&role);
        script.lock().unwrap().reads.push_back(Ok(b"dgram".to_vec()));

        let ev = readiness(&conn, true, false);
        role.handle_readiness(&mut conn, &ev);
        assert_eq!(log.rx_count(), 1);
        assert_eq!(conn.peer_addr(), Some(peer()));

        conn.write(b"reply").unwrap();
        assert_eq!(
            script.lock().unwrap().datagrams,
            vec![(b"reply".to_vec(), Some(peer()))]
        );
    }

    #[test]
    fn test_loss_ignores_stream_connections() {
        let role = lossy(100);
        let (mut conn, script, log) = established_conn();
        script.lock().unwrap().reads.push_back(Ok(b"tcp".to_vec()));

        let ev = readiness(&conn, true, false);
        role.handle_readiness(&mut conn, &ev);
        assert_eq!(log.rx_count(), 1);
    }

    #[test]
    fn test_handshake_states() {
        let role = RawSkt::default();
        let (mut conn, script, log) = raw_conn();
        assert!(role.adoption_bind(
            &mut conn,
            AdoptType::SOCKET | AdoptType::ALLOW_SSL,
            None
        ));
        assert_eq!(conn.state(), RoleState::SslInit);
        conn.change_subscription(Subscription::NONE, Subscription::READ)
            .unwrap();
        script.lock().unwrap().reads.push_back(Ok(b"hi".to_vec()));

        // SSL init is left to the adoption path
        let ev = readiness(&conn, true, false);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(log.rx_count(), 0);

        conn.set_state(RoleState::SslAckPending);
        let ev = readiness(&conn, true, false);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::PleaseClose
        );
        assert!(!conn.is_destroyed());
    }

    #[test]
    fn test_completed_handshake_reaches_receive() {
        let role = RawSkt::default().with_handshake(CompletesHandshake);
        let (mut conn, script, log) = raw_conn();
        role.adoption_bind(&mut conn, AdoptType::SOCKET | AdoptType::ALLOW_SSL, None);
        conn.set_state(RoleState::SslAckPending);
        conn.change_subscription(Subscription::NONE, Subscription::READ)
            .unwrap();
        script.lock().unwrap().reads.push_back(Ok(b"hi".to_vec()));

        let ev = readiness(&conn, true, false);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(conn.state(), RoleState::Established);
        assert_eq!(log.rx_count(), 0);

        let ev = readiness(&conn, true, false);
        role.handle_readiness(&mut conn, &ev);
        assert_eq!(log.rx_count(), 1);
    }

    fn waiting_client() -> (Connection, SharedScript, EventLog) {
        let role = RawSkt::default();
        let (mut conn, script, log) = raw_conn();
        let info = ConnectInfo::new(peer());
        assert!(role.client_bind(&mut conn, Some(&info)).unwrap());
        conn.bind_fallback_protocol().unwrap();
        conn.set_state(RoleState::WaitingConnect);
        conn.change_subscription(Subscription::NONE, Subscription::BOTH)
            .unwrap();
        log.clear();
        (conn, script, log)
    }

    #[test]
    fn test_connect_pending_then_finalize() {
        let role = RawSkt::default();
        let (mut conn, script, log) = waiting_client();
        script.lock().unwrap().connected = false;
        script.lock().unwrap().reads.push_back(Ok(b"early".to_vec()));

        let ev = readiness(&conn, true, true);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(script.lock().unwrap().recv_calls, 0);
        assert!(log.events().is_empty());

        script.lock().unwrap().connected = true;
        let ev = readiness(&conn, false, true);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::FinalizeConnect
        );
        assert_eq!(conn.state(), RoleState::Established);
        assert!(log.events().is_empty());
    }

    struct ConnectedAtOnce;

    impl ConnectCompletion for ConnectedAtOnce {
        fn complete(&self, conn: &mut Connection) -> Result<ConnectStep> {
            conn.set_state(RoleState::Established);
            Ok(ConnectStep::Proceed)
        }
    }

    #[test]
    fn test_connect_proceed_delivers_writable() {
        let role = RawSkt::default().with_connect_completion(ConnectedAtOnce);
        let (mut conn, _script, log) = waiting_client();

        let ev = readiness(&conn, false, true);
        assert_eq!(role.handle_readiness(&mut conn, &ev), HandleOutcome::Handled);
        assert_eq!(conn.state(), RoleState::Established);
        assert_eq!(log.events(), vec![RecordedEvent::Writable]);
        assert!(!conn.subscription().write);
    }

    #[test]
    fn test_connect_failure_destroys_without_close_event() {
        let role = RawSkt::default();
        let (mut conn, script, log) = waiting_client();
        script.lock().unwrap().connect_error = Some(io::ErrorKind::ConnectionRefused);

        let ev = readiness(&conn, false, true);
        assert_eq!(
            role.handle_readiness(&mut conn, &ev),
            HandleOutcome::AlreadyDestroyed
        );
        assert_eq!(log.count(RecordedEvent::Close), 0);
        assert_eq!(log.count(RecordedEvent::DropProtocol), 1);
    }

    #[test]
    fn test_http_socket_is_not_adopted() {
        let role = RawSkt::default();
        let (mut conn, _script, log) = raw_conn();
        assert!(!role.adoption_bind(&mut conn, AdoptType::HTTP | AdoptType::SOCKET, None));
        assert!(conn.role_info().is_none());
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_adoption_binds_named_or_fallback_protocol() {
        let role = RawSkt::default();

        let (mut conn, _script, log) = raw_conn();
        assert!(role.adoption_bind(&mut conn, AdoptType::SOCKET, Some("named")));
        assert_eq!(conn.protocol().map(|p| p.name()), Some("named"));
        assert_eq!(conn.state(), RoleState::Established);
        assert_eq!(log.events(), vec![RecordedEvent::BindProtocol]);

        let (mut conn, _script, _log) = raw_conn();
        assert!(role.adoption_bind(&mut conn, AdoptType::SOCKET, None));
        assert_eq!(conn.protocol().map(|p| p.name()), Some("raw"));
        assert!(!conn.is_datagram());
    }

    #[test]
    fn test_client_bind_declines_raw_proxy() {
        let role = RawSkt::default();
        let (mut conn, _script, _log) = raw_conn();
        let info = ConnectInfo::new(peer()).local_protocol_name(RAW_PROXY);

        assert!(!role.client_bind(&mut conn, Some(&info)).unwrap());
        assert!(conn.role_info().is_none());
        assert_eq!(conn.side(), Side::Server);
    }

    #[test]
    fn test_client_bind_claims_other_names() {
        let role = RawSkt::default();
        for info in [
            ConnectInfo::new(peer()),
            ConnectInfo::new(peer()).local_protocol_name("anything"),
        ] {
            let (mut conn, _script, _log) = raw_conn();
            assert!(role.client_bind(&mut conn, Some(&info)).unwrap());
            assert_eq!(conn.side(), Side::Client);
            assert_eq!(conn.state(), RoleState::Unconnected);
            assert_eq!(conn.role_info().map(|r| r.name), Some("raw-skt"));
        }
    }

    #[test]
    fn test_client_finalize_allocates_user_space() {
        let role = RawSkt::default();
        let (mut conn, _script, _log) = conn_with_session_data(16);
        let info = ConnectInfo::new(peer()).method("RAW");
        role.client_bind(&mut conn, Some(&info)).unwrap();
        conn.set_stash(ConnectStash::from(&info));
        conn.bind_fallback_protocol().unwrap();
        assert_eq!(conn.user_space().map(|s| s.len()), Some(16));

        // finalize keeps existing storage
        assert!(role.client_bind(&mut conn, None).unwrap());
        assert_eq!(conn.user_space().map(|s| s.len()), Some(16));
    }

    #[test]
    fn test_client_finalize_without_method() {
        let role = RawSkt::default();
        let (mut conn, _script, _log) = raw_conn();
        assert!(role.client_bind(&mut conn, None).unwrap());
        assert!(conn.user_space().is_none());
    }

    proptest! {
        #[test]
        fn adoption_claims_only_plain_sockets(bits in 0u32..(1 << 25)) {
            let adopt = AdoptType::from_bits_truncate(bits);
            let role = RawSkt::default();
            let (mut conn, _script, log) = raw_conn();

            let expected = adopt.contains(AdoptType::SOCKET)
                && !adopt.contains(AdoptType::HTTP)
                && !adopt.contains(AdoptType::FINISH);
            prop_assert_eq!(role.adoption_bind(&mut conn, adopt, None), expected);

            if expected {
                prop_assert_eq!(conn.side(), Side::Server);
                prop_assert_eq!(conn.is_datagram(), adopt.contains(AdoptType::UDP));
            } else {
                prop_assert!(conn.role_info().is_none());
                prop_assert_eq!(conn.state(), RoleState::Unconnected);
                prop_assert!(!conn.is_datagram());
                prop_assert!(log.events().is_empty());
            }
        }
    }
}
