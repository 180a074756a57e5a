use std::io;

use tracing::trace;

use crate::conn::Connection;
use crate::object_pool::{ObjectPool, PooledObject};

/// Bytes produced by one [`aware_read`].
pub struct ReadBuf {
    buf: PooledObject<Vec<u8>>,
    len: usize,
    buffered: bool,
}

impl ReadBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the bytes came from buffered input rather than the socket.
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }
}

pub enum ReadOutcome {
    Data(ReadBuf),
    /// The peer closed, or a zero-length datagram arrived
    EndOfStream,
    /// Nothing available right now
    Retry,
    Error(io::Error),
}

/// What is left after the application saw a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Done,
    /// Buffered input remains; another receive pass should run
    PendingRx,
    /// Storing the unconsumed tail failed
    Close,
}

/// Reads from buffered input first, then from the socket.
///
/// `buffer_size` is the read size for socket reads; pooled buffers are
/// resized to it since buffered reads may have shrunk them.
pub fn aware_read(
    conn: &mut Connection,
    pool: &ObjectPool<Vec<u8>>,
    buffer_size: usize,
) -> ReadOutcome {
    let mut buf = pool.acquire();

    if let Some(head) = conn.input().head() {
        let len = head.len();
        buf.clear();
        buf.extend_from_slice(head);
        trace!(conn = ?conn.id(), len, "serving buffered input");
        return ReadOutcome::Data(ReadBuf {
            buf,
            len,
            buffered: true,
        });
    }

    if buf.len() != buffer_size {
        buf.resize(buffer_size, 0);
    }

    match conn.socket_mut().recv(&mut buf[..]) {
        Ok((0, _)) => ReadOutcome::EndOfStream,
        Ok((len, from)) => {
            if let (Some(udp), Some(from)) = (conn.udp_mut(), from) {
                udp.peer = Some(from);
            }
            ReadOutcome::Data(ReadBuf {
                buf,
                len,
                buffered: false,
            })
        }
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            ReadOutcome::Retry
        }
        Err(e) => ReadOutcome::Error(e),
    }
}

/// Accounts for `used` bytes of `read` having been consumed.
///
/// Buffered input advances by `used`. Unconsumed bytes of a fresh socket
/// read are kept for the next pass.
pub fn finished_consuming(conn: &mut Connection, used: usize, read: &ReadBuf) -> ConsumeOutcome {
    let used = used.min(read.len);
    if read.buffered {
        conn.input_mut().consume(used);
    } else if used < read.len && conn.input_mut().append(&read.as_slice()[used..]).is_err() {
        return ConsumeOutcome::Close;
    }

    if conn.has_pending_input() {
        ConsumeOutcome::PendingRx
    } else {
        ConsumeOutcome::Done
    }
}
