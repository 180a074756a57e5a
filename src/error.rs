use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RawError>;

/// Errors surfaced by the raw socket role and the event loop around it.
///
/// Every variant except [`RawError::Configuration`] is fatal to the
/// connection it was raised on: the dispatcher converges all of them on the
/// single teardown path.
#[derive(Debug, Error)]
pub enum RawError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("rejected by application: {0}")]
    Rejected(String),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("event loop is gone")]
    EventLoopGone,
    #[error("lock poisoned: {0}")]
    PoisonedLock(String),
}

impl RawError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        RawError::Rejected(msg.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for RawError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RawError::PoisonedLock(err.to_string())
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for RawError {
    fn from(_: std::sync::mpsc::SendError<T>) -> Self {
        RawError::EventLoopGone
    }
}
