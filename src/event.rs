use mio::{event::Event, Token};
use std::fmt;

/// Read/write subscription of a connection.
///
/// Unlike [`mio::Interest`] this can be empty: a connection with nothing to
/// read and no writable request stays alive but is not registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subscription {
    pub read: bool,
    pub write: bool,
}

impl Subscription {
    pub const NONE: Subscription = Subscription {
        read: false,
        write: false,
    };
    pub const READ: Subscription = Subscription {
        read: true,
        write: false,
    };
    pub const WRITE: Subscription = Subscription {
        read: false,
        write: true,
    };
    pub const BOTH: Subscription = Subscription {
        read: true,
        write: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }

    pub fn to_interest(self) -> Option<mio::Interest> {
        match (self.read, self.write) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Owned copy of a [`mio::event::Event`], safe to move onto a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnifiedEvent {
    token: Token,
    is_readable: bool,
    is_writable: bool,
    is_read_closed: bool,
    is_write_closed: bool,
    is_error: bool,
}

impl UnifiedEvent {
    pub fn new(token: Token, readable: bool, writable: bool) -> Self {
        Self {
            token,
            is_readable: readable,
            is_writable: writable,
            is_read_closed: false,
            is_write_closed: false,
            is_error: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }

    /// Whether a handler registered with `interest` should see this event.
    pub fn matches(&self, interest: mio::Interest) -> bool {
        (interest.is_readable() && (self.is_readable || self.is_read_closed || self.is_error))
            || (interest.is_writable() && (self.is_writable || self.is_write_closed))
    }
}

impl From<&Event> for UnifiedEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
            is_read_closed: event.is_read_closed(),
            is_write_closed: event.is_write_closed(),
            is_error: event.is_error(),
        }
    }
}

/// One readiness notification for one connection.
///
/// Carries both what the poller signalled and what the connection was
/// subscribed to when the event was built. Nothing here is persisted.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    token: Token,
    readable: bool,
    writable: bool,
    subscribed: Subscription,
}

impl fmt::Debug for ReadinessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessEvent")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

impl ReadinessEvent {
    pub fn new(token: Token, readable: bool, writable: bool, subscribed: Subscription) -> Self {
        Self {
            token,
            readable,
            writable,
            subscribed,
        }
    }

    /// Build from a polled event; hangups and errors count as readable so the
    /// receive pass observes them. A write-side hangup only counts as
    /// writable when write was subscribed.
    pub fn from_polled(event: &UnifiedEvent, subscribed: Subscription) -> Self {
        Self {
            token: event.token,
            readable: event.is_readable || event.is_read_closed || event.is_error,
            writable: event.is_writable || (event.is_write_closed && subscribed.write),
            subscribed,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn subscribed(&self) -> Subscription {
        self.subscribed
    }

    /// Read readiness both subscribed to and signalled.
    pub fn read_ready(&self) -> bool {
        self.readable && self.subscribed.read
    }

    /// Write readiness signalled, whether or not it was asked for.
    pub fn write_signalled(&self) -> bool {
        self.writable
    }

    /// Write readiness both subscribed to and signalled.
    pub fn write_ready(&self) -> bool {
        self.writable && self.subscribed.write
    }
}
