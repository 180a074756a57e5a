use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::Events;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::event::UnifiedEvent;
use crate::poll::{PollHandle, WAKER_TOKEN};
use crate::thread_pool::ThreadPool;

pub use crate::config::{DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS};

pub struct Reactor {
    pub(crate) poll_handle: Arc<PollHandle>,
    pool: ThreadPool,
    running: Arc<AtomicBool>,
    events_capacity: usize,
    poll_timeout: Duration,
}

/// Cloneable handle that stops a running reactor from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    poll_handle: Arc<PollHandle>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.poll_handle.wake() {
            warn!(error = %e, "failed to wake reactor for shutdown");
        }
    }
}

impl Reactor {
    pub fn new(pool_size: usize, events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            poll_handle: Arc::new(PollHandle::new()?),
            pool: ThreadPool::new(pool_size)?,
            running: Arc::new(AtomicBool::new(false)),
            events_capacity,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
        })
    }

    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut events = Events::with_capacity(self.events_capacity);
        debug!(workers = self.pool.workers_len(), "reactor running");

        while self.running.load(Ordering::SeqCst) {
            self.poll_handle
                .poll(&mut events, Some(self.poll_timeout))?;

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch_event(UnifiedEvent::from(event))?;
            }
        }
        debug!("reactor stopped");
        Ok(())
    }

    pub fn get_shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            poll_handle: Arc::clone(&self.poll_handle),
        }
    }

    /// Hands the event to the worker that owns its token.
    pub fn dispatch_event(&self, event: UnifiedEvent) -> Result<()> {
        let token = event.token();
        let handler = {
            let handlers = self.poll_handle.handlers();
            let handlers = handlers.read()?;
            match handlers.get(&token) {
                Some(entry) if event.matches(entry.interest) => Arc::clone(&entry.handler),
                Some(_) => return Ok(()),
                None => {
                    trace!(?token, "event for unregistered token");
                    return Ok(());
                }
            }
        };

        self.pool
            .exec_keyed(token.0, move || handler.handle_event(&event))
    }
}
