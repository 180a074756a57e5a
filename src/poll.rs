use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::error::Result;
use crate::handler::{EventHandler, HandlerEntry};

/// Token reserved for the reactor's waker; never hand it to a source.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

pub type HandlerRegistry = Arc<RwLock<HashMap<Token, HandlerEntry>>>;

pub struct PollHandle {
    poller: Mutex<Poll>,
    registry: Registry,
    handlers: HandlerRegistry,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> Result<Self> {
        let poller = Poll::new()?;
        let registry = poller.registry().try_clone()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok(PollHandle {
            poller: Mutex::new(poller),
            registry,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            waker: Arc::new(waker),
        })
    }

    pub fn register<H, S>(
        &self,
        src: &mut S,
        token: Token,
        interest: Interest,
        handler: H,
    ) -> Result<()>
    where
        H: EventHandler + Send + Sync + 'static,
        S: mio::event::Source + ?Sized,
    {
        src.register(&self.registry, token, interest)?;
        self.handlers
            .write()?
            .insert(token, HandlerEntry::new(handler, interest));
        Ok(())
    }

    pub fn reregister<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        src.reregister(&self.registry, token, interest)?;
        if let Some(entry) = self.handlers.write()?.get_mut(&token) {
            entry.interest = interest;
        }
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.unregister(token)?;
        src.deregister(&self.registry)?;
        Ok(())
    }

    /// Registers `src` without touching the handler table.
    pub fn attach<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        src.register(&self.registry, token, interest)?;
        if let Some(entry) = self.handlers.write()?.get_mut(&token) {
            entry.interest = interest;
        }
        Ok(())
    }

    /// Deregisters `src` but keeps its handler so it can be attached again.
    pub fn detach<S>(&self, src: &mut S) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        src.deregister(&self.registry)?;
        Ok(())
    }

    /// Installs a shared handler for `token`, replacing any previous one.
    pub fn set_handler(
        &self,
        token: Token,
        handler: Arc<dyn EventHandler + Send + Sync>,
        interest: Interest,
    ) -> Result<()> {
        self.handlers
            .write()?
            .insert(token, HandlerEntry::from_arc(handler, interest));
        Ok(())
    }

    /// Drops the handler for `token` without touching the source.
    pub fn unregister(&self, token: Token) -> Result<()> {
        self.handlers.write()?.remove(&token);
        Ok(())
    }

    pub fn registry(&self) -> Result<Registry> {
        Ok(self.registry.try_clone()?)
    }

    pub fn handlers(&self) -> HandlerRegistry {
        Arc::clone(&self.handlers)
    }

    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        let mut poller = self.poller.lock()?;
        match poller.poll(events, timeout) {
            Ok(()) => Ok(events.iter().count()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn wake(&self) -> Result<()> {
        Ok(self.waker.wake()?)
    }
}
