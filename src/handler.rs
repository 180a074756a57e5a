use std::sync::Arc;

use crate::event::UnifiedEvent;
use mio::Interest;

pub trait EventHandler {
    fn handle_event(&self, event: &UnifiedEvent);
}

pub struct HandlerEntry {
    pub handler: Arc<dyn EventHandler + Send + Sync>,
    pub interest: Interest,
}

impl HandlerEntry {
    pub fn new<H>(handler: H, interest: Interest) -> Self
    where
        H: EventHandler + Send + Sync + 'static,
    {
        HandlerEntry {
            handler: Arc::new(handler),
            interest,
        }
    }

    pub fn from_arc(handler: Arc<dyn EventHandler + Send + Sync>, interest: Interest) -> Self {
        HandlerEntry { handler, interest }
    }
}
