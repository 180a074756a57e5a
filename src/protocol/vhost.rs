use std::sync::Arc;

use crate::error::{RawError, Result};
use crate::protocol::RawHandler;
use crate::stats::Stats;

/// An application protocol: a named handler plus the size of the
/// per-connection storage it wants allocated.
pub struct Protocol {
    name: String,
    per_session_data_size: usize,
    pub(crate) handler: Arc<dyn RawHandler>,
}

impl Protocol {
    pub fn new<H: RawHandler>(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            per_session_data_size: 0,
            handler: Arc::new(handler),
        }
    }

    pub fn with_session_data(mut self, size: usize) -> Self {
        self.per_session_data_size = size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn per_session_data_size(&self) -> usize {
        self.per_session_data_size
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("per_session_data_size", &self.per_session_data_size)
            .finish()
    }
}

/// A set of protocols sharing counters, with one of them designated as the
/// fallback for raw connections adopted without an explicit protocol.
#[derive(Debug)]
pub struct Vhost {
    name: String,
    protocols: Vec<Arc<Protocol>>,
    raw_protocol_index: usize,
    stats: Arc<Stats>,
}

impl Vhost {
    pub fn new(
        name: impl Into<String>,
        protocols: Vec<Protocol>,
        raw_protocol_index: usize,
    ) -> Result<Self> {
        if raw_protocol_index >= protocols.len() {
            return Err(RawError::Configuration(format!(
                "raw protocol index {} out of range for {} protocols",
                raw_protocol_index,
                protocols.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            protocols: protocols.into_iter().map(Arc::new).collect(),
            raw_protocol_index,
            stats: Arc::new(Stats::new()),
        })
    }

    /// Vhost with a single protocol that is also the raw fallback.
    pub fn single(name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            protocols: vec![Arc::new(protocol)],
            raw_protocol_index: 0,
            stats: Arc::new(Stats::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self, name: &str) -> Option<&Arc<Protocol>> {
        self.protocols.iter().find(|p| p.name() == name)
    }

    pub fn raw_protocol(&self) -> &Arc<Protocol> {
        &self.protocols[self.raw_protocol_index]
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}
