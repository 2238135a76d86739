//! # Resumption Cache Interface
//!
//! Pre-shared-key material persisted between connections for TLS session
//! resumption and 0-RTT. The store is externally owned and shared; any
//! synchronisation it needs is its own concern.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::transport::TransportParameters;

/// Cached resumption material for one server.
///
/// The transport reads this at connect time and writes a fresh record
/// whenever the server issues a new session ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPsk {
    /// PSK identity presented to the server.
    pub identity: String,
    /// Opaque serialized TLS pre-shared key.
    pub secret: Bytes,
    /// Server transport parameters from the connection that issued the
    /// ticket; 0-RTT data must respect these until the new ones arrive.
    pub transport_params: TransportParameters,
    /// ALPN negotiated when the ticket was issued.
    pub alpn: Option<String>,
    /// Age of the ticket at caching time.
    pub ticket_age: Duration,
}

/// Resumption cache shared across connections.
pub trait PskCache {
    fn get(&self, hostname: &str) -> Option<CachedPsk>;
    fn put(&self, hostname: &str, psk: CachedPsk);
    fn remove(&self, hostname: &str);
}

/// In-memory cache for a single event loop.
#[derive(Default)]
pub struct InMemoryPskCache {
    entries: RefCell<HashMap<String, CachedPsk>>,
}

impl InMemoryPskCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PskCache for InMemoryPskCache {
    fn get(&self, hostname: &str) -> Option<CachedPsk> {
        self.entries.borrow().get(hostname).cloned()
    }

    fn put(&self, hostname: &str, psk: CachedPsk) {
        self.entries.borrow_mut().insert(hostname.to_string(), psk);
    }

    fn remove(&self, hostname: &str) {
        self.entries.borrow_mut().remove(hostname);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_psk() -> CachedPsk {
        CachedPsk {
            identity: "ticket-1".into(),
            secret: Bytes::from_static(b"secret"),
            transport_params: TransportParameters {
                initial_max_data: 65536,
                ..Default::default()
            },
            alpn: Some("h3".into()),
            ticket_age: Duration::from_secs(5),
        }
    }

    #[test]
    fn put_get_remove() {
        let cache = InMemoryPskCache::new();
        assert!(cache.get("example.com").is_none());
        cache.put("example.com", sample_psk());
        assert_eq!(cache.get("example.com"), Some(sample_psk()));
        cache.remove("example.com");
        assert!(cache.get("example.com").is_none());
    }
}
