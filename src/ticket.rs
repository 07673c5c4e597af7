//! Session state remembered between connections to the same server
//!
//! Servers hand out address-validation tokens in NEW_TOKEN frames; presenting
//! one in a later Initial lets the client skip a Retry round trip. We bundle
//! the token with the smoothed RTT observed on the issuing connection so a
//! resumed connection starts loss detection from a realistic estimate instead
//! of the default.

use std::{
    collections::{hash_map, VecDeque},
    sync::Mutex,
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::coding::{BufExt, BufMutExt};

/// State remembered from a previous connection to a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    /// Address-validation token received in a NEW_TOKEN frame
    pub token: Bytes,
    /// Smoothed RTT of the connection the token arrived on
    pub rtt: Duration,
}

impl SessionTicket {
    /// Bumped whenever the wire layout changes; stale entries are refused
    const REVISION: u8 = 1;

    /// Serialize for storage
    ///
    /// The layout is opaque to peers and not a wire-compatibility surface.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(1 + 8 + 2 + self.token.len());
        buf.write(Self::REVISION);
        buf.write_var(self.rtt.as_micros().min(u64::MAX as u128) as u64);
        buf.write_var(self.token.len() as u64);
        buf.put_slice(&self.token);
        buf.into()
    }

    /// Deserialize from storage, refusing entries from other revisions
    pub fn decode(mut bytes: Bytes) -> Option<Self> {
        let revision = bytes.get::<u8>().ok()?;
        if revision != Self::REVISION {
            return None;
        }
        let rtt = Duration::from_micros(bytes.get_var().ok()?);
        let len = bytes.get_var().ok()? as usize;
        if bytes.remaining() < len {
            return None;
        }
        Some(Self {
            token: bytes.split_to(len),
            rtt,
        })
    }
}

/// Persists session tickets between connections, keyed by server name
pub trait TicketStore: Send + Sync {
    /// Record a ticket for later connections to `server_name`
    fn insert(&self, server_name: &str, ticket: Bytes);

    /// Remove and return a ticket for `server_name`, if one is stored
    ///
    /// Tokens are single-use, so the entry must not be yielded twice.
    fn take(&self, server_name: &str) -> Option<Bytes>;
}

/// In-memory [`TicketStore`] keeping a bounded queue of tickets per server
#[derive(Debug, Default)]
pub struct MemoryTicketStore(Mutex<FxHashMap<String, VecDeque<Bytes>>>);

/// Tokens are cheap to mint; keeping many around has no upside
const MAX_TICKETS_PER_SERVER: usize = 2;

impl TicketStore for MemoryTicketStore {
    fn insert(&self, server_name: &str, ticket: Bytes) {
        trace!(%server_name, "storing session ticket");
        let mut map = self.0.lock().unwrap();
        let queue = match map.entry(server_name.to_string()) {
            hash_map::Entry::Occupied(e) => e.into_mut(),
            hash_map::Entry::Vacant(e) => e.insert(VecDeque::new()),
        };
        if queue.len() >= MAX_TICKETS_PER_SERVER {
            queue.pop_front();
        }
        queue.push_back(ticket);
    }

    fn take(&self, server_name: &str) -> Option<Bytes> {
        let mut map = self.0.lock().unwrap();
        let queue = map.get_mut(server_name)?;
        let ticket = queue.pop_back();
        if queue.is_empty() {
            map.remove(server_name);
        }
        trace!(%server_name, found = %ticket.is_some(), "taking session ticket");
        ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let ticket = SessionTicket {
            token: Bytes::from_static(b"sometoken"),
            rtt: Duration::from_micros(23_500),
        };
        assert_eq!(SessionTicket::decode(ticket.encode()), Some(ticket));
    }

    #[test]
    fn stale_revision_refused() {
        let ticket = SessionTicket {
            token: Bytes::from_static(b"t"),
            rtt: Duration::from_millis(1),
        };
        let mut encoded = ticket.encode().to_vec();
        encoded[0] = SessionTicket::REVISION + 1;
        assert_eq!(SessionTicket::decode(encoded.into()), None);
    }

    #[test]
    fn store_is_single_use_and_bounded() {
        let store = MemoryTicketStore::default();
        for i in 0..3u8 {
            store.insert("example.com", Bytes::copy_from_slice(&[i]));
        }
        // Oldest ticket was evicted; newest is yielded first
        assert_eq!(store.take("example.com"), Some(Bytes::from_static(&[2])));
        assert_eq!(store.take("example.com"), Some(Bytes::from_static(&[1])));
        assert_eq!(store.take("example.com"), None);
        assert_eq!(store.take("other.example"), None);
    }
}
