//! Maintain the state of local connection IDs
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::TransportError;

/// Local connection ID management
///
/// Tracks which of the connection IDs we issued to the peer are still live.
/// The peer routes packets to us by these, so the set must never go empty
/// while the connection is active.
pub(super) struct CidState {
    /// Sequence numbers of local connection IDs not yet retired by the peer
    active_seq: FxHashSet<u64>,
    /// Number of CIDs issued so far, i.e. the sequence number of the next one
    issued: u64,
    /// Length of all local CIDs, which short-header parsing relies on
    cid_len: usize,
    /// How many CIDs the peer is willing to store, from its transport parameters
    peer_limit: u64,
}

impl CidState {
    pub(super) fn new(cid_len: usize) -> Self {
        let mut active_seq = FxHashSet::default();
        // The handshake CID has sequence number 0
        active_seq.insert(0);
        Self {
            active_seq,
            issued: 1,
            cid_len,
            peer_limit: 2,
        }
    }

    /// Record the peer's `active_connection_id_limit`
    pub(super) fn set_peer_limit(&mut self, limit: u64) {
        self.peer_limit = limit;
    }

    /// Number of additional CIDs we should issue right now
    ///
    /// Bounded both by the peer's advertised capacity and by our own appetite
    /// for routing table entries.
    pub(super) fn cids_to_issue(&self) -> u64 {
        if self.cid_len == 0 {
            // Zero-length CIDs leave nothing to rotate through
            return 0;
        }
        let target = self.peer_limit.min(crate::LOC_CID_COUNT);
        target.saturating_sub(self.active_seq.len() as u64)
    }

    /// Assign the next sequence number to a freshly generated CID
    pub(super) fn on_cid_issued(&mut self) -> u64 {
        let seq = self.issued;
        trace!(sequence = seq, "issuing new CID");
        self.active_seq.insert(seq);
        self.issued += 1;
        seq
    }

    /// Handle RETIRE_CONNECTION_ID; returns whether the CID was live until now
    pub(super) fn on_cid_retired(&mut self, sequence: u64) -> Result<bool, TransportError> {
        if sequence >= self.issued {
            debug!(sequence, "peer retired unissued CID");
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID for unissued sequence number",
            ));
        }
        Ok(self.active_seq.remove(&sequence))
    }

    pub(super) fn cid_len(&self) -> usize {
        self.cid_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_up_to_limits() {
        let mut state = CidState::new(8);
        state.set_peer_limit(3);
        assert_eq!(state.cids_to_issue(), 2);
        state.on_cid_issued();
        state.on_cid_issued();
        assert_eq!(state.cids_to_issue(), 0);
        // Retirement frees a slot
        assert_eq!(state.on_cid_retired(0), Ok(true));
        assert_eq!(state.cids_to_issue(), 1);
        // Redundant retirement is not an error
        assert_eq!(state.on_cid_retired(0), Ok(false));
    }

    #[test]
    fn unissued_retirement_rejected() {
        let mut state = CidState::new(8);
        assert!(state.on_cid_retired(7).is_err());
    }

    #[test]
    fn zero_length_cids_never_rotate() {
        let mut state = CidState::new(0);
        state.set_peer_limit(8);
        assert_eq!(state.cids_to_issue(), 0);
    }
}
