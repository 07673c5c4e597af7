use std::ops::Range;

use crate::{frame::NewConnectionId, shared::ConnectionId, token::ResetToken};

/// DataType stored in CidQueue buffer
type CidData = (ConnectionId, Option<ResetToken>);

/// Sliding window of active Connection IDs
///
/// May contain gaps due to packet loss or reordering
#[derive(Debug)]
pub(crate) struct CidQueue {
    /// Ring buffer indexed by `self.cursor`
    buffer: [Option<CidData>; Self::LEN],
    /// Index at which circular buffer addressing is based
    cursor: usize,
    /// Sequence number of `self.buffer[cursor]`
    ///
    /// The sequence number of the active CID; must be the smallest among CIDs in `buffer`.
    offset: u64,
}

impl CidQueue {
    pub(crate) fn new(cid: ConnectionId) -> Self {
        let mut buffer = [None; Self::LEN];
        buffer[0] = Some((cid, None));
        Self {
            buffer,
            cursor: 0,
            offset: 0,
        }
    }

    /// Handle a `NEW_CONNECTION_ID` frame
    ///
    /// Returns a non-empty range of retired sequence numbers and the reset
    /// token of the new active CID iff the frame's `retire_prior_to` forced a
    /// switch away from the current active CID.
    pub(crate) fn insert(
        &mut self,
        cid: NewConnectionId,
    ) -> Result<Option<(Range<u64>, ResetToken)>, InsertError> {
        if cid.sequence == self.offset && self.buffer[self.cursor].is_some() {
            // This is a duplicate of the active CID.
            return Ok(None);
        }
        let index = match cid.sequence.checked_sub(self.offset) {
            None => return Err(InsertError::Retired),
            Some(x) => x,
        };
        if index >= Self::LEN as u64 {
            return Err(InsertError::ExceedsLimit);
        }
        let index = (self.cursor + index as usize) % Self::LEN;
        self.buffer[index] = Some((cid.id, Some(cid.reset_token)));

        if cid.retire_prior_to <= self.offset {
            return Ok(None);
        }

        // The peer demands we stop using the active CID, among others
        let mut retired = self.retire_prior_to(cid.retire_prior_to);
        let token = match self.buffer[self.cursor] {
            // The CID at exactly `retire_prior_to` was received earlier, or is
            // the one from this very frame
            Some((_, token)) => {
                // Only the handshake CID lacks a token, and it has sequence 0,
                // which can't be the target of a nonzero `retire_prior_to`
                token.unwrap()
            }
            None => {
                // Gap at `retire_prior_to`; skip ahead to the next stored CID,
                // which exists because we just inserted one at or above it
                let (token, skipped) = self.next().unwrap();
                retired.end = skipped.end;
                token
            }
        };
        Ok(Some((retired, token)))
    }

    /// Returns the possibly-empty range of newly retired CIDs
    pub(crate) fn retire_prior_to(&mut self, sequence: u64) -> Range<u64> {
        let n = match sequence.checked_sub(self.offset) {
            None | Some(0) => return 0..0,
            Some(n) => n as usize,
        };
        for i in 0..n {
            self.buffer[(self.cursor + i) % Self::LEN] = None;
        }
        let orig_offset = self.offset;
        self.offset = sequence;
        self.cursor = (self.cursor + n) % Self::LEN;
        orig_offset..sequence
    }

    /// Switch to the next active CID if possible, returning
    /// 1) the reset token of the new CID and 2) a non-empty range of
    /// sequence numbers to retire, ending with the new active sequence number
    pub(crate) fn next(&mut self) -> Option<(ResetToken, Range<u64>)> {
        let (i, cid_data) = self.iter().next()?;
        self.buffer[self.cursor] = None;

        let orig_offset = self.offset;
        self.offset += i as u64;
        self.cursor = (self.cursor + i) % Self::LEN;
        Some((cid_data.1.unwrap(), orig_offset..self.offset))
    }

    /// Iterate inactive CIDs in the buffer that are not `None`
    fn iter(&self) -> impl Iterator<Item = (usize, CidData)> + '_ {
        (1..Self::LEN).filter_map(move |step| {
            let index = (self.cursor + step) % Self::LEN;
            self.buffer[index].map(|cid_data| (step, cid_data))
        })
    }

    /// Replace the initial CID learned during the handshake
    pub(crate) fn update_initial_cid(&mut self, cid: ConnectionId) {
        debug_assert_eq!(self.offset, 0);
        self.buffer[self.cursor] = Some((cid, None));
    }

    /// Return the active remote CID itself
    pub(crate) fn active(&self) -> ConnectionId {
        self.buffer[self.cursor].unwrap().0
    }

    /// Return the sequence number of the active remote CID
    pub(crate) fn active_seq(&self) -> u64 {
        self.offset
    }

    /// Stateless reset token for the active remote CID, once the peer supplied one
    pub(crate) fn reset_token(&self) -> Option<ResetToken> {
        self.buffer[self.cursor].and_then(|(_, token)| token)
    }

    /// Record the reset token for the current CID, learned via transport parameters
    pub(crate) fn set_reset_token(&mut self, token: ResetToken) {
        if let Some((_, slot)) = &mut self.buffer[self.cursor] {
            *slot = Some(token);
        }
    }

    pub(crate) const LEN: usize = 5;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum InsertError {
    /// CID was already retired
    Retired,
    /// Sequence number violates the leading edge of the window
    ExceedsLimit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(sequence: u64, retire_prior_to: u64) -> NewConnectionId {
        NewConnectionId {
            sequence,
            retire_prior_to,
            id: ConnectionId::new(&[sequence as u8 + 1; 8]),
            reset_token: [sequence as u8; crate::RESET_TOKEN_SIZE].into(),
        }
    }

    fn initial_cid() -> ConnectionId {
        ConnectionId::new(&[0xFF; 8])
    }

    #[test]
    fn next_dense() {
        let mut q = CidQueue::new(initial_cid());
        assert!(q.next().is_none());

        for i in 1..CidQueue::LEN as u64 {
            q.insert(cid(i, 0)).unwrap();
        }
        for i in 1..CidQueue::LEN as u64 {
            let (_, retire) = q.next().unwrap();
            assert_eq!(q.active_seq(), i);
            assert_eq!(retire.end - retire.start, 1);
        }
        assert!(q.next().is_none());
    }

    #[test]
    fn next_sparse() {
        let mut q = CidQueue::new(initial_cid());
        let seqs = (1..CidQueue::LEN as u64).filter(|x| x % 2 == 0);
        for i in seqs.clone() {
            q.insert(cid(i, 0)).unwrap();
        }
        for i in seqs {
            let (_, retire) = q.next().unwrap();
            assert_eq!(q.active_seq(), i);
            assert_eq!(retire, (q.active_seq().saturating_sub(2))..q.active_seq());
        }
        assert!(q.next().is_none());
    }

    #[test]
    fn wrap() {
        let mut q = CidQueue::new(initial_cid());

        for i in 1..CidQueue::LEN as u64 {
            q.insert(cid(i, 0)).unwrap();
        }
        for _ in 1..(CidQueue::LEN as u64 - 1) {
            q.next().unwrap();
        }
        for i in CidQueue::LEN as u64..(CidQueue::LEN as u64 + 3) {
            q.insert(cid(i, 0)).unwrap();
        }
        for i in (CidQueue::LEN as u64 - 1)..(CidQueue::LEN as u64 + 3) {
            q.next().unwrap();
            assert_eq!(q.active_seq(), i);
        }
        assert!(q.next().is_none());
    }

    #[test]
    fn insert_limit() {
        let mut q = CidQueue::new(initial_cid());
        assert_eq!(q.insert(cid(CidQueue::LEN as u64 - 1, 0)), Ok(None));
        assert_eq!(
            q.insert(cid(CidQueue::LEN as u64, 0)),
            Err(InsertError::ExceedsLimit)
        );
    }

    #[test]
    fn insert_duplicate() {
        let mut q = CidQueue::new(initial_cid());
        q.insert(cid(0, 0)).unwrap();
        q.insert(cid(0, 0)).unwrap();
    }

    #[test]
    fn insert_retired() {
        let mut q = CidQueue::new(initial_cid());
        assert_eq!(
            q.insert(cid(0, 0)),
            Ok(None),
            "reinserting active CID succeeds"
        );
        assert!(q.next().is_none(), "active CID isn't requeued");
        q.insert(cid(1, 0)).unwrap();
        q.next().unwrap();
        assert_eq!(
            q.insert(cid(0, 0)),
            Err(InsertError::Retired),
            "previous active CID is already retired"
        );
    }

    #[test]
    fn retire_prior_to_forces_switch() {
        let mut q = CidQueue::new(initial_cid());
        let (retired, token) = q.insert(cid(1, 1)).unwrap().unwrap();
        assert_eq!(retired, 0..1);
        assert_eq!(token, cid(1, 1).reset_token);
        assert_eq!(q.active_seq(), 1);
        assert_eq!(q.active(), cid(1, 1).id);
    }

    #[test]
    fn retire_prior_to_with_gap() {
        let mut q = CidQueue::new(initial_cid());
        // Sequence 2 demands retirement below 1, but 1 was never received
        let (retired, token) = q.insert(cid(2, 1)).unwrap().unwrap();
        assert_eq!(retired, 0..2);
        assert_eq!(token, cid(2, 1).reset_token);
        assert_eq!(q.active_seq(), 2);
    }

    #[test]
    fn always_valid() {
        let mut q = CidQueue::new(initial_cid());
        assert!(q.next().is_none());
        assert_eq!(q.active(), initial_cid());
        assert_eq!(q.active_seq(), 0);
    }
}
