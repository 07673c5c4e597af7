use std::{
    cell::RefCell,
    collections::{BinaryHeap, VecDeque},
};

use tracing::trace;

use super::spaces::Retransmits;
use crate::{connection::assembler::Chunk, frame, Dir, StreamId, VarInt};

mod recv;
pub use recv::ReadError;
use recv::Recv;
pub use recv::ClosedStream;

mod send;
pub use send::{FinishError, WriteError};
use send::{Send, SendState};

mod state;
pub(crate) use state::StreamsState;

/// Access to streams
pub struct Streams<'a> {
    pub(super) state: &'a mut StreamsState,
    pub(super) pending: &'a mut Retransmits,
    pub(super) conn_state: &'a super::State,
}

impl Streams<'_> {
    /// Open a single stream if possible
    ///
    /// Returns `None` if the streams in the given direction are currently exhausted.
    pub fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.conn_state.is_closed() {
            return None;
        }

        if self.state.next[dir as usize] >= self.state.max[dir as usize] {
            // Ask the peer to raise the ceiling
            self.pending.streams_blocked[dir as usize] = true;
            return None;
        }

        self.state.next[dir as usize] += 1;
        let id = StreamId::new(self.state.side, dir, self.state.next[dir as usize] - 1);
        self.state.insert(false, id);
        self.state.send_streams += 1;
        Some(id)
    }

    /// Accept a remotely initiated stream of a certain directionality, if possible
    ///
    /// Returns `None` if there are no new incoming streams for this connection.
    pub fn accept(&mut self, dir: Dir) -> Option<StreamId> {
        if self.state.next_remote[dir as usize] == self.state.next_reported_remote[dir as usize] {
            return None;
        }

        let x = self.state.next_reported_remote[dir as usize];
        self.state.next_reported_remote[dir as usize] = x + 1;
        if dir == Dir::Bi {
            self.state.send_streams += 1;
        }

        Some(StreamId::new(!self.state.side, dir, x))
    }

    /// The number of streams that may have unacknowledged data.
    pub fn send_streams(&self) -> usize {
        self.state.send_streams
    }

    /// The number of remotely initiated open streams of a certain directionality
    pub fn remote_open_streams(&self, dir: Dir) -> u64 {
        self.state.next_remote[dir as usize]
    }
}

/// Access to the receive half of a stream
pub struct RecvStream<'a> {
    pub(super) id: StreamId,
    pub(super) state: &'a mut StreamsState,
    pub(super) pending: &'a mut Retransmits,
}

impl RecvStream<'_> {
    /// Read the next contiguous chunk of data from the stream, up to `max_length` bytes
    ///
    /// Yields `Ok(None)` at the end of the stream. `Err(ReadError::Blocked)`
    /// indicates more data may arrive; an [`StreamEvent::Readable`] event will
    /// be emitted when retrying might succeed.
    pub fn read(&mut self, max_length: usize) -> Result<Option<Chunk>, ReadError> {
        let rs = match self.state.recv.get_mut(&self.id) {
            Some(rs) => rs,
            None => return Err(ReadError::ClosedStream),
        };
        match rs.read(max_length) {
            Ok(Some(chunk)) => {
                // Flow control credit freed by consumption gets re-advertised once a quarter
                // of the respective window has opened up; the actual value is computed (and
                // recorded) when the frame is written
                let (_, stream_transmit) = rs.max_stream_data(self.state.stream_receive_window);
                if stream_transmit.should_transmit() {
                    self.pending.max_stream_data.insert(self.id);
                }
                if self
                    .state
                    .add_read_credits(chunk.bytes.len() as u64)
                    .should_transmit()
                {
                    self.pending.max_data = true;
                }
                Ok(Some(chunk))
            }
            Ok(None) => {
                // All data received and read
                self.state.recv.remove(&self.id);
                self.state.stream_freed(self.id, StreamHalf::Recv);
                Ok(None)
            }
            Err(e @ ReadError::Reset(_)) => {
                self.state.recv.remove(&self.id);
                self.state.stream_freed(self.id, StreamHalf::Recv);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop accepting data on the given receive stream
    ///
    /// Discards unread data and notifies the peer to stop transmitting. Once stopped, further
    /// attempts to operate on a stream will yield `ClosedStream` errors.
    pub fn stop(&mut self, error_code: VarInt) -> Result<(), ClosedStream> {
        let stream = match self.state.recv.get_mut(&self.id) {
            Some(s) => s,
            None => return Err(ClosedStream { _private: () }),
        };

        let (read_credits, stop_sending) = stream.stop()?;
        if stop_sending.should_transmit() {
            self.pending.stop_sending.push(frame::StopSending {
                id: self.id,
                error_code,
            });
        }

        // We need to keep stopped streams around until they're finished or reset so we can update
        // connection-level flow control to account for discarded data. Otherwise, we can discard
        // state immediately.
        if !stream.receiving_unknown_size() {
            self.state.recv.remove(&self.id);
            self.state.stream_freed(self.id, StreamHalf::Recv);
        }

        if self.state.add_read_credits(read_credits).should_transmit() {
            self.pending.max_data = true;
        }

        Ok(())
    }
}

/// Access to the send half of a stream
pub struct SendStream<'a> {
    pub(super) id: StreamId,
    pub(super) state: &'a mut StreamsState,
    pub(super) pending: &'a mut Retransmits,
    pub(super) conn_state: &'a super::State,
}

impl SendStream<'_> {
    /// Send data on the given stream
    ///
    /// Returns the number of bytes successfully written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.conn_state.is_closed() {
            trace!(%self.id, "write blocked; connection draining");
            return Err(WriteError::Blocked);
        }

        let limit = self.state.write_limit();
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(WriteError::ClosedStream)?;
        if limit == 0 {
            trace!(
                stream = %self.id, max_data = self.state.max_data, data_sent = self.state.data_sent,
                "write blocked by connection-level flow control or send window"
            );
            if self.state.max_data == self.state.data_sent {
                self.pending.data_blocked = Some(self.state.max_data);
            }
            if !stream.connection_blocked {
                stream.connection_blocked = true;
                self.state.connection_blocked.push(self.id);
            }
            return Err(WriteError::Blocked);
        }

        let was_pending = stream.is_pending();
        let result = stream.write(data, limit);
        if let Err(WriteError::Blocked) = result {
            // Stalled by the stream's own flow control window
            self.pending
                .stream_data_blocked
                .push((self.id, stream.max_data));
            return Err(WriteError::Blocked);
        }
        let written = result?;
        self.state.data_sent += written as u64;
        self.state.unacked_data += written as u64;
        trace!(stream = %self.id, "wrote {} bytes", written);
        if !was_pending {
            push_pending(&mut self.state.pending, self.id, stream.priority);
        }
        Ok(written)
    }

    /// Check if this stream was stopped, get the reason if it was
    pub fn stopped(&self) -> Result<Option<VarInt>, ClosedStream> {
        match self.state.send.get(&self.id) {
            Some(s) => Ok(s.stop_reason),
            None => Err(ClosedStream { _private: () }),
        }
    }

    /// Finish a send stream, signalling that no more data will be sent.
    ///
    /// If this fails, no [`StreamEvent::Finished`] will be generated.
    pub fn finish(&mut self) -> Result<(), FinishError> {
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(FinishError::ClosedStream)?;

        let was_pending = stream.is_pending();
        stream.finish()?;
        if !was_pending {
            push_pending(&mut self.state.pending, self.id, stream.priority);
        }

        Ok(())
    }

    /// Abandon transmitting data on a stream
    pub fn reset(&mut self, error_code: VarInt) -> Result<(), ClosedStream> {
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(ClosedStream { _private: () })?;

        if matches!(stream.state, SendState::ResetSent) {
            // Redundant reset call
            return Err(ClosedStream { _private: () });
        }

        // Restore the portion of the send window consumed by the data that we aren't about to
        // send. We leave flow control alone because the peer's responsible for issuing additional
        // credit based on the final offset communicated in the RESET_STREAM frame we send.
        self.state.unacked_data -= stream.pending.unacked();
        stream.reset();
        self.pending.reset_stream.push((self.id, error_code));

        Ok(())
    }

    /// Set the priority of a stream
    ///
    /// Higher priority streams are transmitted first, with round-robin
    /// batching among streams of the same priority.
    pub fn set_priority(&mut self, priority: i32) -> Result<(), ClosedStream> {
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(ClosedStream { _private: () })?;

        stream.priority = priority;
        Ok(())
    }

    /// Get the priority of a stream
    pub fn priority(&self) -> Result<i32, ClosedStream> {
        let stream = self
            .state
            .send
            .get(&self.id)
            .ok_or(ClosedStream { _private: () })?;

        Ok(stream.priority)
    }
}

fn push_pending(pending: &mut BinaryHeap<PendingLevel>, id: StreamId, priority: i32) {
    for level in pending.iter() {
        if priority == level.priority {
            level.queue.borrow_mut().push_back(id);
            return;
        }
    }

    // If there is only a single level and it's empty, repurpose it for the
    // required priority
    if pending.len() == 1 {
        if let Some(mut first) = pending.peek_mut() {
            let mut queue = first.queue.borrow_mut();
            if queue.is_empty() {
                queue.push_back(id);
                drop(queue);
                first.priority = priority;
                return;
            }
        }
    }

    let mut queue = VecDeque::new();
    queue.push_back(id);
    pending.push(PendingLevel {
        queue: RefCell::new(queue),
        priority,
    });
}

struct PendingLevel {
    // RefCell is needed because BinaryHeap doesn't have an iter_mut()
    queue: RefCell<VecDeque<StreamId>>,
    priority: i32,
}

impl PartialEq for PendingLevel {
    fn eq(&self, other: &Self) -> bool {
        self.priority.eq(&other.priority)
    }
}

impl PartialOrd for PendingLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for PendingLevel {}

impl Ord for PendingLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// Application events about streams
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// One or more new streams has been opened and might be readable
    Opened {
        /// Directionality for which streams have been opened
        dir: Dir,
    },
    /// A currently open stream likely has data or errors waiting to be read
    Readable {
        /// Which stream is now readable
        id: StreamId,
    },
    /// A formerly write-blocked stream might be ready for a write or have been stopped
    ///
    /// Only generated for streams that are currently open.
    Writable {
        /// Which stream is now writable
        id: StreamId,
    },
    /// A finished stream has been fully acknowledged or stopped
    Finished {
        /// Which stream has been finished
        id: StreamId,
    },
    /// The peer asked us to stop sending on an outgoing stream
    Stopped {
        /// Which stream has been stopped
        id: StreamId,
        /// Error code supplied by the peer
        error_code: VarInt,
    },
    /// At least one new stream of a certain directionality may be opened
    Available {
        /// Directionality for which streams are newly available
        dir: Dir,
    },
}

/// Indicates whether a frame needs to be transmitted
///
/// This type wraps around bool and uses the `#[must_use]` attribute in order
/// to prevent accidental loss of the frame transmission requirement.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[must_use = "A frame might need to be enqueued"]
pub(crate) struct ShouldTransmit(pub(crate) bool);

impl ShouldTransmit {
    /// Returns whether a frame should be transmitted
    pub(crate) fn should_transmit(self) -> bool {
        self.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum StreamHalf {
    Send,
    Recv,
}
