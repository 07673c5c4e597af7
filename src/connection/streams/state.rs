use std::{
    collections::{binary_heap::PeekMut, hash_map, BinaryHeap, VecDeque},
    convert::TryFrom,
    mem,
};

use bytes::BufMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{
    push_pending, PendingLevel, Recv, Send, SendState, ShouldTransmit, StreamEvent, StreamHalf,
};
use crate::{
    coding::BufMutExt,
    connection::spaces::{Retransmits, ThinRetransmits},
    connection::stats::FrameStats,
    frame::{self, FrameStruct, FrameType, StreamMetaVec},
    transport_parameters::TransportParameters,
    Dir, Side, StreamId, TransportError, VarInt, MAX_STREAM_COUNT,
};

pub(crate) struct StreamsState {
    pub(super) side: Side,
    // Set of streams that are currently open, or could be immediately opened by the peer
    pub(super) send: FxHashMap<StreamId, Box<Send>>,
    pub(super) recv: FxHashMap<StreamId, Box<Recv>>,
    /// Lowest locally-initiated stream index that hasn't yet been opened, per direction
    pub(super) next: [u64; 2],
    /// Maximum number of locally-initiated streams that may be opened over the lifetime of the
    /// connection so far, per direction
    pub(super) max: [u64; 2],
    /// Maximum number of remotely-initiated streams that may be opened over the lifetime of the
    /// connection so far, per direction
    pub(super) max_remote: [u64; 2],
    /// Lowest remotely-initiated stream index that hasn't actually been opened by the peer
    pub(super) next_remote: [u64; 2],
    /// Whether the remote endpoint has opened any streams the application doesn't know about yet,
    /// per directionality
    opened: [bool; 2],
    // Next to report to the application, once opened
    pub(super) next_reported_remote: [u64; 2],
    /// Number of outbound streams
    ///
    /// This differs from `self.send.len()` in that it does not include streams that the peer is
    /// permitted to open but which have not yet been opened.
    pub(super) send_streams: usize,
    /// Streams with outgoing data queued, grouped by priority
    pub(super) pending: BinaryHeap<PendingLevel>,

    events: VecDeque<StreamEvent>,
    /// Streams blocked on connection-level flow control or send window space
    ///
    /// Streams are only added to this list when a write fails.
    pub(super) connection_blocked: Vec<StreamId>,
    /// Connection-level flow control budget dictated by the peer
    pub(super) max_data: u64,
    /// The initial receive window
    receive_window: u64,
    /// Limit on incoming data, which is transmitted through `MAX_DATA` frames
    pub(super) local_max_data: u64,
    /// The last value of `MAX_DATA` which had been queued for transmission in
    /// an outgoing `MAX_DATA` frame
    sent_max_data: VarInt,
    /// Sum of current offsets of all send streams.
    pub(super) data_sent: u64,
    /// Sum of end offsets of all receive streams. Includes gaps, so it's an upper bound.
    pub(super) data_recvd: u64,
    /// Total quantity of unacknowledged outgoing data
    pub(super) unacked_data: u64,
    /// Configured upper bound for `unacked_data`
    pub(super) send_window: u64,
    /// Configured upper bound for how much unacked data the peer can send us per stream
    pub(super) stream_receive_window: u64,
    /// Whether the corresponding `max_remote` has increased since the last MAX_STREAMS frame
    max_streams_dirty: [bool; 2],

    // Pertinent state from the TransportParameters supplied by the peer
    initial_max_stream_data_uni: VarInt,
    initial_max_stream_data_bidi_local: VarInt,
    initial_max_stream_data_bidi_remote: VarInt,
}

impl StreamsState {
    pub(crate) fn new(
        side: Side,
        max_remote_uni: VarInt,
        max_remote_bi: VarInt,
        send_window: u64,
        receive_window: VarInt,
        stream_receive_window: VarInt,
    ) -> Self {
        let mut this = Self {
            side,
            send: FxHashMap::default(),
            recv: FxHashMap::default(),
            next: [0, 0],
            max: [0, 0],
            max_remote: [max_remote_bi.into_inner(), max_remote_uni.into_inner()],
            next_remote: [0, 0],
            opened: [false, false],
            next_reported_remote: [0, 0],
            send_streams: 0,
            pending: BinaryHeap::new(),
            events: VecDeque::new(),
            connection_blocked: Vec::new(),
            max_data: 0,
            receive_window: receive_window.into_inner(),
            local_max_data: receive_window.into_inner(),
            sent_max_data: receive_window,
            data_sent: 0,
            data_recvd: 0,
            unacked_data: 0,
            send_window,
            stream_receive_window: stream_receive_window.into_inner(),
            max_streams_dirty: [false, false],
            initial_max_stream_data_uni: 0u32.into(),
            initial_max_stream_data_bidi_local: 0u32.into(),
            initial_max_stream_data_bidi_remote: 0u32.into(),
        };

        for dir in Dir::iter() {
            for i in 0..this.max_remote[dir as usize] {
                this.insert(true, StreamId::new(!side, dir, i));
            }
        }

        this
    }

    pub(crate) fn set_params(&mut self, params: &TransportParameters) {
        self.initial_max_stream_data_uni = params.initial_max_stream_data_uni;
        self.initial_max_stream_data_bidi_local = params.initial_max_stream_data_bidi_local;
        self.initial_max_stream_data_bidi_remote = params.initial_max_stream_data_bidi_remote;
        self.max[Dir::Bi as usize] = params.initial_max_streams_bidi.into_inner();
        self.max[Dir::Uni as usize] = params.initial_max_streams_uni.into_inner();
        self.received_max_data(params.initial_max_data);
        for i in 0..self.max_remote[Dir::Bi as usize] {
            let id = StreamId::new(!self.side, Dir::Bi, i);
            self.send.get_mut(&id).unwrap().max_data =
                params.initial_max_stream_data_bidi_local.into_inner();
        }
    }

    /// Whether application code could have further use of this connection's streams
    ///
    /// Used to decide whether the entire connection can be retired.
    pub(crate) fn send_streams(&self) -> usize {
        self.send_streams
    }

    pub(crate) fn zero_rtt_rejected(&mut self) {
        // Revert to initial state for outgoing streams
        for dir in Dir::iter() {
            for i in 0..self.next[dir as usize] {
                // We don't bother calling `stream_freed` here because we explicitly reset affected
                // counters below.
                let id = StreamId::new(self.side, dir, i);
                self.send.remove(&id).unwrap();
                if let Dir::Bi = dir {
                    self.recv.remove(&id).unwrap();
                }
            }
            self.next[dir as usize] = 0;
        }

        self.pending.clear();
        self.send_streams = 0;
        self.data_sent = 0;
        self.unacked_data = 0;
        self.connection_blocked.clear();
    }

    /// Process incoming stream frame
    ///
    /// If successful, returns whether a `MAX_DATA` frame needs to be transmitted
    pub(crate) fn received(
        &mut self,
        frame: frame::Stream,
        payload_len: usize,
    ) -> Result<ShouldTransmit, TransportError> {
        let stream = frame.id;
        self.validate_receive_id(stream).map_err(|e| {
            debug!("received illegal STREAM frame");
            e
        })?;

        let rs = match self.recv.get_mut(&stream) {
            Some(rs) => rs,
            None => {
                trace!("dropping frame for closed stream");
                return Ok(ShouldTransmit(false));
            }
        };

        if rs.is_finished() {
            trace!("dropping frame for finished stream");
            return Ok(ShouldTransmit(false));
        }

        let new_bytes = rs.ingest(frame, payload_len, self.data_recvd, self.local_max_data)?;
        self.data_recvd = self.data_recvd.saturating_add(new_bytes);

        if !rs.stopped {
            self.on_stream_frame(true, stream);
            return Ok(ShouldTransmit(false));
        }

        // Stopped streams become closed instantly on FIN, so check whether we need to clean up
        if rs.is_closed() {
            self.recv.remove(&stream);
            self.stream_freed(stream, StreamHalf::Recv);
        }

        // We don't buffer data on stopped streams, so issue flow control credit immediately
        Ok(self.add_read_credits(new_bytes))
    }

    /// Process incoming RESET_STREAM frame
    ///
    /// If successful, returns whether a `MAX_DATA` frame needs to be transmitted
    pub(crate) fn received_reset(
        &mut self,
        frame: frame::ResetStream,
    ) -> Result<ShouldTransmit, TransportError> {
        let frame::ResetStream {
            id,
            error_code,
            final_offset,
        } = frame;
        self.validate_receive_id(id).map_err(|e| {
            debug!("received illegal RESET_STREAM frame");
            e
        })?;

        let rs = match self.recv.get_mut(&id) {
            Some(stream) => stream,
            None => {
                trace!("received RESET_STREAM on closed stream");
                return Ok(ShouldTransmit(false));
            }
        };

        // State transition
        if !rs.reset(
            error_code,
            final_offset,
            self.data_recvd,
            self.local_max_data,
        )? {
            // Redundant reset
            return Ok(ShouldTransmit(false));
        }
        let bytes_read = rs.assembler.bytes_read();
        let stopped = rs.stopped;
        let end = rs.end;
        if stopped {
            // Stopped streams should be disposed immediately on reset
            self.recv.remove(&id);
            self.stream_freed(id, StreamHalf::Recv);
        }
        self.on_stream_frame(!stopped, id);

        // Update flow control
        Ok(if bytes_read != final_offset.into_inner() {
            // bytes_read is always <= end, so this won't underflow.
            self.data_recvd = self
                .data_recvd
                .saturating_add(final_offset.into_inner() - end);
            self.add_read_credits(final_offset.into_inner() - bytes_read)
        } else {
            ShouldTransmit(false)
        })
    }

    /// Process incoming `STOP_SENDING` frame
    ///
    /// Peers may race STOP_SENDING against stream closure, so an unknown
    /// stream is not a protocol error; the frame is simply ignored.
    pub(crate) fn received_stop_sending(&mut self, id: StreamId, error_code: VarInt) {
        let stream = match self.send.get_mut(&id) {
            Some(ss) => ss,
            None => return,
        };

        if stream.try_stop(error_code) {
            self.events
                .push_back(StreamEvent::Stopped { id, error_code });
            self.on_stream_frame(false, id);
        }
    }

    pub(crate) fn reset_acked(&mut self, id: StreamId) {
        match self.send.entry(id) {
            hash_map::Entry::Vacant(_) => {}
            hash_map::Entry::Occupied(e) => {
                if let SendState::ResetSent = e.get().state {
                    e.remove_entry();
                    self.stream_freed(id, StreamHalf::Send);
                }
            }
        }
    }

    /// Whether any stream data is queued, regardless of control frames
    pub(crate) fn can_send_stream_data(&self) -> bool {
        // Reset streams may linger in the pending stream list, but will never produce stream frames
        self.pending.iter().any(|level| {
            level
                .queue
                .borrow()
                .iter()
                .any(|id| self.send.get(id).is_some_and(|s| !s.is_reset()))
        })
    }

    /// Whether MAX_STREAM_DATA frames could be sent for stream `id`
    pub(crate) fn can_send_flow_control(&self, id: StreamId) -> bool {
        self.recv
            .get(&id)
            .is_some_and(|s| s.receiving_unknown_size())
    }

    /// Write pending control frames, in decreasing priority: window updates
    /// first, stream aborts after
    pub(crate) fn write_control_frames(
        &mut self,
        buf: &mut Vec<u8>,
        pending: &mut Retransmits,
        retransmits: &mut ThinRetransmits,
        stats: &mut FrameStats,
        max_size: usize,
    ) {
        // MAX_DATA
        if pending.max_data && buf.len() + 9 < max_size {
            pending.max_data = false;

            // `local_max_data` can grow bigger than `VarInt`.
            // For transmission inside QUIC frames we need to clamp it to the
            // maximum allowed `VarInt` size.
            let max = VarInt::try_from(self.local_max_data).unwrap_or(VarInt::MAX);

            trace!(value = max.into_inner(), "MAX_DATA");
            if max > self.sent_max_data {
                // Record that a `MAX_DATA` announcing a certain window was sent. This will
                // suppress enqueuing further `MAX_DATA` frames unless either the previous
                // transmission was not acknowledged or the window further increased.
                self.sent_max_data = max;
            }

            retransmits.get_or_create().max_data = true;
            buf.write(FrameType::MAX_DATA);
            buf.write(max);
            stats.max_data += 1;
        }

        // MAX_STREAM_DATA
        while buf.len() + 17 < max_size {
            let id = match pending.max_stream_data.iter().next() {
                Some(x) => *x,
                None => break,
            };
            pending.max_stream_data.remove(&id);
            let rs = match self.recv.get_mut(&id) {
                Some(x) => x,
                None => continue,
            };
            if !rs.receiving_unknown_size() {
                continue;
            }
            retransmits.get_or_create().max_stream_data.insert(id);

            let (max, _) = rs.max_stream_data(self.stream_receive_window);
            rs.record_sent_max_stream_data(max);

            trace!(stream = %id, max, "MAX_STREAM_DATA");
            buf.write(FrameType::MAX_STREAM_DATA);
            buf.write(id);
            buf.write_var(max);
            stats.max_stream_data += 1;
        }

        // MAX_STREAMS
        for dir in Dir::iter() {
            if !self.max_streams_dirty[dir as usize] || buf.len() + 9 >= max_size {
                continue;
            }
            self.max_streams_dirty[dir as usize] = false;
            match dir {
                Dir::Uni => {
                    retransmits.get_or_create().max_uni_stream_id = true;
                    buf.write(FrameType::MAX_STREAMS_UNI);
                    stats.max_streams_uni += 1;
                }
                Dir::Bi => {
                    retransmits.get_or_create().max_bi_stream_id = true;
                    buf.write(FrameType::MAX_STREAMS_BIDI);
                    stats.max_streams_bidi += 1;
                }
            }
            trace!(value = self.max_remote[dir as usize], "MAX_STREAMS ({dir})");
            buf.write_var(self.max_remote[dir as usize]);
        }

        // RESET_STREAM
        while buf.len() + frame::ResetStream::SIZE_BOUND < max_size {
            let (id, error_code) = match pending.reset_stream.pop() {
                Some(x) => x,
                None => break,
            };
            let stream = match self.send.get_mut(&id) {
                Some(x) => x,
                None => continue,
            };
            trace!(stream = %id, "RESET_STREAM");
            retransmits
                .get_or_create()
                .reset_stream
                .push((id, error_code));
            frame::ResetStream {
                id,
                error_code,
                final_offset: VarInt::try_from(stream.offset()).expect("impossibly large offset"),
            }
            .encode(buf);
            stats.reset_stream += 1;
        }

        // STOP_SENDING
        while buf.len() + frame::StopSending::SIZE_BOUND < max_size {
            let frame = match pending.stop_sending.pop() {
                Some(x) => x,
                None => break,
            };
            // We may need to transmit STOP_SENDING even for streams whose state we have discarded,
            // because we are able to discard local state for stopped streams immediately upon
            // receiving FIN, even if the peer still has arbitrarily large amounts of data to
            // (re)transmit due to loss or unconventional sending strategy.
            trace!(stream = %frame.id, "STOP_SENDING");
            frame.encode(buf);
            retransmits.get_or_create().stop_sending.push(frame);
            stats.stop_sending += 1;
        }
    }

    /// Write DATA_BLOCKED/STREAM_DATA_BLOCKED/STREAMS_BLOCKED, the packer's
    /// lowest-priority frames
    pub(crate) fn write_blocked_frames(
        &mut self,
        buf: &mut Vec<u8>,
        pending: &mut Retransmits,
        stats: &mut FrameStats,
        max_size: usize,
    ) {
        // DATA_BLOCKED
        if let Some(offset) = pending.data_blocked {
            if buf.len() + 9 < max_size {
                pending.data_blocked = None;
                trace!(offset, "DATA_BLOCKED");
                buf.write(FrameType::DATA_BLOCKED);
                buf.write_var(offset);
                stats.data_blocked += 1;
            }
        }

        // STREAM_DATA_BLOCKED
        while buf.len() + 17 < max_size {
            let (id, offset) = match pending.stream_data_blocked.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(stream = %id, offset, "STREAM_DATA_BLOCKED");
            buf.write(FrameType::STREAM_DATA_BLOCKED);
            buf.write(id);
            buf.write_var(offset);
            stats.stream_data_blocked += 1;
        }

        // STREAMS_BLOCKED
        for dir in Dir::iter() {
            if !pending.streams_blocked[dir as usize] || buf.len() + 9 >= max_size {
                continue;
            }
            pending.streams_blocked[dir as usize] = false;
            trace!(limit = self.max[dir as usize], "STREAMS_BLOCKED ({dir})");
            buf.write(match dir {
                Dir::Bi => FrameType::STREAMS_BLOCKED_BIDI,
                Dir::Uni => FrameType::STREAMS_BLOCKED_UNI,
            });
            buf.write_var(self.max[dir as usize]);
            stats.streams_blocked(dir);
        }
    }

    /// Write STREAM frames, round-robining over pending streams of the highest priority
    pub(crate) fn write_stream_frames(
        &mut self,
        buf: &mut Vec<u8>,
        max_buf_size: usize,
    ) -> StreamMetaVec {
        let mut stream_frames = StreamMetaVec::new();
        while buf.len() + frame::Stream::SIZE_BOUND < max_buf_size {
            let num_levels = self.pending.len();
            let mut level = match self.pending.peek_mut() {
                Some(x) => x,
                None => break,
            };
            // Popping data from the front of the queue, storing as much data
            // as possible in a single frame, and enqueuing sending further
            // remaining data at the end of the queue helps with fairness.
            // Other streams will have a chance to write data before we touch
            // this stream again.
            let id = match level.queue.get_mut().pop_front() {
                Some(x) => x,
                None => {
                    debug_assert!(
                        num_levels == 1,
                        "An empty queue is only allowed for a single level"
                    );
                    break;
                }
            };
            let stream = match self.send.get_mut(&id) {
                Some(s) => s,
                // Stream was reset with pending data and the reset was acknowledged
                None => continue,
            };

            // Reset streams aren't removed from the pending list and still exist while the peer
            // hasn't acknowledged the reset, but should not generate STREAM frames, so we need to
            // check for them explicitly.
            if stream.is_reset() {
                continue;
            }

            // Now that we know the `StreamId`, we can better account for how many bytes
            // are required to encode it.
            let max_buf_size = max_buf_size - buf.len() - 1 - VarInt::from(id).size();
            let (offsets, encode_length) = stream.pending.poll_transmit(max_buf_size);
            let fin = offsets.end == stream.pending.offset()
                && matches!(stream.state, SendState::DataSent { .. });
            if fin {
                stream.fin_pending = false;
            }

            if stream.is_pending() {
                if level.priority == stream.priority {
                    // Enqueue for the same level
                    level.queue.get_mut().push_back(id);
                } else {
                    // Enqueue for a different level. If the current level is empty, drop it
                    if level.queue.borrow().is_empty() && num_levels != 1 {
                        // We keep the last level around even in empty form so that
                        // the next insert doesn't have to reallocate the queue
                        PeekMut::pop(level);
                    } else {
                        drop(level);
                    }
                    push_pending(&mut self.pending, id, stream.priority);
                }
            } else if level.queue.borrow().is_empty() && num_levels != 1 {
                // We keep the last level around even in empty form so that
                // the next insert doesn't have to reallocate the queue
                PeekMut::pop(level);
            }

            let meta = frame::StreamMeta { id, offsets, fin };
            trace!(id = %meta.id, off = meta.offsets.start, len = meta.offsets.end - meta.offsets.start, fin = meta.fin, "STREAM");
            meta.encode(encode_length, buf);

            // The range might not be retrievable in a single `get` if it is
            // stored in noncontiguous fashion in the send buffer. Therefore
            // this loop iterates until the range is fully copied into the frame.
            let mut offsets = meta.offsets.clone();
            while offsets.start != offsets.end {
                let data = stream.pending.get(offsets.clone());
                offsets.start += data.len() as u64;
                buf.put_slice(data);
            }
            stream_frames.push(meta);
        }

        stream_frames
    }

    /// Notify the application that new streams were opened or a stream became readable.
    fn on_stream_frame(&mut self, notify_readable: bool, stream: StreamId) {
        if stream.initiator() == self.side {
            // Notifying about the opening of locally-initiated streams would be redundant.
            if notify_readable {
                self.events.push_back(StreamEvent::Readable { id: stream });
            }
            return;
        }
        let next = &mut self.next_remote[stream.dir() as usize];
        if stream.index() >= *next {
            *next = stream.index() + 1;
            self.opened[stream.dir() as usize] = true;
        } else if notify_readable {
            self.events.push_back(StreamEvent::Readable { id: stream });
        }
    }

    pub(crate) fn received_ack_of(&mut self, frame: frame::StreamMeta) {
        let mut entry = match self.send.entry(frame.id) {
            hash_map::Entry::Vacant(_) => return,
            hash_map::Entry::Occupied(e) => e,
        };
        let stream = entry.get_mut();
        if stream.is_reset() {
            // We account for outstanding data on reset streams at time of reset
            return;
        }
        let id = frame.id;
        self.unacked_data -= frame.offsets.end - frame.offsets.start;
        if !stream.ack(frame) {
            // The stream is unfinished or may still need retransmits
            return;
        }

        entry.remove_entry();
        self.stream_freed(id, StreamHalf::Send);
        self.events.push_back(StreamEvent::Finished { id });
    }

    pub(crate) fn retransmit(&mut self, frame: frame::StreamMeta) {
        let stream = match self.send.get_mut(&frame.id) {
            // Loss of data on a closed stream is a noop
            None => return,
            Some(x) => x,
        };
        if !stream.is_pending() {
            push_pending(&mut self.pending, frame.id, stream.priority);
        }
        stream.fin_pending |= frame.fin;
        stream.pending.retransmit(frame.offsets);
    }

    pub(crate) fn retransmit_all_for_0rtt(&mut self) {
        for dir in Dir::iter() {
            for index in 0..self.next[dir as usize] {
                let id = StreamId::new(Side::Client, dir, index);
                let stream = self.send.get_mut(&id).unwrap();
                if stream.pending.is_fully_acked() && !stream.fin_pending {
                    // Stream data can't be acked in 0-RTT, so we must not have sent anything on
                    // this stream
                    continue;
                }
                if !stream.is_pending() {
                    push_pending(&mut self.pending, id, stream.priority);
                }
                stream.pending.retransmit_all_for_0rtt();
            }
        }
    }

    pub(crate) fn received_max_streams(
        &mut self,
        dir: Dir,
        count: u64,
    ) -> Result<(), TransportError> {
        if count > MAX_STREAM_COUNT {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "unrepresentable stream limit",
            ));
        }

        let current = &mut self.max[dir as usize];
        if count > *current {
            *current = count;
            self.events.push_back(StreamEvent::Available { dir });
        }

        Ok(())
    }

    /// Handle increase to connection-level flow control limit
    pub(crate) fn received_max_data(&mut self, n: VarInt) {
        self.max_data = self.max_data.max(n.into_inner());
    }

    pub(crate) fn received_max_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.dir() == Dir::Uni {
            debug!("got MAX_STREAM_DATA on recv-only {}", id);
            return Err(TransportError::STREAM_STATE_ERROR(
                "MAX_STREAM_DATA on recv-only stream",
            ));
        }

        let write_limit = self.write_limit();
        if let Some(ss) = self.send.get_mut(&id) {
            if ss.increase_max_data(offset) {
                if write_limit > 0 {
                    self.events.push_back(StreamEvent::Writable { id });
                } else if !ss.connection_blocked {
                    // The stream is still blocked on the connection flow control
                    // window. In order to get unblocked when the window relaxes
                    // it needs to be in the connection blocked list.
                    ss.connection_blocked = true;
                    self.connection_blocked.push(id);
                }
            }
        } else if id.initiator() == self.side && self.is_local_unopened(id) {
            debug!("got MAX_STREAM_DATA on unopened {}", id);
            return Err(TransportError::STREAM_STATE_ERROR(
                "MAX_STREAM_DATA on unopened stream",
            ));
        }

        self.on_stream_frame(false, id);
        Ok(())
    }

    /// Returns the maximum amount of data this is allowed to be written on the connection
    pub(crate) fn write_limit(&self) -> u64 {
        (self.max_data - self.data_sent).min(self.send_window - self.unacked_data)
    }

    /// Yield stream events
    pub(crate) fn poll(&mut self) -> Option<StreamEvent> {
        if let Some(dir) = Dir::iter().find(|&i| mem::replace(&mut self.opened[i as usize], false))
        {
            return Some(StreamEvent::Opened { dir });
        }

        if self.write_limit() > 0 {
            while let Some(id) = self.connection_blocked.pop() {
                let stream = match self.send.get_mut(&id) {
                    None => continue,
                    Some(s) => s,
                };

                debug_assert!(stream.connection_blocked);
                stream.connection_blocked = false;

                // If it's no longer sensible to write to a stream (even to detect an error) then
                // don't report it.
                if stream.is_writable() && stream.max_data > stream.offset() {
                    return Some(StreamEvent::Writable { id });
                }
            }
        }

        self.events.pop_front()
    }

    /// Check for errors entailed by the peer's use of `id` as a send stream
    fn validate_receive_id(&mut self, id: StreamId) -> Result<(), TransportError> {
        if self.side == id.initiator() {
            match id.dir() {
                Dir::Uni => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "illegal operation on send-only stream",
                    ));
                }
                Dir::Bi if id.index() >= self.next[Dir::Bi as usize] => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "operation on unopened stream",
                    ));
                }
                Dir::Bi => {}
            };
        } else {
            let limit = self.max_remote[id.dir() as usize];
            if id.index() >= limit {
                return Err(TransportError::STREAM_LIMIT_ERROR(""));
            }
        }
        Ok(())
    }

    /// Whether a locally initiated stream has never been open
    pub(crate) fn is_local_unopened(&self, id: StreamId) -> bool {
        id.index() >= self.next[id.dir() as usize]
    }

    pub(super) fn insert(&mut self, remote: bool, id: StreamId) {
        let bi = id.dir() == Dir::Bi;
        if bi || !remote {
            let max_data = match id.dir() {
                Dir::Uni => self.initial_max_stream_data_uni,
                // Remote/local appear reversed here because the transport parameters are named from
                // the perspective of the peer.
                Dir::Bi if remote => self.initial_max_stream_data_bidi_local,
                Dir::Bi => self.initial_max_stream_data_bidi_remote,
            };
            let stream = Send::new(max_data);
            assert!(self.send.insert(id, stream).is_none());
        }
        if bi || remote {
            assert!(self
                .recv
                .insert(id, Box::new(Recv::new(self.stream_receive_window)))
                .is_none());
        }
    }

    /// Adds credits to the connection flow control window
    ///
    /// Returns whether a `MAX_DATA` frame should be enqueued as soon as possible.
    /// This will only be the case if the window update is significant enough.
    /// As soon as a window update with a `MAX_DATA` frame has been queued,
    /// further updates are suppressed until the window increases significantly
    /// again.
    pub(super) fn add_read_credits(&mut self, credits: u64) -> ShouldTransmit {
        self.local_max_data = self.local_max_data.saturating_add(credits);

        if self.local_max_data > VarInt::MAX.into_inner() {
            return ShouldTransmit(false);
        }

        // Only announce a window update if it's significant enough to make it
        // worthwhile sending a MAX_DATA frame, a quarter of the window
        let diff = self.local_max_data - self.sent_max_data.into_inner();
        ShouldTransmit(diff >= (self.receive_window / 4))
    }

    /// Account for a stream being fully retired, reopening the peer's window
    pub(super) fn stream_freed(&mut self, id: StreamId, half: StreamHalf) {
        if id.initiator() != self.side {
            let fully_free = id.dir() == Dir::Uni
                || match half {
                    StreamHalf::Send => !self.recv.contains_key(&id),
                    StreamHalf::Recv => !self.send.contains_key(&id),
                };
            if fully_free {
                // Make room for the peer to open another stream, and pre-provision its state so
                // frames for it can be validated cheaply
                let dir = id.dir();
                self.insert(true, StreamId::new(!self.side, dir, self.max_remote[dir as usize]));
                self.max_remote[dir as usize] += 1;
                self.max_streams_dirty[dir as usize] = true;
            }
        }
        if half == StreamHalf::Send {
            self.send_streams -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::streams::{RecvStream, SendStream, Streams, WriteError};
    use crate::connection::State as ConnState;
    use bytes::Bytes;

    fn make(side: Side) -> StreamsState {
        StreamsState::new(
            side,
            128u32.into(),
            128u32.into(),
            1024 * 1024,
            VarInt::from_u32(1024 * 1024),
            VarInt::from_u32(65536),
        )
    }

    fn params() -> TransportParameters {
        TransportParameters {
            initial_max_data: VarInt::from_u32(1024 * 1024),
            initial_max_streams_bidi: VarInt::from_u32(32),
            initial_max_streams_uni: VarInt::from_u32(32),
            initial_max_stream_data_bidi_local: VarInt::from_u32(65536),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(65536),
            initial_max_stream_data_uni: VarInt::from_u32(65536),
            ..TransportParameters::default()
        }
    }

    #[test]
    fn recv_on_send_only_stream_rejected() {
        let mut server = make(Side::Server);
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        let err = server
            .received(
                frame::Stream {
                    id,
                    offset: 0,
                    fin: false,
                    data: Bytes::from_static(b"hi"),
                },
                2,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_STATE_ERROR);
    }

    #[test]
    fn stream_limit_enforced() {
        let mut server = make(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 128); // limit is 128, ids 0..=127
        let err = server
            .received(
                frame::Stream {
                    id,
                    offset: 0,
                    fin: false,
                    data: Bytes::new(),
                },
                0,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
    }

    #[test]
    fn flow_control_violation_detected() {
        let mut server = make(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        // stream_receive_window is 65536; offset+len exceeding it is fatal
        let err = server
            .received(
                frame::Stream {
                    id,
                    offset: 65536,
                    fin: false,
                    data: Bytes::from_static(b"!"),
                },
                1,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn final_size_must_be_consistent() {
        let mut server = make(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        server
            .received(
                frame::Stream {
                    id,
                    offset: 0,
                    fin: true,
                    data: Bytes::from_static(b"abc"),
                },
                3,
            )
            .unwrap();
        let err = server
            .received(
                frame::Stream {
                    id,
                    offset: 3,
                    fin: true,
                    data: Bytes::from_static(b"d"),
                },
                1,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn remote_stream_opens_are_reported_in_order() {
        let mut server = make(Side::Server);
        // Peer opens stream 2 first; 0..=2 all become open
        server
            .received(
                frame::Stream {
                    id: StreamId::new(Side::Client, Dir::Uni, 2),
                    offset: 0,
                    fin: false,
                    data: Bytes::from_static(b"x"),
                },
                1,
            )
            .unwrap();
        assert_eq!(
            server.poll(),
            Some(StreamEvent::Opened { dir: Dir::Uni })
        );
        let mut pending = Retransmits::default();
        let state = ConnState::Established;
        let mut streams = Streams {
            state: &mut server,
            pending: &mut pending,
            conn_state: &state,
        };
        assert_eq!(
            streams.accept(Dir::Uni),
            Some(StreamId::new(Side::Client, Dir::Uni, 0))
        );
        assert_eq!(
            streams.accept(Dir::Uni),
            Some(StreamId::new(Side::Client, Dir::Uni, 1))
        );
        assert_eq!(
            streams.accept(Dir::Uni),
            Some(StreamId::new(Side::Client, Dir::Uni, 2))
        );
        assert_eq!(streams.accept(Dir::Uni), None);
    }

    #[test]
    fn max_streams_issued_as_streams_retire() {
        let mut server = make(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        server
            .received(
                frame::Stream {
                    id,
                    offset: 0,
                    fin: true,
                    data: Bytes::from_static(b"bye"),
                },
                3,
            )
            .unwrap();
        let before = server.max_remote[Dir::Uni as usize];

        // Read everything out, closing the stream
        let mut pending = Retransmits::default();
        let mut rs = RecvStream {
            id,
            state: &mut server,
            pending: &mut pending,
        };
        let chunk = rs.read(usize::MAX).unwrap().unwrap();
        assert_eq!(&chunk.bytes[..], b"bye");
        assert!(rs.read(usize::MAX).unwrap().is_none());

        assert_eq!(server.max_remote[Dir::Uni as usize], before + 1);
        assert!(server.max_streams_dirty[Dir::Uni as usize]);
    }

    #[test]
    fn write_blocked_by_stream_flow_control() {
        let mut client = make(Side::Client);
        client.set_params(&TransportParameters {
            initial_max_stream_data_uni: VarInt::from_u32(4),
            ..params()
        });
        let state = ConnState::Established;
        let mut pending = Retransmits::default();
        let mut streams = Streams {
            state: &mut client,
            pending: &mut pending,
            conn_state: &state,
        };
        let id = streams.open(Dir::Uni).unwrap();
        let mut ss = SendStream {
            id,
            state: &mut client,
            pending: &mut pending,
            conn_state: &state,
        };
        assert_eq!(ss.write(b"hello world").unwrap(), 4);
        assert_eq!(ss.write(b"o world"), Err(WriteError::Blocked));
        // The stall was recorded for a STREAM_DATA_BLOCKED frame
        assert_eq!(pending.stream_data_blocked, vec![(id, 4)]);
    }

    #[test]
    fn open_blocked_by_stream_count() {
        let mut client = make(Side::Client);
        let mut p = params();
        p.initial_max_streams_uni = VarInt::from_u32(1);
        client.set_params(&p);
        let state = ConnState::Established;
        let mut pending = Retransmits::default();
        let mut streams = Streams {
            state: &mut client,
            pending: &mut pending,
            conn_state: &state,
        };
        assert!(streams.open(Dir::Uni).is_some());
        assert!(streams.open(Dir::Uni).is_none());
        assert!(pending.streams_blocked[Dir::Uni as usize]);
        // MAX_STREAMS lifts the limit
        client.received_max_streams(Dir::Uni, 2).unwrap();
        assert_eq!(
            client.poll(),
            Some(StreamEvent::Available { dir: Dir::Uni })
        );
    }

    #[test]
    fn round_robin_fairness() {
        let mut client = make(Side::Client);
        client.set_params(&params());
        let state = ConnState::Established;
        let mut pending = Retransmits::default();
        let mut streams = Streams {
            state: &mut client,
            pending: &mut pending,
            conn_state: &state,
        };
        let a = streams.open(Dir::Uni).unwrap();
        let b = streams.open(Dir::Uni).unwrap();
        for &id in &[a, b] {
            let mut ss = SendStream {
                id,
                state: &mut client,
                pending: &mut pending,
                conn_state: &state,
            };
            ss.write(&[0x42; 2000]).unwrap();
        }

        // A packet's worth of data from each in turn
        let mut buf = Vec::new();
        let metas = client.write_stream_frames(&mut buf, 1100);
        let first: Vec<StreamId> = metas.iter().map(|m| m.id).collect();
        let mut buf = Vec::new();
        let metas = client.write_stream_frames(&mut buf, 1100);
        let second: Vec<StreamId> = metas.iter().map(|m| m.id).collect();
        assert_eq!(first, vec![a]);
        assert_eq!(second, vec![b]);
    }
}
