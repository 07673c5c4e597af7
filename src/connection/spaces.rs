use std::{
    cmp,
    collections::{BTreeMap, VecDeque},
    mem,
    ops::{Index, IndexMut},
    time::{Duration, Instant},
};

use rustc_hash::FxHashSet;

use super::assembler::Assembler;
use super::streams::StreamsState;
use crate::{
    crypto::Keys, frame, packet::SpaceId, range_set::ArrayRangeSet, shared::IssuedCid, Dir,
    StreamId, VarInt,
};

pub(super) struct PacketSpace {
    pub(super) crypto: Option<Keys>,
    pub(super) dedup: Dedup,
    /// Highest received packet number
    pub(super) rx_packet: u64,

    /// Data to send
    pub(super) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(super) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent, if any
    pub(super) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    pub(super) largest_acked_packet_sent: Instant,
    /// Transmitted but not acked
    // We use a BTreeMap here so we can efficiently query by range on ACK and for loss detection
    pub(super) sent_packets: BTreeMap<u64, SentPacket>,
    /// Number of explicit congestion notification codepoints seen on incoming packets
    pub(super) ecn_counters: frame::EcnCounts,
    /// Recent ECN counters sent by the peer in ACK frames
    ///
    /// Updated (and inspected) whenever we receive an ACK with a new highest acked packet
    /// number. Stored per-space to simplify verification, which would otherwise have difficulty
    /// distinguishing between ECN bleaching and counts having been updated by a near-simultaneous
    /// ACK already processed in another space.
    pub(super) ecn_feedback: frame::EcnCounts,

    /// Incoming cryptographic handshake stream
    pub(super) crypto_stream: Assembler,
    /// Current offset of outgoing cryptographic handshake stream
    pub(super) crypto_offset: u64,

    /// The time the most recently sent retransmittable packet was sent.
    pub(super) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// The time at which the earliest sent packet in this space will be considered lost based on
    /// exceeding the reordering window in time. Only set for packets numbered prior to a packet
    /// that has been acknowledged.
    pub(super) loss_time: Option<Instant>,
    /// Number of tail loss probes to send
    pub(super) loss_probes: u32,
    pub(super) ping_pending: bool,
}

impl PacketSpace {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,

            pending: Retransmits::default(),
            pending_acks: PendingAcks::default(),

            next_packet_number: 0,
            largest_acked_packet: None,
            largest_acked_packet_sent: now,
            sent_packets: BTreeMap::new(),
            ecn_counters: frame::EcnCounts::ZERO,
            ecn_feedback: frame::EcnCounts::ZERO,

            crypto_stream: Assembler::new(),
            crypto_offset: 0,

            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            loss_probes: 0,
            ping_pending: false,
        }
    }

    /// Queue data for a tail loss probe (or anti-amplification deadlock prevention) packet
    ///
    /// Probes are sent similarly to normal packets when an expected ACK has not arrived. We never
    /// deem a packet lost until we receive an ACK that should have included it, but if a trailing
    /// run of packets (or their ACKs) are lost, this might not happen in a timely fashion. We send
    /// probe packets to force an ACK, and exempt them from congestion control to prevent a deadlock
    /// when the congestion window is filled with lost tail packets.
    ///
    /// We prefer to send new data, to make the most efficient use of bandwidth. If there's no data
    /// waiting to be sent, then we retransmit in-flight data to reduce odds of loss. If there's no
    /// in-flight data either, we're probably a client guarding against a handshake
    /// anti-amplification deadlock and we just make something up.
    pub(super) fn maybe_queue_probe(&mut self, streams: &StreamsState) {
        if self.loss_probes == 0 {
            return;
        }

        if !self.pending.is_empty(streams) {
            // There's real data to send here, no need to make something up
            return;
        }

        for packet in self.sent_packets.values_mut() {
            if !packet.retransmits.is_empty(streams) {
                // Remove retransmitted data from the old packet so we don't end up retransmitting
                // it *again* even if the copy we're sending now gets acknowledged.
                self.pending |= mem::take(&mut packet.retransmits);
                return;
            }
        }

        // Nothing new to send and nothing to retransmit, so fall back on a ping. This should only
        // happen in rare cases during the handshake when the server becomes blocked by
        // anti-amplification.
        self.ping_pending = true;
    }

    pub(super) fn get_tx_number(&mut self) -> u64 {
        // TODO: Handle packet number overflow gracefully
        assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    pub(super) fn can_send(&self, streams: &StreamsState) -> SendableFrames {
        let acks = self.pending_acks.can_send();
        let other = !self.pending.is_empty(streams) || self.ping_pending;

        SendableFrames { acks, other }
    }

    /// Verifies sanity of an ECN block and returns whether congestion was encountered.
    pub(super) fn detect_ecn(
        &mut self,
        newly_acked: u64,
        ecn: frame::EcnCounts,
    ) -> Result<bool, &'static str> {
        let ect0_increase = ecn
            .ect0
            .checked_sub(self.ecn_feedback.ect0)
            .ok_or("peer ECT(0) count regression")?;
        let ect1_increase = ecn
            .ect1
            .checked_sub(self.ecn_feedback.ect1)
            .ok_or("peer ECT(1) count regression")?;
        let ce_increase = ecn
            .ce
            .checked_sub(self.ecn_feedback.ce)
            .ok_or("peer CE count regression")?;
        let total_increase = ect0_increase + ect1_increase + ce_increase;
        if total_increase < newly_acked {
            return Err("ECN bleaching");
        }
        if (ect0_increase + ce_increase) < newly_acked || ect1_increase != 0 {
            return Err("ECN corruption");
        }
        // If total_increase > newly_acked (which happens when ACKs are lost), this is required by
        // the RFC so that long-term drift does not occur. If =, then the only question is whether
        // to count CE packets as CE or ECT0. Recording them as CE is more consistent and keeps the
        // congestion check obvious.
        self.ecn_feedback = ecn;
        Ok(ce_increase != 0)
    }

    pub(super) fn sent(&mut self, number: u64, packet: SentPacket) {
        self.sent_packets.insert(number, packet);
    }

    pub(super) fn take(&mut self, number: u64) -> Option<SentPacket> {
        self.sent_packets.remove(&number)
    }

    pub(super) fn has_in_flight(&self) -> bool {
        !self.sent_packets.is_empty()
    }

    /// Stop tracking sent packets entirely, e.g. when keys are discarded
    pub(super) fn drain_sent(&mut self) -> impl Iterator<Item = (u64, SentPacket)> {
        mem::take(&mut self.sent_packets).into_iter()
    }
}

impl Index<SpaceId> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [PacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.as_mut()[space as usize]
    }
}

/// Record of a transmitted packet, retained until acknowledged or declared lost
#[derive(Debug, Clone)]
pub(super) struct SentPacket {
    /// The time the packet was sent.
    pub(super) time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP overhead, but including QUIC
    /// framing overhead. Zero if this packet is not counted towards congestion control, i.e. not an
    /// "in flight" packet.
    pub(super) size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet.
    pub(super) ack_eliciting: bool,
    /// The largest packet number acknowledged by an ACK frame carried in this packet
    ///
    /// ACK frames themselves are never retransmitted; instead, the tracker stops re-advertising
    /// numbers at or below this once the packet is acknowledged.
    pub(super) largest_acked: Option<u64>,
    /// Data which needs to be retransmitted in case the packet is lost.
    /// The data is boxed to minimize `SentPacket` size for the typical case of
    /// packets only containing ACKs and STREAM frames.
    pub(super) retransmits: ThinRetransmits,
    /// Metadata for stream frames in a packet
    ///
    /// The actual application data is stored with the stream state.
    pub(super) stream_frames: frame::StreamMetaVec,
}

/// Retransmittable data queue
#[derive(Debug, Default, Clone)]
pub(super) struct Retransmits {
    pub(super) max_data: bool,
    pub(super) max_uni_stream_id: bool,
    pub(super) max_bi_stream_id: bool,
    pub(super) reset_stream: Vec<(StreamId, VarInt)>,
    pub(super) stop_sending: Vec<frame::StopSending>,
    pub(super) max_stream_data: FxHashSet<StreamId>,
    pub(super) crypto: VecDeque<frame::Crypto>,
    pub(super) new_cids: Vec<IssuedCid>,
    pub(super) retire_cids: Vec<u64>,
    pub(super) handshake_done: bool,
    /// Offset to announce in a DATA_BLOCKED frame, if the connection window stalled us
    pub(super) data_blocked: Option<u64>,
    /// Streams (with stalled offsets) to announce in STREAM_DATA_BLOCKED frames
    pub(super) stream_data_blocked: Vec<(StreamId, u64)>,
    /// Directions in which the peer's stream count limit stalled an open
    pub(super) streams_blocked: [bool; 2],
}

impl Retransmits {
    pub(super) fn is_empty(&self, streams: &StreamsState) -> bool {
        !self.max_data
            && !self.max_uni_stream_id
            && !self.max_bi_stream_id
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self
                .max_stream_data
                .iter()
                .all(|&id| !streams.can_send_flow_control(id))
            && self.crypto.is_empty()
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
            && !self.handshake_done
            && self.data_blocked.is_none()
            && self.stream_data_blocked.is_empty()
            && !self.streams_blocked.iter().any(|&x| x)
    }
}

impl ::std::ops::BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        // We reduce in-stream head-of-line blocking by queueing retransmits before other data for
        // STREAM and CRYPTO frames.
        self.max_data |= rhs.max_data;
        self.max_uni_stream_id |= rhs.max_uni_stream_id;
        self.max_bi_stream_id |= rhs.max_bi_stream_id;
        self.reset_stream.extend_from_slice(&rhs.reset_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        for crypto in rhs.crypto.into_iter().rev() {
            self.crypto.push_front(crypto);
        }
        self.new_cids.extend(&rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
        self.handshake_done |= rhs.handshake_done;
        self.data_blocked = self.data_blocked.max(rhs.data_blocked);
        self.stream_data_blocked
            .extend_from_slice(&rhs.stream_data_blocked);
        self.streams_blocked[Dir::Bi as usize] |= rhs.streams_blocked[Dir::Bi as usize];
        self.streams_blocked[Dir::Uni as usize] |= rhs.streams_blocked[Dir::Uni as usize];
    }
}

impl ::std::ops::BitOrAssign<ThinRetransmits> for Retransmits {
    fn bitor_assign(&mut self, rhs: ThinRetransmits) {
        if let Some(retransmits) = rhs.retransmits {
            self.bitor_assign(*retransmits)
        }
    }
}

/// A variant of `Retransmits` which only allocates storage when required
#[derive(Debug, Default, Clone)]
pub(super) struct ThinRetransmits {
    retransmits: Option<Box<Retransmits>>,
}

impl ThinRetransmits {
    /// Returns `true` if no retransmits are necessary
    pub(super) fn is_empty(&self, streams: &StreamsState) -> bool {
        match &self.retransmits {
            Some(retransmits) => retransmits.is_empty(streams),
            None => true,
        }
    }

    /// Returns a reference to the retransmits stored in this box
    pub(super) fn get(&self) -> Option<&Retransmits> {
        self.retransmits.as_deref()
    }

    /// Returns a mutable reference to the stored retransmits
    ///
    /// This function will allocate a backing storage if required.
    pub(super) fn get_or_create(&mut self) -> &mut Retransmits {
        if self.retransmits.is_none() {
            self.retransmits = Some(Box::default());
        }
        self.retransmits.as_deref_mut().unwrap()
    }
}

/// RFC4303-style sliding window packet number deduplicator.
///
/// A contiguous bitfield, where each bit corresponds to a packet number and the rightmost bit is
/// always set. A set bit represents a packet that has been successfully authenticated. Bits left of
/// the window are assumed to be set.
///
/// ```text
/// ...xxxxxxxxx 1 0
///     ^        ^ ^
/// window highest next
/// ```
pub(super) struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated.
    next: u64,
}

/// Inner bitfield type.
///
/// Because QUIC never reuses packet numbers, this only needs to be large enough to deal with
/// packets that are reordered but still delivered in a timely manner.
type Window = u128;

/// Number of packets tracked by `Dedup`.
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    /// Construct an empty window positioned at the start.
    pub(super) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated.
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub(super) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}

/// Indicates which data is available for sending
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) struct SendableFrames {
    pub(super) acks: bool,
    pub(super) other: bool,
}

impl SendableFrames {
    /// Whether no data is sendable
    pub(super) fn is_empty(&self) -> bool {
        !self.acks && !self.other
    }
}

/// Bookkeeping for packets received from the peer and not yet acknowledged
#[derive(Debug, Default)]
pub(super) struct PendingAcks {
    /// Whether an ACK frame should be sent at the next opportunity
    immediate: bool,
    /// Number of ack-eliciting packets received since an ACK frame was last sent
    eliciting_since_ack: u64,
    /// When the oldest ack-eliciting packet not covered by a sent ACK arrived
    earliest_unacked: Option<Instant>,
    /// When the packet with the largest number so far was received
    largest_received_time: Option<Instant>,
    /// The ranges the next ACK frame will advertise
    ranges: ArrayRangeSet,
}

impl PendingAcks {
    /// ACK at the latest after every second ack-eliciting packet
    const ACK_ELICITING_THRESHOLD: u64 = 2;

    /// Record receipt of an authenticated packet
    ///
    /// Returns whether the max-ack-delay timer should be armed (first
    /// outstanding ack-eliciting packet in the application space).
    pub(super) fn packet_received(
        &mut self,
        number: u64,
        now: Instant,
        ack_eliciting: bool,
        space: SpaceId,
    ) -> bool {
        if self.ranges.max().map_or(true, |m| number > m) {
            self.largest_received_time = Some(now);
        }
        self.ranges.insert_one(number);
        if self.ranges.len() > MAX_ACK_BLOCKS {
            self.ranges.pop_min();
        }

        if !ack_eliciting {
            return false;
        }

        self.eliciting_since_ack += 1;
        let mut arm_timer = false;
        if space != SpaceId::Data
            || self.eliciting_since_ack >= Self::ACK_ELICITING_THRESHOLD
        {
            // The handshake spaces acknowledge every packet so the peer's RTT
            // estimate converges quickly
            self.immediate = true;
        } else if self.earliest_unacked.is_none() {
            arm_timer = true;
        }
        if self.earliest_unacked.is_none() {
            self.earliest_unacked = Some(now);
        }
        arm_timer
    }

    /// Whether an ACK frame can be sent right now
    pub(super) fn can_send(&self) -> bool {
        self.immediate && !self.ranges.is_empty()
    }

    /// The max-ack-delay timer fired; release the delayed ACK
    pub(super) fn on_max_ack_delay(&mut self) {
        if self.eliciting_since_ack > 0 {
            self.immediate = true;
        }
    }

    /// Called whenever an ACK frame was transmitted
    pub(super) fn acks_sent(&mut self) {
        self.immediate = false;
        self.eliciting_since_ack = 0;
        self.earliest_unacked = None;
    }

    /// The delay between receipt of the largest packet and `now`, for the ACK frame's delay field
    pub(super) fn ack_delay(&self, now: Instant) -> Duration {
        self.largest_received_time
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t))
    }

    /// Stop advertising packet numbers at or below `largest_acked`
    ///
    /// Once the peer has confirmed receipt of an ACK, re-advertising the
    /// numbers it covered would only waste bytes.
    pub(super) fn subtract_below(&mut self, largest_acked: u64) {
        self.ranges.subtract_below(largest_acked + 1);
    }

    /// Returns the set of currently pending ACK ranges
    pub(super) fn ranges(&self) -> &ArrayRangeSet {
        &self.ranges
    }
}

/// Ensures we can always fit all our ACKs in a single minimum-MTU packet with room to spare
const MAX_ACK_BLOCKS: usize = 64;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dedup_sanity() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert_eq!(dedup.next, 1);
        assert_eq!(dedup.window, 0b1);
        assert!(dedup.insert(0));
        assert_eq!(dedup.next, 1);
        assert_eq!(dedup.window, 0b1);
        assert!(!dedup.insert(1));
        assert_eq!(dedup.next, 2);
        assert_eq!(dedup.window, 0b11);
        assert!(!dedup.insert(2));
        assert_eq!(dedup.next, 3);
        assert_eq!(dedup.window, 0b111);
        assert!(!dedup.insert(4));
        assert_eq!(dedup.next, 5);
        assert_eq!(dedup.window, 0b11110);
        assert!(!dedup.insert(7));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_0100);
        assert!(dedup.insert(4));
        assert!(!dedup.insert(3));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1100);
        assert!(!dedup.insert(6));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1101);
        assert!(!dedup.insert(5));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1111);
    }

    #[test]
    fn dedup_happypath() {
        let mut dedup = Dedup::new();
        for i in 0..(2 * WINDOW_SIZE) {
            assert!(!dedup.insert(i));
            for j in 0..=i {
                assert!(dedup.insert(j));
            }
        }
    }

    #[test]
    fn dedup_jump() {
        let mut dedup = Dedup::new();
        dedup.insert(2 * WINDOW_SIZE);
        assert!(dedup.insert(WINDOW_SIZE));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 0);
        assert!(!dedup.insert(WINDOW_SIZE + 1));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 1 << (WINDOW_SIZE - 2));
    }

    #[test]
    fn ack_after_second_eliciting_packet() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        let arm = acks.packet_received(0, now, true, SpaceId::Data);
        assert!(arm, "first eliciting packet arms the delay timer");
        assert!(!acks.can_send());
        let arm = acks.packet_received(1, now, true, SpaceId::Data);
        assert!(!arm);
        assert!(acks.can_send(), "second eliciting packet forces an ACK");
        acks.acks_sent();
        assert!(!acks.can_send());
    }

    #[test]
    fn non_eliciting_packets_never_force_ack() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        for n in 0..10 {
            assert!(!acks.packet_received(n, now, false, SpaceId::Data));
        }
        assert!(!acks.can_send());
        acks.on_max_ack_delay();
        assert!(!acks.can_send());
    }

    #[test]
    fn delay_timer_releases_ack() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, true, SpaceId::Data);
        assert!(!acks.can_send());
        acks.on_max_ack_delay();
        assert!(acks.can_send());
    }

    #[test]
    fn handshake_spaces_ack_immediately() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, true, SpaceId::Initial);
        assert!(acks.can_send());
    }

    #[test]
    fn subtract_below_stops_readvertising() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        for n in [0, 1, 2, 5] {
            acks.packet_received(n, now, true, SpaceId::Data);
        }
        acks.subtract_below(2);
        assert_eq!(&acks.ranges().iter().collect::<Vec<_>>()[..], [5..6]);
    }

    #[test]
    fn sent_packet_size() {
        // The tracking state of sent packets should be minimal, and not grow
        // over time.
        assert!(std::mem::size_of::<SentPacket>() <= 128);
    }
}
