use std::{
    cmp,
    collections::VecDeque,
    convert::TryFrom,
    fmt, mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    cid_queue::{CidQueue, InsertError},
    coding::BufMutExt,
    config::{ClientConfig, ConnectionIdGenerator, ServerConfig, TransportConfig},
    congestion::Controller,
    crypto::{self, KeyPair, Keys, PacketKey, Session},
    frame::{self, Close, ConnectionClose, Frame, FrameStruct, FrameType, NewConnectionId},
    packet::{Header, Packet, PartialDecode, SpaceId},
    range_set::ArrayRangeSet,
    shared::{ConnectionId, EcnCodepoint, IssuedCid},
    ticket::{SessionTicket, TicketStore},
    transport_parameters::{self, TransportParameters},
    ConnectError, Dir, Side, StreamId, Transmit, TransportError, TransportErrorCode, VarInt,
    INITIAL_MTU, MAX_CID_SIZE, MIN_INITIAL_SIZE, TIMER_GRANULARITY,
};

mod assembler;
pub use assembler::Chunk;

mod cid_state;
use cid_state::CidState;

mod pacing;

mod packet_builder;
use packet_builder::PacketBuilder;

mod packet_crypto;
use packet_crypto::{PrevCrypto, ZeroRttCrypto};

mod paths;
pub use paths::RttEstimator;
use paths::{PathData, PathResponses};

mod send_buffer;

mod spaces;
use spaces::{PacketSpace, SendableFrames, SentPacket, ThinRetransmits};

mod stats;
pub use stats::{ConnectionStats, FrameStats, PathStats, UdpStats};

mod streams;
pub(crate) use streams::StreamsState;
pub use streams::{
    ClosedStream, FinishError, ReadError, RecvStream, SendStream, StreamEvent, Streams, WriteError,
};

mod timer;
pub use timer::Timer;
use timer::TimerTable;

/// Protocol state and logic for a single QUIC connection
///
/// Objects of this type receive datagrams via [`handle_datagram`](Self::handle_datagram), timeouts
/// via [`handle_timeout`](Self::handle_timeout), and application commands through the
/// [`Streams`]/[`SendStream`]/[`RecvStream`] facades. To make progress, the caller drains
/// [`poll_transmit`](Self::poll_transmit) for datagrams to put on the wire,
/// [`poll_timeout`](Self::poll_timeout) for the next required wakeup, and [`poll`](Self::poll) for
/// application-facing events, after every batch of inputs. No I/O or clocks are touched in here;
/// time is whatever monotonic `Instant`s the caller passes in.
pub struct Connection {
    config: Arc<TransportConfig>,
    side: ConnectionSide,
    rng: StdRng,
    crypto: Box<dyn crypto::Session>,
    cid_generator: Arc<dyn ConnectionIdGenerator>,
    /// The CID we initially chose, for use during the handshake
    handshake_cid: ConnectionId,
    /// The CID the peer initially chose, for use during the handshake
    rem_handshake_cid: ConnectionId,
    /// The destination CID of this connection's very first Initial packet
    ///
    /// The initial-epoch keys hang off this, and both sides authenticate it via transport
    /// parameters.
    initial_dst_cid: ConnectionId,
    /// The source CID of a Retry packet we acted upon, to be validated in transport parameters
    retry_src_cid: Option<ConnectionId>,
    /// Token carried in outgoing Initial packets, from a session ticket or a Retry
    initial_token: Bytes,
    path: PathData,
    state: State,
    zero_rtt_crypto: Option<ZeroRttCrypto>,
    key_phase: bool,
    /// 1-RTT keys of the key phase before the current one, retained briefly across updates
    prev_crypto: Option<PrevCrypto>,
    /// 1-RTT keys to be used for the next key phase
    next_crypto: Option<KeyPair<Box<dyn PacketKey>>>,
    accepted_0rtt: bool,
    /// Transport parameters the peer supplied during the handshake
    peer_params: TransportParameters,
    /// Negotiated idle timeout
    idle_timeout: Option<Duration>,
    timers: TimerTable,
    /// Earliest instant a locally-initiated key update may next be started
    key_update_allowed_at: Option<Instant>,

    //
    // Queued non-primitive state
    //
    events: VecDeque<Event>,

    //
    // Loss detection and congestion state
    //
    spaces: [PacketSpace; 3],
    /// Highest usable packet number space
    highest_space: SpaceId,
    /// 1-RTT keys used prior to a key update
    pto_count: u32,
    /// Whether the last `poll_transmit` call ended with no packets to send because of congestion
    app_limited: bool,

    //
    // Closing
    //
    /// Whether an outgoing close packet is (still) owed to the peer
    close: bool,
    /// The reason the connection was lost, if it has been
    error: Option<ConnectionError>,

    //
    // Sub-state machines
    //
    streams: StreamsState,
    local_cid_state: CidState,
    rem_cids: CidQueue,
    path_responses: PathResponses,
    stats: ConnectionStats,

    /// 1-RTT packets received before the handshake completed, replayed afterwards
    early_1rtt: Vec<(u64, SocketAddr, Packet)>,
    /// Whether the idle timer should be reset the next time an ack-eliciting packet is transmitted
    permit_idle_reset: bool,
    /// Number of packets authenticated on this connection so far
    total_authed_packets: u64,
    /// Whether we are advertising received ECN counts back to the peer
    receiving_ecn: bool,
}

impl Connection {
    /// Initiate a connection to `remote`
    pub fn connect(
        config: ClientConfig,
        remote: SocketAddr,
        server_name: &str,
        now: Instant,
    ) -> Result<Self, ConnectError> {
        if server_name.is_empty() {
            return Err(ConnectError::InvalidServerName(server_name.into()));
        }
        let mut rng = StdRng::from_entropy();

        // The destination of the first flight; also the input to the initial key schedule
        let mut dcid_bytes = [0; 8];
        rng.fill_bytes(&mut dcid_bytes);
        let init_cid = ConnectionId::new(&dcid_bytes);
        let loc_cid = config.cid_generator.generate_cid(&mut rng);

        let mut params = TransportParameters::new(&config.transport, None);
        params.initial_src_cid = Some(loc_cid);
        let crypto = config.crypto.start_session(server_name, &params)?;

        let mut ticket = None;
        if let Some(store) = &config.ticket_store {
            ticket = store.take(server_name).and_then(SessionTicket::decode);
        }

        let mut this = Self::new_inner(
            config.transport,
            ConnectionSide::Client {
                server_name: server_name.into(),
                ticket_store: config.ticket_store,
            },
            rng,
            crypto,
            init_cid,
            loc_cid,
            config.cid_generator,
            remote,
            true,
            now,
        );
        if let Some(ticket) = ticket {
            this.initial_token = ticket.token;
            // Start loss detection from the RTT remembered with the ticket instead of the
            // configured guess
            this.path.rtt = RttEstimator::new(ticket.rtt.max(TIMER_GRANULARITY));
        }
        this.write_crypto();
        this.init_0rtt();
        Ok(this)
    }

    /// Accept a connection from a peer whose first Initial carried `orig_dst_cid`
    ///
    /// The caller (normally the listener that routes datagrams by connection ID) is expected to
    /// feed that same first datagram into [`handle_datagram`](Self::handle_datagram) immediately
    /// after construction.
    pub fn accept(
        config: ServerConfig,
        remote: SocketAddr,
        orig_dst_cid: ConnectionId,
        now: Instant,
    ) -> Self {
        let mut rng = StdRng::from_entropy();
        let loc_cid = config.cid_generator.generate_cid(&mut rng);

        let mut params = TransportParameters::new(&config.transport, Some(&config));
        params.initial_src_cid = Some(loc_cid);
        params.original_dst_cid = Some(orig_dst_cid);
        let crypto = config.crypto.start_session(&params);

        Self::new_inner(
            config.transport,
            ConnectionSide::Server {
                migration: config.migration,
            },
            rng,
            crypto,
            orig_dst_cid,
            loc_cid,
            config.cid_generator,
            remote,
            false,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new_inner(
        config: Arc<TransportConfig>,
        side: ConnectionSide,
        rng: StdRng,
        crypto: Box<dyn crypto::Session>,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        cid_generator: Arc<dyn ConnectionIdGenerator>,
        remote: SocketAddr,
        path_validated: bool,
        now: Instant,
    ) -> Self {
        let initial_keys = crypto.initial_keys(&init_cid, side.side());
        let mut spaces = [
            PacketSpace::new(now),
            PacketSpace::new(now),
            PacketSpace::new(now),
        ];
        spaces[SpaceId::Initial].crypto = Some(initial_keys);
        let streams = StreamsState::new(
            side.side(),
            config.max_concurrent_uni_streams,
            config.max_concurrent_bidi_streams,
            config.send_window,
            config.receive_window,
            config.stream_receive_window,
        );
        let rem_cids = CidQueue::new(match side {
            // Clients address their first flight at the CID they invented
            ConnectionSide::Client { .. } => init_cid,
            // Servers learn the peer's CID from the first Initial
            ConnectionSide::Server { .. } => ConnectionId::new(&[]),
        });
        Self {
            path: PathData::new(remote, now, path_validated, &config),
            side,
            rng,
            crypto,
            handshake_cid: loc_cid,
            rem_handshake_cid: ConnectionId::new(&[]),
            initial_dst_cid: init_cid,
            retry_src_cid: None,
            initial_token: Bytes::new(),
            state: State::Handshake(state::Handshake {
                // Both sides learn the peer's true CID from its first long-header packet
                rem_cid_set: false,
                client_hello: None,
            }),
            zero_rtt_crypto: None,
            key_phase: false,
            prev_crypto: None,
            next_crypto: None,
            accepted_0rtt: false,
            peer_params: TransportParameters::default(),
            idle_timeout: config
                .max_idle_timeout
                .map(|x| Duration::from_millis(x.0)),
            timers: TimerTable::default(),
            key_update_allowed_at: None,
            events: VecDeque::new(),
            spaces,
            highest_space: SpaceId::Initial,
            pto_count: 0,
            app_limited: false,
            close: false,
            error: None,
            streams,
            local_cid_state: CidState::new(cid_generator.cid_len()),
            cid_generator,
            rem_cids,
            path_responses: PathResponses::default(),
            stats: ConnectionStats::default(),
            early_1rtt: Vec::new(),
            permit_idle_reset: true,
            total_authed_packets: 0,
            receiving_ecn: false,
            config,
        }
    }

    /// Returns the next time at which `handle_timeout` should be called
    ///
    /// The value returned may change after:
    /// - the application performed some I/O on the connection
    /// - a call was made to `handle_datagram`
    /// - a call was made to `handle_timeout`
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.timers.next_timeout().map(|(t, _)| t)
    }

    /// Returns application-facing events
    ///
    /// Connections should be polled for events after:
    /// - a call was made to `handle_datagram`
    /// - a call was made to `handle_timeout`
    pub fn poll(&mut self) -> Option<Event> {
        if let Some(x) = self.events.pop_front() {
            return Some(x);
        }

        if let Some(event) = self.streams.poll() {
            return Some(Event::Stream(event));
        }

        None
    }

    /// Access to streams as a whole
    pub fn streams(&mut self) -> Streams<'_> {
        Streams {
            state: &mut self.streams,
            pending: &mut self.spaces[SpaceId::Data].pending,
            conn_state: &self.state,
        }
    }

    /// Access to the receive half of stream `id`
    pub fn recv_stream(&mut self, id: StreamId) -> RecvStream<'_> {
        assert!(id.dir() == Dir::Bi || id.initiator() != self.side());
        RecvStream {
            id,
            state: &mut self.streams,
            pending: &mut self.spaces[SpaceId::Data].pending,
        }
    }

    /// Access to the send half of stream `id`
    pub fn send_stream(&mut self, id: StreamId) -> SendStream<'_> {
        assert!(id.dir() == Dir::Bi || id.initiator() == self.side());
        SendStream {
            id,
            state: &mut self.streams,
            pending: &mut self.spaces[SpaceId::Data].pending,
            conn_state: &self.state,
        }
    }

    /// Process an incoming UDP datagram
    pub fn handle_datagram(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
    ) {
        if self.state.is_drained() {
            return;
        }
        trace!(len = data.len(), "got datagram");
        self.stats.udp_rx.on_traffic(data.len());
        if remote != self.path.remote && !self.side.remote_may_migrate() {
            trace!("discarding datagram from unexpected address");
            return;
        }
        let len = data.len() as u64;

        let mut remaining = Some(data);
        while let Some(data) = remaining.take() {
            match PartialDecode::new(data, self.local_cid_state.cid_len()) {
                Ok((partial_decode, rest)) => {
                    remaining = rest;
                    self.handle_decode(now, remote, ecn, partial_decode);
                }
                Err(e) => {
                    trace!("malformed header: {}", e);
                    break;
                }
            }
        }

        // Credited only after any migration, so the anti-amplification budget opens on the
        // path we'll actually answer on
        if remote == self.path.remote {
            self.path.total_recvd = self.path.total_recvd.saturating_add(len);
        }
    }

    fn handle_decode(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        partial_decode: PartialDecode,
    ) {
        if let Some(decoded) = packet_crypto::unprotect_header(
            partial_decode,
            &self.spaces,
            self.zero_rtt_crypto.as_ref(),
            self.rem_cids.reset_token(),
        ) {
            self.handle_packet(now, remote, ecn, decoded.packet, decoded.stateless_reset);
        }
    }

    fn handle_packet(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        packet: Option<Packet>,
        stateless_reset: bool,
    ) {
        if stateless_reset {
            debug!("got stateless reset");
            self.kill(ConnectionError::Reset);
            return;
        }
        let Some(mut packet) = packet else {
            return;
        };

        trace!(
            "got {:?} packet ({} bytes) from {}",
            packet.header.space(),
            packet.payload.len() + packet.header_data.len(),
            remote
        );

        let was_closed = self.state.is_closed();

        let decrypted = match self.decrypt_packet(now, &mut packet) {
            // A protocol violation reported during decryption
            Err(Some(e)) => {
                self.fail(now, e);
                return;
            }
            // Packet discarded, e.g. authentication failure: a forgery or corruption
            Err(None) => {
                return;
            }
            Ok(number) => number,
        };

        if let Some(number) = decrypted {
            let space = packet.header.space();
            if self.spaces[space].dedup.insert(number) {
                debug!("discarding possible duplicate packet {}", number);
                return;
            }
            self.on_packet_authenticated(now, space, ecn);
            self.spaces[space].rx_packet = cmp::max(self.spaces[space].rx_packet, number);
        } else if packet.header.is_protected() {
            // A protected packet that did not yield a number was dropped upstream
            return;
        }

        if self.state.is_closed() && !was_closed {
            return;
        }
        if self.state.is_closed() {
            if decrypted.is_none() {
                return;
            }
            // If the peer is also winding down, settle into silence; otherwise answer its
            // lingering traffic with our close, at most once per received packet
            let peer_closing = frame::Iter::new(packet.payload.freeze())
                .map(|iter| {
                    iter.flatten()
                        .any(|frame| matches!(frame, Frame::Close(_)))
                })
                .unwrap_or(false);
            if let State::Closed(_) = self.state {
                if peer_closing {
                    trace!("peer is closing too; draining");
                    self.state = State::Draining;
                } else {
                    self.close = true;
                }
            }
            return;
        }

        let result = match self.state {
            State::Handshake(_) => self.process_handshake_packet(now, remote, packet, decrypted),
            State::Established => self.process_established_packet(now, remote, packet, decrypted),
            _ => unreachable!("closed states are filtered above"),
        };

        if let Err(e) = result {
            self.fail(now, e);
        }
    }

    fn process_handshake_packet(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        mut packet: Packet,
        number: Option<u64>,
    ) -> Result<(), TransportError> {
        let _ = remote;
        match packet.header {
            Header::Retry { src_cid, .. } => {
                if !self.side.is_client()
                    || self.total_authed_packets > 0
                    || self.retry_src_cid.is_some()
                    || packet.payload.len() < crate::packet::RETRY_TAG_SIZE
                {
                    // A Retry after progress, or a second Retry, is ignored
                    trace!("ignoring Retry");
                    return Ok(());
                }
                let tag_start = packet.payload.len() - crate::packet::RETRY_TAG_SIZE;
                let mut pseudo = Vec::new();
                pseudo.extend_from_slice(&packet.header_data);
                pseudo.extend_from_slice(&packet.payload[..tag_start]);
                if !self
                    .crypto
                    .is_valid_retry(&self.initial_dst_cid, &pseudo, &packet.payload[tag_start..])
                {
                    trace!("dropping Retry with invalid integrity tag");
                    return Ok(());
                }

                debug!("retrying with token");
                self.initial_token = packet.payload.split_to(tag_start).freeze();
                self.retry_src_cid = Some(src_cid);
                self.rem_cids.update_initial_cid(src_cid);
                self.rem_handshake_cid = src_cid;

                // Initial keys are re-derived from the Retry's source CID, and the first flight
                // is sent afresh
                self.spaces[SpaceId::Initial] = PacketSpace::new(now);
                self.spaces[SpaceId::Initial].crypto =
                    Some(self.crypto.initial_keys(&src_cid, Side::Client));
                let client_hello = match self.state {
                    State::Handshake(ref mut state) => state.client_hello.clone(),
                    _ => unreachable!(),
                };
                if let Some(client_hello) = client_hello {
                    self.spaces[SpaceId::Initial]
                        .pending
                        .crypto
                        .push_back(frame::Crypto {
                            offset: 0,
                            data: client_hello,
                        });
                    self.spaces[SpaceId::Initial].crypto_offset = 0;
                }
                // The new first flight starts congestion control over
                self.path = PathData::new(self.path.remote, now, true, &self.config);
                Ok(())
            }
            Header::VersionNegotiate { .. } => {
                if self.total_authed_packets > 0 {
                    return Ok(());
                }
                let mut versions = packet.payload.as_ref();
                while versions.len() >= 4 {
                    let (head, rest) = versions.split_at(4);
                    if u32::from_be_bytes(head.try_into().unwrap()) == crate::VERSION {
                        // A spurious offer of the version in use means the packet is either
                        // corrupt or hostile
                        return Ok(());
                    }
                    versions = rest;
                }
                debug!("peer doesn't support any of our versions");
                self.kill(ConnectionError::VersionMismatch);
                Ok(())
            }
            Header::Initial { src_cid, .. } | Header::Long { src_cid, .. } => {
                let number = number.expect("long header packets are protected");
                if !self.state.rem_cid_set() {
                    trace!("switching remote CID to {}", src_cid);
                    self.rem_cids.update_initial_cid(src_cid);
                    self.rem_handshake_cid = src_cid;
                    if let State::Handshake(ref mut state) = self.state {
                        state.rem_cid_set = true;
                    }
                } else if src_cid != self.rem_handshake_cid && packet.header.space() == SpaceId::Initial {
                    debug!("discarding Initial with inconsistent source CID");
                    return Ok(());
                }

                if packet.header.space() == SpaceId::Handshake {
                    // An authenticated Handshake packet proves the peer holds the address
                    self.path.validated = true;
                    if self.side.is_server() {
                        // The peer has abandoned its Initial keys, and so should we
                        self.discard_space(now, SpaceId::Initial);
                    }
                }

                self.process_payload(now, remote, number, packet)?;
                self.maybe_complete_handshake(now)?;
                Ok(())
            }
            Header::Short { .. } => {
                // 1-RTT packets are accepted only once the handshake completes. Under reordering
                // the application data can outrun the final handshake flight, so a small number
                // of packets is parked rather than forcing the peer into a retransmit.
                let number = number.expect("short header packets are protected");
                if self.early_1rtt.len() < MAX_EARLY_1RTT_PACKETS {
                    trace!("buffering 1-RTT packet received during handshake");
                    self.early_1rtt.push((number, remote, packet));
                } else {
                    debug!("dropping 1-RTT packet received during handshake");
                }
                Ok(())
            }
        }
    }

    fn process_established_packet(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        packet: Packet,
        number: Option<u64>,
    ) -> Result<(), TransportError> {
        match packet.header {
            Header::Retry { .. } | Header::VersionNegotiate { .. } => {
                // Meaningful only before any packet is authenticated
                Ok(())
            }
            _ => {
                let number = number.expect("protected packets have numbers");
                self.process_payload(now, remote, number, packet)
            }
        }
    }

    /// Transition out of the handshake once the crypto layer is done and, for a server, the
    /// peer's address is validated
    fn maybe_complete_handshake(&mut self, now: Instant) -> Result<(), TransportError> {
        if !matches!(self.state, State::Handshake(_)) || self.crypto.is_handshaking() {
            return Ok(());
        }
        if self.spaces[SpaceId::Data].crypto.is_none() {
            // Waiting for the final key upgrade
            return Ok(());
        }

        if let Some(params) = self.crypto.transport_parameters()? {
            self.handle_peer_params(params)?;
        }

        self.events.push_back(Event::Connected);
        self.state = State::Established;
        trace!("established");

        // Replay any application data that arrived ahead of the handshake's tail
        for (number, remote, packet) in mem::take(&mut self.early_1rtt) {
            self.process_payload(now, remote, number, packet)?;
        }

        if self.side.is_client() {
            self.accepted_0rtt = self.crypto.early_data_accepted().unwrap_or(false);
            if self.zero_rtt_crypto.is_some() && !self.accepted_0rtt {
                debug!("0-RTT rejected");
                self.streams.zero_rtt_rejected();
                self.streams.retransmit_all_for_0rtt();
                self.zero_rtt_crypto = None;
            }
        } else {
            // rfc9001 §4.9.2: the server must drop handshake keys as soon as the handshake
            // completes, and tell the client about it
            self.spaces[SpaceId::Data].pending.handshake_done = true;
            self.discard_space(now, SpaceId::Handshake);
        }
        self.issue_cids();
        Ok(())
    }

    fn process_payload(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        number: u64,
        packet: Packet,
    ) -> Result<(), TransportError> {
        let space_id = packet.header.space();
        let payload_len = packet.payload.len();
        let is_0rtt = packet.header.is_0rtt();
        let mut is_probing_packet = true;
        let mut ack_eliciting = false;
        for result in frame::Iter::new(packet.payload.freeze())? {
            let frame = result?;
            ack_eliciting |= frame.is_ack_eliciting();

            // Check whether this could be a probing packet
            match frame {
                Frame::Padding | Frame::PathChallenge(_) | Frame::PathResponse(_) => {}
                _ => {
                    is_probing_packet = false;
                }
            }

            if is_0rtt && matches!(frame, Frame::Ack(_) | Frame::HandshakeDone) {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "illegal frame type in 0-RTT",
                ));
            }

            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Crypto(frame) => {
                    self.stats.frame_rx.crypto += 1;
                    self.read_crypto(space_id, &frame, payload_len)?;
                }
                Frame::Ack(ack) => {
                    self.stats.frame_rx.acks += 1;
                    self.on_ack_received(now, space_id, ack)?;
                }
                Frame::Close(reason) => {
                    self.stats.frame_rx.connection_close += 1;
                    self.error = Some(reason.into());
                    self.close_common();
                    self.state = State::Draining;
                    // Answer the close once, so a peer that lost its own close packet converges
                    self.close = true;
                    self.set_close_timer(now);
                    self.events.push_back(Event::ConnectionLost {
                        reason: self.error.clone().unwrap(),
                    });
                    return Ok(());
                }
                Frame::Stream(frame) => {
                    self.stats.frame_rx.stream += 1;
                    if self.streams.received(frame, payload_len)?.should_transmit() {
                        self.spaces[SpaceId::Data].pending.max_data = true;
                    }
                }
                Frame::ResetStream(frame) => {
                    self.stats.frame_rx.reset_stream += 1;
                    if self.streams.received_reset(frame)?.should_transmit() {
                        self.spaces[SpaceId::Data].pending.max_data = true;
                    }
                }
                Frame::StopSending(frame::StopSending { id, error_code }) => {
                    self.stats.frame_rx.stop_sending += 1;
                    if id.initiator() != self.side() && id.dir() == Dir::Uni {
                        debug!("got STOP_SENDING on recv-only {}", id);
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "STOP_SENDING on recv-only stream",
                        ));
                    }
                    if id.initiator() == self.side() && self.streams.is_local_unopened(id) {
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "STOP_SENDING on unopened stream",
                        ));
                    }
                    self.streams.received_stop_sending(id, error_code);
                }
                Frame::MaxData(limit) => {
                    self.stats.frame_rx.max_data += 1;
                    self.streams.received_max_data(limit);
                }
                Frame::MaxStreamData { id, offset } => {
                    self.stats.frame_rx.max_stream_data += 1;
                    self.streams.received_max_stream_data(id, offset)?;
                }
                Frame::MaxStreams { dir, count } => {
                    match dir {
                        Dir::Bi => self.stats.frame_rx.max_streams_bidi += 1,
                        Dir::Uni => self.stats.frame_rx.max_streams_uni += 1,
                    }
                    self.streams.received_max_streams(dir, count)?;
                }
                Frame::DataBlocked { offset } => {
                    self.stats.frame_rx.data_blocked += 1;
                    debug!(offset, "peer claims to be blocked at connection level");
                }
                Frame::StreamDataBlocked { id, offset } => {
                    self.stats.frame_rx.stream_data_blocked += 1;
                    if id.initiator() == self.side() && id.dir() == Dir::Uni {
                        debug!("got STREAM_DATA_BLOCKED on send-only {}", id);
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "STREAM_DATA_BLOCKED on send-only stream",
                        ));
                    }
                    debug!(
                        stream = %id,
                        offset, "peer claims to be blocked at stream level"
                    );
                }
                Frame::StreamsBlocked { dir, limit } => {
                    self.stats.frame_rx.streams_blocked(dir);
                    if limit > crate::MAX_STREAM_COUNT {
                        return Err(TransportError::FRAME_ENCODING_ERROR(
                            "unrepresentable stream limit",
                        ));
                    }
                    debug!(
                        "peer claims to be blocked opening more than {} {} streams",
                        limit, dir
                    );
                }
                Frame::NewConnectionId(frame) => {
                    self.stats.frame_rx.new_connection_id += 1;
                    trace!(
                        sequence = frame.sequence,
                        id = %frame.id,
                        retire_prior_to = frame.retire_prior_to,
                    );
                    if self.rem_cids.active().len() == 0 {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "NEW_CONNECTION_ID when CIDs aren't in use",
                        ));
                    }
                    self.handle_new_cid(frame)?;
                }
                Frame::RetireConnectionId { sequence } => {
                    self.stats.frame_rx.retire_connection_id += 1;
                    if self.local_cid_state.cid_len() == 0 {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "RETIRE_CONNECTION_ID when CIDs aren't in use",
                        ));
                    }
                    if self.local_cid_state.on_cid_retired(sequence)? {
                        trace!(sequence, "peer retired CID");
                    }
                    self.issue_cids();
                }
                Frame::PathChallenge(token) => {
                    self.stats.frame_rx.path_challenge += 1;
                    self.path_responses.push(token);
                }
                Frame::PathResponse(token) => {
                    self.stats.frame_rx.path_response += 1;
                    // We never probe paths, so there is no challenge to match
                    debug!(token, "ignoring unsolicited PATH_RESPONSE");
                }
                Frame::NewToken(frame::NewToken { token }) => {
                    self.stats.frame_rx.new_token += 1;
                    let ConnectionSide::Client {
                        server_name,
                        ticket_store,
                    } = &self.side
                    else {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "client sent NEW_TOKEN",
                        ));
                    };
                    if let Some(store) = ticket_store {
                        trace!("got new token");
                        let ticket = SessionTicket {
                            token,
                            rtt: self.path.rtt.get(),
                        };
                        store.insert(server_name, ticket.encode());
                    }
                }
                Frame::HandshakeDone => {
                    self.stats.frame_rx.handshake_done =
                        self.stats.frame_rx.handshake_done.saturating_add(1);
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "client sent HANDSHAKE_DONE",
                        ));
                    }
                    if self.spaces[SpaceId::Handshake].crypto.is_some() {
                        // The handshake is now confirmed
                        self.discard_space(now, SpaceId::Handshake);
                    }
                }
            }
        }

        let space = &mut self.spaces[space_id];
        if space
            .pending_acks
            .packet_received(number, now, ack_eliciting, space_id)
        {
            self.timers
                .set(Timer::MaxAckDelay, now + self.config.max_ack_delay);
        }

        // Receive-side migration: a non-probing packet from a new address moves the path
        if remote != self.path.remote
            && !is_probing_packet
            && number == self.spaces[space_id].rx_packet
        {
            debug_assert!(
                self.side.remote_may_migrate(),
                "packets from unknown remote should be dropped by caller"
            );
            self.migrate(now, remote);
        }

        Ok(())
    }

    fn handle_new_cid(&mut self, frame: NewConnectionId) -> Result<(), TransportError> {
        match self.rem_cids.insert(frame) {
            Ok(None) => {}
            Ok(Some((retired, _reset_token))) => {
                // The peer demanded we move off the CIDs below `retire_prior_to`
                let pending_retired =
                    &mut self.spaces[SpaceId::Data].pending.retire_cids;
                pending_retired.extend(retired);
            }
            Err(InsertError::ExceedsLimit) => {
                return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(""));
            }
            Err(InsertError::Retired) => {
                trace!("discarding already-retired CID");
                // RETIRE_CONNECTION_ID might have raced with the peer's NEW_CONNECTION_ID; tell
                // the peer again
                self.spaces[SpaceId::Data]
                    .pending
                    .retire_cids
                    .push(frame.sequence);
            }
        }
        Ok(())
    }

    /// Process a CRYPTO frame and feed the crypto layer
    fn read_crypto(
        &mut self,
        space_id: SpaceId,
        crypto: &frame::Crypto,
        payload_len: usize,
    ) -> Result<(), TransportError> {
        let expected = if !self.state.is_handshake() {
            SpaceId::Data
        } else if self.highest_space == SpaceId::Initial {
            SpaceId::Initial
        } else {
            // On the server, self.highest_space can be Data after the handshake keys are
            // installed, but before the handshake completes
            SpaceId::Handshake
        };
        let end = crypto.offset + crypto.data.len() as u64;
        if space_id < expected && end > self.spaces[space_id].crypto_stream.bytes_read() {
            // Retransmitted handshake data is expected noise; fresh data at an abandoned level
            // is not
            warn!(
                "received new {:?} CRYPTO data when expecting {:?}",
                space_id, expected
            );
            return Err(TransportError::PROTOCOL_VIOLATION(
                "new data at unexpected encryption level",
            ));
        }

        let space = &mut self.spaces[space_id];
        let max = space.crypto_stream.bytes_read() + self.config.crypto_buffer_size as u64;
        if end > max {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED(""));
        }

        space
            .crypto_stream
            .insert(crypto.offset, crypto.data.clone(), payload_len);
        while let Some(chunk) = self.spaces[space_id].crypto_stream.read(usize::MAX) {
            trace!("consumed {} CRYPTO bytes", chunk.bytes.len());
            if self.crypto.read_handshake(&chunk.bytes)? {
                self.events.push_back(Event::HandshakeDataReady);
            }
        }

        // The server's 0-RTT read keys become available once the first flight is processed
        if self.side.is_server()
            && self.zero_rtt_crypto.is_none()
            && self.highest_space == SpaceId::Initial
        {
            if let Some((header, packet)) = self.crypto.early_crypto() {
                trace!("0-RTT enabled");
                self.zero_rtt_crypto = Some(ZeroRttCrypto { header, packet });
            }
        }

        self.write_crypto();
        Ok(())
    }

    /// Pull pending handshake bytes out of the crypto layer, queueing them for transmission and
    /// installing any keys that became available
    fn write_crypto(&mut self) {
        loop {
            let space = self.highest_space;
            let mut outgoing = Vec::new();
            if let Some(crypto) = self.crypto.write_handshake(&mut outgoing) {
                match space {
                    SpaceId::Initial => {
                        self.upgrade_crypto(SpaceId::Handshake, crypto);
                    }
                    SpaceId::Handshake => {
                        self.upgrade_crypto(SpaceId::Data, crypto);
                    }
                    _ => unreachable!("got updated secrets during 1-RTT"),
                }
            }
            if outgoing.is_empty() {
                if space == self.highest_space {
                    break;
                } else {
                    // Keys updated, check for more data to send
                    continue;
                }
            }
            let offset = self.spaces[space].crypto_offset;
            let outgoing = Bytes::from(outgoing);
            if let State::Handshake(ref mut state) = self.state {
                if space == SpaceId::Initial && offset == 0 && self.side.is_client() {
                    state.client_hello = Some(outgoing.clone());
                }
            }
            self.spaces[space].crypto_offset += outgoing.len() as u64;
            trace!("wrote {} {:?} CRYPTO bytes", outgoing.len(), space);
            self.spaces[space].pending.crypto.push_back(frame::Crypto {
                offset,
                data: outgoing,
            });
        }
    }

    /// Switch to stronger cryptography during handshake
    fn upgrade_crypto(&mut self, space: SpaceId, crypto: Keys) {
        debug_assert!(
            self.spaces[space].crypto.is_none(),
            "already reached packet space {space:?}"
        );
        trace!("{:?} keys ready", space);
        if space == SpaceId::Data {
            // Precompute the first key update
            self.next_crypto = Some(
                self.crypto
                    .next_1rtt_keys()
                    .expect("handshake should be complete"),
            );
        }

        self.spaces[space].crypto = Some(crypto);
        debug_assert!(space as usize > self.highest_space as usize);
        self.highest_space = space;
        if space == SpaceId::Data && self.side.is_client() {
            // Discard 0-RTT keys because 1-RTT keys are available.
            self.zero_rtt_crypto = None;
        }
    }

    fn init_0rtt(&mut self) {
        let (header, packet) = match self.crypto.early_crypto() {
            Some(x) => x,
            None => return,
        };
        if let Some(params) = self.crypto.transport_parameters().ok().flatten() {
            // Zero-RTT traffic is subject to the flow control state remembered with the session
            self.set_peer_params(params);
        }
        trace!("0-RTT enabled");
        self.zero_rtt_crypto = Some(ZeroRttCrypto { header, packet });
    }

    fn discard_space(&mut self, now: Instant, space_id: SpaceId) {
        debug_assert!(space_id != SpaceId::Data);
        trace!("discarding {:?} keys", space_id);
        if space_id == SpaceId::Initial {
            // No longer needed
            self.initial_token = Bytes::new();
        }
        let space = &mut self.spaces[space_id];
        space.crypto = None;
        space.loss_time = None;
        space.loss_probes = 0;
        space.ping_pending = false;
        let sent_packets = space.drain_sent();
        for (_, packet) in sent_packets {
            self.path.in_flight.remove(&packet);
        }
        self.set_loss_detection_timer(now)
    }

    /// Number of bytes worth of non-ack-only packets that may be sent
    fn congestion_blocked(&self) -> bool {
        self.path.in_flight.bytes + u64::from(self.path.mtu) >= self.path.congestion.window()
    }

    fn on_ack_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }
        let new_largest = {
            let space = &mut self.spaces[space];
            if space
                .largest_acked_packet
                .map_or(true, |pn| ack.largest > pn)
            {
                space.largest_acked_packet = Some(ack.largest);
                if let Some(info) = space.sent_packets.get(&ack.largest) {
                    // This should always succeed, but a misbehaving peer might ACK a packet we
                    // haven't sent. At worst, that will result in us spuriously reducing the
                    // congestion window.
                    space.largest_acked_packet_sent = info.time_sent;
                }
                true
            } else {
                false
            }
        };

        // Avoid DoS from unreasonably huge ack ranges by filtering out just the new acks.
        let mut newly_acked = ArrayRangeSet::new();
        for range in ack.iter() {
            for (&pn, _) in self.spaces[space].sent_packets.range(range) {
                newly_acked.insert_one(pn);
            }
        }

        if newly_acked.is_empty() {
            return Ok(());
        }

        let mut ack_eliciting_acked = false;
        for packet in newly_acked.elts() {
            if let Some(info) = self.spaces[space].take(packet) {
                if let Some(acked) = info.largest_acked {
                    // Assume ACKs for all packets below the largest acknowledged in `packet` have
                    // been received. This can cause the peer to spuriously retransmit if some of
                    // our earlier ACKs were lost, but allows for simpler state tracking.
                    self.spaces[space].pending_acks.subtract_below(acked);
                }
                ack_eliciting_acked |= info.ack_eliciting;
                self.on_packet_acked(now, info);
            }
        }

        if new_largest && ack_eliciting_acked {
            let ack_delay = if space != SpaceId::Data {
                Duration::from_micros(0)
            } else {
                cmp::min(
                    self.peer_params.max_ack_delay(),
                    Duration::from_micros(ack.delay << self.peer_params.ack_delay_exponent()),
                )
            };
            let rtt = instant_saturating_sub(now, self.spaces[space].largest_acked_packet_sent);
            self.path.rtt.update(ack_delay, rtt);
            if self.path.first_packet_after_rtt_sample.is_none() {
                self.path.first_packet_after_rtt_sample =
                    Some((space, self.spaces[space].next_packet_number));
            }
        }

        // Must be called before crypto/pto_count are clobbered
        self.detect_lost_packets(now, space, true);

        if self.peer_completed_address_validation() {
            self.pto_count = 0;
        }

        // Explicit congestion notification
        if self.path.sending_ecn {
            if let Some(ecn) = ack.ecn {
                // We only examine ECN counters from ACKs that we are certain we received in
                // transmit order, allowing us to compute an increase in ECN counts to compare
                // against the number of newly acked packets that remains well-defined in the
                // presence of arbitrary packet reordering.
                if new_largest {
                    let sent = self.spaces[space].largest_acked_packet_sent;
                    self.process_ecn(now, space, newly_acked.elts().count() as u64, ecn, sent);
                }
            } else {
                // We always start out sending ECN, so any ack that doesn't acknowledge it
                // disables it.
                debug!("ECN not acknowledged by peer");
                self.path.sending_ecn = false;
            }
        }

        self.set_loss_detection_timer(now);
        Ok(())
    }

    /// Process a new ECN block from an in-order ACK
    fn process_ecn(
        &mut self,
        now: Instant,
        space: SpaceId,
        newly_acked: u64,
        ecn: frame::EcnCounts,
        largest_sent_time: Instant,
    ) {
        match self.spaces[space].detect_ecn(newly_acked, ecn) {
            Err(e) => {
                debug!("halting ECN due to verification failure: {}", e);
                self.path.sending_ecn = false;
                // Wipe out the existing value because it might be garbage and could interfere
                // with future attempts to use ECN on new paths.
                self.spaces[space].ecn_feedback = frame::EcnCounts::ZERO;
            }
            Ok(false) => {}
            Ok(true) => {
                self.stats.path.congestion_events += 1;
                self.path
                    .congestion
                    .on_congestion_event(now, largest_sent_time, false);
            }
        }
    }

    // Not timing-aware, so it's safe to call this for inferred acks, such as arise from
    // high-latency handshakes
    fn on_packet_acked(&mut self, now: Instant, info: SentPacket) {
        self.path.in_flight.remove(&info);
        if info.ack_eliciting {
            self.path.congestion.on_ack(
                now,
                info.time_sent,
                info.size.into(),
                self.app_limited,
                &self.path.rtt,
            );
        }

        // Update state for confirmed delivery of frames
        if let Some(retransmits) = info.retransmits.get() {
            for (id, _) in retransmits.reset_stream.iter() {
                self.streams.reset_acked(*id);
            }
        }

        for frame in info.stream_frames {
            self.streams.received_ack_of(frame);
        }
    }

    fn set_key_discard_timer(&mut self, now: Instant, space: SpaceId) {
        let start = if self.zero_rtt_crypto.is_some() {
            now
        } else {
            self.prev_crypto
                .as_ref()
                .expect("no previous keys")
                .end_packet
                .as_ref()
                .expect("update not acknowledged yet")
                .1
        };
        self.timers
            .set(Timer::KeyDiscard, start + self.pto(space) * 3);
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        if let Some((_, pn_space)) = self.loss_time_and_space() {
            // Time threshold loss Detection
            self.detect_lost_packets(now, pn_space, false);
            self.set_loss_detection_timer(now);
            return;
        }

        let (_, space) = match self.pto_time_and_space(now) {
            Some(x) => x,
            None => {
                error!("PTO expired while unset");
                return;
            }
        };
        trace!(
            in_flight = self.path.in_flight.bytes,
            count = self.pto_count,
            ?space,
            "PTO fired"
        );

        let count = match self.path.in_flight.ack_eliciting {
            // A PTO when we're not expecting any ACKs must be due to handshake anti-amplification
            // deadlock preventions
            0 => {
                debug_assert!(!self.peer_completed_address_validation());
                1
            }
            // Conventional loss probe
            _ => 2,
        };
        self.spaces[space].loss_probes = self.spaces[space].loss_probes.saturating_add(count);
        self.pto_count = self.pto_count.saturating_add(1);
        self.set_loss_detection_timer(now);
    }

    fn detect_lost_packets(&mut self, now: Instant, pn_space: SpaceId, due_to_ack: bool) {
        let mut lost_packets = Vec::<u64>::new();
        let rtt = self.path.rtt.conservative();
        let loss_delay = cmp::max(rtt.mul_f32(self.config.time_threshold), TIMER_GRANULARITY);

        // Packets sent before this time are deemed lost.
        let lost_send_time = now.checked_sub(loss_delay).unwrap();
        let largest_acked_packet = self.spaces[pn_space].largest_acked_packet.unwrap();
        let packet_threshold = self.config.packet_threshold as u64;
        let mut size_of_lost_packets = 0u64;

        // InPersistentCongestion: Determine if all packets in the time period before the newest
        // lost packet, including the edges, are marked lost. PTO computation must always
        // include max ACK delay, i.e. operate as if in Data space (see RFC9001 §7.6.1).
        let congestion_period =
            self.pto(SpaceId::Data) * self.config.persistent_congestion_threshold;
        let mut persistent_congestion_start: Option<Instant> = None;
        let mut prev_packet = None;
        let mut in_persistent_congestion = false;

        let space = &mut self.spaces[pn_space];
        space.loss_time = None;

        for (&packet, info) in space.sent_packets.range(0..largest_acked_packet) {
            if prev_packet != Some(packet.wrapping_sub(1)) {
                // An intervening packet was acknowledged
                persistent_congestion_start = None;
            }

            if info.time_sent <= lost_send_time || largest_acked_packet >= packet + packet_threshold
            {
                lost_packets.push(packet);
                size_of_lost_packets += info.size as u64;
                if info.ack_eliciting && due_to_ack {
                    match persistent_congestion_start {
                        // Two ACK-eliciting packets lost more than congestion_period apart, with
                        // no ACKed packets in between
                        Some(start) if info.time_sent - start > congestion_period => {
                            in_persistent_congestion = true;
                        }
                        // Persistent congestion must start after the first RTT sample
                        None if self
                            .path
                            .first_packet_after_rtt_sample
                            .is_some_and(|x| x < (pn_space, packet)) =>
                        {
                            persistent_congestion_start = Some(info.time_sent);
                        }
                        _ => {}
                    }
                }
            } else {
                let next_loss_time = info.time_sent + loss_delay;
                space.loss_time = Some(
                    space
                        .loss_time
                        .map_or(next_loss_time, |x| cmp::min(x, next_loss_time)),
                );
                persistent_congestion_start = None;
            }

            prev_packet = Some(packet);
        }

        // OnPacketsLost
        if let Some(largest_lost) = lost_packets.last().cloned() {
            let old_bytes_in_flight = self.path.in_flight.bytes;
            let largest_lost_sent = self.spaces[pn_space].sent_packets[&largest_lost].time_sent;
            self.stats.path.lost_packets += lost_packets.len() as u64;
            self.stats.path.lost_bytes += size_of_lost_packets;
            trace!(
                "packets lost: {:?}, bytes lost: {}",
                lost_packets,
                size_of_lost_packets
            );

            for &packet in &lost_packets {
                // safe: lost_packets is populated just above
                let info = self.spaces[pn_space].take(packet).unwrap();
                self.path.in_flight.remove(&info);
                if !info.stream_frames.is_empty() {
                    self.stats.path.retransmitted_packets += 1;
                }
                for frame in info.stream_frames {
                    self.streams.retransmit(frame);
                }
                self.spaces[pn_space].pending |= info.retransmits;
            }

            // Don't apply congestion penalty for lost ack-only packets
            let lost_ack_eliciting = old_bytes_in_flight != self.path.in_flight.bytes;

            if lost_ack_eliciting {
                self.stats.path.congestion_events += 1;
                self.path.congestion.on_congestion_event(
                    now,
                    largest_lost_sent,
                    in_persistent_congestion,
                );
            }
        }
    }

    fn loss_time_and_space(&self) -> Option<(Instant, SpaceId)> {
        SpaceId::iter()
            .filter_map(|id| Some((self.spaces[id].loss_time?, id)))
            .min_by_key(|&(time, _)| time)
    }

    fn pto_time_and_space(&self, now: Instant) -> Option<(Instant, SpaceId)> {
        let backoff = 2u32.pow(self.pto_count.min(MAX_BACKOFF_EXPONENT));
        let mut duration = self.path.rtt.pto_base() * backoff;

        if self.path.in_flight.ack_eliciting == 0 {
            debug_assert!(!self.peer_completed_address_validation());
            let space = match self.highest_space {
                SpaceId::Handshake => SpaceId::Handshake,
                _ => SpaceId::Initial,
            };
            return Some((now + duration, space));
        }

        let mut result = None;
        for space in SpaceId::iter() {
            if !self.spaces[space].has_in_flight() {
                continue;
            }
            if space == SpaceId::Data {
                // Skip ApplicationData until handshake completes.
                if self.is_handshaking() {
                    return result;
                }
                // Include max_ack_delay and backoff for ApplicationData.
                duration += self.peer_params.max_ack_delay() * backoff;
            }
            let last_ack_eliciting = match self.spaces[space].time_of_last_ack_eliciting_packet {
                Some(time) => time,
                None => continue,
            };
            let pto = last_ack_eliciting + duration;
            if result.map_or(true, |(earliest_pto, _)| pto < earliest_pto) {
                result = Some((pto, space));
            }
        }
        result
    }

    fn peer_completed_address_validation(&self) -> bool {
        if self.side.is_server() || self.state.is_closed() {
            return true;
        }
        // The server is guaranteed to have validated our address if any of our handshake or 1-RTT
        // packets are acknowledged or we've seen HANDSHAKE_DONE and discarded handshake keys.
        self.spaces[SpaceId::Handshake]
            .largest_acked_packet
            .is_some()
            || self.spaces[SpaceId::Data].largest_acked_packet.is_some()
            || (self.spaces[SpaceId::Data].crypto.is_some()
                && self.spaces[SpaceId::Handshake].crypto.is_none())
    }

    fn set_loss_detection_timer(&mut self, now: Instant) {
        if self.state.is_closed() {
            // No loss detection takes place on closed connections, and `close_common` already
            // stopped the timer. Ensure we don't restart it inadvertently, e.g. in response to a
            // reordered packet being handled by state-insensitive code.
            return;
        }

        if let Some((loss_time, _)) = self.loss_time_and_space() {
            // Time threshold loss detection.
            self.timers.set(Timer::LossDetection, loss_time);
            return;
        }

        if self.path.anti_amplification_blocked(1) {
            // We wouldn't be able to send anything, so don't bother.
            self.timers.stop(Timer::LossDetection);
            return;
        }

        if self.path.in_flight.ack_eliciting == 0 && self.peer_completed_address_validation() {
            // There is nothing to detect lost, so no timer is set. However, the client needs to
            // arm the timer if the server might be blocked by the anti-amplification limit.
            self.timers.stop(Timer::LossDetection);
            return;
        }

        // Determine which PN space to arm PTO for, and the corresponding duration
        if let Some((timeout, _)) = self.pto_time_and_space(now) {
            self.timers.set(Timer::LossDetection, timeout);
        } else {
            self.timers.stop(Timer::LossDetection);
        }
    }

    /// Probe Timeout
    fn pto(&self, space: SpaceId) -> Duration {
        let max_ack_delay = match space {
            SpaceId::Initial | SpaceId::Handshake => Duration::ZERO,
            SpaceId::Data => self.peer_params.max_ack_delay(),
        };
        self.path.rtt.pto_base() + max_ack_delay
    }

    fn on_packet_authenticated(&mut self, now: Instant, space_id: SpaceId, ecn: Option<EcnCodepoint>) {
        self.total_authed_packets += 1;
        self.reset_keep_alive(now);
        self.reset_idle_timeout(now, space_id);
        self.permit_idle_reset = true;
        if let Some(x) = ecn {
            self.receiving_ecn = true;
            self.spaces[space_id].ecn_counters += x;
        }
    }

    fn reset_idle_timeout(&mut self, now: Instant, space: SpaceId) {
        let timeout = match self.idle_timeout {
            None => return,
            Some(x) => x,
        };
        if self.state.is_closed() {
            self.timers.stop(Timer::Idle);
            return;
        }
        let dt = cmp::max(timeout, 3 * self.pto(space));
        self.timers.set(Timer::Idle, now + dt);
    }

    fn reset_keep_alive(&mut self, now: Instant) {
        let interval = match self.config.keep_alive_interval {
            Some(x) if self.state.is_established() => x,
            _ => return,
        };
        self.timers.set(Timer::KeepAlive, now + interval);
    }

    /// Issue NEW_CONNECTION_ID frames until the peer holds its fill of our CIDs
    fn issue_cids(&mut self) {
        let n = self.local_cid_state.cids_to_issue();
        for _ in 0..n {
            let sequence = self.local_cid_state.on_cid_issued();
            let id = self.cid_generator.generate_cid(&mut self.rng);
            let mut reset_token = [0; crate::RESET_TOKEN_SIZE];
            self.rng.fill_bytes(&mut reset_token);
            self.spaces[SpaceId::Data].pending.new_cids.push(IssuedCid {
                sequence,
                id,
                reset_token: reset_token.into(),
            });
        }
    }

    /// Switch to a previously unused remote connection ID, if possible
    fn update_rem_cid(&mut self) {
        let (_, retired) = match self.rem_cids.next() {
            Some(x) => x,
            None => return,
        };

        // Retire the current remote CID and any CIDs we had to skip.
        self.spaces[SpaceId::Data]
            .pending
            .retire_cids
            .extend(retired);
    }

    fn migrate(&mut self, now: Instant, remote: SocketAddr) {
        trace!(%remote, "migration initiated");
        // We do not probe the new path; the new address simply becomes the path, with fresh
        // congestion state unless only the port changed.
        if remote.ip() != self.path.remote.ip() {
            let new_path = PathData::from_previous(remote, &self.path, now, &self.config);
            self.path = new_path;
        } else {
            self.path.remote = remote;
        }
        // An attacker simply forwarding datagrams from off-path shouldn't be able to redirect
        // the full flood elsewhere; the amplification limit applies until the new address
        // proves it can receive
        self.path.validated = false;

        // Don't reuse the CID the old path saw
        self.update_rem_cid();
    }

    /// Signal to the crypto layer to roll 1-RTT keys to the next generation
    ///
    /// Ignored while the handshake is incomplete, while a previous update is still in flight, or
    /// within three probe timeouts of the previous update.
    pub fn initiate_key_update(&mut self, now: Instant) {
        if self.state.is_closed() || self.spaces[SpaceId::Data].crypto.is_none() {
            debug!("ignoring key update before handshake completion");
            return;
        }
        if self.prev_crypto.is_some() {
            debug!("ignoring key update while previous update is unconfirmed");
            return;
        }
        if let Some(at) = self.key_update_allowed_at {
            if now < at {
                debug!("ignoring key update within grace period");
                return;
            }
        }
        self.update_keys(None, false);
        self.key_update_allowed_at = Some(now + 3 * self.pto(SpaceId::Data));
    }

    fn update_keys(&mut self, end_packet: Option<(u64, Instant)>, remote: bool) {
        trace!("executing key update");
        // Generate keys for the key phase after the one we're switching to, store them in
        // `next_crypto`, make the contents of `next_crypto` current, and move the current keys
        // into `prev_crypto`.
        let new = self
            .crypto
            .next_1rtt_keys()
            .expect("only called for `Data` packets");
        let old = mem::replace(
            &mut self.spaces[SpaceId::Data]
                .crypto
                .as_mut()
                .unwrap() // safe because update_keys() can only be triggered by short packets
                .packet,
            mem::replace(self.next_crypto.as_mut().unwrap(), new),
        );
        self.prev_crypto = Some(PrevCrypto {
            crypto: old,
            end_packet,
            update_unacked: remote,
        });
        self.key_phase = !self.key_phase;
    }

    fn decrypt_packet(
        &mut self,
        now: Instant,
        packet: &mut Packet,
    ) -> Result<Option<u64>, Option<TransportError>> {
        let result = packet_crypto::decrypt_packet_body(
            packet,
            &self.spaces,
            self.zero_rtt_crypto.as_ref(),
            self.key_phase,
            self.prev_crypto.as_ref(),
            self.next_crypto.as_ref(),
        )?;

        let result = match result {
            Some(r) => r,
            None => return Ok(None),
        };

        if result.outgoing_key_update_acked {
            if let Some(prev) = self.prev_crypto.as_mut() {
                prev.end_packet = Some((result.number, now));
                self.set_key_discard_timer(now, packet.header.space());
            }
        }

        if result.incoming_key_update {
            trace!("key update authenticated");
            self.update_keys(Some((result.number, now)), true);
            self.set_key_discard_timer(now, packet.header.space());
        }

        Ok(Some(result.number))
    }

    /// Handle a timeout that fired at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            match timer {
                Timer::Close => {
                    self.state = State::Drained;
                }
                Timer::Idle => {
                    self.kill(ConnectionError::TimedOut);
                }
                Timer::KeepAlive => {
                    trace!("sending keep-alive");
                    self.ping();
                }
                Timer::LossDetection => {
                    self.on_loss_detection_timeout(now);
                }
                Timer::KeyDiscard => {
                    self.zero_rtt_crypto = None;
                    self.prev_crypto = None;
                }
                Timer::Pacing => {
                    trace!("pacing timer expired");
                    // A send opportunity; the caller will poll_transmit
                }
                Timer::MaxAckDelay => {
                    trace!("max ack delay timer expired");
                    self.spaces[SpaceId::Data].pending_acks.on_max_ack_delay();
                }
            }
        }
    }

    /// Send a PING frame, to keep the connection (and its path bindings) alive
    pub fn ping(&mut self) {
        self.spaces[self.highest_space].ping_pending = true;
    }

    /// Close a connection immediately
    ///
    /// This does not ensure delivery of outstanding data. It is the application's responsibility
    /// to call this only when all important communications have been completed, e.g. by calling
    /// [`SendStream::finish`] on outstanding streams and waiting for the corresponding
    /// [`StreamEvent::Finished`] event.
    pub fn close(&mut self, now: Instant, error_code: VarInt, reason: Bytes) {
        self.close_inner(
            now,
            Close::Application(frame::ApplicationClose { error_code, reason }),
        )
    }

    fn close_inner(&mut self, now: Instant, reason: Close) {
        let was_closed = self.state.is_closed();
        if !was_closed {
            if self.error.is_none() {
                self.error = Some(ConnectionError::LocallyClosed);
            }
            self.close_common();
            self.set_close_timer(now);
            self.close = true;
            self.state = State::Closed(state::Closed { reason });
        }
    }

    /// Abort the connection in response to a local protocol failure, notifying the peer
    fn fail(&mut self, now: Instant, error: TransportError) {
        debug!("{}", &error);
        self.error = Some(error.clone().into());
        self.events.push_back(Event::ConnectionLost {
            reason: error.clone().into(),
        });
        self.close_inner(now, Close::Connection(error.into()));
    }

    /// Forcibly terminate all connection activity without notifying the peer
    fn kill(&mut self, reason: ConnectionError) {
        self.close_common();
        self.error = Some(reason.clone());
        self.events.push_back(Event::ConnectionLost { reason });
        self.state = State::Drained;
    }

    fn close_common(&mut self) {
        trace!("connection closed");
        for &timer in &Timer::VALUES {
            self.timers.stop(timer);
        }
    }

    fn set_close_timer(&mut self, now: Instant) {
        self.timers
            .set(Timer::Close, now + 3 * self.pto(self.highest_space));
    }

    /// Validate transport parameters received from the peer
    fn handle_peer_params(&mut self, params: TransportParameters) -> Result<(), TransportError> {
        if Some(self.rem_handshake_cid) != params.initial_src_cid
            || (self.side.is_client()
                && (Some(self.initial_dst_cid) != params.original_dst_cid
                    || self.retry_src_cid != params.retry_src_cid))
        {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "CID authentication failure",
            ));
        }
        params.validate()?;

        self.set_peer_params(params);

        Ok(())
    }

    fn set_peer_params(&mut self, params: TransportParameters) {
        self.streams.set_params(&params);
        self.idle_timeout = transport_parameters::negotiate_max_idle_timeout(
            self.config.max_idle_timeout,
            Some(params.max_idle_timeout),
        );
        trace!("negotiated max idle timeout {:?}", self.idle_timeout);
        if let Some(token) = params.stateless_reset_token {
            self.rem_cids.set_reset_token(token);
        }
        self.local_cid_state
            .set_peer_limit(params.active_connection_id_limit.into_inner());
        self.path.mtu = cmp::min(
            self.path.mtu.max(INITIAL_MTU),
            u16::try_from(params.max_udp_payload_size.into_inner()).unwrap_or(u16::MAX),
        );
        self.peer_params = params;
    }

    /// Whether a CONNECTION_CLOSE frame waits to be sent in `space`
    fn space_can_send(&self, space_id: SpaceId) -> SendableFrames {
        if self.spaces[space_id].crypto.is_none()
            && (space_id != SpaceId::Data || self.zero_rtt_crypto.is_none())
        {
            return SendableFrames {
                acks: false,
                other: false,
            };
        }
        let mut can_send = self.spaces[space_id].can_send(&self.streams);
        if space_id == SpaceId::Data {
            can_send.other |= self.can_send_1rtt();
        }
        can_send
    }

    fn can_send_1rtt(&self) -> bool {
        self.streams.can_send_stream_data() || !self.path_responses.is_empty()
    }

    /// Produce at most one datagram's worth of packets to transmit
    ///
    /// The datagram is written into `buf`, which should be empty and will not be grown past the
    /// path MTU. Assembles at most one packet per eligible encryption level, coalescing ascending
    /// levels into the single datagram.
    pub fn poll_transmit(&mut self, now: Instant, buf: &mut Vec<u8>) -> Option<Transmit> {
        debug_assert!(buf.is_empty());
        if self.state.is_drained() {
            return None;
        }

        // If we need to send a probe, make sure we have something to send.
        for space in SpaceId::iter() {
            self.spaces[space].maybe_queue_probe(&self.streams);
        }

        // Check whether we need to send a close message
        let close = match self.state {
            State::Drained => {
                return None;
            }
            State::Draining | State::Closed(_) => {
                // self.close is only reset once the associated packet had been encoded
                if !self.close {
                    return None;
                }
                true
            }
            _ => false,
        };

        let buf_capacity = usize::from(self.path.mtu);
        let mut builder_storage: Option<PacketBuilder> = None;
        let mut sent_frames: Option<SentFrames> = None;
        let mut pad_datagram = false;
        let mut congestion_blocked = false;
        let mut num_packets = 0;

        for space_id in SpaceId::iter() {
            let can_send = self.space_can_send(space_id);
            if can_send.is_empty() && (!close || self.spaces[space_id].crypto.is_none()) {
                continue;
            }

            let ack_eliciting = !self.spaces[space_id].pending.is_empty(&self.streams)
                || self.spaces[space_id].ping_pending
                || (space_id == SpaceId::Data && self.can_send_1rtt());

            // Can we append another packet into the current datagram?
            let buf_end = if let Some(builder) = &builder_storage {
                buf.len().max(builder.min_size) + builder.tag_len
            } else {
                buf.len()
            };
            if buf_capacity.saturating_sub(buf_end) < MIN_PACKET_SPACE {
                break;
            }

            // Anti-amplification: a server may send no more than 3x the bytes it received from an
            // unvalidated address
            if self.path.anti_amplification_blocked(buf_end as u64 + 1) {
                trace!("blocked by anti-amplification");
                break;
            }

            // Congestion control and pacing checks. Probes and close packets must not be blocked
            // by congestion, or a deadlock could arise
            if ack_eliciting && !close && self.spaces[space_id].loss_probes == 0 && num_packets == 0
            {
                if self.congestion_blocked() {
                    trace!("blocked by congestion control");
                    congestion_blocked = true;
                    continue;
                }

                let smoothed_rtt = self.path.rtt.get();
                if let Some(delay) = self.path.pacing.delay(
                    smoothed_rtt,
                    u64::from(self.path.mtu),
                    self.path.mtu,
                    self.path.congestion.window(),
                    now,
                ) {
                    self.timers.set(Timer::Pacing, delay);
                    congestion_blocked = true;
                    trace!("blocked by pacing");
                    break;
                }
            }

            if self.spaces[space_id].loss_probes > 0 {
                self.spaces[space_id].loss_probes -= 1;
            }

            // Finish the previous packet before starting a new one in another space
            if let Some(builder) = builder_storage.take() {
                builder.finish_and_track(now, self, sent_frames.take(), buf);
            }

            //
            // From here on, we've determined that a packet will definitely be sent.
            //

            if self.spaces[SpaceId::Initial].crypto.is_some()
                && space_id == SpaceId::Handshake
                && self.side.is_client()
            {
                // A client stops both sending and processing Initial packets when it sends its
                // first Handshake packet.
                self.discard_space(now, SpaceId::Initial);
            }
            if let Some(ref mut prev) = self.prev_crypto {
                prev.update_unacked = false;
            }

            let builder = builder_storage.insert(PacketBuilder::new(
                now,
                space_id,
                self.rem_cids.active(),
                buf,
                buf_capacity,
                0,
                ack_eliciting,
                self,
            )?);
            num_packets += 1;

            // https://www.rfc-editor.org/rfc/rfc9000.html#section-14.1
            pad_datagram |=
                space_id == SpaceId::Initial && (self.side.is_client() || ack_eliciting);

            if close {
                trace!("sending CONNECTION_CLOSE");
                // Encode ACKs before the ConnectionClose message, to give the receiver a better
                // approximate on what data has been processed.
                if !self.spaces[space_id].pending_acks.ranges().is_empty() {
                    Self::populate_acks(
                        now,
                        self.receiving_ecn,
                        &mut SentFrames::default(),
                        &mut self.spaces[space_id],
                        buf,
                        &mut self.stats,
                    );
                }

                // Since there are only 64 ACK frames there will always be enough space to encode
                // the ConnectionClose frame too.
                let max_frame_size = builder.max_size - buf.len();
                match self.state {
                    State::Closed(state::Closed { ref reason }) => {
                        if space_id == SpaceId::Data || reason.is_transport_layer() {
                            reason.encode(buf, max_frame_size)
                        } else {
                            frame::ConnectionClose {
                                error_code: TransportErrorCode::APPLICATION_ERROR,
                                frame_type: None,
                                reason: Bytes::new(),
                            }
                            .encode(buf, max_frame_size)
                        }
                    }
                    State::Draining => frame::ConnectionClose {
                        error_code: TransportErrorCode::NO_ERROR,
                        frame_type: None,
                        reason: Bytes::new(),
                    }
                    .encode(buf, max_frame_size),
                    _ => unreachable!(
                        "tried to make a close packet when the connection wasn't closed"
                    ),
                }
                self.stats.frame_tx.connection_close += 1;
                if space_id == self.highest_space {
                    // Don't send another close packet
                    self.close = false;
                    // `CONNECTION_CLOSE` is the final packet
                    break;
                } else {
                    // Send a close frame in every possible space for robustness, per RFC9000
                    // "Immediate Close during the Handshake". Don't bother trying to send
                    // anything else.
                    continue;
                }
            }

            let sent = self.populate_packet(now, space_id, buf, builder.max_size);

            if sent.largest_acked.is_some() {
                self.spaces[space_id].pending_acks.acks_sent();
                self.timers.stop(Timer::MaxAckDelay);
            }

            pad_datagram |= sent.requires_padding;

            sent_frames = Some(sent);
        }

        // Finish the last packet
        if let Some(mut builder) = builder_storage {
            if pad_datagram {
                builder.pad_to(MIN_INITIAL_SIZE);
            }
            builder.finish_and_track(now, self, sent_frames, buf);
        }

        self.app_limited = buf.is_empty() && !congestion_blocked;

        if buf.is_empty() {
            return None;
        }

        trace!("sending {} bytes in {} packets", buf.len(), num_packets);
        self.path.total_sent = self.path.total_sent.saturating_add(buf.len() as u64);
        self.stats.udp_tx.on_traffic(buf.len());

        Some(Transmit {
            destination: self.path.remote,
            size: buf.len(),
            ecn: if self.path.sending_ecn {
                Some(EcnCodepoint::Ect0)
            } else {
                None
            },
        })
    }

    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        max_size: usize,
    ) -> SentFrames {
        let mut sent = SentFrames::default();
        let is_0rtt = space_id == SpaceId::Data && self.spaces[space_id].crypto.is_none();

        // PATH_RESPONSE: answered ahead of everything else so path validation survives
        // a saturated link
        if buf.len() + 9 < max_size && space_id == SpaceId::Data {
            if let Some(token) = self.path_responses.pop() {
                sent.non_retransmits = true;
                sent.requires_padding = true;
                trace!("PATH_RESPONSE {:08x}", token);
                buf.write(FrameType::PATH_RESPONSE);
                buf.write(token);
                self.stats.frame_tx.path_response += 1;
            }
        }

        // ACK
        if self.spaces[space_id].pending_acks.can_send() && !is_0rtt {
            Self::populate_acks(
                now,
                self.receiving_ecn,
                &mut sent,
                &mut self.spaces[space_id],
                buf,
                &mut self.stats,
            );
        }

        let space = &mut self.spaces[space_id];

        // HANDSHAKE_DONE
        if !is_0rtt && mem::replace(&mut space.pending.handshake_done, false) {
            buf.write(FrameType::HANDSHAKE_DONE);
            sent.retransmits.get_or_create().handshake_done = true;
            // This is just a u8 counter and the frame is typically just sent once
            self.stats.frame_tx.handshake_done =
                self.stats.frame_tx.handshake_done.saturating_add(1);
        }

        // PING
        if mem::replace(&mut space.ping_pending, false) {
            trace!("PING");
            buf.write(FrameType::PING);
            sent.non_retransmits = true;
            self.stats.frame_tx.ping += 1;
        }

        // CRYPTO
        while buf.len() + frame::Crypto::SIZE_BOUND < max_size && !is_0rtt {
            let mut frame = match space.pending.crypto.pop_front() {
                Some(x) => x,
                None => break,
            };

            // Calculate the maximum amount of crypto data we can store in the buffer. Since the
            // offset is known, we can reserve the exact size required to encode it. For length we
            // reserve 2 bytes, which allows encoding up to 2^14, more than fits in a packet.
            let max_crypto_data_size = max_size
                - buf.len()
                - 1 // Frame Type
                - VarInt::from_u64(frame.offset).unwrap().size()
                - 2;

            let len = frame
                .data
                .len()
                .min(2usize.pow(14) - 1)
                .min(max_crypto_data_size);

            let data = frame.data.split_to(len);
            let truncated = frame::Crypto {
                offset: frame.offset,
                data,
            };
            trace!(
                "CRYPTO: off {} len {}",
                truncated.offset,
                truncated.data.len()
            );
            truncated.encode(buf);
            self.stats.frame_tx.crypto += 1;
            sent.retransmits.get_or_create().crypto.push_back(truncated);
            if !frame.data.is_empty() {
                frame.offset += len as u64;
                space.pending.crypto.push_front(frame);
            }
        }

        if space_id == SpaceId::Data {
            // Flow control updates and stream aborts
            self.streams.write_control_frames(
                buf,
                &mut space.pending,
                &mut sent.retransmits,
                &mut self.stats.frame_tx,
                max_size,
            );
        }

        // NEW_CONNECTION_ID
        while buf.len() + frame::NewConnectionId::SIZE_BOUND < max_size {
            let issued = match space.pending.new_cids.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(
                sequence = issued.sequence,
                id = %issued.id,
                "NEW_CONNECTION_ID"
            );
            frame::NewConnectionId {
                sequence: issued.sequence,
                retire_prior_to: 0,
                id: issued.id,
                reset_token: issued.reset_token,
            }
            .encode(buf);
            sent.retransmits.get_or_create().new_cids.push(issued);
            self.stats.frame_tx.new_connection_id += 1;
        }

        // RETIRE_CONNECTION_ID
        while buf.len() + frame::RETIRE_CONNECTION_ID_SIZE_BOUND < max_size {
            let seq = match space.pending.retire_cids.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(sequence = seq, "RETIRE_CONNECTION_ID");
            buf.write(FrameType::RETIRE_CONNECTION_ID);
            buf.write_var(seq);
            sent.retransmits.get_or_create().retire_cids.push(seq);
            self.stats.frame_tx.retire_connection_id += 1;
        }

        // STREAM (lost data first through the send buffers, then fresh data, round-robin)
        if space_id == SpaceId::Data {
            sent.stream_frames = self.streams.write_stream_frames(buf, max_size);
            self.stats.frame_tx.stream += sent.stream_frames.len() as u64;

            // Lowest priority: complaints about what stalled us
            let space = &mut self.spaces[space_id];
            self.streams.write_blocked_frames(
                buf,
                &mut space.pending,
                &mut self.stats.frame_tx,
                max_size,
            );
        }

        sent
    }

    /// Write pending ACKs into a buffer
    ///
    /// This method assumes ACKs are pending, and should only be called if
    /// `!PendingAcks::ranges().is_empty()` returns `true`.
    fn populate_acks(
        now: Instant,
        receiving_ecn: bool,
        sent: &mut SentFrames,
        space: &mut PacketSpace,
        buf: &mut Vec<u8>,
        stats: &mut ConnectionStats,
    ) {
        debug_assert!(!space.pending_acks.ranges().is_empty());

        // 0-RTT packets must never carry acks (which would have to be of handshake packets)
        debug_assert!(space.crypto.is_some(), "tried to send ACK in 0-RTT");
        let ecn = if receiving_ecn {
            Some(&space.ecn_counters)
        } else {
            None
        };
        sent.largest_acked = space.pending_acks.ranges().max();

        let delay_micros = space.pending_acks.ack_delay(now).as_micros() as u64;
        // We always advertise the default exponent, so we scale by it here
        let delay = delay_micros
            >> TransportParameters::default()
                .ack_delay_exponent()
                .min(u64::from(u8::MAX));

        trace!(
            "ACK {:?}, Delay = {}us",
            space.pending_acks.ranges(),
            delay_micros
        );

        frame::Ack::encode(delay, space.pending_acks.ranges(), ecn, buf);
        stats.frame_tx.acks += 1;
    }

    /// Whether the connection is in the process of being established
    ///
    /// If this returns `false`, the connection may be either established or closed, signaled by
    /// the emission of a `Connected` or `ConnectionLost` message respectively.
    pub fn is_handshaking(&self) -> bool {
        self.state.is_handshake()
    }

    /// Whether the connection is closed
    ///
    /// Closed connections cannot transport any further data. A connection becomes closed when
    /// either peer application intentionally closes it, or when either transport layer detects an
    /// error such as a time-out or certificate validation failure.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether there is no longer any need to keep the connection around
    ///
    /// Closed connections become drained after a brief timeout to absorb any remaining in-flight
    /// packets from the peer. All drained connections have been closed.
    pub fn is_drained(&self) -> bool {
        self.state.is_drained()
    }

    /// If the connection is closed, the reason why
    pub fn close_reason(&self) -> Option<ConnectionError> {
        self.error.clone()
    }

    /// Look up whether we're the client or server of this Connection
    pub fn side(&self) -> Side {
        self.side.side()
    }

    /// The latest socket address for this connection's peer
    pub fn remote_address(&self) -> SocketAddr {
        self.path.remote
    }

    /// Current best estimate of this connection's latency (round-trip-time)
    pub fn rtt(&self) -> Duration {
        self.path.rtt.get()
    }

    /// Connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Whether 0-RTT data was accepted by the peer
    ///
    /// Only meaningful on clients, after the handshake completes.
    pub fn accepted_0rtt(&self) -> bool {
        self.accepted_0rtt
    }

    /// Whether 0-RTT keys are available for early data
    pub fn has_0rtt(&self) -> bool {
        self.zero_rtt_crypto.is_some()
    }

    /// Bytes of congestion-controlled data currently in flight
    pub fn bytes_in_flight(&self) -> u64 {
        self.path.in_flight.bytes
    }

    /// Size of the current congestion window in bytes
    pub fn congestion_window(&self) -> u64 {
        self.path.congestion.window()
    }

    /// The negotiated application protocol, once available
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.crypto.alpn_protocol()
    }

    /// Whether no timers but keep-alive and idle are running
    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        Timer::VALUES
            .iter()
            .filter(|&&t| t != Timer::KeepAlive)
            .filter_map(|&t| self.timers.get(t))
            .min()
            .map_or(true, |min| Some(min) == self.timers.get(Timer::Idle))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handshake_cid", &self.handshake_cid)
            .finish()
    }
}

/// Fields of `Connection` specific to it being client-side or server-side
enum ConnectionSide {
    Client {
        server_name: String,
        ticket_store: Option<Arc<dyn TicketStore>>,
    },
    Server {
        migration: bool,
    },
}

impl ConnectionSide {
    fn remote_may_migrate(&self) -> bool {
        match self {
            Self::Server { migration } => *migration,
            Self::Client { .. } => false,
        }
    }

    fn is_client(&self) -> bool {
        self.side().is_client()
    }

    fn is_server(&self) -> bool {
        self.side().is_server()
    }

    fn side(&self) -> Side {
        match *self {
            Self::Client { .. } => Side::Client,
            Self::Server { .. } => Side::Server,
        }
    }
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer doesn't implement any supported version
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ApplicationClosed(frame::ApplicationClose),
    /// The peer is unable to continue processing this connection, usually due to having restarted
    #[error("reset by peer")]
    Reset,
    /// Communication with the peer has lapsed for longer than the negotiated idle timeout
    ///
    /// If neither side is sending keep-alives, a connection will time out after a long enough
    /// idle period even if the peer is still reachable.
    #[error("timed out")]
    TimedOut,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
}

impl From<Close> for ConnectionError {
    fn from(x: Close) -> Self {
        match x {
            Close::Connection(reason) => Self::ConnectionClosed(reason),
            Close::Application(reason) => Self::ApplicationClosed(reason),
        }
    }
}

#[derive(Clone)]
pub(crate) enum State {
    Handshake(state::Handshake),
    Established,
    Closed(state::Closed),
    Draining,
    /// Waiting for application to call close so we can dispose of the resources
    Drained,
}

impl State {
    fn rem_cid_set(&self) -> bool {
        match *self {
            Self::Handshake(state::Handshake { rem_cid_set, .. }) => rem_cid_set,
            _ => true,
        }
    }

    fn is_handshake(&self) -> bool {
        matches!(*self, Self::Handshake(_))
    }

    fn is_established(&self) -> bool {
        matches!(*self, Self::Established)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self, Self::Closed(_) | Self::Draining | Self::Drained)
    }

    fn is_drained(&self) -> bool {
        matches!(*self, Self::Drained)
    }
}

mod state {
    use super::{Bytes, Close};

    #[derive(Clone)]
    pub(crate) struct Handshake {
        /// Whether the remote CID has been set by the peer yet
        ///
        /// Always set for servers
        pub(super) rem_cid_set: bool,
        /// First cryptographic message
        ///
        /// Only set for clients, to allow the first flight to be re-sent after a Retry
        pub(super) client_hello: Option<Bytes>,
    }

    #[derive(Clone)]
    pub(crate) struct Closed {
        pub(super) reason: Close,
    }
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// The connection's handshake data is ready
    HandshakeDataReady,
    /// The connection was successfully established
    Connected,
    /// The connection was lost
    ///
    /// Emitted if the peer closes the connection or an error is encountered.
    ConnectionLost {
        /// Reason that the connection was closed
        reason: ConnectionError,
    },
    /// Stream events
    Stream(StreamEvent),
}

fn instant_saturating_sub(x: Instant, y: Instant) -> Duration {
    if x > y {
        x - y
    } else {
        Duration::ZERO
    }
}

// Prevents overflow and improves behavior in extreme circumstances
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// How many 1-RTT packets may outrun the handshake before we start dropping them
const MAX_EARLY_1RTT_PACKETS: usize = 8;

/// Minimal remaining size to allow packet coalescing
///
/// This must be at least as large as the header for a well-formed empty packet to be coalesced,
/// plus some space for frames. We only care about handshake headers because short header packets
/// necessarily have smaller headers, and initial packets are only ever the first packet in a
/// datagram (because we coalesce in ascending packet space order and the only reason to split a
/// packet is when packet space changes).
const MIN_PACKET_SPACE: usize = MAX_HANDSHAKE_OR_0RTT_HEADER_SIZE + 32;

/// Largest amount of space that could be occupied by a Handshake or 0-RTT packet's header
///
/// Excludes packet-type-specific fields such as packet number or Initial token
// https://www.rfc-editor.org/rfc/rfc9000.html#name-0-rtt: flags + version + dcid len + dcid +
// scid len + scid + length + pn
const MAX_HANDSHAKE_OR_0RTT_HEADER_SIZE: usize =
    1 + 4 + 1 + MAX_CID_SIZE + 1 + MAX_CID_SIZE + VarInt::from_u32(u16::MAX as u32).size() + 4;

#[derive(Default)]
struct SentFrames {
    retransmits: ThinRetransmits,
    largest_acked: Option<u64>,
    stream_frames: frame::StreamMetaVec,
    /// Whether the packet contains non-retransmittable frames (like path responses)
    non_retransmits: bool,
    requires_padding: bool,
}
