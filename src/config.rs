use std::{fmt, sync::Arc, time::Duration};

use rand::RngCore;
use thiserror::Error;

use crate::{
    congestion, crypto, shared::ConnectionId, ticket::TicketStore, VarInt, VarIntBoundsExceeded,
    MAX_CID_SIZE,
};

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications. Applications protocols which
/// forbid remotely-initiated streams should set `max_concurrent_bidi_streams` and
/// `max_concurrent_uni_streams` to zero.
///
/// In particular, window sizes for streams, stream data, and overall connection data should be set
/// differently depending on the expected round trip time, link capacity, and memory availability.
/// Tuning for higher bandwidths and latencies increases worst-case memory consumption, but does not
/// impair performance at lower bandwidths and latencies. The default configuration is tuned for a
/// 100Mbps link with a 100ms round trip time.
pub struct TransportConfig {
    pub(crate) max_concurrent_bidi_streams: VarInt,
    pub(crate) max_concurrent_uni_streams: VarInt,
    pub(crate) max_idle_timeout: Option<VarInt>,
    pub(crate) stream_receive_window: VarInt,
    pub(crate) receive_window: VarInt,
    pub(crate) send_window: u64,
    pub(crate) max_udp_payload_size: VarInt,

    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold: f32,
    pub(crate) initial_rtt: Duration,
    pub(crate) persistent_congestion_threshold: u32,
    pub(crate) max_ack_delay: Duration,

    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) crypto_buffer_size: usize,

    pub(crate) congestion_controller_factory:
        Arc<dyn congestion::ControllerFactory + Send + Sync>,
}

impl TransportConfig {
    /// Maximum number of incoming bidirectional streams that may be open concurrently
    ///
    /// Must be nonzero for the peer to open any bidirectional streams.
    pub fn max_concurrent_bidi_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    /// Variant of `max_concurrent_bidi_streams` affecting unidirectional streams
    pub fn max_concurrent_uni_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_uni_streams = value;
        self
    }

    /// Maximum duration of inactivity to accept before timing out the connection
    ///
    /// The true idle timeout is the minimum of this and the peer's own max idle timeout. `None`
    /// represents an infinite timeout.
    ///
    /// **WARNING**: If a peer or its network path malfunctions or acts maliciously, an infinite
    /// idle timeout can result in permanently hung futures!
    pub fn max_idle_timeout(&mut self, value: Option<Duration>) -> Result<&mut Self, ConfigError> {
        self.max_idle_timeout = match value {
            Some(x) => Some(
                VarInt::from_u64(x.as_millis() as u64).map_err(|_| ConfigError::OutOfBounds)?,
            ),
            None => None,
        };
        Ok(self)
    }

    /// Maximum number of bytes the peer may transmit without acknowledgement on any one stream
    /// before becoming blocked.
    ///
    /// This should be set to at least the expected connection latency multiplied by the maximum
    /// desired throughput. Setting this smaller than `receive_window` helps ensure that a single
    /// stream doesn't monopolize receive buffers, which may otherwise occur if the application
    /// chooses not to read from a large stream for a time while still requiring data on other
    /// streams.
    pub fn stream_receive_window(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window = value;
        self
    }

    /// Maximum number of bytes the peer may transmit across all streams of a connection before
    /// becoming blocked.
    ///
    /// This should be set to at least the expected connection latency multiplied by the maximum
    /// desired throughput. Larger values can be useful to allow maximum throughput within a
    /// stream while another is blocked.
    pub fn receive_window(&mut self, value: VarInt) -> &mut Self {
        self.receive_window = value;
        self
    }

    /// Maximum number of bytes to transmit to a peer without acknowledgment
    ///
    /// Provides an upper bound on memory when communicating with peers that issue large amounts of
    /// flow control credit.
    pub fn send_window(&mut self, value: u64) -> &mut Self {
        self.send_window = value;
        self
    }

    /// The largest UDP payload this endpoint is willing to receive, advertised to the peer
    pub fn max_udp_payload_size(&mut self, value: u16) -> Result<&mut Self, ConfigError> {
        if value < 1200 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_udp_payload_size = VarInt::from_u32(value.into());
        Ok(self)
    }

    /// Maximum reordering in packet number space before FACK style loss detection considers a
    /// packet lost. Should not be less than 3, per RFC5681.
    pub fn packet_threshold(&mut self, value: u32) -> &mut Self {
        self.packet_threshold = value;
        self
    }

    /// Maximum reordering in time space before time based loss detection considers a packet lost,
    /// as a factor of RTT
    pub fn time_threshold(&mut self, value: f32) -> &mut Self {
        self.time_threshold = value;
        self
    }

    /// The RTT used before an RTT sample is taken
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// Number of consecutive PTOs after which network is considered to be experiencing persistent
    /// congestion.
    pub fn persistent_congestion_threshold(&mut self, value: u32) -> &mut Self {
        self.persistent_congestion_threshold = value;
        self
    }

    /// Upper bound on acknowledgment deferral, advertised to the peer
    ///
    /// Must be at most 2^14 ms per the encoding of the corresponding transport parameter.
    pub fn max_ack_delay(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.as_millis() >= 1 << 14 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_ack_delay = value;
        Ok(self)
    }

    /// Period of inactivity before sending a keep-alive packet
    ///
    /// Keep-alive packets prevent an inactive but otherwise healthy connection from timing out.
    ///
    /// `None` to disable, which is the default. Only one side of any given connection needs
    /// keep-alive enabled for the connection to be preserved. Must be set lower than the
    /// idle_timeout of both peers to be effective.
    pub fn keep_alive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keep_alive_interval = value;
        self
    }

    /// Maximum quantity of out-of-order crypto layer data to buffer
    pub fn crypto_buffer_size(&mut self, value: usize) -> &mut Self {
        self.crypto_buffer_size = value;
        self
    }

    /// How to construct a congestion controller for new paths
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn congestion::ControllerFactory + Send + Sync>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        Self {
            max_concurrent_bidi_streams: 100u32.into(),
            max_concurrent_uni_streams: 100u32.into(),
            max_idle_timeout: Some(VarInt(10_000)),
            stream_receive_window: STREAM_RWND.into(),
            receive_window: VarInt::MAX,
            send_window: (8 * STREAM_RWND).into(),
            max_udp_payload_size: VarInt::from_u32(65527),

            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            initial_rtt: Duration::from_millis(333), // RFC 9002 §6.2.2 default
            persistent_congestion_threshold: 3,
            max_ack_delay: Duration::from_millis(25),

            keep_alive_interval: None,
            crypto_buffer_size: 16 * 1024,

            congestion_controller_factory: Arc::new(congestion::CubicConfig::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field(
                "max_concurrent_bidi_streams",
                &self.max_concurrent_bidi_streams,
            )
            .field(
                "max_concurrent_uni_streams",
                &self.max_concurrent_uni_streams,
            )
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("stream_receive_window", &self.stream_receive_window)
            .field("receive_window", &self.receive_window)
            .field("send_window", &self.send_window)
            .field("max_udp_payload_size", &self.max_udp_payload_size)
            .field("packet_threshold", &self.packet_threshold)
            .field("time_threshold", &self.time_threshold)
            .field("initial_rtt", &self.initial_rtt)
            .field(
                "persistent_congestion_threshold",
                &self.persistent_congestion_threshold,
            )
            .field("max_ack_delay", &self.max_ack_delay)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("crypto_buffer_size", &self.crypto_buffer_size)
            .finish_non_exhaustive()
    }
}

/// Generates local connection IDs
///
/// Connection IDs are opaque routing labels; embedders that demultiplex many
/// connections on one socket may substitute a generator whose output encodes
/// routing state, as long as the length is stable.
pub trait ConnectionIdGenerator: Send + Sync {
    /// Generate a new CID
    fn generate_cid(&self, rng: &mut dyn RngCore) -> ConnectionId;
    /// Length of CIDs issued by this generator, which the short-header parser relies on
    fn cid_len(&self) -> usize;
}

/// Generates purely random connection IDs of a fixed length
#[derive(Debug, Clone, Copy)]
pub struct RandomConnectionIdGenerator {
    cid_len: usize,
}

impl Default for RandomConnectionIdGenerator {
    fn default() -> Self {
        Self { cid_len: 8 }
    }
}

impl RandomConnectionIdGenerator {
    /// Initialize Random CID generator with a fixed CID length, at most `MAX_CID_SIZE`
    pub fn new(cid_len: usize) -> Self {
        debug_assert!(cid_len <= MAX_CID_SIZE);
        Self { cid_len }
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate_cid(&self, rng: &mut dyn RngCore) -> ConnectionId {
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..self.cid_len]);
        ConnectionId::new(&bytes[..self.cid_len])
    }

    fn cid_len(&self) -> usize {
        self.cid_len
    }
}

/// Configuration for outgoing connections
pub struct ClientConfig {
    /// Transport configuration to use
    pub transport: Arc<TransportConfig>,
    /// Cryptographic session configuration to use
    pub crypto: Arc<dyn crypto::ClientConfig>,
    /// Source of local connection IDs issued to the peer
    pub cid_generator: Arc<dyn ConnectionIdGenerator>,
    /// Where to look up and deposit per-server session state, if anywhere
    pub ticket_store: Option<Arc<dyn TicketStore>>,
}

impl ClientConfig {
    /// Create a client configuration with the given cryptographic config
    pub fn new(crypto: Arc<dyn crypto::ClientConfig>) -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            crypto,
            cid_generator: Arc::new(RandomConnectionIdGenerator::default()),
            ticket_store: None,
        }
    }
}

/// Configuration for incoming connections
pub struct ServerConfig {
    /// Transport configuration to use
    pub transport: Arc<TransportConfig>,
    /// Cryptographic session configuration to use
    pub crypto: Arc<dyn crypto::ServerConfig>,
    /// Source of local connection IDs issued to the peer
    pub cid_generator: Arc<dyn ConnectionIdGenerator>,
    /// Whether to accept a peer transmitting from a new address
    ///
    /// Improves behavior for clients that move between different internet connections or suffer
    /// NAT rebinding.
    pub migration: bool,
}

impl ServerConfig {
    /// Create a server configuration with the given cryptographic config
    pub fn new(crypto: Arc<dyn crypto::ServerConfig>) -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            crypto,
            cid_generator: Arc::new(RandomConnectionIdGenerator::default()),
            migration: true,
        }
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}

impl From<VarIntBoundsExceeded> for ConfigError {
    fn from(_: VarIntBoundsExceeded) -> Self {
        Self::OutOfBounds
    }
}

/// Errors in the parameters being used to create a new connection
///
/// These arise before any I/O has been performed.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConnectError {
    /// The given server name was malformed
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    /// The local configuration was invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}
