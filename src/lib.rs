//! Protocol state machine for a single QUIC v1 connection.
//!
//! This crate turns an unordered sequence of UDP datagrams into
//! authenticated, loss-recovered, flow-controlled byte streams, and back. It
//! performs no I/O of its own: datagrams, timeouts and a clock are fed in by
//! the caller, and outgoing datagrams, timer deadlines and application events
//! are polled back out. The UDP socket, the TLS implementation (behind
//! [`crypto::Session`]) and the listener that routes datagrams to connections
//! by connection ID are all the embedder's responsibility.
//!
//! The central type is [`Connection`]. A typical driver loop calls
//! [`Connection::handle_datagram`] and [`Connection::handle_timeout`] as
//! inputs arrive, then drains [`Connection::poll_transmit`],
//! [`Connection::poll_timeout`] and [`Connection::poll`] after every batch of
//! inputs or application calls.

use std::{fmt, net::SocketAddr, ops, time::Duration};

mod cid_queue;
mod coding;
mod range_set;
mod ticket;
mod varint;

pub use crate::ticket::{MemoryTicketStore, SessionTicket, TicketStore};
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

mod config;
pub use crate::config::{
    ClientConfig, ConfigError, ConnectError, ConnectionIdGenerator, RandomConnectionIdGenerator,
    ServerConfig, TransportConfig,
};

pub mod congestion;

mod connection;
pub use crate::connection::{
    Chunk, ClosedStream, Connection, ConnectionError, ConnectionStats, Event, FinishError,
    FrameStats, PathStats, ReadError, RecvStream, RttEstimator, SendStream, StreamEvent, Streams,
    Timer, WriteError,
};

pub mod crypto;

mod frame;
pub use crate::frame::{ApplicationClose, Close, ConnectionClose};

mod packet;
pub use crate::packet::{PacketDecodeError, PartialDecode, SpaceId};

mod shared;
pub use crate::shared::{ConnectionId, EcnCodepoint};

mod token;
pub use crate::token::ResetToken;

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};

mod transport_parameters;
pub use crate::transport_parameters::TransportParameters;

#[cfg(test)]
mod tests;

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().cloned()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(f, "{} {}directional stream {}", initiator, dir, self.index())
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        unsafe { Self::from_u64_unchecked(x.0) }
    }
}

impl From<VarInt> for StreamId {
    fn from(v: VarInt) -> Self {
        Self(v.into_inner())
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).unwrap().encode(buf);
    }
}

/// An outgoing UDP datagram, ready for the wire
#[derive(Debug)]
#[must_use]
pub struct Transmit {
    /// The socket address this datagram should be sent to
    pub destination: SocketAddr,
    /// Explicit congestion notification bits to set on the packet
    pub ecn: Option<EcnCodepoint>,
    /// Amount of data written to the caller-supplied buffer
    pub size: usize,
}

//
// Useful internal constants
//

/// Number of local connection IDs kept issued to the peer, peer limit permitting
const LOC_CID_COUNT: u64 = 4;
const RESET_TOKEN_SIZE: usize = 16;
const MAX_CID_SIZE: usize = 20;
const MIN_INITIAL_SIZE: u16 = 1200;
/// The path MTU assumed until the peer's max_udp_payload_size is known
const INITIAL_MTU: u16 = 1200;
/// The maximum number of streams of one directionality representable on the wire
const MAX_STREAM_COUNT: u64 = 1 << 60;
/// Resolution promised by the clock contract
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Server, Dir::Uni, 55);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
        assert_eq!(id.index(), 55);
        assert_eq!(id.0, 55 << 2 | 0x2 | 0x1);
    }
}
