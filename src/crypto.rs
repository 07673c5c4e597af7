//! Traits and implementations for the QUIC cryptography protocol
//!
//! The protocol logic in this crate is contained in types that abstract over
//! the actual cryptographic protocol used. This module contains the traits
//! used for this abstraction layer, together with *ring*-backed packet
//! protection primitives that implementations of [`Session`] (normally a thin
//! wrapper around a TLS 1.3 stack) can reuse.
//!
//! Note that usage of any protocol (version) other than TLS 1.3 does not
//! conform to any published versions of the specification, and will not be
//! supported in QUIC v1.

use bytes::BytesMut;

use crate::{
    shared::ConnectionId, transport_parameters::TransportParameters, ConnectError, Side,
    TransportError,
};

/// Packet protection primitives based on *ring*
pub mod ring;

/// A cryptographic session (commonly TLS)
///
/// The connection feeds CRYPTO stream bytes in per epoch, pulls CRYPTO bytes
/// to transmit back out, and installs the key material the session surfaces
/// whenever an epoch transition completes.
pub trait Session: Send + 'static {
    /// Create the initial set of keys given the client's initial destination ConnectionId
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys;

    /// Get the 0-RTT keys if available (clients only)
    ///
    /// On the client side, this method can be used to see if 0-RTT key material is available
    /// to start sending data before the protocol handshake has completed.
    fn early_crypto(&self) -> Option<(Box<dyn HeaderKey>, Box<dyn PacketKey>)>;

    /// If the 0-RTT-encrypted data has been accepted by the peer
    fn early_data_accepted(&self) -> Option<bool>;

    /// Returns `true` until the connection is fully established.
    fn is_handshaking(&self) -> bool;

    /// Read bytes of handshake data
    ///
    /// This should be called with the contents of `CRYPTO` frames. If it returns `Ok`, the
    /// caller should call `write_handshake()` to check if the crypto protocol has anything
    /// to send to the peer. On success, returns whether a `handshake data ready` event
    /// should be issued (e.g. the ALPN protocol was just negotiated).
    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError>;

    /// The peer's QUIC transport parameters
    ///
    /// These are only available after the first flight from the peer has been received.
    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError>;

    /// Writes handshake bytes into the given buffer and optionally returns the negotiated keys
    ///
    /// When the handshake proceeds to the next phase, this method will return a new set of
    /// keys to encrypt data with.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys>;

    /// Compute the keys for the next key phase
    ///
    /// Only meaningful after the handshake keys are established; returns `None` earlier.
    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>>;

    /// Verify the integrity of a Retry packet
    ///
    /// `header` is the Retry header as received, `payload` the token followed by the
    /// integrity tag.
    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool;

    /// The negotiated application protocol, once the handshake has progressed far enough
    fn alpn_protocol(&self) -> Option<Vec<u8>>;
}

/// Client-side configuration for the crypto protocol
pub trait ClientConfig: Send + Sync {
    /// Start a client session with this configuration
    ///
    /// `params` are the local transport parameters to convey to the server in
    /// the relevant extension.
    fn start_session(
        &self,
        server_name: &str,
        params: &TransportParameters,
    ) -> Result<Box<dyn Session>, ConnectError>;
}

/// Server-side configuration for the crypto protocol
pub trait ServerConfig: Send + Sync {
    /// Start a server session with this configuration
    fn start_session(&self, params: &TransportParameters) -> Box<dyn Session>;
}

/// A complete set of keys for a certain epoch
pub struct Keys {
    /// Header protection keys
    pub header: KeyPair<Box<dyn HeaderKey>>,
    /// Packet protection keys
    pub packet: KeyPair<Box<dyn PacketKey>>,
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Key for encrypting data
    pub local: T,
    /// Key for decrypting data
    pub remote: T,
}

/// Keys used to protect packet payloads
pub trait PacketKey: Send + Sync {
    /// Encrypt the packet payload with the given packet number
    ///
    /// `buf` contains the header (the first `header_len` bytes), the payload,
    /// and `tag_len()` bytes of trailing space for the tag.
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize);
    /// Decrypt the packet payload with the given packet number, in place
    ///
    /// On success `payload` is truncated to the plaintext length.
    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
}

/// Keys used to protect packet headers
pub trait HeaderKey: Send + Sync {
    /// Decrypt the given packet's header
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Encrypt the given packet's header
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// Generic crypto errors
///
/// This error carries no details deliberately: leaking why a packet failed to
/// authenticate can hand an attacker an oracle.
#[derive(Debug)]
pub struct CryptoError;
