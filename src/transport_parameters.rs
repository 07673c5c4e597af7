//! QUIC connection transport parameters
//!
//! The `TransportParameters` type is used to represent the transport parameters
//! negotiated by peers while establishing a QUIC connection. This process
//! happens as part of the establishment of the TLS session. As such, the types
//! contained in this modules should generally only be referred to by custom
//! implementations of the `crypto::Session` trait.

use std::convert::TryFrom;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    config::{ServerConfig, TransportConfig},
    shared::ConnectionId,
    token::ResetToken,
    Side, TransportError, VarInt, LOC_CID_COUNT, MAX_CID_SIZE, RESET_TOKEN_SIZE,
    TIMER_GRANULARITY,
};

// Apply a given macro to a list of all the transport parameters having integer types, along with
// their codes and default values. Using this helps us avoid error-prone duplication of the
// contained information across decoding, encoding, and the `Default` impl. Whenever we want to
// do something with transport parameters, we'll handle the bulk of cases by writing a macro that
// takes a list of arguments in this form, then passing it to this macro.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // #[doc] name (id) = default,
            /// Milliseconds, disabled if zero
            max_idle_timeout(0x0001) = 0,
            /// Limits the size of UDP payloads that the endpoint is willing to receive
            max_udp_payload_size(0x0003) = 65527,

            /// Initial value for the maximum amount of data that can be sent on the connection
            initial_max_data(0x0004) = 0,
            /// Initial flow control limit for locally-initiated bidirectional streams
            initial_max_stream_data_bidi_local(0x0005) = 0,
            /// Initial flow control limit for peer-initiated bidirectional streams
            initial_max_stream_data_bidi_remote(0x0006) = 0,
            /// Initial flow control limit for unidirectional streams
            initial_max_stream_data_uni(0x0007) = 0,

            /// Initial maximum number of bidirectional streams the peer may initiate
            initial_max_streams_bidi(0x0008) = 0,
            /// Initial maximum number of unidirectional streams the peer may initiate
            initial_max_streams_uni(0x0009) = 0,

            /// Exponent used to decode the ACK Delay field in the ACK frame
            ack_delay_exponent(0x000a) = 3,
            /// Maximum amount of time in milliseconds by which the endpoint will delay sending
            /// acknowledgments
            max_ack_delay(0x000b) = 25,
            /// Maximum number of connection IDs from the peer that an endpoint is willing to store
            active_connection_id_limit(0x000e) = 2,
        }
    };
}

macro_rules! make_struct {
    {$($(#[$doc:meta])* $name:ident ($code:literal) = $default:literal,)*} => {
        /// Transport parameters used to negotiate connection-level preferences between peers
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $($(#[$doc])* pub(crate) $name : VarInt,)*

            /// The peer must not probe other network paths
            pub(crate) disable_active_migration: bool,

            // Anti-injection bindings; the server sends the first three, both sides validate
            /// The DCID from the first Initial packet; must be included if sent in a Retry packet
            pub(crate) original_dst_cid: Option<ConnectionId>,
            /// The value that the endpoint included in the Source Connection ID field of the first
            /// Initial packet it sends for the connection
            pub(crate) initial_src_cid: Option<ConnectionId>,
            /// The value of the Source Connection ID field from the server's Retry packet
            pub(crate) retry_src_cid: Option<ConnectionId>,
            /// Token used by the client to verify a stateless reset from the server
            pub(crate) stateless_reset_token: Option<ResetToken>,
        }

        // We deliberately don't implement the `Default` trait, since that would be public, and
        // downstream crates should never construct `TransportParameters` except by decoding those
        // supplied by a peer.
        impl TransportParameters {
            /// Standard defaults, used if the peer does not supply a given parameter.
            pub(crate) fn default() -> Self {
                Self {
                    $($name: VarInt::from_u32($default),)*

                    disable_active_migration: false,
                    original_dst_cid: None,
                    initial_src_cid: None,
                    retry_src_cid: None,
                    stateless_reset_token: None,
                }
            }
        }
    }
}

apply_params!(make_struct);

impl TransportParameters {
    pub(crate) fn new(config: &TransportConfig, server_config: Option<&ServerConfig>) -> Self {
        Self {
            initial_max_streams_bidi: config.max_concurrent_bidi_streams,
            initial_max_streams_uni: config.max_concurrent_uni_streams,
            initial_max_data: config.receive_window,
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            max_udp_payload_size: config.max_udp_payload_size,
            max_idle_timeout: config.max_idle_timeout.unwrap_or(VarInt(0)),
            max_ack_delay: VarInt::try_from(config.max_ack_delay.as_millis() as u64)
                .expect("config validated"),
            active_connection_id_limit: VarInt::from_u32(LOC_CID_COUNT as u32),
            disable_active_migration: server_config.is_some_and(|c| !c.migration),
            ..Self::default()
        }
    }

    /// Check that these parameters are legal to send from a server
    pub(crate) fn validate(&self) -> Result<(), TransportError> {
        if self.ack_delay_exponent.0 > 20
            || self.max_ack_delay.0 >= 1 << 14
            || self.max_udp_payload_size.0 < 1200
            || self.active_connection_id_limit.0 < 2
        {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "illegal value",
            ));
        }
        Ok(())
    }

    /// The negotiated maximum delay the peer may wait before acknowledging
    pub(crate) fn max_ack_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_ack_delay.0)
    }

    /// The granularity applied when scaling ACK delays for transmission
    pub(crate) fn ack_delay_exponent(&self) -> u64 {
        self.ack_delay_exponent.0
    }
}

/// Errors encountered while decoding `TransportParameters`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// Parameters that are semantically invalid
    #[error("parameter had illegal value")]
    IllegalValue,
    /// Catch-all error for problems while decoding transport parameters
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        match e {
            Error::IllegalValue => Self::TRANSPORT_PARAMETER_ERROR("illegal value"),
            Error::Malformed => Self::TRANSPORT_PARAMETER_ERROR("malformed"),
        }
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Malformed
    }
}

impl TransportParameters {
    /// Encode `TransportParameters` into buf
    pub fn write<W: BufMut>(&self, w: &mut W) {
        macro_rules! write_params {
            {$($(#[$doc:meta])* $name:ident ($code:literal) = $default:literal,)*} => {
                $(
                    if self.$name.0 != $default {
                        w.write_var($code);
                        w.write(VarInt::try_from(self.$name.size()).unwrap());
                        w.write(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if self.disable_active_migration {
            w.write_var(0x0c);
            w.write_var(0);
        }

        if let Some(ref x) = self.original_dst_cid {
            w.write_var(0x00);
            w.write_var(x.len() as u64);
            w.put_slice(x);
        }
        if let Some(ref x) = self.initial_src_cid {
            w.write_var(0x0f);
            w.write_var(x.len() as u64);
            w.put_slice(x);
        }
        if let Some(ref x) = self.retry_src_cid {
            w.write_var(0x10);
            w.write_var(x.len() as u64);
            w.put_slice(x);
        }
        if let Some(ref x) = self.stateless_reset_token {
            w.write_var(0x02);
            w.write_var(RESET_TOKEN_SIZE as u64);
            w.put_slice(x);
        }
    }

    /// Decode `TransportParameters` from buf
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        // Values of the Integer-valued transport parameters that have not been received
        let mut params = Self::default();
        // State to check for duplicate transport parameters.
        macro_rules! param_state {
            {$($(#[$doc:meta])* $name:ident ($code:literal) = $default:literal,)*} => {{
                struct ParamState {
                    $($name: bool,)*
                }

                ParamState {
                    $($name: false,)*
                }
            }}
        }
        let mut got = apply_params!(param_state);

        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()?;
            if (r.remaining() as u64) < len {
                return Err(Error::Malformed);
            }
            let len = len as usize;

            match id {
                0x00 => decode_cid(len, &mut params.original_dst_cid, r)?,
                0x02 => {
                    if len != RESET_TOKEN_SIZE || params.stateless_reset_token.is_some() {
                        return Err(Error::Malformed);
                    }
                    let mut tok = [0; RESET_TOKEN_SIZE];
                    r.copy_to_slice(&mut tok);
                    params.stateless_reset_token = Some(tok.into());
                }
                0x0c => {
                    if len != 0 || params.disable_active_migration {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                0x0f => decode_cid(len, &mut params.initial_src_cid, r)?,
                0x10 => decode_cid(len, &mut params.retry_src_cid, r)?,
                _ => {
                    macro_rules! parse {
                        {$($(#[$doc:meta])* $name:ident ($code:literal) = $default:literal,)*} => {
                            match id {
                                $($code => {
                                    let value = r.get::<VarInt>()?;
                                    if len != value.size() || got.$name { return Err(Error::Malformed); }
                                    params.$name = value;
                                    got.$name = true;
                                })*
                                // Skip unknown and reserved parameters
                                _ => r.advance(len as usize),
                            }
                        }
                    }
                    apply_params!(parse);
                }
            }
        }

        // Semantic validation

        if params.ack_delay_exponent.0 > 20
            || params.max_ack_delay.0 >= 1 << 14
            || params.active_connection_id_limit.0 < 2
            || params.max_udp_payload_size.0 < 1200
            || params.initial_max_streams_bidi.0 > MAX_STREAMS
            || params.initial_max_streams_uni.0 > MAX_STREAMS
            // Parameters that servers never send
            || (side.is_server()
                && (params.original_dst_cid.is_some()
                    || params.retry_src_cid.is_some()
                    || params.stateless_reset_token.is_some()))
        {
            return Err(Error::IllegalValue);
        }

        Ok(params)
    }
}

/// Maximum number of streams representable by a stream limit parameter
const MAX_STREAMS: u64 = 1 << 60;

fn decode_cid<R: Buf>(
    len: usize,
    value: &mut Option<ConnectionId>,
    r: &mut R,
) -> Result<(), Error> {
    if len > MAX_CID_SIZE || value.is_some() {
        return Err(Error::Malformed);
    }
    *value = Some(ConnectionId::from_buf(r, len));
    Ok(())
}

/// Negotiate the idle timeout from both sides' max_idle_timeout parameters
///
/// Zero disables the timeout on a side; the effective value is the minimum of
/// the sides that enabled one, floored at the timer granularity.
pub(crate) fn negotiate_max_idle_timeout(
    ours: Option<VarInt>,
    theirs: Option<VarInt>,
) -> Option<std::time::Duration> {
    let ms = match (
        ours.filter(|x| x.0 != 0),
        theirs.filter(|x| x.0 != 0),
    ) {
        (None, None) => return None,
        (Some(x), None) | (None, Some(x)) => x.0,
        (Some(x), Some(y)) => x.0.min(y.0),
    };
    Some(std::time::Duration::from_millis(ms).max(TIMER_GRANULARITY))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn coding() {
        let mut buf = Vec::new();
        let params = TransportParameters {
            initial_max_data: VarInt(42),
            initial_max_stream_data_bidi_local: VarInt(10),
            initial_max_stream_data_bidi_remote: VarInt(11),
            initial_max_stream_data_uni: VarInt(12),
            initial_max_streams_bidi: VarInt(13),
            max_idle_timeout: VarInt(5000),
            initial_src_cid: Some(ConnectionId::new(&[0xab; 8])),
            stateless_reset_token: Some([0x11; RESET_TOKEN_SIZE].into()),
            ..TransportParameters::default()
        };
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()).unwrap(),
            params
        );
    }

    #[test]
    fn read_semantic_validation() {
        let illegal_params_builders: Vec<Box<dyn FnMut(&mut TransportParameters)>> = vec![
            Box::new(|t| {
                // ack_delay_exponent must be <= 20
                t.ack_delay_exponent = VarInt(21);
            }),
            Box::new(|t| {
                // max_udp_payload_size must be >= 1200
                t.max_udp_payload_size = VarInt(1199);
            }),
            Box::new(|t| {
                // active_connection_id_limit must be >= 2
                t.active_connection_id_limit = VarInt(1);
            }),
            Box::new(|t| {
                // a server must not send a stateless reset token to a server
                t.stateless_reset_token = Some([0; RESET_TOKEN_SIZE].into());
            }),
        ];

        for mut builder in illegal_params_builders {
            let mut buf = Vec::new();
            let mut params = TransportParameters::default();
            builder(&mut params);
            params.write(&mut buf);
            assert_eq!(
                TransportParameters::read(Side::Server, &mut buf.as_slice()),
                Err(Error::IllegalValue)
            );
        }
    }

    #[test]
    fn duplicate_param_rejected() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.write_var(0x04); // initial_max_data
            buf.write_var(1);
            buf.write_var(42);
        }
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn unknown_params_ignored() {
        let mut buf = Vec::new();
        buf.write_var(0x4242); // grease
        buf.write_var(3);
        buf.put_slice(&[1, 2, 3]);
        let params = TransportParameters::read(Side::Client, &mut buf.as_slice()).unwrap();
        assert_eq!(params.initial_max_data, VarInt(0));
    }

    #[test]
    fn idle_negotiation() {
        assert_eq!(negotiate_max_idle_timeout(None, None), None);
        assert_eq!(
            negotiate_max_idle_timeout(Some(VarInt(0)), Some(VarInt(0))),
            None
        );
        assert_eq!(
            negotiate_max_idle_timeout(Some(VarInt(5000)), Some(VarInt(0))),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            negotiate_max_idle_timeout(Some(VarInt(5000)), Some(VarInt(2000))),
            Some(Duration::from_secs(2))
        );
    }
}
