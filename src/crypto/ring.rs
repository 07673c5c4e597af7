//! Packet protection built on *ring*
//!
//! Everything here is derived key material: [`Secrets`] holds one epoch's
//! per-direction traffic secrets and expands them into AEAD and header
//! protection keys with the TLS 1.3 `HKDF-Expand-Label` construction.

use ring::{aead, hkdf};

use crate::{
    crypto::{self, CryptoError, KeyPair, Keys},
    packet::{LONG_HEADER_FORM, RETRY_TAG_SIZE},
    shared::ConnectionId,
    Side,
};

/// Salt for deriving initial secrets, from RFC 9001 §5.2
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Key for Retry packet integrity tags, from RFC 9001 §5.8
const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_INTEGRITY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// AEAD suites usable for packet protection in QUIC v1
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherSuite {
    /// AES-128-GCM, the default
    Aes128Gcm,
    /// ChaCha20-Poly1305, selected by cipher-suite negotiation
    ChaCha20Poly1305,
}

impl CipherSuite {
    fn aead(self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::AES_128_GCM,
            Self::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn header_protection(self) -> &'static aead::quic::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::quic::AES_128,
            Self::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }
}

/// One epoch's traffic secrets for both directions
///
/// Retained by `Session` implementations across the 1-RTT epoch so that
/// successive key generations can be derived for key updates.
pub struct Secrets {
    suite: CipherSuite,
    local: hkdf::Prk,
    remote: hkdf::Prk,
}

impl Secrets {
    /// Construct from raw traffic secrets, e.g. as exported by a TLS stack
    pub fn new(suite: CipherSuite, local: &[u8], remote: &[u8]) -> Self {
        Self {
            suite,
            local: hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, local),
            remote: hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, remote),
        }
    }

    /// Expand the full key set for this generation
    pub fn keys(&self) -> Keys {
        Keys {
            header: KeyPair {
                local: Box::new(header_key(self.suite, &self.local)) as Box<dyn crypto::HeaderKey>,
                remote: Box::new(header_key(self.suite, &self.remote)) as _,
            },
            packet: self.packet_keys(),
        }
    }

    /// Expand packet protection keys only, leaving header keys untouched
    ///
    /// Header protection keys do not rotate across key updates.
    pub fn packet_keys(&self) -> KeyPair<Box<dyn crypto::PacketKey>> {
        KeyPair {
            local: Box::new(PacketKey::new(self.suite, &self.local)) as Box<dyn crypto::PacketKey>,
            remote: Box::new(PacketKey::new(self.suite, &self.remote)) as _,
        }
    }

    /// Advance both directions to the next key generation (`quic ku`)
    pub fn update(&mut self) {
        self.local = next_secret(&self.local);
        self.remote = next_secret(&self.remote);
    }
}

/// Derive the initial-epoch keys for the given client-chosen destination CID
pub fn initial_keys(dst_cid: &ConnectionId, side: Side) -> Keys {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
    let initial_secret = salt.extract(dst_cid);
    let client = expand_prk(&initial_secret, b"client in");
    let server = expand_prk(&initial_secret, b"server in");
    let (local, remote) = match side {
        Side::Client => (client, server),
        Side::Server => (server, client),
    };
    Secrets {
        suite: CipherSuite::Aes128Gcm,
        local,
        remote,
    }
    .keys()
}

/// Compute the integrity tag for a Retry packet
///
/// `packet` is the Retry packet contents up to but excluding the tag itself.
pub fn retry_tag(orig_dst_cid: &ConnectionId, packet: &[u8]) -> [u8; RETRY_TAG_SIZE] {
    let mut pseudo_packet = Vec::with_capacity(packet.len() + orig_dst_cid.len() + 1);
    pseudo_packet.push(orig_dst_cid.len() as u8);
    pseudo_packet.extend_from_slice(orig_dst_cid);
    pseudo_packet.extend_from_slice(packet);

    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY).unwrap(),
    );
    let nonce = aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE);
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(pseudo_packet), &mut [])
        .unwrap();
    let mut result = [0; RETRY_TAG_SIZE];
    result.copy_from_slice(tag.as_ref());
    result
}

/// Packet protection key for one direction of one generation
pub struct PacketKey {
    key: aead::LessSafeKey,
    /// Computed once to avoid redundant HKDF invocations per packet
    iv: [u8; aead::NONCE_LEN],
}

impl PacketKey {
    fn new(suite: CipherSuite, secret: &hkdf::Prk) -> Self {
        let mut key_bytes = [0; 32];
        let key_bytes = &mut key_bytes[..suite.aead().key_len()];
        expand_label(secret, b"quic key", key_bytes);
        let mut iv = [0; aead::NONCE_LEN];
        expand_label(secret, b"quic iv", &mut iv);
        Self {
            key: aead::LessSafeKey::new(aead::UnboundKey::new(suite.aead(), key_bytes).unwrap()),
            iv,
        }
    }

    fn nonce(&self, packet: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, p) in nonce[4..].iter_mut().zip(packet.to_be_bytes()) {
            *b ^= p;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl crypto::PacketKey for PacketKey {
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) {
        let (header, payload_tag) = buf.split_at_mut(header_len);
        let (payload, tag_storage) = payload_tag.split_at_mut(payload_tag.len() - self.tag_len());
        let aad = aead::Aad::from(&*header);
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet), aad, payload)
            .unwrap();
        tag_storage.copy_from_slice(tag.as_ref());
    }

    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut bytes::BytesMut,
    ) -> Result<(), CryptoError> {
        if payload.len() < self.tag_len() {
            return Err(CryptoError);
        }
        let aad = aead::Aad::from(header);
        let plain_len = self
            .key
            .open_in_place(self.nonce(packet), aad, payload.as_mut())
            .map_err(|_| CryptoError)?
            .len();
        payload.truncate(plain_len);
        Ok(())
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

impl crypto::HeaderKey for aead::quic::HeaderProtectionKey {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self.new_mask(&sample[0..self.sample_size()]).unwrap();
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            // Long header: 4 bits masked
            header[0] ^= mask[0] & 0x0f;
        } else {
            // Short header: 5 bits masked
            header[0] ^= mask[0] & 0x1f;
        }
        let pn_length = crate::packet::PacketNumber::decode_len(header[0]);
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self.new_mask(&sample[0..self.sample_size()]).unwrap();
        let pn_length = crate::packet::PacketNumber::decode_len(header[0]);
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            // Long header: 4 bits masked
            header[0] ^= mask[0] & 0x0f;
        } else {
            // Short header: 5 bits masked
            header[0] ^= mask[0] & 0x1f;
        }
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    fn sample_size(&self) -> usize {
        self.algorithm().sample_len()
    }
}

fn header_key(suite: CipherSuite, secret: &hkdf::Prk) -> aead::quic::HeaderProtectionKey {
    let mut hp = [0; 32];
    let hp = &mut hp[..suite.header_protection().key_len()];
    expand_label(secret, b"quic hp", hp);
    aead::quic::HeaderProtectionKey::new(suite.header_protection(), hp).unwrap()
}

fn next_secret(secret: &hkdf::Prk) -> hkdf::Prk {
    let mut next = [0; 32];
    expand_label(secret, b"quic ku", &mut next);
    hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &next)
}

fn expand_prk(secret: &hkdf::Prk, label: &[u8]) -> hkdf::Prk {
    let mut bytes = [0; 32];
    expand_label(secret, label, &mut bytes);
    hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &bytes)
}

/// TLS 1.3 `HKDF-Expand-Label` with an empty context
fn expand_label(secret: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = (PREFIX.len() + label.len()) as u8;
    let info = [&out_len[..], &[label_len], PREFIX, label, &[0]];
    let okm = secret.expand(&info, ExpandLen(out.len())).unwrap();
    okm.fill(out).unwrap();
}

/// Adapter to request arbitrary-length HKDF output from *ring*
#[derive(Copy, Clone)]
struct ExpandLen(usize);

impl hkdf::KeyType for ExpandLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{HeaderKey as _, PacketKey as _};
    use bytes::BytesMut;
    use hex_literal::hex;

    #[test]
    fn initial_keys_are_directional() {
        let dcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let client = initial_keys(&dcid, Side::Client);
        let server = initial_keys(&dcid, Side::Server);

        let header = b"fake header";
        let mut buf = Vec::new();
        buf.extend_from_slice(header);
        buf.extend_from_slice(b"client to server");
        buf.resize(buf.len() + client.packet.local.tag_len(), 0);
        client.packet.local.encrypt(0, &mut buf, header.len());

        let mut payload = BytesMut::from(&buf[header.len()..]);
        server.packet.remote.decrypt(0, header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"client to server");

        // The server's own write keys must not open client data
        let mut payload = BytesMut::from(&buf[header.len()..]);
        assert!(server.packet.local.decrypt(0, header, &mut payload).is_err());
    }

    #[test]
    fn nonce_varies_with_packet_number() {
        let dcid = ConnectionId::new(&hex!("c0ffee"));
        let keys = initial_keys(&dcid, Side::Client);
        let header = b"hdr";
        let seal = |pn: u64| {
            let mut buf = Vec::new();
            buf.extend_from_slice(header);
            buf.extend_from_slice(b"payload");
            buf.resize(buf.len() + keys.packet.local.tag_len(), 0);
            keys.packet.local.encrypt(pn, &mut buf, header.len());
            buf
        };
        assert_ne!(seal(0), seal(1));
    }

    #[test]
    fn key_update_chains() {
        let mut a = Secrets::new(CipherSuite::Aes128Gcm, &[0xab; 32], &[0xcd; 32]);
        let mut b = Secrets::new(CipherSuite::Aes128Gcm, &[0xcd; 32], &[0xab; 32]);
        a.update();
        b.update();

        let a_keys = a.packet_keys();
        let b_keys = b.packet_keys();
        let header = b"h";
        let mut buf = Vec::new();
        buf.extend_from_slice(header);
        buf.extend_from_slice(b"after update");
        buf.resize(buf.len() + a_keys.local.tag_len(), 0);
        a_keys.local.encrypt(7, &mut buf, 1);
        let mut payload = BytesMut::from(&buf[1..]);
        b_keys.remote.decrypt(7, header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"after update");
    }

    #[test]
    fn header_protection_mask_roundtrip() {
        let dcid = ConnectionId::new(&hex!("1122334455667788"));
        let keys = initial_keys(&dcid, Side::Server);
        // Short header: 1 flags byte, 4 byte pn, then enough payload to sample
        let mut packet = vec![0x43u8, 0, 0, 0, 23];
        packet.extend_from_slice(&[0x55; 32]);
        let orig = packet.clone();
        keys.header.local.encrypt(1, &mut packet);
        assert_ne!(packet[1..5], orig[1..5]);
        keys.header.local.decrypt(1, &mut packet);
        assert_eq!(packet, orig);
    }

    #[test]
    fn retry_tag_detects_tampering() {
        let orig_dst_cid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let packet = hex!("f00000000100086f80452b06b858ec746f6b656e");
        let tag = retry_tag(&orig_dst_cid, &packet);
        assert_eq!(tag, retry_tag(&orig_dst_cid, &packet));

        let mut tampered = packet;
        tampered[9] ^= 1;
        assert_ne!(tag, retry_tag(&orig_dst_cid, &tampered));
        let other_cid = ConnectionId::new(&hex!("0000000000000000"));
        assert_ne!(tag, retry_tag(&other_cid, &packet));
    }

    #[test]
    fn chacha_suite_sizes() {
        let s = Secrets::new(CipherSuite::ChaCha20Poly1305, &[1; 32], &[2; 32]);
        let keys = s.keys();
        assert_eq!(keys.packet.local.tag_len(), 16);
        assert_eq!(keys.header.local.sample_size(), 16);
    }
}
