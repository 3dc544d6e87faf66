//! Packet protection, key derivation, and the TLS engine seam.
//!
//! The TLS handshake itself lives behind [`TlsSession`]; this module owns
//! everything the transport derives on its own: Initial secrets, packet
//! keys, header-protection masks, key updates, Retry integrity, retry
//! tokens, and stateless reset tokens.

use std::collections::BTreeMap;

use bytes::Bytes;
use rand::Rng;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::hkdf::{self, Prk, Salt, HKDF_SHA256};
use ring::hmac;

use crate::packet::ConnectionId;
use crate::space::EncryptLevel;
use crate::transport_parameters::TransportParameters;
use crate::{Side, TransportError, HP_SAMPLE_SIZE, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Salt for Initial secret derivation, fixed for the v1 wire format.
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];

const RETRY_INTEGRITY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// Bytes of out-of-order handshake data we are willing to buffer per level.
const CRYPTO_BUFFER_LIMIT: u64 = 64 * 1024;

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn expand_label(prk: &Prk, label: &[u8], out: &mut [u8]) {
    let len = (out.len() as u16).to_be_bytes();
    let mut full_label = Vec::with_capacity(6 + label.len());
    full_label.extend_from_slice(b"tls13 ");
    full_label.extend_from_slice(label);
    let label_len = [full_label.len() as u8];
    let context_len = [0u8];
    let info = [&len[..], &label_len[..], &full_label[..], &context_len[..]];
    prk.expand(&info, OutLen(out.len()))
        .unwrap()
        .fill(out)
        .unwrap();
}

/// AEAD and header-protection state for one direction of one key type.
pub struct PacketKey {
    key: LessSafeKey,
    iv: [u8; 12],
    hp: aead::quic::HeaderProtectionKey,
    hp_bytes: [u8; 16],
}

impl PacketKey {
    fn from_secret(secret: &[u8; 32]) -> Self {
        let mut hp = [0; 16];
        expand_label(
            &Prk::new_less_safe(HKDF_SHA256, secret),
            b"quic hp",
            &mut hp,
        );
        Self::from_secret_with_hp(secret, hp)
    }

    /// Key updates rotate the AEAD key and IV but keep the original
    /// header-protection key.
    fn from_secret_with_hp(secret: &[u8; 32], hp_bytes: [u8; 16]) -> Self {
        let prk = Prk::new_less_safe(HKDF_SHA256, secret);
        let mut key = [0; 16];
        expand_label(&prk, b"quic key", &mut key);
        let mut iv = [0; 12];
        expand_label(&prk, b"quic iv", &mut iv);
        PacketKey {
            key: LessSafeKey::new(UnboundKey::new(&AES_128_GCM, &key).unwrap()),
            iv,
            hp: aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &hp_bytes).unwrap(),
            hp_bytes,
        }
    }

    fn nonce(&self, number: u64) -> Nonce {
        let mut nonce = self.iv;
        let n = number.to_be_bytes();
        for (b, x) in nonce[4..].iter_mut().zip(n.iter()) {
            *b ^= x;
        }
        Nonce::assume_unique_for_key(nonce)
    }

    /// Seal `buf[header_len..]` in place, appending the tag. The header is
    /// authenticated as associated data.
    pub fn encrypt(&self, number: u64, buf: &mut Vec<u8>, header_len: usize) {
        let tag = {
            let (header, payload) = buf.split_at_mut(header_len);
            self.key
                .seal_in_place_separate_tag(self.nonce(number), Aad::from(&*header), payload)
                .unwrap()
        };
        buf.extend_from_slice(tag.as_ref());
    }

    /// Open `payload` in place, truncating the tag off on success.
    pub fn decrypt(
        &self,
        number: u64,
        header: &[u8],
        payload: &mut bytes::BytesMut,
    ) -> Result<(), ()> {
        let len = self
            .key
            .open_in_place(self.nonce(number), Aad::from(header), payload.as_mut())
            .map_err(|_| ())?
            .len();
        payload.truncate(len);
        Ok(())
    }

    /// Header-protection mask for one 16-byte ciphertext sample.
    pub fn hp_mask(&self, sample: &[u8]) -> [u8; 5] {
        self.hp.new_mask(sample).expect("malformed HP sample")
    }

    /// Masks for a batch of samples, one bulk call per batch boundary.
    pub fn hp_masks(&self, samples: &[[u8; HP_SAMPLE_SIZE]]) -> Vec<[u8; 5]> {
        samples.iter().map(|s| self.hp_mask(s)).collect()
    }
}

/// A read/write key pair for one encryption level (or one 1-RTT key phase).
pub struct Keys {
    pub local: PacketKey,
    pub remote: PacketKey,
    local_secret: [u8; 32],
    remote_secret: [u8; 32],
}

impl Keys {
    /// Derive Initial keys from the client's destination CID.
    pub fn new_initial(id: &ConnectionId, side: Side) -> Self {
        let initial = Salt::new(HKDF_SHA256, &INITIAL_SALT).extract(id);
        let mut client = [0; 32];
        expand_label(&initial, b"client in", &mut client);
        let mut server = [0; 32];
        expand_label(&initial, b"server in", &mut server);
        match side {
            Side::Client => Keys::from_secrets(client, server),
            Side::Server => Keys::from_secrets(server, client),
        }
    }

    pub fn from_secrets(local_secret: [u8; 32], remote_secret: [u8; 32]) -> Self {
        Keys {
            local: PacketKey::from_secret(&local_secret),
            remote: PacketKey::from_secret(&remote_secret),
            local_secret,
            remote_secret,
        }
    }

    /// Next key-phase generation, derived with the "quic ku" label. Header
    /// protection carries over unchanged.
    pub fn update(&self) -> Self {
        let mut local = [0; 32];
        expand_label(
            &Prk::new_less_safe(HKDF_SHA256, &self.local_secret),
            b"quic ku",
            &mut local,
        );
        let mut remote = [0; 32];
        expand_label(
            &Prk::new_less_safe(HKDF_SHA256, &self.remote_secret),
            b"quic ku",
            &mut remote,
        );
        Keys {
            local: PacketKey::from_secret_with_hp(&local, self.local.hp_bytes),
            remote: PacketKey::from_secret_with_hp(&remote, self.remote.hp_bytes),
            local_secret: local,
            remote_secret: remote,
        }
    }
}

/// Integrity tag trailing a Retry packet: an AEAD tag over the ODCID-prefixed
/// pseudo packet, so the token cannot be forged or reattached.
pub fn retry_tag(odcid: &ConnectionId, packet: &[u8]) -> [u8; RESET_TOKEN_SIZE] {
    let key = LessSafeKey::new(UnboundKey::new(&AES_128_GCM, &RETRY_INTEGRITY_KEY).unwrap());
    let mut pseudo = Vec::with_capacity(1 + odcid.len() + packet.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid);
    pseudo.extend_from_slice(packet);
    let mut empty = Vec::new();
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE),
            Aad::from(&pseudo),
            &mut empty,
        )
        .unwrap();
    let mut out = [0; RESET_TOKEN_SIZE];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Compute the stateless reset token associated with a connection ID.
pub fn reset_token_for(key: &hmac::Key, id: &ConnectionId) -> [u8; RESET_TOKEN_SIZE] {
    let signature = hmac::sign(key, id);
    let mut out = [0; RESET_TOKEN_SIZE];
    out.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
    out
}

/// Sealed retry tokens: the client's original destination CID, encrypted so
/// only this endpoint can mint and validate them.
pub struct RetryTokenKey(LessSafeKey);

impl RetryTokenKey {
    pub fn new(seed: &[u8]) -> Self {
        let prk = Salt::new(HKDF_SHA256, b"retry token").extract(seed);
        let mut key = [0; 16];
        expand_label(&prk, b"quic token", &mut key);
        RetryTokenKey(LessSafeKey::new(
            UnboundKey::new(&AES_128_GCM, &key).unwrap(),
        ))
    }

    pub fn encrypt<R: Rng>(&self, rng: &mut R, odcid: &ConnectionId) -> Vec<u8> {
        let mut nonce = [0u8; 12];
        rng.fill(&mut nonce);
        let mut buf = Vec::with_capacity(12 + odcid.len() + RESET_TOKEN_SIZE);
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(odcid);
        let tag = {
            let (_, payload) = buf.split_at_mut(12);
            self.0
                .seal_in_place_separate_tag(
                    Nonce::assume_unique_for_key(nonce),
                    Aad::empty(),
                    payload,
                )
                .unwrap()
        };
        buf.extend_from_slice(tag.as_ref());
        buf
    }

    pub fn decrypt(&self, token: &[u8]) -> Result<ConnectionId, ()> {
        if token.len() < 12 + RESET_TOKEN_SIZE || token.len() > 12 + RESET_TOKEN_SIZE + MAX_CID_SIZE
        {
            return Err(());
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&token[..12]);
        let mut payload = token[12..].to_vec();
        let plain = self
            .0
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut payload,
            )
            .map_err(|_| ())?;
        Ok(ConnectionId::new(plain))
    }
}

/// Fresh traffic secrets handed over by the TLS engine.
pub struct KeyChange {
    pub level: EncryptLevel,
    pub local: [u8; 32],
    pub remote: [u8; 32],
}

/// The TLS engine collaborator. Implementations drive the actual handshake;
/// the transport feeds it CRYPTO stream data and drains handshake bytes,
/// keys, and the peer's transport parameters.
pub trait TlsSession: Send {
    /// Feed contiguous handshake bytes received at `level`.
    fn read_handshake(&mut self, level: EncryptLevel, data: &[u8]) -> Result<(), TransportError>;
    /// Drain handshake bytes to transmit, returning the level to send them
    /// at, or `None` when nothing is pending.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<EncryptLevel>;
    /// Traffic secrets that became available since the last call.
    fn next_keys(&mut self) -> Option<KeyChange>;
    fn is_handshaking(&self) -> bool;
    /// The peer's raw transport parameters, once the handshake carried them.
    fn peer_transport_parameters(&self) -> Option<&[u8]>;
}

/// Creates TLS sessions for new connections; the endpoint configuration owns
/// one of these the way the teacher's config owns its TLS config.
pub trait SessionFactory: Send + Sync {
    fn start_session(
        &self,
        side: Side,
        server_name: Option<&str>,
        local_params: &TransportParameters,
    ) -> Box<dyn TlsSession>;
}

/// Reassembly and send-offset state for one encryption level's CRYPTO stream.
#[derive(Default)]
pub struct CryptoStream {
    next_recv_offset: u64,
    pending_recv: BTreeMap<u64, Bytes>,
    pub send_offset: u64,
}

impl CryptoStream {
    pub fn new() -> Self {
        Default::default()
    }

    /// Accept a CRYPTO frame; returns the contiguous bytes that became
    /// readable, which may be empty for duplicates or out-of-order data.
    pub fn recv(&mut self, offset: u64, data: Bytes) -> Result<Vec<u8>, TransportError> {
        let end = offset + data.len() as u64;
        if end > self.next_recv_offset + CRYPTO_BUFFER_LIMIT {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED);
        }
        if end > self.next_recv_offset {
            self.pending_recv.entry(offset).or_insert(data);
        }
        let mut out = Vec::new();
        loop {
            let (start, chunk) = match self.pending_recv.iter().next() {
                Some((&start, chunk)) if start <= self.next_recv_offset => (start, chunk.clone()),
                _ => break,
            };
            let chunk_end = start + chunk.len() as u64;
            if chunk_end > self.next_recv_offset {
                let skip = (self.next_recv_offset - start) as usize;
                out.extend_from_slice(&chunk[skip..]);
                self.next_recv_offset = chunk_end;
            }
            self.pending_recv.remove(&start);
        }
        Ok(out)
    }

    pub fn reset(&mut self) {
        self.next_recv_offset = 0;
        self.pending_recv.clear();
        self.send_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rand::rngs::OsRng;

    #[test]
    fn initial_keys_are_symmetric() {
        let cid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
        let client = Keys::new_initial(&cid, Side::Client);
        let server = Keys::new_initial(&cid, Side::Server);

        let header = b"fake header";
        let mut buf = Vec::new();
        buf.extend_from_slice(header);
        buf.extend_from_slice(b"the payload");
        client.local.encrypt(3, &mut buf, header.len());

        let mut payload = BytesMut::from(&buf[header.len()..]);
        server.remote.decrypt(3, header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"the payload");
    }

    #[test]
    fn decrypt_rejects_tampering() {
        let cid = ConnectionId::new(&[1; 8]);
        let keys = Keys::new_initial(&cid, Side::Client);
        let mut buf = b"hdr".to_vec();
        buf.extend_from_slice(b"data");
        keys.local.encrypt(0, &mut buf, 3);
        buf[4] ^= 0xff;
        let mut payload = BytesMut::from(&buf[3..]);
        let peer = Keys::new_initial(&cid, Side::Server);
        assert!(peer.remote.decrypt(0, b"hdr", &mut payload).is_err());
    }

    #[test]
    fn key_update_changes_keys_both_ways() {
        let a = Keys::from_secrets([1; 32], [2; 32]);
        let b = Keys::from_secrets([2; 32], [1; 32]);
        let a2 = a.update();
        let b2 = b.update();

        let mut buf = b"h".to_vec();
        buf.extend_from_slice(b"secret");
        a2.local.encrypt(9, &mut buf, 1);
        let mut payload = BytesMut::from(&buf[1..]);
        b2.remote.decrypt(9, b"h", &mut payload).unwrap();
        assert_eq!(&payload[..], b"secret");

        // The old generation must not open the new one's packets.
        let mut payload = BytesMut::from(&buf[1..]);
        assert!(b.remote.decrypt(9, b"h", &mut payload).is_err());
    }

    #[test]
    fn hp_mask_is_deterministic() {
        let keys = Keys::new_initial(&ConnectionId::new(&[7; 8]), Side::Client);
        let sample = [0x42; HP_SAMPLE_SIZE];
        assert_eq!(keys.local.hp_mask(&sample), keys.local.hp_mask(&sample));
    }

    #[test]
    fn retry_token_round_trip() {
        let key = RetryTokenKey::new(b"some seed material");
        let odcid = ConnectionId::new(&[9, 8, 7, 6, 5, 4, 3, 2]);
        let token = key.encrypt(&mut OsRng, &odcid);
        assert_eq!(key.decrypt(&token).unwrap(), odcid);

        let mut bad = token.clone();
        bad[13] ^= 1;
        assert!(key.decrypt(&bad).is_err());
    }

    #[test]
    fn retry_tag_depends_on_odcid() {
        let odcid = ConnectionId::new(&[1, 2, 3, 4]);
        let other = ConnectionId::new(&[1, 2, 3, 5]);
        let packet = b"retry packet bytes";
        assert_ne!(retry_tag(&odcid, packet), retry_tag(&other, packet));
        assert_eq!(retry_tag(&odcid, packet), retry_tag(&odcid, packet));
    }

    #[test]
    fn crypto_stream_reassembles_out_of_order() {
        let mut stream = CryptoStream::new();
        assert_eq!(
            stream.recv(5, Bytes::from_static(b"world")).unwrap(),
            Vec::<u8>::new()
        );
        assert_eq!(
            stream.recv(0, Bytes::from_static(b"hello")).unwrap(),
            b"helloworld".to_vec()
        );
        // Duplicate data is silently absorbed.
        assert_eq!(
            stream.recv(0, Bytes::from_static(b"hello")).unwrap(),
            Vec::<u8>::new()
        );
    }
}
