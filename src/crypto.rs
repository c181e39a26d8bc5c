use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use aes_ctr::cipher::generic_array::GenericArray;
use aes_ctr::cipher::stream::{NewStreamCipher, SyncStreamCipher};
use aes_ctr::Aes128Ctr;
use bytes::BytesMut;
use ring::aead;
use ring::digest;
use ring::hmac::{self, SigningKey};
use rustls::quic::{ClientQuicExt, QuicExt, ServerQuicExt};
use rustls::{ClientSession, ServerSession, Session};
use webpki::DNSNameRef;

pub use rustls::{Certificate, ClientConfig, NoClientAuth, PrivateKey, ServerConfig, TLSError};

use packet::{ConnectionId, AEAD_TAG_SIZE};
use params::TransportParameters;
use {Side, RESET_TOKEN_SIZE};

/// Bits of the ACK delay field dropped on the wire
pub const ACK_DELAY_EXPONENT: u8 = 3;

pub const HP_SAMPLE_SIZE: usize = 16;

const SECRET_LEN: usize = 32;
const KEY_LEN: usize = 16;
const IV_LEN: usize = 12;

#[derive(Debug, Fail)]
pub enum ConnectError {
    #[fail(display = "invalid DNS name: {}", _0)]
    InvalidDnsName(String),
}

/// The session's handle on the TLS 1.3 machinery, in either role
pub enum TlsSession {
    Client(ClientSession),
    Server(ServerSession),
}

impl TlsSession {
    pub fn new_client(
        config: &Arc<ClientConfig>,
        hostname: &str,
        params: &TransportParameters,
    ) -> Result<TlsSession, ConnectError> {
        let pki_server_name = DNSNameRef::try_from_ascii_str(hostname)
            .map_err(|_| ConnectError::InvalidDnsName(hostname.into()))?;
        let mut buf = Vec::new();
        params.write(Side::Client, &mut buf);
        Ok(TlsSession::Client(ClientSession::new_quic(
            config,
            pki_server_name,
            buf,
        )))
    }

    pub fn new_server(config: &Arc<ServerConfig>, params: &TransportParameters) -> TlsSession {
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        TlsSession::Server(ServerSession::new_quic(config, buf))
    }

    pub fn get_quic_transport_parameters(&self) -> Option<&[u8]> {
        match *self {
            TlsSession::Client(ref session) => session.get_quic_transport_parameters(),
            TlsSession::Server(ref session) => session.get_quic_transport_parameters(),
        }
    }

    pub fn get_sni_hostname(&self) -> Option<&str> {
        match *self {
            TlsSession::Client(_) => None,
            TlsSession::Server(ref session) => session.get_sni_hostname(),
        }
    }
}

impl Deref for TlsSession {
    type Target = dyn Session;
    fn deref(&self) -> &Self::Target {
        match *self {
            TlsSession::Client(ref session) => session,
            TlsSession::Server(ref session) => session,
        }
    }
}

impl DerefMut for TlsSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match *self {
            TlsSession::Client(ref mut session) => session,
            TlsSession::Server(ref mut session) => session,
        }
    }
}

/// Key used to derive header-protection masks from ciphertext samples
pub struct HeaderKey([u8; KEY_LEN]);

impl HeaderKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        HeaderKey(bytes)
    }

    pub fn mask(&self, sample: &[u8]) -> [u8; 5] {
        debug_assert_eq!(sample.len(), HP_SAMPLE_SIZE);
        let mut mask = [0; 5];
        let key = GenericArray::from_slice(&self.0);
        let nonce = GenericArray::from_slice(sample);
        Aes128Ctr::new(key, nonce).apply_keystream(&mut mask);
        mask
    }
}

struct Keys {
    secret: Vec<u8>,
    iv: [u8; IV_LEN],
    hp: HeaderKey,
}

impl Keys {
    fn new(secret: Vec<u8>) -> (Keys, [u8; KEY_LEN]) {
        let key_bytes = expand_label_16(&secret, b"quic key");
        let mut iv = [0; IV_LEN];
        iv.copy_from_slice(&hkdf_expand_label(&secret, b"quic iv", IV_LEN));
        let hp = HeaderKey(expand_label_16(&secret, b"quic hp"));
        (Keys { secret, iv, hp }, key_bytes)
    }
}

/// AEAD and header-protection state for one epoch, both directions
pub struct CryptoContext {
    local: Keys,
    remote: Keys,
    sealing: aead::SealingKey,
    opening: aead::OpeningKey,
}

impl CryptoContext {
    fn from_secrets(local_secret: Vec<u8>, remote_secret: Vec<u8>) -> Self {
        let (local, local_key) = Keys::new(local_secret);
        let (remote, remote_key) = Keys::new(remote_secret);
        CryptoContext {
            local,
            remote,
            sealing: aead::SealingKey::new(&aead::AES_128_GCM, &local_key).unwrap(),
            opening: aead::OpeningKey::new(&aead::AES_128_GCM, &remote_key).unwrap(),
        }
    }

    /// Initial-epoch keys, derived from the client's first destination CID
    pub fn new_initial(id: &ConnectionId, side: Side) -> Self {
        let initial = initial_secret(id);
        let client = hkdf_expand_label(&initial, b"client in", SECRET_LEN);
        let server = hkdf_expand_label(&initial, b"server in", SECRET_LEN);
        match side {
            Side::Client => Self::from_secrets(client, server),
            Side::Server => Self::from_secrets(server, client),
        }
    }

    /// Handshake-epoch keys. Derived from the same CID-bound secret as the
    /// initial epoch, under dedicated labels.
    pub fn new_handshake(id: &ConnectionId, side: Side) -> Self {
        let initial = initial_secret(id);
        let client = hkdf_expand_label(&initial, b"client hs", SECRET_LEN);
        let server = hkdf_expand_label(&initial, b"server hs", SECRET_LEN);
        match side {
            Side::Client => Self::from_secrets(client, server),
            Side::Server => Self::from_secrets(server, client),
        }
    }

    /// 0-RTT keys; the client seals, the server opens
    pub fn new_0rtt(id: &ConnectionId) -> Self {
        let initial = initial_secret(id);
        let secret = hkdf_expand_label(&initial, b"client 0rtt", SECRET_LEN);
        Self::from_secrets(secret.clone(), secret)
    }

    /// 1-RTT keys exported from the completed handshake
    pub fn new_1rtt(tls: &TlsSession, side: Side) -> Result<Self, TLSError> {
        let mut client = vec![0; SECRET_LEN];
        tls.export_keying_material(&mut client, b"EXPORTER-QUIC client 1rtt", None)?;
        let mut server = vec![0; SECRET_LEN];
        tls.export_keying_material(&mut server, b"EXPORTER-QUIC server 1rtt", None)?;
        Ok(match side {
            Side::Client => Self::from_secrets(client, server),
            Side::Server => Self::from_secrets(server, client),
        })
    }

    /// Derive the next key-update generation from the current secrets
    pub fn update(&self) -> Self {
        let local = hkdf_expand_label(&self.local.secret, b"quic ku", SECRET_LEN);
        let remote = hkdf_expand_label(&self.remote.secret, b"quic ku", SECRET_LEN);
        Self::from_secrets(local, remote)
    }

    /// Seal `buf[header_len..]` in place, appending the tag; the header is
    /// authenticated
    pub fn encrypt(&self, number: u64, buf: &mut Vec<u8>, header_len: usize) {
        let nonce = nonce_for(&self.local.iv, number);
        let payload_len = buf.len();
        buf.resize(payload_len + AEAD_TAG_SIZE, 0);
        let (header, payload) = buf.split_at_mut(header_len);
        aead::seal_in_place(&self.sealing, &nonce, header, payload, AEAD_TAG_SIZE)
            .expect("sealing failed");
    }

    /// Open `payload` in place, truncating the tag. A failed tag check
    /// yields `Err(())`, which the session maps to a crypto close.
    pub fn decrypt(&self, number: u64, header: &[u8], payload: &mut BytesMut) -> Result<(), ()> {
        if payload.len() < AEAD_TAG_SIZE {
            return Err(());
        }
        let nonce = nonce_for(&self.remote.iv, number);
        let plain_len = {
            let plain = aead::open_in_place(&self.opening, &nonce, header, 0, payload.as_mut())
                .map_err(|_| ())?;
            plain.len()
        };
        payload.truncate(plain_len);
        Ok(())
    }

    pub fn local_hp(&self) -> &HeaderKey {
        &self.local.hp
    }

    pub fn remote_hp(&self) -> &HeaderKey {
        &self.remote.hp
    }

    pub fn local_secret(&self) -> &[u8] {
        &self.local.secret
    }

    pub fn remote_secret(&self) -> &[u8] {
        &self.remote.secret
    }
}

fn nonce_for(iv: &[u8; IV_LEN], number: u64) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    for i in 0..8 {
        nonce[4 + i] ^= (number >> (56 - 8 * i)) as u8;
    }
    nonce
}

const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

fn initial_secret(id: &ConnectionId) -> Vec<u8> {
    hkdf_extract(&INITIAL_SALT, id)
}

fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    let key = SigningKey::new(&digest::SHA256, salt);
    hmac::sign(&key, ikm).as_ref().to_vec()
}

fn hkdf_expand(prk: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let key = SigningKey::new(&digest::SHA256, prk);
    let mut out = Vec::with_capacity(out_len);
    let mut block = Vec::new();
    let mut counter = 1u8;
    while out.len() < out_len {
        let mut data = block.clone();
        data.extend_from_slice(info);
        data.push(counter);
        block = hmac::sign(&key, &data).as_ref().to_vec();
        let take = (out_len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        counter += 1;
    }
    out
}

fn hkdf_expand_label(secret: &[u8], label: &[u8], out_len: usize) -> Vec<u8> {
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1);
    info.push((out_len >> 8) as u8);
    info.push(out_len as u8);
    info.push(6 + label.len() as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0);
    hkdf_expand(secret, &info, out_len)
}

fn expand_label_16(secret: &[u8], label: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0; KEY_LEN];
    out.copy_from_slice(&hkdf_expand_label(secret, label, KEY_LEN));
    out
}

/// Stateless reset token for a connection ID, derived from a long-lived key
pub fn reset_token_for(key: &SigningKey, id: &ConnectionId) -> [u8; RESET_TOKEN_SIZE] {
    let signature = hmac::sign(key, id);
    let mut result = [0; RESET_TOKEN_SIZE];
    result.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
    result
}

const RETRY_INTEGRITY_KEY: [u8; KEY_LEN] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_INTEGRITY_NONCE: [u8; IV_LEN] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// Check a received retry packet's integrity tag
pub fn verify_retry_tag(orig_dst_cid: &ConnectionId, packet: &[u8], tag: &[u8]) -> bool {
    ::constant_time_eq::constant_time_eq(&retry_tag(orig_dst_cid, packet), tag)
}

/// Integrity tag over a retry packet, binding the original destination CID
pub fn retry_tag(orig_dst_cid: &ConnectionId, packet: &[u8]) -> [u8; AEAD_TAG_SIZE] {
    let mut pseudo = Vec::with_capacity(1 + orig_dst_cid.len() + packet.len());
    pseudo.push(orig_dst_cid.len() as u8);
    pseudo.extend_from_slice(orig_dst_cid);
    pseudo.extend_from_slice(packet);
    let key = aead::SealingKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY).unwrap();
    let mut in_out = vec![0; AEAD_TAG_SIZE];
    aead::seal_in_place(
        &key,
        &RETRY_INTEGRITY_NONCE,
        &pseudo,
        &mut in_out,
        AEAD_TAG_SIZE,
    ).expect("sealing failed");
    let mut tag = [0; AEAD_TAG_SIZE];
    tag.copy_from_slice(&in_out);
    tag
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn initial_keys_are_symmetric() {
        let mut rng = OsRng::new().unwrap();
        let id = ConnectionId::random(&mut rng, 8);
        let client = CryptoContext::new_initial(&id, Side::Client);
        let server = CryptoContext::new_initial(&id, Side::Server);

        let header = b"fake header";
        let mut buf = Vec::new();
        buf.extend_from_slice(header);
        buf.extend_from_slice(b"this is the payload of an initial packet");
        let header_len = header.len();
        client.encrypt(0, &mut buf, header_len);

        let mut payload = BytesMut::from(&buf[header_len..]);
        server.decrypt(0, header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"this is the payload of an initial packet");
    }

    #[test]
    fn decrypt_rejects_tampering() {
        let mut rng = OsRng::new().unwrap();
        let id = ConnectionId::random(&mut rng, 8);
        let client = CryptoContext::new_initial(&id, Side::Client);
        let server = CryptoContext::new_initial(&id, Side::Server);

        let mut buf = b"hdr".to_vec();
        buf.extend_from_slice(b"payload");
        client.encrypt(1, &mut buf, 3);
        buf[4] ^= 0xff;
        let mut payload = BytesMut::from(&buf[3..]);
        assert_eq!(server.decrypt(1, b"hdr", &mut payload), Err(()));
    }

    #[test]
    fn update_is_symmetric() {
        let mut rng = OsRng::new().unwrap();
        let id = ConnectionId::random(&mut rng, 8);
        let client = CryptoContext::new_initial(&id, Side::Client).update();
        let server = CryptoContext::new_initial(&id, Side::Server).update();

        let mut buf = b"h".to_vec();
        buf.extend_from_slice(b"after key update");
        client.encrypt(7, &mut buf, 1);
        let mut payload = BytesMut::from(&buf[1..]);
        server.decrypt(7, b"h", &mut payload).unwrap();
        assert_eq!(&payload[..], b"after key update");
    }

    #[test]
    fn header_key_mask_is_deterministic() {
        let key = HeaderKey::from_bytes([0x11; 16]);
        let sample = [0x22; 16];
        assert_eq!(key.mask(&sample), key.mask(&sample));
        assert_ne!(key.mask(&sample), key.mask(&[0x23; 16]));
    }

    #[test]
    fn retry_tag_binds_cid_and_packet() {
        let odcid = ConnectionId::new(&[1; 8]);
        let tag = retry_tag(&odcid, b"retry packet bytes");
        assert_eq!(tag, retry_tag(&odcid, b"retry packet bytes"));
        assert_ne!(tag, retry_tag(&odcid, b"retry packet byteZ"));
        assert_ne!(tag, retry_tag(&ConnectionId::new(&[2; 8]), b"retry packet bytes"));
    }
}
