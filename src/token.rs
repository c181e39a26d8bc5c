use std::net::SocketAddrV6;

use byteorder::{BigEndian, ByteOrder};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;
use ring::digest;
use ring::hmac::SigningKey;

use packet::{ConnectionId, AEAD_TAG_SIZE};
use MAX_CID_SIZE;

const NONCE_LEN: usize = 16;
const SECRET_LEN: usize = 32;

lazy_static! {
    /// Process-wide token sealing context, initialized once at first use
    static ref TOKEN_CONTEXT: TokenContext = TokenContext::new();
}

struct TokenContext {
    secret: [u8; SECRET_LEN],
}

impl TokenContext {
    fn new() -> Self {
        let mut rng = OsRng::new().unwrap();
        let mut secret = [0; SECRET_LEN];
        rng.fill_bytes(&mut secret);
        TokenContext { secret }
    }

    /// Per-token keys, bound to the random nonce carried in the clear
    fn keys(&self, nonce: &[u8]) -> (aead::SealingKey, aead::OpeningKey, [u8; 12]) {
        let prk = {
            let salt = SigningKey::new(&digest::SHA256, nonce);
            ::ring::hmac::sign(&salt, &self.secret).as_ref().to_vec()
        };
        let key = {
            let mut key = [0; 16];
            key.copy_from_slice(&expand(&prk, b"retry token key", 16));
            key
        };
        let mut iv = [0; 12];
        iv.copy_from_slice(&expand(&prk, b"retry token iv", 12));
        (
            aead::SealingKey::new(&aead::AES_128_GCM, &key).unwrap(),
            aead::OpeningKey::new(&aead::AES_128_GCM, &key).unwrap(),
            iv,
        )
    }
}

fn expand(prk: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let key = SigningKey::new(&digest::SHA256, prk);
    let mut data = info.to_vec();
    data.push(1);
    ::ring::hmac::sign(&key, &data).as_ref()[..len].to_vec()
}

fn address_bytes(addr: &SocketAddrV6) -> [u8; 18] {
    let mut out = [0; 18];
    out[..16].copy_from_slice(&addr.ip().octets());
    BigEndian::write_u16(&mut out[16..], addr.port());
    out
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum TokenError {
    #[fail(display = "token too short")]
    TooShort,
    #[fail(display = "token failed authentication")]
    BadTag,
    #[fail(display = "token expired")]
    Expired,
}

/// Seal a retry token binding the client's address, the original DCID, and
/// the time of issue. Opaque to the peer.
pub fn generate(addr: &SocketAddrV6, orig_dst_cid: &ConnectionId, now: u64) -> Vec<u8> {
    let mut rng = OsRng::new().unwrap();
    let mut nonce = [0; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let mut token = Vec::with_capacity(NONCE_LEN + 8 + 1 + orig_dst_cid.len() + AEAD_TAG_SIZE);
    token.extend_from_slice(&nonce);
    let mut body = [0u8; 8];
    BigEndian::write_u64(&mut body, now);
    token.extend_from_slice(&body);
    token.push(orig_dst_cid.len() as u8);
    token.extend_from_slice(orig_dst_cid);

    let (sealing, _, iv) = TOKEN_CONTEXT.keys(&nonce);
    let aad = address_bytes(addr);
    let body_len = token.len() - NONCE_LEN;
    token.resize(NONCE_LEN + body_len + AEAD_TAG_SIZE, 0);
    aead::seal_in_place(
        &sealing,
        &iv,
        &aad,
        &mut token[NONCE_LEN..],
        AEAD_TAG_SIZE,
    ).expect("sealing failed");
    token
}

/// Open a token received in an Initial packet. Succeeds only for an
/// unexpired token sealed for the same remote address, and returns the
/// original DCID it was issued against.
pub fn verify(
    token: &[u8],
    addr: &SocketAddrV6,
    now: u64,
    verification_expiration: u64,
) -> Result<ConnectionId, TokenError> {
    if token.len() < NONCE_LEN + 8 + 1 + AEAD_TAG_SIZE {
        return Err(TokenError::TooShort);
    }
    let (nonce, sealed) = token.split_at(NONCE_LEN);
    let (_, opening, iv) = TOKEN_CONTEXT.keys(nonce);
    let aad = address_bytes(addr);

    let mut body = sealed.to_vec();
    let plain_len = aead::open_in_place(&opening, &iv, &aad, 0, &mut body)
        .map_err(|_| TokenError::BadTag)?
        .len();
    let plain = &body[..plain_len];

    let cid_len = plain[8] as usize;
    if cid_len > MAX_CID_SIZE || plain.len() != 8 + 1 + cid_len {
        return Err(TokenError::TooShort);
    }
    let timestamp = BigEndian::read_u64(&plain[..8]);
    if now.saturating_sub(timestamp) > verification_expiration {
        return Err(TokenError::Expired);
    }
    Ok(ConnectionId::new(&plain[9..9 + cid_len]))
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr() -> SocketAddrV6 {
        "[2001:db8::1]:4433".parse().unwrap()
    }

    #[test]
    fn roundtrip() {
        let ocid = ConnectionId::new(&[0xe5; 8]);
        let token = generate(&addr(), &ocid, 1_000_000);
        let got = verify(&token, &addr(), 2_000_000, 10_000_000).unwrap();
        assert_eq!(got, ocid);
    }

    #[test]
    fn expired() {
        let ocid = ConnectionId::new(&[0xe5; 8]);
        let token = generate(&addr(), &ocid, 1_000_000);
        assert_eq!(
            verify(&token, &addr(), 20_000_000, 10_000_000),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn address_mismatch() {
        let ocid = ConnectionId::new(&[0xe5; 8]);
        let token = generate(&addr(), &ocid, 1_000_000);
        let other: SocketAddrV6 = "[2001:db8::2]:4433".parse().unwrap();
        assert_eq!(
            verify(&token, &other, 2_000_000, 10_000_000),
            Err(TokenError::BadTag)
        );
    }

    #[test]
    fn tampering() {
        let ocid = ConnectionId::new(&[0xe5; 8]);
        let mut token = generate(&addr(), &ocid, 1_000_000);
        let len = token.len();
        token[len - 1] ^= 1;
        assert_eq!(
            verify(&token, &addr(), 2_000_000, 10_000_000),
            Err(TokenError::BadTag)
        );
    }
}
