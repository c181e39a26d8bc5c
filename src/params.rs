use std::net::{Ipv6Addr, SocketAddrV6};

use bytes::{Buf, BufMut};

use coding::{BufExt, BufMutExt, UnexpectedEnd};
use packet::ConnectionId;
use {Side, TransportError, MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE};

/// The negotiated transport parameters, as carried in the TLS extension
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParameters {
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Milliseconds
    pub max_idle_timeout: u64,
    pub max_udp_payload_size: u64,
    /// Milliseconds
    pub max_ack_delay: u64,
    pub ack_delay_exponent: u64,
    pub active_connection_id_limit: u64,
    pub disable_active_migration: bool,
    /// Server only
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    /// Server only
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_data: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            max_idle_timeout: 0,
            max_udp_payload_size: 65527,
            max_ack_delay: 25,
            ack_delay_exponent: 3,
            active_connection_id_limit: 2,
            disable_active_migration: false,
            stateless_reset_token: None,
            preferred_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreferredAddress {
    pub address: SocketAddrV6,
    pub cid: ConnectionId,
    pub stateless_reset_token: [u8; RESET_TOKEN_SIZE],
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    #[fail(display = "parameter had illegal value")]
    IllegalValue,
    #[fail(display = "parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(_: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

mod id {
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const PREFERRED_ADDRESS: u64 = 0x0d;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
}

impl TransportParameters {
    pub fn write<W: BufMut>(&self, side: Side, w: &mut W) {
        let mut var = |id: u64, value: u64| {
            w.write_var(id);
            w.write_var(::coding::varint_size(value) as u64);
            w.write_var(value);
        };
        var(
            id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        var(
            id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        var(
            id::INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        var(id::INITIAL_MAX_DATA, self.initial_max_data);
        var(id::INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        var(id::INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        var(id::MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        var(id::MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        var(id::MAX_ACK_DELAY, self.max_ack_delay);
        var(id::ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        var(
            id::ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        if self.disable_active_migration {
            w.write_var(id::DISABLE_ACTIVE_MIGRATION);
            w.write_var(0);
        }
        if let Some(ref token) = self.stateless_reset_token {
            debug_assert_eq!(side, Side::Server);
            w.write_var(id::STATELESS_RESET_TOKEN);
            w.write_var(RESET_TOKEN_SIZE as u64);
            w.put_slice(token);
        }
        if let Some(ref addr) = self.preferred_address {
            debug_assert_eq!(side, Side::Server);
            w.write_var(id::PREFERRED_ADDRESS);
            w.write_var(4 + 2 + 16 + 2 + 1 + addr.cid.len() as u64 + RESET_TOKEN_SIZE as u64);
            w.put_slice(&[0; 4]); // no IPv4 alternative
            w.write::<u16>(0);
            w.put_slice(&addr.address.ip().octets());
            w.write::<u16>(addr.address.port());
            w.write::<u8>(addr.cid.len() as u8);
            w.put_slice(&addr.cid);
            w.put_slice(&addr.stateless_reset_token);
        }
    }

    /// Decode parameters received from the peer, validating ranges and
    /// rejecting parameters the peer's role may not send.
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        // `side` is the side of the reader
        let mut params = TransportParameters::default();
        let mut got = ::fnv::FnvHashSet::default();
        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()? as usize;
            if r.remaining() < len {
                return Err(Error::Malformed);
            }
            if !got.insert(id) {
                return Err(Error::Malformed);
            }
            let mut value = (&mut *r).take(len);
            match id {
                id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = value.get_var()?;
                }
                id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = value.get_var()?;
                }
                id::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = value.get_var()?;
                }
                id::INITIAL_MAX_DATA => {
                    params.initial_max_data = value.get_var()?;
                }
                id::INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = value.get_var()?;
                }
                id::INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = value.get_var()?;
                }
                id::MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = value.get_var()?;
                }
                id::MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = value.get_var()?;
                    if params.max_udp_payload_size < 1200 {
                        return Err(Error::IllegalValue);
                    }
                }
                id::MAX_ACK_DELAY => {
                    params.max_ack_delay = value.get_var()?;
                    if params.max_ack_delay >= 1 << 14 {
                        return Err(Error::IllegalValue);
                    }
                }
                id::ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = value.get_var()?;
                    if params.ack_delay_exponent > 20 {
                        return Err(Error::IllegalValue);
                    }
                }
                id::ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = value.get_var()?;
                    if params.active_connection_id_limit < 2 {
                        return Err(Error::IllegalValue);
                    }
                }
                id::DISABLE_ACTIVE_MIGRATION => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                id::STATELESS_RESET_TOKEN => {
                    if side == Side::Server || len != RESET_TOKEN_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut token = [0; RESET_TOKEN_SIZE];
                    value.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token);
                }
                id::PREFERRED_ADDRESS => {
                    if side == Side::Server || len < 4 + 2 + 16 + 2 + 1 {
                        return Err(Error::Malformed);
                    }
                    let mut v4 = [0; 4];
                    value.copy_to_slice(&mut v4);
                    let _v4_port: u16 = value.get()?;
                    let mut v6 = [0; 16];
                    value.copy_to_slice(&mut v6);
                    let port: u16 = value.get()?;
                    let cid_len: u8 = value.get()?;
                    if (cid_len as usize) < MIN_CID_SIZE || cid_len as usize > MAX_CID_SIZE {
                        return Err(Error::IllegalValue);
                    }
                    if value.remaining() != cid_len as usize + RESET_TOKEN_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut cid = [0; MAX_CID_SIZE];
                    value.copy_to_slice(&mut cid[..cid_len as usize]);
                    let mut token = [0; RESET_TOKEN_SIZE];
                    value.copy_to_slice(&mut token);
                    params.preferred_address = Some(PreferredAddress {
                        address: SocketAddrV6::new(Ipv6Addr::from(v6), port, 0, 0),
                        cid: ConnectionId::new(&cid[..cid_len as usize]),
                        stateless_reset_token: token,
                    });
                }
                _ => {
                    // unknown parameters are ignored
                    let len = value.remaining();
                    value.advance(len);
                }
            }
            if value.has_remaining() {
                return Err(Error::Malformed);
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let mut params = TransportParameters::default();
        params.initial_max_data = 1024 * 1024;
        params.initial_max_streams_bidi = 100;
        params.max_idle_timeout = 10_000;
        params.stateless_reset_token = Some([0xab; RESET_TOKEN_SIZE]);
        params.preferred_address = Some(PreferredAddress {
            address: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0),
            cid: ConnectionId::new(&[0xcc; 8]),
            stateless_reset_token: [0x11; RESET_TOKEN_SIZE],
        });
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        let read = TransportParameters::read(Side::Client, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn server_rejects_server_only_params() {
        let mut params = TransportParameters::default();
        params.stateless_reset_token = Some([1; RESET_TOKEN_SIZE]);
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn rejects_duplicates() {
        let mut buf = Vec::new();
        TransportParameters::default().write(Side::Client, &mut buf);
        let copy = buf.clone();
        buf.extend(copy);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }
}
