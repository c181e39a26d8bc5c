//! Per-connection state machine for a QUIC endpoint session.
//!
//! This library performs no I/O. A `Session` consumes datagrams routed to it
//! by an external dispatcher, drives the TLS handshake and stream
//! multiplexer, and emits socket commands and application events through a
//! shared `Context`. See `session` for the entry points.

extern crate aes_ctr;
extern crate byteorder;
extern crate bytes;
extern crate constant_time_eq;
#[macro_use]
extern crate failure;
extern crate fnv;
#[macro_use]
extern crate lazy_static;
extern crate rand;
extern crate ring;
extern crate rustls;
extern crate slab;
#[macro_use]
extern crate slog;
extern crate webpki;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;

use std::fmt;
use std::ops;

pub mod buffer;
pub mod cid;
pub mod coding;
pub mod config;
pub mod congestion;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod params;
pub mod range_set;
pub mod session;
pub mod stream;
pub mod token;

pub use buffer::{ChunkedSendBuffer, PullStatus, CANCELED};
pub use config::{Config, TransportConfig};
pub use packet::ConnectionId;
pub use session::{
    ClientParams, CloseReason, Context, Event, Io, OpenError, PreferredAddressPolicy, Session,
    SessionError, SessionHandle, SessionStats, Timer,
};
pub use stream::StreamId;

/// The QUIC version produced and consumed by this crate.
pub const VERSION: u32 = 1;

pub const MIN_CID_SIZE: usize = 4;
pub const MAX_CID_SIZE: usize = 18;
pub const RESET_TOKEN_SIZE: usize = 16;
/// Initial packets must be padded to at least this many bytes to prove the
/// client can receive full-sized datagrams and to limit amplification.
pub const MIN_INITIAL_SIZE: usize = 1200;
pub const MIN_MTU: u16 = 1232;
pub const MAX_PACKET_SIZE: usize = 65527;

/// Whether this side of a session initiated it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl slog::Value for Side {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// Whether a stream communicates data in both directions or only from its
/// initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Directionality {
    Bi,
    Uni,
}

impl fmt::Display for Directionality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            Directionality::Bi => "bidirectional",
            Directionality::Uni => "unidirectional",
        };
        f.write_str(s)
    }
}

/// Transport-level error code, as carried by CONNECTION_CLOSE
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransportError(pub u16);

macro_rules! transport_errors {
    {$($name:ident($val:expr),)*} => {
        impl TransportError {
            $(pub const $name: TransportError = TransportError($val);)*
        }

        impl fmt::Display for TransportError {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if x >= 0x100 && x < 0x200 => {
                        write!(f, "CRYPTO_ERROR({:02x})", x as u8)
                    }
                    _ => write!(f, "<unknown {:04x}>", self.0),
                }
            }
        }
    }
}

transport_errors! {
    NO_ERROR(0x0),
    INTERNAL_ERROR(0x1),
    CONNECTION_REFUSED(0x2),
    FLOW_CONTROL_ERROR(0x3),
    STREAM_LIMIT_ERROR(0x4),
    STREAM_STATE_ERROR(0x5),
    FINAL_SIZE_ERROR(0x6),
    FRAME_ENCODING_ERROR(0x7),
    TRANSPORT_PARAMETER_ERROR(0x8),
    CONNECTION_ID_LIMIT_ERROR(0x9),
    PROTOCOL_VIOLATION(0xA),
    INVALID_TOKEN(0xB),
    APPLICATION_ERROR(0xC),
    CRYPTO_BUFFER_EXCEEDED(0xD),
    KEY_UPDATE_ERROR(0xE),
    NO_VIABLE_PATH(0x10),
}

impl TransportError {
    /// TLS alerts are carried in a reserved range of transport error codes
    pub fn crypto(alert: u8) -> Self {
        TransportError(0x100 | u16::from(alert))
    }
}

impl slog::Value for TransportError {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}
