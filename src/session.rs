use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddrV6;
use std::sync::Arc;
use std::{cmp, io, mem};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use fnv::FnvHashSet;
use rand::rngs::OsRng;
use rand::Rng;
use slog::Logger;

use buffer::ChunkedSendBuffer;
use cid::ConnectionIdSet;
use coding::BufMutExt;
use config::Config;
use congestion::{self, Controller, NewReno};
use crypto::{self, reset_token_for, CryptoContext, TlsSession, ACK_DELAY_EXPONENT};
use frame::{self, Frame};
use packet::{
    set_payload_length, ConnectionId, Header, LongType, Packet, PacketNumber, PartialDecode,
    AEAD_TAG_SIZE,
};
use params::TransportParameters;
use range_set::RangeSet;
use stream::{self, ReadError, StreamId, StreamTable, WriteError};
use token;
use {Directionality, Side, TransportError, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE, VERSION};

/// Identifier the embedding dispatcher uses to tag commands and events for
/// one session
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionHandle(pub usize);

impl From<SessionHandle> for usize {
    fn from(x: SessionHandle) -> usize {
        x.0
    }
}

/// State shared by every session behind one dispatcher. The session performs
/// no I/O itself: commands for the socket accumulate in `io` and
/// notifications for the application in `events`, both drained by the
/// embedder after each call into the session.
pub struct Context {
    pub rng: OsRng,
    pub config: Arc<Config>,
    pub io: VecDeque<Io>,
    pub events: VecDeque<(SessionHandle, Event)>,
}

impl Context {
    pub fn new(config: Arc<Config>) -> Self {
        Context {
            rng: OsRng::new().unwrap(),
            config,
            io: VecDeque::new(),
            events: VecDeque::new(),
        }
    }
}

/// I/O commands for the dispatcher owning the UDP socket
#[derive(Debug)]
pub enum Io {
    /// Send one datagram as a gathered vector; report completion through
    /// `Session::on_send_done`
    Transmit {
        destination: SocketAddrV6,
        datagram: Vec<Bytes>,
    },
    /// Start or reset a timer
    TimerStart {
        session: SessionHandle,
        timer: Timer,
        /// Absolute μs
        time: u64,
    },
    TimerStop {
        session: SessionHandle,
        timer: Timer,
    },
    /// Route datagrams addressed to `cid` to this session
    AssociateCid {
        session: SessionHandle,
        cid: ConnectionId,
    },
    DisassociateCid {
        session: SessionHandle,
        cid: ConnectionId,
    },
    /// Drop the dispatcher's record of this session entirely
    RemoveSession { session: SessionHandle },
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Timer {
    Idle,
    Retransmit,
    Close,
}

impl ::slog::Value for Timer {
    fn serialize(
        &self,
        _: &::slog::Record,
        key: ::slog::Key,
        serializer: &mut ::slog::Serializer,
    ) -> ::slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// Notifications for the layer above
#[derive(Debug)]
pub enum Event {
    /// The TLS handshake finished and 1-RTT data may flow
    HandshakeCompleted { alpn: Option<String> },
    ConnectionLost { reason: SessionError },
    /// A closed session finished draining and released its resources
    ConnectionDrained,
    /// The peer opened a stream
    StreamOpened { id: StreamId },
    StreamReadable { id: StreamId, fresh: bool },
    /// A formerly blocked stream may accept writes again
    StreamWritable { id: StreamId },
    /// Every byte sent on the stream was acknowledged
    StreamFinished { id: StreamId },
    /// The peer abandoned the stream
    StreamReset {
        id: StreamId,
        final_size: u64,
        error_code: u16,
    },
    /// More streams of this directionality may be opened
    StreamAvailable { directionality: Directionality },
    /// Server only: a ClientHello arrived and the handshake is suspended
    /// until `on_client_hello_done`
    ClientHello { alpn: String },
    /// The handshake is suspended for certificate/OCSP selection until
    /// `on_cert_done`
    Cert { server_name: Option<String> },
    /// One TLS keylog line; emitted only while the keylog flag is set
    Keylog { line: String },
    /// A migration path was validated and traffic switched to it
    PathValidated { remote: SocketAddrV6 },
}

/// Reasons why a session might be lost
#[derive(Debug, Clone, Fail)]
pub enum SessionError {
    /// The peer doesn't implement any supported version
    #[fail(display = "peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the transport protocol
    #[fail(display = "{}", error_code)]
    TransportError { error_code: TransportError },
    /// The peer's transport stack aborted the connection
    #[fail(display = "aborted by peer: {}", reason)]
    ConnectionClosed { reason: frame::ConnectionClose },
    /// The peer's application closed the connection
    #[fail(display = "closed by peer: {}", reason)]
    ApplicationClosed { reason: frame::ApplicationClose },
    /// The peer is unable to continue processing this connection
    #[fail(display = "reset by peer")]
    Reset,
    /// The peer has become unreachable
    #[fail(display = "timed out")]
    TimedOut,
    /// Supplied remote transport parameters were malformed
    #[fail(display = "invalid remote transport parameters")]
    InvalidRemoteTransportParams,
    /// A supplied session ticket could not be used
    #[fail(display = "invalid TLS session ticket")]
    InvalidTlsSessionTicket,
}

impl From<TransportError> for SessionError {
    fn from(x: TransportError) -> Self {
        SessionError::TransportError { error_code: x }
    }
}

/// The error recorded in the session's `last_error` slot and carried by the
/// close packet
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Transport-level error
    Session(frame::ConnectionClose),
    /// Code supplied by the layer above
    Application(frame::ApplicationClose),
    /// TLS alert
    Crypto(u8),
}

impl From<TransportError> for CloseReason {
    fn from(x: TransportError) -> Self {
        CloseReason::Session(x.into())
    }
}

impl From<::params::Error> for CloseReason {
    fn from(x: ::params::Error) -> Self {
        CloseReason::Session(TransportError::from(x).into())
    }
}

impl CloseReason {
    fn error(&self) -> SessionError {
        match *self {
            CloseReason::Session(ref x) => SessionError::TransportError {
                error_code: x.error_code,
            },
            CloseReason::Application(ref x) => SessionError::ApplicationClosed { reason: x.clone() },
            CloseReason::Crypto(alert) => SessionError::TransportError {
                error_code: TransportError::crypto(alert),
            },
        }
    }
}

#[derive(Debug, Fail, Copy, Clone, Eq, PartialEq)]
pub enum OpenError {
    #[fail(display = "stream limit exhausted")]
    StreamLimit,
    #[fail(display = "handshake not yet completed")]
    NotReady,
}

/// Client policy for a server-advertised preferred address
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PreferredAddressPolicy {
    Use,
    Ignore,
}

/// Everything a client session needs beyond the shared configuration
pub struct ClientParams {
    pub tls_config: Arc<crypto::ClientConfig>,
    pub server_name: String,
    pub preferred_address_policy: PreferredAddressPolicy,
    pub request_ocsp: bool,
}

pub enum State {
    /// Created; the handshake has not produced its first flight
    Initial,
    Handshake(state::Handshake),
    Established,
    /// Local close sent; the retained close packet is replayed on ingress
    Closing,
    /// Remote close received; nothing further is sent
    Draining,
    Closed,
}

impl State {
    pub fn is_closed(&self) -> bool {
        match *self {
            State::Closing | State::Draining | State::Closed => true,
            _ => false,
        }
    }
}

pub mod state {
    /// Progress of a suspended or running handshake
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub enum HandshakePhase {
        Running,
        AwaitingClientHello,
        AwaitingCert,
    }

    pub struct Handshake {
        pub phase: HandshakePhase,
    }
}

use self::state::HandshakePhase;

struct ServerState {
    /// The client's first destination CID; routes until real CIDs exist and
    /// seeds the initial secrets
    rcid: ConnectionId,
    /// Original DCID recovered from a verified retry token
    ocid: Option<ConnectionId>,
    retry_sent: bool,
    client_hello_done: bool,
    cert_done: bool,
    /// Stored by `on_cert_done` for the embedder to staple
    ocsp_response: Option<Bytes>,
    /// CID advertised with the preferred address
    pscid: Option<ConnectionId>,
}

struct ClientState {
    server_name: String,
    /// Token from a Retry, echoed in subsequent Initials
    token: Bytes,
    resumption: bool,
    session_ticket: Option<Bytes>,
    early_params: Option<TransportParameters>,
    preferred_address_policy: PreferredAddressPolicy,
    request_ocsp: bool,
}

enum Role {
    Server(ServerState),
    Client(ClientState),
}

/// Embedder-visible shared state: the CID count the session maintains and
/// the callout flags the embedder sets
#[derive(Debug, Default, Clone)]
struct SharedState {
    connection_id_count: u64,
    keylog_enabled: bool,
    client_hello_enabled: bool,
    cert_enabled: bool,
}

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub created_at: u64,
    pub handshake_start_at: u64,
    /// Most recent outbound handshake flight
    pub handshake_send_at: u64,
    /// Most recent inbound handshake data
    pub handshake_continue_at: u64,
    pub handshake_completed_at: u64,
    /// Most recent 1-RTT send
    pub session_sent_at: u64,
    pub session_received_at: u64,
    pub closing_at: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bidi_stream_count: u64,
    pub uni_stream_count: u64,
    /// Peer-initiated streams
    pub streams_in_count: u64,
    /// Locally initiated streams
    pub streams_out_count: u64,
    pub keyupdate_count: u64,
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
enum CryptoLevel {
    Initial,
    Handshake,
    ZeroRtt,
    OneRtt,
}

/// Per-connection state machine driving a QUIC transport session
pub struct Session {
    log: Logger,
    side: Side,
    handle: SessionHandle,
    tls: TlsSession,
    state: Option<State>,
    role: Role,

    /// DCID of the client's first Initial; seeds initial secrets
    init_cid: ConnectionId,
    loc_cid: ConnectionId,
    rem_cid: ConnectionId,
    remote: SocketAddrV6,

    initial_crypto: CryptoContext,
    handshake_crypto: CryptoContext,
    zero_rtt_crypto: Option<CryptoContext>,
    crypto: Option<CryptoContext>,
    prev_crypto: Option<(u64, CryptoContext)>,
    key_phase: bool,
    /// Epoch outbound packets are protected under
    tx_crypto_level: CryptoLevel,
    /// Highest epoch observed from the peer
    rx_crypto_level: CryptoLevel,

    /// Outbound TLS bytes pending transport consumption; consumed as the
    /// peer acknowledges CRYPTO extents
    handshake: ChunkedSendBuffer,
    /// Next outbound CRYPTO offset
    crypto_offset: u64,
    crypto_acked: RangeSet,
    crypto_acked_offset: u64,
    /// In-order staging of inbound TLS bytes
    peer_handshake: Vec<u8>,
    /// Read cursor into `peer_handshake`
    ncread: usize,
    crypto_assembler: stream::Assembler,

    /// Assembled packets awaiting handoff
    sendbuf: ChunkedSendBuffer,
    /// Bytes handed to the socket; consumed on send completion so in-flight
    /// writes outlive the packets' assembly
    txbuf: ChunkedSendBuffer,
    tx_in_flight: VecDeque<usize>,

    /// Peer's transport parameters
    params: TransportParameters,
    local_params: TransportParameters,

    streams: StreamTable,
    readable_streams: FnvHashSet<StreamId>,
    blocked_streams: FnvHashSet<StreamId>,
    /// Limit on outgoing data, dictated by peer
    max_data: u64,
    data_sent: u64,
    /// Sum of end offsets of all streams; includes gaps
    data_recvd: u64,
    local_max_data: u64,

    cids: ConnectionIdSet,
    remote_cids: Vec<frame::NewConnectionId>,

    //
    // Loss detection
    //
    mtu: u16,
    rx_packet: u64,
    rx_packet_time: u64,
    handshake_count: u32,
    tlp_count: u32,
    rto_count: u32,
    reordering_threshold: u32,
    loss_time: u64,
    /// μs
    latest_rtt: u64,
    smoothed_rtt: u64,
    rttvar: u64,
    min_rtt: u64,
    max_ack_delay: u64,
    largest_sent_before_rto: u64,
    time_of_last_sent_retransmittable_packet: u64,
    time_of_last_sent_handshake_packet: u64,
    largest_sent_packet: u64,
    largest_acked_packet: u64,
    sent_packets: BTreeMap<u64, SentPacket>,

    //
    // Congestion
    //
    bytes_in_flight: u64,
    /// Driven through the callback surface; consulted for the send window
    congestion: Box<dyn congestion::Controller>,

    awaiting_handshake: bool,
    handshake_pending: Retransmits,
    pending: Retransmits,
    pending_acks: RangeSet,
    permit_ack_only: bool,

    path_challenge: Option<u64>,
    /// Path under validation and the challenge token guarding it
    migration_candidate: Option<(SocketAddrV6, u64)>,

    /// True exactly until the handshake produced its first flight
    initial: bool,
    destroyed: bool,
    handshake_completed: bool,
    in_tls_callback: bool,

    alpn: String,
    last_error: Option<CloseReason>,
    /// Built once when entering the closing period, replayed on ingress
    close_packet: Option<Bytes>,
    idle_timeout: u64,

    shared: SharedState,
    stats: SessionStats,
}

impl Session {
    fn new(
        log: Logger,
        ctx: &mut Context,
        handle: SessionHandle,
        remote: SocketAddrV6,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        role: Role,
        tls: TlsSession,
        local_params: TransportParameters,
        now: u64,
    ) -> Self {
        let side = match role {
            Role::Server(_) => Side::Server,
            Role::Client(_) => Side::Client,
        };
        let mut cids = ConnectionIdSet::new();
        cids.insert(loc_cid);
        ctx.io.push_back(Io::AssociateCid {
            session: handle,
            cid: loc_cid,
        });
        let mut stats = SessionStats::default();
        stats.created_at = now;
        let streams = StreamTable::new(
            ctx.config.transport.max_streams_bidi,
            ctx.config.transport.max_streams_uni,
        );
        let mut this = Session {
            log,
            side,
            handle,
            tls,
            state: Some(State::Initial),
            role,

            init_cid,
            loc_cid,
            rem_cid,
            remote,

            initial_crypto: CryptoContext::new_initial(&init_cid, side),
            handshake_crypto: CryptoContext::new_handshake(&init_cid, side),
            zero_rtt_crypto: None,
            crypto: None,
            prev_crypto: None,
            key_phase: false,
            tx_crypto_level: CryptoLevel::Initial,
            rx_crypto_level: CryptoLevel::Initial,

            handshake: ChunkedSendBuffer::new(),
            crypto_offset: 0,
            crypto_acked: RangeSet::new(),
            crypto_acked_offset: 0,
            peer_handshake: Vec::new(),
            ncread: 0,
            crypto_assembler: stream::Assembler::new(),

            sendbuf: ChunkedSendBuffer::new(),
            txbuf: ChunkedSendBuffer::new(),
            tx_in_flight: VecDeque::new(),

            params: TransportParameters::default(),
            local_params,

            streams,
            readable_streams: FnvHashSet::default(),
            blocked_streams: FnvHashSet::default(),
            max_data: 0,
            data_sent: 0,
            data_recvd: 0,
            local_max_data: ctx.config.transport.max_data,

            cids,
            remote_cids: Vec::new(),

            mtu: ::MIN_MTU,
            rx_packet: 0,
            rx_packet_time: 0,
            handshake_count: 0,
            tlp_count: 0,
            rto_count: 0,
            reordering_threshold: ctx.config.reordering_threshold,
            loss_time: 0,
            latest_rtt: 0,
            smoothed_rtt: 0,
            rttvar: 0,
            min_rtt: u64::max_value(),
            max_ack_delay: 0,
            largest_sent_before_rto: 0,
            time_of_last_sent_retransmittable_packet: 0,
            time_of_last_sent_handshake_packet: 0,
            largest_sent_packet: 0,
            largest_acked_packet: 0,
            sent_packets: BTreeMap::new(),

            bytes_in_flight: 0,
            congestion: Box::new(NewReno::new(
                ctx.config.default_mss,
                ctx.config.initial_window,
                ctx.config.minimum_window,
                ctx.config.loss_reduction_factor,
            )),

            awaiting_handshake: false,
            handshake_pending: Retransmits::default(),
            pending: Retransmits::default(),
            pending_acks: RangeSet::new(),
            permit_ack_only: false,

            path_challenge: None,
            migration_candidate: None,

            initial: true,
            destroyed: false,
            handshake_completed: false,
            in_tls_callback: false,

            alpn: ctx.config.alpn.clone(),
            last_error: None,
            close_packet: None,
            idle_timeout: ctx.config.transport.idle_timeout,

            shared: SharedState::default(),
            stats,
        };
        this.update_cid_count();
        this
    }

    /// Server session, created by the dispatcher for the first Initial of an
    /// unknown connection. `rcid` is the client's source CID, `dcid` the
    /// client-chosen destination the initial secrets derive from.
    pub fn new_server(
        log: Logger,
        ctx: &mut Context,
        handle: SessionHandle,
        remote: SocketAddrV6,
        rcid: ConnectionId,
        dcid: ConnectionId,
        now: u64,
    ) -> Self {
        let loc_cid = ConnectionId::random(&mut ctx.rng, ctx.config.local_cid_len);
        let mut local_params = TransportParameters::default();
        let pscid = ctx.config.transport.to_settings(
            &mut local_params,
            &loc_cid,
            Some(&ctx.config.reset_key),
            &mut ctx.rng,
        );
        let tls = TlsSession::new_server(&ctx.config.tls_server_config, &local_params);
        let mut this = Session::new(
            log,
            ctx,
            handle,
            remote,
            dcid,
            loc_cid,
            rcid,
            Role::Server(ServerState {
                rcid: dcid,
                ocid: None,
                retry_sent: false,
                client_hello_done: false,
                cert_done: false,
                ocsp_response: None,
                pscid,
            }),
            tls,
            local_params,
            now,
        );
        // route the client-chosen CID as well until ours is in use
        ctx.io.push_back(Io::AssociateCid {
            session: handle,
            cid: dcid,
        });
        this.cids.insert(dcid);
        // accept early data protected under the CID-bound 0-RTT keys
        this.zero_rtt_crypto = Some(CryptoContext::new_0rtt(&dcid));
        if let Some(pscid) = pscid {
            ctx.io.push_back(Io::AssociateCid {
                session: handle,
                cid: pscid,
            });
            this.cids.insert(pscid);
        }
        this.update_cid_count();
        this
    }

    /// Client session. Call `connect` to issue the first flight.
    pub fn new_client(
        log: Logger,
        ctx: &mut Context,
        handle: SessionHandle,
        remote: SocketAddrV6,
        client: ClientParams,
        now: u64,
    ) -> Result<Self, crypto::ConnectError> {
        let loc_cid = ConnectionId::random(&mut ctx.rng, ctx.config.local_cid_len);
        let rem_cid = ConnectionId::random(&mut ctx.rng, ctx.config.transport.max_cid_len);
        let mut local_params = TransportParameters::default();
        ctx.config
            .transport
            .to_settings(&mut local_params, &loc_cid, None, &mut ctx.rng);
        let tls = TlsSession::new_client(&client.tls_config, &client.server_name, &local_params)?;
        Ok(Session::new(
            log,
            ctx,
            handle,
            remote,
            rem_cid,
            loc_cid,
            rem_cid,
            Role::Client(ClientState {
                server_name: client.server_name,
                token: Bytes::new(),
                resumption: false,
                session_ticket: None,
                early_params: None,
                preferred_address_policy: client.preferred_address_policy,
                request_ocsp: client.request_ocsp,
            }),
            tls,
            local_params,
            now,
        ))
    }

    //
    // Accessors
    //

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn alpn(&self) -> &str {
        &self.alpn
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn remote_address(&self) -> &SocketAddrV6 {
        &self.remote
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.loc_cid
    }

    pub fn negotiated_version(&self) -> u32 {
        VERSION
    }

    pub fn local_transport_params(&self) -> &TransportParameters {
        &self.local_params
    }

    pub fn is_handshake_completed(&self) -> bool {
        self.handshake_completed
    }

    /// True until the TLS handshake has produced its first flight
    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn is_closing(&self) -> bool {
        match *self.state.as_ref().unwrap() {
            State::Closing => true,
            _ => false,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn last_error(&self) -> Option<&CloseReason> {
        self.last_error.as_ref()
    }

    /// Bytes currently held in the session's queues and reassembly buffers
    pub fn memory_usage(&self) -> usize {
        let mut total = self.sendbuf.length()
            + self.txbuf.length()
            + self.handshake.length()
            + self.peer_handshake.len();
        for (_, stream) in self.streams.streams.iter() {
            if let Some(send) = stream.send() {
                total += send.queue.length();
            }
        }
        total
    }

    pub fn connection_id_count(&self) -> u64 {
        self.shared.connection_id_count
    }

    /// Replace the congestion controller the session drives. The bundled
    /// NewReno instance built from the ambient configuration is installed
    /// until this is called.
    pub fn set_congestion_controller(&mut self, controller: Box<dyn congestion::Controller>) {
        self.congestion = controller;
    }

    pub fn set_keylog_enabled(&mut self, enabled: bool) {
        self.shared.keylog_enabled = enabled;
    }

    pub fn set_client_hello_enabled(&mut self, enabled: bool) {
        self.shared.client_hello_enabled = enabled;
    }

    pub fn set_cert_enabled(&mut self, enabled: bool) {
        self.shared.cert_enabled = enabled;
    }

    /// OCSP response supplied by the embedder for stapling
    pub fn ocsp_response(&self) -> Option<&Bytes> {
        match self.role {
            Role::Server(ref server) => server.ocsp_response.as_ref(),
            Role::Client(_) => None,
        }
    }

    fn update_cid_count(&mut self) {
        self.shared.connection_id_count = self.cids.len() as u64;
    }

    //
    // Client lifecycle
    //

    /// Issue the first handshake flight
    pub fn connect(&mut self, ctx: &mut Context, now: u64) {
        debug_assert_eq!(self.side, Side::Client);
        if let Role::Client(ref client) = self.role {
            if client.resumption {
                self.zero_rtt_crypto = Some(CryptoContext::new_0rtt(&self.init_cid));
            }
        }
        self.stats.handshake_start_at = now;
        self.state = Some(State::Handshake(state::Handshake {
            phase: HandshakePhase::Running,
        }));
        if let Err(reason) = self.tls_handshake(ctx, now) {
            self.handle_error(ctx, now, reason);
            return;
        }
        self.send_pending_data(ctx, now);
    }

    /// Arm resumption with an opaque session ticket captured earlier
    pub fn set_session(&mut self, ticket: &[u8]) -> Result<(), SessionError> {
        if ticket.len() < 2 || BigEndian::read_u16(&ticket[..2]) as usize != ticket.len() - 2 {
            return Err(SessionError::InvalidTlsSessionTicket);
        }
        match self.role {
            Role::Client(ref mut client) => {
                client.session_ticket = Some(Bytes::from(ticket));
                client.resumption = client.early_params.is_some();
                Ok(())
            }
            Role::Server(_) => Err(SessionError::InvalidTlsSessionTicket),
        }
    }

    /// Remembered server transport parameters enabling 0-RTT
    pub fn set_early_transport_params(&mut self, blob: &[u8]) -> Result<(), SessionError> {
        let params = TransportParameters::read(Side::Client, &mut io::Cursor::new(blob))
            .map_err(|_| SessionError::InvalidRemoteTransportParams)?;
        match self.role {
            Role::Client(ref mut client) => {
                client.resumption = client.session_ticket.is_some();
                client.early_params = Some(params.clone());
                self.params = params;
                self.max_data = self.params.initial_max_data;
                self.streams.max_bi = self.params.initial_max_streams_bidi;
                self.streams.max_uni = self.params.initial_max_streams_uni;
                Ok(())
            }
            Role::Server(_) => Err(SessionError::InvalidRemoteTransportParams),
        }
    }

    /// Re-point the session at a different dispatcher socket. Requires spare
    /// connection IDs; with `nat_rebinding` the new path is re-validated.
    pub fn migrate_socket(&mut self, ctx: &mut Context, now: u64, nat_rebinding: bool) -> bool {
        if self.cids.is_empty() || self.destroyed {
            return false;
        }
        let handle = self.handle;
        for (_, cid) in self.cids.iter() {
            ctx.io.push_back(Io::AssociateCid {
                session: handle,
                cid: *cid,
            });
        }
        if nat_rebinding {
            let token = ctx.rng.gen();
            self.migration_candidate = Some((self.remote, token));
            self.path_challenge = Some(token);
        } else {
            self.pending.ping = true;
        }
        self.send_pending_data(ctx, now);
        true
    }

    //
    // Stream API
    //

    pub fn open_bidirectional_stream(&mut self, ctx: &mut Context) -> Result<StreamId, OpenError> {
        self.open_stream(ctx, Directionality::Bi)
    }

    pub fn open_unidirectional_stream(&mut self, ctx: &mut Context) -> Result<StreamId, OpenError> {
        self.open_stream(ctx, Directionality::Uni)
    }

    fn open_stream(
        &mut self,
        ctx: &mut Context,
        directionality: Directionality,
    ) -> Result<StreamId, OpenError> {
        if !self.handshake_completed {
            let can_0rtt = match self.role {
                Role::Client(ref client) => client.resumption,
                Role::Server(_) => false,
            };
            if !can_0rtt {
                return Err(OpenError::NotReady);
            }
        }
        let send_window = match directionality {
            Directionality::Uni => self.params.initial_max_stream_data_uni,
            Directionality::Bi => self.params.initial_max_stream_data_bidi_remote,
        };
        let recv_window = ctx.config.transport.max_stream_data_bidi_local;
        let id = self
            .streams
            .open(self.side, directionality, send_window, recv_window)
            .ok_or(OpenError::StreamLimit)?;
        self.stats.streams_out_count += 1;
        match directionality {
            Directionality::Bi => self.stats.bidi_stream_count += 1,
            Directionality::Uni => self.stats.uni_stream_count += 1,
        }
        trace!(self.log, "opened stream"; "id" => id);
        Ok(id)
    }

    /// Enqueue application chunks on a stream's send queue and schedule
    /// transmission. The completion fires once every byte of the group has
    /// been acknowledged, or with `CANCELED` if the stream or session is
    /// torn down first.
    pub fn write<F>(
        &mut self,
        ctx: &mut Context,
        now: u64,
        id: StreamId,
        data: &[Bytes],
        on_complete: F,
    ) -> Result<(), WriteError>
    where
        F: FnOnce(i32) + 'static,
    {
        if self.state.as_ref().unwrap().is_closed() || self.destroyed {
            return Err(WriteError::Blocked);
        }
        {
            let send = self
                .streams
                .get_send_mut(&id)
                .expect("unknown or recv-only stream");
            if let Err(e) = send.write_budget() {
                if let WriteError::Stopped { .. } = e {
                    return Err(e);
                }
            }
            if send.queue.push(data, on_complete).is_err() {
                return Err(WriteError::Blocked);
            }
        }
        self.send_stream_data(ctx, now, id);
        Ok(())
    }

    /// Mark the stream's outbound direction finished; the FIN rides the
    /// last queued byte
    pub fn finish(&mut self, ctx: &mut Context, now: u64, id: StreamId) {
        {
            let send = self
                .streams
                .get_send_mut(&id)
                .expect("unknown or recv-only stream");
            send.queue.end();
            send.fin_pending = true;
        }
        self.send_stream_data(ctx, now, id);
    }

    /// Move whatever the stream's queue and flow control allow into the
    /// transmit queue, then flush
    pub fn send_stream_data(&mut self, ctx: &mut Context, now: u64, id: StreamId) {
        if self.state.as_ref().unwrap().is_closed() || self.destroyed {
            return;
        }
        self.pack_stream_frames(id);
        self.send_pending_data(ctx, now);
    }

    /// 0-RTT variant; valid on a resuming client before the handshake
    /// completes, and upgrades silently to 1-RTT afterwards
    pub fn send_0rtt_stream_data(&mut self, ctx: &mut Context, now: u64, id: StreamId) {
        let valid = match self.role {
            Role::Client(ref client) => client.resumption,
            Role::Server(_) => false,
        };
        if !valid {
            return;
        }
        self.send_stream_data(ctx, now, id);
    }

    fn pack_stream_frames(&mut self, id: StreamId) {
        let max_data = self.max_data;
        let data_sent = self.data_sent;
        let mut blocked = false;
        let mut sent = 0;
        {
            let send = match self.streams.get_send_mut(&id) {
                Some(x) => x,
                None => return,
            };
            if send.state.was_reset() {
                return;
            }
            let stream_budget = send.max_data.saturating_sub(send.offset);
            let conn_budget = max_data.saturating_sub(data_sent);
            let mut budget = cmp::min(stream_budget, conn_budget);
            send.queue.seek(usize::max_value());
            let mut frames = Vec::new();
            let mut offset = send.offset;
            send.queue.pull(0, usize::max_value(), |_, vecs| {
                let mut taken = 0;
                for data in vecs {
                    if budget == 0 {
                        break;
                    }
                    let n = cmp::min(budget, data.len() as u64) as usize;
                    frames.push(frame::Stream {
                        id,
                        offset,
                        fin: false,
                        data: data.slice_to(n),
                    });
                    offset += n as u64;
                    budget -= n as u64;
                    taken += n;
                    if n < data.len() {
                        break;
                    }
                }
                taken
            });
            for frame in frames {
                sent += frame.data.len() as u64;
                send.bytes_in_flight += frame.data.len() as u64;
                self.pending.stream.push_back(frame);
            }
            send.offset = offset;
            if send.queue.is_ended() && send.fin_pending && send.queue.remaining() == 0 {
                send.fin_pending = false;
                send.state = stream::SendState::DataSent;
                self.pending.stream.push_back(frame::Stream {
                    id,
                    offset,
                    fin: true,
                    data: Bytes::new(),
                });
            }
            if stream_budget == 0 {
                blocked = true;
            }
        }
        self.data_sent += sent;
        if blocked {
            self.blocked_streams.insert(id);
        }
    }

    /// Send STOP_SENDING for the stream's inbound direction
    pub fn shutdown_stream_read(&mut self, ctx: &mut Context, now: u64, id: StreamId, code: u16) {
        let finished = self
            .streams
            .get_recv_mut(&id)
            .map_or(true, |recv| recv.is_finished());
        if !finished {
            self.pending.stop_sending.push((id, code));
            self.send_pending_data(ctx, now);
        }
    }

    /// Abandon the stream's outbound direction with RESET_STREAM
    pub fn shutdown_stream_write(&mut self, ctx: &mut Context, now: u64, id: StreamId, code: u16) {
        self.reset_stream(ctx, now, id, code, None);
    }

    fn reset_stream(
        &mut self,
        ctx: &mut Context,
        now: u64,
        id: StreamId,
        error_code: u16,
        stop_reason: Option<u16>,
    ) {
        {
            let send = match self.streams.get_send_mut(&id) {
                Some(x) => x,
                None => return,
            };
            match send.state {
                stream::SendState::DataRecvd
                | stream::SendState::ResetSent { .. }
                | stream::SendState::ResetRecvd { .. } => return,
                _ => {}
            }
            send.state = stream::SendState::ResetSent { stop_reason };
            send.queue.cancel();
        }
        self.pending.rst_stream.push((id, error_code));
        self.send_pending_data(ctx, now);
    }

    /// Extend the peer's credit on a stream's inbound direction
    pub fn extend_stream_offset(&mut self, ctx: &mut Context, now: u64, id: StreamId, amount: u64) {
        if let Some(recv) = self.streams.get_recv_mut(&id) {
            recv.max_data += amount;
        } else {
            return;
        }
        self.pending.max_stream_data.insert(id);
        self.send_pending_data(ctx, now);
    }

    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.readable_streams.remove(&id);
        let result = {
            let recv = self.streams.get_recv_mut(&id).ok_or(ReadError::Finished)?;
            recv.read(buf)
        };
        if let Ok(len) = result {
            self.local_max_data += len as u64;
            self.pending.max_data = true;
        }
        self.after_read(id, &result.map(|_| ()));
        result
    }

    pub fn read_unordered(&mut self, id: StreamId) -> Result<(Bytes, u64), ReadError> {
        self.readable_streams.remove(&id);
        let result = {
            let recv = self.streams.get_recv_mut(&id).ok_or(ReadError::Finished)?;
            recv.read_unordered()
        };
        if let Ok((ref data, _)) = result {
            self.local_max_data += data.len() as u64;
            self.pending.max_data = true;
        }
        self.after_read(id, &result.as_ref().map(|_| ()).map_err(|&e| e));
        result
    }

    fn after_read(&mut self, id: StreamId, result: &Result<(), ReadError>) {
        match *result {
            Err(ReadError::Finished) | Err(ReadError::Reset { .. }) => {
                self.cleanup_stream(id);
            }
            _ => {}
        }
    }

    fn cleanup_stream(&mut self, id: StreamId) {
        if self.streams.maybe_cleanup(self.side, id) {
            match id.directionality() {
                Directionality::Uni => {
                    self.streams.max_remote_uni += 1;
                    self.pending.max_uni_streams = true;
                }
                Directionality::Bi => {
                    self.streams.max_remote_bi += 1;
                    self.pending.max_bi_streams = true;
                }
            }
        }
    }

    /// Keep an otherwise idle session alive
    pub fn ping(&mut self, ctx: &mut Context, now: u64) {
        self.pending.ping = true;
        self.send_pending_data(ctx, now);
    }

    /// Derive the next 1-RTT key generation locally; the peer follows via
    /// the key-phase bit
    pub fn initiate_key_update(&mut self, ctx: &mut Context, now: u64) {
        if !self.handshake_completed {
            return;
        }
        let new = self.crypto.as_ref().unwrap().update();
        let old = mem::replace(self.crypto.as_mut().unwrap(), new);
        self.prev_crypto = Some((self.largest_sent_packet + 1, old));
        self.key_phase = !self.key_phase;
        self.stats.keyupdate_count += 1;
        self.emit_keylog(ctx, "QUIC_KEY_UPDATE");
        self.pending.ping = true;
        self.send_pending_data(ctx, now);
    }

    //
    // Ingress
    //

    /// Main ingress: one packet's worth of a datagram routed to this
    /// session. Returns any coalesced remainder for the dispatcher to feed
    /// back in.
    pub fn receive(
        &mut self,
        ctx: &mut Context,
        now: u64,
        remote: SocketAddrV6,
        partial: PartialDecode,
    ) -> Option<BytesMut> {
        if self.destroyed {
            return None;
        }
        self.stats.session_received_at = now;
        match *self.state.as_ref().unwrap() {
            State::Closing => {
                // replay the retained close packet, once per ingress datagram
                self.replay_close(ctx);
                return None;
            }
            State::Draining | State::Closed => {
                trace!(self.log, "dropping packet while draining");
                return None;
            }
            _ => {}
        }

        if partial.is_version_negotiate() {
            match partial.finish(None) {
                Ok((packet, _)) => self.handle_version_negotiation(ctx, now, &packet),
                Err(e) => {
                    trace!(self.log, "malformed version negotiation"; "reason" => %e);
                }
            }
            return None;
        }

        let crypto_level = if partial.is_initial() {
            CryptoLevel::Initial
        } else if partial.is_handshake() {
            CryptoLevel::Handshake
        } else if partial.is_0rtt() {
            CryptoLevel::ZeroRtt
        } else {
            CryptoLevel::OneRtt
        };

        // server address validation happens before any decryption work
        if partial.is_initial() && self.side == Side::Server {
            if !self.validate_client_address(ctx, now, &partial) {
                return None;
            }
        }

        if partial.is_retry() || !partial.has_long_header() && self.crypto.is_none() {
            // retries are unprotected; short packets before 1-RTT keys are
            // undecryptable and dropped
            if partial.is_retry() {
                match partial.finish(None) {
                    Ok((packet, _)) => self.handle_retry(ctx, now, packet),
                    Err(e) => {
                        trace!(self.log, "malformed retry"; "reason" => %e);
                    }
                }
            } else {
                trace!(self.log, "dropping short packet before 1-RTT keys");
            }
            return None;
        }
        if !partial.has_long_header() {
            return self.receive_protected(ctx, now, remote, partial);
        }

        let header_key = match crypto_level {
            CryptoLevel::Initial => Some(self.initial_crypto.remote_hp()),
            CryptoLevel::Handshake => Some(self.handshake_crypto.remote_hp()),
            CryptoLevel::ZeroRtt => match self.zero_rtt_crypto {
                Some(ref crypto) => Some(crypto.remote_hp()),
                None => {
                    trace!(self.log, "dropping 0-RTT packet without keys");
                    return None;
                }
            },
            CryptoLevel::OneRtt => unreachable!(),
        };
        let (packet, rest) = match partial.finish(header_key) {
            Ok(x) => x,
            Err(e) => {
                trace!(self.log, "unable to complete packet decoding"; "reason" => %e);
                return None;
            }
        };
        self.handle_packet(ctx, now, remote, packet, crypto_level);
        rest
    }

    fn receive_protected(
        &mut self,
        ctx: &mut Context,
        now: u64,
        remote: SocketAddrV6,
        partial: PartialDecode,
    ) -> Option<BytesMut> {
        let (packet, rest) = {
            let hp = self.crypto.as_ref().unwrap().remote_hp();
            match partial.finish(Some(hp)) {
                Ok(x) => x,
                Err(e) => {
                    trace!(self.log, "unable to complete packet decoding"; "reason" => %e);
                    return None;
                }
            }
        };
        self.handle_packet(ctx, now, remote, packet, CryptoLevel::OneRtt);
        rest
    }

    fn handle_packet(
        &mut self,
        ctx: &mut Context,
        now: u64,
        remote: SocketAddrV6,
        mut packet: Packet,
        crypto_level: CryptoLevel,
    ) {
        if self.is_stateless_reset(&packet) {
            debug!(self.log, "got stateless reset");
            self.stop_timers(ctx);
            ctx.events.push_back((
                self.handle,
                Event::ConnectionLost {
                    reason: SessionError::Reset,
                },
            ));
            self.state = Some(State::Draining);
            return;
        }

        let number = match self.decrypt_packet(crypto_level, &mut packet) {
            Ok(x) => x,
            Err(Some(reason)) => {
                // authentication failure on a packet routed to us
                self.handle_error(ctx, now, reason);
                return;
            }
            Err(None) => {
                trace!(self.log, "dropping undecryptable packet");
                return;
            }
        };
        self.stats.bytes_received +=
            (packet.header_data.len() + packet.payload.len() + AEAD_TAG_SIZE) as u64;
        self.on_packet_authenticated(ctx, now, number);
        if crypto_level == CryptoLevel::OneRtt && self.awaiting_handshake {
            // a protected packet proves the peer finished the handshake;
            // everything still queued for it is moot
            self.handshake_pending = Retransmits::default();
            self.handshake_cleanup(ctx);
        }

        // a validated migration: packets from an unannounced address trigger
        // path validation before traffic moves
        if remote != self.remote && crypto_level == CryptoLevel::OneRtt {
            if self.migration_candidate.map_or(true, |(addr, _)| addr != remote) {
                let token = ctx.rng.gen();
                self.migration_candidate = Some((remote, token));
                self.path_challenge = Some(token);
            }
        }

        if crypto_level == CryptoLevel::Handshake && self.rx_crypto_level == CryptoLevel::Initial {
            self.rx_crypto_level = CryptoLevel::Handshake;
        }

        let payload = packet.payload.freeze();
        let result = self.process_payload(ctx, now, number, payload, crypto_level);
        match result {
            Ok(false) => {}
            Ok(true) => {
                // remote close; stop transmitting and wait out 3 PTO
                self.start_draining_period(ctx, now);
                return;
            }
            Err(reason) => {
                self.handle_error(ctx, now, reason);
                return;
            }
        }
        self.send_pending_data(ctx, now);
    }

    fn is_stateless_reset(&self, packet: &Packet) -> bool {
        let token = match self.params.stateless_reset_token {
            Some(x) => x,
            None => return false,
        };
        if packet.payload.len() < RESET_TOKEN_SIZE {
            return false;
        }
        let suffix = &packet.payload[packet.payload.len() - RESET_TOKEN_SIZE..];
        ::constant_time_eq::constant_time_eq(suffix, &token)
    }

    /// Server: enforce the retry round trip when address validation is on.
    /// Returns whether processing of the packet should continue.
    fn validate_client_address(
        &mut self,
        ctx: &mut Context,
        now: u64,
        partial: &PartialDecode,
    ) -> bool {
        if !ctx.config.validate_address {
            return true;
        }
        let verified = match self.role {
            Role::Server(ref server) => server.ocid.is_some(),
            Role::Client(_) => return true,
        };
        if verified {
            return true;
        }
        let token = match partial.token() {
            Some(token) => token,
            None => return false,
        };
        if token.is_empty() {
            self.send_retry(ctx, now);
            return false;
        }
        match token::verify(
            &token,
            &self.remote,
            now,
            ctx.config.retry_token_expiration,
        ) {
            Ok(ocid) => {
                trace!(self.log, "retry token verified"; "ocid" => %ocid);
                if let Role::Server(ref mut server) = self.role {
                    server.ocid = Some(ocid);
                }
                // the retried initial is keyed by the CID we chose in the
                // retry packet
                let dcid = partial.dst_cid();
                if dcid != self.init_cid {
                    self.init_cid = dcid;
                    self.initial_crypto = CryptoContext::new_initial(&dcid, self.side);
                    self.handshake_crypto = CryptoContext::new_handshake(&dcid, self.side);
                    self.zero_rtt_crypto = Some(CryptoContext::new_0rtt(&dcid));
                }
                true
            }
            Err(e) => {
                debug!(self.log, "dropping initial with bad token"; "reason" => %e);
                false
            }
        }
    }

    fn send_retry(&mut self, ctx: &mut Context, now: u64) {
        {
            let server = match self.role {
                Role::Server(ref mut server) => server,
                Role::Client(_) => return,
            };
            if server.retry_sent {
                return;
            }
            server.retry_sent = true;
        }
        trace!(self.log, "sending retry");
        let token = token::generate(&self.remote, &self.init_cid, now);
        let header = Header::Retry {
            src_cid: self.loc_cid,
            dst_cid: self.rem_cid,
            token: token.into(),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let tag = crypto::retry_tag(&self.init_cid, &buf);
        buf.extend_from_slice(&tag);
        self.transmit_datagram(ctx, now, buf.into());
    }

    /// Client: the server demanded address validation; rebuild the initial
    /// flight around its CID and token
    fn handle_retry(&mut self, ctx: &mut Context, now: u64, packet: Packet) {
        let (src_cid, token) = match packet.header {
            Header::Retry {
                src_cid, ref token, ..
            } => (src_cid, token.clone()),
            _ => return,
        };
        {
            let client = match self.role {
                Role::Client(ref mut client) => client,
                Role::Server(_) => {
                    debug!(self.log, "received retry as a server");
                    return;
                }
            };
            if !client.token.is_empty() {
                // duplicate retry for a retransmitted initial
                return;
            }
            if !crypto::verify_retry_tag(&self.init_cid, &packet.header_data, &packet.payload) {
                debug!(self.log, "retry failed integrity check");
                return;
            }
            client.token = token;
        }
        trace!(self.log, "processing retry"; "rem_cid" => %src_cid);
        self.rem_cid = src_cid;
        // initial secrets rebind to the server-chosen CID
        self.init_cid = src_cid;
        self.initial_crypto = CryptoContext::new_initial(&src_cid, self.side);
        self.handshake_crypto = CryptoContext::new_handshake(&src_cid, self.side);
        if self.zero_rtt_crypto.is_some() {
            self.zero_rtt_crypto = Some(CryptoContext::new_0rtt(&src_cid));
        }
        // everything in flight is moot; requeue it for the new keys
        let packets = mem::replace(&mut self.sent_packets, BTreeMap::new());
        for (_, info) in packets {
            if info.handshake {
                self.handshake_pending += info.retransmits;
            } else {
                self.pending += info.retransmits;
            }
            self.bytes_in_flight -= u64::from(info.bytes);
        }
        self.initial = true;
        self.tx_crypto_level = CryptoLevel::Initial;
        self.send_pending_data(ctx, now);
    }

    fn handle_version_negotiation(&mut self, ctx: &mut Context, now: u64, packet: &Packet) {
        if self.side == Side::Server || !self.initial_exchange_pending() {
            trace!(self.log, "ignoring spurious version negotiation");
            return;
        }
        let mut versions = io::Cursor::new(&packet.payload[..]);
        if packet.payload.len() % 4 != 0 {
            self.handle_error(
                ctx,
                now,
                CloseReason::from(TransportError::PROTOCOL_VIOLATION),
            );
            return;
        }
        while ::bytes::Buf::remaining(&versions) > 0 {
            let version = ::bytes::Buf::get_u32_be(&mut versions);
            if version == VERSION {
                // our version is supported; the packet is spurious
                return;
            }
        }
        debug!(self.log, "remote doesn't support our version");
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: SessionError::VersionMismatch,
            },
        ));
        self.start_draining_period(ctx, now);
    }

    fn initial_exchange_pending(&self) -> bool {
        match *self.state.as_ref().unwrap() {
            State::Initial => true,
            State::Handshake(_) => !self.handshake_completed,
            _ => false,
        }
    }

    fn decrypt_packet(
        &mut self,
        crypto_level: CryptoLevel,
        packet: &mut Packet,
    ) -> Result<u64, Option<CloseReason>> {
        let (key_phase, number) = match packet.header {
            Header::Short {
                key_phase, number, ..
            } => (key_phase, number),
            Header::Initial { number, .. } | Header::Long { number, .. } => (false, number),
            Header::VersionNegotiate { .. } => return Ok(0),
            Header::Retry { .. } => return Err(None),
        };
        let number = number.expand(self.rx_packet);
        match crypto_level {
            CryptoLevel::Initial => self
                .initial_crypto
                .decrypt(number, &packet.header_data, &mut packet.payload)
                .map_err(|()| Some(CloseReason::Crypto(DECRYPT_ERROR_ALERT)))?,
            CryptoLevel::Handshake => self
                .handshake_crypto
                .decrypt(number, &packet.header_data, &mut packet.payload)
                .map_err(|()| Some(CloseReason::Crypto(DECRYPT_ERROR_ALERT)))?,
            CryptoLevel::ZeroRtt => self
                .zero_rtt_crypto
                .as_ref()
                .unwrap()
                .decrypt(number, &packet.header_data, &mut packet.payload)
                .map_err(|()| None)?,
            CryptoLevel::OneRtt => {
                if key_phase != self.key_phase {
                    if number <= self.rx_packet {
                        // illegal key update
                        return Err(Some(CloseReason::from(TransportError::KEY_UPDATE_ERROR)));
                    }
                    let new = self.crypto.as_ref().unwrap().update();
                    new.decrypt(number, &packet.header_data, &mut packet.payload)
                        .map_err(|()| None)?;
                    let old = mem::replace(self.crypto.as_mut().unwrap(), new);
                    self.prev_crypto = Some((number, old));
                    self.key_phase = !self.key_phase;
                    self.stats.keyupdate_count += 1;
                } else {
                    let crypto = match self.prev_crypto {
                        Some((boundary, ref prev)) if number < boundary => prev,
                        _ => self.crypto.as_ref().unwrap(),
                    };
                    crypto
                        .decrypt(number, &packet.header_data, &mut packet.payload)
                        .map_err(|()| Some(CloseReason::Crypto(DECRYPT_ERROR_ALERT)))?;
                }
            }
        }
        Ok(number)
    }

    fn on_packet_authenticated(&mut self, ctx: &mut Context, now: u64, number: u64) {
        trace!(self.log, "packet authenticated"; "pn" => number);
        self.reset_idle_timer(ctx, now);
        self.pending_acks.insert_one(number);
        if self.pending_acks.len() > MAX_ACK_BLOCKS {
            self.pending_acks.pop_min();
        }
        if number > self.rx_packet {
            self.rx_packet = number;
            self.rx_packet_time = now;
        }
    }

    fn process_payload(
        &mut self,
        ctx: &mut Context,
        now: u64,
        number: u64,
        payload: Bytes,
        crypto_level: CryptoLevel,
    ) -> Result<bool, CloseReason> {
        let handshaking = crypto_level != CryptoLevel::OneRtt;
        for frame in frame::Iter::new(payload) {
            match frame {
                Frame::Padding => {}
                _ => {
                    trace!(self.log, "got frame"; "type" => %frame.ty());
                }
            }
            if frame.is_ack_eliciting() {
                self.permit_ack_only = true;
            }
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Crypto(f) => {
                    self.receive_crypto_data(ctx, now, f.offset, &f.data)?;
                }
                Frame::Ack(ack) => {
                    self.on_ack_received(ctx, now, ack);
                }
                Frame::ConnectionClose(reason) => {
                    ctx.events.push_back((
                        self.handle,
                        Event::ConnectionLost {
                            reason: SessionError::ConnectionClosed { reason },
                        },
                    ));
                    return Ok(true);
                }
                Frame::ApplicationClose(reason) => {
                    ctx.events.push_back((
                        self.handle,
                        Event::ConnectionLost {
                            reason: SessionError::ApplicationClosed { reason },
                        },
                    ));
                    return Ok(true);
                }
                Frame::Invalid(ty) => {
                    debug!(self.log, "received malformed frame"; "type" => ty);
                    return Err(TransportError::FRAME_ENCODING_ERROR.into());
                }
                Frame::PathChallenge(token) => {
                    self.pending.path_challenge(number, token);
                }
                Frame::PathResponse(token) => {
                    self.handle_path_response(ctx, token);
                }
                Frame::Stream(f) => {
                    if handshaking && crypto_level != CryptoLevel::ZeroRtt {
                        debug!(self.log, "stream frame in handshake packet");
                        return Err(TransportError::PROTOCOL_VIOLATION.into());
                    }
                    self.receive_stream_data(ctx, f)?;
                }
                Frame::MaxData(bytes) => {
                    let was_blocked = self.blocked();
                    self.max_data = cmp::max(bytes, self.max_data);
                    if was_blocked && !self.blocked() {
                        self.resume_blocked(ctx);
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    if id.initiator() != self.side && id.directionality() == Directionality::Uni {
                        debug!(self.log, "got MAX_STREAM_DATA on recv-only stream");
                        return Err(TransportError::STREAM_STATE_ERROR.into());
                    }
                    let resume = {
                        let send = match self.streams.get_send_mut(&id) {
                            Some(x) => x,
                            None => {
                                debug!(self.log, "got MAX_STREAM_DATA on unopened stream");
                                return Err(TransportError::STREAM_STATE_ERROR.into());
                            }
                        };
                        if offset > send.max_data {
                            trace!(self.log, "stream limit increased"; "stream" => id,
                                   "old" => send.max_data, "new" => offset);
                            let resume = send.offset == send.max_data;
                            send.max_data = offset;
                            resume
                        } else {
                            false
                        }
                    };
                    if resume {
                        self.blocked_streams.remove(&id);
                        ctx.events
                            .push_back((self.handle, Event::StreamWritable { id }));
                        self.pack_stream_frames(id);
                    }
                }
                Frame::MaxStreams {
                    directionality,
                    count,
                } => {
                    let limit = match directionality {
                        Directionality::Uni => &mut self.streams.max_uni,
                        Directionality::Bi => &mut self.streams.max_bi,
                    };
                    if count > *limit {
                        *limit = count;
                        ctx.events
                            .push_back((self.handle, Event::StreamAvailable { directionality }));
                    }
                }
                Frame::ResetStream(frame::ResetStream {
                    id,
                    error_code,
                    final_offset,
                }) => {
                    self.receive_reset_stream(ctx, id, error_code, final_offset)?;
                }
                Frame::StopSending { id, error_code } => {
                    if self
                        .streams
                        .streams
                        .get(&id)
                        .map_or(true, |x| x.send().map_or(true, |s| s.offset == 0))
                    {
                        debug!(self.log, "got STOP_SENDING on invalid stream");
                        return Err(TransportError::STREAM_STATE_ERROR.into());
                    }
                    self.reset_stream(ctx, now, id, error_code, Some(error_code));
                }
                Frame::DataBlocked { offset } => {
                    debug!(self.log, "peer blocked at connection level"; "offset" => offset);
                }
                Frame::StreamDataBlocked { id, offset } => {
                    debug!(self.log, "peer blocked at stream level"; "stream" => id, "offset" => offset);
                }
                Frame::StreamsBlocked { limit, .. } => {
                    debug!(self.log, "peer blocked at stream count"; "limit" => limit);
                }
                Frame::NewConnectionId(frame) => {
                    self.receive_new_cid(frame)?;
                }
                Frame::RetireConnectionId { sequence } => {
                    self.receive_retire_cid(ctx, sequence)?;
                }
            }
        }
        Ok(false)
    }

    fn receive_crypto_data(
        &mut self,
        ctx: &mut Context,
        now: u64,
        offset: u64,
        data: &Bytes,
    ) -> Result<(), CloseReason> {
        self.stats.handshake_continue_at = now;
        self.crypto_assembler.insert(offset, data);
        let mut buf = [0; 8192];
        loop {
            let n = self.crypto_assembler.read(&mut buf);
            if n == 0 {
                break;
            }
            self.peer_handshake.extend_from_slice(&buf[..n]);
        }
        self.tls_handshake(ctx, now)
    }

    /// The crypto buffer and TLS I/O pump: alternate reads of staged peer
    /// bytes with writes of fresh flights, honoring server callout
    /// suspensions
    fn tls_handshake(&mut self, ctx: &mut Context, now: u64) -> Result<(), CloseReason> {
        if self.suspended_phase().is_some() {
            return Ok(());
        }
        if let State::Initial = *self.state.as_ref().unwrap() {
            // first crypto frame processed
            self.state = Some(State::Handshake(state::Handshake {
                phase: HandshakePhase::Running,
            }));
        }
        if self.stats.handshake_start_at == 0 {
            self.stats.handshake_start_at = now;
        }
        self.in_tls_callback = true;
        let result = self.tls_handshake_inner(ctx, now);
        self.in_tls_callback = false;
        result
    }

    fn tls_handshake_inner(&mut self, ctx: &mut Context, now: u64) -> Result<(), CloseReason> {
        // ClientHello callout: suspend before TLS sees the flight
        if self.side == Side::Server
            && self.shared.client_hello_enabled
            && self.peer_handshake.len() > self.ncread
        {
            let fire = match self.role {
                Role::Server(ref server) => !server.client_hello_done,
                Role::Client(_) => false,
            };
            if fire {
                if let Some(State::Handshake(ref mut hs)) = self.state {
                    hs.phase = HandshakePhase::AwaitingClientHello;
                }
                let alpn = self.alpn.clone();
                ctx.events
                    .push_back((self.handle, Event::ClientHello { alpn }));
                trace!(self.log, "handshake suspended for client hello");
                return Ok(());
            }
        }

        loop {
            let mut progress = false;

            if self.tls_read_handshake()? {
                progress = true;
                self.drive_tls()?;
            }

            // Cert callout: after the flight is read, before we commit to a
            // response
            if self.side == Side::Server && self.shared.cert_enabled && !self.handshake_completed {
                let fire = match self.role {
                    Role::Server(ref server) => !server.cert_done && self.ncread > 0,
                    Role::Client(_) => false,
                };
                if fire {
                    if let Some(State::Handshake(ref mut hs)) = self.state {
                        hs.phase = HandshakePhase::AwaitingCert;
                    }
                    let server_name = self.tls.get_sni_hostname().map(|x| x.into());
                    ctx.events
                        .push_back((self.handle, Event::Cert { server_name }));
                    trace!(self.log, "handshake suspended for certificate selection");
                    return Ok(());
                }
            }

            if self.tls_write_handshake(now) {
                progress = true;
            }

            if !self.handshake_completed && !self.tls.is_handshaking() {
                self.complete_handshake(ctx, now)?;
                progress = true;
            }

            if !progress {
                break;
            }
        }
        Ok(())
    }

    /// Feed staged peer bytes to TLS, advancing the read cursor
    fn tls_read_handshake(&mut self) -> Result<bool, CloseReason> {
        if self.ncread >= self.peer_handshake.len() {
            return Ok(false);
        }
        let mut cursor = io::Cursor::new(&self.peer_handshake[self.ncread..]);
        match self.tls.read_tls(&mut cursor) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.ncread += n;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn drive_tls(&mut self) -> Result<(), CloseReason> {
        if let Err(e) = self.tls.process_new_packets() {
            debug!(self.log, "TLS error"; "error" => %e);
            Err(match e {
                crypto::TLSError::AlertReceived(alert) => {
                    CloseReason::Crypto(alert_byte(alert))
                }
                _ => CloseReason::Crypto(HANDSHAKE_FAILURE_ALERT),
            })
        } else {
            Ok(())
        }
    }

    /// Buffer any fresh TLS output and queue it as CRYPTO frames
    fn tls_write_handshake(&mut self, now: u64) -> bool {
        let mut outgoing = Vec::new();
        while self.tls.wants_write() {
            if self.tls.write_tls(&mut outgoing).is_err() {
                break;
            }
        }
        if outgoing.is_empty() {
            return false;
        }
        self.stats.handshake_send_at = now;
        let data = Bytes::from(outgoing);
        let _ = self.handshake.push_owned(data.clone());
        self.handshake.seek(usize::max_value());
        let frame = frame::Crypto {
            offset: self.crypto_offset,
            data,
        };
        self.crypto_offset += frame.data.len() as u64;
        if self.handshake_completed {
            self.pending.crypto.push_back(frame);
        } else {
            self.handshake_pending.crypto.push_back(frame);
            self.awaiting_handshake = true;
        }
        self.initial = false;
        true
    }

    fn suspended_phase(&self) -> Option<HandshakePhase> {
        match *self.state.as_ref().unwrap() {
            State::Handshake(ref hs) if hs.phase != HandshakePhase::Running => Some(hs.phase),
            _ => None,
        }
    }

    /// Resume a handshake suspended for the ClientHello callout
    pub fn on_client_hello_done(&mut self, ctx: &mut Context, now: u64) {
        match self.role {
            Role::Server(ref mut server) => server.client_hello_done = true,
            Role::Client(_) => return,
        }
        if self.suspended_phase() != Some(HandshakePhase::AwaitingClientHello) {
            return;
        }
        if let Some(State::Handshake(ref mut hs)) = self.state {
            hs.phase = HandshakePhase::Running;
        }
        if self.in_tls_callback {
            // the pump is on the stack; let its frame continue
            return;
        }
        if let Err(reason) = self.tls_handshake(ctx, now) {
            self.handle_error(ctx, now, reason);
            return;
        }
        self.send_pending_data(ctx, now);
    }

    /// Resume a handshake suspended for certificate selection, optionally
    /// supplying an OCSP response to staple
    pub fn on_cert_done(&mut self, ctx: &mut Context, now: u64, ocsp_response: Option<Bytes>) {
        match self.role {
            Role::Server(ref mut server) => {
                server.cert_done = true;
                server.ocsp_response = ocsp_response;
            }
            Role::Client(_) => return,
        }
        if self.suspended_phase() != Some(HandshakePhase::AwaitingCert) {
            return;
        }
        if let Some(State::Handshake(ref mut hs)) = self.state {
            hs.phase = HandshakePhase::Running;
        }
        if self.in_tls_callback {
            return;
        }
        if let Err(reason) = self.tls_handshake(ctx, now) {
            self.handle_error(ctx, now, reason);
            return;
        }
        self.send_pending_data(ctx, now);
    }

    fn complete_handshake(&mut self, ctx: &mut Context, now: u64) -> Result<(), CloseReason> {
        let params = {
            let raw = self.tls.get_quic_transport_parameters().ok_or_else(|| {
                debug!(self.log, "remote didn't send transport params");
                CloseReason::from(TransportError::TRANSPORT_PARAMETER_ERROR)
            })?;
            TransportParameters::read(self.side, &mut io::Cursor::new(raw))?
        };
        self.set_params(ctx, params);
        self.crypto = Some(
            CryptoContext::new_1rtt(&self.tls, self.side)
                .map_err(|_| CloseReason::Crypto(HANDSHAKE_FAILURE_ALERT))?,
        );
        self.handshake_completed = true;
        self.handshake_cleanup(ctx);
        self.tx_crypto_level = CryptoLevel::OneRtt;
        self.rx_crypto_level = CryptoLevel::OneRtt;
        self.stats.handshake_completed_at = now;
        self.emit_keylog(ctx, "QUIC_TRAFFIC_SECRET_0");
        let alpn = self.tls.get_alpn_protocol().map(|x| x.to_owned());
        trace!(self.log, "handshake complete"; "alpn" => alpn.as_ref().map_or("", |x| &x[..]));
        ctx.events
            .push_back((self.handle, Event::HandshakeCompleted { alpn }));
        self.state = Some(State::Established);
        self.issue_cids(ctx);
        if self.side == Side::Client {
            self.apply_preferred_address(ctx);
        }
        self.reset_idle_timer(ctx, now);
        Ok(())
    }

    fn set_params(&mut self, ctx: &mut Context, params: TransportParameters) {
        self.streams.max_bi = params.initial_max_streams_bidi;
        self.streams.max_uni = params.initial_max_streams_uni;
        self.max_data = params.initial_max_data;
        for (_, stream) in self.streams.streams.iter_mut() {
            if let Some(send) = stream.send_mut() {
                send.max_data = cmp::max(send.max_data, params.initial_max_stream_data_bidi_remote);
            }
        }
        // effective idle timeout is the smaller nonzero of ours and theirs
        let local = ctx.config.transport.idle_timeout;
        self.idle_timeout = if local == 0 || params.max_idle_timeout == 0 {
            cmp::max(local, params.max_idle_timeout)
        } else {
            cmp::min(local, params.max_idle_timeout)
        };
        self.max_ack_delay = params.max_ack_delay * 1000;
        self.params = params;
    }

    /// Issue fresh connection IDs so the peer can migrate
    fn issue_cids(&mut self, ctx: &mut Context) {
        for _ in 0..ctx.config.issued_cid_count {
            let cid = ConnectionId::random(&mut ctx.rng, ctx.config.local_cid_len);
            let sequence = self.cids.insert(cid);
            ctx.io.push_back(Io::AssociateCid {
                session: self.handle,
                cid,
            });
            let reset_token = reset_token_for(&ctx.config.reset_key, &cid);
            self.pending.new_cids.push(frame::NewConnectionId {
                sequence,
                retire_prior_to: 0,
                id: cid,
                reset_token,
            });
        }
        self.update_cid_count();
    }

    fn apply_preferred_address(&mut self, ctx: &mut Context) {
        let policy = match self.role {
            Role::Client(ref client) => client.preferred_address_policy,
            Role::Server(_) => return,
        };
        if policy != PreferredAddressPolicy::Use {
            return;
        }
        let (address, cid) = match self.params.preferred_address {
            Some(ref preferred) => (preferred.address, preferred.cid),
            None => return,
        };
        trace!(self.log, "switching to preferred address"; "addr" => %address);
        self.remote = address;
        self.rem_cid = cid;
        let token = ctx.rng.gen();
        self.migration_candidate = Some((address, token));
        self.path_challenge = Some(token);
    }

    fn receive_stream_data(
        &mut self,
        ctx: &mut Context,
        frame: frame::Stream,
    ) -> Result<(), CloseReason> {
        trace!(self.log, "got stream"; "id" => frame.id, "offset" => frame.offset,
               "len" => frame.data.len(), "fin" => frame.fin);
        let created = self.streams.ensure_remote(
            self.side,
            frame.id,
            self.local_params.initial_max_stream_data_bidi_local,
            match frame.id.directionality() {
                Directionality::Uni => ctx.config.transport.max_stream_data_uni,
                Directionality::Bi => ctx.config.transport.max_stream_data_bidi_local,
            },
        )?;
        if created > 0 {
            self.stats.streams_in_count += created;
            match frame.id.directionality() {
                Directionality::Bi => self.stats.bidi_stream_count += created,
                Directionality::Uni => self.stats.uni_stream_count += created,
            }
            for i in 0..created {
                let index = frame.id.index() + 1 - created + i;
                let id = StreamId::new(!self.side, frame.id.directionality(), index);
                ctx.events.push_back((self.handle, Event::StreamOpened { id }));
            }
        }
        let data_recvd = self.data_recvd;
        let local_max_data = self.local_max_data;
        let new_bytes = {
            let recv = match self.streams.get_recv_mut(&frame.id) {
                Some(x) => x,
                None => {
                    trace!(self.log, "dropping frame for closed stream");
                    return Ok(());
                }
            };
            let end = frame.offset + frame.data.len() as u64;
            if let Some(final_offset) = recv.final_offset() {
                if end > final_offset || (frame.fin && end != final_offset) {
                    debug!(self.log, "final size error"; "end" => end, "final" => final_offset);
                    return Err(TransportError::FINAL_SIZE_ERROR.into());
                }
            }
            let prev_end = recv.limit();
            let new_bytes = end.saturating_sub(prev_end);
            if end > recv.max_data || data_recvd + new_bytes > local_max_data {
                debug!(self.log, "flow control error";
                       "stream" => frame.id, "end" => end, "stream max" => recv.max_data);
                return Err(TransportError::FLOW_CONTROL_ERROR.into());
            }
            if frame.fin {
                if let stream::RecvState::Recv { ref mut size } = recv.state {
                    *size = Some(end);
                }
            }
            recv.recvd.insert(frame.offset..end);
            recv.assembler.insert(frame.offset, &frame.data);
            if let stream::RecvState::Recv { size: Some(size) } = recv.state {
                if recv.recvd.len() == 1 && recv.recvd.iter().next().unwrap() == (0..size) {
                    recv.state = stream::RecvState::DataRecvd { size };
                }
            }
            new_bytes
        };
        self.data_recvd += new_bytes;
        if self.readable_streams.insert(frame.id) {
            let fresh = {
                let recv = self.streams.get_recv_mut(&frame.id).unwrap();
                mem::replace(&mut recv.fresh, false)
            };
            ctx.events.push_back((
                self.handle,
                Event::StreamReadable {
                    id: frame.id,
                    fresh,
                },
            ));
        }
        Ok(())
    }

    fn receive_reset_stream(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        error_code: u16,
        final_offset: u64,
    ) -> Result<(), CloseReason> {
        let offset = {
            let recv = match self.streams.get_recv_mut(&id) {
                Some(x) => x,
                None => {
                    trace!(self.log, "received RESET_STREAM on closed stream");
                    return Ok(());
                }
            };
            if let Some(known) = recv.final_offset() {
                if known != final_offset {
                    return Err(TransportError::FINAL_SIZE_ERROR.into());
                }
            }
            let offset = recv.limit();
            if !recv.is_closed() {
                recv.state = stream::RecvState::ResetRecvd {
                    size: final_offset,
                    error_code,
                };
            }
            offset
        };
        self.data_recvd += final_offset.saturating_sub(offset);
        // local-only event; stream resets never close the session
        ctx.events.push_back((
            self.handle,
            Event::StreamReset {
                id,
                final_size: final_offset,
                error_code,
            },
        ));
        Ok(())
    }

    fn receive_new_cid(&mut self, frame: frame::NewConnectionId) -> Result<(), CloseReason> {
        if self.remote_cids.len() >= self.local_params.active_connection_id_limit as usize + 8 {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR.into());
        }
        let retire_prior_to = frame.retire_prior_to;
        self.remote_cids.push(frame);
        if retire_prior_to > 0 {
            let expired: Vec<u64> = self
                .remote_cids
                .iter()
                .filter(|x| x.sequence < retire_prior_to)
                .map(|x| x.sequence)
                .collect();
            for sequence in expired {
                self.remote_cids.retain(|x| x.sequence != sequence);
                self.pending.retire_cids.push(sequence);
            }
        }
        Ok(())
    }

    fn receive_retire_cid(
        &mut self,
        ctx: &mut Context,
        sequence: u64,
    ) -> Result<(), CloseReason> {
        let cid = match self.cids.retire(sequence) {
            Some(x) => x,
            None => return Ok(()),
        };
        trace!(self.log, "cid retired by peer"; "cid" => %cid);
        ctx.io.push_back(Io::DisassociateCid {
            session: self.handle,
            cid,
        });
        self.update_cid_count();
        if self.handshake_completed {
            // keep the peer's migration budget topped up
            let fresh = ConnectionId::random(&mut ctx.rng, ctx.config.local_cid_len);
            let new_sequence = self.cids.insert(fresh);
            ctx.io.push_back(Io::AssociateCid {
                session: self.handle,
                cid: fresh,
            });
            self.pending.new_cids.push(frame::NewConnectionId {
                sequence: new_sequence,
                retire_prior_to: 0,
                id: fresh,
                reset_token: reset_token_for(&ctx.config.reset_key, &fresh),
            });
            self.update_cid_count();
        }
        Ok(())
    }

    fn handle_path_response(&mut self, ctx: &mut Context, token: u64) {
        let (addr, expected) = match self.migration_candidate {
            Some(x) => x,
            None => {
                trace!(self.log, "ignoring unsolicited PATH_RESPONSE");
                return;
            }
        };
        if token != expected {
            return;
        }
        self.migration_candidate = None;
        self.remote = addr;
        trace!(self.log, "path validated"; "remote" => %addr);
        ctx.events
            .push_back((self.handle, Event::PathValidated { remote: addr }));
    }

    fn resume_blocked(&mut self, ctx: &mut Context) {
        let blocked: Vec<StreamId> = self.blocked_streams.drain().collect();
        for id in blocked {
            ctx.events
                .push_back((self.handle, Event::StreamWritable { id }));
            self.pack_stream_frames(id);
        }
    }

    //
    // ACK processing, loss detection, congestion
    //

    fn on_ack_received(&mut self, ctx: &mut Context, now: u64, ack: frame::Ack) {
        trace!(self.log, "got ack"; "largest" => ack.largest);
        let was_blocked = self.blocked();
        self.largest_acked_packet = cmp::max(self.largest_acked_packet, ack.largest);
        if let Some(info) = self.sent_packets.get(&ack.largest).cloned() {
            self.latest_rtt = now - info.time;
            let delay = ack.delay << ACK_DELAY_EXPONENT;
            self.update_rtt(delay, info.ack_only());
        }
        for range in ack.iter() {
            let packets: Vec<u64> = self.sent_packets.range(range).map(|(&n, _)| n).collect();
            for packet in packets {
                self.on_packet_acked(ctx, packet);
            }
        }
        self.detect_lost_packets(now, ack.largest);
        self.set_retransmit_alarm(ctx);
        if was_blocked && !self.blocked() {
            self.resume_blocked(ctx);
        }
    }

    fn update_rtt(&mut self, ack_delay: u64, ack_only: bool) {
        self.min_rtt = cmp::min(self.min_rtt, self.latest_rtt);
        if self.latest_rtt.saturating_sub(self.min_rtt) > ack_delay {
            self.latest_rtt -= ack_delay;
            if !ack_only {
                self.max_ack_delay = cmp::max(self.max_ack_delay, ack_delay);
            }
        }
        if self.smoothed_rtt == 0 {
            self.smoothed_rtt = self.latest_rtt;
            self.rttvar = self.latest_rtt / 2;
        } else {
            let rttvar_sample = (self.smoothed_rtt as i64 - self.latest_rtt as i64).abs() as u64;
            self.rttvar = (3 * self.rttvar + rttvar_sample) / 4;
            self.smoothed_rtt = (7 * self.smoothed_rtt + self.latest_rtt) / 8;
        }
    }

    fn on_packet_acked(&mut self, ctx: &mut Context, packet: u64) {
        let info = match self.sent_packets.remove(&packet) {
            Some(x) => x,
            None => return,
        };
        if info.bytes != 0 {
            self.bytes_in_flight -= u64::from(info.bytes);
            self.congestion.on_packet_acked(packet, u64::from(info.bytes));
        }
        if self.rto_count > 0 && packet > self.largest_sent_before_rto {
            // retransmission timeout was spurious
            self.congestion.on_retransmission_timeout_verified();
        }
        self.handshake_count = 0;
        self.tlp_count = 0;
        self.rto_count = 0;

        // credit stream queues for delivered extents; this is what fires
        // application write-group completions
        for frame in &info.retransmits.stream {
            let (advanced, became_finished) = {
                let send = match self.streams.get_send_mut(&frame.id) {
                    Some(x) => x,
                    None => continue,
                };
                send.bytes_in_flight = send
                    .bytes_in_flight
                    .saturating_sub(frame.data.len() as u64);
                let advanced = send.ack(frame.offset, frame.data.len() as u64);
                let finished = send.state == stream::SendState::DataSent
                    && send.bytes_in_flight == 0
                    && send.queue.is_ended()
                    && send.acked_offset == send.offset;
                if finished {
                    send.state = stream::SendState::DataRecvd;
                }
                (advanced, finished)
            };
            if advanced > 0 {
                let send = self.streams.get_send_mut(&frame.id).unwrap();
                send.queue.consume(advanced as usize);
            }
            if became_finished {
                ctx.events
                    .push_back((self.handle, Event::StreamFinished { id: frame.id }));
                self.cleanup_stream(frame.id);
            }
        }
        for (id, _) in &info.retransmits.rst_stream {
            let recvd = {
                let send = match self.streams.get_send_mut(id) {
                    Some(x) => x,
                    None => continue,
                };
                if let stream::SendState::ResetSent { stop_reason } = send.state {
                    send.state = stream::SendState::ResetRecvd { stop_reason };
                    true
                } else {
                    false
                }
            };
            if recvd {
                self.cleanup_stream(*id);
            }
        }
        // crypto extents ack'd in order release the handshake buffer
        for frame in &info.retransmits.crypto {
            if frame.data.len() > 0 {
                self.crypto_acked
                    .insert(frame.offset..frame.offset + frame.data.len() as u64);
            }
            let mut advanced = 0;
            while let Some(range) = self.crypto_acked.pop_min() {
                if range.start > self.crypto_acked_offset {
                    self.crypto_acked.insert(range);
                    break;
                }
                if range.end > self.crypto_acked_offset {
                    advanced += range.end - self.crypto_acked_offset;
                    self.crypto_acked_offset = range.end;
                }
            }
            if advanced > 0 {
                self.handshake.consume(advanced as usize);
            }
        }
        self.pending_acks.subtract(&info.acks);
    }

    fn detect_lost_packets(&mut self, now: u64, largest_acked: u64) {
        self.loss_time = 0;
        let mut lost_packets = Vec::new();
        let rtt = cmp::max(self.latest_rtt, self.smoothed_rtt);
        let delay_until_lost = if largest_acked == self.largest_sent_packet {
            // early retransmit
            (5 * rtt) / 4
        } else {
            u64::max_value()
        };
        for (&packet, info) in self.sent_packets.range(0..largest_acked) {
            let time_since_sent = now - info.time;
            let delta = largest_acked - packet;
            if time_since_sent >= delay_until_lost || delta > u64::from(self.reordering_threshold)
            {
                lost_packets.push(packet);
            } else if self.loss_time == 0 && delay_until_lost != u64::max_value() {
                self.loss_time = now + delay_until_lost - time_since_sent;
            }
        }

        if let Some(&largest_lost) = lost_packets.last() {
            let old_bytes_in_flight = self.bytes_in_flight;
            for packet in lost_packets {
                let info = self.sent_packets.remove(&packet).unwrap();
                if info.handshake {
                    self.handshake_pending += info.retransmits;
                } else {
                    self.pending += info.retransmits;
                }
                self.bytes_in_flight -= u64::from(info.bytes);
            }
            // lost ack-only packets carry no congestion penalty
            let lost_nonack = old_bytes_in_flight != self.bytes_in_flight;
            if lost_nonack {
                self.congestion.on_congestion_event(now, largest_lost);
            }
        }
    }

    /// Timer expiry entry point
    pub fn timeout(&mut self, ctx: &mut Context, now: u64, timer: Timer) {
        if self.destroyed {
            return;
        }
        match timer {
            Timer::Close => {
                ctx.io.push_back(Io::TimerStop {
                    session: self.handle,
                    timer: Timer::Idle,
                });
                ctx.events.push_back((self.handle, Event::ConnectionDrained));
                self.state = Some(State::Closed);
                self.teardown(ctx);
            }
            Timer::Idle => {
                self.on_idle_timeout(ctx, now);
            }
            Timer::Retransmit => {
                self.check_packet_loss(ctx, now);
                self.send_pending_data(ctx, now);
            }
        }
    }

    fn on_idle_timeout(&mut self, ctx: &mut Context, now: u64) {
        debug!(self.log, "idle timeout");
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: SessionError::TimedOut,
            },
        ));
        match self.side {
            // the server lingers in the draining period in case the peer is
            // merely slow
            Side::Server => self.start_draining_period(ctx, now),
            // the client tears down immediately
            Side::Client => {
                self.state = Some(State::Closed);
                self.teardown(ctx);
            }
        }
    }

    fn check_packet_loss(&mut self, ctx: &mut Context, now: u64) {
        if self.awaiting_handshake {
            trace!(self.log, "retransmitting handshake packets");
            let packets: Vec<u64> = self
                .sent_packets
                .iter()
                .filter_map(|(&packet, info)| if info.handshake { Some(packet) } else { None })
                .collect();
            for number in packets {
                let info = self.sent_packets.remove(&number).unwrap();
                self.handshake_pending += info.retransmits;
                self.bytes_in_flight -= u64::from(info.bytes);
            }
            self.handshake_count += 1;
        } else if self.loss_time != 0 {
            let largest = self.largest_acked_packet;
            self.detect_lost_packets(now, largest);
        } else if self.tlp_count < ctx.config.max_tlps {
            trace!(self.log, "sending tail loss probe");
            // tail loss probe
            self.pending.ping = true;
            self.tlp_count += 1;
        } else {
            trace!(self.log, "retransmission timeout");
            if self.rto_count == 0 {
                self.largest_sent_before_rto = self.largest_sent_packet;
            }
            self.pending.ping = true;
            self.rto_count += 1;
        }
        self.set_retransmit_alarm(ctx);
    }

    fn set_retransmit_alarm(&mut self, ctx: &mut Context) {
        if self.bytes_in_flight == 0 {
            ctx.io.push_back(Io::TimerStop {
                session: self.handle,
                timer: Timer::Retransmit,
            });
            return;
        }
        let alarm = if self.awaiting_handshake {
            let mut duration = if self.smoothed_rtt == 0 {
                2 * ctx.config.default_initial_rtt
            } else {
                2 * self.smoothed_rtt
            };
            duration = cmp::max(duration + self.max_ack_delay, ctx.config.min_tlp_timeout);
            duration *= 2u64.pow(self.handshake_count);
            self.time_of_last_sent_handshake_packet + duration
        } else if self.loss_time != 0 {
            self.loss_time
        } else {
            // TLP or RTO
            let mut duration = self.rto(ctx);
            if self.tlp_count < ctx.config.max_tlps {
                let tlp = cmp::max(
                    (3 * self.smoothed_rtt) / 2 + self.max_ack_delay,
                    ctx.config.min_tlp_timeout,
                );
                duration = cmp::min(duration, tlp);
            }
            self.time_of_last_sent_retransmittable_packet + duration
        };
        ctx.io.push_back(Io::TimerStart {
            session: self.handle,
            timer: Timer::Retransmit,
            time: alarm,
        });
    }

    /// Probe timeout
    fn rto(&self, ctx: &Context) -> u64 {
        let computed = self.smoothed_rtt + 4 * self.rttvar + self.max_ack_delay;
        cmp::max(computed, ctx.config.min_rto_timeout) * 2u64.pow(self.rto_count)
    }

    /// Consider previously transmitted handshake packets delivered; the
    /// peer's handshake state has demonstrably advanced. Unsent handshake
    /// frames stay queued.
    fn handshake_cleanup(&mut self, ctx: &mut Context) {
        if !self.awaiting_handshake {
            return;
        }
        let packets: Vec<u64> = self
            .sent_packets
            .iter()
            .filter_map(|(&packet, info)| if info.handshake { Some(packet) } else { None })
            .collect();
        for packet in packets {
            self.on_packet_acked(ctx, packet);
        }
        self.awaiting_handshake = !self.handshake_pending.is_empty();
    }

    fn reset_idle_timer(&mut self, ctx: &mut Context, now: u64) {
        if self.state.as_ref().unwrap().is_closed() || self.idle_timeout == 0 {
            return;
        }
        ctx.io.push_back(Io::TimerStart {
            session: self.handle,
            timer: Timer::Idle,
            time: now + self.idle_timeout * 1000,
        });
    }

    //
    // Egress
    //

    /// Write packets while the transport has data and the pacer permits,
    /// flushing each through `sendbuf` and `txbuf` to the socket
    pub fn send_pending_data(&mut self, ctx: &mut Context, now: u64) {
        if self.destroyed {
            return;
        }
        let mut sent = false;
        while let Some(packet) = self.next_packet(ctx, now) {
            let _ = self.sendbuf.push_owned(packet.into());
            self.send_packet(ctx, now);
            sent = true;
        }
        if sent {
            self.reset_idle_timer(ctx, now);
            self.set_retransmit_alarm(ctx);
        }
    }

    /// Hand everything staged in `sendbuf` to the socket via `txbuf`
    fn send_packet(&mut self, ctx: &mut Context, now: u64) {
        let mut staged = Vec::new();
        self.sendbuf.pull(0, usize::max_value(), |_, vecs| {
            let mut n = 0;
            for data in vecs {
                staged.push(data.clone());
                n += data.len();
            }
            n
        });
        let mut total = 0;
        for chunk in &staged {
            total += chunk.len();
            let _ = self.txbuf.push_owned(chunk.clone());
        }
        self.sendbuf.consume(total);
        if staged.is_empty() {
            return;
        }

        let mut datagram = Vec::new();
        let mut len = 0;
        self.txbuf.pull(0, usize::max_value(), |_, vecs| {
            let mut n = 0;
            for data in vecs {
                datagram.push(data.clone());
                n += data.len();
            }
            len = n;
            n
        });
        if datagram.is_empty() {
            return;
        }
        self.tx_in_flight.push_back(len);
        self.stats.bytes_sent += len as u64;
        if self.handshake_completed {
            self.stats.session_sent_at = now;
        }
        ctx.io.push_back(Io::Transmit {
            destination: self.remote,
            datagram,
        });
    }

    /// Socket write completion; releases the shared transmit buffer
    pub fn on_send_done(&mut self, ctx: &mut Context, now: u64, status: i32) {
        if self.destroyed {
            return;
        }
        let len = match self.tx_in_flight.pop_front() {
            Some(x) => x,
            None => return,
        };
        self.txbuf.consume(len);
        if status < 0 {
            debug!(self.log, "socket send failed"; "status" => status);
            self.handle_error(ctx, now, CloseReason::from(TransportError::INTERNAL_ERROR));
        }
    }

    /// Send one datagram directly, bypassing packetization (retries and
    /// close replays)
    fn transmit_datagram(&mut self, ctx: &mut Context, now: u64, data: Bytes) {
        let _ = self.sendbuf.push_owned(data);
        self.send_packet(ctx, now);
    }

    fn next_packet(&mut self, ctx: &mut Context, now: u64) -> Option<Vec<u8>> {
        let established = match *self.state.as_ref().unwrap() {
            State::Initial | State::Handshake(_) => false,
            State::Established => true,
            // the closing and draining periods send nothing new
            _ => return None,
        };

        let mut buf = Vec::new();
        let mut sent = Retransmits::default();

        let (number, acks, ack_only, handshake) = {
            let (number, header, crypto_level, pending) = if (!established
                || self.awaiting_handshake)
                && (!self.handshake_pending.is_empty()
                    || (!self.pending_acks.is_empty() && self.permit_ack_only))
            {
                // (re)transmit handshake data in long-header packets
                buf.reserve_exact(self.mtu as usize);
                let number = self.get_tx_number();
                trace!(self.log, "sending handshake packet"; "pn" => number);
                let level = if self.tx_crypto_level == CryptoLevel::Initial {
                    CryptoLevel::Initial
                } else {
                    CryptoLevel::Handshake
                };
                let header = if level == CryptoLevel::Initial {
                    let token = match self.role {
                        Role::Client(ref client) => client.token.clone(),
                        Role::Server(_) => Bytes::new(),
                    };
                    Header::Initial {
                        src_cid: self.loc_cid,
                        dst_cid: self.rem_cid,
                        token,
                        number: PacketNumber::new(number, self.largest_acked_packet),
                    }
                } else {
                    Header::Long {
                        ty: LongType::Handshake,
                        src_cid: self.loc_cid,
                        dst_cid: self.rem_cid,
                        number: PacketNumber::new(number, self.largest_acked_packet),
                    }
                };
                (number, header, level, &mut self.handshake_pending)
            } else if established
                || (self.zero_rtt_crypto.is_some() && self.side == Side::Client)
            {
                // 0-RTT or 1-RTT data
                if self.congestion_blocked()
                    || self.pending.is_empty()
                        && (!self.permit_ack_only || self.pending_acks.is_empty())
                {
                    return None;
                }
                let number = self.get_tx_number();
                buf.reserve_exact(self.mtu as usize);
                if established {
                    trace!(self.log, "sending protected packet"; "pn" => number);
                    let header = Header::Short {
                        dst_cid: self.rem_cid,
                        number: PacketNumber::new(number, self.largest_acked_packet),
                        key_phase: self.key_phase,
                    };
                    (number, header, CryptoLevel::OneRtt, &mut self.pending)
                } else {
                    trace!(self.log, "sending 0-RTT packet"; "pn" => number);
                    let header = Header::Long {
                        ty: LongType::ZeroRtt,
                        src_cid: self.loc_cid,
                        dst_cid: self.rem_cid,
                        number: PacketNumber::new(number, self.largest_acked_packet),
                    };
                    (number, header, CryptoLevel::ZeroRtt, &mut self.pending)
                }
            } else {
                return None;
            };

            let partial_encode = header.encode(&mut buf);
            let ack_only = pending.is_empty();
            let header_len = buf.len();
            let max_size = self.mtu as usize - AEAD_TAG_SIZE;

            // PING
            if pending.ping {
                trace!(self.log, "ping");
                pending.ping = false;
                sent.ping = true;
                buf.write_var(frame::ty::PING);
            }

            // ACK
            let acks = if !self.pending_acks.is_empty() {
                let delay = now.saturating_sub(self.rx_packet_time) >> ACK_DELAY_EXPONENT;
                frame::Ack::encode(delay, &self.pending_acks, &mut buf);
                self.pending_acks.clone()
            } else {
                RangeSet::new()
            };

            // PATH_CHALLENGE
            if let Some(token) = self.path_challenge.take() {
                if buf.len() + 9 < max_size {
                    trace!(self.log, "PATH_CHALLENGE"; "token" => format!("{:08x}", token));
                    buf.write_var(frame::ty::PATH_CHALLENGE);
                    buf.write::<u64>(token);
                }
            }

            // PATH_RESPONSE
            if buf.len() + 9 < max_size {
                if let Some((_, token)) = pending.path_response.take() {
                    trace!(self.log, "PATH_RESPONSE"; "token" => format!("{:08x}", token));
                    buf.write_var(frame::ty::PATH_RESPONSE);
                    buf.write::<u64>(token);
                }
            }

            // CRYPTO
            while buf.len() + frame::Crypto::SIZE_BOUND < max_size {
                let mut frame = match pending.crypto.pop_front() {
                    Some(x) => x,
                    None => break,
                };
                let len = cmp::min(
                    frame.data.len(),
                    max_size - buf.len() - frame::Crypto::SIZE_BOUND,
                );
                let data = frame.data.split_to(len);
                let partial = frame::Crypto {
                    offset: frame.offset,
                    data,
                };
                trace!(self.log, "CRYPTO"; "off" => partial.offset, "len" => len);
                partial.encode(&mut buf);
                sent.crypto.push_back(partial);
                if !frame.data.is_empty() {
                    frame.offset += len as u64;
                    pending.crypto.push_front(frame);
                }
            }

            // RESET_STREAM
            while buf.len() + 19 < max_size {
                let (id, error_code) = match pending.rst_stream.pop() {
                    Some(x) => x,
                    None => break,
                };
                let final_offset = match self.streams.streams.get(&id) {
                    Some(x) => x.send().map_or(0, |s| s.offset),
                    None => continue,
                };
                trace!(self.log, "RESET_STREAM"; "stream" => id);
                sent.rst_stream.push((id, error_code));
                frame::ResetStream {
                    id,
                    error_code,
                    final_offset,
                }.encode(&mut buf);
            }

            // STOP_SENDING
            while buf.len() + 11 < max_size {
                let (id, error_code) = match pending.stop_sending.pop() {
                    Some(x) => x,
                    None => break,
                };
                let still_recv = self
                    .streams
                    .streams
                    .get(&id)
                    .and_then(|x| x.recv())
                    .map_or(false, |x| !x.is_finished());
                if !still_recv {
                    continue;
                }
                trace!(self.log, "STOP_SENDING"; "stream" => id);
                sent.stop_sending.push((id, error_code));
                buf.write_var(frame::ty::STOP_SENDING);
                buf.write_var(id.0);
                buf.write_var(u64::from(error_code));
            }

            // MAX_DATA
            if pending.max_data && buf.len() + 9 < max_size {
                trace!(self.log, "MAX_DATA"; "value" => self.local_max_data);
                pending.max_data = false;
                sent.max_data = true;
                buf.write_var(frame::ty::MAX_DATA);
                buf.write_var(self.local_max_data);
            }

            // MAX_STREAM_DATA
            while buf.len() + 17 < max_size {
                let id = match pending.max_stream_data.iter().next() {
                    Some(&x) => x,
                    None => break,
                };
                pending.max_stream_data.remove(&id);
                let max = match self.streams.streams.get(&id).and_then(|x| x.recv()) {
                    Some(recv) if !recv.is_finished() => recv.max_data,
                    _ => continue,
                };
                sent.max_stream_data.insert(id);
                trace!(self.log, "MAX_STREAM_DATA"; "stream" => id, "value" => max);
                buf.write_var(frame::ty::MAX_STREAM_DATA);
                buf.write_var(id.0);
                buf.write_var(max);
            }

            // MAX_STREAMS
            if pending.max_uni_streams && buf.len() + 9 < max_size {
                pending.max_uni_streams = false;
                sent.max_uni_streams = true;
                trace!(self.log, "MAX_STREAMS (unidirectional)"; "value" => self.streams.max_remote_uni);
                buf.write_var(frame::ty::MAX_STREAMS_UNI);
                buf.write_var(self.streams.max_remote_uni);
            }
            if pending.max_bi_streams && buf.len() + 9 < max_size {
                pending.max_bi_streams = false;
                sent.max_bi_streams = true;
                trace!(self.log, "MAX_STREAMS (bidirectional)"; "value" => self.streams.max_remote_bi);
                buf.write_var(frame::ty::MAX_STREAMS_BIDI);
                buf.write_var(self.streams.max_remote_bi);
            }

            // NEW_CONNECTION_ID
            while buf.len() + 44 < max_size {
                let frame = match pending.new_cids.pop() {
                    Some(x) => x,
                    None => break,
                };
                trace!(self.log, "NEW_CONNECTION_ID"; "cid" => %frame.id);
                frame.encode(&mut buf);
                sent.new_cids.push(frame);
            }

            // RETIRE_CONNECTION_ID
            while buf.len() + 9 < max_size {
                let sequence = match pending.retire_cids.pop() {
                    Some(x) => x,
                    None => break,
                };
                trace!(self.log, "RETIRE_CONNECTION_ID"; "sequence" => sequence);
                buf.write_var(frame::ty::RETIRE_CONNECTION_ID);
                buf.write_var(sequence);
                sent.retire_cids.push(sequence);
            }

            // STREAM
            while buf.len() + frame::Stream::SIZE_BOUND < max_size {
                let mut frame = match pending.stream.pop_front() {
                    Some(x) => x,
                    None => break,
                };
                if self
                    .streams
                    .streams
                    .get(&frame.id)
                    .map_or(true, |s| s.send().map_or(true, |ss| ss.state.was_reset()))
                {
                    continue;
                }
                let len = cmp::min(
                    frame.data.len(),
                    max_size - buf.len() - frame::Stream::SIZE_BOUND,
                );
                let data = frame.data.split_to(len);
                let fin = frame.fin && frame.data.is_empty();
                trace!(self.log, "STREAM"; "id" => frame.id, "off" => frame.offset,
                       "len" => len, "fin" => fin);
                let partial = frame::Stream {
                    id: frame.id,
                    offset: frame.offset,
                    fin,
                    data,
                };
                partial.encode(true, &mut buf);
                sent.stream.push_back(partial);
                if !frame.data.is_empty() {
                    frame.offset += len as u64;
                    pending.stream.push_front(frame);
                }
            }

            // ensure a header-protection sample exists
            let pn_len = match header {
                Header::Initial { number, .. }
                | Header::Long { number, .. }
                | Header::Short { number, .. } => number.len(),
                _ => unreachable!(),
            };
            while buf.len() - header_len + pn_len < 4 {
                buf.write_var(frame::ty::PADDING);
            }
            if let Header::Initial { .. } = header {
                // initial flights are padded to the minimum datagram size
                if self.side == Side::Client
                    && buf.len() < MIN_INITIAL_SIZE - AEAD_TAG_SIZE
                {
                    buf.resize(MIN_INITIAL_SIZE - AEAD_TAG_SIZE, 0);
                }
            }
            if crypto_level != CryptoLevel::OneRtt {
                set_payload_length(&mut buf, header_len, pn_len);
            }
            {
                let crypto = match crypto_level {
                    CryptoLevel::Initial => &self.initial_crypto,
                    CryptoLevel::Handshake => &self.handshake_crypto,
                    CryptoLevel::ZeroRtt => self.zero_rtt_crypto.as_ref().unwrap(),
                    CryptoLevel::OneRtt => self.crypto.as_ref().unwrap(),
                };
                crypto.encrypt(number, &mut buf, header_len);
                partial_encode.finish(&mut buf, crypto.local_hp());
            }
            (
                number,
                acks,
                ack_only,
                crypto_level == CryptoLevel::Initial || crypto_level == CryptoLevel::Handshake,
            )
        };
        // after the first long packet, further long packets ride the
        // handshake epoch
        if handshake && self.tx_crypto_level == CryptoLevel::Initial {
            self.tx_crypto_level = CryptoLevel::Handshake;
        }

        // if we sent acks, don't immediately resend them
        self.permit_ack_only &= acks.is_empty();

        self.on_packet_sent(
            ctx,
            now,
            number,
            SentPacket {
                acks,
                time: now,
                bytes: if ack_only { 0 } else { buf.len() as u16 },
                handshake,
                retransmits: sent,
            },
        );

        Some(buf)
    }

    fn get_tx_number(&mut self) -> u64 {
        self.largest_sent_packet = self.largest_sent_packet.overflowing_add(1).0;
        debug_assert!(self.largest_sent_packet < 2u64.pow(62));
        self.largest_sent_packet
    }

    fn on_packet_sent(&mut self, ctx: &mut Context, now: u64, number: u64, packet: SentPacket) {
        self.largest_sent_packet = number;
        let bytes = packet.bytes;
        let handshake = packet.handshake;
        if handshake {
            self.awaiting_handshake = true;
        }
        self.congestion.on_packet_sent(now, number, u64::from(bytes));
        self.sent_packets.insert(number, packet);
        if bytes != 0 {
            self.time_of_last_sent_retransmittable_packet = now;
            if handshake {
                self.time_of_last_sent_handshake_packet = now;
            }
            self.bytes_in_flight += u64::from(bytes);
            self.set_retransmit_alarm(ctx);
        }
    }

    fn congestion_blocked(&self) -> bool {
        self.congestion.window().saturating_sub(self.bytes_in_flight) < u64::from(self.mtu)
    }

    fn blocked(&self) -> bool {
        self.data_sent >= self.max_data || self.congestion_blocked()
    }

    //
    // Close / teardown
    //

    /// Begin a graceful close with an application error code
    pub fn close(&mut self, ctx: &mut Context, now: u64, error_code: u16, reason: Bytes) {
        if self.state.as_ref().unwrap().is_closed() || self.destroyed {
            return;
        }
        let reason = CloseReason::Application(frame::ApplicationClose { error_code, reason });
        self.last_error = Some(reason.clone());
        self.start_closing_period(ctx, now, reason);
    }

    /// A local error: record it and emit CONNECTION_CLOSE
    fn handle_error(&mut self, ctx: &mut Context, now: u64, reason: CloseReason) {
        if self.state.as_ref().unwrap().is_closed() || self.destroyed {
            return;
        }
        warn!(self.log, "closing on error"; "reason" => %reason.error());
        self.last_error = Some(reason.clone());
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: reason.error(),
            },
        ));
        self.start_closing_period(ctx, now, reason);
    }

    /// Build the close packet once, send it, and replay it for any further
    /// ingress until the close timer fires
    fn start_closing_period(&mut self, ctx: &mut Context, now: u64, reason: CloseReason) {
        self.stats.closing_at = now;
        let packet = self.make_close(&reason);
        self.close_packet = Some(packet.clone());
        self.state = Some(State::Closing);
        self.transmit_datagram(ctx, now, packet);
        ctx.io.push_back(Io::TimerStop {
            session: self.handle,
            timer: Timer::Retransmit,
        });
        ctx.io.push_back(Io::TimerStart {
            session: self.handle,
            timer: Timer::Close,
            time: now + 3 * self.rto(ctx),
        });
    }

    fn replay_close(&mut self, ctx: &mut Context) {
        let packet = match self.close_packet {
            Some(ref x) => x.clone(),
            None => return,
        };
        trace!(self.log, "replaying close packet");
        let now = self.stats.closing_at;
        self.transmit_datagram(ctx, now, packet);
    }

    /// Remote close: discard outbound state and wait 3 PTO before releasing
    fn start_draining_period(&mut self, ctx: &mut Context, now: u64) {
        if let State::Draining | State::Closed = *self.state.as_ref().unwrap() {
            return;
        }
        trace!(self.log, "draining");
        self.state = Some(State::Draining);
        self.sendbuf.cancel();
        self.pending = Retransmits::default();
        self.handshake_pending = Retransmits::default();
        ctx.io.push_back(Io::TimerStop {
            session: self.handle,
            timer: Timer::Retransmit,
        });
        ctx.io.push_back(Io::TimerStart {
            session: self.handle,
            timer: Timer::Close,
            time: now + 3 * self.rto(ctx),
        });
    }

    fn make_close(&mut self, reason: &CloseReason) -> Bytes {
        let number = self.get_tx_number();
        let mut buf = Vec::new();
        let (header, crypto_level) = if self.crypto.is_some() {
            (
                Header::Short {
                    dst_cid: self.rem_cid,
                    number: PacketNumber::new(number, self.largest_acked_packet),
                    key_phase: self.key_phase,
                },
                CryptoLevel::OneRtt,
            )
        } else if self.tx_crypto_level == CryptoLevel::Handshake {
            (
                Header::Long {
                    ty: LongType::Handshake,
                    src_cid: self.loc_cid,
                    dst_cid: self.rem_cid,
                    number: PacketNumber::new(number, self.largest_acked_packet),
                },
                CryptoLevel::Handshake,
            )
        } else {
            (
                Header::Initial {
                    src_cid: self.loc_cid,
                    dst_cid: self.rem_cid,
                    token: Bytes::new(),
                    number: PacketNumber::new(number, self.largest_acked_packet),
                },
                CryptoLevel::Initial,
            )
        };
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        let max_len = self.mtu as usize - header_len - AEAD_TAG_SIZE;
        match *reason {
            CloseReason::Application(ref x) => x.encode(&mut buf, max_len),
            CloseReason::Session(ref x) => x.encode(&mut buf, max_len),
            CloseReason::Crypto(alert) => frame::ConnectionClose {
                error_code: TransportError::crypto(alert),
                frame_type: None,
                reason: Bytes::new(),
            }.encode(&mut buf, max_len),
        }
        let pn_len = match header {
            Header::Initial { number, .. }
            | Header::Long { number, .. }
            | Header::Short { number, .. } => number.len(),
            _ => unreachable!(),
        };
        while buf.len() - header_len + pn_len < 4 {
            buf.write_var(frame::ty::PADDING);
        }
        if crypto_level != CryptoLevel::OneRtt {
            set_payload_length(&mut buf, header_len, pn_len);
        }
        {
            let crypto = match crypto_level {
                CryptoLevel::Initial => &self.initial_crypto,
                CryptoLevel::Handshake => &self.handshake_crypto,
                _ => self.crypto.as_ref().unwrap(),
            };
            crypto.encrypt(number, &mut buf, header_len);
            partial_encode.finish(&mut buf, crypto.local_hp());
        }
        buf.into()
    }

    /// Transition to CLOSED and tear down immediately. Outstanding buffered
    /// sends complete with `CANCELED`.
    pub fn destroy(&mut self, ctx: &mut Context) {
        if self.destroyed {
            return;
        }
        trace!(self.log, "destroying session");
        self.state = Some(State::Closed);
        self.teardown(ctx);
    }

    fn teardown(&mut self, ctx: &mut Context) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.stop_timers(ctx);
        self.sendbuf.cancel();
        self.handshake.cancel();
        self.txbuf.cancel();
        self.tx_in_flight.clear();
        self.streams.clear();
        self.readable_streams.clear();
        self.blocked_streams.clear();
        for cid in self.cids.drain() {
            ctx.io.push_back(Io::DisassociateCid {
                session: self.handle,
                cid,
            });
        }
        self.update_cid_count();
        ctx.io.push_back(Io::RemoveSession {
            session: self.handle,
        });
    }

    fn stop_timers(&mut self, ctx: &mut Context) {
        for &timer in &[Timer::Idle, Timer::Retransmit, Timer::Close] {
            ctx.io.push_back(Io::TimerStop {
                session: self.handle,
                timer,
            });
        }
    }

    fn emit_keylog(&mut self, ctx: &mut Context, label: &str) {
        if !self.shared.keylog_enabled {
            return;
        }
        let mut line = String::new();
        line.push_str(label);
        line.push(' ');
        line.push_str(&format!("{}", self.loc_cid));
        line.push(' ');
        if let Some(ref crypto) = self.crypto {
            for byte in crypto.local_secret() {
                line.push_str(&format!("{:02x}", byte));
            }
        }
        ctx.events.push_back((self.handle, Event::Keylog { line }));
    }
}

/// Frames queued for (re)transmission
#[derive(Clone)]
pub struct Retransmits {
    pub max_data: bool,
    pub max_uni_streams: bool,
    pub max_bi_streams: bool,
    pub ping: bool,
    pub new_cids: Vec<frame::NewConnectionId>,
    pub retire_cids: Vec<u64>,
    pub crypto: VecDeque<frame::Crypto>,
    pub stream: VecDeque<frame::Stream>,
    /// Packet number it answers, token
    pub path_response: Option<(u64, u64)>,
    pub rst_stream: Vec<(StreamId, u16)>,
    pub stop_sending: Vec<(StreamId, u16)>,
    pub max_stream_data: FnvHashSet<StreamId>,
}

impl Retransmits {
    fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_uni_streams
            && !self.max_bi_streams
            && !self.ping
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
            && self.crypto.is_empty()
            && self.stream.is_empty()
            && self.path_response.is_none()
            && self.rst_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
    }

    /// Queue a response to a path challenge, superseding older challenges
    pub fn path_challenge(&mut self, packet: u64, token: u64) {
        match self.path_response {
            None => {
                self.path_response = Some((packet, token));
            }
            Some((existing, _)) if packet > existing => {
                self.path_response = Some((packet, token));
            }
            Some(_) => {}
        }
    }
}

impl Default for Retransmits {
    fn default() -> Self {
        Retransmits {
            max_data: false,
            max_uni_streams: false,
            max_bi_streams: false,
            ping: false,
            new_cids: Vec::new(),
            retire_cids: Vec::new(),
            crypto: VecDeque::new(),
            stream: VecDeque::new(),
            path_response: None,
            rst_stream: Vec::new(),
            stop_sending: Vec::new(),
            max_stream_data: FnvHashSet::default(),
        }
    }
}

impl ::std::ops::AddAssign for Retransmits {
    fn add_assign(&mut self, rhs: Self) {
        self.max_data |= rhs.max_data;
        self.ping |= rhs.ping;
        self.max_uni_streams |= rhs.max_uni_streams;
        self.max_bi_streams |= rhs.max_bi_streams;
        self.new_cids.extend(rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
        self.crypto.extend(rhs.crypto.into_iter());
        self.stream.extend(rhs.stream.into_iter());
        if let Some((packet, token)) = rhs.path_response {
            self.path_challenge(packet, token);
        }
        self.rst_stream.extend_from_slice(&rhs.rst_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
    }
}

/// One or more packets' worth of state subject to retransmission
#[derive(Clone)]
struct SentPacket {
    time: u64,
    /// 0 iff ack-only
    bytes: u16,
    handshake: bool,
    acks: RangeSet,
    retransmits: Retransmits,
}

impl SentPacket {
    fn ack_only(&self) -> bool {
        self.bytes == 0
    }
}

/// Ensures all our ACKs fit in one minimum-MTU packet
const MAX_ACK_BLOCKS: usize = 64;
/// TLS bad_record_mac, sent when packet protection fails on a routed packet
const DECRYPT_ERROR_ALERT: u8 = 20;
const HANDSHAKE_FAILURE_ALERT: u8 = 40;

fn alert_byte(alert: ::rustls::internal::msgs::enums::AlertDescription) -> u8 {
    use rustls::internal::msgs::enums::AlertDescription::*;
    match alert {
        CloseNotify => 0,
        UnexpectedMessage => 10,
        BadRecordMac => 20,
        HandshakeFailure => 40,
        BadCertificate => 42,
        UnsupportedCertificate => 43,
        CertificateRevoked => 44,
        CertificateExpired => 45,
        CertificateUnknown => 46,
        IllegalParameter => 47,
        UnknownCA => 48,
        AccessDenied => 49,
        DecodeError => 50,
        DecryptError => 51,
        ProtocolVersion => 70,
        InsufficientSecurity => 71,
        InternalError => 80,
        NoApplicationProtocol => 120,
        _ => 80,
    }
}
