extern crate bytes;
#[macro_use]
extern crate slog;
extern crate quic_session;
extern crate slog_term;

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV6;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use slog::{Drain, Logger};

use quic_session::crypto::{Certificate, ClientConfig, PrivateKey, ServerConfig};
use quic_session::packet::PartialDecode;
use quic_session::session::{
    ClientParams, Context, Event, Io, PreferredAddressPolicy, Session, SessionHandle, Timer,
};
use quic_session::{Config, ConnectionId, SessionError};

const CLIENT: usize = 0;
const SERVER: usize = 1;

fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

fn server_tls_config() -> Arc<ServerConfig> {
    let mut config = ServerConfig::new(quic_session::crypto::NoClientAuth::new());
    let cert = Certificate(include_bytes!("certs/cert.der").to_vec());
    let ca = Certificate(include_bytes!("certs/ca.der").to_vec());
    let key = PrivateKey(include_bytes!("certs/key.der").to_vec());
    config.set_single_cert(vec![cert, ca], key);
    config.alpn_protocols = vec!["h3".to_owned()];
    Arc::new(config)
}

fn client_tls_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::new();
    let ca = Certificate(include_bytes!("certs/ca.der").to_vec());
    config.root_store.add(&ca).unwrap();
    config.alpn_protocols = vec!["h3".to_owned()];
    Arc::new(config)
}

fn client_addr() -> SocketAddrV6 {
    "[::2]:7890".parse().unwrap()
}

fn server_addr() -> SocketAddrV6 {
    "[::1]:4433".parse().unwrap()
}

/// Two sessions wired back to back over the queue surface, with the
/// dispatcher's routing, timer, and send-completion duties simulated
struct Pair {
    log: Logger,
    ctx: Context,
    client: Session,
    server: Option<Session>,
    time: u64,
    inboxes: [VecDeque<BytesMut>; 2],
    events: [Vec<Event>; 2],
    timers: HashMap<(usize, Timer), u64>,
    associations: HashMap<(usize, ConnectionId), i64>,
    removed: [bool; 2],
}

impl Pair {
    fn new(mut config: Config) -> Self {
        config.tls_server_config = server_tls_config();
        let log = logger();
        let mut ctx = Context::new(Arc::new(config));
        let client = Session::new_client(
            log.new(o!("side" => "client")),
            &mut ctx,
            SessionHandle(CLIENT),
            server_addr(),
            ClientParams {
                tls_config: client_tls_config(),
                server_name: "localhost".into(),
                preferred_address_policy: PreferredAddressPolicy::Ignore,
                request_ocsp: false,
            },
            1_000_000,
        ).unwrap();
        let mut pair = Pair {
            log,
            ctx,
            client,
            server: None,
            time: 1_000_000,
            inboxes: [VecDeque::new(), VecDeque::new()],
            events: [Vec::new(), Vec::new()],
            timers: HashMap::new(),
            associations: HashMap::new(),
            removed: [false, false],
        };
        pair.drain(CLIENT);
        pair
    }

    fn start(&mut self) {
        let time = self.time;
        self.client.connect(&mut self.ctx, time);
        self.drain(CLIENT);
    }

    /// Run a closure against the client with the context, then route its
    /// output
    fn with_client<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Session, &mut Context, u64) -> R,
    {
        let time = self.time;
        let result = f(&mut self.client, &mut self.ctx, time);
        self.drain(CLIENT);
        result
    }

    fn with_server<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Session, &mut Context, u64) -> R,
    {
        let time = self.time;
        let result = f(self.server.as_mut().unwrap(), &mut self.ctx, time);
        self.drain(SERVER);
        result
    }

    fn server(&self) -> &Session {
        self.server.as_ref().unwrap()
    }

    /// Route queued commands; `owner` attributes Transmits, which carry no
    /// session tag, to the session that just ran
    fn drain(&mut self, owner: usize) {
        let mut transmits = 0;
        while let Some(io) = self.ctx.io.pop_front() {
            match io {
                Io::Transmit {
                    destination,
                    datagram,
                } => {
                    let mut data = BytesMut::new();
                    for chunk in &datagram {
                        data.extend_from_slice(chunk);
                    }
                    let target = if destination == server_addr() {
                        SERVER
                    } else {
                        CLIENT
                    };
                    self.inboxes[target].push_back(data);
                    transmits += 1;
                }
                Io::TimerStart {
                    session,
                    timer,
                    time,
                } => {
                    self.timers.insert((session.0, timer), time);
                }
                Io::TimerStop { session, timer } => {
                    self.timers.remove(&(session.0, timer));
                }
                Io::AssociateCid { session, cid } => {
                    *self.associations.entry((session.0, cid)).or_insert(0) += 1;
                }
                Io::DisassociateCid { session, cid } => {
                    *self.associations.entry((session.0, cid)).or_insert(0) -= 1;
                }
                Io::RemoveSession { session } => {
                    self.removed[session.0] = true;
                }
            }
        }
        while let Some((handle, event)) = self.ctx.events.pop_front() {
            self.events[handle.0].push(event);
        }
        // report write completions for the datagrams just handed over
        for _ in 0..transmits {
            let time = self.time;
            match owner {
                CLIENT => self.client.on_send_done(&mut self.ctx, time, 0),
                _ => {
                    if let Some(ref mut server) = self.server {
                        server.on_send_done(&mut self.ctx, time, 0);
                    }
                }
            }
        }
    }

    /// Deliver one datagram to `target`, creating the server session on the
    /// first client Initial the way the dispatcher would
    fn deliver_one(&mut self, target: usize) -> bool {
        let data = match self.inboxes[target].pop_front() {
            Some(x) => x,
            None => return false,
        };
        let local_cid_len = self.ctx.config.local_cid_len;
        let mut segment = Some(data);
        while let Some(data) = segment.take() {
            let partial = match PartialDecode::new(data, local_cid_len) {
                Ok(x) => x,
                Err(_) => break,
            };
            let time = self.time;
            let remote = if target == SERVER {
                client_addr()
            } else {
                server_addr()
            };
            if target == SERVER && self.server.is_none() {
                assert!(
                    partial.is_initial(),
                    "first client datagram must be an initial"
                );
                let rcid = partial.src_cid().unwrap();
                let dcid = partial.dst_cid();
                let server = Session::new_server(
                    self.log.new(o!("side" => "server")),
                    &mut self.ctx,
                    SessionHandle(SERVER),
                    remote,
                    rcid,
                    dcid,
                    time,
                );
                self.server = Some(server);
                self.drain(SERVER);
            }
            segment = match target {
                CLIENT => self.client.receive(&mut self.ctx, time, remote, partial),
                _ => {
                    let server = self.server.as_mut().unwrap();
                    server.receive(&mut self.ctx, time, remote, partial)
                }
            };
            self.drain(target);
        }
        true
    }

    /// Shuttle datagrams both ways until the network is quiet
    fn pump(&mut self) {
        for _ in 0..64 {
            let mut progress = false;
            self.time += 1000;
            while self.deliver_one(SERVER) {
                progress = true;
            }
            while self.deliver_one(CLIENT) {
                progress = true;
            }
            if !progress {
                break;
            }
        }
    }

    fn fire_timer(&mut self, session: usize, timer: Timer) {
        let due = match self.timers.remove(&(session, timer)) {
            Some(x) => x,
            None => panic!("timer {:?} not armed for session {}", timer, session),
        };
        self.time = self.time.max(due) + 1;
        let time = self.time;
        match session {
            CLIENT => self.client.timeout(&mut self.ctx, time, timer),
            _ => {
                let server = self.server.as_mut().unwrap();
                server.timeout(&mut self.ctx, time, timer);
            }
        }
        self.drain(session);
    }

    fn handshake(&mut self) {
        self.start();
        self.pump();
        assert!(self.client.is_handshake_completed(), "client never completed");
        assert!(
            self.server().is_handshake_completed(),
            "server never completed"
        );
    }

    fn saw<F: Fn(&Event) -> bool>(&self, session: usize, f: F) -> bool {
        self.events[session].iter().any(|e| f(e))
    }

    fn assert_cids_released(&self, session: usize) {
        for (&(owner, cid), &balance) in self.associations.iter() {
            if owner == session {
                assert_eq!(balance, 0, "cid {} left associated", cid);
            }
        }
    }
}

#[test]
fn handshake_completes() {
    let mut pair = Pair::new(Config::default());
    pair.handshake();

    assert!(pair.saw(CLIENT, |e| match *e {
        Event::HandshakeCompleted { ref alpn } => {
            alpn.as_ref().map(|x| x.as_str()) == Some("h3")
        }
        _ => false,
    }));
    assert!(pair.saw(SERVER, |e| match *e {
        Event::HandshakeCompleted { .. } => true,
        _ => false,
    }));

    for stats in &[pair.client.stats().clone(), pair.server().stats().clone()] {
        assert!(stats.created_at <= stats.handshake_start_at);
        assert!(stats.handshake_start_at <= stats.handshake_completed_at);
        assert!(stats.handshake_completed_at > 0);
        assert!(stats.bytes_sent > 0);
        assert!(stats.bytes_received > 0);
    }
}

#[test]
fn stream_data_flows_and_completions_fire() {
    let mut pair = Pair::new(Config::default());
    pair.handshake();

    let id = pair
        .with_client(|client, ctx, _| client.open_bidirectional_stream(ctx))
        .unwrap();
    let completed = Rc::new(Cell::new(None));
    {
        let completed = completed.clone();
        pair.with_client(|client, ctx, now| {
            client.write(
                ctx,
                now,
                id,
                &[Bytes::from_static(b"hello "), Bytes::from_static(b"world")],
                move |status| completed.set(Some(status)),
            )
        }).unwrap();
    }
    pair.with_client(|client, ctx, now| client.finish(ctx, now, id));
    pair.pump();

    assert!(pair.saw(SERVER, |e| match *e {
        Event::StreamOpened { id: got } => got == id,
        _ => false,
    }));
    assert!(pair.saw(SERVER, |e| match *e {
        Event::StreamReadable { id: got, fresh } => got == id && fresh,
        _ => false,
    }));

    let mut buf = [0; 64];
    let n = pair
        .with_server(|server, _, _| server.read(id, &mut buf))
        .unwrap();
    assert_eq!(&buf[..n], b"hello world");

    // the write group completes once the peer acknowledged every byte
    assert_eq!(completed.get(), Some(0));
    assert!(pair.saw(CLIENT, |e| match *e {
        Event::StreamFinished { id: got } => got == id,
        _ => false,
    }));

    // counters only ever grow
    let before = pair.client.stats().bytes_sent;
    pair.with_client(|client, ctx, now| client.ping(ctx, now));
    pair.pump();
    assert!(pair.client.stats().bytes_sent > before);
}

#[test]
fn closing_period_replays_close_once_per_datagram() {
    let mut pair = Pair::new(Config::default());
    pair.handshake();

    pair.with_client(|client, ctx, now| {
        client.close(ctx, now, 7, Bytes::from_static(b"done"))
    });
    assert!(pair.client.is_closing());
    // the close itself went out once
    assert_eq!(pair.inboxes[SERVER].len(), 1);

    // every ingress datagram during the closing period elicits exactly one
    // replay of the retained close packet
    for expected in 1..4usize {
        pair.with_server(|server, ctx, now| server.ping(ctx, now));
        while pair.deliver_one(CLIENT) {}
        assert_eq!(pair.inboxes[SERVER].len(), expected + 1);
    }

    // the server drains on the close and goes silent
    while pair.deliver_one(SERVER) {}
    let quiet = pair.inboxes[CLIENT].len();
    pair.with_server(|server, ctx, now| server.ping(ctx, now));
    assert_eq!(pair.inboxes[CLIENT].len(), quiet);

    // close timer expiry releases the session and its routing entries
    pair.fire_timer(CLIENT, Timer::Close);
    assert!(pair.removed[CLIENT]);
    assert!(pair.saw(CLIENT, |e| match *e {
        Event::ConnectionDrained => true,
        _ => false,
    }));
    pair.assert_cids_released(CLIENT);
}

#[test]
fn destroy_disassociates_every_cid() {
    let mut pair = Pair::new(Config::default());
    pair.handshake();
    assert!(pair.client.connection_id_count() > 0);

    pair.with_client(|client, ctx, _| client.destroy(ctx));
    assert!(pair.client.is_destroyed());
    assert!(pair.removed[CLIENT]);
    assert_eq!(pair.client.connection_id_count(), 0);
    pair.assert_cids_released(CLIENT);
}

#[test]
fn client_hello_callout_suspends_handshake() {
    let mut pair = Pair::new(Config::default());
    pair.start();

    // create the server by hand so the flag is set before its first receive
    let data = pair.inboxes[SERVER].pop_front().unwrap();
    let local_cid_len = pair.ctx.config.local_cid_len;
    let partial = PartialDecode::new(data, local_cid_len).unwrap();
    let rcid = partial.src_cid().unwrap();
    let dcid = partial.dst_cid();
    let time = pair.time;
    let mut server = Session::new_server(
        pair.log.new(o!("side" => "server")),
        &mut pair.ctx,
        SessionHandle(SERVER),
        client_addr(),
        rcid,
        dcid,
        time,
    );
    server.set_client_hello_enabled(true);
    server.receive(&mut pair.ctx, time, client_addr(), partial);
    pair.server = Some(server);
    pair.drain(SERVER);

    assert!(pair.saw(SERVER, |e| match *e {
        Event::ClientHello { ref alpn } => alpn.as_str() == "h3",
        _ => false,
    }));
    assert!(!pair.server().is_handshake_completed());

    // the handshake stays suspended however long the callout takes
    pair.pump();
    assert!(!pair.server().is_handshake_completed());

    pair.with_server(|server, ctx, now| server.on_client_hello_done(ctx, now));
    pair.pump();
    assert!(pair.server().is_handshake_completed());
    assert!(pair.client.is_handshake_completed());
}

#[test]
fn handshake_completes_without_callout_when_flag_clear() {
    let mut pair = Pair::new(Config::default());
    pair.handshake();
    assert!(!pair.saw(SERVER, |e| match *e {
        Event::ClientHello { .. } => true,
        _ => false,
    }));
}

#[test]
fn cert_callout_suspends_and_carries_ocsp() {
    let mut pair = Pair::new(Config::default());
    pair.start();

    let data = pair.inboxes[SERVER].pop_front().unwrap();
    let local_cid_len = pair.ctx.config.local_cid_len;
    let partial = PartialDecode::new(data, local_cid_len).unwrap();
    let rcid = partial.src_cid().unwrap();
    let dcid = partial.dst_cid();
    let time = pair.time;
    let mut server = Session::new_server(
        pair.log.new(o!("side" => "server")),
        &mut pair.ctx,
        SessionHandle(SERVER),
        client_addr(),
        rcid,
        dcid,
        time,
    );
    server.set_cert_enabled(true);
    server.receive(&mut pair.ctx, time, client_addr(), partial);
    pair.server = Some(server);
    pair.drain(SERVER);

    assert!(pair.saw(SERVER, |e| match *e {
        Event::Cert { .. } => true,
        _ => false,
    }));
    assert!(!pair.server().is_handshake_completed());

    pair.with_server(|server, ctx, now| {
        server.on_cert_done(ctx, now, Some(Bytes::from_static(b"ocsp response")))
    });
    pair.pump();
    assert!(pair.server().is_handshake_completed());
    assert_eq!(
        pair.server().ocsp_response().map(|x| &x[..]),
        Some(&b"ocsp response"[..])
    );
}

#[test]
fn idle_timeout_tears_down_client() {
    let mut pair = Pair::new(Config::default());
    pair.handshake();

    pair.fire_timer(CLIENT, Timer::Idle);
    assert!(pair.saw(CLIENT, |e| match *e {
        Event::ConnectionLost {
            reason: SessionError::TimedOut,
        } => true,
        _ => false,
    }));
    assert!(pair.client.is_destroyed());
}

#[test]
fn key_update_rolls_generations() {
    let mut pair = Pair::new(Config::default());
    pair.handshake();

    pair.with_client(|client, ctx, now| client.initiate_key_update(ctx, now));
    pair.pump();
    assert_eq!(pair.client.stats().keyupdate_count, 1);
    assert_eq!(pair.server().stats().keyupdate_count, 1);

    // traffic still flows under the new generation
    let before = pair.server().stats().bytes_received;
    pair.with_client(|client, ctx, now| client.ping(ctx, now));
    pair.pump();
    assert!(pair.server().stats().bytes_received > before);
}

#[test]
fn resumption_inputs_are_validated() {
    use quic_session::params::TransportParameters;
    use quic_session::Side;

    let mut pair = Pair::new(Config::default());

    match pair.client.set_session(b"\x00\xffgarbage") {
        Err(SessionError::InvalidTlsSessionTicket) => {}
        other => panic!("expected ticket rejection, got {:?}", other),
    }
    match pair.client.set_early_transport_params(b"\xff\xff\xff") {
        Err(SessionError::InvalidRemoteTransportParams) => {}
        other => panic!("expected parameter rejection, got {:?}", other),
    }

    let mut ticket = vec![0u8, 4];
    ticket.extend_from_slice(b"tick");
    pair.client.set_session(&ticket).unwrap();
    let mut blob = Vec::new();
    TransportParameters::default().write(Side::Server, &mut blob);
    pair.client.set_early_transport_params(&blob).unwrap();
}

#[test]
fn retry_validates_address_before_committing() {
    let mut config = Config::default();
    config.validate_address = true;
    let mut pair = Pair::new(config);
    // the handshake completes only after the token round trip
    pair.handshake();
    assert!(pair.client.stats().handshake_completed_at > 0);
}
