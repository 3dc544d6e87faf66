//! End-to-end connection tests over an in-memory pipe.
//!
//! The TLS engine is a scripted session: a fixed message exchange that
//! carries transport parameters and hands out deterministic traffic secrets,
//! leaving everything else (packet protection, framing, timers, close
//! handling) to the real code paths.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::BytesMut;
use hex_literal::hex;
use ring::hmac;
use slog::{o, Drain, Logger};

use quic_transport::connection::{CloseStatus, ConnectionHandle};
use quic_transport::crypto::{self, KeyChange, Keys, RetryTokenKey, SessionFactory, TlsSession};
use quic_transport::endpoint::{Config, Endpoint, Event, Io, ListenKeys};
use quic_transport::packet::{ConnectionId, Header, PacketNumber, PartialDecode};
use quic_transport::params::{ParamQuery, ParamValue};
use quic_transport::space::EncryptLevel;
use quic_transport::transport_parameters::TransportParameters;
use quic_transport::{frame, Side, TransportError};

const CLIENT_HS_SECRET: [u8; 32] = [0x11; 32];
const SERVER_HS_SECRET: [u8; 32] = [0x22; 32];
const CLIENT_APP_SECRET: [u8; 32] = [0x33; 32];
const SERVER_APP_SECRET: [u8; 32] = [0x44; 32];

const MSG_CLIENT_HELLO: u8 = 0x01;
const MSG_SERVER_HELLO: u8 = 0x02;
const MSG_SERVER_FINISHED: u8 = 0x03;
const MSG_CLIENT_FINISHED: u8 = 0x04;

fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

fn msg(ty: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(ty);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Scripted handshake standing in for the TLS engine.
struct TestSession {
    side: Side,
    local_tp: Vec<u8>,
    peer_tp: Option<Vec<u8>>,
    writes: Vec<(EncryptLevel, Vec<u8>)>,
    key_changes: Vec<KeyChange>,
    complete: bool,
    recv_bufs: [Vec<u8>; 4],
}

impl TestSession {
    fn push_keys(&mut self) {
        let (hs_local, hs_remote, app_local, app_remote) = match self.side {
            Side::Client => (
                CLIENT_HS_SECRET,
                SERVER_HS_SECRET,
                CLIENT_APP_SECRET,
                SERVER_APP_SECRET,
            ),
            Side::Server => (
                SERVER_HS_SECRET,
                CLIENT_HS_SECRET,
                SERVER_APP_SECRET,
                CLIENT_APP_SECRET,
            ),
        };
        self.key_changes.push(KeyChange {
            level: EncryptLevel::Handshake,
            local: hs_local,
            remote: hs_remote,
        });
        self.key_changes.push(KeyChange {
            level: EncryptLevel::OneRtt,
            local: app_local,
            remote: app_remote,
        });
    }

    fn on_message(&mut self, ty: u8, payload: &[u8]) {
        match (self.side, ty) {
            (Side::Server, MSG_CLIENT_HELLO) => {
                self.peer_tp = Some(payload.to_vec());
                let hello = msg(MSG_SERVER_HELLO, &self.local_tp.clone());
                self.writes.push((EncryptLevel::Initial, hello));
                self.push_keys();
                self.writes
                    .push((EncryptLevel::Handshake, msg(MSG_SERVER_FINISHED, &[])));
            }
            (Side::Client, MSG_SERVER_HELLO) => {
                self.peer_tp = Some(payload.to_vec());
                self.push_keys();
                self.writes
                    .push((EncryptLevel::Handshake, msg(MSG_CLIENT_FINISHED, &[])));
                self.complete = true;
            }
            (Side::Client, MSG_SERVER_FINISHED) => {}
            (Side::Server, MSG_CLIENT_FINISHED) => {
                self.complete = true;
            }
            _ => panic!("unexpected handshake message {:#x}", ty),
        }
    }
}

impl TlsSession for TestSession {
    fn read_handshake(&mut self, level: EncryptLevel, data: &[u8]) -> Result<(), TransportError> {
        self.recv_bufs[level as usize].extend_from_slice(data);
        loop {
            let buf = &self.recv_bufs[level as usize];
            if buf.len() < 3 {
                return Ok(());
            }
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            if buf.len() < 3 + len {
                return Ok(());
            }
            let ty = buf[0];
            let payload = buf[3..3 + len].to_vec();
            self.recv_bufs[level as usize].drain(..3 + len);
            self.on_message(ty, &payload);
        }
    }

    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<EncryptLevel> {
        if self.writes.is_empty() {
            return None;
        }
        let (level, data) = self.writes.remove(0);
        buf.extend_from_slice(&data);
        Some(level)
    }

    fn next_keys(&mut self) -> Option<KeyChange> {
        if self.key_changes.is_empty() {
            None
        } else {
            Some(self.key_changes.remove(0))
        }
    }

    fn is_handshaking(&self) -> bool {
        !self.complete
    }

    fn peer_transport_parameters(&self) -> Option<&[u8]> {
        self.peer_tp.as_deref()
    }
}

struct TestTls;

impl SessionFactory for TestTls {
    fn start_session(
        &self,
        side: Side,
        _server_name: Option<&str>,
        local_params: &TransportParameters,
    ) -> Box<dyn TlsSession> {
        let mut tp = Vec::new();
        local_params.write(side, &mut tp);
        let mut session = TestSession {
            side,
            local_tp: tp,
            peer_tp: None,
            writes: Vec::new(),
            key_changes: Vec::new(),
            complete: false,
            recv_bufs: Default::default(),
        };
        if side == Side::Client {
            let hello = msg(MSG_CLIENT_HELLO, &session.local_tp.clone());
            session.writes.push((EncryptLevel::Initial, hello));
        }
        Box::new(session)
    }
}

fn client_addr() -> SocketAddrV6 {
    SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0)
}

fn server_addr() -> SocketAddrV6 {
    SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4444, 0, 0)
}

fn server_listen_keys() -> ListenKeys {
    ListenKeys {
        reset: hmac::Key::new(hmac::HMAC_SHA256, &[7; 64]),
        token: RetryTokenKey::new(&[8; 32]),
    }
}

struct Pair {
    client: Endpoint,
    server: Endpoint,
    time: u64,
    client_wake: HashMap<usize, Option<u64>>,
    server_wake: HashMap<usize, Option<u64>>,
    /// Every datagram the client actually delivered to the server.
    client_log: Vec<Box<[u8]>>,
    /// Drop client-to-server traffic; used after injecting crafted packets
    /// the server never sent.
    blackhole: bool,
}

impl Pair {
    fn new(mut client_config: Config, mut server_config: Config) -> Self {
        client_config.max_remote_bi_streams = 4;
        client_config.max_remote_uni_streams = 4;
        server_config.max_remote_bi_streams = 4;
        server_config.max_remote_uni_streams = 4;
        let log = logger();
        Pair {
            client: Endpoint::new(log.new(o!("side" => "client")), client_config, None),
            server: Endpoint::new(
                log.new(o!("side" => "server")),
                server_config,
                Some(server_listen_keys()),
            ),
            time: 1_000_000,
            client_wake: HashMap::new(),
            server_wake: HashMap::new(),
            client_log: Vec::new(),
            blackhole: false,
        }
    }

    fn default() -> Self {
        Pair::new(
            Config::new(Arc::new(TestTls)),
            Config::new(Arc::new(TestTls)),
        )
    }

    fn connect(&mut self) -> ConnectionHandle {
        let handle = self.client.connect(self.time, server_addr(), "example.com");
        self.drive();
        handle
    }

    fn drive(&mut self) {
        loop {
            let mut progress = false;
            while let Some(io) = self.client.poll_io(self.time) {
                progress = true;
                match io {
                    Io::Transmit {
                        destination,
                        packet,
                    } => {
                        if destination == server_addr() && !self.blackhole {
                            self.client_log.push(packet.clone());
                            self.server
                                .handle(self.time, client_addr(), BytesMut::from(&packet[..]));
                        }
                    }
                    Io::TimerUpdate { connection, time } => {
                        self.client_wake.insert(connection.0, time);
                    }
                }
            }
            while let Some(io) = self.server.poll_io(self.time) {
                progress = true;
                match io {
                    Io::Transmit {
                        destination,
                        packet,
                    } => {
                        if destination == client_addr() {
                            self.client
                                .handle(self.time, server_addr(), BytesMut::from(&packet[..]));
                        }
                    }
                    Io::TimerUpdate { connection, time } => {
                        self.server_wake.insert(connection.0, time);
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn advance(&mut self, delta_us: u64) {
        self.time += delta_us;
        let due: Vec<usize> = self
            .client_wake
            .iter()
            .filter(|&(_, &t)| t.map_or(false, |t| t <= self.time))
            .map(|(&h, _)| h)
            .collect();
        for handle in due {
            self.client_wake.insert(handle, None);
            self.client.timeout(self.time, ConnectionHandle(handle));
        }
        let due: Vec<usize> = self
            .server_wake
            .iter()
            .filter(|&(_, &t)| t.map_or(false, |t| t <= self.time))
            .map(|(&h, _)| h)
            .collect();
        for handle in due {
            self.server_wake.insert(handle, None);
            self.server.timeout(self.time, ConnectionHandle(handle));
        }
        self.drive();
    }

    fn client_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some((_, event)) = self.client.poll() {
            events.push(event);
        }
        events
    }

    fn server_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some((_, event)) = self.server.poll() {
            events.push(event);
        }
        events
    }
}

/// Seal a fake server-to-client 1-RTT packet with the scripted secrets.
fn seal_1rtt(dst_cid: ConnectionId, pn: u64, frames: &[u8]) -> Vec<u8> {
    let keys = Keys::from_secrets(SERVER_APP_SECRET, CLIENT_APP_SECRET);
    let header = Header::Short {
        dst_cid,
        number: PacketNumber::U16(pn as u16),
        spin: false,
        key_phase: false,
    };
    let mut buf = Vec::new();
    let partial = header.encode(&mut buf);
    let header_len = buf.len();
    buf.extend_from_slice(frames);
    while buf.len() < header_len + 4 {
        buf.push(0);
    }
    keys.local.encrypt(pn, &mut buf, header_len);
    partial.finish(&mut buf, &keys.local);
    buf
}

#[test]
fn handshake_completes() {
    let mut pair = Pair::default();
    let client_handle = pair.connect();

    let client_events = pair.client_events();
    assert!(client_events
        .iter()
        .any(|e| matches!(e, Event::Connected)));
    let server_events = pair.server_events();
    assert!(server_events
        .iter()
        .any(|e| matches!(e, Event::Connected)));

    let server_handle = pair.server.accept().expect("connection not accepted");
    assert_eq!(pair.server.get_side(server_handle), Side::Server);

    let stats = pair.server.get_stats(server_handle);
    assert!(stats.recv.valid_packets > 0);
    assert!(stats.recv.total_bytes >= 1200);

    match pair.client.param_get(client_handle, ParamQuery::QuicVersion) {
        Ok(ParamValue::QuicVersion(v)) => assert_eq!(v, 0x0000_0001),
        x => panic!("unexpected param result: {:?}", x),
    }
}

#[test]
fn duplicate_initial_packet_is_dropped() {
    let mut pair = Pair::default();
    pair.client.connect(pair.time, server_addr(), "example.com");

    // Capture the first Initial without handing it on.
    let mut initial = None;
    while let Some(io) = pair.client.poll_io(pair.time) {
        if let Io::Transmit { packet, .. } = io {
            initial = Some(packet);
            break;
        }
    }
    let initial = initial.expect("client sent no initial");

    pair.server
        .handle(pair.time, client_addr(), BytesMut::from(&initial[..]));
    pair.server
        .handle(pair.time, client_addr(), BytesMut::from(&initial[..]));
    // Let the server's drain run; its responses are irrelevant here.
    while pair.server.poll_io(pair.time).is_some() {}

    let server_handle = ConnectionHandle(0);
    let stats = pair.server.get_stats(server_handle);
    assert_eq!(stats.recv.duplicate_packets, 1);
    assert!(stats.recv.valid_packets >= 1);
}

#[test]
fn idle_timeout_closes_silently() {
    let mut client_config = Config::new(Arc::new(TestTls));
    client_config.idle_timeout_ms = 100;
    let mut pair = Pair::new(client_config, Config::new(Arc::new(TestTls)));
    pair.connect();
    pair.client_events();

    // No traffic at all; the idle timer (floored at the close PTO) fires.
    let mut events = Vec::new();
    for _ in 0..20 {
        pair.advance(500_000);
        events.extend(pair.client_events());
        if events
            .iter()
            .any(|e| matches!(e, Event::ShutdownComplete { .. }))
        {
            break;
        }
    }
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ShutdownInitiatedByTransport {
            status: CloseStatus::ConnectionIdle
        }
    )));
    assert_matches!(
        events.last(),
        Some(Event::ShutdownComplete {
            peer_acknowledged_shutdown: false
        })
    );
}

#[test]
fn new_connection_id_capacity() {
    let mut pair = Pair::default();
    let client_handle = pair.connect();
    pair.client_events();
    pair.blackhole = true;

    let client_cid = pair.client.connection(client_handle).source_cids()[0];
    let mut frames = Vec::new();
    for sequence in 1..=6u64 {
        frame::NewConnectionId {
            sequence,
            retire_prior_to: 0,
            id: ConnectionId::new(&[sequence as u8; 8]),
            reset_token: [sequence as u8; 16],
        }
        .encode(&mut frames);
    }
    let packet = seal_1rtt(client_cid, 100, &frames);
    pair.client
        .handle(pair.time, server_addr(), BytesMut::from(&packet[..]));
    pair.drive();

    // Exactly the CID limit is stored; the overflow is ignored, without a
    // transport error.
    assert_eq!(pair.client.connection(client_handle).dest_cid_count(), 4);
    let events = pair.client_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::ShutdownInitiatedByTransport { .. })));
    assert!(!pair.client.connection(client_handle).is_closed());
}

#[test]
fn peer_initiated_close_drains() {
    let mut pair = Pair::default();
    let client_handle = pair.connect();
    pair.client_events();
    pair.blackhole = true;

    let client_cid = pair.client.connection(client_handle).source_cids()[0];
    let mut frames = Vec::new();
    frame::ApplicationClose {
        error_code: 0x5,
        reason: bytes::Bytes::from_static(b"bye"),
    }
    .encode(&mut frames, 128);
    let packet = seal_1rtt(client_cid, 100, &frames);
    pair.client
        .handle(pair.time, server_addr(), BytesMut::from(&packet[..]));
    pair.drive();

    let events = pair.client_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ShutdownInitiatedByPeer { error_code: 0x5 })));
    match pair
        .client
        .param_get(client_handle, ParamQuery::CloseReasonPhrase)
    {
        Ok(ParamValue::ReasonPhrase(reason)) => assert_eq!(reason, "bye"),
        x => panic!("unexpected reason phrase: {:?}", x),
    }

    // The draining period runs max(15ms, 2 RTT), then shutdown completes.
    let mut events = Vec::new();
    for _ in 0..10 {
        pair.advance(100_000);
        events.extend(pair.client_events());
        if !events.is_empty() {
            break;
        }
    }
    assert_matches!(
        events.last(),
        Some(Event::ShutdownComplete {
            peer_acknowledged_shutdown: false
        })
    );
}

#[test]
fn stateless_reset_aborts_silently() {
    let mut pair = Pair::default();
    let client_handle = pair.connect();
    pair.client_events();
    pair.blackhole = true;

    // The server derived its advertised reset token from the client's
    // original DCID, which the first logged Initial still carries.
    let (decode, _) = PartialDecode::new(BytesMut::from(&pair.client_log[0][..]), 8).unwrap();
    let keys = server_listen_keys();
    let token = crypto::reset_token_for(&keys.reset, &decode.dst_cid);

    let client_cid = pair.client.connection(client_handle).source_cids()[0];
    let mut datagram = vec![0x40];
    datagram.extend_from_slice(&client_cid);
    datagram.extend_from_slice(&hex!(
        "deadbeef deadbeef deadbeef deadbeef deadbeef dead be"
    ));
    datagram.extend_from_slice(&token);
    pair.client
        .handle(pair.time, server_addr(), BytesMut::from(&datagram[..]));
    pair.drive();

    let events = pair.client_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ShutdownInitiatedByTransport {
            status: CloseStatus::Aborted
        }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ShutdownComplete { .. })));
    assert!(pair.client.connection(client_handle).is_drained());
}

#[test]
fn retry_restarts_with_new_cid_and_token() {
    let mut pair = Pair::default();
    let client_handle = pair
        .client
        .connect(pair.time, server_addr(), "example.com");

    // Capture the first Initial instead of delivering it.
    let mut first_initial = None;
    while let Some(io) = pair.client.poll_io(pair.time) {
        match io {
            Io::Transmit { packet, .. } => {
                first_initial = Some(packet);
                break;
            }
            Io::TimerUpdate { connection, time } => {
                pair.client_wake.insert(connection.0, time);
            }
        }
    }
    let first_initial = first_initial.expect("client sent no initial");
    let (decode, _) = PartialDecode::new(BytesMut::from(&first_initial[..]), 8).unwrap();
    let original_dcid = decode.dst_cid;
    let client_scid = decode.src_cid;

    // Server-chosen CID and token arrive in a Retry.
    let new_server_cid = ConnectionId::new(&[0xd1; 8]);
    let mut retry = Vec::new();
    Header::Retry {
        dst_cid: client_scid,
        src_cid: new_server_cid,
        odcid: original_dcid,
        token: bytes::Bytes::from_static(b"retry-token"),
    }
    .encode(&mut retry);
    let tag = crypto::retry_tag(&original_dcid, &retry);
    retry.extend_from_slice(&tag);
    pair.client
        .handle(pair.time, server_addr(), BytesMut::from(&retry[..]));

    // The client must retransmit its Initial against the new CID, carrying
    // the token.
    let mut second_initial = None;
    while let Some(io) = pair.client.poll_io(pair.time) {
        match io {
            Io::Transmit { packet, .. } => {
                second_initial = Some(packet);
                break;
            }
            Io::TimerUpdate { connection, time } => {
                pair.client_wake.insert(connection.0, time);
            }
        }
    }
    let second_initial = second_initial.expect("client did not retransmit");
    let (decode, _) = PartialDecode::new(BytesMut::from(&second_initial[..]), 8).unwrap();
    assert_eq!(decode.dst_cid, new_server_cid);
    assert_eq!(&decode.token[..], b"retry-token");

    let stats = pair.client.get_stats(client_handle);
    assert!(stats.stateless_retry);
}

#[test]
fn keep_alive_pings() {
    let mut client_config = Config::new(Arc::new(TestTls));
    client_config.keep_alive_ms = 50;
    let mut pair = Pair::new(client_config, Config::new(Arc::new(TestTls)));
    pair.connect();
    pair.client_events();

    let before = pair.client_log.len();
    for _ in 0..4 {
        pair.advance(60_000);
    }
    // Keep-alive keeps the link warm and re-arms itself.
    assert!(pair.client_log.len() > before);
    let events = pair.client_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::ShutdownComplete { .. })));
}

#[test]
fn forced_key_update_survives() {
    let mut pair = Pair::default();
    let client_handle = pair.connect();
    pair.client_events();
    pair.server_events();

    pair.client
        .param_set(
            pair.time,
            client_handle,
            quic_transport::params::Param::ForceKeyUpdate,
        )
        .expect("key update refused");
    pair.drive();
    pair.advance(50_000);

    // Both sides keep talking across the phase change.
    assert!(!pair.client.connection(client_handle).is_closed());
    assert!(!pair.server.connection(ConnectionHandle(0)).is_closed());
    let events = pair.client_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::ShutdownInitiatedByTransport { .. })));
}
