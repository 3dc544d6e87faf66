//! The endpoint: routes datagrams to connections by CID, accepts incoming
//! handshakes, and surfaces I/O operations and events to the backend.
//!
//! This object performs no I/O itself. The backend feeds it datagrams and
//! timer expirations via `handle` and `timeout`, and executes the operations
//! it produces via `poll_io`.

use std::cmp;
use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::Arc;

use bytes::BytesMut;
use fnv::{FnvHashMap, FnvHashSet};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use ring::hmac;
use slab::Slab;
use slog::{debug, o, trace, Logger};

use crate::connection::{CloseStatus, Connection, ConnectionHandle};
use crate::crypto::{self, RetryTokenKey, SessionFactory};
use crate::packet::{ConnectionId, Header, PacketNumber};
use crate::params::{ConnStats, Param, ParamError, ParamQuery, ParamValue};
use crate::stream::{ReadError, WriteError};
use crate::{Datagram, Directionality, Side, StreamId, LOC_CID_SIZE, MAX_CID_SIZE, MIN_CID_SIZE,
            MIN_INITIAL_SIZE, RESET_TOKEN_SIZE, VERSION};

/// Parameters governing the core QUIC state machine.
pub struct Config {
    /// Factory for TLS sessions backing new connections.
    pub tls: Arc<dyn SessionFactory>,
    /// Maximum number of peer-initiated bidirectional streams that may exist
    /// at one time.
    pub max_remote_bi_streams: u16,
    /// Maximum number of peer-initiated unidirectional streams that may
    /// exist at one time.
    pub max_remote_uni_streams: u16,
    /// Maximum duration of inactivity before timing the connection out, in
    /// milliseconds. 0 for none. The effective value is the minimum of this
    /// and the peer's own idle timeout.
    pub idle_timeout_ms: u64,
    /// Keep-alive PING interval in milliseconds. 0 disables.
    pub keep_alive_ms: u64,
    /// Maximum number of bytes the peer may transmit on any one stream
    /// before becoming blocked.
    pub stream_receive_window: u32,
    /// Maximum number of bytes the peer may transmit across all streams of a
    /// connection before becoming blocked.
    pub receive_window: u32,
    /// Maximum number of incoming connections to buffer before refusing new
    /// handshakes.
    pub accept_buffer: u32,
    /// Operations processed per drain before the worker moves on to other
    /// connections.
    pub max_operations_per_drain: usize,
    /// Longest we will delay an acknowledgement, in milliseconds.
    pub max_ack_delay_ms: u64,
    /// Length of locally generated connection IDs. This must be either 0 or
    /// between 4 and 20 inclusive.
    pub local_cid_len: usize,
    /// RTT assumed before the first sample, µs.
    pub initial_rtt_us: u64,
    /// Sender maximum segment size used by congestion control.
    pub default_mss: u64,
    /// Path MTU assumed for packet sizing.
    pub path_mtu: u16,
}

impl Config {
    pub fn new(tls: Arc<dyn SessionFactory>) -> Self {
        const EXPECTED_RTT_MS: u32 = 100;
        const MAX_STREAM_BANDWIDTH: u32 = 12_500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls.
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT_MS;
        Config {
            tls,
            max_remote_bi_streams: 0,
            max_remote_uni_streams: 0,
            idle_timeout_ms: 10_000,
            keep_alive_ms: 0,
            stream_receive_window: STREAM_RWND,
            receive_window: 8 * STREAM_RWND,
            accept_buffer: 1024,
            max_operations_per_drain: 16,
            max_ack_delay_ms: 25,
            local_cid_len: LOC_CID_SIZE,
            initial_rtt_us: u64::from(EXPECTED_RTT_MS) * 1000,
            default_mss: 1460,
            path_mtu: 1452,
        }
    }
}

/// Keys that should be preserved between restarts for server endpoints.
///
/// Keeping these around allows better behavior by clients that communicated
/// with a previous instance of the same endpoint.
pub struct ListenKeys {
    /// Authenticates stateless resets for connections we no longer know.
    pub reset: hmac::Key,
    /// Seals and validates retry tokens.
    pub token: RetryTokenKey,
}

impl ListenKeys {
    /// Generate new keys. Be careful to use a cryptography-grade RNG.
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        let mut reset_seed = [0; 64];
        rng.fill_bytes(&mut reset_seed);
        let mut token_seed = [0; 32];
        rng.fill_bytes(&mut token_seed);
        ListenKeys {
            reset: hmac::Key::new(hmac::HMAC_SHA256, &reset_seed),
            token: RetryTokenKey::new(&token_seed),
        }
    }
}

/// Events of interest to the application.
#[derive(Debug)]
pub enum Event {
    /// The handshake completed and the connection is ready for data.
    Connected,
    /// The peer's application closed the connection.
    ShutdownInitiatedByPeer { error_code: u64 },
    /// The transport closed the connection.
    ShutdownInitiatedByTransport { status: CloseStatus },
    /// Terminal: emitted exactly once per connection, after either side
    /// closed.
    ShutdownComplete { peer_acknowledged_shutdown: bool },
    /// Reserved for path migration support.
    PeerAddressChanged { address: SocketAddrV6 },
    /// The peer wants to open more streams than we currently allow.
    PeerNeedsStreams { directionality: Directionality },
    /// At least one new stream of a certain directionality may be opened.
    StreamAvailable { directionality: Directionality },
    /// A stream has data or errors waiting to be read.
    StreamReadable { stream: StreamId, fresh: bool },
    /// A formerly write-blocked stream might now accept a write.
    StreamWritable { stream: StreamId },
}

/// I/O operations to be executed by the backend.
#[derive(Debug)]
pub enum Io {
    Transmit {
        destination: SocketAddrV6,
        packet: Box<[u8]>,
    },
    /// Re-arm (or clear) the single wake-up the timer wheel keeps per
    /// connection; `time` is the earliest pending expiration in absolute µs.
    TimerUpdate {
        connection: ConnectionHandle,
        time: Option<u64>,
    },
}

/// Shared state threaded through connection processing.
pub struct Context {
    pub rng: OsRng,
    pub config: Arc<Config>,
    pub io: VecDeque<Io>,
    pub events: VecDeque<(ConnectionHandle, Event)>,
    pub incoming: VecDeque<ConnectionHandle>,
    pub incoming_handshakes: usize,
    /// Client connections still inside their handshake, for binding
    /// accounting.
    pub handshake_connections: usize,
    pub dirty_conns: FnvHashSet<ConnectionHandle>,
    pub readable_conns: FnvHashSet<ConnectionHandle>,
    /// The binding's CID table: every live source CID routes here.
    pub connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
    pub connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    pub connection_remotes: FnvHashMap<SocketAddrV6, ConnectionHandle>,
    /// Derives stateless reset tokens for local CIDs.
    pub reset_key: hmac::Key,
    pub listen_keys: Option<ListenKeys>,
}

pub struct Endpoint {
    log: Logger,
    pub(crate) ctx: Context,
    pub(crate) connections: Slab<Connection>,
}

impl Endpoint {
    pub fn new(log: Logger, config: Config, listen: Option<ListenKeys>) -> Self {
        assert!(
            config.local_cid_len == 0
                || (config.local_cid_len >= MIN_CID_SIZE && config.local_cid_len <= MAX_CID_SIZE)
        );
        let mut rng = OsRng;
        let reset_key = match listen {
            Some(ref keys) => keys.reset.clone(),
            None => {
                let mut seed = [0; 64];
                rng.fill_bytes(&mut seed);
                hmac::Key::new(hmac::HMAC_SHA256, &seed)
            }
        };
        Endpoint {
            log,
            ctx: Context {
                rng,
                config: Arc::new(config),
                io: VecDeque::new(),
                events: VecDeque::new(),
                incoming: VecDeque::new(),
                incoming_handshakes: 0,
                handshake_connections: 0,
                dirty_conns: FnvHashSet::default(),
                readable_conns: FnvHashSet::default(),
                connection_ids: FnvHashMap::default(),
                connection_ids_initial: FnvHashMap::default(),
                connection_remotes: FnvHashMap::default(),
                reset_key,
                listen_keys: listen,
            },
            connections: Slab::new(),
        }
    }

    fn listen(&self) -> bool {
        self.ctx.listen_keys.is_some()
    }

    /// Get an application-facing event.
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        if let Some(x) = self.ctx.events.pop_front() {
            return Some(x);
        }
        loop {
            let &conn = self.ctx.readable_conns.iter().next()?;
            if let Some(event) = self.connections[conn.0].poll() {
                return Some((conn, event));
            }
            self.ctx.readable_conns.remove(&conn);
        }
    }

    /// Get a pending I/O operation, driving dirty connections as needed.
    /// This is the worker loop: each dirty connection gets one drain pass.
    pub fn poll_io(&mut self, now: u64) -> Option<Io> {
        loop {
            if let Some(x) = self.ctx.io.pop_front() {
                return Some(x);
            }
            let &conn = self.ctx.dirty_conns.iter().next()?;
            let has_more_work = self.connections[conn.0].drain(&mut self.ctx, now);
            if !has_more_work {
                self.ctx.dirty_conns.remove(&conn);
            }
            if self.connections[conn.0].is_handle_closed() {
                self.forget(conn);
            }
        }
    }

    /// Process an incoming UDP datagram.
    pub fn handle(&mut self, now: u64, remote: SocketAddrV6, data: BytesMut) {
        let datagram_len = data.len();
        let (dst_cid, is_long, is_initial, version) =
            match route_info(&data, self.ctx.config.local_cid_len) {
                Some(x) => x,
                None => {
                    trace!(self.log, "dropping runt datagram");
                    return;
                }
            };

        // Existing connection?
        let conn = {
            let by_cid = if self.ctx.config.local_cid_len > 0 {
                self.ctx.connection_ids.get(&dst_cid)
            } else {
                None
            };
            by_cid
                .or_else(|| self.ctx.connection_ids_initial.get(&dst_cid))
                .or_else(|| self.ctx.connection_remotes.get(&remote))
                .cloned()
        };
        if let Some(conn) = conn {
            let signal = self.connections[conn.0].queue_recv_datagrams(vec![Datagram {
                remote,
                data,
            }]);
            if signal {
                self.ctx.dirty_conns.insert(conn);
            }
            return;
        }

        // Potentially accept a new connection.
        if !self.listen() {
            debug!(self.log, "dropping packet for unrecognized connection";
                   "cid" => %dst_cid);
            return;
        }
        if is_long {
            if !is_initial {
                debug!(self.log, "ignoring non-initial packet for unknown connection";
                       "cid" => %dst_cid);
                return;
            }
            if version != VERSION {
                // Single-version build: nothing to negotiate.
                debug!(self.log, "ignoring initial with unsupported version";
                       "version" => version);
                return;
            }
            if datagram_len < MIN_INITIAL_SIZE {
                debug!(self.log, "ignoring undersized initial"; "len" => datagram_len);
                return;
            }
            self.handle_initial(now, remote, dst_cid, data);
            return;
        }

        // A short-header packet for a connection we no longer know: answer
        // with a stateless reset so the peer gives up.
        if !dst_cid.is_empty() {
            self.send_stateless_reset(remote, &dst_cid, datagram_len);
        } else {
            trace!(self.log, "dropping unrecognized short packet without CID");
        }
    }

    fn handle_initial(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        dst_cid: ConnectionId,
        data: BytesMut,
    ) {
        // The source CID is our future destination; dig it out of the long
        // header: 1 byte flags, 4 version, dcid, scid, token.
        let scid_offset = 6 + dst_cid.len();
        let src_cid = match data.get(scid_offset).map(|&len| len as usize) {
            Some(len)
                if len <= MAX_CID_SIZE && data.len() >= scid_offset + 1 + len =>
            {
                ConnectionId::new(&data[scid_offset + 1..scid_offset + 1 + len])
            }
            _ => {
                debug!(self.log, "malformed initial header");
                return;
            }
        };

        // Retry tokens are validated before the connection exists so the
        // original CID lands in its transport parameters.
        let mut validated_odcid = None;
        {
            let mut offset = scid_offset + 1 + src_cid.len();
            match read_var(&data, &mut offset) {
                Some(token_len) if data.len() as u64 >= offset as u64 + token_len => {
                    if token_len > 0 {
                        let token = &data[offset..offset + token_len as usize];
                        let keys = self.ctx.listen_keys.as_ref().unwrap();
                        match keys.token.decrypt(token) {
                            Ok(odcid) => validated_odcid = Some(odcid),
                            Err(()) => {
                                debug!(self.log, "dropping initial with invalid token");
                                return;
                            }
                        }
                    }
                }
                _ => {
                    debug!(self.log, "malformed initial token");
                    return;
                }
            }
        }

        if self.ctx.incoming.len() + self.ctx.incoming_handshakes
            >= self.ctx.config.accept_buffer as usize
        {
            debug!(self.log, "rejecting connection due to full accept buffer");
            return;
        }

        let local_cid = self.new_cid();
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        let log = self.log.new(o!("connection" => local_cid));
        // Crypto state initializes lazily on the connection's first drain.
        let mut conn = Connection::new(
            log,
            Side::Server,
            handle,
            dst_cid,
            local_cid,
            src_cid,
            remote,
            None,
            &self.ctx.config,
            now,
        );
        if let Some(odcid) = validated_odcid {
            conn.set_token_validated(odcid);
        }
        entry.insert(conn);
        self.ctx.incoming_handshakes += 1;
        self.ctx.connection_ids_initial.insert(dst_cid, handle);
        self.ctx.connection_ids.insert(dst_cid, handle);
        self.ctx.connection_ids.insert(local_cid, handle);
        self.ctx.connection_remotes.insert(remote, handle);

        let signal =
            self.connections[handle.0].queue_recv_datagrams(vec![Datagram { remote, data }]);
        if signal {
            self.ctx.dirty_conns.insert(handle);
        }
        // The lazy initialization itself needs a drain pass too.
        self.ctx.dirty_conns.insert(handle);
    }

    fn send_stateless_reset(
        &mut self,
        remote: SocketAddrV6,
        dst_cid: &ConnectionId,
        datagram_len: usize,
    ) {
        debug!(self.log, "sending stateless reset"; "cid" => %dst_cid);
        let mut buf = Vec::<u8>::new();
        // Bound padding size to mitigate amplification attacks.
        let padding = self.ctx.rng.gen_range(
            0..cmp::max(
                RESET_TOKEN_SIZE + 8,
                datagram_len.saturating_sub(1 + MAX_CID_SIZE),
            )
            .saturating_sub(RESET_TOKEN_SIZE)
            .max(1),
        );
        Header::Short {
            dst_cid: ConnectionId::random(&mut self.ctx.rng, MAX_CID_SIZE),
            number: PacketNumber::U8(self.ctx.rng.gen()),
            spin: false,
            key_phase: false,
        }
        .encode(&mut buf);
        let start = buf.len();
        buf.resize(start + padding, 0);
        self.ctx.rng.fill_bytes(&mut buf[start..start + padding]);
        buf.extend_from_slice(&crypto::reset_token_for(&self.ctx.reset_key, dst_cid));
        self.ctx.io.push_back(Io::Transmit {
            destination: remote,
            packet: buf.into(),
        });
    }

    /// Initiate a connection.
    pub fn connect(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        server_name: &str,
    ) -> ConnectionHandle {
        let local_cid = self.new_cid();
        let remote_cid = ConnectionId::random(&mut self.ctx.rng, LOC_CID_SIZE);
        trace!(self.log, "initial dcid"; "value" => %remote_cid);
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        let log = self.log.new(o!("connection" => local_cid));
        let conn = Connection::new(
            log,
            Side::Client,
            handle,
            remote_cid,
            local_cid,
            remote_cid,
            remote,
            Some(server_name.into()),
            &self.ctx.config,
            now,
        );
        entry.insert(conn);
        self.ctx.connection_ids.insert(local_cid, handle);
        self.ctx.connection_remotes.insert(remote, handle);
        self.connections[handle.0].start(&mut self.ctx, now);
        self.ctx.dirty_conns.insert(handle);
        handle
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.ctx.rng, self.ctx.config.local_cid_len);
            if !self.ctx.connection_ids.contains_key(&cid) {
                break cid;
            }
            assert!(self.ctx.config.local_cid_len > 0);
        }
    }

    fn forget(&mut self, conn: ConnectionHandle) {
        for cid in self.connections[conn.0].source_cids() {
            self.ctx.connection_ids.remove(&cid);
            self.ctx.connection_ids_initial.remove(&cid);
        }
        self.ctx
            .connection_remotes
            .remove(&self.connections[conn.0].remote);
        self.ctx.dirty_conns.remove(&conn);
        self.ctx.readable_conns.remove(&conn);
        self.connections.remove(conn.0);
    }

    /// Handle the timer wheel firing for a connection.
    pub fn timeout(&mut self, now: u64, conn: ConnectionHandle) {
        self.connections[conn.0].timers_expired(&mut self.ctx, now);
        self.ctx.dirty_conns.insert(conn);
    }

    /// Notification from the datapath that the peer address is unreachable.
    pub fn unreachable(&mut self, conn: ConnectionHandle, remote: SocketAddrV6) {
        self.connections[conn.0].queue_unreachable(&mut self.ctx, remote);
        self.ctx.dirty_conns.insert(conn);
    }

    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.ctx.incoming.pop_front()
    }

    /// Close a connection gracefully.
    pub fn shutdown(&mut self, conn: ConnectionHandle, error_code: u64) {
        if self.connections[conn.0].is_drained() {
            return;
        }
        self.connections[conn.0]
            .queue_shutdown(&mut self.ctx, true, error_code, false);
        self.ctx.dirty_conns.insert(conn);
    }

    /// Drop the application's handle. No further events will be delivered;
    /// the connection tears itself down.
    pub fn close(&mut self, conn: ConnectionHandle) {
        self.connections[conn.0].queue_close_handle(&mut self.ctx);
        self.ctx.dirty_conns.insert(conn);
    }

    pub fn trace_rundown(&mut self, conn: ConnectionHandle) {
        self.connections[conn.0].queue_trace_rundown(&mut self.ctx);
        self.ctx.dirty_conns.insert(conn);
    }

    // Stream surface -------------------------------------------------------

    pub fn open(&mut self, conn: ConnectionHandle, directionality: Directionality) -> Option<StreamId> {
        self.connections[conn.0].open(directionality)
    }

    pub fn write(
        &mut self,
        conn: ConnectionHandle,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, WriteError> {
        let result = self.connections[conn.0].write(&mut self.ctx, stream, data);
        self.ctx.dirty_conns.insert(conn);
        result
    }

    pub fn read(
        &mut self,
        conn: ConnectionHandle,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<usize, ReadError> {
        let result = self.connections[conn.0].read(stream, buf);
        // Reads free flow control window; flush the resulting updates.
        self.connections[conn.0].queue_flush_send(&mut self.ctx);
        self.ctx.dirty_conns.insert(conn);
        result
    }

    pub fn finish(&mut self, conn: ConnectionHandle, stream: StreamId) {
        self.connections[conn.0].finish(&mut self.ctx, stream);
        self.ctx.dirty_conns.insert(conn);
    }

    pub fn reset(&mut self, conn: ConnectionHandle, stream: StreamId, error_code: u64) {
        self.connections[conn.0].reset_stream(&mut self.ctx, stream, error_code);
        self.ctx.dirty_conns.insert(conn);
    }

    pub fn stop_sending(&mut self, conn: ConnectionHandle, stream: StreamId, error_code: u64) {
        self.connections[conn.0].stop_sending(&mut self.ctx, stream, error_code);
        self.ctx.dirty_conns.insert(conn);
    }

    /// Ping the remote endpoint, preventing an idle timeout.
    pub fn ping(&mut self, conn: ConnectionHandle) {
        self.connections[conn.0].ping(&mut self.ctx);
        self.ctx.dirty_conns.insert(conn);
    }

    // Parameter surface ----------------------------------------------------

    pub fn param_set(
        &mut self,
        now: u64,
        conn: ConnectionHandle,
        param: Param,
    ) -> Result<(), ParamError> {
        let result = self.connections[conn.0].param_set(&mut self.ctx, param, now);
        self.ctx.dirty_conns.insert(conn);
        result
    }

    pub fn param_get(&self, conn: ConnectionHandle, query: ParamQuery) -> Result<ParamValue, ParamError> {
        self.connections[conn.0].param_get(query)
    }

    pub fn get_side(&self, conn: ConnectionHandle) -> Side {
        self.connections[conn.0].side
    }

    pub fn connection(&self, conn: ConnectionHandle) -> &Connection {
        &self.connections[conn.0]
    }

    pub fn get_remote_address(&self, conn: ConnectionHandle) -> &SocketAddrV6 {
        &self.connections[conn.0].remote
    }

    pub fn get_stats(&self, conn: ConnectionHandle) -> ConnStats {
        match self.connections[conn.0].param_get(ParamQuery::Statistics) {
            Ok(ParamValue::Statistics(stats)) => stats,
            _ => unreachable!(),
        }
    }
}

fn read_var(data: &[u8], offset: &mut usize) -> Option<u64> {
    let first = *data.get(*offset)?;
    let len = 1usize << (first >> 6);
    if data.len() < *offset + len {
        return None;
    }
    let mut x = u64::from(first & 0x3f);
    for i in 1..len {
        x = (x << 8) | u64::from(data[*offset + i]);
    }
    *offset += len;
    Some(x)
}

/// Minimal invariant parse for routing: destination CID plus header form.
fn route_info(
    data: &[u8],
    local_cid_len: usize,
) -> Option<(ConnectionId, bool, bool, u32)> {
    let first = *data.first()?;
    if first & 0x80 != 0 {
        if data.len() < 6 {
            return None;
        }
        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let dcid_len = data[5] as usize;
        if dcid_len > MAX_CID_SIZE || data.len() < 6 + dcid_len {
            return None;
        }
        let dst_cid = ConnectionId::new(&data[6..6 + dcid_len]);
        let is_initial = (first >> 4) & 0x3 == 0;
        Some((dst_cid, true, is_initial, version))
    } else {
        if data.len() < 1 + local_cid_len {
            return None;
        }
        Some((
            ConnectionId::new(&data[1..1 + local_cid_len]),
            false,
            false,
            0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_info_parses_long_headers() {
        let mut data = vec![0xc0];
        data.extend_from_slice(&VERSION.to_be_bytes());
        data.push(4);
        data.extend_from_slice(&[9, 9, 9, 9]);
        data.push(0);
        let (cid, is_long, is_initial, version) = route_info(&data, 8).unwrap();
        assert_eq!(&cid[..], &[9, 9, 9, 9]);
        assert!(is_long);
        assert!(is_initial);
        assert_eq!(version, VERSION);
    }

    #[test]
    fn route_info_parses_short_headers() {
        let mut data = vec![0x40];
        data.extend_from_slice(&[7; 8]);
        data.extend_from_slice(&[0; 20]);
        let (cid, is_long, is_initial, _) = route_info(&data, 8).unwrap();
        assert_eq!(&cid[..], &[7; 8]);
        assert!(!is_long);
        assert!(!is_initial);
    }

    #[test]
    fn route_info_rejects_runts() {
        assert!(route_info(&[], 8).is_none());
        assert!(route_info(&[0x40, 1, 2], 8).is_none());
        assert!(route_info(&[0xc0, 0, 0], 8).is_none());
    }
}
