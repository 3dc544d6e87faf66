//! The per-connection state machine.
//!
//! A connection binds together handshake state, packet number spaces, loss
//! and ACK tracking, stream multiplexing, flow control, and the endpoint
//! tuple. All mutation is serialized through the operation queue: producers
//! enqueue, and exactly one worker at a time runs [`Connection::drain`].

use std::cmp;
use std::io;
use std::mem;
use std::net::SocketAddrV6;
use std::ops;
use std::sync::Mutex;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use failure::Fail;
use fnv::FnvHashSet;
use slog::{debug, info, trace, warn, Logger};

use crate::cid::{CidSet, RetireOutcome};
use crate::coding::BufMutExt;
use crate::crypto::{self, Keys};
use crate::endpoint::{Context, Event, Io};
use crate::frame::{self, Frame};
use crate::loss::{AckOutcome, LossDetection, LossTimerOutcome, Retransmits, SentPacket};
use crate::ops::{ApiOp, OperQueue, Operation};
use crate::packet::{self, ConnectionId, Header, LongType, PacketDecodeError, PacketNumber,
                    PartialDecode};
use crate::params::{ConnStats, Param, ParamError, ParamQuery, ParamValue, RttStats};
use crate::range_set::RangeSet;
use crate::rtt::RttEstimator;
use crate::send::{self, SendFlags};
use crate::space::{AckTiming, EncryptLevel, PacketSpace, ENCRYPT_LEVEL_COUNT};
use crate::stream::{RecvState, SendState};
use crate::streams::StreamSet;
use crate::timer_table::{TimerTable, TimerType, TIMER_TYPES};
use crate::transport_parameters::{TransportParameters, DEFAULT_ACK_DELAY_EXPONENT,
                                  MAX_STREAM_COUNT};
use crate::{Datagram, Directionality, Side, StreamId, TransportError, ACTIVE_CID_LIMIT,
            AEAD_TAG_SIZE, CID_COLLISION_RETRIES, CLOSE_PTO_COUNT, HP_SAMPLE_SIZE,
            MAX_COLLABORATOR_TIME_WARNING_US, MAX_CRYPTO_BATCH, MAX_DEFERRED_DATAGRAMS,
            MIN_DRAIN_PERIOD_MS, MIN_INITIAL_SIZE, MIN_STATELESS_RESET_SIZE, RECV_QUEUE_LIMIT,
            RESET_TOKEN_SIZE, VAR_INT_MAX, VERSION, VERSION_NEGOTIATION};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// Local status attached to a terminated connection, distinct from wire
/// error codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum CloseStatus {
    #[fail(display = "success")]
    Success,
    #[fail(display = "aborted")]
    Aborted,
    #[fail(display = "connection idle")]
    ConnectionIdle,
    #[fail(display = "peer unreachable")]
    Unreachable,
    #[fail(display = "protocol error")]
    ProtocolError,
    #[fail(display = "version negotiation failed")]
    VersionNegotiationError,
    #[fail(display = "internal error")]
    InternalError,
}

impl slog::Value for CloseStatus {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

fn error_code_to_status(code: u64) -> CloseStatus {
    match code {
        0 => CloseStatus::Success,
        x if x == TransportError::PROTOCOL_VIOLATION.0 => CloseStatus::ProtocolError,
        _ => CloseStatus::InternalError,
    }
}

/// How a close came about: a wire error code or a local status.
#[derive(Debug, Copy, Clone)]
pub enum CloseError {
    WireError(u64),
    Status(CloseStatus),
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CloseFlags(u32);

impl CloseFlags {
    pub const REMOTE: CloseFlags = CloseFlags(1 << 0);
    pub const SILENT: CloseFlags = CloseFlags(1 << 1);
    pub const APPLICATION: CloseFlags = CloseFlags(1 << 2);
    pub const SEND_NOTIFICATION: CloseFlags = CloseFlags(1 << 3);

    pub fn contains(self, other: CloseFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for CloseFlags {
    type Output = CloseFlags;
    fn bitor(self, other: CloseFlags) -> CloseFlags {
        CloseFlags(self.0 | other.0)
    }
}

/// Coarse connection phase. Orthogonal details live in [`Flags`]; every flag
/// there only ever moves false to true, except the edge-triggered shutdown
/// notification.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Handshake,
    Established,
    /// Locally closed, waiting out the peer's acknowledgement.
    Closing,
    /// Remotely closed (or both sides), flushing out leftovers.
    Draining,
    Drained,
}

#[derive(Debug, Default)]
struct Flags {
    initialized: bool,
    started: bool,
    connected: bool,
    handshake_confirmed: bool,
    closed_locally: bool,
    closed_remotely: bool,
    app_closed: bool,
    handle_closed: bool,
    handle_shutdown: bool,
    uninitialized: bool,
    shutdown_complete_timed_out: bool,
    send_shutdown_complete_notif: bool,
    external_owner: bool,
    source_address_validated: bool,
    got_first_server_response: bool,
    received_retry_packet: bool,
    initiated_cid_update: bool,
    /// The close never went out on the wire, so the peer cannot have
    /// acknowledged it.
    silent_close: bool,
}

/// Which 1-RTT key generation decrypts a packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum UseKey {
    Current,
    Old,
    New,
}

/// One QUIC packet awaiting header-protection removal, parked in the current
/// crypto batch.
struct PendingPacket {
    data: BytesMut,
    pn_offset: usize,
    is_short: bool,
    level: EncryptLevel,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    sample: [u8; HP_SAMPLE_SIZE],
}

#[derive(Default)]
struct RecvQueue {
    datagrams: Vec<Datagram>,
}

pub struct Connection {
    log: Logger,
    pub side: Side,
    pub handle: ConnectionHandle,
    pub remote: SocketAddrV6,
    pub local: Option<SocketAddrV6>,
    pub version: u32,
    state: State,
    flags: Flags,

    close_status: CloseStatus,
    close_error_code: u64,
    close_reason: Option<String>,

    timers: TimerTable,
    rtt: RttEstimator,
    cids: CidSet,
    spaces: [PacketSpace; ENCRYPT_LEVEL_COUNT],

    keys: [Option<Keys>; ENCRYPT_LEVEL_COUNT],
    prev_1rtt_keys: Option<Keys>,
    next_1rtt_keys: Option<Keys>,
    /// Highest level whose read key has ever been installed.
    read_level: EncryptLevel,
    crypto_streams: [crypto::CryptoStream; ENCRYPT_LEVEL_COUNT],
    session: Option<Box<dyn crypto::TlsSession>>,

    send: send::Send,
    loss: LossDetection,
    streams: StreamSet,
    readable_streams: FnvHashSet<StreamId>,

    oper_queue: OperQueue,
    recv_queue: Mutex<RecvQueue>,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,
    idle_timeout_ms: u64,
    keep_alive_ms: u64,
    max_ack_delay_ms: u64,
    /// Sum of stream data received, bounded by `send.max_data`.
    data_recvd: u64,
    server_name: Option<String>,
    pub stats: ConnStats,
}

impl Connection {
    pub fn new(
        log: Logger,
        side: Side,
        handle: ConnectionHandle,
        init_cid: ConnectionId,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        remote: SocketAddrV6,
        server_name: Option<String>,
        config: &crate::endpoint::Config,
        now: u64,
    ) -> Self {
        let mut cids = CidSet::new();
        let mut send = send::Send::new(u64::from(config.receive_window), config.path_mtu);
        match side {
            Side::Client => {
                cids.push_source(local_cid, true);
                cids.set_dest(remote_cid);
                // Clients are never amplification limited.
                send.set_allowance_unlimited();
            }
            Side::Server => {
                // The client's chosen CID keeps routing until it switches
                // over to ours, announced in our Initial's source CID field.
                cids.push_source(init_cid, true);
                cids.push_source(local_cid, true);
                let last = cids.source_count() - 1;
                cids.source_cids_mut()[last].needs_to_send = false;
                cids.set_dest(remote_cid);
            }
        }
        let mut keys: [Option<Keys>; ENCRYPT_LEVEL_COUNT] = [None, None, None, None];
        keys[EncryptLevel::Initial as usize] = Some(Keys::new_initial(&init_cid, side));

        let mut stats = ConnStats::default();
        stats.quic_version = VERSION;
        stats.timing.start = now;

        Connection {
            log,
            side,
            handle,
            remote,
            local: None,
            version: VERSION,
            state: State::Handshake,
            flags: Flags {
                external_owner: side == Side::Client,
                ..Flags::default()
            },
            close_status: CloseStatus::Success,
            close_error_code: 0,
            close_reason: None,
            timers: TimerTable::new(),
            rtt: RttEstimator::new(config.initial_rtt_us),
            cids,
            spaces: Default::default(),
            keys,
            prev_1rtt_keys: None,
            next_1rtt_keys: None,
            read_level: EncryptLevel::Initial,
            crypto_streams: Default::default(),
            session: None,
            send,
            loss: LossDetection::new(config.default_mss, 25_000),
            streams: StreamSet::new(
                side,
                u64::from(config.stream_receive_window),
                u64::from(config.max_remote_bi_streams),
                u64::from(config.max_remote_uni_streams),
            ),
            readable_streams: FnvHashSet::default(),
            oper_queue: OperQueue::new(),
            recv_queue: Mutex::new(RecvQueue::default()),
            local_params: TransportParameters::default(),
            peer_params: None,
            idle_timeout_ms: config.idle_timeout_ms,
            keep_alive_ms: config.keep_alive_ms,
            max_ack_delay_ms: config.max_ack_delay_ms,
            data_recvd: 0,
            server_name,
            stats,
        }
    }

    pub fn is_server(&self) -> bool {
        self.side == Side::Server
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed_locally || self.flags.closed_remotely
    }

    pub fn is_drained(&self) -> bool {
        self.state == State::Drained
    }

    pub fn is_handle_closed(&self) -> bool {
        self.flags.handle_closed
    }

    pub fn close_error_code(&self) -> u64 {
        self.close_error_code
    }

    pub fn close_status(&self) -> CloseStatus {
        self.close_status
    }

    pub fn source_cids(&self) -> Vec<ConnectionId> {
        self.cids.source_cids().iter().map(|c| c.id).collect()
    }

    /// Number of destination CIDs currently tracked for the peer.
    pub fn dest_cid_count(&self) -> usize {
        self.cids.dest_count()
    }

    /// The endpoint validated a retry token on the accepting Initial; the
    /// original CID it carried is echoed in our transport parameters.
    pub(crate) fn set_token_validated(&mut self, odcid: ConnectionId) {
        info!(self.log, "source address validated via Initial token");
        self.cids.orig_cid = Some(odcid);
        self.flags.source_address_validated = true;
        self.send.set_allowance_unlimited();
    }

    /// Start the handshake; clients only. Servers initialize lazily on their
    /// first drain.
    pub fn start(&mut self, ctx: &mut Context, now: u64) {
        debug_assert_eq!(self.side, Side::Client);
        self.flags.started = true;
        self.flags.initialized = true;
        ctx.handshake_connections += 1;
        self.initialize_crypto(ctx, now);
    }

    // ---------------------------------------------------------------------
    // Operation queue
    // ---------------------------------------------------------------------

    /// Enqueue an operation; inserts the connection into the worker's dirty
    /// set when the queue transitioned from empty to non-empty.
    fn queue_oper(&self, ctx: &mut Context, op: Operation) {
        if self.oper_queue.enqueue(op) {
            ctx.dirty_conns.insert(self.handle);
        }
    }

    fn queue_oper_front(&self, ctx: &mut Context, op: Operation) {
        if self.oper_queue.enqueue_front(op) {
            ctx.dirty_conns.insert(self.handle);
        }
    }

    /// Post an application shutdown; front-inserted so it runs ahead of any
    /// queued work.
    pub fn queue_shutdown(&self, ctx: &mut Context, app: bool, error_code: u64, silent: bool) {
        self.queue_oper_front(
            ctx,
            Operation::ApiCall(ApiOp::Shutdown {
                app,
                error_code,
                silent,
            }),
        );
    }

    pub fn queue_close_handle(&self, ctx: &mut Context) {
        self.queue_oper_front(ctx, Operation::ApiCall(ApiOp::CloseHandle));
    }

    pub fn queue_trace_rundown(&self, ctx: &mut Context) {
        self.queue_oper(ctx, Operation::TraceRundown);
    }

    pub fn queue_stream_recv_flush(&self, ctx: &mut Context, id: StreamId) {
        self.queue_oper(ctx, Operation::FlushStreamRecv { id });
    }

    /// Only honored at the beginning of the handshake; afterwards it would
    /// be attack surface.
    pub fn queue_unreachable(&self, ctx: &mut Context, remote: SocketAddrV6) {
        if self.read_level > EncryptLevel::Initial {
            warn!(self.log, "ignoring unreachable event past handshake start");
            return;
        }
        self.queue_oper(ctx, Operation::Unreachable { remote });
    }

    /// Hand received datagrams to the connection. Runs on arbitrary threads
    /// and only touches the locked intake list. Returns true when a
    /// FLUSH_RECV operation was posted and the worker must be signaled.
    pub fn queue_recv_datagrams(&self, datagrams: Vec<Datagram>) -> bool {
        let count = datagrams.len();
        let post = {
            let mut queue = self.recv_queue.lock().unwrap();
            if queue.datagrams.len() + count > RECV_QUEUE_LIMIT {
                // Drop the whole chain; the datapath gets the buffers back.
                debug!(self.log, "receive queue limit reached; dropping chain";
                       "count" => count);
                return false;
            }
            let was_empty = queue.datagrams.is_empty();
            queue.datagrams.extend(datagrams);
            was_empty
        };
        post && self.oper_queue.enqueue(Operation::FlushRecv)
    }

    /// Process up to `max_operations_per_drain` queued operations. Exactly
    /// one thread may be in here at a time. Returns whether more work
    /// remains.
    pub fn drain(&mut self, ctx: &mut Context, now: u64) -> bool {
        let max_operations = ctx.config.max_operations_per_drain;
        let mut operation_count = 0;
        let mut has_more_work = true;

        if !self.flags.initialized {
            // Server connections accepted off a raw Initial initialize here.
            debug_assert!(self.is_server());
            self.initialize_crypto(ctx, now);
            self.flags.initialized = true;
            trace!(self.log, "lazily initialized");
        }

        while !self.flags.handle_closed && operation_count < max_operations {
            operation_count += 1;
            let op = match self.oper_queue.dequeue() {
                Some(op) => op,
                None => {
                    has_more_work = false;
                    break;
                }
            };
            match op {
                Operation::ApiCall(ApiOp::CloseHandle) => {
                    self.try_close(
                        ctx,
                        CloseFlags::SILENT,
                        CloseError::Status(CloseStatus::Aborted),
                        None,
                        now,
                    );
                    self.flags.external_owner = false;
                    self.flags.handle_closed = true;
                }
                Operation::ApiCall(ApiOp::Shutdown {
                    app,
                    error_code,
                    silent,
                }) => {
                    // The owner initiated this; no shutdown-begin indication.
                    let mut close_flags = CloseFlags::default();
                    if app {
                        close_flags = close_flags | CloseFlags::APPLICATION;
                    }
                    if silent {
                        close_flags = close_flags | CloseFlags::SILENT;
                    }
                    self.try_close(ctx, close_flags, CloseError::WireError(error_code), None, now);
                    self.queue_flush_send(ctx);
                }
                Operation::FlushRecv => self.flush_recv(ctx, now),
                Operation::Unreachable { remote } => self.process_unreachable(ctx, remote, now),
                Operation::FlushStreamRecv { id } => {
                    self.readable_streams.insert(id);
                    ctx.readable_conns.insert(self.handle);
                }
                Operation::FlushSend => {
                    if self.flush_send(ctx, now, false) {
                        // Still more packets to send; spread the work out so
                        // other connections on this worker get a turn.
                        self.queue_oper(ctx, Operation::FlushSend);
                    }
                }
                Operation::TlsComplete => self.process_tls_complete(ctx, now),
                Operation::TimerExpired { ty } => self.process_expired_timer(ctx, ty, now),
                Operation::TraceRundown => self.trace_rundown(),
            }
            self.stats.schedule.operation_count += 1;
        }

        if operation_count >= max_operations
            && self.send.flags.contains(SendFlags::ACK)
            && !self.flags.handle_closed
        {
            // Out of budget but an immediate ACK is due; one inline flush so
            // it doesn't sit behind other connections' work.
            self.flush_send(ctx, now, true);
        }

        if self.flags.send_shutdown_complete_notif && !self.flags.handle_closed {
            self.flags.send_shutdown_complete_notif = false;
            self.on_shutdown_complete(ctx);
        }

        if self.flags.handle_closed {
            if !self.flags.uninitialized {
                self.uninitialize(ctx);
            }
            has_more_work = false;
        }

        let replenished = self.streams.drain_closed();
        if replenished[0] != 0 {
            self.send.set_flag(SendFlags::MAX_STREAMS_BIDI);
        }
        if replenished[1] != 0 {
            self.send.set_flag(SendFlags::MAX_STREAMS_UNI);
        }

        has_more_work && self.oper_queue.has_pending()
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Emit an event toward the owner; inhibited once the handle is closed.
    fn emit(&mut self, ctx: &mut Context, event: Event) {
        if self.flags.handle_closed {
            warn!(self.log, "event silently discarded"; "event" => ?event);
            return;
        }
        ctx.events.push_back((self.handle, event));
    }

    pub fn poll(&mut self) -> Option<Event> {
        let &stream = self.readable_streams.iter().next()?;
        self.readable_streams.remove(&stream);
        let fresh = self
            .streams
            .get_mut(stream)
            .and_then(|s| s.recv_mut())
            .map_or(false, |rs| mem::replace(&mut rs.fresh, false));
        Some(Event::StreamReadable { stream, fresh })
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    fn update_timer_wheel(&mut self, ctx: &mut Context) {
        ctx.io.push_back(Io::TimerUpdate {
            connection: self.handle,
            time: self.timers.next_expiration(),
        });
    }

    fn timer_set(&mut self, ctx: &mut Context, ty: TimerType, delay_ms: u64, now: u64) {
        if self.timers.set(ty, now + delay_ms * 1_000) {
            self.update_timer_wheel(ctx);
        }
    }

    fn timer_cancel(&mut self, ctx: &mut Context, ty: TimerType) {
        if self.timers.cancel(ty) {
            self.update_timer_wheel(ctx);
        }
    }

    /// Called by the endpoint when the timer wheel fires for this
    /// connection. Pacing and delayed-ACK work runs inline; everything else
    /// becomes a queued TIMER_EXPIRED operation.
    pub fn timers_expired(&mut self, ctx: &mut Context, now: u64) {
        let due = self.timers.expire(now);
        let mut flush_immediately = false;
        for ty in due {
            trace!(self.log, "timer expired"; "timer" => ty);
            match ty {
                TimerType::Pacing => flush_immediately = true,
                TimerType::AckDelay => {
                    self.send.set_flag(SendFlags::ACK);
                    flush_immediately = true;
                }
                _ => self.queue_oper(ctx, Operation::TimerExpired { ty }),
            }
        }
        self.update_timer_wheel(ctx);
        if flush_immediately {
            // Kept out of the traversal above: a flush may re-arm timers.
            self.flush_send(ctx, now, true);
        }
    }

    fn process_expired_timer(&mut self, ctx: &mut Context, ty: TimerType, now: u64) {
        match ty {
            TimerType::Idle => {
                self.close_silently(ctx, CloseStatus::ConnectionIdle, now);
            }
            TimerType::KeepAlive => {
                self.send.set_flag(SendFlags::PING);
                self.timer_set(ctx, TimerType::KeepAlive, self.keep_alive_ms, now);
                self.queue_flush_send(ctx);
            }
            TimerType::LossDetection => {
                match self.loss.on_timer_expired(now, &self.rtt) {
                    LossTimerOutcome::Lost(lost) => {
                        for (level, frames) in lost {
                            self.requeue_retransmits(level, frames);
                        }
                    }
                    LossTimerOutcome::Probe => {
                        self.send.set_flag(SendFlags::PING);
                    }
                }
                self.set_loss_timer(ctx, now);
                self.queue_flush_send(ctx);
            }
            TimerType::Shutdown => {
                // The peer is now treated as closed whether or not it ever
                // answered, which completes the shutdown.
                self.flags.closed_remotely = true;
                self.flags.send_shutdown_complete_notif = true;
                self.state = State::Drained;
            }
            TimerType::Pacing | TimerType::AckDelay => unreachable!("processed inline"),
        }
    }

    fn reset_idle_timeout(&mut self, ctx: &mut Context, now: u64) {
        if self.is_closed() {
            return;
        }
        // Use the non-zero minimum of the local and peer configuration.
        let mut timeout_ms = self.peer_params.as_ref().map_or(0, |p| p.idle_timeout);
        if timeout_ms == 0 || (self.idle_timeout_ms != 0 && self.idle_timeout_ms < timeout_ms) {
            timeout_ms = self.idle_timeout_ms;
        }
        if timeout_ms != 0 {
            // No shorter than the probe timeouts needed to close cleanly.
            let min_ms = self.loss.probe_timeout(&self.rtt, CLOSE_PTO_COUNT) / 1_000;
            timeout_ms = cmp::max(timeout_ms, min_ms);
            self.timer_set(ctx, TimerType::Idle, timeout_ms, now);
        }
        if self.keep_alive_ms != 0 {
            self.timer_set(ctx, TimerType::KeepAlive, self.keep_alive_ms, now);
        }
    }

    fn set_loss_timer(&mut self, ctx: &mut Context, now: u64) {
        match self.loss.next_timeout(&self.rtt) {
            Some(deadline) => {
                let delay_ms = deadline.saturating_sub(now) / 1_000;
                self.timer_set(ctx, TimerType::LossDetection, delay_ms, now);
            }
            None => self.timer_cancel(ctx, TimerType::LossDetection),
        }
    }

    // ---------------------------------------------------------------------
    // Close state machine
    // ---------------------------------------------------------------------

    fn transport_error(&mut self, ctx: &mut Context, code: TransportError, now: u64) {
        warn!(self.log, "transport error"; "code" => code);
        self.try_close(
            ctx,
            CloseFlags::SEND_NOTIFICATION,
            CloseError::WireError(code.0),
            None,
            now,
        );
        self.queue_flush_send(ctx);
    }

    fn close_silently(&mut self, ctx: &mut Context, status: CloseStatus, now: u64) {
        self.try_close(
            ctx,
            CloseFlags::SILENT | CloseFlags::SEND_NOTIFICATION,
            CloseError::Status(status),
            None,
            now,
        );
    }

    pub fn try_close(
        &mut self,
        ctx: &mut Context,
        close_flags: CloseFlags,
        error: CloseError,
        reason: Option<&str>,
        now: u64,
    ) {
        let closed_remotely = close_flags.contains(CloseFlags::REMOTE);
        let mut silent = close_flags.contains(CloseFlags::SILENT);

        if (closed_remotely && self.flags.closed_remotely)
            || (!closed_remotely && self.flags.closed_locally)
        {
            // Already closed on this side. A forced silent close after a
            // local close still has to promote shutdown completion.
            if silent && self.flags.closed_locally && !self.flags.closed_remotely {
                self.flags.shutdown_complete_timed_out = false;
                self.flags.send_shutdown_complete_notif = true;
                self.state = State::Drained;
            }
            return;
        }

        let mut is_first_close = true;
        if closed_remotely && !self.flags.closed_locally {
            // Peer closed first.
            if !self.flags.connected && self.side == Side::Client {
                // A rejected connection attempt skips the draining period.
                silent = true;
            }
            if !silent {
                let drain_ms = cmp::max(MIN_DRAIN_PERIOD_MS, (2 * self.rtt.smoothed) / 1_000);
                self.timer_set(ctx, TimerType::Shutdown, drain_ms, now);
                self.send.set_flag(SendFlags::CONNECTION_CLOSE);
                self.state = State::Draining;
            }
        } else if !closed_remotely && !self.flags.closed_remotely {
            // Locally closed first: wait out the closing period for the
            // peer's acknowledgement.
            if !silent {
                let pto_ms = self.loss.probe_timeout(&self.rtt, CLOSE_PTO_COUNT) / 1_000;
                self.timer_set(ctx, TimerType::Shutdown, cmp::max(pto_ms, 1), now);
                self.send
                    .set_flag(if close_flags.contains(CloseFlags::APPLICATION) {
                        SendFlags::APPLICATION_CLOSE
                    } else {
                        SendFlags::CONNECTION_CLOSE
                    });
                self.state = State::Closing;
            }
        } else {
            info!(self.log, "connection close complete");
            // Peer acknowledged our close. Clients clean up right away;
            // servers drain a little longer for stragglers.
            if self.is_server() && !silent {
                let drain_ms = cmp::max(MIN_DRAIN_PERIOD_MS, (2 * self.rtt.smoothed) / 1_000);
                self.timer_set(ctx, TimerType::Shutdown, drain_ms, now);
            }
            self.state = State::Draining;
            is_first_close = false;
        }

        if closed_remotely {
            self.flags.closed_remotely = true;
        } else {
            self.flags.closed_locally = true;
        }

        if is_first_close {
            // Until proven otherwise the shutdown ends by timeout.
            self.flags.shutdown_complete_timed_out = true;
            if self.timers.cancel_all_but_shutdown() {
                self.update_timer_wheel(ctx);
            }

            match error {
                CloseError::Status(status) => {
                    self.close_status = status;
                    self.close_error_code = TransportError::INTERNAL_ERROR.0;
                }
                CloseError::WireError(code) => {
                    self.close_status = error_code_to_status(code);
                    self.close_error_code = code;
                }
            }
            if close_flags.contains(CloseFlags::APPLICATION) {
                self.flags.app_closed = true;
            }
            if close_flags.contains(CloseFlags::SEND_NOTIFICATION) && self.flags.external_owner {
                self.indicate_shutdown_begin(ctx);
            }
            self.close_reason = reason.map(|r| {
                let mut r = r.to_owned();
                r.truncate(512);
                r
            });

            self.streams.shutdown_all();
            self.send.flags.restrict_to_closing();
        }

        if silent || (self.flags.closed_remotely && self.flags.closed_locally) {
            self.flags.shutdown_complete_timed_out = false;
            self.flags.send_shutdown_complete_notif = true;
            if silent {
                self.flags.silent_close = true;
                self.state = State::Drained;
            }
        }
    }

    fn indicate_shutdown_begin(&mut self, ctx: &mut Context) {
        if self.flags.app_closed {
            let error_code = self.close_error_code;
            debug!(self.log, "indicating shutdown initiated by peer";
                   "error" => error_code);
            self.emit(ctx, Event::ShutdownInitiatedByPeer { error_code });
        } else {
            let status = self.close_status;
            debug!(self.log, "indicating shutdown initiated by transport";
                   "status" => status);
            self.emit(ctx, Event::ShutdownInitiatedByTransport { status });
        }
    }

    fn on_shutdown_complete(&mut self, ctx: &mut Context) {
        if self.flags.handle_shutdown {
            return;
        }
        self.flags.handle_shutdown = true;
        info!(self.log, "shutdown complete";
              "timed_out" => self.flags.shutdown_complete_timed_out);

        self.unregister_cids(ctx);
        if !self.flags.external_owner {
            // Never surfaced to the application; finish the teardown alone.
            self.flags.handle_closed = true;
        } else {
            // A silent close never reached the peer, so it cannot count as
            // acknowledged even though it completed without a timeout.
            let peer_acknowledged_shutdown =
                !self.flags.shutdown_complete_timed_out && !self.flags.silent_close;
            self.emit(
                ctx,
                Event::ShutdownComplete {
                    peer_acknowledged_shutdown,
                },
            );
        }
    }

    fn unregister_cids(&mut self, ctx: &mut Context) {
        for cid in self.cids.source_cids() {
            ctx.connection_ids.remove(&cid.id);
            ctx.connection_ids_initial.remove(&cid.id);
        }
        ctx.connection_remotes.remove(&self.remote);
    }

    fn uninitialize(&mut self, ctx: &mut Context) {
        if self.flags.uninitialized {
            return;
        }
        self.flags.uninitialized = true;
        trace!(self.log, "uninitializing");
        if !self.flags.connected {
            // Handshake accounting must reverse exactly once even when the
            // connection dies before completing.
            if self.is_server() {
                ctx.incoming_handshakes = ctx.incoming_handshakes.saturating_sub(1);
            } else if self.flags.started {
                ctx.handshake_connections = ctx.handshake_connections.saturating_sub(1);
            }
        }
        self.unregister_cids(ctx);
        for &ty in TIMER_TYPES.iter() {
            self.timers.cancel(ty);
        }
        ctx.io.push_back(Io::TimerUpdate {
            connection: self.handle,
            time: None,
        });
        self.session = None;
        self.streams.shutdown_all();
        self.streams.drain_closed();
    }

    fn process_unreachable(&mut self, ctx: &mut Context, remote: SocketAddrV6, now: u64) {
        if self.read_level > EncryptLevel::Initial {
            warn!(self.log, "ignoring unreachable event");
        } else if remote == self.remote {
            info!(self.log, "peer unreachable");
            self.close_silently(ctx, CloseStatus::Unreachable, now);
        } else {
            warn!(self.log, "unreachable event for wrong address");
        }
    }

    fn trace_rundown(&self) {
        info!(self.log, "rundown";
              "side" => self.side,
              "state" => ?self.state,
              "version" => self.version,
              "remote" => %self.remote,
              "srtt_us" => self.rtt.smoothed,
              "source_cids" => self.cids.source_count(),
              "dest_cids" => self.cids.dest_count(),
              "bytes_in_flight" => self.loss.bytes_in_flight,
              "operations" => self.stats.schedule.operation_count);
    }

    // ---------------------------------------------------------------------
    // Crypto wiring
    // ---------------------------------------------------------------------

    fn initialize_crypto(&mut self, ctx: &mut Context, now: u64) {
        let mut params = TransportParameters {
            initial_max_data: self.send.max_data,
            initial_max_stream_data_bidi_local: u64::from(ctx.config.stream_receive_window),
            initial_max_stream_data_bidi_remote: u64::from(ctx.config.stream_receive_window),
            initial_max_stream_data_uni: u64::from(ctx.config.stream_receive_window),
            initial_max_streams_bidi: self.streams.max_remote(Directionality::Bi),
            initial_max_streams_uni: self.streams.max_remote(Directionality::Uni),
            idle_timeout: self.idle_timeout_ms,
            max_packet_size: u64::from(self.send.path_mtu),
            max_ack_delay: self.max_ack_delay_ms,
            active_connection_id_limit: ACTIVE_CID_LIMIT as u64,
            disable_active_migration: true,
            ..TransportParameters::default()
        };
        if self.is_server() {
            let first = self.cids.source_cids()[0].id;
            params.stateless_reset_token = Some(crypto::reset_token_for(&ctx.reset_key, &first));
            // Echo the pre-Retry CID so the client can authenticate it.
            params.original_connection_id = self.cids.orig_cid.take();
        }
        self.local_params = params.clone();
        self.session = Some(ctx.config.tls.start_session(
            self.side,
            self.server_name.as_deref(),
            &params,
        ));
        if self.keep_alive_ms != 0 {
            self.timer_set(ctx, TimerType::KeepAlive, self.keep_alive_ms, now);
        }
        self.drive_tls(ctx, now);
    }

    /// Pump the TLS session: install fresh keys, queue handshake bytes, and
    /// schedule completion. Session calls are timed; external code running
    /// long inside the drain starves every connection on this worker.
    fn drive_tls(&mut self, ctx: &mut Context, now: u64) {
        let mut session = match self.session.take() {
            Some(x) => x,
            None => return,
        };
        let timer = Instant::now();

        while let Some(change) = session.next_keys() {
            let li = change.level as usize;
            trace!(self.log, "new keys available"; "level" => change.level);
            self.keys[li] = Some(Keys::from_secrets(change.local, change.remote));
            if change.level > self.read_level {
                self.read_level = change.level;
            }
        }

        loop {
            let mut buf = Vec::new();
            match session.write_handshake(&mut buf) {
                Some(level) if !buf.is_empty() => {
                    let li = level as usize;
                    let offset = self.crypto_streams[li].send_offset;
                    self.crypto_streams[li].send_offset += buf.len() as u64;
                    self.send.crypto[li].push_back(frame::Crypto {
                        offset,
                        data: buf.into(),
                    });
                    self.send.set_flag(SendFlags::CRYPTO);
                }
                _ => break,
            }
        }

        let handshaking = session.is_handshaking();
        let elapsed = timer.elapsed().as_micros() as u64;
        if elapsed > MAX_COLLABORATOR_TIME_WARNING_US {
            warn!(self.log, "TLS session took excessive time"; "us" => elapsed);
            debug_assert!(
                elapsed < crate::MAX_COLLABORATOR_TIME_ERROR_US,
                "TLS session spent {}us inside the drain",
                elapsed
            );
        }
        self.session = Some(session);

        if !handshaking && !self.flags.connected {
            self.queue_oper(ctx, Operation::TlsComplete);
        }
        self.flush_deferred(ctx, now);
        self.queue_flush_send(ctx);
    }

    fn process_tls_complete(&mut self, ctx: &mut Context, now: u64) {
        if self.flags.connected {
            return;
        }
        let raw = match self
            .session
            .as_ref()
            .and_then(|s| s.peer_transport_parameters())
        {
            Some(raw) => raw.to_vec(),
            None => {
                debug!(self.log, "peer did not supply transport parameters");
                self.transport_error(ctx, TransportError::TRANSPORT_PARAMETER_ERROR, now);
                return;
            }
        };
        let params = match TransportParameters::read(self.side, &mut io::Cursor::new(&raw[..])) {
            Ok(params) => params,
            Err(e) => {
                debug!(self.log, "malformed peer transport parameters"; "reason" => %e);
                self.transport_error(ctx, TransportError::TRANSPORT_PARAMETER_ERROR, now);
                return;
            }
        };
        if self
            .process_peer_transport_parameters(ctx, params, now)
            .is_err()
        {
            return;
        }

        self.flags.connected = true;
        self.flags.handshake_confirmed = true;
        self.state = State::Established;
        self.stats.timing.handshake_complete = now;
        info!(self.log, "handshake complete");

        if self.is_server() {
            ctx.incoming_handshakes -= 1;
            ctx.incoming.push_back(self.handle);
            self.flags.external_owner = true;
        } else {
            // Reverse the handshake-connection accounting exactly once.
            ctx.handshake_connections -= 1;
        }
        self.emit(ctx, Event::Connected);

        // Keep a spare source CID around so the peer can rotate.
        if self.cids.source_count() < 2 {
            self.generate_new_source_cid(ctx, false);
        }
        self.reset_idle_timeout(ctx, now);
        self.queue_flush_send(ctx);
    }

    fn process_peer_transport_parameters(
        &mut self,
        ctx: &mut Context,
        params: TransportParameters,
        now: u64,
    ) -> Result<(), ()> {
        info!(self.log, "peer transport parameters set");

        if let Some(token) = params.stateless_reset_token {
            debug_assert_eq!(self.side, Side::Client);
            self.cids.first_dest_mut().reset_token = Some(token);
        }

        if self.flags.received_retry_packet {
            // The server must prove it saw our original CID, otherwise a
            // middlebox injected the Retry.
            let valid = match (&params.original_connection_id, &self.cids.orig_cid) {
                (Some(tp_cid), Some(orig)) => tp_cid == orig,
                _ => false,
            };
            if !valid {
                debug!(self.log, "peer failed original CID validation");
                self.transport_error(ctx, TransportError::TRANSPORT_PARAMETER_ERROR, now);
                return Err(());
            }
            self.cids.orig_cid = None;
        } else if self.side == Side::Client && params.original_connection_id.is_some() {
            debug!(self.log, "peer sent original CID without a Retry");
            self.transport_error(ctx, TransportError::TRANSPORT_PARAMETER_ERROR, now);
            return Err(());
        }

        self.send.peer_max_data = cmp::max(self.send.peer_max_data, params.initial_max_data);
        self.loss.max_ack_delay = params.max_ack_delay * 1_000;
        self.streams.apply_peer_parameters(
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
            params.initial_max_stream_data_bidi_remote,
            params.initial_max_stream_data_uni,
            params.initial_max_stream_data_bidi_local,
        );
        self.peer_params = Some(params);
        Ok(())
    }

    fn discard_keys(&mut self, level: EncryptLevel) {
        if self.keys[level as usize].is_none() {
            return;
        }
        trace!(self.log, "discarding keys"; "level" => level);
        self.keys[level as usize] = None;
        self.spaces[level as usize].deferred.clear();
        self.send.crypto[level as usize].clear();
        self.loss.discard_space(level);
    }

    /// Roll the connection back for a fresh handshake. `complete_reset`
    /// additionally forgets RTT state; a Retry keeps it.
    fn restart(&mut self, ctx: &mut Context, complete_reset: bool, now: u64) {
        info!(self.log, "restart"; "complete" => complete_reset);
        if complete_reset {
            self.rtt.reset(ctx.config.initial_rtt_us);
        }
        for space in &mut self.spaces {
            space.reset();
        }
        self.loss.reset();
        self.send.reset();
        for stream in &mut self.crypto_streams {
            stream.reset();
        }
        self.prev_1rtt_keys = None;
        self.next_1rtt_keys = None;
        self.keys[EncryptLevel::ZeroRtt as usize] = None;
        self.keys[EncryptLevel::Handshake as usize] = None;
        self.keys[EncryptLevel::OneRtt as usize] = None;
        self.read_level = EncryptLevel::Initial;

        // Fresh TLS session; the first flight goes out again.
        self.session = Some(ctx.config.tls.start_session(
            self.side,
            self.server_name.as_deref(),
            &self.local_params,
        ));
        self.drive_tls(ctx, now);
    }

    // ---------------------------------------------------------------------
    // CID management
    // ---------------------------------------------------------------------

    fn generate_new_source_cid(
        &mut self,
        ctx: &mut Context,
        is_initial: bool,
    ) -> Option<ConnectionId> {
        if ctx.config.local_cid_len == 0 {
            // Not sharing a binding, so no CID is in use at all.
            return None;
        }
        for _ in 0..CID_COLLISION_RETRIES {
            let id = ConnectionId::random(&mut ctx.rng, ctx.config.local_cid_len);
            if ctx.connection_ids.contains_key(&id) {
                trace!(self.log, "CID collision, trying again");
                continue;
            }
            ctx.connection_ids.insert(id, self.handle);
            let needs_to_send = {
                let cid = self.cids.push_source(id, is_initial);
                trace!(self.log, "source CID added"; "cid" => cid.id);
                cid.needs_to_send
            };
            if needs_to_send {
                self.send.set_flag(SendFlags::NEW_CONNECTION_ID);
                self.queue_flush_send(ctx);
            }
            return Some(id);
        }
        warn!(self.log, "too many CID collisions");
        None
    }

    fn retire_current_dest_cid(&mut self) {
        match self.cids.retire_current_dest() {
            RetireOutcome::Retired(sequence) => {
                trace!(self.log, "retiring destination CID"; "sequence" => sequence);
                self.send.set_flag(SendFlags::RETIRE_CONNECTION_ID);
            }
            RetireOutcome::Irreplaceable => {
                warn!(self.log, "can't retire current CID because it's zero length");
            }
            RetireOutcome::NoReplacement => {
                warn!(self.log, "can't retire current CID without a replacement");
            }
        }
    }

    /// After a fully validated packet: track which of our CIDs the peer
    /// uses, drop superseded initial CIDs, and answer a peer-initiated CID
    /// change with one of our own.
    fn recv_post_processing(&mut self, ctx: &mut Context, dst_cid: &ConnectionId) {
        if dst_cid.is_empty() {
            return;
        }
        let (first_use, is_initial, sequence) = {
            let cid = match self.cids.source_by_buf_mut(dst_cid) {
                Some(x) => x,
                None => return,
            };
            let first_use = !cid.used_by_peer;
            cid.used_by_peer = true;
            (first_use, cid.is_initial, cid.sequence)
        };
        if !first_use {
            return;
        }
        info!(self.log, "first peer usage of source CID"; "cid" => %dst_cid);
        if is_initial {
            if self.is_server() {
                // The client moved to our chosen CID; the one it invented
                // can be dropped.
                let stale: Vec<u64> = self
                    .cids
                    .source_cids()
                    .iter()
                    .filter(|c| c.is_initial && c.sequence < sequence)
                    .map(|c| c.sequence)
                    .collect();
                for old_sequence in stale {
                    if let Some(old) = self.cids.remove_source(old_sequence) {
                        ctx.connection_ids.remove(&old.id);
                        ctx.connection_ids_initial.remove(&old.id);
                        trace!(self.log, "discarded superseded initial CID"; "cid" => old.id);
                    }
                }
            }
        } else if !self.flags.initiated_cid_update {
            // The peer rotated CIDs; respond with a rotation of ours.
            self.retire_current_dest_cid();
        } else {
            self.flags.initiated_cid_update = false;
        }
    }

    // ---------------------------------------------------------------------
    // Receive pipeline
    // ---------------------------------------------------------------------

    fn flush_recv(&mut self, ctx: &mut Context, now: u64) {
        let datagrams = {
            let mut queue = self.recv_queue.lock().unwrap();
            mem::take(&mut queue.datagrams)
        };
        if !datagrams.is_empty() {
            self.recv_datagrams(ctx, datagrams, false, now);
        }
    }

    /// Re-run datagrams parked for levels whose read keys have now arrived.
    /// A datagram is never deferred twice.
    fn flush_deferred(&mut self, ctx: &mut Context, now: u64) {
        for li in 1..ENCRYPT_LEVEL_COUNT {
            let level = EncryptLevel::from_index(li);
            if level > self.read_level || self.keys[li].is_none() {
                continue;
            }
            let deferred = mem::take(&mut self.spaces[li].deferred);
            if !deferred.is_empty() {
                self.recv_datagrams(ctx, deferred, true, now);
            }
        }
    }

    fn recv_datagrams(
        &mut self,
        ctx: &mut Context,
        datagrams: Vec<Datagram>,
        deferred: bool,
        now: u64,
    ) {
        trace!(self.log, "recv datagrams"; "count" => datagrams.len(), "deferred" => deferred);
        let mut batch: Vec<PendingPacket> = Vec::new();
        let mut update_idle = false;

        for datagram in datagrams {
            if !deferred {
                self.stats.recv.total_bytes += datagram.data.len() as u64;
                if !self.flags.source_address_validated {
                    self.send.increment_allowance(datagram.data.len());
                }
            }
            if datagram.remote != self.remote {
                // Migration is unimplemented; a new 4-tuple is a violation.
                warn!(self.log, "datagram from changed remote address";
                      "remote" => %datagram.remote);
                self.stats.recv.dropped_packets += 1;
                if self.flags.connected {
                    self.transport_error(ctx, TransportError::PROTOCOL_VIOLATION, now);
                }
                continue;
            }

            let mut pending = Some(datagram.data);
            while let Some(chunk) = pending.take() {
                if chunk.is_empty() {
                    break;
                }
                let (decode, rest) = match PartialDecode::new(chunk, ctx.config.local_cid_len) {
                    Ok(x) => x,
                    Err(PacketDecodeError::UnsupportedVersion { version }) => {
                        if version == VERSION_NEGOTIATION
                            && self.side == Side::Client
                            && !self.flags.got_first_server_response
                        {
                            // Only one version exists, so negotiation means
                            // the peer doesn't speak it.
                            debug!(self.log, "version negotiation received; abandoning");
                            self.stats.version_negotiation = true;
                            self.close_silently(ctx, CloseStatus::VersionNegotiationError, now);
                        } else {
                            debug!(self.log, "dropping packet with invalid version";
                                   "version" => version);
                            self.stats.recv.dropped_packets += 1;
                        }
                        break;
                    }
                    Err(e) => {
                        trace!(self.log, "header decode failed"; "reason" => %e);
                        self.stats.recv.dropped_packets += 1;
                        break;
                    }
                };
                self.stats.recv.total_packets += 1;

                if decode.long_ty == Some(LongType::Retry) {
                    if !batch.is_empty() {
                        update_idle |= self.process_batch(ctx, &mut batch, now);
                    }
                    update_idle |= self.recv_retry(ctx, decode, now);
                    // Nothing may follow a Retry in the same datagram.
                    break;
                }

                let level = match decode.long_ty {
                    Some(LongType::Initial) => EncryptLevel::Initial,
                    Some(LongType::ZeroRtt) => EncryptLevel::ZeroRtt,
                    Some(LongType::Handshake) => EncryptLevel::Handshake,
                    Some(LongType::Retry) => unreachable!(),
                    None => EncryptLevel::OneRtt,
                };

                if self.is_server()
                    && level == EncryptLevel::Initial
                    && !self.flags.source_address_validated
                    && !decode.token.is_empty()
                {
                    let odcid = ctx
                        .listen_keys
                        .as_ref()
                        .and_then(|keys| keys.token.decrypt(&decode.token).ok());
                    match odcid {
                        Some(odcid) => {
                            info!(self.log, "source address validated via Initial token");
                            self.cids.orig_cid = Some(odcid);
                            self.flags.source_address_validated = true;
                            self.send.set_allowance_unlimited();
                        }
                        None => {
                            debug!(self.log, "dropping Initial with invalid token");
                            self.stats.recv.dropped_packets += 1;
                            pending = rest;
                            continue;
                        }
                    }
                }

                if level > self.read_level {
                    // No key yet: park the rest of the datagram for later.
                    let li = level as usize;
                    if self.spaces[li].deferred.len() >= MAX_DEFERRED_DATAGRAMS {
                        debug!(self.log, "max deferred datagram count reached";
                               "level" => level);
                        self.stats.recv.dropped_packets += 1;
                    } else {
                        debug!(self.log, "deferring datagram"; "level" => level);
                        // Not counted until it is actually processed.
                        self.stats.recv.total_packets -= 1;
                        let mut whole = decode.packet;
                        if let Some(rest) = rest {
                            whole.unsplit(rest);
                        }
                        self.spaces[li].deferred.push(Datagram {
                            remote: datagram.remote,
                            data: whole,
                        });
                    }
                    break;
                }
                if self.keys[level as usize].is_none() {
                    trace!(self.log, "dropping packet for discarded key"; "level" => level);
                    self.stats.recv.dropped_packets += 1;
                    pending = rest;
                    continue;
                }

                let pn_offset = decode.pn_offset;
                if decode.packet.len() < pn_offset + 4 + HP_SAMPLE_SIZE {
                    trace!(self.log, "packet too short for HP sample");
                    self.stats.recv.dropped_packets += 1;
                    pending = rest;
                    continue;
                }
                let mut sample = [0; HP_SAMPLE_SIZE];
                sample
                    .copy_from_slice(&decode.packet[pn_offset + 4..pn_offset + 4 + HP_SAMPLE_SIZE]);

                if !decode.is_short && !batch.is_empty() {
                    // Masks are computed per key, so a long-header packet
                    // flushes the accumulated short-header run first.
                    update_idle |= self.process_batch(ctx, &mut batch, now);
                }
                batch.push(PendingPacket {
                    data: decode.packet,
                    pn_offset,
                    is_short: decode.is_short,
                    level,
                    dst_cid: decode.dst_cid,
                    src_cid: decode.src_cid,
                    sample,
                });
                if !decode.is_short || batch.len() >= MAX_CRYPTO_BATCH {
                    update_idle |= self.process_batch(ctx, &mut batch, now);
                }
                pending = rest;
            }
        }

        if !batch.is_empty() {
            update_idle |= self.process_batch(ctx, &mut batch, now);
        }
        if update_idle {
            self.reset_idle_timeout(ctx, now);
        }
    }

    /// Compute header-protection masks for the whole batch in one go, then
    /// finish each packet in order.
    fn process_batch(
        &mut self,
        ctx: &mut Context,
        batch: &mut Vec<PendingPacket>,
        now: u64,
    ) -> bool {
        let packets = mem::take(batch);
        debug_assert!(!packets.is_empty());
        let level = packets[0].level;
        let masks = match self.keys[level as usize] {
            Some(ref keys) => {
                let samples: Vec<[u8; HP_SAMPLE_SIZE]> =
                    packets.iter().map(|p| p.sample).collect();
                keys.remote.hp_masks(&samples)
            }
            None => {
                trace!(self.log, "dropping batch for discarded key"; "level" => level);
                self.stats.recv.dropped_packets += packets.len() as u64;
                return false;
            }
        };

        let mut update_idle = false;
        for (packet, mask) in packets.into_iter().zip(masks) {
            match self.recv_packet(ctx, packet, mask, now) {
                Some(completely_valid) => {
                    update_idle |= completely_valid;
                    self.stats.recv.valid_packets += 1;
                }
                None => self.stats.recv.dropped_packets += 1,
            }
        }
        update_idle
    }

    fn recv_packet(
        &mut self,
        ctx: &mut Context,
        mut p: PendingPacket,
        mask: [u8; 5],
        now: u64,
    ) -> Option<bool> {
        let level = p.level;
        let li = level as usize;

        // Reveal the packet number length, then the packet number itself.
        if p.is_short {
            p.data[0] ^= mask[0] & 0x1f;
        } else {
            p.data[0] ^= mask[0] & 0x0f;
        }
        let first = p.data[0];
        let pn_len = (first & 0x03) as usize + 1;
        for i in 0..pn_len {
            p.data[p.pn_offset + i] ^= mask[1 + i];
        }
        let mut truncated = 0u64;
        for i in 0..pn_len {
            truncated = (truncated << 8) | u64::from(p.data[p.pn_offset + i]);
        }
        let number = packet::decompress(self.spaces[li].next_recv_pn, truncated, pn_len);
        if number > VAR_INT_MAX {
            trace!(self.log, "packet number too big"; "pn" => number);
            return None;
        }
        if p.data.len() - p.pn_offset - pn_len < AEAD_TAG_SIZE {
            trace!(self.log, "payload shorter than encryption tag");
            return None;
        }

        // Key phase: pick old keys for stragglers, derive new ones for a
        // peer-initiated update.
        let phase_bit = p.is_short && first & 0x04 != 0;
        let mut use_key = UseKey::Current;
        if p.is_short
            && level == EncryptLevel::OneRtt
            && phase_bit != self.spaces[li].current_key_phase
        {
            if self.spaces[li].awaiting_key_phase_confirmation
                || number < self.spaces[li].read_key_phase_start_pn
            {
                if self.prev_1rtt_keys.is_none() {
                    trace!(self.log, "no old keys for key phase");
                    return None;
                }
                trace!(self.log, "using old key to decrypt");
                use_key = UseKey::Old;
            } else {
                if self.next_1rtt_keys.is_none() {
                    debug!(self.log, "possible peer initiated key update"; "pn" => number);
                    self.next_1rtt_keys = Some(self.keys[li].as_ref().unwrap().update());
                }
                use_key = UseKey::New;
            }
        }

        // A failed decryption scribbles over the buffer, so the candidate
        // stateless reset token has to be saved first.
        let mut reset_tail = None;
        if self.side == Side::Client && p.is_short && p.data.len() >= MIN_STATELESS_RESET_SIZE {
            let mut tail = [0; RESET_TOKEN_SIZE];
            tail.copy_from_slice(&p.data[p.data.len() - RESET_TOKEN_SIZE..]);
            reset_tail = Some(tail);
        }

        let header = p.data.split_to(p.pn_offset + pn_len);
        let mut payload = p.data;
        let decrypted = {
            let key = match use_key {
                UseKey::Current => &self.keys[li].as_ref().unwrap().remote,
                UseKey::Old => &self.prev_1rtt_keys.as_ref().unwrap().remote,
                UseKey::New => &self.next_1rtt_keys.as_ref().unwrap().remote,
            };
            key.decrypt(number, &header, &mut payload)
        };
        if decrypted.is_err() {
            if let Some(tail) = reset_tail {
                if self.cids.matches_reset_token(&tail) {
                    info!(self.log, "received stateless reset");
                    self.close_silently(ctx, CloseStatus::Aborted, now);
                    return None;
                }
            }
            self.stats.recv.decryption_failures += 1;
            debug!(self.log, "packet decryption failure"; "pn" => number);
            return None;
        }

        // Reserved bits are only checkable on an authenticated packet.
        let reserved = if p.is_short { first & 0x18 } else { first & 0x0c };
        if reserved != 0 {
            debug!(self.log, "non-zero reserved header bits");
            self.transport_error(ctx, TransportError::PROTOCOL_VIOLATION, now);
            return None;
        }

        if !self.spaces[li].ack_tracker.add(number) {
            trace!(self.log, "duplicate packet"; "pn" => number);
            self.stats.recv.duplicate_packets += 1;
            return None;
        }

        if !p.is_short {
            if level == EncryptLevel::Initial && self.side == Side::Client && !self.flags.connected
            {
                // Adopt the server's chosen source CID.
                if self.cids.update_dest(p.src_cid) {
                    trace!(self.log, "got remote connection id"; "cid" => p.src_cid);
                }
            }
            if level == EncryptLevel::Handshake && self.is_server() {
                // A Handshake packet proves the client holds the keys, so
                // Initial keys are done and the address is validated.
                self.discard_keys(EncryptLevel::Initial);
                if !self.flags.source_address_validated {
                    info!(self.log, "source address validated via Handshake packet");
                    self.flags.source_address_validated = true;
                    self.send.set_allowance_unlimited();
                }
            }
        }

        if p.is_short && level == EncryptLevel::OneRtt {
            match use_key {
                UseKey::New => {
                    let new = self.next_1rtt_keys.take().unwrap();
                    self.prev_1rtt_keys = self.keys[li].replace(new);
                    let space = &mut self.spaces[li];
                    space.current_key_phase = phase_bit;
                    space.read_key_phase_start_pn = number;
                    space.key_phase_start_send_pn = space.next_send_pn;
                    space.awaiting_key_phase_confirmation = true;
                    debug!(self.log, "key phase rotated"; "pn" => number);
                }
                UseKey::Current if number < self.spaces[li].read_key_phase_start_pn => {
                    self.spaces[li].read_key_phase_start_pn = number;
                }
                _ => {}
            }
        }

        let (ack_eliciting, ack_immediately) =
            match self.recv_payload(ctx, level, payload.freeze(), now) {
                Ok(x) => x,
                Err(()) => return None,
            };

        self.recv_post_processing(ctx, &p.dst_cid);

        let new_largest = self.spaces[li].next_recv_pn <= number;
        if p.is_short && new_largest {
            let packet_spin = first & 0x20 != 0;
            self.send.spin_bit = if self.is_server() {
                packet_spin
            } else {
                !packet_spin
            };
        }

        if self.flags.handle_shutdown || self.flags.handle_closed {
            trace!(self.log, "not acked; connection is closed"; "pn" => number);
        } else {
            let max_ack_delay_ms = self.max_ack_delay_ms;
            let timing = {
                let space = &mut self.spaces[li];
                if space.next_recv_pn <= number {
                    space.next_recv_pn = number + 1;
                }
                space
                    .ack_tracker
                    .ack_packet(number, now, ack_eliciting, ack_immediately)
            };
            match timing {
                AckTiming::Immediate => self.send.set_flag(SendFlags::ACK),
                AckTiming::Delayed => {
                    if self.timers.expiration(TimerType::AckDelay).is_none()
                        && !self.send.flags.contains(SendFlags::ACK)
                    {
                        self.timer_set(ctx, TimerType::AckDelay, max_ack_delay_ms, now);
                    }
                }
                AckTiming::None => {}
            }
        }
        Some(true)
    }

    fn frame_err(&mut self, ctx: &mut Context, code: TransportError, now: u64) -> Result<(), ()> {
        self.transport_error(ctx, code, now);
        Err(())
    }

    /// Walk the decrypted frames. Returns (ack eliciting, ack immediately),
    /// or Err after a transport error has been raised.
    fn recv_payload(
        &mut self,
        ctx: &mut Context,
        level: EncryptLevel,
        payload: Bytes,
        now: u64,
    ) -> Result<(bool, bool), ()> {
        let mut ack_eliciting = false;
        let mut ack_immediately = false;
        let closed = self.is_closed();

        for frame in frame::Iter::new(payload) {
            match frame {
                Frame::Padding => {}
                _ => trace!(self.log, "got frame"; "type" => frame.ty()),
            }
            let allowed = match level {
                EncryptLevel::Initial | EncryptLevel::Handshake => matches!(
                    frame,
                    Frame::Padding
                        | Frame::Ping
                        | Frame::Ack(_)
                        | Frame::Crypto(_)
                        | Frame::ConnectionClose(_)
                ),
                EncryptLevel::ZeroRtt => !matches!(frame, Frame::Ack(_)),
                EncryptLevel::OneRtt => true,
            };
            if !allowed {
                debug!(self.log, "disallowed frame type"; "type" => frame.ty());
                self.frame_err(ctx, TransportError::FRAME_ENCODING_ERROR, now)?;
            }
            if frame.is_ack_eliciting() {
                ack_eliciting = true;
            }

            match frame {
                Frame::Padding => {}
                Frame::Ping => {
                    ack_immediately = true;
                }
                Frame::Ack(ack) => {
                    let ack_delay_exponent = self
                        .peer_params
                        .as_ref()
                        .map_or(DEFAULT_ACK_DELAY_EXPONENT, |p| p.ack_delay_exponent);
                    let next_send_pn = self.spaces[level as usize].next_send_pn;
                    match self.loss.on_ack_received(
                        level,
                        &ack,
                        ack_delay_exponent,
                        next_send_pn,
                        now,
                        &mut self.rtt,
                    ) {
                        Ok(outcome) => self.apply_ack_outcome(ctx, level, outcome, now),
                        Err(code) => {
                            debug!(self.log, "invalid ACK frame");
                            self.frame_err(ctx, code, now)?;
                        }
                    }
                }
                Frame::Crypto(c) => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    let ready = match self.crypto_streams[level as usize].recv(c.offset, c.data) {
                        Ok(ready) => ready,
                        Err(code) => {
                            debug!(self.log, "invalid CRYPTO frame");
                            self.frame_err(ctx, code, now)?;
                            unreachable!();
                        }
                    };
                    if self.side == Side::Client && !self.flags.got_first_server_response {
                        self.flags.got_first_server_response = true;
                    }
                    if !ready.is_empty() {
                        let fed = {
                            let mut session = self.session.take();
                            let result = session
                                .as_mut()
                                .map(|s| s.read_handshake(level, &ready))
                                .unwrap_or(Ok(()));
                            self.session = session;
                            result
                        };
                        if let Err(code) = fed {
                            debug!(self.log, "TLS rejected handshake data"; "code" => code);
                            self.frame_err(ctx, code, now)?;
                        }
                        self.drive_tls(ctx, now);
                    }
                }
                Frame::NewToken { .. } => {
                    if closed {
                        continue;
                    }
                    // TODO: hand the token to a session cache for resumption.
                    debug!(self.log, "discarding NEW_TOKEN");
                    ack_immediately = true;
                }
                Frame::Stream(s) => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    self.recv_stream_frame(ctx, s, now)?;
                }
                Frame::ResetStream {
                    id,
                    error_code,
                    final_size,
                } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    self.recv_reset_stream(ctx, id, error_code, final_size, now)?;
                }
                Frame::StopSending { id, error_code } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    self.recv_stop_sending(ctx, id, error_code, now)?;
                }
                Frame::MaxStreamData { id, offset } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    self.recv_max_stream_data(ctx, id, offset, now)?;
                }
                Frame::StreamDataBlocked { id, offset } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    debug!(self.log, "peer blocked at stream level";
                           "stream" => id, "offset" => offset);
                    self.send.max_stream_data.insert(id);
                }
                Frame::MaxData(limit) => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    if limit > self.send.peer_max_data {
                        self.send.peer_max_data = limit;
                        // More allowance; push blocked data out.
                        self.send.set_flag(SendFlags::STREAM);
                        self.queue_flush_send(ctx);
                    }
                }
                Frame::MaxStreams {
                    directionality,
                    count,
                } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    if count > MAX_STREAM_COUNT {
                        self.frame_err(ctx, TransportError::STREAM_LIMIT_ERROR, now)?;
                    }
                    if self.streams.update_max_streams(directionality, count) {
                        self.emit(ctx, Event::StreamAvailable { directionality });
                    }
                }
                Frame::DataBlocked { offset } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    debug!(self.log, "peer blocked at connection level"; "offset" => offset);
                    self.send.set_flag(SendFlags::MAX_DATA);
                }
                Frame::StreamsBlocked {
                    directionality, ..
                } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    self.emit(ctx, Event::PeerNeedsStreams { directionality });
                }
                Frame::NewConnectionId(ncid) => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    if self.cids.dest_count() < ACTIVE_CID_LIMIT {
                        if self.cids.add_dest(ncid.id, ncid.sequence, ncid.reset_token) {
                            trace!(self.log, "destination CID added";
                                   "cid" => ncid.id, "sequence" => ncid.sequence);
                        }
                    } else {
                        warn!(self.log, "ignoring new CID from peer, at limit";
                              "limit" => ACTIVE_CID_LIMIT);
                    }
                }
                Frame::RetireConnectionId { sequence } => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    if let Some((removed, was_last)) = self.cids.remove_source_by_seq(sequence) {
                        ctx.connection_ids.remove(&removed.id);
                        ctx.connection_ids_initial.remove(&removed.id);
                        trace!(self.log, "source CID retired by peer"; "sequence" => sequence);
                        if was_last {
                            warn!(self.log, "last source CID retired");
                            self.try_close(
                                ctx,
                                CloseFlags::SILENT,
                                CloseError::WireError(TransportError::PROTOCOL_VIOLATION.0),
                                None,
                                now,
                            );
                        } else {
                            self.generate_new_source_cid(ctx, false);
                        }
                    }
                }
                Frame::PathChallenge(data) => {
                    if closed {
                        continue;
                    }
                    ack_immediately = true;
                    if self.send.last_path_challenge != Some(data) {
                        self.send.last_path_challenge = Some(data);
                        self.send.path_response = Some(data);
                        self.send.set_flag(SendFlags::PATH_RESPONSE);
                    }
                }
                Frame::PathResponse(_) => {
                    if closed {
                        continue;
                    }
                    // Path migration is not implemented; nothing to confirm.
                    ack_immediately = true;
                }
                Frame::ConnectionClose(cc) => {
                    ack_immediately = true;
                    let reason = String::from_utf8_lossy(&cc.reason).into_owned();
                    self.try_close(
                        ctx,
                        CloseFlags::REMOTE | CloseFlags::SEND_NOTIFICATION,
                        CloseError::WireError(cc.error_code),
                        Some(&reason),
                        now,
                    );
                    if self.flags.handle_closed {
                        break;
                    }
                }
                Frame::ApplicationClose(ac) => {
                    ack_immediately = true;
                    let reason = String::from_utf8_lossy(&ac.reason).into_owned();
                    self.try_close(
                        ctx,
                        CloseFlags::REMOTE
                            | CloseFlags::SEND_NOTIFICATION
                            | CloseFlags::APPLICATION,
                        CloseError::WireError(ac.error_code),
                        Some(&reason),
                        now,
                    );
                    if self.flags.handle_closed {
                        break;
                    }
                }
                Frame::Invalid(ty) => {
                    debug!(self.log, "received malformed frame"; "type" => ty);
                    self.frame_err(ctx, TransportError::FRAME_ENCODING_ERROR, now)?;
                }
            }
        }
        Ok((ack_eliciting, ack_immediately))
    }

    fn apply_ack_outcome(
        &mut self,
        ctx: &mut Context,
        level: EncryptLevel,
        outcome: AckOutcome,
        now: u64,
    ) {
        let li = level as usize;
        for acks in outcome.acked_acks {
            self.spaces[li].ack_tracker.ack_of_ack(&acks);
        }
        if let Some(largest) = outcome.largest_newly_acked {
            let space = &mut self.spaces[li];
            if level == EncryptLevel::OneRtt
                && space.awaiting_key_phase_confirmation
                && largest >= space.key_phase_start_send_pn
            {
                space.awaiting_key_phase_confirmation = false;
                trace!(self.log, "key phase confirmed");
            }
        }
        if !outcome.lost.is_empty() {
            let lost = outcome.lost;
            self.requeue_retransmits(level, lost);
            self.queue_flush_send(ctx);
        }
        self.set_loss_timer(ctx, now);
    }

    fn requeue_retransmits(&mut self, level: EncryptLevel, frames: Retransmits) {
        self.stats.send.retransmitted_packets += 1;
        let li = level as usize;
        if !frames.crypto.is_empty() {
            self.send.set_flag(SendFlags::CRYPTO);
            for c in frames.crypto {
                self.send.crypto[li].push_back(c);
            }
        }
        if !frames.stream.is_empty() {
            self.send.set_flag(SendFlags::STREAM);
            for s in frames.stream {
                self.send.stream.push_back(s);
            }
        }
        self.send.reset_stream.extend(frames.reset_stream);
        self.send.stop_sending.extend(frames.stop_sending);
        if frames.flags.contains(SendFlags::NEW_CONNECTION_ID) {
            // Not tracked per CID; re-announce everything the peer has not
            // picked up yet.
            for cid in self.cids.source_cids_mut() {
                if cid.sequence > 0 && !cid.used_by_peer {
                    cid.needs_to_send = true;
                }
            }
        }
        if frames.flags.contains(SendFlags::RETIRE_CONNECTION_ID) {
            for cid in self.cids.dest_cids_mut() {
                if cid.retired {
                    cid.needs_to_send = true;
                }
            }
        }
        self.send.flags.insert(frames.flags);
        if self.is_closed() {
            self.send.flags.restrict_to_closing();
        }
    }

    // ---------------------------------------------------------------------
    // Stream frame handling
    // ---------------------------------------------------------------------

    fn recv_stream_frame(
        &mut self,
        ctx: &mut Context,
        frame: frame::Stream,
        now: u64,
    ) -> Result<(), ()> {
        let id = frame.id;
        if id.directionality() == Directionality::Uni && id.initiator() == self.side {
            debug!(self.log, "STREAM frame on send-only stream"; "stream" => id);
            return self.frame_err(ctx, TransportError::STREAM_STATE_ERROR, now);
        }
        let max_data = self.send.max_data;
        let data_recvd = self.data_recvd;
        let outcome: Result<Option<u64>, TransportError> = match self.streams.get_for_peer(id) {
            Err(code) => Err(code),
            Ok(None) => Ok(None),
            Ok(Some(stream)) => match stream.recv_mut() {
                None => Err(TransportError::STREAM_STATE_ERROR),
                Some(rs) => {
                    let end = frame.offset + frame.data.len() as u64;
                    let final_size_ok = match rs.final_size() {
                        Some(final_size) => {
                            end <= final_size && (!frame.fin || end == final_size)
                        }
                        None => true,
                    };
                    if !final_size_ok {
                        Err(TransportError::FINAL_SIZE_ERROR)
                    } else {
                        let new_bytes = end.saturating_sub(rs.limit());
                        if end > rs.max_data || data_recvd + new_bytes > max_data {
                            Err(TransportError::FLOW_CONTROL_ERROR)
                        } else {
                            if frame.fin {
                                if let RecvState::Recv { ref mut size } = rs.state {
                                    *size = Some(end);
                                }
                            }
                            rs.buffer(frame.offset, frame.data);
                            Ok(Some(new_bytes))
                        }
                    }
                }
            },
        };
        match outcome {
            Err(code) => {
                debug!(self.log, "illegal stream frame"; "stream" => id);
                self.frame_err(ctx, code, now)
            }
            Ok(None) => {
                trace!(self.log, "frame for closed stream"; "stream" => id);
                Ok(())
            }
            Ok(Some(new_bytes)) => {
                self.data_recvd += new_bytes;
                self.readable_streams.insert(id);
                ctx.readable_conns.insert(self.handle);
                Ok(())
            }
        }
    }

    fn recv_reset_stream(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        error_code: u64,
        final_size: u64,
        now: u64,
    ) -> Result<(), ()> {
        if id.directionality() == Directionality::Uni && id.initiator() == self.side {
            return self.frame_err(ctx, TransportError::STREAM_STATE_ERROR, now);
        }
        let outcome: Result<Option<u64>, TransportError> = match self.streams.get_for_peer(id) {
            Err(code) => Err(code),
            Ok(None) => Ok(None),
            Ok(Some(stream)) => match stream.recv_mut() {
                None => Err(TransportError::STREAM_STATE_ERROR),
                Some(rs) => {
                    if rs.final_size().map_or(false, |sz| sz != final_size) {
                        Err(TransportError::FINAL_SIZE_ERROR)
                    } else {
                        let prior = rs.limit();
                        if !rs.is_closed() {
                            rs.state = RecvState::ResetRecvd {
                                size: final_size,
                                error_code,
                            };
                        }
                        Ok(Some(final_size.saturating_sub(prior)))
                    }
                }
            },
        };
        match outcome {
            Err(code) => self.frame_err(ctx, code, now),
            Ok(None) => Ok(()),
            Ok(Some(new_bytes)) => {
                self.data_recvd += new_bytes;
                self.readable_streams.insert(id);
                ctx.readable_conns.insert(self.handle);
                self.streams.note_closed(id);
                Ok(())
            }
        }
    }

    fn recv_stop_sending(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        error_code: u64,
        now: u64,
    ) -> Result<(), ()> {
        if id.directionality() == Directionality::Uni && id.initiator() != self.side {
            // STOP_SENDING only makes sense against our sending half.
            return self.frame_err(ctx, TransportError::STREAM_STATE_ERROR, now);
        }
        let outcome: Result<Option<(u64, u64)>, TransportError> = match self.streams.get_for_peer(id)
        {
            Err(code) => Err(code),
            Ok(None) => Ok(None),
            Ok(Some(stream)) => match stream.send_mut() {
                None => Err(TransportError::STREAM_STATE_ERROR),
                Some(ss) => {
                    if ss.state.was_reset() {
                        Ok(None)
                    } else {
                        ss.state = SendState::ResetSent {
                            stop_reason: Some(error_code),
                        };
                        Ok(Some((error_code, ss.offset)))
                    }
                }
            },
        };
        match outcome {
            Err(code) => self.frame_err(ctx, code, now),
            Ok(None) => Ok(()),
            Ok(Some((error_code, final_size))) => {
                self.send.reset_stream.push((id, error_code, final_size));
                self.queue_flush_send(ctx);
                Ok(())
            }
        }
    }

    fn recv_max_stream_data(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        offset: u64,
        now: u64,
    ) -> Result<(), ()> {
        if id.directionality() == Directionality::Uni && id.initiator() != self.side {
            debug!(self.log, "MAX_STREAM_DATA on receive-only stream");
            return self.frame_err(ctx, TransportError::STREAM_STATE_ERROR, now);
        }
        let outcome: Result<Option<bool>, TransportError> = match self.streams.get_for_peer(id) {
            Err(code) => Err(code),
            Ok(None) => Ok(None),
            Ok(Some(stream)) => match stream.send_mut() {
                None => Err(TransportError::STREAM_STATE_ERROR),
                Some(ss) => {
                    if offset > ss.max_data {
                        let was_blocked = ss.offset == ss.max_data;
                        ss.max_data = offset;
                        Ok(Some(was_blocked))
                    } else {
                        Ok(Some(false))
                    }
                }
            },
        };
        match outcome {
            Err(code) => self.frame_err(ctx, code, now),
            Ok(None) => Ok(()),
            Ok(Some(was_blocked)) => {
                if was_blocked {
                    self.emit(ctx, Event::StreamWritable { stream: id });
                    self.queue_flush_send(ctx);
                }
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Retry
    // ---------------------------------------------------------------------

    fn recv_retry(&mut self, ctx: &mut Context, decode: PartialDecode, now: u64) -> bool {
        if self.is_server() {
            debug!(self.log, "dropping Retry sent to server");
            self.stats.recv.dropped_packets += 1;
            return false;
        }
        if self.flags.got_first_server_response {
            debug!(self.log, "dropping Retry after server response");
            self.stats.recv.dropped_packets += 1;
            return false;
        }
        let odcid = match decode.retry_odcid {
            Some(x) => x,
            None => return false,
        };
        if odcid != self.cids.first_dest().id {
            debug!(self.log, "dropping Retry with invalid ODCID");
            self.stats.recv.dropped_packets += 1;
            return false;
        }
        let body_len = decode.packet.len() - RESET_TOKEN_SIZE;
        if crypto::retry_tag(&odcid, &decode.packet[..body_len]) != decode.retry_tag {
            debug!(self.log, "dropping Retry with bad integrity tag");
            self.stats.recv.dropped_packets += 1;
            return false;
        }
        if decode.token.is_empty() {
            debug!(self.log, "dropping Retry with empty token");
            self.stats.recv.dropped_packets += 1;
            return false;
        }

        info!(self.log, "processing Retry"; "new_cid" => decode.src_cid);
        // Future Initials carry the server's token.
        self.send.initial_token = decode.token.clone();
        // The original CID authenticates the server's transport parameters
        // later on.
        self.cids.take_orig_for_retry();
        self.cids.update_dest(decode.src_cid);
        self.flags.got_first_server_response = true;
        self.flags.received_retry_packet = true;
        self.stats.stateless_retry = true;

        // Initial keys restart from the server-chosen CID.
        let new_dcid = self.cids.first_dest().id;
        self.keys[EncryptLevel::Initial as usize] =
            Some(Keys::new_initial(&new_dcid, Side::Client));

        self.restart(ctx, false, now);
        true
    }

    // ---------------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------------

    pub(crate) fn queue_flush_send(&self, ctx: &mut Context) {
        if !self.send.has_pending() && !self.any_acks_pending() {
            return;
        }
        self.queue_oper(ctx, Operation::FlushSend);
    }

    fn any_acks_pending(&self) -> bool {
        self.spaces
            .iter()
            .any(|space| space.ack_tracker.ack_elicited && space.ack_tracker.has_pending_acks())
    }

    /// Assemble and emit packets. Returns whether more remain so the drain
    /// re-queues the flush instead of starving other connections.
    fn flush_send(&mut self, ctx: &mut Context, now: u64, immediate: bool) -> bool {
        if self.flags.handle_closed || self.state == State::Drained {
            return false;
        }
        let burst = if immediate { 1 } else { 8 };
        let mut sent = 0;
        while sent < burst {
            let packet = match self.next_packet(ctx, now) {
                Some(x) => x,
                None => break,
            };
            ctx.io.push_back(Io::Transmit {
                destination: self.remote,
                packet: packet.into(),
            });
            sent += 1;
        }
        if sent > 0 {
            self.reset_idle_timeout(ctx, now);
            self.set_loss_timer(ctx, now);
        }
        sent == burst && (self.send.has_pending() || self.any_acks_pending())
    }

    fn choose_send_level(&self) -> Option<EncryptLevel> {
        if self.send.flags.intersects(SendFlags::CLOSING_MASK) {
            for &level in &[
                EncryptLevel::OneRtt,
                EncryptLevel::Handshake,
                EncryptLevel::Initial,
            ] {
                if self.keys[level as usize].is_some() {
                    return Some(level);
                }
            }
            return None;
        }
        for &level in &[EncryptLevel::Initial, EncryptLevel::Handshake] {
            let li = level as usize;
            if self.keys[li].is_none() {
                continue;
            }
            let acks_due = self.send.flags.contains(SendFlags::ACK)
                && self.spaces[li].ack_tracker.has_pending_acks()
                && self.spaces[li].ack_tracker.ack_elicited;
            if !self.send.crypto[li].is_empty() || acks_due {
                return Some(level);
            }
        }
        let li = EncryptLevel::OneRtt as usize;
        if self.keys[li].is_some() {
            let acks_due = self.send.flags.contains(SendFlags::ACK)
                && self.spaces[li].ack_tracker.has_pending_acks();
            let work = !self.send.crypto[li].is_empty()
                || !self.send.stream.is_empty()
                || !self.send.reset_stream.is_empty()
                || !self.send.stop_sending.is_empty()
                || !self.send.max_stream_data.is_empty()
                || self.send.flags.intersects(SendFlags::PING)
                || self.send.flags.intersects(SendFlags::PATH_RESPONSE)
                || self.send.flags.intersects(SendFlags::NEW_CONNECTION_ID)
                || self.send.flags.intersects(SendFlags::RETIRE_CONNECTION_ID)
                || self.send.flags.intersects(SendFlags::MAX_DATA)
                || self.send.flags.intersects(SendFlags::MAX_STREAMS_BIDI)
                || self.send.flags.intersects(SendFlags::MAX_STREAMS_UNI)
                || acks_due;
            if work {
                return Some(EncryptLevel::OneRtt);
            }
        }
        // Handshake levels may still owe a PING probe.
        if self.send.flags.contains(SendFlags::PING) {
            for &level in &[EncryptLevel::Handshake, EncryptLevel::Initial] {
                if self.keys[level as usize].is_some() {
                    return Some(level);
                }
            }
        }
        None
    }

    fn next_packet(&mut self, ctx: &mut Context, now: u64) -> Option<Vec<u8>> {
        let level = self.choose_send_level()?;
        let li = level as usize;
        let mtu = self.send.path_mtu as usize;
        if !self.send.allowance_permits(mtu) {
            trace!(self.log, "amplification allowance exhausted");
            return None;
        }

        let number = self.spaces[li].next_send_pn;
        let pn = PacketNumber::new(number, self.spaces[li].largest_acked.unwrap_or(0));
        let dst_cid = self.cids.current_dest().id;
        let header = match level {
            EncryptLevel::Initial => Header::Initial {
                dst_cid,
                src_cid: self.cids.source_cids().last().unwrap().id,
                token: self.send.initial_token.clone(),
                number: pn,
            },
            EncryptLevel::Handshake | EncryptLevel::ZeroRtt => Header::Long {
                ty: if level == EncryptLevel::Handshake {
                    LongType::Handshake
                } else {
                    LongType::ZeroRtt
                },
                dst_cid,
                src_cid: self.cids.source_cids().last().unwrap().id,
                number: pn,
            },
            EncryptLevel::OneRtt => Header::Short {
                dst_cid,
                number: pn,
                spin: self.send.spin_bit,
                key_phase: self.spaces[li].current_key_phase,
            },
        };
        let mut buf = Vec::with_capacity(mtu);
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        let max_size = mtu - AEAD_TAG_SIZE;

        let mut sent = Retransmits::default();
        let mut acks_written = RangeSet::new();

        if self.send.flags.intersects(SendFlags::CLOSING_MASK) {
            let max_reason = max_size - buf.len() - 32;
            let reason = self
                .close_reason
                .as_ref()
                .map(|r| Bytes::from(r.clone().into_bytes()))
                .unwrap_or_else(Bytes::new);
            if self.send.flags.contains(SendFlags::APPLICATION_CLOSE)
                && level == EncryptLevel::OneRtt
            {
                frame::ApplicationClose {
                    error_code: self.close_error_code,
                    reason,
                }
                .encode(&mut buf, max_reason);
            } else {
                // Application details must not leak at handshake levels.
                let error_code = if self.send.flags.contains(SendFlags::APPLICATION_CLOSE) {
                    TransportError::NO_ERROR.0
                } else {
                    self.close_error_code
                };
                frame::ConnectionClose {
                    error_code,
                    frame_type: 0,
                    reason,
                }
                .encode(&mut buf, max_reason);
            }
            self.send.clear_flag(SendFlags::CONNECTION_CLOSE);
            self.send.clear_flag(SendFlags::APPLICATION_CLOSE);
        } else {
            // ACK
            let want_ack = self.send.flags.contains(SendFlags::ACK)
                || self.spaces[li].ack_tracker.ack_elicited;
            if want_ack && self.spaces[li].ack_tracker.has_pending_acks() {
                let tracker = &mut self.spaces[li].ack_tracker;
                let delay_us = now.saturating_sub(tracker.largest_received_time);
                let delay = delay_us >> u32::from(DEFAULT_ACK_DELAY_EXPONENT);
                frame::Ack::encode(delay, &tracker.to_ack, &mut buf);
                acks_written = tracker.to_ack.clone();
                tracker.on_ack_sent();
            }
            if !self.any_acks_pending() {
                self.send.clear_flag(SendFlags::ACK);
            }

            // CRYPTO
            while buf.len() + 16 < max_size {
                let mut c = match self.send.crypto[li].pop_front() {
                    Some(x) => x,
                    None => break,
                };
                let budget = max_size - buf.len() - 16;
                if c.data.len() > budget {
                    let chunk = frame::Crypto {
                        offset: c.offset,
                        data: c.data.split_to(budget),
                    };
                    c.offset += budget as u64;
                    chunk.encode(&mut buf);
                    sent.crypto.push(chunk);
                    self.send.crypto[li].push_front(c);
                    break;
                }
                c.encode(&mut buf);
                sent.crypto.push(c);
            }
            if !self.send.has_pending_crypto() {
                self.send.clear_flag(SendFlags::CRYPTO);
            }

            // PING
            if self.send.flags.contains(SendFlags::PING) && buf.len() + 1 < max_size {
                self.send.clear_flag(SendFlags::PING);
                buf.put_var(frame::Type::PING.0);
                sent.flags.insert(SendFlags::PING);
            }

            if level == EncryptLevel::OneRtt {
                self.write_1rtt_frames(ctx, &mut buf, max_size, &mut sent);
            }
        }

        if buf.len() == header_len {
            return None;
        }

        let ack_eliciting = !sent.is_empty();

        // Client Initials pad out to defeat amplification attacks.
        if level == EncryptLevel::Initial && self.side == Side::Client {
            let target = MIN_INITIAL_SIZE - AEAD_TAG_SIZE;
            if buf.len() < target {
                buf.resize(target, frame::Type::PADDING.0 as u8);
            }
        }
        if partial.len_pos.is_some() {
            partial.set_payload_length(&mut buf);
        }
        {
            let keys = self.keys[li].as_ref().unwrap();
            keys.local.encrypt(number, &mut buf, header_len);
            partial.finish(&mut buf, &keys.local);
        }

        self.spaces[li].next_send_pn = number + 1;
        trace!(self.log, "sending packet"; "pn" => number, "level" => level,
               "len" => buf.len());
        self.loss.on_packet_sent(
            level,
            number,
            SentPacket {
                time: now,
                bytes: if ack_eliciting {
                    cmp::min(buf.len(), usize::from(u16::MAX)) as u16
                } else {
                    0
                },
                ack_eliciting,
                acks: acks_written,
                retransmits: sent,
            },
        );
        self.send.on_bytes_sent(buf.len());
        self.stats.send.total_packets += 1;
        self.stats.send.total_bytes += buf.len() as u64;
        Some(buf)
    }

    fn write_1rtt_frames(
        &mut self,
        ctx: &mut Context,
        buf: &mut Vec<u8>,
        max_size: usize,
        sent: &mut Retransmits,
    ) {
        // PATH_RESPONSE
        if self.send.flags.contains(SendFlags::PATH_RESPONSE) && buf.len() + 9 < max_size {
            if let Some(data) = self.send.path_response.take() {
                trace!(self.log, "PATH_RESPONSE");
                buf.put_var(frame::Type::PATH_RESPONSE.0);
                buf.extend_from_slice(&data);
            }
            self.send.clear_flag(SendFlags::PATH_RESPONSE);
        }

        // NEW_CONNECTION_ID
        if self.send.flags.contains(SendFlags::NEW_CONNECTION_ID) {
            let reset_key = ctx.reset_key.clone();
            let mut all_sent = true;
            for cid in self.cids.source_cids_mut() {
                if !cid.needs_to_send {
                    continue;
                }
                if buf.len() + 4 + cid.id.len() + RESET_TOKEN_SIZE >= max_size {
                    all_sent = false;
                    break;
                }
                cid.needs_to_send = false;
                frame::NewConnectionId {
                    sequence: cid.sequence,
                    retire_prior_to: 0,
                    id: cid.id,
                    reset_token: crypto::reset_token_for(&reset_key, &cid.id),
                }
                .encode(buf);
                sent.flags.insert(SendFlags::NEW_CONNECTION_ID);
            }
            if all_sent {
                self.send.clear_flag(SendFlags::NEW_CONNECTION_ID);
            }
        }

        // RETIRE_CONNECTION_ID
        if self.send.flags.contains(SendFlags::RETIRE_CONNECTION_ID) {
            let mut all_sent = true;
            for cid in self.cids.dest_cids_mut() {
                if !(cid.retired && cid.needs_to_send) {
                    continue;
                }
                if buf.len() + 10 >= max_size {
                    all_sent = false;
                    break;
                }
                cid.needs_to_send = false;
                buf.put_var(frame::Type::RETIRE_CONNECTION_ID.0);
                buf.put_var(cid.sequence);
                sent.flags.insert(SendFlags::RETIRE_CONNECTION_ID);
            }
            if all_sent {
                self.send.clear_flag(SendFlags::RETIRE_CONNECTION_ID);
            }
        }

        // MAX_DATA
        if self.send.flags.contains(SendFlags::MAX_DATA) && buf.len() + 9 < max_size {
            self.send.clear_flag(SendFlags::MAX_DATA);
            sent.flags.insert(SendFlags::MAX_DATA);
            buf.put_var(frame::Type::MAX_DATA.0);
            buf.put_var(self.send.max_data);
        }

        // MAX_STREAMS
        if self.send.flags.contains(SendFlags::MAX_STREAMS_BIDI) && buf.len() + 9 < max_size {
            self.send.clear_flag(SendFlags::MAX_STREAMS_BIDI);
            sent.flags.insert(SendFlags::MAX_STREAMS_BIDI);
            buf.put_var(frame::Type::MAX_STREAMS_BIDI.0);
            buf.put_var(self.streams.max_remote(Directionality::Bi));
        }
        if self.send.flags.contains(SendFlags::MAX_STREAMS_UNI) && buf.len() + 9 < max_size {
            self.send.clear_flag(SendFlags::MAX_STREAMS_UNI);
            sent.flags.insert(SendFlags::MAX_STREAMS_UNI);
            buf.put_var(frame::Type::MAX_STREAMS_UNI.0);
            buf.put_var(self.streams.max_remote(Directionality::Uni));
        }

        // MAX_STREAM_DATA
        let ids: Vec<StreamId> = self.send.max_stream_data.iter().cloned().collect();
        for id in ids {
            if buf.len() + 17 >= max_size {
                break;
            }
            self.send.max_stream_data.remove(&id);
            let window = match self.streams.get_mut(id).and_then(|s| s.recv()) {
                Some(rs) if !rs.is_finished() => rs.max_data,
                _ => continue,
            };
            buf.put_var(frame::Type::MAX_STREAM_DATA.0);
            buf.put_var(id.0);
            buf.put_var(window);
        }

        // RESET_STREAM
        while buf.len() + 19 < max_size {
            let (id, error_code, final_size) = match self.send.reset_stream.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(self.log, "RESET_STREAM"; "stream" => id);
            sent.reset_stream.push((id, error_code, final_size));
            buf.put_var(frame::Type::RESET_STREAM.0);
            buf.put_var(id.0);
            buf.put_var(error_code);
            buf.put_var(final_size);
        }

        // STOP_SENDING
        while buf.len() + 11 < max_size {
            let (id, error_code) = match self.send.stop_sending.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(self.log, "STOP_SENDING"; "stream" => id);
            sent.stop_sending.push((id, error_code));
            buf.put_var(frame::Type::STOP_SENDING.0);
            buf.put_var(id.0);
            buf.put_var(error_code);
        }

        // STREAM, gated on congestion
        while buf.len() + 25 < max_size {
            if self.loss.bytes_in_flight + buf.len() as u64 >= self.loss.congestion.window {
                trace!(self.log, "congestion blocked");
                break;
            }
            let mut pending = match self.send.stream.pop_front() {
                Some(x) => x,
                None => break,
            };
            let gone = self
                .streams
                .get_mut(pending.id)
                .and_then(|s| s.send())
                .map_or(true, |ss| ss.state.was_reset());
            if gone {
                continue;
            }
            let budget = max_size - buf.len() - 25;
            let len = cmp::min(pending.data.len(), budget);
            let data = pending.data.split_to(len);
            let fin = pending.fin && pending.data.is_empty();
            trace!(self.log, "STREAM"; "id" => pending.id, "off" => pending.offset,
                   "len" => len, "fin" => fin);
            let written = frame::Stream {
                id: pending.id,
                offset: pending.offset,
                fin,
                data,
            };
            written.encode(true, buf);
            sent.stream.push(written);
            if !pending.data.is_empty() {
                pending.offset += len as u64;
                self.send.stream.push_front(pending);
                break;
            }
        }
        if self.send.stream.is_empty() {
            self.send.clear_flag(SendFlags::STREAM);
        }
    }

    // ---------------------------------------------------------------------
    // Application stream operations
    // ---------------------------------------------------------------------

    pub fn open(&mut self, directionality: Directionality) -> Option<StreamId> {
        if self.is_closed() {
            return None;
        }
        self.streams.open(directionality)
    }

    pub fn write(
        &mut self,
        ctx: &mut Context,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, crate::stream::WriteError> {
        use crate::stream::WriteError;
        assert!(stream.directionality() == Directionality::Bi || stream.initiator() == self.side);
        if self.is_closed() {
            trace!(self.log, "write blocked; connection closing"; "stream" => stream);
            return Err(WriteError::Blocked);
        }
        if self.send.data_sent >= self.send.peer_max_data {
            trace!(self.log, "write blocked by connection flow control"; "stream" => stream);
            return Err(WriteError::Blocked);
        }
        let conn_budget = self.send.peer_max_data - self.send.data_sent;
        let (offset, n) = {
            let ss = self
                .streams
                .get_mut(stream)
                .and_then(|s| s.send_mut())
                .expect("unknown or receive-only stream");
            let stream_budget = ss.write_budget()?;
            let n = cmp::min(cmp::min(conn_budget, stream_budget), data.len() as u64) as usize;
            let offset = ss.offset;
            ss.offset += n as u64;
            ss.bytes_in_flight += n as u64;
            (offset, n)
        };
        self.send.data_sent += n as u64;
        self.send.stream.push_back(frame::Stream {
            id: stream,
            offset,
            fin: false,
            data: Bytes::copy_from_slice(&data[..n]),
        });
        self.send.set_flag(SendFlags::STREAM);
        self.queue_flush_send(ctx);
        trace!(self.log, "write"; "stream" => stream, "len" => n);
        Ok(n)
    }

    pub fn finish(&mut self, ctx: &mut Context, stream: StreamId) {
        let offset = {
            let ss = self
                .streams
                .get_mut(stream)
                .and_then(|s| s.send_mut())
                .expect("unknown or receive-only stream");
            assert_eq!(ss.state, SendState::Ready);
            ss.state = SendState::DataSent;
            ss.offset
        };
        let mut marked = false;
        for frame in self.send.stream.iter_mut() {
            if frame.id == stream && frame.offset + frame.data.len() as u64 == offset {
                frame.fin = true;
                marked = true;
                break;
            }
        }
        if marked {
            self.queue_flush_send(ctx);
            return;
        }
        self.send.stream.push_back(frame::Stream {
            id: stream,
            offset,
            fin: true,
            data: Bytes::new(),
        });
        self.send.set_flag(SendFlags::STREAM);
        self.queue_flush_send(ctx);
    }

    pub fn read(
        &mut self,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<usize, crate::stream::ReadError> {
        let result = {
            let rs = self
                .streams
                .get_mut(stream)
                .and_then(|s| s.recv_mut())
                .expect("unknown or send-only stream");
            rs.read(buf)
        };
        if let Ok(n) = result {
            // Issue fresh connection-level flow control credit.
            self.send.max_data += n as u64;
            self.send.set_flag(SendFlags::MAX_DATA);
            let done = self
                .streams
                .get_mut(stream)
                .map_or(false, |s| s.is_closed());
            if done {
                self.streams.note_closed(stream);
            }
        }
        result
    }

    pub fn reset_stream(&mut self, ctx: &mut Context, stream: StreamId, error_code: u64) {
        let final_size = {
            let ss = match self.streams.get_mut(stream).and_then(|s| s.send_mut()) {
                Some(x) => x,
                None => return,
            };
            if ss.state.was_reset() || ss.is_closed() {
                return;
            }
            ss.state = SendState::ResetSent { stop_reason: None };
            ss.offset
        };
        self.send.reset_stream.push((stream, error_code, final_size));
        self.queue_flush_send(ctx);
    }

    pub fn stop_sending(&mut self, ctx: &mut Context, stream: StreamId, error_code: u64) {
        let wanted = self
            .streams
            .get_mut(stream)
            .and_then(|s| s.recv())
            .map_or(false, |rs| !rs.is_finished());
        if wanted {
            self.send.stop_sending.push((stream, error_code));
            self.queue_flush_send(ctx);
        }
    }

    pub fn ping(&mut self, ctx: &mut Context) {
        self.send.set_flag(SendFlags::PING);
        self.queue_flush_send(ctx);
    }

    // ---------------------------------------------------------------------
    // Parameter surface
    // ---------------------------------------------------------------------

    pub fn param_set(
        &mut self,
        ctx: &mut Context,
        param: Param,
        now: u64,
    ) -> Result<(), ParamError> {
        match param {
            Param::IdleTimeout(ms) => {
                if self.flags.started {
                    return Err(ParamError::InvalidState);
                }
                self.idle_timeout_ms = ms;
                Ok(())
            }
            Param::RemoteAddress(addr) => {
                if self.flags.started {
                    return Err(ParamError::InvalidState);
                }
                self.remote = addr;
                Ok(())
            }
            Param::LocalAddress(addr) => {
                if self.flags.started {
                    // Live rebinding needs binding migration support.
                    return Err(ParamError::InvalidState);
                }
                self.local = Some(addr);
                Ok(())
            }
            Param::KeepAlive(ms) => {
                self.keep_alive_ms = ms;
                if ms == 0 {
                    self.timer_cancel(ctx, TimerType::KeepAlive);
                } else if self.flags.started && !self.is_closed() {
                    self.timer_set(ctx, TimerType::KeepAlive, ms, now);
                }
                Ok(())
            }
            Param::PeerBidiStreamCount(count) => {
                if self.flags.started {
                    return Err(ParamError::InvalidState);
                }
                self.streams
                    .set_max_remote(Directionality::Bi, u64::from(count));
                Ok(())
            }
            Param::PeerUniStreamCount(count) => {
                if self.flags.started {
                    return Err(ParamError::InvalidState);
                }
                self.streams
                    .set_max_remote(Directionality::Uni, u64::from(count));
                Ok(())
            }
            Param::ForceKeyUpdate => {
                let li = EncryptLevel::OneRtt as usize;
                if self.keys[li].is_none()
                    || self.spaces[li].awaiting_key_phase_confirmation
                    || !self.flags.connected
                {
                    return Err(ParamError::InvalidState);
                }
                info!(self.log, "forcing key update");
                let new = self.keys[li].as_ref().unwrap().update();
                self.prev_1rtt_keys = self.keys[li].replace(new);
                let space = &mut self.spaces[li];
                space.current_key_phase = !space.current_key_phase;
                space.read_key_phase_start_pn = space.next_recv_pn;
                space.key_phase_start_send_pn = space.next_send_pn;
                space.awaiting_key_phase_confirmation = true;
                self.ping(ctx);
                Ok(())
            }
            Param::ForceCidUpdate => {
                if !self.flags.connected {
                    return Err(ParamError::InvalidState);
                }
                self.flags.initiated_cid_update = true;
                self.retire_current_dest_cid();
                self.queue_flush_send(ctx);
                Ok(())
            }
        }
    }

    pub fn param_get(&self, query: ParamQuery) -> Result<ParamValue, ParamError> {
        match query {
            ParamQuery::QuicVersion => Ok(ParamValue::QuicVersion(self.version)),
            ParamQuery::RemoteAddress => Ok(ParamValue::Address(self.remote)),
            ParamQuery::LocalAddress => self
                .local
                .map(ParamValue::Address)
                .ok_or(ParamError::NotFound),
            ParamQuery::IdleTimeout => Ok(ParamValue::Milliseconds(self.idle_timeout_ms)),
            ParamQuery::KeepAlive => Ok(ParamValue::Milliseconds(self.keep_alive_ms)),
            ParamQuery::PeerBidiStreamCount => Ok(ParamValue::Count(
                self.peer_params
                    .as_ref()
                    .ok_or(ParamError::InvalidState)?
                    .initial_max_streams_bidi,
            )),
            ParamQuery::PeerUniStreamCount => Ok(ParamValue::Count(
                self.peer_params
                    .as_ref()
                    .ok_or(ParamError::InvalidState)?
                    .initial_max_streams_uni,
            )),
            ParamQuery::CloseReasonPhrase => self
                .close_reason
                .clone()
                .map(ParamValue::ReasonPhrase)
                .ok_or(ParamError::NotFound),
            ParamQuery::Statistics => {
                let mut stats = self.stats;
                stats.rtt = RttStats {
                    smoothed: self.rtt.smoothed,
                    variance: self.rtt.variance,
                    min: self.rtt.min,
                    max: self.rtt.max,
                    latest: self.rtt.latest,
                };
                Ok(ParamValue::Statistics(stats))
            }
        }
    }
}
