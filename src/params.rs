//! The typed parameter get/set surface and the statistics snapshot.

use std::net::SocketAddrV6;

use failure::Fail;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum ParamError {
    /// The value is the wrong shape or out of range.
    #[fail(display = "invalid parameter")]
    InvalidParameter,
    /// The parameter is not legal in the connection's current phase.
    #[fail(display = "invalid state")]
    InvalidState,
    /// Nothing stored for the query, e.g. no close reason phrase.
    #[fail(display = "not found")]
    NotFound,
}

/// Settable connection parameters, each with its own phase rules.
#[derive(Debug, Clone)]
pub enum Param {
    /// Milliseconds, 0 disables. Only before the connection starts.
    IdleTimeout(u64),
    /// Only before the connection starts.
    RemoteAddress(SocketAddrV6),
    /// Only before the connection starts; live rebinding is unsupported.
    LocalAddress(SocketAddrV6),
    /// Keep-alive interval in milliseconds, 0 disables.
    KeepAlive(u64),
    /// Number of additional peer-initiated bidirectional streams to allow.
    PeerBidiStreamCount(u16),
    /// Number of additional peer-initiated unidirectional streams to allow.
    PeerUniStreamCount(u16),
    /// Roll 1-RTT keys immediately. Requires a confirmed key phase.
    ForceKeyUpdate,
    /// Retire the current destination CID and switch to a spare.
    ForceCidUpdate,
}

/// Readable connection parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParamQuery {
    QuicVersion,
    RemoteAddress,
    LocalAddress,
    IdleTimeout,
    KeepAlive,
    PeerBidiStreamCount,
    PeerUniStreamCount,
    CloseReasonPhrase,
    Statistics,
}

#[derive(Debug, Clone)]
pub enum ParamValue {
    QuicVersion(u32),
    Address(SocketAddrV6),
    Milliseconds(u64),
    Count(u64),
    ReasonPhrase(String),
    Statistics(ConnStats),
}

#[derive(Debug, Copy, Clone, Default)]
pub struct TimingStats {
    /// Absolute µs when the connection started.
    pub start: u64,
    /// Absolute µs when the handshake completed, 0 until then.
    pub handshake_complete: u64,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct RttStats {
    pub smoothed: u64,
    pub variance: u64,
    pub min: u64,
    pub max: u64,
    pub latest: u64,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct SendStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub retransmitted_packets: u64,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct RecvStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub valid_packets: u64,
    pub dropped_packets: u64,
    pub duplicate_packets: u64,
    pub decryption_failures: u64,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct ScheduleStats {
    /// Operations drained over the connection's lifetime.
    pub operation_count: u64,
}

/// Flat statistics snapshot returned by [`ParamQuery::Statistics`].
#[derive(Debug, Copy, Clone, Default)]
pub struct ConnStats {
    pub quic_version: u32,
    pub stateless_retry: bool,
    pub version_negotiation: bool,
    pub timing: TimingStats,
    pub rtt: RttStats,
    pub send: SendStats,
    pub recv: RecvStats,
    pub schedule: ScheduleStats,
}
