//! Connection state machine for the QUIC transport protocol.
//!
//! This library performs no I/O. An [`endpoint::Endpoint`] consumes UDP
//! datagrams and timer expirations and produces transmissions, timer updates,
//! and application events for a backend to act on. Every connection is a
//! cooperative single-threaded state machine: external producers enqueue
//! operations onto the connection's queue and a single worker drains them.

use std::fmt;
use std::net::SocketAddrV6;
use std::ops::Not;

use bytes::BytesMut;

pub mod cid;
pub mod coding;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod loss;
pub mod ops;
pub mod packet;
pub mod params;
pub mod range_set;
pub mod rtt;
pub mod send;
pub mod space;
pub mod stream;
pub mod streams;
pub mod timer_table;
pub mod transport_parameters;

pub use crate::connection::{CloseStatus, Connection, ConnectionHandle};
pub use crate::endpoint::{Config, Endpoint, Event, Io};
pub use crate::frame::Frame;
pub use crate::packet::ConnectionId;

/// The QUIC version implemented by this library. There is no version
/// negotiation; a mismatched version is dropped or silently closed.
pub const VERSION: u32 = 0x0000_0001;

/// Marker version carried by version negotiation packets.
pub const VERSION_NEGOTIATION: u32 = 0;

pub const MIN_CID_SIZE: usize = 4;
pub const MAX_CID_SIZE: usize = 20;
/// Length of locally generated connection IDs.
pub const LOC_CID_SIZE: usize = 8;
pub const RESET_TOKEN_SIZE: usize = 16;
pub const AEAD_TAG_SIZE: usize = 16;
pub const HP_SAMPLE_SIZE: usize = 16;
/// A stateless reset must be longer than first byte + max packet number +
/// sample, so anything shorter can't be mistaken for one.
pub const MIN_STATELESS_RESET_SIZE: usize = 21;
pub const MIN_INITIAL_SIZE: usize = 1200;
pub const MIN_MTU: u16 = 1232;
pub const VAR_INT_MAX: u64 = (1 << 62) - 1;

/// Most destination CIDs we are willing to track for one peer.
pub const ACTIVE_CID_LIMIT: usize = 4;
/// Attempts at generating a non-colliding source CID before giving up.
pub const CID_COLLISION_RETRIES: usize = 8;
/// Short-header packets whose header-protection masks are computed together.
pub const MAX_CRYPTO_BATCH: usize = 8;
/// Datagrams parked per encryption level while waiting for its read key.
pub const MAX_DEFERRED_DATAGRAMS: usize = 10;
/// Datagrams buffered on the receive intake before whole chains are dropped.
pub const RECV_QUEUE_LIMIT: usize = 180;
/// Multiple of the probe timeout spent in the closing period.
pub const CLOSE_PTO_COUNT: u32 = 3;
/// Bytes of send allowance granted per received byte before address validation.
pub const AMPLIFICATION_FACTOR: u64 = 3;
/// Lower bound on the draining period, in milliseconds.
pub const MIN_DRAIN_PERIOD_MS: u64 = 15;
/// Time spent inside the TLS session seam that warrants a warning.
pub const MAX_COLLABORATOR_TIME_WARNING_US: u64 = 10_000;
/// Time spent inside the TLS session seam that trips a debug assertion.
pub const MAX_COLLABORATOR_TIME_ERROR_US: u64 = 1_000_000;

/// Whether this side runs the client or server half of the protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
}

impl Not for Side {
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
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Directionality {
    /// Data flows in both directions.
    Bi,
    /// Data flows only from the stream's initiator.
    Uni,
}

/// A stream identifier: two low bits encode initiator and directionality.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        let mut id = index << 2;
        if let Side::Server = initiator {
            id |= 0x1;
        }
        if let Directionality::Uni = directionality {
            id |= 0x2;
        }
        StreamId(id)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl slog::Value for StreamId {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_u64(key, self.0)
    }
}

/// A QUIC transport error code, as carried in CONNECTION_CLOSE frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransportError(pub u64);

impl TransportError {
    pub const NO_ERROR: TransportError = TransportError(0x0);
    pub const INTERNAL_ERROR: TransportError = TransportError(0x1);
    pub const SERVER_BUSY: TransportError = TransportError(0x2);
    pub const FLOW_CONTROL_ERROR: TransportError = TransportError(0x3);
    pub const STREAM_LIMIT_ERROR: TransportError = TransportError(0x4);
    pub const STREAM_STATE_ERROR: TransportError = TransportError(0x5);
    pub const FINAL_SIZE_ERROR: TransportError = TransportError(0x6);
    pub const FRAME_ENCODING_ERROR: TransportError = TransportError(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: TransportError = TransportError(0x8);
    pub const CONNECTION_ID_LIMIT_ERROR: TransportError = TransportError(0x9);
    pub const PROTOCOL_VIOLATION: TransportError = TransportError(0xA);
    pub const INVALID_TOKEN: TransportError = TransportError(0xB);
    pub const CRYPTO_BUFFER_EXCEEDED: TransportError = TransportError(0xD);
    pub const KEY_UPDATE_ERROR: TransportError = TransportError(0xE);

    /// A TLS alert, offset into the reserved crypto error space.
    pub fn crypto(alert: u8) -> Self {
        TransportError(0x100 | u64::from(alert))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            TransportError::NO_ERROR => "no error",
            TransportError::INTERNAL_ERROR => "internal error",
            TransportError::SERVER_BUSY => "server busy",
            TransportError::FLOW_CONTROL_ERROR => "flow control error",
            TransportError::STREAM_LIMIT_ERROR => "stream limit error",
            TransportError::STREAM_STATE_ERROR => "stream state error",
            TransportError::FINAL_SIZE_ERROR => "final size error",
            TransportError::FRAME_ENCODING_ERROR => "frame encoding error",
            TransportError::TRANSPORT_PARAMETER_ERROR => "transport parameter error",
            TransportError::CONNECTION_ID_LIMIT_ERROR => "connection ID limit error",
            TransportError::PROTOCOL_VIOLATION => "protocol violation",
            TransportError::INVALID_TOKEN => "invalid token",
            TransportError::CRYPTO_BUFFER_EXCEEDED => "crypto buffer exceeded",
            TransportError::KEY_UPDATE_ERROR => "key update error",
            TransportError(x) if x & 0x100 != 0 => {
                return write!(f, "TLS alert {}", x & 0xFF);
            }
            TransportError(x) => return write!(f, "transport error {:#x}", x),
        };
        f.write_str(name)
    }
}

impl slog::Value for TransportError {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// One UDP datagram as handed over by the datapath. May contain multiple
/// coalesced QUIC packets.
#[derive(Debug)]
pub struct Datagram {
    pub remote: SocketAddrV6,
    pub data: BytesMut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_encoding() {
        let id = StreamId::new(Side::Server, Directionality::Uni, 5);
        assert_eq!(id.0, 5 << 2 | 0x3);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.directionality(), Directionality::Uni);
        assert_eq!(id.index(), 5);

        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        assert_eq!(id.0, 0);
        assert_eq!(id.initiator(), Side::Client);
        assert_eq!(id.directionality(), Directionality::Bi);
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(
            TransportError::PROTOCOL_VIOLATION.to_string(),
            "protocol violation"
        );
        assert_eq!(TransportError::crypto(40).to_string(), "TLS alert 40");
    }
}
