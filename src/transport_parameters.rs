//! Transport parameter encoding, validation, and defaults.
//!
//! Parameters ride inside the TLS handshake as a TLV blob: var-int id,
//! var-int length, value.

use bytes::{Buf, BufMut};
use failure::Fail;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::packet::ConnectionId;
use crate::{Side, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE, VAR_INT_MAX};

const ORIGINAL_CONNECTION_ID: u64 = 0x00;
const IDLE_TIMEOUT: u64 = 0x01;
const STATELESS_RESET_TOKEN: u64 = 0x02;
const MAX_PACKET_SIZE: u64 = 0x03;
const INITIAL_MAX_DATA: u64 = 0x04;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ACK_DELAY_EXPONENT: u64 = 0x0a;
const MAX_ACK_DELAY: u64 = 0x0b;
const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;

/// Stream count limits above this are unrepresentable in a stream ID.
pub const MAX_STREAM_COUNT: u64 = 1 << 60;

pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
pub const DEFAULT_MAX_ACK_DELAY_MS: u64 = 25;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Milliseconds; 0 disables.
    pub idle_timeout: u64,
    pub max_packet_size: u64,
    pub ack_delay_exponent: u8,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub active_connection_id_limit: u64,
    pub disable_active_migration: bool,
    /// Server only.
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    /// Server only; required after a Retry.
    pub original_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            idle_timeout: 0,
            max_packet_size: 65_527,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY_MS,
            active_connection_id_limit: 2,
            disable_active_migration: false,
            stateless_reset_token: None,
            original_connection_id: None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "malformed transport parameters")]
    Malformed,
    #[fail(display = "transport parameter had illegal value")]
    IllegalValue,
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

impl From<Error> for TransportError {
    fn from(_: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR
    }
}

fn put_var_param<W: BufMut>(buf: &mut W, id: u64, value: u64) {
    buf.put_var(id);
    buf.put_var(crate::coding::var_len(value) as u64);
    buf.put_var(value);
}

impl TransportParameters {
    /// Encode the parameters we advertise. `side` is the writing side;
    /// server-only fields are only emitted by servers.
    pub fn write<W: BufMut>(&self, side: Side, buf: &mut W) {
        put_var_param(buf, INITIAL_MAX_DATA, self.initial_max_data);
        put_var_param(
            buf,
            INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_var_param(
            buf,
            INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_var_param(
            buf,
            INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        if self.initial_max_streams_bidi != 0 {
            put_var_param(buf, INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        }
        if self.initial_max_streams_uni != 0 {
            put_var_param(buf, INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        }
        if self.idle_timeout != 0 {
            put_var_param(buf, IDLE_TIMEOUT, self.idle_timeout);
        }
        put_var_param(buf, MAX_PACKET_SIZE, self.max_packet_size);
        if self.ack_delay_exponent != DEFAULT_ACK_DELAY_EXPONENT {
            put_var_param(buf, ACK_DELAY_EXPONENT, u64::from(self.ack_delay_exponent));
        }
        put_var_param(buf, MAX_ACK_DELAY, self.max_ack_delay);
        put_var_param(
            buf,
            ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        if self.disable_active_migration {
            buf.put_var(DISABLE_ACTIVE_MIGRATION);
            buf.put_var(0);
        }
        if let Some(ref token) = self.stateless_reset_token {
            debug_assert_eq!(side, Side::Server);
            buf.put_var(STATELESS_RESET_TOKEN);
            buf.put_var(RESET_TOKEN_SIZE as u64);
            buf.put_slice(token);
        }
        if let Some(ref id) = self.original_connection_id {
            debug_assert_eq!(side, Side::Server);
            buf.put_var(ORIGINAL_CONNECTION_ID);
            buf.put_var(id.len() as u64);
            buf.put_slice(id);
        }
    }

    /// Decode and validate the peer's parameters. `side` is the reading
    /// side: a server must reject server-only parameters from its client.
    pub fn read<B: Buf>(side: Side, buf: &mut B) -> Result<Self, Error> {
        let mut params = TransportParameters::default();
        let mut seen = 0u64;
        while buf.has_remaining() {
            let id = buf.get_var()?;
            let len = buf.get_var()? as usize;
            if buf.remaining() < len {
                return Err(Error::Malformed);
            }
            if id < 64 {
                if seen & (1 << id) != 0 {
                    // Parameters must not repeat.
                    return Err(Error::Malformed);
                }
                seen |= 1 << id;
            }
            match id {
                ORIGINAL_CONNECTION_ID => {
                    if side == Side::Server || len > MAX_CID_SIZE {
                        return Err(Error::IllegalValue);
                    }
                    params.original_connection_id =
                        Some(ConnectionId::new(&buf.take_checked(len)?));
                }
                STATELESS_RESET_TOKEN => {
                    if side == Side::Server || len != RESET_TOKEN_SIZE {
                        return Err(Error::IllegalValue);
                    }
                    let mut token = [0; RESET_TOKEN_SIZE];
                    token.copy_from_slice(&buf.take_checked(len)?);
                    params.stateless_reset_token = Some(token);
                }
                DISABLE_ACTIVE_MIGRATION => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                _ => {
                    let mut value_buf = buf.take_checked(len)?;
                    let value = value_buf.get_var()?;
                    if value_buf.has_remaining() {
                        return Err(Error::Malformed);
                    }
                    match id {
                        IDLE_TIMEOUT => params.idle_timeout = value,
                        MAX_PACKET_SIZE => {
                            if value < 1200 || value > 65_527 {
                                return Err(Error::IllegalValue);
                            }
                            params.max_packet_size = value;
                        }
                        INITIAL_MAX_DATA => params.initial_max_data = value,
                        INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                            params.initial_max_stream_data_bidi_local = value
                        }
                        INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                            params.initial_max_stream_data_bidi_remote = value
                        }
                        INITIAL_MAX_STREAM_DATA_UNI => {
                            params.initial_max_stream_data_uni = value
                        }
                        INITIAL_MAX_STREAMS_BIDI => {
                            if value > MAX_STREAM_COUNT {
                                return Err(Error::IllegalValue);
                            }
                            params.initial_max_streams_bidi = value;
                        }
                        INITIAL_MAX_STREAMS_UNI => {
                            if value > MAX_STREAM_COUNT {
                                return Err(Error::IllegalValue);
                            }
                            params.initial_max_streams_uni = value;
                        }
                        ACK_DELAY_EXPONENT => {
                            if value > 20 {
                                return Err(Error::IllegalValue);
                            }
                            params.ack_delay_exponent = value as u8;
                        }
                        MAX_ACK_DELAY => {
                            if value >= 1 << 14 {
                                return Err(Error::IllegalValue);
                            }
                            params.max_ack_delay = value;
                        }
                        ACTIVE_CONNECTION_ID_LIMIT => {
                            if value < 2 || value > VAR_INT_MAX {
                                return Err(Error::IllegalValue);
                            }
                            params.active_connection_id_limit = value;
                        }
                        // Unknown parameters must be ignored.
                        _ => {}
                    }
                }
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_server() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 16,
            initial_max_streams_bidi: 8,
            initial_max_streams_uni: 4,
            idle_timeout: 30_000,
            max_packet_size: 1472,
            ack_delay_exponent: 5,
            max_ack_delay: 40,
            active_connection_id_limit: 4,
            disable_active_migration: true,
            stateless_reset_token: Some([0x5a; RESET_TOKEN_SIZE]),
            original_connection_id: Some(ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8])),
        }
    }

    #[test]
    fn round_trip_from_server() {
        let params = sample_server();
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        let read = TransportParameters::read(Side::Client, &mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn server_rejects_server_only_params() {
        let params = sample_server();
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf[..])),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn repeated_parameter_is_malformed() {
        let mut buf = Vec::new();
        put_var_param(&mut buf, INITIAL_MAX_DATA, 10);
        put_var_param(&mut buf, INITIAL_MAX_DATA, 10);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut Cursor::new(&buf[..])),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn ack_delay_exponent_bound() {
        let mut buf = Vec::new();
        put_var_param(&mut buf, ACK_DELAY_EXPONENT, 21);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut Cursor::new(&buf[..])),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn unknown_parameters_are_ignored() {
        let mut buf = Vec::new();
        put_var_param(&mut buf, 0x3f, 99);
        put_var_param(&mut buf, INITIAL_MAX_DATA, 77);
        let read = TransportParameters::read(Side::Client, &mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(read.initial_max_data, 77);
    }
}
