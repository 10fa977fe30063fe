//! Sans-I/O state machine for the QUIC transport protocol (IETF drafts 19-22).
//!
//! This library performs no I/O whatsoever. A [`connection::Connection`]
//! consumes raw UDP datagrams via `receive_datagram`, produces raw UDP
//! datagrams via `datagrams_to_send`, and reports what happened through a
//! FIFO of [`connection::Event`]s. Time is injected by the caller as a
//! monotonic `f64` in seconds; timers are armed from `get_timer` and fired
//! through `handle_timer`. [`endpoint::Endpoint`] demultiplexes datagrams
//! onto connections by destination connection ID and answers version
//! negotiation and stateless retry without creating connection state.

#[macro_use]
extern crate slog;

use std::fmt;
use std::ops;

pub mod builder;
pub mod coding;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod packet;
pub mod qlog;
pub mod range_set;
pub mod recovery;
pub mod stream;
pub mod tls;
pub mod transport_parameters;

pub use crate::connection::{Config, Connection, Event};
pub use crate::endpoint::Endpoint;
pub use crate::packet::ConnectionId;

/// Supported protocol versions, in preference order (newest first).
pub const SUPPORTED_VERSIONS: [u32; 4] = [
    VERSION_DRAFT_22,
    VERSION_DRAFT_21,
    VERSION_DRAFT_20,
    VERSION_DRAFT_19,
];

pub const VERSION_DRAFT_19: u32 = 0xFF00_0013;
pub const VERSION_DRAFT_20: u32 = 0xFF00_0014;
pub const VERSION_DRAFT_21: u32 = 0xFF00_0015;
pub const VERSION_DRAFT_22: u32 = 0xFF00_0016;

/// Version field value signalling a Version Negotiation packet.
pub const VERSION_NEGOTIATION: u32 = 0;

/// Largest UDP payload we will emit; also the minimum size of a client's
/// first datagram.
pub const MAX_UDP_PAYLOAD: usize = 1280;

/// Length of the connection IDs issued by this endpoint.
pub const LOCAL_CID_LEN: usize = 8;

pub const MAX_CID_SIZE: usize = 18;
pub const RESET_TOKEN_SIZE: usize = 16;

/// Whether an endpoint acts as the initiator of a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }
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
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// QUIC transport error codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ErrorCode(pub u64);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x1);
    pub const SERVER_BUSY: ErrorCode = ErrorCode(0x2);
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub const STREAM_LIMIT_ERROR: ErrorCode = ErrorCode(0x4);
    pub const STREAM_STATE_ERROR: ErrorCode = ErrorCode(0x5);
    pub const FINAL_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    pub const FRAME_ENCODING_ERROR: ErrorCode = ErrorCode(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: ErrorCode = ErrorCode(0x8);
    pub const PROTOCOL_VIOLATION: ErrorCode = ErrorCode(0xA);
    pub const INVALID_MIGRATION: ErrorCode = ErrorCode(0xC);
    pub const CRYPTO_BUFFER_EXCEEDED: ErrorCode = ErrorCode(0xD);

    /// TLS alerts are carried as `0x100 + alert_description`.
    pub fn crypto(alert_description: u8) -> ErrorCode {
        ErrorCode(0x100 + u64::from(alert_description))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            ErrorCode::NO_ERROR => "NO_ERROR",
            ErrorCode::INTERNAL_ERROR => "INTERNAL_ERROR",
            ErrorCode::SERVER_BUSY => "SERVER_BUSY",
            ErrorCode::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            ErrorCode::STREAM_LIMIT_ERROR => "STREAM_LIMIT_ERROR",
            ErrorCode::STREAM_STATE_ERROR => "STREAM_STATE_ERROR",
            ErrorCode::FINAL_SIZE_ERROR => "FINAL_SIZE_ERROR",
            ErrorCode::FRAME_ENCODING_ERROR => "FRAME_ENCODING_ERROR",
            ErrorCode::TRANSPORT_PARAMETER_ERROR => "TRANSPORT_PARAMETER_ERROR",
            ErrorCode::PROTOCOL_VIOLATION => "PROTOCOL_VIOLATION",
            ErrorCode::INVALID_MIGRATION => "INVALID_MIGRATION",
            ErrorCode::CRYPTO_BUFFER_EXCEEDED => "CRYPTO_BUFFER_EXCEEDED",
            ErrorCode(code) if code >= 0x100 && code < 0x200 => {
                return write!(f, "CRYPTO_ERROR({:#x})", code);
            }
            ErrorCode(code) => return write!(f, "{:#x}", code),
        };
        f.write_str(name)
    }
}

/// A fatal transport-level error: the QUIC error code to close with, the
/// frame type that provoked it (if any), and a human-readable reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {reason}")]
pub struct TransportError {
    pub code: ErrorCode,
    pub frame_type: Option<u64>,
    pub reason: String,
}

impl TransportError {
    pub fn new(code: ErrorCode, frame_type: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            code,
            frame_type,
            reason: reason.into(),
        }
    }

    pub fn protocol_violation(frame_type: u64, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::PROTOCOL_VIOLATION, Some(frame_type), reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, None, reason)
    }
}

impl From<crate::tls::Alert> for TransportError {
    fn from(alert: crate::tls::Alert) -> Self {
        TransportError {
            code: ErrorCode::crypto(alert.description),
            frame_type: Some(frame::Type::CRYPTO.0),
            reason: alert.to_string(),
        }
    }
}

/// Returns `true` if the stream was opened by the client.
pub fn stream_is_client_initiated(stream_id: u64) -> bool {
    stream_id & 1 == 0
}

/// Returns `true` if the stream carries data in one direction only.
pub fn stream_is_unidirectional(stream_id: u64) -> bool {
    stream_id & 2 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        assert!(stream_is_client_initiated(0));
        assert!(!stream_is_client_initiated(1));
        assert!(stream_is_client_initiated(4));
        assert!(!stream_is_unidirectional(0));
        assert!(stream_is_unidirectional(2));
        assert!(stream_is_unidirectional(3));
    }

    #[test]
    fn error_code_display() {
        assert_eq!(ErrorCode::PROTOCOL_VIOLATION.to_string(), "PROTOCOL_VIOLATION");
        assert_eq!(ErrorCode::crypto(80).to_string(), "CRYPTO_ERROR(0x150)");
    }
}
