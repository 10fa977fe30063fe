//! QUIC frames: a tagged enum, a pure parser, and encode helpers.
//!
//! Frame dispatch is driven by the varint frame type; each type maps to the
//! set of epochs in which it may appear. A frame arriving outside its
//! permitted epochs is a protocol violation handled by the connection.

use std::fmt;

use bytes::Bytes;

use crate::coding::{Buffer, BufferError};
use crate::packet::ConnectionId;
use crate::range_set::RangeSet;
use crate::tls::Epoch;
use crate::RESET_TOKEN_SIZE;

/// A QUIC frame type identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Type(pub u64);

impl Type {
    pub const PADDING: Type = Type(0x00);
    pub const PING: Type = Type(0x01);
    pub const ACK: Type = Type(0x02);
    pub const ACK_ECN: Type = Type(0x03);
    pub const RESET_STREAM: Type = Type(0x04);
    pub const STOP_SENDING: Type = Type(0x05);
    pub const CRYPTO: Type = Type(0x06);
    pub const NEW_TOKEN: Type = Type(0x07);
    pub const STREAM_BASE: Type = Type(0x08);
    pub const MAX_DATA: Type = Type(0x10);
    pub const MAX_STREAM_DATA: Type = Type(0x11);
    pub const MAX_STREAMS_BIDI: Type = Type(0x12);
    pub const MAX_STREAMS_UNI: Type = Type(0x13);
    pub const DATA_BLOCKED: Type = Type(0x14);
    pub const STREAM_DATA_BLOCKED: Type = Type(0x15);
    pub const STREAMS_BLOCKED_BIDI: Type = Type(0x16);
    pub const STREAMS_BLOCKED_UNI: Type = Type(0x17);
    pub const NEW_CONNECTION_ID: Type = Type(0x18);
    pub const RETIRE_CONNECTION_ID: Type = Type(0x19);
    pub const PATH_CHALLENGE: Type = Type(0x1A);
    pub const PATH_RESPONSE: Type = Type(0x1B);
    pub const TRANSPORT_CLOSE: Type = Type(0x1C);
    pub const APPLICATION_CLOSE: Type = Type(0x1D);

    pub fn is_stream(self) -> bool {
        self.0 >= 0x08 && self.0 <= 0x0F
    }

    /// Packets containing only these frame types do not elicit an ACK.
    pub fn is_ack_eliciting(self) -> bool {
        !matches!(self, Type::PADDING | Type::ACK | Type::ACK_ECN)
    }

    /// Probing frames do not promote a new network path.
    pub fn is_probing(self) -> bool {
        matches!(
            self,
            Type::PADDING | Type::PATH_CHALLENGE | Type::PATH_RESPONSE | Type::NEW_CONNECTION_ID
        )
    }

    /// Which epochs a frame of this type may appear in.
    pub fn is_allowed_in(self, epoch: Epoch) -> bool {
        use self::Epoch::*;
        match self {
            Type::PADDING | Type::PING => true,
            Type::ACK | Type::ACK_ECN | Type::CRYPTO => {
                matches!(epoch, Initial | Handshake | OneRtt)
            }
            Type::NEW_TOKEN | Type::RETIRE_CONNECTION_ID | Type::PATH_RESPONSE => epoch == OneRtt,
            Type::TRANSPORT_CLOSE => true,
            _ => matches!(epoch, ZeroRtt | OneRtt),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Type::PADDING => "PADDING",
            Type::PING => "PING",
            Type::ACK => "ACK",
            Type::ACK_ECN => "ACK_ECN",
            Type::RESET_STREAM => "RESET_STREAM",
            Type::STOP_SENDING => "STOP_SENDING",
            Type::CRYPTO => "CRYPTO",
            Type::NEW_TOKEN => "NEW_TOKEN",
            Type::MAX_DATA => "MAX_DATA",
            Type::MAX_STREAM_DATA => "MAX_STREAM_DATA",
            Type::MAX_STREAMS_BIDI => "MAX_STREAMS_BIDI",
            Type::MAX_STREAMS_UNI => "MAX_STREAMS_UNI",
            Type::DATA_BLOCKED => "DATA_BLOCKED",
            Type::STREAM_DATA_BLOCKED => "STREAM_DATA_BLOCKED",
            Type::STREAMS_BLOCKED_BIDI => "STREAMS_BLOCKED_BIDI",
            Type::STREAMS_BLOCKED_UNI => "STREAMS_BLOCKED_UNI",
            Type::NEW_CONNECTION_ID => "NEW_CONNECTION_ID",
            Type::RETIRE_CONNECTION_ID => "RETIRE_CONNECTION_ID",
            Type::PATH_CHALLENGE => "PATH_CHALLENGE",
            Type::PATH_RESPONSE => "PATH_RESPONSE",
            Type::TRANSPORT_CLOSE => "TRANSPORT_CLOSE",
            Type::APPLICATION_CLOSE => "APPLICATION_CLOSE",
            Type(x) if x >= 0x08 && x <= 0x0F => "STREAM",
            Type(x) => return write!(f, "UNKNOWN({:#x})", x),
        };
        f.write_str(name)
    }
}

impl slog::Value for Type {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack {
        ranges: RangeSet,
        /// Encoded delay; scale with the peer's ack_delay_exponent.
        delay: u64,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    MaxData(u64),
    MaxStreamData {
        stream_id: u64,
        limit: u64,
    },
    MaxStreamsBidi(u64),
    MaxStreamsUni(u64),
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlockedBidi(u64),
    StreamsBlockedUni(u64),
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; RESET_TOKEN_SIZE],
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    TransportClose {
        error_code: u64,
        frame_type: u64,
        reason: String,
    },
    ApplicationClose {
        error_code: u64,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] BufferError),
    #[error("unknown frame type {0:#x}")]
    UnknownType(u64),
}

impl Frame {
    /// Pull one frame off `buf`, returning it along with its wire type.
    pub fn parse(buf: &mut Buffer) -> Result<(Type, Frame), ParseError> {
        let ty = Type(buf.pull_var()?);
        let frame = match ty {
            Type::PADDING => Frame::Padding,
            Type::PING => Frame::Ping,
            Type::ACK | Type::ACK_ECN => {
                let (ranges, delay) = pull_ack(buf)?;
                if ty == Type::ACK_ECN {
                    // ECN counts are read and discarded
                    buf.pull_var()?;
                    buf.pull_var()?;
                    buf.pull_var()?;
                }
                Frame::Ack { ranges, delay }
            }
            Type::RESET_STREAM => Frame::ResetStream {
                stream_id: buf.pull_var()?,
                error_code: buf.pull_var()?,
                final_size: buf.pull_var()?,
            },
            Type::STOP_SENDING => Frame::StopSending {
                stream_id: buf.pull_var()?,
                error_code: buf.pull_var()?,
            },
            Type::CRYPTO => {
                let offset = buf.pull_var()?;
                let length = buf.pull_var()? as usize;
                Frame::Crypto {
                    offset,
                    data: buf.pull_bytes(length)?,
                }
            }
            Type::NEW_TOKEN => {
                let length = buf.pull_var()? as usize;
                Frame::NewToken {
                    token: buf.pull_bytes(length)?,
                }
            }
            _ if ty.is_stream() => {
                let stream_id = buf.pull_var()?;
                let offset = if ty.0 & 0x04 != 0 { buf.pull_var()? } else { 0 };
                let length = if ty.0 & 0x02 != 0 {
                    buf.pull_var()? as usize
                } else {
                    buf.remaining()
                };
                Frame::Stream {
                    stream_id,
                    offset,
                    data: buf.pull_bytes(length)?,
                    fin: ty.0 & 0x01 != 0,
                }
            }
            Type::MAX_DATA => Frame::MaxData(buf.pull_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: buf.pull_var()?,
                limit: buf.pull_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreamsBidi(buf.pull_var()?),
            Type::MAX_STREAMS_UNI => Frame::MaxStreamsUni(buf.pull_var()?),
            Type::DATA_BLOCKED => Frame::DataBlocked(buf.pull_var()?),
            Type::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: buf.pull_var()?,
                limit: buf.pull_var()?,
            },
            Type::STREAMS_BLOCKED_BIDI => Frame::StreamsBlockedBidi(buf.pull_var()?),
            Type::STREAMS_BLOCKED_UNI => Frame::StreamsBlockedUni(buf.pull_var()?),
            Type::NEW_CONNECTION_ID => {
                let sequence = buf.pull_var()?;
                let retire_prior_to = buf.pull_var()?;
                let len = buf.pull_u8()? as usize;
                let cid = ConnectionId::new(&buf.pull_bytes(len)?);
                Frame::NewConnectionId {
                    sequence,
                    retire_prior_to,
                    cid,
                    reset_token: buf.pull_array::<RESET_TOKEN_SIZE>()?,
                }
            }
            Type::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: buf.pull_var()?,
            },
            Type::PATH_CHALLENGE => Frame::PathChallenge(buf.pull_array::<8>()?),
            Type::PATH_RESPONSE => Frame::PathResponse(buf.pull_array::<8>()?),
            Type::TRANSPORT_CLOSE => {
                let error_code = buf.pull_var()?;
                let frame_type = buf.pull_var()?;
                let reason_length = buf.pull_var()? as usize;
                Frame::TransportClose {
                    error_code,
                    frame_type,
                    reason: decode_reason(&buf.pull_bytes(reason_length)?),
                }
            }
            Type::APPLICATION_CLOSE => {
                let error_code = buf.pull_var()?;
                let reason_length = buf.pull_var()? as usize;
                Frame::ApplicationClose {
                    error_code,
                    reason: decode_reason(&buf.pull_bytes(reason_length)?),
                }
            }
            Type(other) => return Err(ParseError::UnknownType(other)),
        };
        Ok((ty, frame))
    }
}

fn decode_reason(bytes: &[u8]) -> String {
    String::from_utf8(bytes.to_vec()).unwrap_or_default()
}

fn pull_ack(buf: &mut Buffer) -> Result<(RangeSet, u64), BufferError> {
    let mut ranges = RangeSet::new();
    let mut end = buf.pull_var()?; // largest acknowledged
    let delay = buf.pull_var()?;
    let range_count = buf.pull_var()?;
    let mut count = buf.pull_var()?; // first ack range
    ranges.add(end.saturating_sub(count), end + 1);
    end = end.saturating_sub(count);
    for _ in 0..range_count {
        end = end.saturating_sub(buf.pull_var()? + 2);
        count = buf.pull_var()?;
        ranges.add(end.saturating_sub(count), end + 1);
        end = end.saturating_sub(count);
    }
    Ok((ranges, delay))
}

/// Write an ACK frame body (everything after the frame type) for `ranges`,
/// highest range first per the wire format.
pub fn push_ack(buf: &mut Buffer, ranges: &RangeSet, delay: u64) -> Result<(), BufferError> {
    debug_assert!(!ranges.is_empty());
    let mut index = ranges.len() - 1;
    let r = ranges.get(index).expect("ack queue is not empty");
    buf.push_var(r.end - 1)?;
    buf.push_var(delay)?;
    buf.push_var(index as u64)?;
    buf.push_var(r.end - 1 - r.start)?;
    let mut start = r.start;
    while index > 0 {
        index -= 1;
        let r = ranges.get(index).expect("index in bounds");
        buf.push_var(start - r.end - 1)?;
        buf.push_var(r.end - r.start - 1)?;
        start = r.start;
    }
    Ok(())
}

pub fn push_new_connection_id(
    buf: &mut Buffer,
    sequence: u64,
    retire_prior_to: u64,
    cid: &ConnectionId,
    reset_token: &[u8; RESET_TOKEN_SIZE],
) -> Result<(), BufferError> {
    buf.push_var(sequence)?;
    buf.push_var(retire_prior_to)?;
    buf.push_u8(cid.len() as u8)?;
    buf.push_bytes(cid)?;
    buf.push_bytes(reset_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse_all(data: &[u8]) -> Vec<(Type, Frame)> {
        let mut buf = Buffer::wrap(data);
        let mut out = Vec::new();
        while !buf.eof() {
            out.push(Frame::parse(&mut buf).unwrap());
        }
        out
    }

    #[test]
    fn ack_round_trip() {
        let mut ranges = RangeSet::new();
        ranges.add(0, 3);
        ranges.add(5, 6);
        ranges.add(9, 12);

        let mut buf = Buffer::new(64);
        buf.push_var(Type::ACK.0).unwrap();
        push_ack(&mut buf, &ranges, 17).unwrap();
        let frames = parse_all(buf.data());
        assert_eq!(frames.len(), 1);
        assert_matches!(
            &frames[0],
            (ty, Frame::Ack { ranges: parsed, delay: 17 })
                if *ty == Type::ACK && *parsed == ranges
        );
    }

    #[test]
    fn ack_ecn_counts_discarded() {
        let mut ranges = RangeSet::new();
        ranges.add(7, 8);
        let mut buf = Buffer::new(64);
        buf.push_var(Type::ACK_ECN.0).unwrap();
        push_ack(&mut buf, &ranges, 0).unwrap();
        buf.push_var(1).unwrap();
        buf.push_var(2).unwrap();
        buf.push_var(3).unwrap();
        let frames = parse_all(buf.data());
        assert_matches!(&frames[0], (_, Frame::Ack { .. }));
    }

    #[test]
    fn stream_frame_variants() {
        // OFF | LEN | FIN
        let mut buf = Buffer::new(64);
        buf.push_var(Type::STREAM_BASE.0 | 0x07).unwrap();
        buf.push_var(4).unwrap();
        buf.push_var(100).unwrap();
        buf.push_var(5).unwrap();
        buf.push_bytes(b"hello").unwrap();
        let frames = parse_all(buf.data());
        assert_matches!(
            &frames[0],
            (_, Frame::Stream { stream_id: 4, offset: 100, data, fin: true })
                if &data[..] == b"hello"
        );

        // no OFF, no LEN: data extends to the end of the packet
        let mut buf = Buffer::new(64);
        buf.push_var(Type::STREAM_BASE.0).unwrap();
        buf.push_var(0).unwrap();
        buf.push_bytes(b"tail").unwrap();
        let frames = parse_all(buf.data());
        assert_matches!(
            &frames[0],
            (_, Frame::Stream { stream_id: 0, offset: 0, data, fin: false })
                if &data[..] == b"tail"
        );
    }

    #[test]
    fn new_connection_id_round_trip() {
        let cid = ConnectionId::new(&[0xAA; 8]);
        let token = [0x55; RESET_TOKEN_SIZE];
        let mut buf = Buffer::new(64);
        buf.push_var(Type::NEW_CONNECTION_ID.0).unwrap();
        push_new_connection_id(&mut buf, 3, 1, &cid, &token).unwrap();
        let frames = parse_all(buf.data());
        assert_matches!(
            &frames[0],
            (_, Frame::NewConnectionId { sequence: 3, retire_prior_to: 1, cid: parsed, reset_token })
                if *parsed == cid && *reset_token == token
        );
    }

    #[test]
    fn close_frames() {
        let mut buf = Buffer::new(64);
        buf.push_var(Type::TRANSPORT_CLOSE.0).unwrap();
        buf.push_var(0x0A).unwrap();
        buf.push_var(0x06).unwrap();
        buf.push_var(3).unwrap();
        buf.push_bytes(b"bad").unwrap();
        buf.push_var(Type::APPLICATION_CLOSE.0).unwrap();
        buf.push_var(9).unwrap();
        buf.push_var(0).unwrap();
        let frames = parse_all(buf.data());
        assert_matches!(
            &frames[0],
            (_, Frame::TransportClose { error_code: 0x0A, frame_type: 0x06, reason }) if reason == "bad"
        );
        assert_matches!(
            &frames[1],
            (_, Frame::ApplicationClose { error_code: 9, reason }) if reason.is_empty()
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = Buffer::wrap(&[0x1E]);
        assert_matches!(Frame::parse(&mut buf), Err(ParseError::UnknownType(0x1E)));
    }

    #[test]
    fn epoch_permissions() {
        assert!(Type::CRYPTO.is_allowed_in(Epoch::Initial));
        assert!(Type::CRYPTO.is_allowed_in(Epoch::Handshake));
        assert!(!Type::CRYPTO.is_allowed_in(Epoch::ZeroRtt));
        assert!(!Type::ACK.is_allowed_in(Epoch::ZeroRtt));
        assert!(!Type::NEW_TOKEN.is_allowed_in(Epoch::ZeroRtt));
        assert!(Type::STREAM_BASE.is_allowed_in(Epoch::ZeroRtt));
        assert!(!Type::STREAM_BASE.is_allowed_in(Epoch::Initial));
        assert!(Type::TRANSPORT_CLOSE.is_allowed_in(Epoch::Initial));
        assert!(!Type::APPLICATION_CLOSE.is_allowed_in(Epoch::Handshake));
        assert!(Type::PING.is_allowed_in(Epoch::Initial));
        assert!(!Type::RETIRE_CONNECTION_ID.is_allowed_in(Epoch::ZeroRtt));
    }

    #[test]
    fn classification() {
        assert!(!Type::ACK.is_ack_eliciting());
        assert!(!Type::PADDING.is_ack_eliciting());
        assert!(Type::PING.is_ack_eliciting());
        assert!(Type::PATH_CHALLENGE.is_probing());
        assert!(!Type::STREAM_BASE.is_probing());
    }
}
