//! Packet headers: parsing, serialization and packet-number handling.
//!
//! Covers the long and short header forms, Retry and Version Negotiation,
//! and the truncated packet-number window algorithm. Packet protection
//! itself lives in [`crate::crypto`].

use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use rand::RngCore;

use crate::coding::{Buffer, BufferError};
use crate::tls::Epoch;
use crate::{MAX_CID_SIZE, VERSION_NEGOTIATION};

pub const LONG_HEADER_FORM: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;
pub const SPIN_BIT: u8 = 0x20;
pub const KEY_PHASE_BIT: u8 = 0x04;

pub const PACKET_TYPE_INITIAL: u8 = LONG_HEADER_FORM | FIXED_BIT;
pub const PACKET_TYPE_ZERO_RTT: u8 = LONG_HEADER_FORM | FIXED_BIT | 0x10;
pub const PACKET_TYPE_HANDSHAKE: u8 = LONG_HEADER_FORM | FIXED_BIT | 0x20;
pub const PACKET_TYPE_RETRY: u8 = LONG_HEADER_FORM | FIXED_BIT | 0x30;
pub const PACKET_TYPE_ONE_RTT: u8 = FIXED_BIT;
pub const PACKET_TYPE_MASK: u8 = 0xF0;

/// Largest packet-number encoding we ever have to undo on receive.
pub const PACKET_NUMBER_MAX_SIZE: usize = 4;
/// Packet numbers are truncated to two bytes on send.
pub const PACKET_NUMBER_SEND_SIZE: usize = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeaderError {
    #[error("packet too short: {0}")]
    UnexpectedEnd(#[from] BufferError),
    #[error("packet fixed bit is zero")]
    FixedBitZero,
}

/// Connection ID: up to 18 opaque bytes identifying a connection
/// independently of the peer's address.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        ConnectionId::new(&[])
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// An unprotected packet header, as pulled off the wire before decryption.
#[derive(Debug, Clone)]
pub struct Header {
    pub is_long_header: bool,
    /// `None` on short headers.
    pub version: Option<u32>,
    /// First byte with the type mask applied; meaningless for Version
    /// Negotiation.
    pub packet_type: u8,
    pub dst_cid: ConnectionId,
    pub src_cid: ConnectionId,
    /// Only present on Retry packets.
    pub original_dst_cid: ConnectionId,
    pub token: Bytes,
    /// Bytes of packet number + payload + tag remaining after the header.
    pub rest_length: usize,
}

impl Header {
    pub fn is_version_negotiation(&self) -> bool {
        self.version == Some(VERSION_NEGOTIATION)
    }

    pub fn epoch(&self) -> Epoch {
        match self.packet_type {
            PACKET_TYPE_INITIAL => Epoch::Initial,
            PACKET_TYPE_ZERO_RTT => Epoch::ZeroRtt,
            PACKET_TYPE_HANDSHAKE => Epoch::Handshake,
            _ => Epoch::OneRtt,
        }
    }
}

pub fn is_long_header(first_byte: u8) -> bool {
    first_byte & LONG_HEADER_FORM != 0
}

pub fn get_spin_bit(first_byte: u8) -> bool {
    first_byte & SPIN_BIT != 0
}

/// Parse one packet header out of `buf`, leaving the position at the start
/// of the protected packet number field (or, for Retry and Version
/// Negotiation, past everything this packet owns).
pub fn pull_header(buf: &mut Buffer, host_cid_len: usize) -> Result<Header, HeaderError> {
    let first_byte = buf.pull_u8()?;

    if is_long_header(first_byte) {
        let version = buf.pull_u32()?;

        let dst_cid_len = buf.pull_u8()? as usize;
        let dst_cid = ConnectionId::new(&buf.pull_bytes(dst_cid_len)?);
        let src_cid_len = buf.pull_u8()? as usize;
        let src_cid = ConnectionId::new(&buf.pull_bytes(src_cid_len)?);

        let mut original_dst_cid = ConnectionId::default();
        let mut token = Bytes::new();
        let packet_type;
        let rest_length;
        if version == VERSION_NEGOTIATION {
            packet_type = 0;
            rest_length = buf.remaining();
        } else {
            if first_byte & FIXED_BIT == 0 {
                return Err(HeaderError::FixedBitZero);
            }
            packet_type = first_byte & PACKET_TYPE_MASK;
            match packet_type {
                PACKET_TYPE_INITIAL => {
                    let token_length = buf.pull_var()? as usize;
                    token = buf.pull_bytes(token_length)?;
                    rest_length = buf.pull_var()? as usize;
                }
                PACKET_TYPE_RETRY => {
                    let odcid_len = buf.pull_u8()? as usize;
                    original_dst_cid = ConnectionId::new(&buf.pull_bytes(odcid_len)?);
                    token = buf.pull_bytes(buf.remaining())?;
                    rest_length = 0;
                }
                _ => {
                    rest_length = buf.pull_var()? as usize;
                }
            }
        }

        Ok(Header {
            is_long_header: true,
            version: Some(version),
            packet_type,
            dst_cid,
            src_cid,
            original_dst_cid,
            token,
            rest_length,
        })
    } else {
        if first_byte & FIXED_BIT == 0 {
            return Err(HeaderError::FixedBitZero);
        }
        let dst_cid = ConnectionId::new(&buf.pull_bytes(host_cid_len)?);
        Ok(Header {
            is_long_header: false,
            version: None,
            packet_type: first_byte & PACKET_TYPE_MASK,
            dst_cid,
            src_cid: ConnectionId::default(),
            original_dst_cid: ConnectionId::default(),
            token: Bytes::new(),
            rest_length: buf.remaining(),
        })
    }
}

/// Recover a full packet number from its truncated form using the standard
/// window algorithm, anchored on the next packet number we expect.
pub fn decode_packet_number(truncated: u64, num_bits: u32, expected: u64) -> u64 {
    let window = 1u64 << num_bits;
    let half_window = window / 2;
    let candidate = (expected & !(window - 1)) | truncated;
    if candidate + half_window <= expected {
        candidate + window
    } else if candidate > expected + half_window && candidate > window {
        candidate - window
    } else {
        candidate
    }
}

/// Assemble a Retry packet. Retry carries no packet number or payload, so
/// it is not protected.
pub fn encode_retry(
    version: u32,
    src_cid: &ConnectionId,
    dst_cid: &ConnectionId,
    original_dst_cid: &ConnectionId,
    retry_token: &[u8],
) -> Vec<u8> {
    let mut buf = Buffer::new(
        8 + dst_cid.len() + src_cid.len() + original_dst_cid.len() + retry_token.len(),
    );
    // infallible: the capacity was computed above
    let _ = buf.push_u8(PACKET_TYPE_RETRY);
    let _ = buf.push_u32(version);
    let _ = buf.push_u8(dst_cid.len() as u8);
    let _ = buf.push_bytes(dst_cid);
    let _ = buf.push_u8(src_cid.len() as u8);
    let _ = buf.push_bytes(src_cid);
    let _ = buf.push_u8(original_dst_cid.len() as u8);
    let _ = buf.push_bytes(original_dst_cid);
    let _ = buf.push_bytes(retry_token);
    buf.data().to_vec()
}

/// Assemble a Version Negotiation packet listing `supported_versions`.
pub fn encode_version_negotiation<R: RngCore>(
    rng: &mut R,
    src_cid: &ConnectionId,
    dst_cid: &ConnectionId,
    supported_versions: &[u32],
) -> Vec<u8> {
    let mut buf = Buffer::new(7 + dst_cid.len() + src_cid.len() + 4 * supported_versions.len());
    let _ = buf.push_u8((rng.next_u32() as u8) | LONG_HEADER_FORM);
    let _ = buf.push_u32(VERSION_NEGOTIATION);
    let _ = buf.push_u8(dst_cid.len() as u8);
    let _ = buf.push_bytes(dst_cid);
    let _ = buf.push_u8(src_cid.len() as u8);
    let _ = buf.push_bytes(src_cid);
    for &version in supported_versions {
        let _ = buf.push_u32(version);
    }
    buf.data().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::VERSION_DRAFT_22;

    #[test]
    fn parse_initial_header() {
        let dst = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let src = ConnectionId::new(&[9, 10, 11, 12]);
        let mut buf = Buffer::new(64);
        buf.push_u8(PACKET_TYPE_INITIAL | 0x01).unwrap();
        buf.push_u32(VERSION_DRAFT_22).unwrap();
        buf.push_u8(8).unwrap();
        buf.push_bytes(&dst).unwrap();
        buf.push_u8(4).unwrap();
        buf.push_bytes(&src).unwrap();
        buf.push_var(2).unwrap(); // token length
        buf.push_bytes(b"ab").unwrap();
        buf.push_var(23).unwrap(); // rest length
        let end = buf.tell();

        let data = buf.data().to_vec();
        let mut buf = Buffer::wrap(&data);
        let header = pull_header(&mut buf, 8).unwrap();
        assert!(header.is_long_header);
        assert_eq!(header.version, Some(VERSION_DRAFT_22));
        assert_eq!(header.packet_type, PACKET_TYPE_INITIAL);
        assert_eq!(header.dst_cid, dst);
        assert_eq!(header.src_cid, src);
        assert_eq!(&header.token[..], b"ab");
        assert_eq!(header.rest_length, 23);
        assert_eq!(header.epoch(), Epoch::Initial);
        assert_eq!(buf.tell(), end);
    }

    #[test]
    fn parse_short_header() {
        let dst = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = Buffer::new(16);
        buf.push_u8(PACKET_TYPE_ONE_RTT | 0x01).unwrap();
        buf.push_bytes(&dst).unwrap();
        buf.push_u16(0xBEEF).unwrap(); // truncated packet number, protected
        let data = buf.data().to_vec();

        let mut buf = Buffer::wrap(&data);
        let header = pull_header(&mut buf, 8).unwrap();
        assert!(!header.is_long_header);
        assert_eq!(header.version, None);
        assert_eq!(header.dst_cid, dst);
        assert_eq!(header.rest_length, 2);
        assert_eq!(header.epoch(), Epoch::OneRtt);
    }

    #[test]
    fn fixed_bit_zero_rejected() {
        let mut buf = Buffer::new(16);
        buf.push_u8(LONG_HEADER_FORM).unwrap(); // fixed bit clear
        buf.push_u32(VERSION_DRAFT_22).unwrap();
        buf.push_u8(0).unwrap();
        buf.push_u8(0).unwrap();
        let data = buf.data().to_vec();
        let mut buf = Buffer::wrap(&data);
        assert_matches!(pull_header(&mut buf, 8), Err(HeaderError::FixedBitZero));
    }

    #[test]
    fn version_negotiation_round_trip() {
        let src = ConnectionId::new(&[7; 8]);
        let dst = ConnectionId::new(&[3; 5]);
        let versions = [0x1A2A_3A4A, VERSION_DRAFT_22];
        let data = encode_version_negotiation(&mut rand::thread_rng(), &src, &dst, &versions);

        let mut buf = Buffer::wrap(&data);
        let header = pull_header(&mut buf, 8).unwrap();
        assert!(header.is_version_negotiation());
        assert_eq!(header.src_cid, src);
        assert_eq!(header.dst_cid, dst);
        let mut parsed = Vec::new();
        while !buf.eof() {
            parsed.push(buf.pull_u32().unwrap());
        }
        assert_eq!(parsed, versions);
    }

    #[test]
    fn retry_round_trip() {
        let src = ConnectionId::new(&[1; 8]);
        let dst = ConnectionId::new(&[2; 8]);
        let odcid = ConnectionId::new(&[3; 8]);
        let data = encode_retry(VERSION_DRAFT_22, &src, &dst, &odcid, b"token-bytes");

        let mut buf = Buffer::wrap(&data);
        let header = pull_header(&mut buf, 8).unwrap();
        assert_eq!(header.packet_type, PACKET_TYPE_RETRY);
        assert_eq!(header.src_cid, src);
        assert_eq!(header.dst_cid, dst);
        assert_eq!(header.original_dst_cid, odcid);
        assert_eq!(&header.token[..], b"token-bytes");
        assert_eq!(header.rest_length, 0);
        assert!(buf.eof());
    }

    #[test]
    fn packet_number_window() {
        // example from the transport draft appendix
        assert_eq!(decode_packet_number(0x9b32, 16, 0xa82f30eb), 0xa82f9b32);
        // wrap upwards
        assert_eq!(decode_packet_number(0x0001, 16, 0x1_FFFF), 0x2_0001);
        // stay in window
        assert_eq!(decode_packet_number(0x0002, 16, 0x1_0001), 0x1_0002);
        // low expected values
        assert_eq!(decode_packet_number(5, 16, 0), 5);
    }
}
