//! Assembles frames into packets and coalesces packets into datagrams,
//! under MTU, congestion-window and anti-amplification limits.
//!
//! Headers are written after the payload: `start_packet` reserves space,
//! frames are pushed, and `end_packet` seeks back to finalize the header,
//! encrypt in place, and account the result.

use bytes::Bytes;

use crate::coding::{size_varint, Buffer, BufferError};
use crate::crypto::{CryptoPair, CryptoError, AEAD_TAG_SIZE};
use crate::frame;
use crate::packet::{
    is_long_header, ConnectionId, KEY_PHASE_BIT, PACKET_NUMBER_MAX_SIZE, PACKET_NUMBER_SEND_SIZE,
    PACKET_TYPE_INITIAL, PACKET_TYPE_HANDSHAKE, PACKET_TYPE_MASK, SPIN_BIT,
};
use crate::tls::Epoch;
use crate::MAX_UDP_PAYLOAD;

pub const PACKET_MAX_SIZE: usize = MAX_UDP_PAYLOAD;
pub const PACKET_LENGTH_SEND_SIZE: usize = 2;

/// Headroom below which we stop adding packets to the current datagram.
const MIN_PACKET_ROOM: usize = 128;

/// A delivery obligation attached to a sent packet, applied by the
/// connection when the packet is acknowledged or declared lost.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An ACK frame acknowledging everything up to `largest`.
    AckFrame { epoch: Epoch, largest: u64 },
    Stream {
        stream_id: u64,
        start: u64,
        stop: u64,
        fin: bool,
    },
    Crypto {
        epoch: Epoch,
        start: u64,
        stop: u64,
    },
    NewConnectionId { sequence: u64 },
    RetireConnectionId { sequence: u64 },
    Ping { uids: Vec<u64> },
    MaxData,
    MaxStreamData { stream_id: u64 },
}

/// Record of one transmitted packet, tracked by recovery until it is
/// acknowledged, lost, or its epoch is discarded.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub epoch: Epoch,
    pub in_flight: bool,
    pub is_ack_eliciting: bool,
    pub is_crypto_packet: bool,
    pub packet_number: u64,
    pub packet_type: u8,
    pub sent_time: f64,
    pub sent_bytes: usize,
    pub delivery: Vec<Delivery>,
}

/// Raised when the builder has no room left for any further packet in this
/// batch.
#[derive(Debug, Copy, Clone, thiserror::Error)]
#[error("no space left for packets")]
pub struct BuilderStop;

pub struct PacketBuilder {
    /// Congestion budget: ack-eliciting bytes must stay below this.
    pub max_flight_bytes: Option<usize>,
    /// Anti-amplification budget on unvalidated paths.
    pub max_total_bytes: Option<usize>,

    host_cid: ConnectionId,
    peer_cid: ConnectionId,
    peer_token: Bytes,
    version: u32,
    pad_first_datagram: bool,
    spin_bit: bool,

    // assembled datagrams and packets
    ack_eliciting: bool,
    datagrams: Vec<Vec<u8>>,
    datagram_init: bool,
    packets: Vec<SentPacket>,
    flight_bytes: usize,
    total_bytes: usize,

    // current packet
    header_size: usize,
    packet: Option<SentPacket>,
    packet_long_header: bool,
    packet_number: u64,
    packet_start: usize,
    packet_type: u8,

    pub buffer: Buffer,
    capacity: usize,
}

impl PacketBuilder {
    pub fn new(
        host_cid: ConnectionId,
        peer_cid: ConnectionId,
        version: u32,
        packet_number: u64,
        peer_token: Bytes,
        pad_first_datagram: bool,
        spin_bit: bool,
    ) -> Self {
        Self {
            max_flight_bytes: None,
            max_total_bytes: None,
            host_cid,
            peer_cid,
            peer_token,
            version,
            pad_first_datagram,
            spin_bit,
            ack_eliciting: false,
            datagrams: Vec::new(),
            datagram_init: true,
            packets: Vec::new(),
            flight_bytes: 0,
            total_bytes: 0,
            header_size: 0,
            packet: None,
            packet_long_header: false,
            packet_number,
            packet_start: 0,
            packet_type: 0,
            buffer: Buffer::new(PACKET_MAX_SIZE),
            capacity: PACKET_MAX_SIZE,
        }
    }

    /// The packet number the next packet will carry.
    pub fn packet_number(&self) -> u64 {
        self.packet_number
    }

    /// Bytes still usable for frames in the current packet.
    pub fn remaining_space(&self) -> usize {
        self.capacity
            .saturating_sub(self.buffer.tell())
            .saturating_sub(AEAD_TAG_SIZE)
    }

    /// Hand over the assembled datagrams and their sent-packet records.
    pub fn flush(&mut self) -> (Vec<Vec<u8>>, Vec<SentPacket>) {
        self.flush_current_datagram();
        (
            std::mem::take(&mut self.datagrams),
            std::mem::take(&mut self.packets),
        )
    }

    /// Start a frame: write its type varint, classify the packet, and
    /// record the delivery obligation if one is supplied.
    pub fn start_frame(
        &mut self,
        frame_type: frame::Type,
        delivery: Option<Delivery>,
    ) -> Result<(), BufferError> {
        self.buffer.push_var(frame_type.0)?;
        let packet = self.packet.as_mut().expect("start_packet comes first");
        if frame_type.is_ack_eliciting() {
            packet.in_flight = true;
            packet.is_ack_eliciting = true;
            self.ack_eliciting = true;
        }
        if frame_type == frame::Type::CRYPTO {
            packet.is_crypto_packet = true;
        }
        if let Some(delivery) = delivery {
            packet.delivery.push(delivery);
        }
        Ok(())
    }

    /// Start a packet of `packet_type`, flushing the current datagram first
    /// if too little room remains in it.
    pub fn start_packet(&mut self, packet_type: u8) -> Result<(), BuilderStop> {
        self.ack_eliciting = false;

        let mut packet_start = self.buffer.tell();
        if self.capacity.saturating_sub(packet_start) < MIN_PACKET_ROOM {
            self.flush_current_datagram();
            packet_start = 0;
        }

        // apply the flight and amplification budgets once per datagram
        if self.datagram_init {
            if let Some(max_flight) = self.max_flight_bytes {
                let remaining = max_flight.saturating_sub(self.flight_bytes);
                if remaining < self.capacity {
                    self.capacity = remaining;
                }
            }
            if let Some(max_total) = self.max_total_bytes {
                let remaining = max_total.saturating_sub(self.total_bytes);
                if remaining < self.capacity {
                    self.capacity = remaining;
                }
            }
            self.datagram_init = false;
        }

        let packet_long_header = is_long_header(packet_type);
        let header_size = if packet_long_header {
            let mut size = 11 + self.peer_cid.len() + self.host_cid.len();
            if packet_type & PACKET_TYPE_MASK == PACKET_TYPE_INITIAL {
                size += size_varint(self.peer_token.len() as u64) + self.peer_token.len();
            }
            size
        } else {
            3 + self.peer_cid.len()
        };

        if packet_start + header_size >= self.capacity {
            return Err(BuilderStop);
        }

        let epoch = match packet_type {
            PACKET_TYPE_INITIAL => Epoch::Initial,
            PACKET_TYPE_HANDSHAKE => Epoch::Handshake,
            _ => Epoch::OneRtt,
        };

        self.header_size = header_size;
        self.packet = Some(SentPacket {
            epoch,
            in_flight: false,
            is_ack_eliciting: false,
            is_crypto_packet: false,
            packet_number: self.packet_number,
            packet_type,
            sent_time: 0.0,
            sent_bytes: 0,
            delivery: Vec::new(),
        });
        self.packet_long_header = packet_long_header;
        self.packet_start = packet_start;
        self.packet_type = packet_type;
        self.buffer.seek(packet_start + header_size);
        Ok(())
    }

    /// Finalize the current packet: write the header, encrypt in place and
    /// record the result. Returns `false` if no frame was written, in which
    /// case the packet is cancelled.
    pub fn end_packet(&mut self, crypto: &CryptoPair) -> Result<bool, CryptoError> {
        let buf = &mut self.buffer;
        let mut packet_size = buf.tell() - self.packet_start;
        if packet_size <= self.header_size {
            // cancel the empty packet
            buf.seek(self.packet_start);
            self.packet = None;
            return Ok(false);
        }

        // pad the client's first datagram up to the full MTU
        if self.pad_first_datagram {
            let pad = self
                .capacity
                .saturating_sub(buf.tell())
                .saturating_sub(AEAD_TAG_SIZE);
            let _ = buf.push_bytes(&vec![0; pad]);
            packet_size = buf.tell() - self.packet_start;
            self.pad_first_datagram = false;
        }

        if self.packet_long_header {
            let length =
                packet_size - self.header_size + PACKET_NUMBER_SEND_SIZE + AEAD_TAG_SIZE;
            buf.seek(self.packet_start);
            let _ = buf.push_u8(self.packet_type | (PACKET_NUMBER_SEND_SIZE as u8 - 1));
            let _ = buf.push_u32(self.version);
            let _ = buf.push_u8(self.peer_cid.len() as u8);
            let _ = buf.push_bytes(&self.peer_cid);
            let _ = buf.push_u8(self.host_cid.len() as u8);
            let _ = buf.push_bytes(&self.host_cid);
            if self.packet_type & PACKET_TYPE_MASK == PACKET_TYPE_INITIAL {
                let _ = buf.push_var(self.peer_token.len() as u64);
                let _ = buf.push_bytes(&self.peer_token);
            }
            let _ = buf.push_u16(length as u16 | 0x4000);
            let _ = buf.push_u16(self.packet_number as u16);
        } else {
            buf.seek(self.packet_start);
            let _ = buf.push_u8(
                self.packet_type
                    | if self.spin_bit { SPIN_BIT } else { 0 }
                    | if crypto.key_phase { KEY_PHASE_BIT } else { 0 }
                    | (PACKET_NUMBER_SEND_SIZE as u8 - 1),
            );
            let _ = buf.push_bytes(&self.peer_cid);
            let _ = buf.push_u16(self.packet_number as u16);

            // ensure the truncated packet number leaves a full
            // header-protection sample in short packets
            let padding_size = (PACKET_NUMBER_MAX_SIZE - PACKET_NUMBER_SEND_SIZE
                + self.header_size) as isize
                - packet_size as isize;
            if padding_size > 0 {
                buf.seek(self.packet_start + packet_size);
                let _ = buf.push_bytes(&vec![0; padding_size as usize]);
                packet_size += padding_size as usize;
            }
        }

        // encrypt in place
        let plain = buf
            .data_slice(self.packet_start, self.packet_start + packet_size)
            .to_vec();
        let protected = crypto.encrypt_packet(
            &plain[..self.header_size],
            &plain[self.header_size..],
            self.packet_number,
        )?;
        buf.seek(self.packet_start);
        let _ = buf.push_bytes(&protected);

        let mut packet = self.packet.take().expect("start_packet comes first");
        packet.sent_bytes = buf.tell() - self.packet_start;
        self.packets.push(packet);

        // short-header packets cannot be coalesced with anything after them
        if !self.packet_long_header {
            self.flush_current_datagram();
        }

        self.packet_number += 1;
        Ok(true)
    }

    fn flush_current_datagram(&mut self) {
        let datagram_bytes = self.buffer.tell();
        if datagram_bytes > 0 {
            self.datagrams.push(self.buffer.data().to_vec());
            self.datagram_init = true;
            if self.ack_eliciting {
                self.flight_bytes += datagram_bytes;
            }
            self.total_bytes += datagram_bytes;
            self.buffer.seek(0);
        }
    }
}
