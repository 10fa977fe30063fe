//! The QUIC transport parameters TLS extension.
//!
//! Parameters are carried as a u16-length block of (u16 id, u16 length,
//! value) entries; integer-valued parameters encode their value as a
//! varint, byte-valued ones as raw bytes, and flags as an empty value.

use crate::coding::{Buffer, BufferError};
use crate::frame;
use crate::packet::ConnectionId;
use crate::{ErrorCode, TransportError, RESET_TOKEN_SIZE};

const PARAM_ORIGINAL_CONNECTION_ID: u16 = 0x00;
const PARAM_IDLE_TIMEOUT: u16 = 0x01;
const PARAM_STATELESS_RESET_TOKEN: u16 = 0x02;
const PARAM_MAX_PACKET_SIZE: u16 = 0x03;
const PARAM_INITIAL_MAX_DATA: u16 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u16 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u16 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u16 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u16 = 0x0A;
const PARAM_MAX_ACK_DELAY: u16 = 0x0B;
const PARAM_DISABLE_MIGRATION: u16 = 0x0C;
const PARAM_PREFERRED_ADDRESS: u16 = 0x0D;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u16 = 0x0E;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportParameters {
    pub original_connection_id: Option<ConnectionId>,
    /// Milliseconds.
    pub idle_timeout: Option<u64>,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    pub max_packet_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u64>,
    /// Milliseconds.
    pub max_ack_delay: Option<u64>,
    pub disable_migration: bool,
    pub active_connection_id_limit: Option<u64>,
}

impl TransportParameters {
    pub fn pull(buf: &mut Buffer) -> Result<Self, BufferError> {
        let mut params = TransportParameters::default();
        let block_length = buf.pull_u16()? as usize;
        let end = buf.tell() + block_length;
        while buf.tell() < end {
            let param_id = buf.pull_u16()?;
            let param_len = buf.pull_u16()? as usize;
            let param_start = buf.tell();
            match param_id {
                PARAM_ORIGINAL_CONNECTION_ID => {
                    params.original_connection_id =
                        Some(ConnectionId::new(&buf.pull_bytes(param_len)?));
                }
                PARAM_IDLE_TIMEOUT => params.idle_timeout = Some(buf.pull_var()?),
                PARAM_STATELESS_RESET_TOKEN => {
                    params.stateless_reset_token = Some(buf.pull_array::<RESET_TOKEN_SIZE>()?);
                }
                PARAM_MAX_PACKET_SIZE => params.max_packet_size = Some(buf.pull_var()?),
                PARAM_INITIAL_MAX_DATA => params.initial_max_data = Some(buf.pull_var()?),
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = Some(buf.pull_var()?);
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = Some(buf.pull_var()?);
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = Some(buf.pull_var()?);
                }
                PARAM_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = Some(buf.pull_var()?);
                }
                PARAM_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = Some(buf.pull_var()?);
                }
                PARAM_ACK_DELAY_EXPONENT => params.ack_delay_exponent = Some(buf.pull_var()?),
                PARAM_MAX_ACK_DELAY => params.max_ack_delay = Some(buf.pull_var()?),
                PARAM_DISABLE_MIGRATION => params.disable_migration = true,
                PARAM_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = Some(buf.pull_var()?);
                }
                _ => {
                    // unknown parameters (and the unsupported preferred
                    // address) are skipped
                    buf.pull_bytes(param_len)?;
                }
            }
            // a parameter whose value does not fill its declared length is
            // malformed
            if buf.tell() != param_start + param_len {
                return Err(BufferError::ReadPastEnd);
            }
        }
        Ok(params)
    }

    pub fn push(&self, buf: &mut Buffer) -> Result<(), BufferError> {
        let block_start = buf.tell();
        buf.push_u16(0)?; // patched below
        if let Some(cid) = self.original_connection_id {
            push_bytes_param(buf, PARAM_ORIGINAL_CONNECTION_ID, &cid)?;
        }
        if let Some(v) = self.idle_timeout {
            push_int_param(buf, PARAM_IDLE_TIMEOUT, v)?;
        }
        if let Some(token) = self.stateless_reset_token {
            push_bytes_param(buf, PARAM_STATELESS_RESET_TOKEN, &token)?;
        }
        if let Some(v) = self.max_packet_size {
            push_int_param(buf, PARAM_MAX_PACKET_SIZE, v)?;
        }
        if let Some(v) = self.initial_max_data {
            push_int_param(buf, PARAM_INITIAL_MAX_DATA, v)?;
        }
        if let Some(v) = self.initial_max_stream_data_bidi_local {
            push_int_param(buf, PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, v)?;
        }
        if let Some(v) = self.initial_max_stream_data_bidi_remote {
            push_int_param(buf, PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, v)?;
        }
        if let Some(v) = self.initial_max_stream_data_uni {
            push_int_param(buf, PARAM_INITIAL_MAX_STREAM_DATA_UNI, v)?;
        }
        if let Some(v) = self.initial_max_streams_bidi {
            push_int_param(buf, PARAM_INITIAL_MAX_STREAMS_BIDI, v)?;
        }
        if let Some(v) = self.initial_max_streams_uni {
            push_int_param(buf, PARAM_INITIAL_MAX_STREAMS_UNI, v)?;
        }
        if let Some(v) = self.ack_delay_exponent {
            push_int_param(buf, PARAM_ACK_DELAY_EXPONENT, v)?;
        }
        if let Some(v) = self.max_ack_delay {
            push_int_param(buf, PARAM_MAX_ACK_DELAY, v)?;
        }
        if self.disable_migration {
            buf.push_u16(PARAM_DISABLE_MIGRATION)?;
            buf.push_u16(0)?;
        }
        if let Some(v) = self.active_connection_id_limit {
            push_int_param(buf, PARAM_ACTIVE_CONNECTION_ID_LIMIT, v)?;
        }
        let end = buf.tell();
        buf.seek(block_start);
        buf.push_u16((end - block_start - 2) as u16)?;
        buf.seek(end);
        Ok(())
    }

    /// Client-side consistency check against the Retry exchange: the
    /// server's `original_connection_id` must equal the DCID we used before
    /// the Retry, and must be absent if there was none.
    pub fn validate_original_connection_id(
        &self,
        expected: Option<&ConnectionId>,
    ) -> Result<(), TransportError> {
        if self.original_connection_id.as_ref() != expected {
            return Err(TransportError::new(
                ErrorCode::TRANSPORT_PARAMETER_ERROR,
                Some(frame::Type::CRYPTO.0),
                "original_connection_id does not match",
            ));
        }
        Ok(())
    }
}

fn push_int_param(buf: &mut Buffer, id: u16, value: u64) -> Result<(), BufferError> {
    buf.push_u16(id)?;
    buf.push_u16(crate::coding::size_varint(value) as u16)?;
    buf.push_var(value)
}

fn push_bytes_param(buf: &mut Buffer, id: u16, value: &[u8]) -> Result<(), BufferError> {
    buf.push_u16(id)?;
    buf.push_u16(value.len() as u16)?;
    buf.push_bytes(value)
}
