//! Per-stream state: reliable send buffering with retransmission, receive
//! reassembly, and flow-control accounting.
//!
//! The same machinery carries application streams and the per-epoch CRYPTO
//! streams; the latter simply never have flow control applied.

use bytes::Bytes;

use crate::range_set::RangeSet;
use crate::{ErrorCode, TransportError};

/// What happened to the bytes a sent frame carried.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryState {
    Acked,
    Lost,
    Expired,
}

#[derive(Debug, Clone, Default)]
pub struct StreamFrameData {
    pub data: Bytes,
    pub fin: bool,
    pub offset: u64,
}

#[derive(Default)]
pub struct Stream {
    /// `None` for the internal CRYPTO streams.
    pub stream_id: Option<u64>,

    // receive side
    recv_buffer: Vec<u8>,
    recv_buffer_start: u64,
    recv_highest: u64,
    recv_ranges: RangeSet,
    recv_final_size: Option<u64>,
    recv_final_delivered: bool,
    pub max_stream_data_local: u64,
    pub max_stream_data_local_sent: u64,

    // send side
    send_buffer: Vec<u8>,
    send_buffer_start: u64,
    send_buffer_stop: u64,
    send_buffer_fin: Option<u64>,
    send_pending: RangeSet,
    send_pending_eof: bool,
    send_acked: RangeSet,
    send_highest: u64,
    pub max_stream_data_remote: u64,

    /// Waiting for a MAX_STREAMS raise before any data may be sent.
    pub is_blocked: bool,
    /// A STREAM_DATA_BLOCKED announcement is due.
    pub data_blocked_pending: bool,
    /// Whether the current stall has already been announced; cleared when
    /// the peer raises the limit.
    pub data_blocked_announced: bool,
}

impl Stream {
    pub fn new(stream_id: Option<u64>, max_stream_data_local: u64, max_stream_data_remote: u64) -> Self {
        Self {
            stream_id,
            max_stream_data_local,
            max_stream_data_local_sent: max_stream_data_local,
            max_stream_data_remote,
            ..Self::default()
        }
    }

    //
    // Receive side
    //

    /// Store a frame of received data, growing the reassembly buffer as
    /// needed. Flow-control enforcement happens in the connection, which
    /// knows the connection-wide budget; final-size consistency is checked
    /// here.
    pub fn add_frame(&mut self, frame: StreamFrameData) -> Result<(), TransportError> {
        let frame_end = frame.offset + frame.data.len() as u64;
        if let Some(final_size) = self.recv_final_size {
            if frame_end > final_size || (frame.fin && frame_end != final_size) {
                return Err(TransportError::new(
                    ErrorCode::FINAL_SIZE_ERROR,
                    None,
                    "Data received beyond final size",
                ));
            }
        }
        if frame.fin {
            self.recv_final_size = Some(frame_end);
        }
        if frame_end > self.recv_highest {
            self.recv_highest = frame_end;
        }

        let mut data = frame.data;
        let mut offset = frame.offset;
        if offset < self.recv_buffer_start {
            // partially consumed already
            let skip = (self.recv_buffer_start - offset) as usize;
            if skip >= data.len() {
                return Ok(());
            }
            data = data.slice(skip..);
            offset = self.recv_buffer_start;
        }
        if !data.is_empty() {
            self.recv_ranges.add(offset, offset + data.len() as u64);
            let pos = (offset - self.recv_buffer_start) as usize;
            if pos + data.len() > self.recv_buffer.len() {
                self.recv_buffer.resize(pos + data.len(), 0);
            }
            self.recv_buffer[pos..pos + data.len()].copy_from_slice(&data);
        }
        Ok(())
    }

    pub fn has_data_to_read(&self) -> bool {
        match self.recv_ranges.first() {
            Some(r) => r.start == self.recv_buffer_start,
            None => false,
        }
    }

    /// The contiguous prefix beyond what has already been consumed.
    pub fn pull_data(&mut self) -> Bytes {
        if !self.has_data_to_read() {
            return Bytes::new();
        }
        let r = self.recv_ranges.shift().expect("checked above");
        let len = (r.end - r.start) as usize;
        let data = Bytes::copy_from_slice(&self.recv_buffer[..len]);
        self.recv_buffer.drain(..len);
        self.recv_buffer_start = r.end;
        data
    }

    /// Highest received offset; counts toward connection-level flow control.
    pub fn recv_highest(&self) -> u64 {
        self.recv_highest
    }

    pub fn recv_offset(&self) -> u64 {
        self.recv_buffer_start
    }

    /// True once the reader has consumed everything up to the final size.
    pub fn recv_at_final_size(&self) -> bool {
        self.recv_final_size == Some(self.recv_buffer_start)
    }

    /// Marks the end-of-stream signal as delivered; returns whether it had
    /// already been.
    pub fn mark_final_delivered(&mut self) -> bool {
        std::mem::replace(&mut self.recv_final_delivered, true)
    }

    //
    // Send side
    //

    pub fn write(&mut self, data: &[u8], end_stream: bool) {
        if !data.is_empty() {
            self.send_pending
                .add(self.send_buffer_stop, self.send_buffer_stop + data.len() as u64);
            self.send_buffer.extend_from_slice(data);
            self.send_buffer_stop += data.len() as u64;
        }
        if end_stream {
            self.send_buffer_fin = Some(self.send_buffer_stop);
            self.send_pending_eof = true;
        }
    }

    pub fn send_buffer_is_empty(&self) -> bool {
        self.send_pending.is_empty() && !self.send_pending_eof
    }

    /// The offset the next outgoing frame will start at.
    pub fn next_send_offset(&self) -> u64 {
        match self.send_pending.first() {
            Some(r) => r.start,
            None => self.send_buffer_stop,
        }
    }

    pub fn send_highest(&self) -> u64 {
        self.send_highest
    }

    /// Carve the next outgoing fragment, bounded by `max_size` bytes and,
    /// if given, the flow-control cap `max_offset`.
    pub fn get_frame(&mut self, max_size: usize, max_offset: Option<u64>) -> Option<StreamFrameData> {
        let r = match self.send_pending.first() {
            Some(r) => r,
            None => {
                if self.send_pending_eof {
                    // FIN-only frame
                    self.send_pending_eof = false;
                    return Some(StreamFrameData {
                        data: Bytes::new(),
                        fin: true,
                        offset: self.send_buffer_fin.unwrap_or(self.send_buffer_stop),
                    });
                }
                return None;
            }
        };
        let start = r.start;
        let mut stop = r.end.min(start + max_size as u64);
        if let Some(max_offset) = max_offset {
            if stop > max_offset {
                stop = max_offset;
            }
        }
        if stop <= start {
            return None;
        }

        let base = (start - self.send_buffer_start) as usize;
        let data =
            Bytes::copy_from_slice(&self.send_buffer[base..base + (stop - start) as usize]);
        self.send_pending.subtract(start, stop);
        if stop > self.send_highest {
            self.send_highest = stop;
        }

        let mut fin = false;
        if self.send_buffer_fin == Some(stop) && self.send_pending.is_empty() {
            fin = true;
            self.send_pending_eof = false;
        }
        Some(StreamFrameData {
            data,
            fin,
            offset: start,
        })
    }

    /// Settle the fate of a previously sent byte range: free it when acked,
    /// queue it for retransmission when lost.
    pub fn on_data_delivery(&mut self, state: DeliveryState, start: u64, stop: u64, fin: bool) {
        match state {
            DeliveryState::Acked => {
                if stop > start {
                    self.send_acked.add(start, stop);
                    while let Some(first) = self.send_acked.first() {
                        if first.start != self.send_buffer_start {
                            break;
                        }
                        let size = (first.end - first.start) as usize;
                        self.send_acked.shift();
                        self.send_buffer.drain(..size);
                        self.send_buffer_start += size as u64;
                    }
                }
            }
            DeliveryState::Lost | DeliveryState::Expired => {
                if stop > start {
                    self.send_pending.add(start, stop);
                }
                if fin {
                    self.send_pending_eof = true;
                }
            }
        }
    }

    pub fn is_send_blocked(&self) -> bool {
        self.next_send_offset() >= self.max_stream_data_remote
    }

    /// Whether actual bytes (not just a FIN) are queued for transmission.
    pub fn has_pending_bytes(&self) -> bool {
        !self.send_pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frame(offset: u64, data: &[u8], fin: bool) -> StreamFrameData {
        StreamFrameData {
            data: Bytes::copy_from_slice(data),
            fin,
            offset,
        }
    }

    #[test]
    fn in_order_delivery() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.add_frame(frame(0, b"hello ", false)).unwrap();
        assert_eq!(&s.pull_data()[..], b"hello ");
        s.add_frame(frame(6, b"world", true)).unwrap();
        assert_eq!(&s.pull_data()[..], b"world");
        assert!(s.recv_at_final_size());
    }

    #[test]
    fn reordered_delivery_buffers_until_contiguous() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.add_frame(frame(6, b"world", false)).unwrap();
        assert!(!s.has_data_to_read());
        assert_eq!(&s.pull_data()[..], b"");
        s.add_frame(frame(0, b"hello ", false)).unwrap();
        assert_eq!(&s.pull_data()[..], b"hello world");
    }

    #[test]
    fn duplicate_and_overlapping_frames() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.add_frame(frame(0, b"abcd", false)).unwrap();
        s.add_frame(frame(2, b"cdef", false)).unwrap();
        s.add_frame(frame(0, b"abcd", false)).unwrap();
        assert_eq!(&s.pull_data()[..], b"abcdef");
        // a retransmission that is entirely consumed already
        s.add_frame(frame(0, b"abcd", false)).unwrap();
        assert_eq!(&s.pull_data()[..], b"");
    }

    #[test]
    fn final_size_violations() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.add_frame(frame(0, b"abcd", true)).unwrap();
        assert_matches!(
            s.add_frame(frame(4, b"x", false)),
            Err(TransportError { code: ErrorCode::FINAL_SIZE_ERROR, .. })
        );
        assert_matches!(
            s.add_frame(frame(0, b"ab", true)),
            Err(TransportError { code: ErrorCode::FINAL_SIZE_ERROR, .. })
        );
    }

    #[test]
    fn send_fragments_respect_caps() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.write(b"0123456789", true);
        assert_eq!(s.next_send_offset(), 0);

        let f = s.get_frame(4, None).unwrap();
        assert_eq!(&f.data[..], b"0123");
        assert!(!f.fin);
        assert_eq!(s.next_send_offset(), 4);

        // flow-control cap stops short of the buffer tail
        let f = s.get_frame(100, Some(6)).unwrap();
        assert_eq!(&f.data[..], b"45");
        assert!(!f.fin);

        // capped at current offset: nothing to send
        assert!(s.get_frame(100, Some(6)).is_none());

        let f = s.get_frame(100, None).unwrap();
        assert_eq!(&f.data[..], b"6789");
        assert!(f.fin);
        assert!(s.send_buffer_is_empty());
    }

    #[test]
    fn fin_only_frame() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.write(b"ab", false);
        let f = s.get_frame(10, None).unwrap();
        assert!(!f.fin);
        s.write(b"", true);
        let f = s.get_frame(10, None).unwrap();
        assert!(f.fin);
        assert_eq!(f.offset, 2);
        assert!(f.data.is_empty());
    }

    #[test]
    fn lost_ranges_are_requeued_and_coalesced() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.write(b"0123456789", false);
        let a = s.get_frame(5, None).unwrap();
        let b = s.get_frame(5, None).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 5);
        assert!(s.send_buffer_is_empty());

        s.on_data_delivery(DeliveryState::Lost, 0, 5, false);
        s.on_data_delivery(DeliveryState::Lost, 5, 10, false);
        // both ranges merged back into one pending blob
        let f = s.get_frame(100, None).unwrap();
        assert_eq!(&f.data[..], b"0123456789");
        assert_eq!(f.offset, 0);
    }

    #[test]
    fn acked_prefix_is_freed() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.write(b"0123456789", false);
        s.get_frame(100, None).unwrap();
        // out-of-order ack does not advance the buffer
        s.on_data_delivery(DeliveryState::Acked, 5, 10, false);
        assert_eq!(s.send_buffer_start, 0);
        s.on_data_delivery(DeliveryState::Acked, 0, 5, false);
        assert_eq!(s.send_buffer_start, 10);
        assert!(s.send_buffer.is_empty());
    }

    #[test]
    fn lost_fin_is_requeued() {
        let mut s = Stream::new(Some(0), 1024, 1024);
        s.write(b"ab", true);
        let f = s.get_frame(10, None).unwrap();
        assert!(f.fin);
        s.on_data_delivery(DeliveryState::Lost, 0, 2, true);
        let f = s.get_frame(10, None).unwrap();
        assert_eq!(&f.data[..], b"ab");
        assert!(f.fin);
    }
}
