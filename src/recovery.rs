//! Loss recovery: sent-packet tracking, RTT estimation, probe timeouts,
//! and NewReno congestion control with a HyStart-style slow-start exit.

use std::collections::BTreeMap;

use crate::builder::{Delivery, SentPacket};
use crate::range_set::RangeSet;
use crate::stream::DeliveryState;

pub const K_PACKET_THRESHOLD: u64 = 3;
pub const K_INITIAL_RTT: f64 = 0.5; // seconds
pub const K_GRANULARITY: f64 = 0.001; // seconds
pub const K_TIME_THRESHOLD: f64 = 9.0 / 8.0;

pub const K_MAX_DATAGRAM_SIZE: usize = 1280;
pub const K_INITIAL_WINDOW: usize = 10 * K_MAX_DATAGRAM_SIZE;
pub const K_MINIMUM_WINDOW: usize = 2 * K_MAX_DATAGRAM_SIZE;
pub const K_LOSS_REDUCTION_FACTOR: f64 = 0.5;

/// Per-epoch packet-number space: what we have received and what we have
/// in flight.
#[derive(Default)]
pub struct PacketSpace {
    pub ack_at: Option<f64>,
    pub ack_queue: RangeSet,
    pub expected_packet_number: u64,
    pub largest_received_packet: u64,

    // sent packets and loss
    pub ack_eliciting_in_flight: u64,
    pub largest_acked_packet: u64,
    pub loss_time: Option<f64>,
    pub sent_packets: BTreeMap<u64, SentPacket>,
}

impl PacketSpace {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Packet loss and congestion controller.
pub struct Recovery {
    /// Still awaiting the first 1-RTT keys as a client; keeps the PTO armed
    /// even with nothing ack-eliciting in flight.
    pub is_client_without_1rtt: bool,
    /// Peer's maximum ACK delay, seconds.
    pub max_ack_delay: f64,
    /// Peer's ack_delay_exponent.
    pub ack_delay_exponent: u64,

    // loss detection
    pub pto_count: u32,
    rtt_initialized: bool,
    rtt_latest: f64,
    rtt_min: f64,
    rtt_smoothed: f64,
    rtt_variance: f64,
    time_of_last_sent_ack_eliciting_packet: f64,

    // congestion control
    pub bytes_in_flight: usize,
    pub congestion_window: usize,
    congestion_recovery_start_time: f64,
    congestion_stash: usize,
    rtt_monitor: RttMonitor,
    pub ssthresh: Option<usize>,
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Recovery {
    pub fn new(is_client_without_1rtt: bool) -> Self {
        Self {
            is_client_without_1rtt,
            max_ack_delay: 0.025,
            ack_delay_exponent: 3,
            pto_count: 0,
            rtt_initialized: false,
            rtt_latest: 0.0,
            rtt_min: f64::INFINITY,
            rtt_smoothed: 0.0,
            rtt_variance: 0.0,
            time_of_last_sent_ack_eliciting_packet: 0.0,
            bytes_in_flight: 0,
            congestion_window: K_INITIAL_WINDOW,
            congestion_recovery_start_time: 0.0,
            congestion_stash: 0,
            rtt_monitor: RttMonitor::new(),
            ssthresh: None,
        }
    }

    pub fn smoothed_rtt(&self) -> f64 {
        self.rtt_smoothed
    }

    pub fn latest_rtt(&self) -> f64 {
        self.rtt_latest
    }

    /// Check whether any packets in `space` should now be declared lost.
    /// Lost packets leave the space and their delivery obligations are
    /// appended to `out` for the connection to apply.
    pub fn detect_loss(
        &mut self,
        space: &mut PacketSpace,
        now: f64,
        out: &mut Vec<(DeliveryState, Delivery)>,
    ) {
        let loss_delay = K_TIME_THRESHOLD
            * if self.rtt_initialized {
                self.rtt_latest.max(self.rtt_smoothed)
            } else {
                K_INITIAL_RTT
            };
        let packet_threshold = space.largest_acked_packet.checked_sub(K_PACKET_THRESHOLD);
        let time_threshold = now - loss_delay;

        let mut lost_packet_numbers = Vec::new();
        space.loss_time = None;
        for (&packet_number, packet) in space.sent_packets.iter() {
            if packet_number > space.largest_acked_packet {
                break;
            }
            if packet_threshold.map_or(false, |t| packet_number <= t)
                || packet.sent_time <= time_threshold
            {
                lost_packet_numbers.push(packet_number);
            } else {
                let packet_loss_time = packet.sent_time + loss_delay;
                if space.loss_time.map_or(true, |t| t > packet_loss_time) {
                    space.loss_time = Some(packet_loss_time);
                }
            }
        }

        let mut lost_largest_time = None;
        for packet_number in lost_packet_numbers {
            let packet = space
                .sent_packets
                .remove(&packet_number)
                .expect("collected above");
            if packet.in_flight {
                lost_largest_time = Some(packet.sent_time);
            }
            self.on_packet_lost(packet, space, out);
        }
        if let Some(lost_largest_time) = lost_largest_time {
            self.on_packets_lost(lost_largest_time, now);
        }
    }

    /// Forget everything sent in `space`; its bytes leave the flight
    /// without delivery callbacks.
    pub fn discard_space(&mut self, space: &mut PacketSpace) {
        for packet in space.sent_packets.values() {
            if packet.in_flight {
                self.bytes_in_flight -= packet.sent_bytes;
            }
        }
        space.sent_packets.clear();
        space.ack_at = None;
        space.ack_eliciting_in_flight = 0;
        space.loss_time = None;
    }

    pub fn get_earliest_loss_time(spaces: &[&PacketSpace]) -> Option<usize> {
        let mut result: Option<(usize, f64)> = None;
        for (idx, space) in spaces.iter().enumerate() {
            if let Some(loss_time) = space.loss_time {
                if result.map_or(true, |(_, t)| loss_time < t) {
                    result = Some((idx, loss_time));
                }
            }
        }
        result.map(|(idx, _)| idx)
    }

    /// When the loss-detection timer should fire, if at all.
    pub fn get_loss_detection_time(&self, spaces: &[&PacketSpace]) -> Option<f64> {
        // loss timer
        if let Some(idx) = Self::get_earliest_loss_time(spaces) {
            return spaces[idx].loss_time;
        }

        // packet timer
        let ack_eliciting_in_flight: u64 =
            spaces.iter().map(|s| s.ack_eliciting_in_flight).sum();
        if self.is_client_without_1rtt || ack_eliciting_in_flight > 0 {
            let timeout = if self.rtt_initialized {
                (self.rtt_smoothed + (4.0 * self.rtt_variance).max(K_GRANULARITY)
                    + self.max_ack_delay)
                    * 2f64.powi(self.pto_count as i32)
            } else {
                2.0 * K_INITIAL_RTT * 2f64.powi(self.pto_count as i32)
            };
            return Some(self.time_of_last_sent_ack_eliciting_packet + timeout);
        }

        None
    }

    /// The base probe timeout, without backoff.
    pub fn get_probe_timeout(&self) -> f64 {
        if !self.rtt_initialized {
            return 2.0 * K_INITIAL_RTT;
        }
        self.rtt_smoothed + (4.0 * self.rtt_variance).max(K_GRANULARITY) + self.max_ack_delay
    }

    /// Update metrics from a received ACK. Newly acknowledged packets leave
    /// the space and their delivery obligations land in `out` as `Acked`.
    pub fn on_ack_received(
        &mut self,
        space: &mut PacketSpace,
        ack_rangeset: &RangeSet,
        ack_delay_encoded: u64,
        now: f64,
        out: &mut Vec<(DeliveryState, Delivery)>,
    ) {
        let largest_acked = match ack_rangeset.bounds() {
            Some(bounds) => bounds.end - 1,
            None => return,
        };
        if largest_acked > space.largest_acked_packet {
            space.largest_acked_packet = largest_acked;
        }

        let mut is_ack_eliciting = false;
        let mut largest_newly_acked = None;
        let mut largest_sent_time = 0.0;
        let acked_packet_numbers: Vec<u64> = space
            .sent_packets
            .range(..=largest_acked)
            .filter(|(&pn, _)| ack_rangeset.contains(pn))
            .map(|(&pn, _)| pn)
            .collect();
        for packet_number in acked_packet_numbers {
            let packet = space
                .sent_packets
                .remove(&packet_number)
                .expect("collected above");
            if packet.is_ack_eliciting {
                is_ack_eliciting = true;
                space.ack_eliciting_in_flight -= 1;
            }
            if packet.in_flight {
                self.on_packet_acked(&packet);
            }
            largest_newly_acked = Some(packet_number);
            largest_sent_time = packet.sent_time;
            for delivery in packet.delivery {
                out.push((DeliveryState::Acked, delivery));
            }
        }

        // nothing to do if no packet was newly acknowledged
        let largest_newly_acked = match largest_newly_acked {
            Some(pn) => pn,
            None => return,
        };

        if largest_acked == largest_newly_acked && is_ack_eliciting {
            let latest_rtt = now - largest_sent_time;

            // limit ACK delay to max_ack_delay
            let ack_delay = (ack_delay_encoded << self.ack_delay_exponent) as f64 / 1_000_000.0;
            let ack_delay = ack_delay.min(self.max_ack_delay);

            // update RTT estimate, which cannot be < 1 ms
            self.rtt_latest = latest_rtt.max(K_GRANULARITY);
            if self.rtt_latest < self.rtt_min {
                self.rtt_min = self.rtt_latest;
            }
            if self.rtt_latest > self.rtt_min + ack_delay {
                self.rtt_latest -= ack_delay;
            }

            if !self.rtt_initialized {
                self.rtt_initialized = true;
                self.rtt_variance = latest_rtt / 2.0;
                self.rtt_smoothed = latest_rtt;
            } else {
                self.rtt_variance = 3.0 / 4.0 * self.rtt_variance
                    + 1.0 / 4.0 * (self.rtt_min - self.rtt_latest).abs();
                self.rtt_smoothed = 7.0 / 8.0 * self.rtt_smoothed + 1.0 / 8.0 * self.rtt_latest;
            }

            // check whether we should exit slow start
            if self.ssthresh.is_none() && self.rtt_monitor.is_rtt_increasing(latest_rtt, now) {
                self.ssthresh = Some(self.congestion_window);
            }
        }

        self.detect_loss(space, now, out);
        self.pto_count = 0;
    }

    /// The loss-detection timer fired. Returns `true` when the caller
    /// should arrange a probe to be sent.
    pub fn on_loss_detection_timeout(
        &mut self,
        spaces: &mut [&mut PacketSpace],
        now: f64,
        out: &mut Vec<(DeliveryState, Delivery)>,
    ) -> bool {
        let loss_idx = {
            let shared: Vec<&PacketSpace> = spaces.iter().map(|s| &**s).collect();
            Self::get_earliest_loss_time(&shared)
        };
        if let Some(idx) = loss_idx {
            self.detect_loss(&mut *spaces[idx], now, out);
            return false;
        }

        self.pto_count += 1;

        // reschedule crypto data so the handshake cannot deadlock
        for space in spaces.iter_mut() {
            let crypto_packet_numbers: Vec<u64> = space
                .sent_packets
                .iter()
                .filter(|(_, p)| p.is_crypto_packet)
                .map(|(&pn, _)| pn)
                .collect();
            for packet_number in crypto_packet_numbers {
                let packet = space
                    .sent_packets
                    .remove(&packet_number)
                    .expect("collected above");
                self.on_packet_lost(packet, space, out);
            }
        }
        true
    }

    fn on_packet_acked(&mut self, packet: &SentPacket) {
        self.bytes_in_flight -= packet.sent_bytes;

        // don't grow the window during congestion recovery
        if packet.sent_time <= self.congestion_recovery_start_time {
            return;
        }

        match self.ssthresh {
            Some(ssthresh) if self.congestion_window >= ssthresh => {
                // congestion avoidance
                self.congestion_stash += packet.sent_bytes;
                let count = self.congestion_stash / self.congestion_window;
                if count > 0 {
                    self.congestion_stash -= count * self.congestion_window;
                    self.congestion_window += count * K_MAX_DATAGRAM_SIZE;
                }
            }
            _ => {
                // slow start
                self.congestion_window += packet.sent_bytes;
            }
        }
    }

    fn on_packet_lost(
        &mut self,
        packet: SentPacket,
        space: &mut PacketSpace,
        out: &mut Vec<(DeliveryState, Delivery)>,
    ) {
        if packet.is_ack_eliciting {
            space.ack_eliciting_in_flight -= 1;
        }
        if packet.in_flight {
            self.bytes_in_flight -= packet.sent_bytes;
        }
        for delivery in packet.delivery {
            out.push((DeliveryState::Lost, delivery));
        }
    }

    pub fn on_packet_sent(&mut self, packet: SentPacket, space: &mut PacketSpace) {
        if packet.is_ack_eliciting {
            space.ack_eliciting_in_flight += 1;
        }
        if packet.in_flight {
            if packet.is_ack_eliciting {
                self.time_of_last_sent_ack_eliciting_packet = packet.sent_time;
            }
            self.bytes_in_flight += packet.sent_bytes;
        }
        space.sent_packets.insert(packet.packet_number, packet);
    }

    fn on_packets_lost(&mut self, lost_largest_time: f64, now: f64) {
        // start a new congestion event only if the packet was sent after
        // the start of the previous recovery period
        if lost_largest_time > self.congestion_recovery_start_time {
            self.congestion_recovery_start_time = now;
            self.congestion_window = ((self.congestion_window as f64 * K_LOSS_REDUCTION_FACTOR)
                as usize)
                .max(K_MINIMUM_WINDOW);
            self.ssthresh = Some(self.congestion_window);
        }
    }
}

/// Round-trip time trend monitor used to exit slow start before losses
/// occur, in the HyStart spirit: five consecutive increasing windows of
/// five samples trip it.
struct RttMonitor {
    increases: u32,
    ready: bool,
    filtered_min: Option<f64>,
    sample_idx: usize,
    sample_time: f64,
    samples: [f64; RTT_MONITOR_SIZE],
}

const RTT_MONITOR_SIZE: usize = 5;

impl RttMonitor {
    fn new() -> Self {
        Self {
            increases: 0,
            ready: false,
            filtered_min: None,
            sample_idx: 0,
            sample_time: 0.0,
            samples: [0.0; RTT_MONITOR_SIZE],
        }
    }

    fn add_rtt(&mut self, rtt: f64) {
        self.samples[self.sample_idx] = rtt;
        self.sample_idx += 1;
        if self.sample_idx >= RTT_MONITOR_SIZE {
            self.sample_idx = 0;
            self.ready = true;
        }
    }

    fn is_rtt_increasing(&mut self, rtt: f64, now: f64) -> bool {
        if now > self.sample_time + K_GRANULARITY {
            self.add_rtt(rtt);
            self.sample_time = now;

            if self.ready {
                let mut sample_min = self.samples[0];
                let mut sample_max = self.samples[0];
                for &sample in &self.samples[1..] {
                    if sample < sample_min {
                        sample_min = sample;
                    } else if sample > sample_max {
                        sample_max = sample;
                    }
                }

                if self.filtered_min.map_or(true, |m| m > sample_max) {
                    self.filtered_min = Some(sample_max);
                }
                let filtered_min = self.filtered_min.expect("set above");
                let delta = sample_min - filtered_min;
                if delta * 4.0 >= filtered_min {
                    self.increases += 1;
                    if self.increases >= RTT_MONITOR_SIZE as u32 {
                        return true;
                    }
                } else if delta > 0.0 {
                    self.increases = 0;
                }
            }
        }
        false
    }
}
