//! The QUIC connection state machine.
//!
//! A `Connection` is sans-I/O: `receive_datagram` consumes raw UDP
//! payloads, `datagrams_to_send` produces them, `get_timer`/`handle_timer`
//! drive timeouts, and `next_event` drains the FIFO of things the
//! application should know about. All entry points take the current time as
//! a monotonic `f64` in seconds and never block.

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use fnv::FnvHashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use slog::Logger;

use crate::builder::{Delivery, PacketBuilder, PACKET_MAX_SIZE};
use crate::coding::{size_varint, Buffer, BufferError};
use crate::crypto::CryptoPair;
use crate::frame::{self, Frame};
use crate::packet::{
    get_spin_bit, pull_header, ConnectionId, PACKET_TYPE_HANDSHAKE, PACKET_TYPE_INITIAL,
    PACKET_TYPE_ONE_RTT, PACKET_TYPE_RETRY, PACKET_TYPE_ZERO_RTT,
};
use crate::qlog::{packet_type_name, QlogTrace};
use crate::range_set::RangeSet;
use crate::recovery::{PacketSpace, Recovery, K_GRANULARITY};
use crate::stream::{DeliveryState, Stream, StreamFrameData};
use crate::tls::{self, Epoch, SessionTicket, TicketStore};
use crate::transport_parameters::TransportParameters;
use crate::{
    stream_is_client_initiated, stream_is_unidirectional, ErrorCode, Side, TransportError,
    LOCAL_CID_LEN, RESET_TOKEN_SIZE, SUPPORTED_VERSIONS, VERSION_NEGOTIATION,
};

/// Starting flow-control window for connection and stream data.
const MAX_DATA_WINDOW: u64 = 1_048_576;

const SPACE_COUNT: usize = 3;

fn space_index(epoch: Epoch) -> usize {
    match epoch {
        Epoch::Initial => 0,
        Epoch::Handshake => 1,
        // 0-RTT shares the 1-RTT space for acknowledgement accounting
        Epoch::ZeroRtt | Epoch::OneRtt => 2,
    }
}

/// Parameters governing a QUIC connection.
pub struct Config {
    /// The TLS engine used to run handshakes.
    pub tls: Arc<dyn tls::Provider>,
    /// Supported ALPN protocols, most preferred first.
    pub alpn_protocols: Vec<String>,
    /// Server certificate (servers only); handed to the TLS engine opaquely.
    pub certificate: Option<Vec<u8>>,
    /// Server private key (servers only).
    pub private_key: Option<Vec<u8>>,
    /// Seconds of inactivity before the connection is terminated.
    pub idle_timeout: f64,
    /// Name sent in SNI (clients only).
    pub server_name: Option<String>,
    /// Session ticket for resumption (clients only).
    pub session_ticket: Option<SessionTicket>,
    /// Store receiving tickets issued by peers.
    pub ticket_store: Option<Arc<dyn TicketStore>>,
    /// Protocol versions to offer or accept, most preferred first.
    pub supported_versions: Vec<u32>,
    /// Sink for SSLKEYLOGFILE-format traffic secrets.
    pub secrets_log: Option<Arc<Mutex<dyn Write + Send>>>,
    /// Collect a qlog trace of transport events.
    pub qlog: bool,
    /// Send a Retry for address validation before accepting (servers only;
    /// acted on by the endpoint).
    pub stateless_retry: bool,
}

impl Config {
    pub fn new(tls: Arc<dyn tls::Provider>) -> Self {
        Self {
            tls,
            alpn_protocols: Vec::new(),
            certificate: None,
            private_key: None,
            idle_timeout: 60.0,
            server_name: None,
            session_ticket: None,
            ticket_store: None,
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            secrets_log: None,
            qlog: false,
            stateless_retry: false,
        }
    }
}

/// Things that happened on the connection, drained FIFO via `next_event`.
#[derive(Debug, Clone)]
pub enum Event {
    /// ALPN negotiation completed.
    ProtocolNegotiated { alpn_protocol: Option<String> },
    /// The TLS handshake completed.
    HandshakeCompleted {
        alpn_protocol: Option<String>,
        early_data_accepted: bool,
        session_resumed: bool,
    },
    /// We issued a connection ID the demultiplexer should start routing.
    ConnectionIdIssued { connection_id: ConnectionId },
    /// The peer retired one of our connection IDs.
    ConnectionIdRetired { connection_id: ConnectionId },
    /// Ordered stream data became available.
    StreamDataReceived {
        stream_id: u64,
        data: Bytes,
        end_stream: bool,
    },
    /// The peer abruptly ended a stream.
    StreamReset { stream_id: u64 },
    /// A PING we sent was acknowledged.
    PingAcknowledged { uid: u64 },
    /// The connection is gone; always the final event.
    ConnectionTerminated {
        error_code: u64,
        frame_type: Option<u64>,
        reason_phrase: String,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    FirstFlight,
    Connected,
    Closing,
    Draining,
    Terminated,
}

impl State {
    pub fn is_end_state(self) -> bool {
        matches!(self, State::Closing | State::Draining | State::Terminated)
    }
}

/// A connection ID we issued or the peer issued to us.
#[derive(Debug, Clone)]
struct ConnectionIdEntry {
    cid: ConnectionId,
    sequence_number: u64,
    stateless_reset_token: [u8; RESET_TOKEN_SIZE],
    was_sent: bool,
}

/// One 4-tuple the peer has been seen on.
#[derive(Debug, Clone)]
struct NetworkPath {
    addr: SocketAddr,
    bytes_received: u64,
    bytes_sent: u64,
    is_validated: bool,
    local_challenge: Option<[u8; 8]>,
    remote_challenge: Option<[u8; 8]>,
}

impl NetworkPath {
    fn new(addr: SocketAddr, is_validated: bool) -> Self {
        Self {
            addr,
            bytes_received: 0,
            bytes_sent: 0,
            is_validated,
            local_challenge: None,
            remote_challenge: None,
        }
    }
}

/// Everything a frame handler needs to know about the packet it arrived in.
struct ReceiveContext {
    epoch: Epoch,
    host_cid: ConnectionId,
    path_idx: usize,
    time: f64,
}

/// Used by the send paths to abandon the current batch once the builder is
/// out of room.
enum SendStop {
    Full,
}

impl From<crate::builder::BuilderStop> for SendStop {
    fn from(_: crate::builder::BuilderStop) -> Self {
        SendStop::Full
    }
}

impl From<BufferError> for SendStop {
    fn from(_: BufferError) -> Self {
        SendStop::Full
    }
}

pub struct Connection {
    log: Logger,
    config: Arc<Config>,
    side: Side,
    state: State,
    version: u32,

    tls: Option<Box<dyn tls::Session>>,
    cryptos: [CryptoPair; tls::EPOCH_COUNT],
    crypto_streams: [Stream; tls::EPOCH_COUNT],
    spaces: [PacketSpace; SPACE_COUNT],
    loss: Recovery,
    loss_at: Option<f64>,

    events: VecDeque<Event>,
    streams: FnvHashMap<u64, Stream>,
    streams_blocked_bidi: Vec<u64>,
    streams_blocked_uni: Vec<u64>,

    // connection IDs
    host_cids: Vec<ConnectionIdEntry>,
    host_cid: ConnectionId,
    host_cid_seq: u64,
    peer_cid: ConnectionId,
    peer_cid_seq: Option<u64>,
    peer_cid_available: Vec<ConnectionIdEntry>,
    peer_token: Bytes,
    retire_connection_ids: Vec<u64>,
    local_active_connection_id_limit: u64,
    remote_active_connection_id_limit: u64,

    // flow control, local side
    local_max_data: u64,
    local_max_data_sent: u64,
    local_max_data_used: u64,
    local_max_stream_data_bidi_local: u64,
    local_max_stream_data_bidi_remote: u64,
    local_max_stream_data_uni: u64,
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,

    // flow control, dictated by the peer
    #[allow(dead_code)]
    remote_idle_timeout: f64,
    remote_max_data: u64,
    remote_max_data_used: u64,
    remote_max_stream_data_bidi_local: u64,
    remote_max_stream_data_bidi_remote: u64,
    remote_max_stream_data_uni: u64,
    remote_max_streams_bidi: u64,
    remote_max_streams_uni: u64,

    network_paths: Vec<NetworkPath>,
    original_connection_id: Option<ConnectionId>,
    packet_number: u64,
    parameters_received: bool,
    handshake_complete: bool,
    handshake_confirmed: bool,
    connect_called: bool,
    stateless_retry_count: u32,
    alpn_emitted: bool,

    spin_bit: bool,
    spin_highest_pn: u64,

    ack_delay: f64,
    close_at: Option<f64>,
    close_event: Option<(u64, Option<u64>, String)>,

    // things to send
    close_pending: bool,
    ping_pending: Vec<u64>,
    probe_pending: bool,
    streams_blocked_pending: bool,
    data_blocked_pending: bool,
    data_blocked_announced: bool,

    qlog: Option<QlogTrace>,
}

impl Connection {
    /// Create the client half of a connection; call `connect` to start the
    /// handshake.
    pub fn new_client(log: Logger, config: Arc<Config>) -> Self {
        Self::new(log, config, Side::Client, None)
    }

    /// Create the server half of a connection. `original_connection_id` is
    /// the pre-Retry DCID recovered from a validated retry token, if any.
    pub fn new_server(
        log: Logger,
        config: Arc<Config>,
        original_connection_id: Option<ConnectionId>,
    ) -> Self {
        Self::new(log, config, Side::Server, original_connection_id)
    }

    fn new(
        log: Logger,
        config: Arc<Config>,
        side: Side,
        original_connection_id: Option<ConnectionId>,
    ) -> Self {
        let mut rng = OsRng;
        let first_cid = ConnectionIdEntry {
            cid: ConnectionId::random(&mut rng, LOCAL_CID_LEN),
            sequence_number: 0,
            stateless_reset_token: random_reset_token(&mut rng),
            was_sent: true,
        };
        let host_cid = first_cid.cid;
        let log = log.new(o!("cid" => host_cid));
        let qlog = if config.qlog { Some(QlogTrace::new()) } else { None };
        Self {
            log,
            side,
            state: State::FirstFlight,
            version: config.supported_versions[0],
            tls: None,
            cryptos: Default::default(),
            crypto_streams: Default::default(),
            spaces: Default::default(),
            loss: Recovery::new(side == Side::Client),
            loss_at: None,
            events: VecDeque::new(),
            streams: FnvHashMap::default(),
            streams_blocked_bidi: Vec::new(),
            streams_blocked_uni: Vec::new(),
            host_cids: vec![first_cid],
            host_cid,
            host_cid_seq: 1,
            peer_cid: ConnectionId::random(&mut rng, LOCAL_CID_LEN),
            peer_cid_seq: None,
            peer_cid_available: Vec::new(),
            peer_token: Bytes::new(),
            retire_connection_ids: Vec::new(),
            local_active_connection_id_limit: 8,
            remote_active_connection_id_limit: 0,
            local_max_data: MAX_DATA_WINDOW,
            local_max_data_sent: MAX_DATA_WINDOW,
            local_max_data_used: 0,
            local_max_stream_data_bidi_local: MAX_DATA_WINDOW,
            local_max_stream_data_bidi_remote: MAX_DATA_WINDOW,
            local_max_stream_data_uni: MAX_DATA_WINDOW,
            local_max_streams_bidi: 128,
            local_max_streams_uni: 128,
            remote_idle_timeout: 0.0,
            remote_max_data: 0,
            remote_max_data_used: 0,
            remote_max_stream_data_bidi_local: 0,
            remote_max_stream_data_bidi_remote: 0,
            remote_max_stream_data_uni: 0,
            remote_max_streams_bidi: 0,
            remote_max_streams_uni: 0,
            network_paths: Vec::new(),
            original_connection_id,
            packet_number: 0,
            parameters_received: false,
            handshake_complete: false,
            handshake_confirmed: false,
            connect_called: false,
            stateless_retry_count: 0,
            alpn_emitted: false,
            spin_bit: false,
            spin_highest_pn: 0,
            ack_delay: K_GRANULARITY,
            close_at: None,
            close_event: None,
            close_pending: false,
            ping_pending: Vec::new(),
            probe_pending: false,
            streams_blocked_pending: false,
            data_blocked_pending: false,
            data_blocked_announced: false,
            qlog,
            config,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The connection ID the peer currently addresses us by.
    pub fn host_cid(&self) -> ConnectionId {
        self.host_cid
    }

    /// The qlog trace collected so far, if enabled.
    pub fn qlog_trace(&self) -> Option<&QlogTrace> {
        self.qlog.as_ref()
    }

    /// How many probe timeouts have fired since the last acknowledgement.
    pub fn pto_count(&self) -> u32 {
        self.loss.pto_count
    }

    /// The current 1-RTT key phase bit.
    pub fn one_rtt_key_phase(&self) -> bool {
        self.cryptos[Epoch::OneRtt as usize].key_phase
    }

    //
    // Public operations
    //

    /// Initiate the handshake. Clients only, once.
    pub fn connect(&mut self, addr: SocketAddr, now: f64) {
        assert!(
            self.side == Side::Client && !self.connect_called,
            "connect() can only be called for clients and a single time"
        );
        self.connect_called = true;
        self.network_paths = vec![NetworkPath::new(addr, true)];
        self.version = self.config.supported_versions[0];
        self.begin_handshake(now);
    }

    /// Retrieve the next application event, FIFO.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Close the connection. A CONNECTION_CLOSE frame goes out with the
    /// next `datagrams_to_send` batch.
    pub fn close(&mut self, error_code: u64, frame_type: Option<u64>, reason_phrase: &str) {
        if !self.state.is_end_state() {
            self.close_event = Some((error_code, frame_type, reason_phrase.to_string()));
            self.close_pending = true;
        }
    }

    /// Queue a PING; `PingAcknowledged` with the same `uid` is emitted when
    /// the peer acknowledges it.
    pub fn send_ping(&mut self, uid: u64) {
        self.ping_pending.push(uid);
    }

    /// Rotate the 1-RTT keys; the peer follows suit when it sees the
    /// flipped key phase.
    pub fn request_key_update(&mut self) {
        assert!(
            self.handshake_complete,
            "cannot change key before handshake completes"
        );
        if let Err(e) = self.cryptos[Epoch::OneRtt as usize].update_key() {
            warn!(self.log, "key update failed"; "reason" => %e);
        }
    }

    /// Switch to the next peer-issued connection ID, retiring the current
    /// one.
    pub fn change_connection_id(&mut self) {
        if self.peer_cid_available.is_empty() {
            return;
        }
        if let Some(seq) = self.peer_cid_seq {
            self.retire_connection_ids.push(seq);
        }
        let entry = self.peer_cid_available.remove(0);
        info!(self.log, "migrating to new peer cid"; "peer_cid" => entry.cid, "seq" => entry.sequence_number);
        self.peer_cid_seq = Some(entry.sequence_number);
        self.peer_cid = entry.cid;
    }

    /// The lowest stream ID not yet in use that we may initiate.
    pub fn get_next_available_stream_id(&self, is_unidirectional: bool) -> u64 {
        let mut stream_id = ((is_unidirectional as u64) << 1) | (self.side == Side::Server) as u64;
        while self.streams.contains_key(&stream_id) {
            stream_id += 4;
        }
        stream_id
    }

    /// Buffer stream data for transmission, creating the stream on first
    /// use.
    pub fn send_stream_data(
        &mut self,
        stream_id: u64,
        data: &[u8],
        end_stream: bool,
    ) -> Result<(), TransportError> {
        if stream_is_client_initiated(stream_id) != (self.side == Side::Client) {
            if !self.streams.contains_key(&stream_id) {
                return Err(TransportError::new(
                    ErrorCode::STREAM_STATE_ERROR,
                    None,
                    "Cannot send data on unknown peer-initiated stream",
                ));
            }
            if stream_is_unidirectional(stream_id) {
                return Err(TransportError::new(
                    ErrorCode::STREAM_STATE_ERROR,
                    None,
                    "Cannot send data on peer-initiated unidirectional stream",
                ));
            }
        }
        if !self.streams.contains_key(&stream_id) {
            self.create_local_stream(stream_id);
        }
        let stream = self.streams.get_mut(&stream_id).expect("created above");
        stream.write(data, end_stream);
        Ok(())
    }

    /// When the next timer should fire, if any.
    pub fn get_timer(&mut self) -> Option<f64> {
        let mut timer_at = self.close_at;
        if !self.state.is_end_state() {
            for space in &self.spaces {
                if let Some(ack_at) = space.ack_at {
                    if timer_at.map_or(true, |t| ack_at < t) {
                        timer_at = Some(ack_at);
                    }
                }
            }
            let space_refs: Vec<&PacketSpace> = self.spaces.iter().collect();
            self.loss_at = self.loss.get_loss_detection_time(&space_refs);
            if let Some(loss_at) = self.loss_at {
                if timer_at.map_or(true, |t| loss_at < t) {
                    timer_at = Some(loss_at);
                }
            }
        }
        timer_at
    }

    /// Handle the timer armed from `get_timer`; call `datagrams_to_send`
    /// afterwards.
    pub fn handle_timer(&mut self, now: f64) {
        // end of closing period or idle timeout
        if let Some(close_at) = self.close_at {
            if now >= close_at {
                if self.close_event.is_none() {
                    self.close_event = Some((
                        ErrorCode::INTERNAL_ERROR.0,
                        None,
                        "Idle timeout".to_string(),
                    ));
                }
                self.close_end();
                return;
            }
        }

        // loss detection timeout
        if let Some(loss_at) = self.loss_at {
            if now >= loss_at {
                debug!(self.log, "loss detection triggered");
                let mut out = Vec::new();
                let probe = {
                    let mut spaces: Vec<&mut PacketSpace> = self.spaces.iter_mut().collect();
                    self.loss.on_loss_detection_timeout(&mut spaces, now, &mut out)
                };
                if probe {
                    self.probe_pending = true;
                }
                self.apply_deliveries(out);
            }
        }
    }

    /// Handle one incoming UDP datagram, which may hold several coalesced
    /// packets.
    pub fn receive_datagram(&mut self, data: &[u8], addr: SocketAddr, now: f64) {
        match self.state {
            // a closing endpoint repeats its CONNECTION_CLOSE on any
            // incoming packet
            State::Closing => {
                self.close_pending = true;
                return;
            }
            State::Draining | State::Terminated => return,
            _ => {}
        }

        if let Some(qlog) = &mut self.qlog {
            qlog.log_event(
                now,
                "transport",
                "datagram_received",
                json!({"byte_length": data.len(), "count": 1}),
            );
        }

        let mut buf = Buffer::wrap(data);
        while !buf.eof() {
            let start_off = buf.tell();
            let header = match pull_header(&mut buf, self.host_cid.len()) {
                Ok(header) => header,
                Err(e) => {
                    trace!(self.log, "unable to parse packet header"; "reason" => %e);
                    return;
                }
            };

            // check the destination CID is ours
            let known_dcid = self.host_cids.iter().any(|entry| entry.cid == header.dst_cid);
            if self.side == Side::Client && !known_dcid {
                return;
            }

            // version negotiation (clients only)
            if self.side == Side::Client && header.is_version_negotiation() {
                let mut versions = Vec::new();
                while !buf.eof() {
                    match buf.pull_u32() {
                        Ok(v) => versions.push(v),
                        Err(_) => return,
                    }
                }
                self.handle_version_negotiation(&versions, now);
                return;
            }
            if let Some(version) = header.version {
                if version != VERSION_NEGOTIATION
                    && !self.config.supported_versions.contains(&version)
                {
                    trace!(self.log, "dropping packet with unsupported version"; "version" => version);
                    return;
                }
            }

            // stateless retry (clients only, at most once)
            if self.side == Side::Client && header.packet_type == PACKET_TYPE_RETRY {
                if header.dst_cid == self.host_cid
                    && header.original_dst_cid == self.peer_cid
                    && self.stateless_retry_count == 0
                {
                    info!(self.log, "performing stateless retry");
                    self.original_connection_id = Some(self.peer_cid);
                    self.peer_cid = header.src_cid;
                    self.peer_token = header.token.clone();
                    self.stateless_retry_count += 1;
                    self.begin_handshake(now);
                }
                return;
            }

            // server initialization from the first INITIAL
            if self.side == Side::Server && self.state == State::FirstFlight {
                if header.packet_type != PACKET_TYPE_INITIAL {
                    trace!(self.log, "dropping non-initial packet in first flight");
                    return;
                }
                self.network_paths = vec![NetworkPath::new(addr, false)];
                self.version = header.version.expect("long header carries a version");
                self.initialize(header.dst_cid);
            }

            let epoch = header.epoch();
            let space_idx = space_index(epoch);

            // decrypt the packet in its epoch
            let encrypted_off = buf.tell() - start_off;
            let end_off = buf.tell() + header.rest_length;
            if end_off > data.len() {
                trace!(self.log, "datagram truncates coalesced packet");
                return;
            }
            buf.seek(end_off);

            let expected = self.spaces[space_idx].expected_packet_number;
            let decrypted = self.cryptos[epoch as usize].decrypt_packet(
                &data[start_off..end_off],
                encrypted_off,
                expected,
            );
            let (plain_header, plain_payload, packet_number) = match decrypted {
                Ok(x) => x,
                Err(e) => {
                    debug!(self.log, "failed to decrypt packet"; "epoch" => epoch, "reason" => %e);
                    continue;
                }
            };
            if packet_number > self.spaces[space_idx].expected_packet_number {
                self.spaces[space_idx].expected_packet_number = packet_number + 1;
            }

            if let Some(qlog) = &mut self.qlog {
                qlog.log_event(
                    now,
                    "transport",
                    "packet_received",
                    json!({
                        "type": packet_type_name(header.packet_type),
                        "header": {
                            "packet_number": packet_number,
                            "packet_size": end_off - start_off,
                        },
                        "frames": [],
                    }),
                );
            }

            // a server receiving handshake packets no longer needs initial
            // keys
            if self.side == Side::Server && epoch == Epoch::Handshake {
                self.discard_epoch(Epoch::Initial);
            }

            // adopt the peer's first source CID
            if self.peer_cid_seq.is_none() {
                self.peer_cid = header.src_cid;
                self.peer_cid_seq = Some(0);
            }

            if self.state == State::FirstFlight {
                self.set_state(State::Connected);
            }

            // update the spin bit
            if !header.is_long_header && packet_number > self.spin_highest_pn {
                let spin_bit = get_spin_bit(plain_header[0]);
                self.spin_bit = if self.side == Side::Client {
                    !spin_bit
                } else {
                    spin_bit
                };
                self.spin_highest_pn = packet_number;
                if let Some(qlog) = &mut self.qlog {
                    qlog.log_event(
                        now,
                        "connectivity",
                        "spin_bit_update",
                        json!({"state": self.spin_bit}),
                    );
                }
            }

            // handle the payload
            let path_idx = self.find_or_create_path(addr);
            let context = ReceiveContext {
                epoch,
                host_cid: header.dst_cid,
                path_idx,
                time: now,
            };
            let (is_ack_eliciting, is_probing) =
                match self.payload_received(&context, &plain_payload) {
                    Ok(x) => x,
                    Err(error) => {
                        warn!(self.log, "connection error"; "code" => %error.code, "reason" => %error.reason);
                        self.close(error.code.0, error.frame_type, &error.reason);
                        (false, false)
                    }
                };
            if self.state.is_end_state() || self.close_pending {
                return;
            }

            // update the idle timeout
            self.close_at = Some(now + self.config.idle_timeout);

            // handle peer migration
            if self.side == Side::Server
                && context.host_cid != self.host_cid
                && epoch == Epoch::OneRtt
            {
                info!(self.log, "peer migrating"; "new_cid" => context.host_cid);
                self.host_cid = context.host_cid;
                self.change_connection_id();
            }

            // update the network path
            {
                let path = &mut self.network_paths[path_idx];
                if !path.is_validated && epoch == Epoch::Handshake {
                    info!(self.log, "network path validated by handshake"; "addr" => %path.addr);
                    path.is_validated = true;
                }
                path.bytes_received += (end_off - start_off) as u64;
            }
            if path_idx != 0 && !is_probing {
                info!(self.log, "network path promoted"; "addr" => %self.network_paths[path_idx].addr);
                let path = self.network_paths.remove(path_idx);
                self.network_paths.insert(0, path);
            }

            // record the packet as received
            let space = &mut self.spaces[space_idx];
            if packet_number > space.largest_received_packet {
                space.largest_received_packet = packet_number;
            }
            space.ack_queue.add_one(packet_number);
            if is_ack_eliciting && space.ack_at.is_none() {
                space.ack_at = Some(now + self.ack_delay);
            }
        }
    }

    /// Produce the datagrams that need to be sent now, with the address to
    /// send them to.
    pub fn datagrams_to_send(&mut self, now: f64) -> Vec<(Vec<u8>, SocketAddr)> {
        if self.network_paths.is_empty() {
            return Vec::new();
        }
        if self.state.is_end_state() && !(self.state == State::Closing && self.close_pending) {
            return Vec::new();
        }

        let mut builder = PacketBuilder::new(
            self.host_cid,
            self.peer_cid,
            self.version,
            self.packet_number,
            self.peer_token.clone(),
            self.side == Side::Client && self.state == State::FirstFlight,
            self.spin_bit,
        );

        if self.close_pending {
            self.write_close(&mut builder);
            self.close_pending = false;
            if self.state != State::Closing {
                self.close_begin(true, now);
            }
        } else {
            // congestion control
            let mut max_flight = self
                .loss
                .congestion_window
                .saturating_sub(self.loss.bytes_in_flight);
            if self.probe_pending && max_flight < PACKET_MAX_SIZE {
                max_flight = PACKET_MAX_SIZE;
            }
            builder.max_flight_bytes = Some(max_flight);

            // limit data on un-validated network paths
            if !self.network_paths[0].is_validated {
                let path = &self.network_paths[0];
                builder.max_total_bytes =
                    Some((path.bytes_received * 3).saturating_sub(path.bytes_sent) as usize);
            }

            let result: Result<(), SendStop> = (|| {
                if !self.handshake_confirmed {
                    self.write_handshake(&mut builder, Epoch::Initial)?;
                    self.write_handshake(&mut builder, Epoch::Handshake)?;
                }
                self.write_application(&mut builder, now)?;
                Ok(())
            })();
            match result {
                Ok(()) | Err(SendStop::Full) => {}
            }
        }

        let (datagrams, packets) = builder.flush();

        if !datagrams.is_empty() {
            self.packet_number = builder.packet_number();

            let mut sent_handshake = false;
            for mut packet in packets {
                packet.sent_time = now;
                if packet.epoch == Epoch::Handshake {
                    sent_handshake = true;
                }
                if let Some(qlog) = &mut self.qlog {
                    qlog.log_event(
                        now,
                        "transport",
                        "packet_sent",
                        json!({
                            "type": packet_type_name(packet.packet_type),
                            "header": {
                                "packet_number": packet.packet_number,
                                "packet_size": packet.sent_bytes,
                            },
                            "frames": [],
                        }),
                    );
                }
                let space = &mut self.spaces[space_index(packet.epoch)];
                self.loss.on_packet_sent(packet, space);
            }

            // the client abandons initial keys once handshake packets flow
            if sent_handshake && self.side == Side::Client {
                self.discard_epoch(Epoch::Initial);
            }
        }

        let addr = self.network_paths[0].addr;
        let mut ret = Vec::new();
        for datagram in datagrams {
            self.network_paths[0].bytes_sent += datagram.len() as u64;
            if let Some(qlog) = &mut self.qlog {
                qlog.log_event(
                    now,
                    "transport",
                    "datagram_sent",
                    json!({"byte_length": datagram.len(), "count": 1}),
                );
            }
            ret.push((datagram, addr));
        }
        ret
    }

    //
    // Handshake plumbing
    //

    /// (Re)start the handshake; used for the first flight and again after
    /// Version Negotiation or Retry.
    fn begin_handshake(&mut self, now: f64) {
        self.close_at = Some(now + self.config.idle_timeout);
        let peer_cid = self.peer_cid;
        self.initialize(peer_cid);

        let mut output = tls::Output::new();
        let result = self
            .tls
            .as_mut()
            .expect("initialized above")
            .handle_message(&[], &mut output);
        if let Err(alert) = result {
            let error = TransportError::from(alert);
            self.close(error.code.0, error.frame_type, &error.reason);
            return;
        }
        self.drain_tls_output(output);
    }

    fn initialize(&mut self, peer_cid: ConnectionId) {
        let session_ticket = self.config.session_ticket.clone().filter(|ticket| {
            self.side == Side::Client
                && Some(ticket.server_name.as_str()) == self.config.server_name.as_deref()
        });

        // pre-load transport parameters stored with the ticket, for 0-RTT
        if let Some(ticket) = &session_ticket {
            if ticket.max_early_data_size == Some(0xFFFF_FFFF) {
                for (ext_type, ext_data) in &ticket.other_extensions {
                    if *ext_type == tls::EXTENSION_QUIC_TRANSPORT_PARAMETERS {
                        let data = ext_data.clone();
                        if let Err(e) = self.parse_transport_parameters(&data, true) {
                            debug!(self.log, "ignoring stored transport parameters"; "reason" => %e);
                        }
                        break;
                    }
                }
            }
        }

        let transport_parameters = match self.serialize_transport_parameters() {
            Ok(x) => x,
            Err(e) => {
                warn!(self.log, "failed to serialize transport parameters"; "reason" => %e);
                Vec::new()
            }
        };
        self.tls = Some(self.config.tls.new_session(tls::SessionConfig {
            is_client: self.side == Side::Client,
            alpn_protocols: self.config.alpn_protocols.clone(),
            server_name: self.config.server_name.clone(),
            certificate: self.config.certificate.clone(),
            private_key: self.config.private_key.clone(),
            session_ticket,
            transport_parameters,
        }));

        // fresh packet spaces and keys; anything in flight from a previous
        // attempt leaves the congestion accounting
        for space in self.spaces.iter_mut() {
            self.loss.discard_space(space);
        }
        self.cryptos = Default::default();
        self.crypto_streams = Default::default();
        self.spaces = Default::default();
        self.packet_number = 0;
        if let Err(e) =
            self.cryptos[Epoch::Initial as usize].setup_initial(&peer_cid, self.side == Side::Client)
        {
            warn!(self.log, "failed to derive initial keys"; "reason" => %e);
        }
    }

    /// Route CRYPTO bytes and traffic secrets out of the TLS engine.
    fn drain_tls_output(&mut self, mut output: tls::Output) {
        for secret in output.secrets.drain(..) {
            self.update_traffic_key(&secret);
        }
        for epoch in Epoch::iter() {
            let data = output.take_crypto(epoch);
            if !data.is_empty() {
                self.crypto_streams[epoch as usize].write(&data, false);
            }
        }
        if let Some(tls) = &mut self.tls {
            if let Some(ticket) = tls.take_session_ticket() {
                if let Some(store) = &self.config.ticket_store {
                    store.store(ticket);
                }
            }
        }
    }

    fn update_traffic_key(&mut self, secret: &tls::TrafficSecret) {
        if let Some(sink) = &self.config.secrets_log {
            let client_random = self
                .tls
                .as_ref()
                .and_then(|tls| tls.client_random())
                .unwrap_or([0; 32]);
            let row = ((self.side == Side::Client) == (secret.direction == tls::Direction::Decrypt))
                as usize;
            if let Some(label) = tls::SECRETS_LABELS[row][secret.epoch as usize] {
                if let Ok(mut sink) = sink.lock() {
                    let _ = writeln!(
                        sink,
                        "{} {} {}",
                        label,
                        hex(&client_random),
                        hex(&secret.secret)
                    );
                }
            }
        }

        let pair = &mut self.cryptos[secret.epoch as usize];
        let result = match secret.direction {
            tls::Direction::Encrypt => pair.send.setup(secret.cipher_suite, &secret.secret),
            tls::Direction::Decrypt => pair.recv.setup(secret.cipher_suite, &secret.secret),
        };
        if let Err(e) = result {
            warn!(self.log, "failed to install traffic key"; "epoch" => secret.epoch, "reason" => %e);
        }
    }

    /// Feed reassembled CRYPTO data into TLS and absorb the consequences.
    fn drive_tls(&mut self, epoch: Epoch) -> Result<(), TransportError> {
        let data = self.crypto_streams[epoch as usize].pull_data();
        if data.is_empty() {
            return Ok(());
        }

        let mut output = tls::Output::new();
        let result = self
            .tls
            .as_mut()
            .expect("tls is initialized before crypto frames arrive")
            .handle_message(&data, &mut output);
        if let Err(alert) = result {
            return Err(alert.into());
        }
        self.drain_tls_output(output);

        // emit ALPN as soon as it is known
        if !self.alpn_emitted {
            if let Some(alpn) = self
                .tls
                .as_ref()
                .and_then(|tls| tls.alpn_negotiated())
                .map(str::to_string)
            {
                self.alpn_emitted = true;
                self.events.push_back(Event::ProtocolNegotiated {
                    alpn_protocol: Some(alpn),
                });
            }
        }

        // parse transport parameters as soon as they arrive
        if !self.parameters_received {
            let ext_data = self.tls.as_ref().and_then(|tls| {
                tls.received_extensions().and_then(|exts| {
                    exts.iter()
                        .find(|(ty, _)| *ty == tls::EXTENSION_QUIC_TRANSPORT_PARAMETERS)
                        .map(|(_, data)| data.clone())
                })
            });
            if let Some(data) = ext_data {
                self.parse_transport_parameters(&data, false)?;
                self.parameters_received = true;
            } else if self
                .tls
                .as_ref()
                .map_or(false, |tls| tls.received_extensions().is_some())
            {
                return Err(TransportError::new(
                    ErrorCode::TRANSPORT_PARAMETER_ERROR,
                    Some(frame::Type::CRYPTO.0),
                    "No QUIC transport parameters received",
                ));
            }
        }

        // note handshake completion
        let post_handshake = self
            .tls
            .as_ref()
            .map_or(false, |tls| tls.state().is_post_handshake());
        if !self.handshake_complete && post_handshake {
            self.handshake_complete = true;
            self.loss.is_client_without_1rtt = false;
            self.replenish_connection_ids();
            let tls = self.tls.as_ref().expect("present");
            let alpn = tls.alpn_negotiated().map(str::to_string);
            info!(self.log, "handshake completed"; "alpn" => alpn.as_deref().unwrap_or("-"));
            self.events.push_back(Event::HandshakeCompleted {
                alpn_protocol: alpn,
                early_data_accepted: tls.early_data_accepted(),
                session_resumed: tls.session_resumed(),
            });
            self.unblock_streams(false);
            self.unblock_streams(true);
        }
        Ok(())
    }

    //
    // Frame handling
    //

    /// Walk a decrypted payload frame by frame. Returns whether the packet
    /// was ack-eliciting and whether it contained only probing frames.
    fn payload_received(
        &mut self,
        context: &ReceiveContext,
        plain: &[u8],
    ) -> Result<(bool, bool), TransportError> {
        let mut buf = Buffer::wrap(plain);

        let mut is_ack_eliciting = false;
        let mut is_probing: Option<bool> = None;
        while !buf.eof() {
            let (ty, frame) = match Frame::parse(&mut buf) {
                Ok(x) => x,
                Err(frame::ParseError::UnknownType(ty)) => {
                    return Err(TransportError::new(
                        ErrorCode::PROTOCOL_VIOLATION,
                        Some(ty),
                        "Unknown frame type",
                    ));
                }
                Err(frame::ParseError::Malformed(_)) => {
                    return Err(TransportError::new(
                        ErrorCode::FRAME_ENCODING_ERROR,
                        None,
                        "Failed to parse frame",
                    ));
                }
            };

            if !ty.is_allowed_in(context.epoch) {
                return Err(TransportError::new(
                    ErrorCode::PROTOCOL_VIOLATION,
                    Some(ty.0),
                    "Unexpected frame type",
                ));
            }

            self.handle_frame(context, ty, frame)?;

            if ty.is_ack_eliciting() {
                is_ack_eliciting = true;
            }
            if !ty.is_probing() {
                is_probing = Some(false);
            } else if is_probing.is_none() {
                is_probing = Some(true);
            }
        }
        Ok((is_ack_eliciting, is_probing.unwrap_or(false)))
    }

    fn handle_frame(
        &mut self,
        context: &ReceiveContext,
        ty: frame::Type,
        frame: Frame,
    ) -> Result<(), TransportError> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack { ranges, delay } => self.handle_ack_frame(context, ranges, delay),
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                self.assert_stream_can_receive(ty.0, stream_id)?;
                info!(self.log, "stream reset by peer";
                      "stream" => stream_id, "error_code" => error_code, "final_size" => final_size);
                self.events.push_back(Event::StreamReset { stream_id });
            }
            Frame::StopSending { stream_id, .. } => {
                self.assert_stream_can_send(ty.0, stream_id)?;
                self.get_or_create_stream(ty.0, stream_id)?;
            }
            Frame::Crypto { offset, data } => {
                self.crypto_streams[context.epoch as usize]
                    .add_frame(StreamFrameData {
                        data,
                        fin: false,
                        offset,
                    })
                    .map_err(|mut e| {
                        e.frame_type = Some(ty.0);
                        e
                    })?;
                self.drive_tls(context.epoch)?;
            }
            Frame::NewToken { .. } => {
                // tokens for future connections are not retained
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                self.handle_stream_frame(ty.0, stream_id, offset, data, fin)?;
            }
            Frame::MaxData(max_data) => {
                if max_data > self.remote_max_data {
                    debug!(self.log, "remote max_data raised"; "value" => max_data);
                    self.remote_max_data = max_data;
                    self.data_blocked_announced = false;
                }
            }
            Frame::MaxStreamData { stream_id, limit } => {
                self.assert_stream_can_send(ty.0, stream_id)?;
                self.get_or_create_stream(ty.0, stream_id)?;
                let stream = self.streams.get_mut(&stream_id).expect("created above");
                if limit > stream.max_stream_data_remote {
                    debug!(self.log, "stream max_stream_data raised"; "stream" => stream_id, "value" => limit);
                    stream.max_stream_data_remote = limit;
                    stream.data_blocked_announced = false;
                }
            }
            Frame::MaxStreamsBidi(max_streams) => {
                if max_streams > self.remote_max_streams_bidi {
                    debug!(self.log, "remote max_streams_bidi raised"; "value" => max_streams);
                    self.remote_max_streams_bidi = max_streams;
                    self.unblock_streams(false);
                }
            }
            Frame::MaxStreamsUni(max_streams) => {
                if max_streams > self.remote_max_streams_uni {
                    debug!(self.log, "remote max_streams_uni raised"; "value" => max_streams);
                    self.remote_max_streams_uni = max_streams;
                    self.unblock_streams(true);
                }
            }
            Frame::DataBlocked(_) => {}
            Frame::StreamDataBlocked { stream_id, .. } => {
                self.assert_stream_can_receive(ty.0, stream_id)?;
                self.get_or_create_stream(ty.0, stream_id)?;
            }
            Frame::StreamsBlockedBidi(_) | Frame::StreamsBlockedUni(_) => {}
            Frame::NewConnectionId {
                sequence,
                cid,
                reset_token,
                ..
            } => {
                debug!(self.log, "new peer connection id"; "seq" => sequence, "peer_cid" => cid);
                self.peer_cid_available.push(ConnectionIdEntry {
                    cid,
                    sequence_number: sequence,
                    stateless_reset_token: reset_token,
                    was_sent: false,
                });
            }
            Frame::RetireConnectionId { sequence } => {
                self.handle_retire_connection_id(ty.0, sequence, context.host_cid)?;
            }
            Frame::PathChallenge(data) => {
                self.network_paths[context.path_idx].remote_challenge = Some(data);
            }
            Frame::PathResponse(data) => {
                let path = &mut self.network_paths[context.path_idx];
                match path.local_challenge {
                    Some(challenge) if constant_time_eq::constant_time_eq(&challenge, &data) => {
                        info!(self.log, "network path validated by challenge"; "addr" => %path.addr);
                        path.is_validated = true;
                    }
                    _ => {
                        return Err(TransportError::new(
                            ErrorCode::PROTOCOL_VIOLATION,
                            Some(ty.0),
                            "Response does not match challenge",
                        ));
                    }
                }
            }
            Frame::TransportClose {
                error_code,
                frame_type,
                reason,
            } => {
                info!(self.log, "connection closed by peer";
                      "error_code" => error_code, "reason" => %reason);
                self.close_event = Some((error_code, Some(frame_type), reason));
                self.close_begin(false, context.time);
            }
            Frame::ApplicationClose { error_code, reason } => {
                info!(self.log, "connection closed by peer application";
                      "error_code" => error_code, "reason" => %reason);
                self.close_event = Some((error_code, None, reason));
                self.close_begin(false, context.time);
            }
        }
        Ok(())
    }

    fn handle_ack_frame(&mut self, context: &ReceiveContext, ranges: RangeSet, delay: u64) {
        let space_idx = space_index(context.epoch);
        let mut out = Vec::new();
        self.loss.on_ack_received(
            &mut self.spaces[space_idx],
            &ranges,
            delay,
            context.time,
            &mut out,
        );
        self.apply_deliveries(out);

        // the first 1-RTT ACK confirms the handshake; handshake keys can go
        if !self.handshake_confirmed && self.handshake_complete && context.epoch == Epoch::OneRtt {
            self.discard_epoch(Epoch::Handshake);
            self.handshake_confirmed = true;
        }
    }

    fn handle_stream_frame(
        &mut self,
        frame_type: u64,
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Result<(), TransportError> {
        self.assert_stream_can_receive(frame_type, stream_id)?;
        self.get_or_create_stream(frame_type, stream_id)?;

        let local_max_data = self.local_max_data;
        let local_max_data_used = self.local_max_data_used;
        let stream = self.streams.get_mut(&stream_id).expect("created above");

        // flow control
        let frame_end = offset + data.len() as u64;
        if frame_end > stream.max_stream_data_local {
            return Err(TransportError::new(
                ErrorCode::FLOW_CONTROL_ERROR,
                Some(frame_type),
                "Over stream data limit",
            ));
        }
        let newly_received = frame_end.saturating_sub(stream.recv_highest());
        if local_max_data_used + newly_received > local_max_data {
            return Err(TransportError::new(
                ErrorCode::FLOW_CONTROL_ERROR,
                Some(frame_type),
                "Over connection data limit",
            ));
        }

        stream
            .add_frame(StreamFrameData { data, fin, offset })
            .map_err(|mut e| {
                e.frame_type = Some(frame_type);
                e
            })?;
        self.local_max_data_used += newly_received;

        // deliver any newly contiguous data, in offset order
        let stream = self.streams.get_mut(&stream_id).expect("present");
        let data = stream.pull_data();
        let at_final = stream.recv_at_final_size();
        let first_final = at_final && !stream.mark_final_delivered();
        if !data.is_empty() || first_final {
            self.events.push_back(Event::StreamDataReceived {
                stream_id,
                data,
                end_stream: at_final,
            });
        }
        Ok(())
    }

    fn handle_retire_connection_id(
        &mut self,
        frame_type: u64,
        sequence: u64,
        packet_host_cid: ConnectionId,
    ) -> Result<(), TransportError> {
        if let Some(index) = self
            .host_cids
            .iter()
            .position(|entry| entry.sequence_number == sequence)
        {
            if self.host_cids[index].cid == packet_host_cid {
                return Err(TransportError::new(
                    ErrorCode::PROTOCOL_VIOLATION,
                    Some(frame_type),
                    "Cannot retire current connection ID",
                ));
            }
            let entry = self.host_cids.remove(index);
            debug!(self.log, "peer retired connection id"; "seq" => sequence, "cid" => entry.cid);
            self.events.push_back(Event::ConnectionIdRetired {
                connection_id: entry.cid,
            });
        }
        // issue a replacement
        self.replenish_connection_ids();
        Ok(())
    }

    //
    // Delivery outcomes
    //

    fn apply_deliveries(&mut self, out: Vec<(DeliveryState, Delivery)>) {
        for (state, delivery) in out {
            match delivery {
                Delivery::AckFrame { epoch, largest } => {
                    if state == DeliveryState::Acked {
                        self.spaces[space_index(epoch)]
                            .ack_queue
                            .subtract(0, largest + 1);
                    }
                }
                Delivery::Stream {
                    stream_id,
                    start,
                    stop,
                    fin,
                } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_data_delivery(state, start, stop, fin);
                    }
                }
                Delivery::Crypto { epoch, start, stop } => {
                    self.crypto_streams[epoch as usize].on_data_delivery(state, start, stop, false);
                }
                Delivery::NewConnectionId { sequence } => {
                    if state != DeliveryState::Acked {
                        if let Some(entry) = self
                            .host_cids
                            .iter_mut()
                            .find(|entry| entry.sequence_number == sequence)
                        {
                            entry.was_sent = false;
                        }
                    }
                }
                Delivery::RetireConnectionId { sequence } => {
                    if state != DeliveryState::Acked {
                        self.retire_connection_ids.push(sequence);
                    }
                }
                Delivery::Ping { uids } => {
                    if state == DeliveryState::Acked {
                        for uid in uids {
                            self.events.push_back(Event::PingAcknowledged { uid });
                        }
                    } else {
                        self.ping_pending.extend(uids);
                    }
                }
                Delivery::MaxData => {
                    if state != DeliveryState::Acked {
                        self.local_max_data_sent = 0;
                    }
                }
                Delivery::MaxStreamData { stream_id } => {
                    if state != DeliveryState::Acked {
                        if let Some(stream) = self.streams.get_mut(&stream_id) {
                            stream.max_stream_data_local_sent = 0;
                        }
                    }
                }
            }
        }
    }

    //
    // Stream bookkeeping
    //

    fn stream_can_receive(&self, stream_id: u64) -> bool {
        stream_is_client_initiated(stream_id) != (self.side == Side::Client)
            || !stream_is_unidirectional(stream_id)
    }

    fn stream_can_send(&self, stream_id: u64) -> bool {
        stream_is_client_initiated(stream_id) == (self.side == Side::Client)
            || !stream_is_unidirectional(stream_id)
    }

    fn assert_stream_can_receive(
        &self,
        frame_type: u64,
        stream_id: u64,
    ) -> Result<(), TransportError> {
        if !self.stream_can_receive(stream_id) {
            return Err(TransportError::new(
                ErrorCode::STREAM_STATE_ERROR,
                Some(frame_type),
                "Stream is send-only",
            ));
        }
        Ok(())
    }

    fn assert_stream_can_send(&self, frame_type: u64, stream_id: u64) -> Result<(), TransportError> {
        if !self.stream_can_send(stream_id) {
            return Err(TransportError::new(
                ErrorCode::STREAM_STATE_ERROR,
                Some(frame_type),
                "Stream is receive-only",
            ));
        }
        Ok(())
    }

    /// Create a stream to send on; applies the peer's limits and queues a
    /// STREAMS_BLOCKED announcement if we are over them.
    fn create_local_stream(&mut self, stream_id: u64) {
        let (max_stream_data_local, max_stream_data_remote, max_streams) =
            if stream_is_unidirectional(stream_id) {
                (0, self.remote_max_stream_data_uni, self.remote_max_streams_uni)
            } else {
                (
                    self.local_max_stream_data_bidi_local,
                    self.remote_max_stream_data_bidi_remote,
                    self.remote_max_streams_bidi,
                )
            };
        let mut stream =
            Stream::new(Some(stream_id), max_stream_data_local, max_stream_data_remote);
        if stream_id / 4 >= max_streams {
            stream.is_blocked = true;
            if stream_is_unidirectional(stream_id) {
                self.streams_blocked_uni.push(stream_id);
            } else {
                self.streams_blocked_bidi.push(stream_id);
            }
            self.streams_blocked_pending = true;
        }
        self.streams.insert(stream_id, stream);
    }

    /// Look up a stream a received frame names, creating it if the peer is
    /// entitled to open it.
    fn get_or_create_stream(
        &mut self,
        frame_type: u64,
        stream_id: u64,
    ) -> Result<(), TransportError> {
        if self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        if stream_is_client_initiated(stream_id) == (self.side == Side::Client) {
            return Err(TransportError::new(
                ErrorCode::STREAM_STATE_ERROR,
                Some(frame_type),
                "Wrong stream initiator",
            ));
        }
        let (max_stream_data_local, max_stream_data_remote, max_streams) =
            if stream_is_unidirectional(stream_id) {
                (self.local_max_stream_data_uni, 0, self.local_max_streams_uni)
            } else {
                (
                    self.local_max_stream_data_bidi_remote,
                    self.remote_max_stream_data_bidi_local,
                    self.local_max_streams_bidi,
                )
            };
        if stream_id / 4 >= max_streams {
            return Err(TransportError::new(
                ErrorCode::STREAM_LIMIT_ERROR,
                Some(frame_type),
                "Too many streams open",
            ));
        }
        info!(self.log, "stream created by peer"; "stream" => stream_id);
        self.streams.insert(
            stream_id,
            Stream::new(Some(stream_id), max_stream_data_local, max_stream_data_remote),
        );
        Ok(())
    }

    fn unblock_streams(&mut self, is_unidirectional: bool) {
        let (max_stream_data_remote, max_streams) = if is_unidirectional {
            (self.remote_max_stream_data_uni, self.remote_max_streams_uni)
        } else {
            (
                self.remote_max_stream_data_bidi_remote,
                self.remote_max_streams_bidi,
            )
        };
        let blocked = if is_unidirectional {
            &mut self.streams_blocked_uni
        } else {
            &mut self.streams_blocked_bidi
        };
        while let Some(&stream_id) = blocked.first() {
            if stream_id / 4 >= max_streams {
                break;
            }
            blocked.remove(0);
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.is_blocked = false;
                stream.max_stream_data_remote = max_stream_data_remote;
            }
        }
        if self.streams_blocked_bidi.is_empty() && self.streams_blocked_uni.is_empty() {
            self.streams_blocked_pending = false;
        }
    }

    //
    // Connection IDs and paths
    //

    /// Top the pool of issued connection IDs back up; new entries go out as
    /// NEW_CONNECTION_ID frames.
    fn replenish_connection_ids(&mut self) {
        let mut rng = OsRng;
        let limit = self
            .remote_active_connection_id_limit
            .min(self.local_active_connection_id_limit);
        while (self.host_cids.len() as u64) < limit {
            self.host_cids.push(ConnectionIdEntry {
                cid: ConnectionId::random(&mut rng, LOCAL_CID_LEN),
                sequence_number: self.host_cid_seq,
                stateless_reset_token: random_reset_token(&mut rng),
                was_sent: false,
            });
            self.host_cid_seq += 1;
        }
    }

    fn find_or_create_path(&mut self, addr: SocketAddr) -> usize {
        if let Some(idx) = self.network_paths.iter().position(|p| p.addr == addr) {
            return idx;
        }
        info!(self.log, "network path discovered"; "addr" => %addr);
        self.network_paths.push(NetworkPath::new(addr, false));
        self.network_paths.len() - 1
    }

    fn handle_version_negotiation(&mut self, versions: &[u32], now: f64) {
        if self.state != State::FirstFlight {
            // VN is only meaningful before any packet is accepted
            return;
        }
        let common: Vec<u32> = self
            .config
            .supported_versions
            .iter()
            .cloned()
            .filter(|v| versions.contains(v))
            .collect();
        let chosen = match common.iter().max() {
            Some(&v) => v,
            None => {
                warn!(self.log, "no common protocol version");
                self.close_event = Some((
                    ErrorCode::INTERNAL_ERROR.0,
                    None,
                    "Could not find a common protocol version".to_string(),
                ));
                self.close_end();
                return;
            }
        };
        info!(self.log, "retrying with negotiated version"; "version" => chosen);
        self.version = chosen;
        self.begin_handshake(now);
    }

    //
    // Lifecycle
    //

    fn set_state(&mut self, state: State) {
        debug!(self.log, "state change";
               "from" => format!("{:?}", self.state), "to" => format!("{:?}", state));
        self.state = state;
    }

    fn close_begin(&mut self, is_initiator: bool, now: f64) {
        self.close_at = Some(now + 3.0 * self.loss.get_probe_timeout());
        if is_initiator {
            self.set_state(State::Closing);
        } else {
            self.set_state(State::Draining);
        }
    }

    fn close_end(&mut self) {
        self.close_at = None;
        for epoch in Epoch::iter() {
            self.discard_epoch(epoch);
        }
        let (error_code, frame_type, reason_phrase) = self
            .close_event
            .take()
            .unwrap_or((ErrorCode::NO_ERROR.0, None, String::new()));
        self.events.push_back(Event::ConnectionTerminated {
            error_code,
            frame_type,
            reason_phrase,
        });
        self.set_state(State::Terminated);
    }

    fn discard_epoch(&mut self, epoch: Epoch) {
        if !self.cryptos[epoch as usize].send.is_valid()
            && !self.cryptos[epoch as usize].recv.is_valid()
        {
            return;
        }
        debug!(self.log, "discarding epoch"; "epoch" => epoch);
        self.cryptos[epoch as usize].teardown();
        if epoch != Epoch::ZeroRtt {
            self.loss.discard_space(&mut self.spaces[space_index(epoch)]);
        }
    }

    //
    // Transport parameters
    //

    fn parse_transport_parameters(
        &mut self,
        data: &[u8],
        from_session_ticket: bool,
    ) -> Result<(), TransportError> {
        let mut buf = Buffer::wrap(data);
        let params = TransportParameters::pull(&mut buf).map_err(|_| {
            TransportError::new(
                ErrorCode::TRANSPORT_PARAMETER_ERROR,
                Some(frame::Type::CRYPTO.0),
                "Malformed transport parameters",
            )
        })?;

        if self.side == Side::Client && !from_session_ticket {
            params.validate_original_connection_id(self.original_connection_id.as_ref())?;
        }

        if let Some(limit) = params.active_connection_id_limit {
            self.remote_active_connection_id_limit = limit;
        }
        if let Some(idle_timeout) = params.idle_timeout {
            self.remote_idle_timeout = idle_timeout as f64 / 1000.0;
        }
        if let Some(exponent) = params.ack_delay_exponent {
            self.loss.ack_delay_exponent = exponent;
        }
        if let Some(max_ack_delay) = params.max_ack_delay {
            self.loss.max_ack_delay = max_ack_delay as f64 / 1000.0;
        }
        if let Some(v) = params.initial_max_data {
            self.remote_max_data = v;
        }
        if let Some(v) = params.initial_max_stream_data_bidi_local {
            self.remote_max_stream_data_bidi_local = v;
        }
        if let Some(v) = params.initial_max_stream_data_bidi_remote {
            self.remote_max_stream_data_bidi_remote = v;
        }
        if let Some(v) = params.initial_max_stream_data_uni {
            self.remote_max_stream_data_uni = v;
        }
        if let Some(v) = params.initial_max_streams_bidi {
            self.remote_max_streams_bidi = v;
        }
        if let Some(v) = params.initial_max_streams_uni {
            self.remote_max_streams_uni = v;
        }
        Ok(())
    }

    fn serialize_transport_parameters(&self) -> Result<Vec<u8>, BufferError> {
        let params = TransportParameters {
            original_connection_id: if self.side == Side::Server {
                self.original_connection_id
            } else {
                None
            },
            idle_timeout: Some((self.config.idle_timeout * 1000.0) as u64),
            initial_max_data: Some(self.local_max_data),
            initial_max_stream_data_bidi_local: Some(self.local_max_stream_data_bidi_local),
            initial_max_stream_data_bidi_remote: Some(self.local_max_stream_data_bidi_remote),
            initial_max_stream_data_uni: Some(self.local_max_stream_data_uni),
            initial_max_streams_bidi: Some(self.local_max_streams_bidi),
            initial_max_streams_uni: Some(self.local_max_streams_uni),
            ack_delay_exponent: Some(10),
            active_connection_id_limit: Some(self.local_active_connection_id_limit),
            ..TransportParameters::default()
        };
        let mut buf = Buffer::new(512);
        params.push(&mut buf)?;
        Ok(buf.data().to_vec())
    }

    //
    // Outgoing packet assembly
    //

    /// Emit the one CONNECTION_CLOSE packet, in the highest epoch whose
    /// keys are still valid.
    fn write_close(&mut self, builder: &mut PacketBuilder) {
        let close_event = match &self.close_event {
            Some(x) => x.clone(),
            None => return,
        };
        for &(epoch, packet_type) in &[
            (Epoch::OneRtt, PACKET_TYPE_ONE_RTT),
            (Epoch::Handshake, PACKET_TYPE_HANDSHAKE),
            (Epoch::Initial, PACKET_TYPE_INITIAL),
        ] {
            if !self.cryptos[epoch as usize].send.is_valid() {
                continue;
            }
            let (error_code, frame_type, reason) = &close_event;
            let result: Result<(), SendStop> = (|| {
                builder.start_packet(packet_type)?;
                match frame_type {
                    Some(frame_type) => {
                        builder.start_frame(frame::Type::TRANSPORT_CLOSE, None)?;
                        let buf = &mut builder.buffer;
                        buf.push_var(*error_code)?;
                        buf.push_var(*frame_type)?;
                        buf.push_var(reason.len() as u64)?;
                        buf.push_bytes(reason.as_bytes())?;
                    }
                    None => {
                        builder.start_frame(frame::Type::APPLICATION_CLOSE, None)?;
                        let buf = &mut builder.buffer;
                        buf.push_var(*error_code)?;
                        buf.push_var(reason.len() as u64)?;
                        buf.push_bytes(reason.as_bytes())?;
                    }
                }
                Ok(())
            })();
            if result.is_ok() {
                if let Err(e) = builder.end_packet(&self.cryptos[epoch as usize]) {
                    warn!(self.log, "failed to protect close packet"; "reason" => %e);
                }
            }
            break;
        }
    }

    fn write_handshake(&mut self, builder: &mut PacketBuilder, epoch: Epoch) -> Result<(), SendStop> {
        if !self.cryptos[epoch as usize].send.is_valid() {
            return Ok(());
        }
        let packet_type = if epoch == Epoch::Initial {
            PACKET_TYPE_INITIAL
        } else {
            PACKET_TYPE_HANDSHAKE
        };
        let space_idx = space_index(epoch);

        loop {
            builder.start_packet(packet_type)?;

            // ACK
            {
                let space = &mut self.spaces[space_idx];
                if space.ack_at.is_some() && !space.ack_queue.is_empty() {
                    builder.start_frame(frame::Type::ACK, None)?;
                    frame::push_ack(&mut builder.buffer, &space.ack_queue, 0)?;
                    space.ack_at = None;
                }
            }

            // CRYPTO
            if !self.crypto_streams[epoch as usize].send_buffer_is_empty() {
                write_crypto_frame(builder, &mut self.crypto_streams[epoch as usize], epoch)?;
            }

            // anti-deadlock padding so the server gains amplification credit
            if self.probe_pending && self.side == Side::Client && epoch == Epoch::Handshake {
                let pad = builder.remaining_space();
                builder.buffer.push_bytes(&vec![0; pad])?;
                self.probe_pending = false;
            }

            match builder.end_packet(&self.cryptos[epoch as usize]) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(self.log, "failed to protect packet"; "reason" => %e);
                    return Err(SendStop::Full);
                }
            }
        }
        Ok(())
    }

    fn write_application(&mut self, builder: &mut PacketBuilder, now: f64) -> Result<(), SendStop> {
        let epoch = if self.cryptos[Epoch::OneRtt as usize].send.is_valid() {
            Epoch::OneRtt
        } else if self.cryptos[Epoch::ZeroRtt as usize].send.is_valid() {
            Epoch::ZeroRtt
        } else {
            return Ok(());
        };
        let packet_type = if epoch == Epoch::OneRtt {
            PACKET_TYPE_ONE_RTT
        } else {
            PACKET_TYPE_ZERO_RTT
        };
        let space_idx = space_index(Epoch::OneRtt);

        loop {
            builder.start_packet(packet_type)?;

            if self.handshake_complete {
                // ACK
                {
                    let space = &mut self.spaces[space_idx];
                    if space.ack_at.map_or(false, |t| t <= now) && !space.ack_queue.is_empty() {
                        builder.start_frame(
                            frame::Type::ACK,
                            Some(Delivery::AckFrame {
                                epoch: Epoch::OneRtt,
                                largest: space.largest_received_packet,
                            }),
                        )?;
                        frame::push_ack(&mut builder.buffer, &space.ack_queue, 0)?;
                        space.ack_at = None;
                    }
                }

                // PATH_CHALLENGE
                if !self.network_paths[0].is_validated
                    && self.network_paths[0].local_challenge.is_none()
                {
                    let mut challenge = [0u8; 8];
                    OsRng.fill_bytes(&mut challenge);
                    info!(self.log, "sending path challenge"; "addr" => %self.network_paths[0].addr);
                    self.network_paths[0].local_challenge = Some(challenge);
                    builder.start_frame(frame::Type::PATH_CHALLENGE, None)?;
                    builder.buffer.push_bytes(&challenge)?;
                }

                // PATH_RESPONSE
                if let Some(challenge) = self.network_paths[0].remote_challenge.take() {
                    builder.start_frame(frame::Type::PATH_RESPONSE, None)?;
                    builder.buffer.push_bytes(&challenge)?;
                }

                // NEW_CONNECTION_ID
                let retire_prior_to = self
                    .host_cids
                    .iter()
                    .map(|entry| entry.sequence_number)
                    .min()
                    .unwrap_or(0);
                for entry in self.host_cids.iter_mut() {
                    if entry.was_sent {
                        continue;
                    }
                    builder.start_frame(
                        frame::Type::NEW_CONNECTION_ID,
                        Some(Delivery::NewConnectionId {
                            sequence: entry.sequence_number,
                        }),
                    )?;
                    frame::push_new_connection_id(
                        &mut builder.buffer,
                        entry.sequence_number,
                        retire_prior_to,
                        &entry.cid,
                        &entry.stateless_reset_token,
                    )?;
                    entry.was_sent = true;
                    self.events.push_back(Event::ConnectionIdIssued {
                        connection_id: entry.cid,
                    });
                }

                // RETIRE_CONNECTION_ID
                while !self.retire_connection_ids.is_empty() {
                    let sequence = self.retire_connection_ids.remove(0);
                    builder.start_frame(
                        frame::Type::RETIRE_CONNECTION_ID,
                        Some(Delivery::RetireConnectionId { sequence }),
                    )?;
                    builder.buffer.push_var(sequence)?;
                }

                // STREAMS_BLOCKED
                if self.streams_blocked_pending {
                    if !self.streams_blocked_bidi.is_empty() {
                        builder.start_frame(frame::Type::STREAMS_BLOCKED_BIDI, None)?;
                        builder.buffer.push_var(self.remote_max_streams_bidi)?;
                    }
                    if !self.streams_blocked_uni.is_empty() {
                        builder.start_frame(frame::Type::STREAMS_BLOCKED_UNI, None)?;
                        builder.buffer.push_var(self.remote_max_streams_uni)?;
                    }
                    self.streams_blocked_pending = false;
                }

                // DATA_BLOCKED
                if self.data_blocked_pending {
                    builder.start_frame(frame::Type::DATA_BLOCKED, None)?;
                    builder.buffer.push_var(self.remote_max_data)?;
                    self.data_blocked_pending = false;
                }

                // connection-level flow control
                if self.local_max_data_used as f64 > self.local_max_data as f64 * 0.75 {
                    self.local_max_data *= 2;
                    debug!(self.log, "local max_data raised"; "value" => self.local_max_data);
                }
                if self.local_max_data_sent != self.local_max_data {
                    builder.start_frame(frame::Type::MAX_DATA, Some(Delivery::MaxData))?;
                    builder.buffer.push_var(self.local_max_data)?;
                    self.local_max_data_sent = self.local_max_data;
                }
            }

            // stream-level flow control
            for (&stream_id, stream) in self.streams.iter_mut() {
                if !stream_can_receive_on(self.side, stream_id) {
                    continue;
                }
                if stream.recv_highest() as f64 > stream.max_stream_data_local as f64 * 0.75 {
                    stream.max_stream_data_local *= 2;
                    debug!(self.log, "stream max_stream_data raised";
                           "stream" => stream_id, "value" => stream.max_stream_data_local);
                }
                if stream.max_stream_data_local_sent != stream.max_stream_data_local {
                    builder.start_frame(
                        frame::Type::MAX_STREAM_DATA,
                        Some(Delivery::MaxStreamData { stream_id }),
                    )?;
                    builder.buffer.push_var(stream_id)?;
                    builder.buffer.push_var(stream.max_stream_data_local)?;
                    stream.max_stream_data_local_sent = stream.max_stream_data_local;
                }
            }

            // PING (user request)
            if !self.ping_pending.is_empty() {
                let uids = std::mem::take(&mut self.ping_pending);
                info!(self.log, "sending ping"; "pn" => builder.packet_number());
                builder.start_frame(frame::Type::PING, Some(Delivery::Ping { uids }))?;
            }

            // PING (probe)
            if self.probe_pending {
                info!(self.log, "sending probe");
                builder.start_frame(frame::Type::PING, None)?;
                self.probe_pending = false;
            }

            // CRYPTO
            if epoch == Epoch::OneRtt
                && !self.crypto_streams[Epoch::OneRtt as usize].send_buffer_is_empty()
            {
                write_crypto_frame(
                    builder,
                    &mut self.crypto_streams[Epoch::OneRtt as usize],
                    Epoch::OneRtt,
                )?;
            }

            // STREAM
            let remote_max_data = self.remote_max_data;
            let mut remote_max_data_used = self.remote_max_data_used;
            let mut connection_blocked = false;
            for (&stream_id, stream) in self.streams.iter_mut() {
                if stream.is_blocked || stream.send_buffer_is_empty() {
                    continue;
                }
                let connection_budget =
                    stream.send_highest() + (remote_max_data - remote_max_data_used);
                let max_offset = connection_budget.min(stream.max_stream_data_remote);
                if max_offset <= stream.next_send_offset() && stream.has_pending_bytes() {
                    // announce why we are stalled, once per stall
                    if stream.is_send_blocked() {
                        if !stream.data_blocked_announced {
                            stream.data_blocked_pending = true;
                            stream.data_blocked_announced = true;
                        }
                    } else {
                        connection_blocked = true;
                    }
                    continue;
                }
                remote_max_data_used += write_stream_frame(builder, stream_id, stream, max_offset)?;
            }
            self.remote_max_data_used = remote_max_data_used;
            if connection_blocked && !self.data_blocked_announced {
                self.data_blocked_pending = true;
                self.data_blocked_announced = true;
            }

            // STREAM_DATA_BLOCKED announcements
            if self.handshake_complete {
                for (&stream_id, stream) in self.streams.iter_mut() {
                    if stream.data_blocked_pending {
                        builder.start_frame(frame::Type::STREAM_DATA_BLOCKED, None)?;
                        builder.buffer.push_var(stream_id)?;
                        builder.buffer.push_var(stream.max_stream_data_remote)?;
                        stream.data_blocked_pending = false;
                    }
                }
            }

            match builder.end_packet(&self.cryptos[epoch as usize]) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(self.log, "failed to protect packet"; "reason" => %e);
                    return Err(SendStop::Full);
                }
            }
        }
        Ok(())
    }
}

fn stream_can_receive_on(side: Side, stream_id: u64) -> bool {
    stream_is_client_initiated(stream_id) != (side == Side::Client)
        || !stream_is_unidirectional(stream_id)
}

/// Write one CRYPTO frame carrying as much of the stream's pending data as
/// fits.
fn write_crypto_frame(
    builder: &mut PacketBuilder,
    stream: &mut Stream,
    epoch: Epoch,
) -> Result<(), SendStop> {
    let frame_overhead = 3 + size_varint(stream.next_send_offset());
    let max_len = builder.remaining_space().saturating_sub(frame_overhead);
    if max_len == 0 {
        return Ok(());
    }
    if let Some(frame_data) = stream.get_frame(max_len, None) {
        let stop = frame_data.offset + frame_data.data.len() as u64;
        builder.start_frame(
            frame::Type::CRYPTO,
            Some(Delivery::Crypto {
                epoch,
                start: frame_data.offset,
                stop,
            }),
        )?;
        let buf = &mut builder.buffer;
        buf.push_var(frame_data.offset)?;
        buf.push_u16(frame_data.data.len() as u16 | 0x4000)?;
        buf.push_bytes(&frame_data.data)?;
    }
    Ok(())
}

/// Write one STREAM frame; returns how many previously-unsent bytes it
/// covers, for connection-level flow-control accounting.
fn write_stream_frame(
    builder: &mut PacketBuilder,
    stream_id: u64,
    stream: &mut Stream,
    max_offset: u64,
) -> Result<u64, SendStop> {
    let frame_overhead = 3
        + size_varint(stream_id)
        + if stream.next_send_offset() > 0 {
            size_varint(stream.next_send_offset())
        } else {
            0
        };
    let previous_send_highest = stream.send_highest();
    let max_len = builder.remaining_space().saturating_sub(frame_overhead);
    if max_len == 0 {
        return Ok(0);
    }
    let frame_data = match stream.get_frame(max_len, Some(max_offset)) {
        Some(x) => x,
        None => return Ok(0),
    };

    let mut frame_type = frame::Type::STREAM_BASE.0 | 0x02; // LEN
    if frame_data.offset > 0 {
        frame_type |= 0x04;
    }
    if frame_data.fin {
        frame_type |= 0x01;
    }
    let stop = frame_data.offset + frame_data.data.len() as u64;
    builder.start_frame(
        frame::Type(frame_type),
        Some(Delivery::Stream {
            stream_id,
            start: frame_data.offset,
            stop,
            fin: frame_data.fin,
        }),
    )?;
    let buf = &mut builder.buffer;
    buf.push_var(stream_id)?;
    if frame_data.offset > 0 {
        buf.push_var(frame_data.offset)?;
    }
    buf.push_u16(frame_data.data.len() as u16 | 0x4000)?;
    buf.push_bytes(&frame_data.data)?;
    Ok(stream.send_highest() - previous_send_highest)
}

fn random_reset_token<R: RngCore>(rng: &mut R) -> [u8; RESET_TOKEN_SIZE] {
    let mut token = [0; RESET_TOKEN_SIZE];
    rng.fill_bytes(&mut token);
    token
}

fn hex(data: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
