//! Shared test plumbing: a deterministic paired TLS engine implementing
//! the handshake-transcript contract, an in-memory session-ticket store,
//! and a two-endpoint network simulator with optional datagram loss.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use ring::hkdf;
use slog::{o, Logger};

use quic_proto::connection::{Config, Event};
use quic_proto::endpoint::{ConnectionHandle, Endpoint};
use quic_proto::tls::{
    Alert, CipherSuite, Direction, Epoch, Output, Provider, Session, SessionConfig, SessionTicket,
    State, TicketStore, EXTENSION_QUIC_TRANSPORT_PARAMETERS,
};

pub fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

//
// Deterministic handshake engine
//
// Both halves derive identical traffic secrets from the two randoms
// exchanged in the transcript, so the only communication channel is the
// CRYPTO byte stream, exactly as with a real TLS engine.
//

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_NEW_SESSION_TICKET: u8 = 4;
const MSG_ENCRYPTED_EXTENSIONS: u8 = 8;
const MSG_FINISHED: u8 = 20;

const TICKET_MAGIC: &[u8] = b"resume-me";

struct SecretLen(usize);

impl hkdf::KeyType for SecretLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn derive_secret(client_random: &[u8; 32], server_random: &[u8; 32], label: &[u8]) -> Vec<u8> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(client_random);
    ikm.extend_from_slice(server_random);
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, b"paired-transcript").extract(&ikm);
    let mut out = vec![0; 32];
    prk.expand(&[label], SecretLen(32))
        .expect("hkdf expand")
        .fill(&mut out)
        .expect("hkdf fill");
    out
}

fn push_message(out: &mut Vec<u8>, msg_type: u8, body: &[u8]) {
    out.push(msg_type);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

/// Splits the input stream into (type, body) messages, buffering partials.
#[derive(Default)]
struct MessageReader {
    buffer: Vec<u8>,
}

impl MessageReader {
    fn feed(&mut self, input: &[u8]) {
        self.buffer.extend_from_slice(input);
    }

    fn next(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.buffer.len() < 3 {
            return None;
        }
        let len = u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize;
        if self.buffer.len() < 3 + len {
            return None;
        }
        let msg_type = self.buffer[0];
        let body = self.buffer[3..3 + len].to_vec();
        self.buffer.drain(..3 + len);
        Some((msg_type, body))
    }
}

pub struct PairedSession {
    config: SessionConfig,
    state: State,
    reader: MessageReader,
    client_random: Option<[u8; 32]>,
    server_random: Option<[u8; 32]>,
    alpn: Option<String>,
    received_extensions: Option<Vec<(u16, Vec<u8>)>>,
    session_resumed: bool,
    new_ticket: Option<SessionTicket>,
    issue_tickets: bool,
}

impl PairedSession {
    fn new(config: SessionConfig, issue_tickets: bool) -> Self {
        let state = if config.is_client {
            State::ClientHandshakeStart
        } else {
            State::ServerExpectClientHello
        };
        Self {
            config,
            state,
            reader: MessageReader::default(),
            client_random: None,
            server_random: None,
            alpn: None,
            received_extensions: None,
            session_resumed: false,
            new_ticket: None,
            issue_tickets,
        }
    }

    fn install_secrets(&mut self, output: &mut Output, epoch: Epoch) {
        let client_random = self.client_random.expect("randoms exchanged");
        let server_random = self.server_random.expect("randoms exchanged");
        let (own, peer) = match epoch {
            Epoch::Handshake => (b"client hs".as_ref(), b"server hs".as_ref()),
            _ => (b"client ap".as_ref(), b"server ap".as_ref()),
        };
        let client_secret = derive_secret(&client_random, &server_random, own);
        let server_secret = derive_secret(&client_random, &server_random, peer);
        let (encrypt, decrypt) = if self.config.is_client {
            (client_secret, server_secret)
        } else {
            (server_secret, client_secret)
        };
        output.install_secret(
            Direction::Encrypt,
            epoch,
            CipherSuite::Aes128GcmSha256,
            encrypt,
        );
        output.install_secret(
            Direction::Decrypt,
            epoch,
            CipherSuite::Aes128GcmSha256,
            decrypt,
        );
    }

    fn write_client_hello(&mut self, output: &mut Output) {
        let mut random = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut random);
        self.client_random = Some(random);

        let mut body = Vec::new();
        body.extend_from_slice(&random);
        let sni = self.config.server_name.clone().unwrap_or_default();
        body.push(sni.len() as u8);
        body.extend_from_slice(sni.as_bytes());
        body.push(self.config.alpn_protocols.len() as u8);
        for alpn in &self.config.alpn_protocols {
            body.push(alpn.len() as u8);
            body.extend_from_slice(alpn.as_bytes());
        }
        body.extend_from_slice(&(self.config.transport_parameters.len() as u16).to_be_bytes());
        body.extend_from_slice(&self.config.transport_parameters);
        let ticket = self
            .config
            .session_ticket
            .as_ref()
            .map(|t| t.opaque.clone())
            .unwrap_or_default();
        body.push(ticket.len() as u8);
        body.extend_from_slice(&ticket);

        let mut msg = Vec::new();
        push_message(&mut msg, MSG_CLIENT_HELLO, &body);
        output.write_crypto(Epoch::Initial, &msg);
        self.state = State::ClientExpectServerHello;
    }

    fn handle_client(
        &mut self,
        msg_type: u8,
        body: Vec<u8>,
        output: &mut Output,
    ) -> Result<(), Alert> {
        match (self.state, msg_type) {
            (State::ClientExpectServerHello, MSG_SERVER_HELLO) => {
                if body.len() < 34 {
                    return Err(alert(50, "truncated ServerHello"));
                }
                let mut server_random = [0u8; 32];
                server_random.copy_from_slice(&body[..32]);
                self.server_random = Some(server_random);
                self.session_resumed = body[32] != 0;
                let alpn_len = body[33] as usize;
                if alpn_len > 0 {
                    self.alpn = Some(
                        String::from_utf8(body[34..34 + alpn_len].to_vec())
                            .map_err(|_| alert(50, "bad ALPN"))?,
                    );
                }
                self.install_secrets(output, Epoch::Handshake);
                self.state = State::ClientExpectEncryptedExtensions;
            }
            (State::ClientExpectEncryptedExtensions, MSG_ENCRYPTED_EXTENSIONS) => {
                if body.len() < 2 {
                    return Err(alert(50, "truncated EncryptedExtensions"));
                }
                let tp_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let tp = body[2..2 + tp_len].to_vec();
                self.received_extensions =
                    Some(vec![(EXTENSION_QUIC_TRANSPORT_PARAMETERS, tp)]);
                self.state = State::ClientExpectFinished;
            }
            (State::ClientExpectFinished, MSG_FINISHED) => {
                // answer with our own Finished and move to 1-RTT keys
                let mut msg = Vec::new();
                push_message(&mut msg, MSG_FINISHED, b"client finished");
                output.write_crypto(Epoch::Handshake, &msg);
                self.install_secrets(output, Epoch::OneRtt);
                self.state = State::ClientPostHandshake;
            }
            (State::ClientPostHandshake, MSG_NEW_SESSION_TICKET) => {
                if body.len() < 6 {
                    return Err(alert(50, "truncated NewSessionTicket"));
                }
                let len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let opaque = body[2..2 + len].to_vec();
                let max_early_data = u32::from_be_bytes([
                    body[2 + len],
                    body[3 + len],
                    body[4 + len],
                    body[5 + len],
                ]);
                self.new_ticket = Some(SessionTicket {
                    server_name: self.config.server_name.clone().unwrap_or_default(),
                    max_early_data_size: Some(max_early_data),
                    other_extensions: Vec::new(),
                    opaque,
                });
            }
            _ => return Err(alert(10, "unexpected handshake message")),
        }
        Ok(())
    }

    fn handle_server(
        &mut self,
        msg_type: u8,
        body: Vec<u8>,
        output: &mut Output,
    ) -> Result<(), Alert> {
        match (self.state, msg_type) {
            (State::ServerExpectClientHello, MSG_CLIENT_HELLO) => {
                let mut pos = 0;
                if body.len() < 33 {
                    return Err(alert(50, "truncated ClientHello"));
                }
                let mut client_random = [0u8; 32];
                client_random.copy_from_slice(&body[..32]);
                self.client_random = Some(client_random);
                pos += 32;
                let sni_len = body[pos] as usize;
                pos += 1 + sni_len;
                let alpn_count = body[pos] as usize;
                pos += 1;
                let mut offered = Vec::new();
                for _ in 0..alpn_count {
                    let len = body[pos] as usize;
                    offered.push(
                        String::from_utf8(body[pos + 1..pos + 1 + len].to_vec())
                            .map_err(|_| alert(50, "bad ALPN"))?,
                    );
                    pos += 1 + len;
                }
                let tp_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
                pos += 2;
                let tp = body[pos..pos + tp_len].to_vec();
                pos += tp_len;
                let ticket_len = body[pos] as usize;
                let ticket = &body[pos + 1..pos + 1 + ticket_len];

                self.received_extensions =
                    Some(vec![(EXTENSION_QUIC_TRANSPORT_PARAMETERS, tp)]);
                self.session_resumed = ticket == TICKET_MAGIC;
                self.alpn = self
                    .config
                    .alpn_protocols
                    .iter()
                    .find(|p| offered.iter().any(|o| o == *p))
                    .cloned();

                let mut server_random = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut server_random);
                self.server_random = Some(server_random);

                // ServerHello on the initial stream
                let mut sh = Vec::new();
                sh.extend_from_slice(&server_random);
                sh.push(self.session_resumed as u8);
                let alpn = self.alpn.clone().unwrap_or_default();
                sh.push(alpn.len() as u8);
                sh.extend_from_slice(alpn.as_bytes());
                let mut msg = Vec::new();
                push_message(&mut msg, MSG_SERVER_HELLO, &sh);
                output.write_crypto(Epoch::Initial, &msg);

                // EncryptedExtensions and Finished under handshake keys
                self.install_secrets(output, Epoch::Handshake);
                let mut ee = Vec::new();
                ee.extend_from_slice(
                    &(self.config.transport_parameters.len() as u16).to_be_bytes(),
                );
                ee.extend_from_slice(&self.config.transport_parameters);
                let mut msg = Vec::new();
                push_message(&mut msg, MSG_ENCRYPTED_EXTENSIONS, &ee);
                push_message(&mut msg, MSG_FINISHED, b"server finished");
                output.write_crypto(Epoch::Handshake, &msg);

                // we can send 1-RTT as soon as our Finished is out
                self.install_secrets(output, Epoch::OneRtt);
                self.state = State::ServerExpectFinished;
            }
            (State::ServerExpectFinished, MSG_FINISHED) => {
                self.state = State::ServerPostHandshake;
                if self.issue_tickets {
                    let mut nst = Vec::new();
                    nst.extend_from_slice(&(TICKET_MAGIC.len() as u16).to_be_bytes());
                    nst.extend_from_slice(TICKET_MAGIC);
                    nst.extend_from_slice(&0u32.to_be_bytes());
                    let mut msg = Vec::new();
                    push_message(&mut msg, MSG_NEW_SESSION_TICKET, &nst);
                    output.write_crypto(Epoch::OneRtt, &msg);
                }
            }
            _ => return Err(alert(10, "unexpected handshake message")),
        }
        Ok(())
    }
}

fn alert(description: u8, message: &str) -> Alert {
    Alert {
        description,
        message: message.to_string(),
    }
}

impl Session for PairedSession {
    fn handle_message(&mut self, input: &[u8], output: &mut Output) -> Result<(), Alert> {
        if self.state == State::ClientHandshakeStart {
            self.write_client_hello(output);
            return Ok(());
        }
        self.reader.feed(input);
        while let Some((msg_type, body)) = self.reader.next() {
            if self.config.is_client {
                self.handle_client(msg_type, body, output)?;
            } else {
                self.handle_server(msg_type, body, output)?;
            }
        }
        Ok(())
    }

    fn state(&self) -> State {
        self.state
    }

    fn received_extensions(&self) -> Option<&[(u16, Vec<u8>)]> {
        self.received_extensions.as_deref()
    }

    fn alpn_negotiated(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    fn session_resumed(&self) -> bool {
        self.session_resumed
    }

    fn client_random(&self) -> Option<[u8; 32]> {
        self.client_random
    }

    fn take_session_ticket(&mut self) -> Option<SessionTicket> {
        self.new_ticket.take()
    }
}

pub struct PairedProvider {
    pub issue_tickets: bool,
}

impl Provider for PairedProvider {
    fn new_session(&self, config: SessionConfig) -> Box<dyn Session> {
        Box::new(PairedSession::new(config, self.issue_tickets))
    }
}

//
// Session ticket store
//

#[derive(Default)]
pub struct MemoryTicketStore {
    tickets: Mutex<Vec<SessionTicket>>,
}

impl MemoryTicketStore {
    pub fn first(&self) -> Option<SessionTicket> {
        self.tickets.lock().unwrap().first().cloned()
    }
}

impl TicketStore for MemoryTicketStore {
    fn fetch(&self, _label: &[u8]) -> Option<SessionTicket> {
        self.tickets.lock().unwrap().first().cloned()
    }

    fn store(&self, ticket: SessionTicket) {
        self.tickets.lock().unwrap().push(ticket);
    }
}

//
// Network simulator
//

pub fn client_addr() -> SocketAddr {
    "198.51.100.1:40000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "203.0.113.1:4433".parse().unwrap()
}

pub fn base_config(issue_tickets: bool) -> Config {
    let mut config = Config::new(Arc::new(PairedProvider { issue_tickets }));
    config.alpn_protocols = vec!["h".to_string()];
    config.server_name = Some("example.com".to_string());
    config.certificate = Some(b"self-signed certificate".to_vec());
    config.private_key = Some(b"private key".to_vec());
    config
}

pub struct Sim {
    pub client: Endpoint,
    pub server: Endpoint,
    pub client_handle: ConnectionHandle,
    pub server_handle: Option<ConnectionHandle>,
    pub now: f64,
    pub loss_ratio: f64,
    rng: StdRng,
    pub client_events: Vec<Event>,
    pub server_events: Vec<Event>,
    /// Source address the server sees client datagrams arrive from;
    /// reassign to simulate the client migrating to a new address.
    pub client_source: SocketAddr,
    /// Where the server sent its most recent datagram.
    pub last_server_dest: Option<SocketAddr>,
}

impl Sim {
    pub fn new(client_config: Config, server_config: Config, loss_ratio: f64) -> Self {
        let mut client =
            Endpoint::new(logger(), Arc::new(client_config), false).expect("client endpoint");
        let server =
            Endpoint::new(logger(), Arc::new(server_config), true).expect("server endpoint");
        let client_handle = client.connect(server_addr(), 0.0);
        Self {
            client,
            server,
            client_handle,
            server_handle: None,
            now: 0.0,
            loss_ratio,
            rng: StdRng::seed_from_u64(0x5EED),
            client_events: Vec::new(),
            server_events: Vec::new(),
            client_source: client_addr(),
            last_server_dest: None,
        }
    }

    /// Exchange every pending datagram once, applying the loss ratio.
    /// Returns `true` if anything was transferred.
    pub fn poll_transfer(&mut self) -> bool {
        let mut moved = false;
        let source = self.client_source;
        for (datagram, _) in self.client.datagrams_to_send(self.now) {
            moved = true;
            if self.rng.gen::<f64>() >= self.loss_ratio {
                self.server.handle_datagram(&datagram, source, self.now);
            }
        }
        for (datagram, dest) in self.server.datagrams_to_send(self.now) {
            moved = true;
            self.last_server_dest = Some(dest);
            if self.rng.gen::<f64>() >= self.loss_ratio {
                self.client.handle_datagram(&datagram, server_addr(), self.now);
            }
        }
        self.collect_events();
        moved
    }

    /// Advance simulated time to the earliest pending timer and fire it.
    pub fn advance_time(&mut self) {
        let mut next: Option<f64> = None;
        for t in [self.client.get_timer(), self.server.get_timer()] {
            if let Some(t) = t {
                if next.map_or(true, |n| t < n) {
                    next = Some(t);
                }
            }
        }
        if let Some(next) = next {
            if next > self.now {
                self.now = next;
            } else {
                self.now += 0.001;
            }
        } else {
            self.now += 0.05;
        }
        self.client.handle_timer(self.now);
        self.server.handle_timer(self.now);
        self.collect_events();
    }

    fn collect_events(&mut self) {
        while let Some((_, event)) = self.client.poll_event() {
            self.client_events.push(event);
        }
        while let Some((handle, event)) = self.server.poll_event() {
            if self.server_handle.is_none() {
                self.server_handle = Some(handle);
            }
            self.server_events.push(event);
        }
    }

    /// Pump the network until `predicate(self)` holds or the simulated
    /// clock passes `deadline`. Returns whether the predicate was reached.
    pub fn run_until<F: Fn(&Sim) -> bool>(&mut self, deadline: f64, predicate: F) -> bool {
        for _ in 0..100_000 {
            if predicate(self) {
                return true;
            }
            if !self.poll_transfer() {
                self.advance_time();
            }
            if self.now > deadline {
                return predicate(self);
            }
        }
        predicate(self)
    }
}

