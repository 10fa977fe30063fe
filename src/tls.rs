//! Interface to the TLS 1.3 handshake engine.
//!
//! The engine itself is an external collaborator. The connection drives it
//! through [`Session`]: ordered CRYPTO bytes go in, per-epoch CRYPTO bytes
//! and traffic secrets come out. Certificate validation, the key schedule
//! and session-ticket issuance are entirely the engine's business.

use std::fmt;

/// A keying phase of the connection. Each non-0-RTT epoch owns one packet
/// space; 0-RTT shares the 1-RTT space for acknowledgement accounting.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

pub const EPOCH_COUNT: usize = 4;

impl Epoch {
    pub fn iter() -> impl Iterator<Item = Epoch> {
        static EPOCHS: [Epoch; EPOCH_COUNT] =
            [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::OneRtt];
        EPOCHS.iter().copied()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Epoch::Initial => "Initial",
            Epoch::ZeroRtt => "0-RTT",
            Epoch::Handshake => "Handshake",
            Epoch::OneRtt => "1-RTT",
        };
        f.write_str(name)
    }
}

impl slog::Value for Epoch {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// Which half of a [`crate::crypto::CryptoPair`] a traffic secret keys.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// TLS 1.3 cipher suites usable for packet protection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    Chacha20Poly1305Sha256,
}

/// Observable handshake transcript states.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    ClientHandshakeStart,
    ClientExpectServerHello,
    ClientExpectEncryptedExtensions,
    ClientExpectCertificate,
    ClientExpectCertificateVerify,
    ClientExpectFinished,
    ClientPostHandshake,
    ServerExpectClientHello,
    ServerExpectFinished,
    ServerPostHandshake,
}

impl State {
    pub fn is_post_handshake(self) -> bool {
        matches!(self, State::ClientPostHandshake | State::ServerPostHandshake)
    }
}

/// A fatal TLS alert. Maps to a connection error with
/// `error_code = 0x100 + description` and `frame_type = CRYPTO`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("TLS alert {description}: {message}")]
pub struct Alert {
    pub description: u8,
    pub message: String,
}

/// A traffic secret produced by the handshake, to be routed into the
/// matching epoch's crypto pair.
#[derive(Clone)]
pub struct TrafficSecret {
    pub direction: Direction,
    pub epoch: Epoch,
    pub cipher_suite: CipherSuite,
    pub secret: Vec<u8>,
}

/// Caller-owned buffers the engine appends its output to.
#[derive(Default)]
pub struct Output {
    crypto: [Vec<u8>; EPOCH_COUNT],
    pub secrets: Vec<TrafficSecret>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append handshake bytes destined for `epoch`'s CRYPTO stream.
    pub fn write_crypto(&mut self, epoch: Epoch, data: &[u8]) {
        self.crypto[epoch as usize].extend_from_slice(data);
    }

    pub fn install_secret(
        &mut self,
        direction: Direction,
        epoch: Epoch,
        cipher_suite: CipherSuite,
        secret: Vec<u8>,
    ) {
        self.secrets.push(TrafficSecret {
            direction,
            epoch,
            cipher_suite,
            secret,
        });
    }

    /// Take the bytes queued for `epoch`, leaving the buffer empty.
    pub fn take_crypto(&mut self, epoch: Epoch) -> Vec<u8> {
        std::mem::take(&mut self.crypto[epoch as usize])
    }
}

/// The handshake transcript machine.
///
/// `handle_message` must be idempotent on empty input except in
/// `ClientHandshakeStart`, where it produces the ClientHello.
pub trait Session {
    fn handle_message(&mut self, input: &[u8], output: &mut Output) -> Result<(), Alert>;

    fn state(&self) -> State;

    /// Extensions from the peer's EncryptedExtensions (client) or
    /// ClientHello (server); `None` until the transcript has got there.
    fn received_extensions(&self) -> Option<&[(u16, Vec<u8>)]>;

    fn alpn_negotiated(&self) -> Option<&str>;

    fn session_resumed(&self) -> bool {
        false
    }

    fn early_data_accepted(&self) -> bool {
        false
    }

    /// The 32-byte ClientHello random, once known. Used for secrets logging.
    fn client_random(&self) -> Option<[u8; 32]>;

    /// A session ticket issued by the peer, if one arrived since the last
    /// call.
    fn take_session_ticket(&mut self) -> Option<SessionTicket> {
        None
    }
}

/// Everything the engine needs to start a handshake.
pub struct SessionConfig {
    pub is_client: bool,
    pub alpn_protocols: Vec<String>,
    pub server_name: Option<String>,
    pub certificate: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub session_ticket: Option<SessionTicket>,
    /// The serialized quic_transport_parameters extension to offer.
    pub transport_parameters: Vec<u8>,
}

/// Creates handshake transcript machines; one per connection attempt.
pub trait Provider: Send + Sync {
    fn new_session(&self, config: SessionConfig) -> Box<dyn Session>;
}

/// A TLS session ticket enabling resumption and 0-RTT.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub server_name: String,
    pub max_early_data_size: Option<u32>,
    /// Stored extensions, including the peer's transport parameters for
    /// 0-RTT.
    pub other_extensions: Vec<(u16, Vec<u8>)>,
    /// The opaque ticket as issued by the server.
    pub opaque: Vec<u8>,
}

/// Persists and recalls session tickets across connections.
pub trait TicketStore: Send + Sync {
    fn fetch(&self, label: &[u8]) -> Option<SessionTicket>;
    fn store(&self, ticket: SessionTicket);
}

/// The quic_transport_parameters TLS extension id (draft numbering).
pub const EXTENSION_QUIC_TRANSPORT_PARAMETERS: u16 = 0xFFA5;

/// SSLKEYLOGFILE labels, indexed by `[is_remote_secret][epoch]`.
pub const SECRETS_LABELS: [[Option<&str>; EPOCH_COUNT]; 2] = [
    [
        None,
        Some("QUIC_CLIENT_EARLY_TRAFFIC_SECRET"),
        Some("QUIC_CLIENT_HANDSHAKE_TRAFFIC_SECRET"),
        Some("QUIC_CLIENT_TRAFFIC_SECRET_0"),
    ],
    [
        None,
        None,
        Some("QUIC_SERVER_HANDSHAKE_TRAFFIC_SECRET"),
        Some("QUIC_SERVER_TRAFFIC_SECRET_0"),
    ],
];
