//! Packet protection: per-epoch AEAD pairs with header protection, the
//! initial key schedule, key updates, and retry-token sealing.
//!
//! Keys are derived with HKDF-Expand-Label. Initial keys come from a fixed
//! salt and the client's first destination CID; handshake and 1-RTT keys
//! are installed from the traffic secrets the TLS engine hands over.

use std::net::SocketAddr;

use rand::RngCore;
use ring::{aead, hkdf};

use crate::coding::Buffer;
use crate::packet::{
    decode_packet_number, is_long_header, ConnectionId, KEY_PHASE_BIT,
};
use crate::tls::CipherSuite;

pub const AEAD_TAG_SIZE: usize = 16;
const NONCE_LEN: usize = 12;
const SAMPLE_LEN: usize = 16;

/// Initial salt fixed by draft-22.
const INITIAL_SALT: [u8; 20] = [
    0x7f, 0xbc, 0xdb, 0x0e, 0x7c, 0x66, 0xbb, 0xe9, 0x19, 0x3a, 0x96, 0xcd, 0x21, 0x51, 0x9e,
    0xbd, 0x7a, 0x02, 0x64, 0x4a,
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CryptoError {
    #[error("payload decryption failed")]
    Decrypt,
    #[error("keys are not available")]
    KeyUnavailable,
    #[error("key derivation failed")]
    Derivation,
    #[error("packet too short to protect")]
    TooShort,
    #[error("retry token is invalid")]
    InvalidToken,
    #[error("retry token has expired")]
    ExpiredToken,
    #[error("retry token was issued to a different address")]
    AddressMismatch,
}

fn aead_algorithm(suite: CipherSuite) -> &'static aead::Algorithm {
    match suite {
        CipherSuite::Aes128GcmSha256 => &aead::AES_128_GCM,
        CipherSuite::Aes256GcmSha384 => &aead::AES_256_GCM,
        CipherSuite::Chacha20Poly1305Sha256 => &aead::CHACHA20_POLY1305,
    }
}

fn hp_algorithm(suite: CipherSuite) -> &'static aead::quic::Algorithm {
    match suite {
        CipherSuite::Aes128GcmSha256 => &aead::quic::AES_128,
        CipherSuite::Aes256GcmSha384 => &aead::quic::AES_256,
        CipherSuite::Chacha20Poly1305Sha256 => &aead::quic::CHACHA20,
    }
}

fn hkdf_algorithm(suite: CipherSuite) -> hkdf::Algorithm {
    match suite {
        CipherSuite::Aes256GcmSha384 => hkdf::HKDF_SHA384,
        _ => hkdf::HKDF_SHA256,
    }
}

fn key_len(suite: CipherSuite) -> usize {
    match suite {
        CipherSuite::Aes128GcmSha256 => 16,
        _ => 32,
    }
}

fn hash_len(suite: CipherSuite) -> usize {
    match suite {
        CipherSuite::Aes256GcmSha384 => 48,
        _ => 32,
    }
}

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let mut info = Vec::with_capacity(10 + label.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0); // no context
    let info_slice = [info.as_slice()];
    let okm = prk
        .expand(&info_slice, OutLen(out.len()))
        .map_err(|_| CryptoError::Derivation)?;
    okm.fill(out).map_err(|_| CryptoError::Derivation)
}

/// Derive the per-direction initial secrets from the client's first DCID.
pub fn initial_secrets(cid: &ConnectionId) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let initial = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(cid);
    let mut client = vec![0; 32];
    let mut server = vec![0; 32];
    hkdf_expand_label(&initial, b"client in", &mut client)?;
    hkdf_expand_label(&initial, b"server in", &mut server)?;
    Ok((client, server))
}

struct Keys {
    suite: CipherSuite,
    secret: Vec<u8>,
    aead: aead::LessSafeKey,
    iv: [u8; NONCE_LEN],
    hp: aead::quic::HeaderProtectionKey,
    /// Retained so a key update can re-install the unchanged HP key.
    hp_key: Vec<u8>,
}

/// One direction of packet protection for one epoch.
#[derive(Default)]
pub struct CryptoContext {
    keys: Option<Keys>,
}

impl CryptoContext {
    pub fn is_valid(&self) -> bool {
        self.keys.is_some()
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.keys.as_ref().map(|k| k.suite)
    }

    pub fn setup(&mut self, suite: CipherSuite, secret: &[u8]) -> Result<(), CryptoError> {
        let mut hp_key = vec![0; key_len(suite)];
        let prk = hkdf::Prk::new_less_safe(hkdf_algorithm(suite), secret);
        hkdf_expand_label(&prk, b"quic hp", &mut hp_key)?;
        self.setup_with_hp(suite, secret, hp_key)
    }

    fn setup_with_hp(
        &mut self,
        suite: CipherSuite,
        secret: &[u8],
        hp_key: Vec<u8>,
    ) -> Result<(), CryptoError> {
        let prk = hkdf::Prk::new_less_safe(hkdf_algorithm(suite), secret);
        let mut key = vec![0; key_len(suite)];
        let mut iv = [0; NONCE_LEN];
        hkdf_expand_label(&prk, b"quic key", &mut key)?;
        hkdf_expand_label(&prk, b"quic iv", &mut iv)?;

        let aead = aead::LessSafeKey::new(
            aead::UnboundKey::new(aead_algorithm(suite), &key).map_err(|_| CryptoError::Derivation)?,
        );
        let hp = aead::quic::HeaderProtectionKey::new(hp_algorithm(suite), &hp_key)
            .map_err(|_| CryptoError::Derivation)?;
        self.keys = Some(Keys {
            suite,
            secret: secret.to_vec(),
            aead,
            iv,
            hp,
            hp_key,
        });
        Ok(())
    }

    pub fn teardown(&mut self) {
        self.keys = None;
    }

    /// The context for the next key phase: secret rotated via `"quic ku"`,
    /// header-protection key unchanged.
    fn next_context(&self) -> Result<CryptoContext, CryptoError> {
        let keys = self.keys.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        let prk = hkdf::Prk::new_less_safe(hkdf_algorithm(keys.suite), &keys.secret);
        let mut next_secret = vec![0; hash_len(keys.suite)];
        hkdf_expand_label(&prk, b"quic ku", &mut next_secret)?;
        let mut next = CryptoContext::default();
        next.setup_with_hp(keys.suite, &next_secret, keys.hp_key.clone())?;
        Ok(next)
    }

    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let keys = self.keys.as_ref().expect("checked by callers");
        let mut nonce = keys.iv;
        for (b, pn) in nonce[NONCE_LEN - 8..]
            .iter_mut()
            .zip(packet_number.to_be_bytes().iter())
        {
            *b ^= pn;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    fn seal(
        &self,
        header: &[u8],
        payload: &[u8],
        packet_number: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        let mut out = payload.to_vec();
        let tag = keys
            .aead
            .seal_in_place_separate_tag(self.nonce(packet_number), aead::Aad::from(header), &mut out)
            .map_err(|_| CryptoError::Decrypt)?;
        out.extend_from_slice(tag.as_ref());
        Ok(out)
    }

    fn open(
        &self,
        header: &[u8],
        ciphertext: &[u8],
        packet_number: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        let mut out = ciphertext.to_vec();
        let plain_len = keys
            .aead
            .open_in_place(self.nonce(packet_number), aead::Aad::from(header), &mut out)
            .map_err(|_| CryptoError::Decrypt)?
            .len();
        out.truncate(plain_len);
        Ok(out)
    }

    fn header_mask(&self, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        let keys = self.keys.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        keys.hp.new_mask(sample).map_err(|_| CryptoError::Decrypt)
    }
}

/// Send and receive protection for one epoch, plus key-phase tracking for
/// 1-RTT key updates.
#[derive(Default)]
pub struct CryptoPair {
    pub send: CryptoContext,
    pub recv: CryptoContext,
    pub key_phase: bool,
    /// Receive context of the previous phase, kept to decrypt reordered
    /// packets numbered below the first packet of the current phase.
    prev_recv: Option<(u64, CryptoContext)>,
}

impl CryptoPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install both directions of Initial keys from the client's first DCID.
    pub fn setup_initial(&mut self, cid: &ConnectionId, is_client: bool) -> Result<(), CryptoError> {
        let (client, server) = initial_secrets(cid)?;
        let (tx, rx) = if is_client {
            (&client, &server)
        } else {
            (&server, &client)
        };
        self.send.setup(CipherSuite::Aes128GcmSha256, tx)?;
        self.recv.setup(CipherSuite::Aes128GcmSha256, rx)?;
        Ok(())
    }

    /// Locally-initiated key update: rotate both directions and flip the
    /// key phase so subsequent short headers advertise the new phase.
    pub fn update_key(&mut self) -> Result<(), CryptoError> {
        self.send = self.send.next_context()?;
        let old_recv = std::mem::take(&mut self.recv);
        self.recv = old_recv.next_context()?;
        self.prev_recv = Some((u64::max_value(), old_recv));
        self.key_phase = !self.key_phase;
        Ok(())
    }

    pub fn teardown(&mut self) {
        self.send.teardown();
        self.recv.teardown();
        self.prev_recv = None;
    }

    /// Produce the protected packet: HP-masked header followed by the AEAD
    /// ciphertext and tag.
    pub fn encrypt_packet(
        &self,
        plain_header: &[u8],
        plain_payload: &[u8],
        packet_number: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let sealed = self.send.seal(plain_header, plain_payload, packet_number)?;
        let mut out = Vec::with_capacity(plain_header.len() + sealed.len());
        out.extend_from_slice(plain_header);
        out.extend_from_slice(&sealed);

        let first_byte = out[0];
        let pn_length = (first_byte & 0x03) as usize + 1;
        let pn_offset = plain_header.len() - pn_length;
        if out.len() < pn_offset + 4 + SAMPLE_LEN {
            return Err(CryptoError::TooShort);
        }
        let sample = out[pn_offset + 4..pn_offset + 4 + SAMPLE_LEN].to_vec();
        let mask = self.send.header_mask(&sample)?;
        if is_long_header(first_byte) {
            out[0] ^= mask[0] & 0x0F;
        } else {
            out[0] ^= mask[0] & 0x1F;
        }
        for i in 0..pn_length {
            out[pn_offset + i] ^= mask[1 + i];
        }
        Ok(out)
    }

    /// Undo header protection and decrypt one packet. `encrypted_offset` is
    /// the offset of the protected packet-number field within `packet`.
    /// Returns the plain header, plain payload and full packet number.
    pub fn decrypt_packet(
        &mut self,
        packet: &[u8],
        encrypted_offset: usize,
        expected_packet_number: u64,
    ) -> Result<(Vec<u8>, Vec<u8>, u64), CryptoError> {
        if packet.len() < encrypted_offset + 4 + SAMPLE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let sample = &packet[encrypted_offset + 4..encrypted_offset + 4 + SAMPLE_LEN];
        let mask = self.recv.header_mask(sample)?;

        let mut first_byte = packet[0];
        let long = is_long_header(first_byte);
        if long {
            first_byte ^= mask[0] & 0x0F;
        } else {
            first_byte ^= mask[0] & 0x1F;
        }
        let pn_length = (first_byte & 0x03) as usize + 1;

        let mut plain_header = packet[..encrypted_offset + pn_length].to_vec();
        plain_header[0] = first_byte;
        let mut truncated = 0u64;
        for i in 0..pn_length {
            plain_header[encrypted_offset + i] ^= mask[1 + i];
            truncated = (truncated << 8) | u64::from(plain_header[encrypted_offset + i]);
        }
        let packet_number =
            decode_packet_number(truncated, pn_length as u32 * 8, expected_packet_number);
        let ciphertext = &packet[encrypted_offset + pn_length..];

        if long {
            let payload = self.recv.open(&plain_header, ciphertext, packet_number)?;
            return Ok((plain_header, payload, packet_number));
        }

        let packet_phase = first_byte & KEY_PHASE_BIT != 0;
        if packet_phase == self.key_phase {
            let payload = self.recv.open(&plain_header, ciphertext, packet_number)?;
            return Ok((plain_header, payload, packet_number));
        }

        // key phase mismatch: either a straggler from the previous phase or
        // the peer has initiated a key update
        if let Some((boundary, prev)) = &self.prev_recv {
            if packet_number < *boundary {
                if let Ok(payload) = prev.open(&plain_header, ciphertext, packet_number) {
                    return Ok((plain_header, payload, packet_number));
                }
            }
        }
        let candidate = self.recv.next_context()?;
        let payload = candidate.open(&plain_header, ciphertext, packet_number)?;
        let old_recv = std::mem::replace(&mut self.recv, candidate);
        self.prev_recv = Some((packet_number, old_recv));
        self.send = self.send.next_context()?;
        self.key_phase = !self.key_phase;
        Ok((plain_header, payload, packet_number))
    }
}

/// Seals and validates stateless-retry tokens under an endpoint-local key.
pub struct RetryTokenHandler {
    key: aead::LessSafeKey,
}

impl RetryTokenHandler {
    pub fn new<R: RngCore>(rng: &mut R) -> Result<Self, CryptoError> {
        let mut key = [0; 32];
        rng.fill_bytes(&mut key);
        Ok(Self {
            key: aead::LessSafeKey::new(
                aead::UnboundKey::new(&aead::AES_256_GCM, &key)
                    .map_err(|_| CryptoError::Derivation)?,
            ),
        })
    }

    pub fn create_token<R: RngCore>(
        &self,
        rng: &mut R,
        addr: &SocketAddr,
        original_dst_cid: &ConnectionId,
        now: f64,
    ) -> Result<Vec<u8>, CryptoError> {
        let addr = addr.to_string();
        let mut buf = Buffer::new(2 + addr.len() + 1 + original_dst_cid.len() + 8);
        buf.push_u16(addr.len() as u16).map_err(|_| CryptoError::Derivation)?;
        buf.push_bytes(addr.as_bytes()).map_err(|_| CryptoError::Derivation)?;
        buf.push_u8(original_dst_cid.len() as u8)
            .map_err(|_| CryptoError::Derivation)?;
        buf.push_bytes(original_dst_cid)
            .map_err(|_| CryptoError::Derivation)?;
        buf.push_u64((now * 1000.0) as u64)
            .map_err(|_| CryptoError::Derivation)?;

        let mut nonce = [0; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let mut sealed = buf.data().to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| CryptoError::Derivation)?;

        let mut token = Vec::with_capacity(NONCE_LEN + sealed.len() + AEAD_TAG_SIZE);
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&sealed);
        token.extend_from_slice(tag.as_ref());
        Ok(token)
    }

    pub fn validate_token(
        &self,
        addr: &SocketAddr,
        token: &[u8],
        now: f64,
        lifetime: f64,
    ) -> Result<ConnectionId, CryptoError> {
        if token.len() < NONCE_LEN + AEAD_TAG_SIZE {
            return Err(CryptoError::InvalidToken);
        }
        let mut nonce = [0; NONCE_LEN];
        nonce.copy_from_slice(&token[..NONCE_LEN]);
        let mut sealed = token[NONCE_LEN..].to_vec();
        let plain_len = self
            .key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| CryptoError::InvalidToken)?
            .len();
        sealed.truncate(plain_len);

        let mut buf = Buffer::wrap(&sealed);
        let addr_len = buf.pull_u16().map_err(|_| CryptoError::InvalidToken)? as usize;
        let token_addr = buf.pull_bytes(addr_len).map_err(|_| CryptoError::InvalidToken)?;
        let cid_len = buf.pull_u8().map_err(|_| CryptoError::InvalidToken)? as usize;
        let odcid = ConnectionId::new(
            &buf.pull_bytes(cid_len).map_err(|_| CryptoError::InvalidToken)?,
        );
        let issued_ms = buf.pull_u64().map_err(|_| CryptoError::InvalidToken)?;

        let addr = addr.to_string();
        if !constant_time_eq::constant_time_eq(&token_addr, addr.as_bytes()) {
            return Err(CryptoError::AddressMismatch);
        }
        if now - issued_ms as f64 / 1000.0 > lifetime {
            return Err(CryptoError::ExpiredToken);
        }
        Ok(odcid)
    }
}
