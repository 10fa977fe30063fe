//! Sans-I/O endpoint: demultiplexes datagrams onto connections by
//! destination connection ID and answers version negotiation and stateless
//! retry without creating any connection state.
//!
//! Like the connections it owns, the endpoint performs no I/O; the caller
//! shuttles datagrams between it and a UDP socket and drives timers.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use fnv::FnvHashMap;
use rand::rngs::OsRng;
use slab::Slab;
use slog::Logger;

use crate::connection::{Config, Connection, Event};
use crate::crypto::{CryptoError, RetryTokenHandler};
use crate::packet::{
    encode_retry, encode_version_negotiation, pull_header, ConnectionId, PACKET_TYPE_INITIAL,
};
use crate::coding::Buffer;
use crate::{LOCAL_CID_LEN, MAX_UDP_PAYLOAD, VERSION_NEGOTIATION};

/// How long a retry token stays valid, in seconds.
const COOKIE_LIFETIME: f64 = 60.0;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

pub struct Endpoint {
    log: Logger,
    config: Arc<Config>,
    listen: bool,
    connections: Slab<Connection>,
    /// Issued host CIDs, kept in sync from ConnectionIdIssued/Retired
    /// events.
    connection_ids: FnvHashMap<ConnectionId, usize>,
    /// Client-chosen initial DCIDs (servers route long-header packets by
    /// these until the handshake settles).
    connection_ids_initial: FnvHashMap<ConnectionId, usize>,
    retry: Option<RetryTokenHandler>,
    /// Stateless replies (version negotiation, retry) awaiting transmission.
    transmits: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl Endpoint {
    /// `listen` enables the server role: unknown INITIAL packets create
    /// connections instead of being dropped.
    pub fn new(log: Logger, config: Arc<Config>, listen: bool) -> Result<Self, CryptoError> {
        let retry = if listen && config.stateless_retry {
            Some(RetryTokenHandler::new(&mut OsRng)?)
        } else {
            None
        };
        Ok(Self {
            log,
            config,
            listen,
            connections: Slab::new(),
            connection_ids: FnvHashMap::default(),
            connection_ids_initial: FnvHashMap::default(),
            retry,
            transmits: VecDeque::new(),
        })
    }

    /// Initiate an outgoing connection.
    pub fn connect(&mut self, remote: SocketAddr, now: f64) -> ConnectionHandle {
        let conn = Connection::new_client(self.log.clone(), self.config.clone());
        let host_cid = conn.host_cid();
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        let conn = entry.insert(conn);
        self.connection_ids.insert(host_cid, handle.0);
        conn.connect(remote, now);
        handle
    }

    pub fn connection(&self, handle: ConnectionHandle) -> &Connection {
        &self.connections[handle.0]
    }

    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> &mut Connection {
        &mut self.connections[handle.0]
    }

    /// Route one incoming datagram.
    pub fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr, now: f64) {
        let mut buf = Buffer::wrap(data);
        let header = match pull_header(&mut buf, LOCAL_CID_LEN) {
            Ok(header) => header,
            Err(e) => {
                trace!(self.log, "dropping undecodable datagram"; "reason" => %e);
                return;
            }
        };

        // route to an existing connection
        let existing = self
            .connection_ids
            .get(&header.dst_cid)
            .or_else(|| self.connection_ids_initial.get(&header.dst_cid))
            .cloned();
        if let Some(idx) = existing {
            self.connections[idx].receive_datagram(data, addr, now);
            return;
        }

        if !self.listen {
            debug!(self.log, "dropping datagram for unknown connection"; "dcid" => header.dst_cid);
            return;
        }

        // stateless version negotiation
        if let Some(version) = header.version {
            if version != VERSION_NEGOTIATION && !self.config.supported_versions.contains(&version)
            {
                trace!(self.log, "sending version negotiation"; "version" => version);
                let datagram = encode_version_negotiation(
                    &mut OsRng,
                    &header.dst_cid,
                    &header.src_cid,
                    &self.config.supported_versions,
                );
                self.transmits.push_back((datagram, addr));
                return;
            }
        }

        // only a full-size INITIAL may create state
        if !header.is_long_header || header.packet_type != PACKET_TYPE_INITIAL {
            debug!(self.log, "dropping non-initial packet for unknown connection"; "dcid" => header.dst_cid);
            return;
        }
        if data.len() < MAX_UDP_PAYLOAD {
            debug!(self.log, "ignoring short initial"; "len" => data.len());
            return;
        }

        // stateless retry
        let mut original_connection_id = None;
        if let Some(retry) = &self.retry {
            if header.token.is_empty() {
                let version = header.version.expect("initial packets carry a version");
                let mut rng = OsRng;
                let src_cid = ConnectionId::random(&mut rng, LOCAL_CID_LEN);
                match retry.create_token(&mut rng, &addr, &header.dst_cid, now) {
                    Ok(token) => {
                        trace!(self.log, "sending retry"; "odcid" => header.dst_cid);
                        let datagram = encode_retry(
                            version,
                            &src_cid,
                            &header.src_cid,
                            &header.dst_cid,
                            &token,
                        );
                        self.transmits.push_back((datagram, addr));
                    }
                    Err(e) => {
                        warn!(self.log, "failed to mint retry token"; "reason" => %e);
                    }
                }
                return;
            }
            match retry.validate_token(&addr, &header.token, now, COOKIE_LIFETIME) {
                Ok(odcid) => original_connection_id = Some(odcid),
                Err(e) => {
                    debug!(self.log, "rejecting invalid retry token"; "reason" => %e);
                    return;
                }
            }
        }

        // admit the connection
        let conn = Connection::new_server(self.log.clone(), self.config.clone(), original_connection_id);
        let host_cid = conn.host_cid();
        let entry = self.connections.vacant_entry();
        let idx = entry.key();
        let conn = entry.insert(conn);
        self.connection_ids.insert(host_cid, idx);
        self.connection_ids_initial.insert(header.dst_cid, idx);
        conn.receive_datagram(data, addr, now);
    }

    /// Drain pending datagrams: stateless replies first, then every
    /// connection's output.
    pub fn datagrams_to_send(&mut self, now: f64) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut out: Vec<(Vec<u8>, SocketAddr)> = self.transmits.drain(..).collect();
        for (_, conn) in self.connections.iter_mut() {
            out.extend(conn.datagrams_to_send(now));
        }
        out
    }

    /// The next application event from any connection, keeping the CID
    /// routing tables in sync along the way.
    pub fn poll_event(&mut self) -> Option<(ConnectionHandle, Event)> {
        let keys: Vec<usize> = self.connections.iter().map(|(k, _)| k).collect();
        for idx in keys {
            if let Some(event) = self.connections[idx].next_event() {
                match &event {
                    Event::ConnectionIdIssued { connection_id } => {
                        self.connection_ids.insert(*connection_id, idx);
                    }
                    Event::ConnectionIdRetired { connection_id } => {
                        self.connection_ids.remove(connection_id);
                    }
                    Event::ConnectionTerminated { .. } => {
                        self.forget(idx);
                    }
                    _ => {}
                }
                return Some((ConnectionHandle(idx), event));
            }
        }
        None
    }

    /// The earliest timer over all connections. Refreshes each
    /// connection's loss-detection deadline; call before `handle_timer`.
    pub fn get_timer(&mut self) -> Option<f64> {
        let mut earliest: Option<f64> = None;
        for (_, conn) in self.connections.iter_mut() {
            if let Some(t) = conn.get_timer() {
                if earliest.map_or(true, |e| t < e) {
                    earliest = Some(t);
                }
            }
        }
        earliest
    }

    /// Fire timers that are due on every connection.
    pub fn handle_timer(&mut self, now: f64) {
        for (_, conn) in self.connections.iter_mut() {
            conn.handle_timer(now);
        }
    }

    fn forget(&mut self, idx: usize) {
        self.connection_ids.retain(|_, &mut v| v != idx);
        self.connection_ids_initial.retain(|_, &mut v| v != idx);
        self.connections.remove(idx);
    }
}
