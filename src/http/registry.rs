//! Connection registry
//!
//! The I/O thread owns all parse state, but replies, broadcasts and handler
//! sends originate on the update thread. Each accepted socket therefore lives
//! in a [`ConnectionLink`] behind a short mutex, and links are tracked in a
//! concurrent map keyed by connection id. Ids are never reused.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::net::{SocketState, TcpSocket};
use crate::protocol::websocket::{encode_frame, Opcode};

/// Unique connection identifier
pub type ConnectionId = u64;

/// Protocol a connection is speaking
///
/// Transitions only from `HttpRequest` to `Websocket`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Reading HTTP requests
    HttpRequest,
    /// Upgraded; reading WebSocket frames
    Websocket,
}

impl ConnectionState {
    /// Get a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::HttpRequest => "HttpRequest",
            ConnectionState::Websocket => "Websocket",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Shared handle to one accepted connection
pub struct ConnectionLink {
    /// Connection id
    pub id: ConnectionId,
    peer: Option<SocketAddr>,
    socket: Mutex<TcpSocket>,
    /// Path the WebSocket was opened on; set once on upgrade
    websocket_path: RwLock<Option<String>>,
    /// Set while an HTTP request is waiting for its handler's reply
    reply_pending: AtomicBool,
    /// Set when anything outside the I/O thread asks for a close
    close_requested: AtomicBool,
    created_at: Instant,
}

impl ConnectionLink {
    fn new(id: ConnectionId, socket: TcpSocket) -> Self {
        Self {
            id,
            peer: socket.peer_addr(),
            socket: Mutex::new(socket),
            websocket_path: RwLock::new(None),
            reply_pending: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Run `f` with exclusive access to the socket
    pub fn with_socket<R>(&self, f: impl FnOnce(&mut TcpSocket) -> R) -> R {
        f(&mut self.socket.lock())
    }

    /// Write raw bytes (queued if the socket is busy)
    pub fn send(&self, data: &[u8]) {
        trace!(connection_id = self.id, bytes = data.len(), "Send");
        self.with_socket(|socket| socket.send(data));
    }

    /// Send one unmasked WebSocket frame
    pub fn send_frame(&self, opcode: Opcode, payload: &[u8]) {
        self.send(&encode_frame(true, opcode, payload, None));
    }

    pub fn is_open(&self) -> bool {
        !self.close_requested.load(Ordering::Acquire)
            && self.with_socket(|socket| socket.state()) != SocketState::Closed
    }

    pub fn state(&self) -> ConnectionState {
        if self.websocket_path.read().is_some() {
            ConnectionState::Websocket
        } else {
            ConnectionState::HttpRequest
        }
    }

    /// Path the WebSocket was opened on, if upgraded
    pub fn websocket_path(&self) -> Option<String> {
        self.websocket_path.read().clone()
    }

    pub(crate) fn mark_websocket(&self, path: &str) {
        *self.websocket_path.write() = Some(path.to_string());
    }

    /// Ask the I/O thread to close this connection
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_reply_pending(&self, pending: bool) {
        self.reply_pending.store(pending, Ordering::Release);
    }

    pub(crate) fn reply_pending(&self) -> bool {
        self.reply_pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConnectionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLink")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("websocket_path", &*self.websocket_path.read())
            .finish()
    }
}

/// Registry of live connections
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionLink>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an accepted socket under a fresh id
    pub fn register(&self, socket: TcpSocket) -> Arc<ConnectionLink> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(ConnectionLink::new(id, socket));
        self.connections.insert(id, link.clone());

        info!(
            connection_id = id,
            peer = ?link.peer_addr(),
            "Connection registered"
        );
        link
    }

    /// Get a connection by id
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionLink>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Remove a connection and close its socket
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionLink>> {
        let (_, link) = self.connections.remove(&id)?;
        link.with_socket(|socket| socket.close());
        info!(
            connection_id = id,
            state = %link.state(),
            "Connection removed"
        );
        Some(link)
    }

    /// Get the count of live connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Get the count of upgraded connections
    pub fn websocket_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|link| link.state() == ConnectionState::Websocket)
            .count()
    }

    /// Get list of all connection ids
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|r| *r.key()).collect()
    }

    /// Open WebSocket connections bound to `path`
    pub fn websockets_on(&self, path: &str) -> Vec<Arc<ConnectionLink>> {
        self.connections
            .iter()
            .filter(|link| link.websocket_path().as_deref() == Some(path))
            .filter(|link| !link.close_requested())
            .map(|link| link.clone())
            .collect()
    }

    /// Send a text frame to every WebSocket on `path`; returns how many were
    /// addressed
    pub fn broadcast(&self, path: &str, data: &[u8]) -> usize {
        let targets = self.websockets_on(path);
        let frame = encode_frame(true, Opcode::Text, data, None);
        for link in &targets {
            link.send(&frame);
        }
        debug!(path = %path, recipients = targets.len(), "Broadcast");
        targets.len()
    }

    /// Close and drop every connection
    pub fn clear(&self) {
        for id in self.connection_ids() {
            self.remove(id);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
