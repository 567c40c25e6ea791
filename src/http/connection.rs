//! Per-connection protocol state machine
//!
//! A [`Connection`] is owned by the I/O thread. It accumulates bytes read from
//! its socket, parses HTTP requests while in the `HttpRequest` state and
//! WebSocket frames once upgraded, and either answers directly (upgrades,
//! static files, 404s, control frames) or hands completed work to the update
//! thread as a [`ServerEvent`].

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

use super::handler::HandlerTable;
use super::registry::{ConnectionId, ConnectionLink, ConnectionState};
use crate::error::ProtocolError;
use crate::net::{Pollable, RawHandle};
use crate::protocol::handshake::{is_websocket_upgrade, upgrade_response};
use crate::protocol::http::{
    chunked_reply, mimetype_for, not_found_reply, parse_request, Request, READ_BURST,
};
use crate::protocol::websocket::{
    decode_frame, Frame, Message, MessageAssembler, Opcode, Role, DEFAULT_MAX_MESSAGE_SIZE,
};

/// Chunk size used when streaming static files
pub const STATIC_CHUNK_SIZE: usize = 1024;

/// Completed work handed from the I/O thread to the update thread
#[derive(Debug)]
pub enum ServerEvent {
    /// A request for a path with a URL handler; a reply is owed
    HttpRequest { id: ConnectionId, request: Request },
    /// A connection upgraded to a WebSocket on `path`
    WebsocketOpened { id: ConnectionId, path: String },
    /// A complete WebSocket message
    WebsocketMessage {
        id: ConnectionId,
        path: String,
        message: Message,
    },
    /// A WebSocket connection is gone
    WebsocketClosed { id: ConnectionId, path: String },
}

/// What a connection needs from the server while servicing
pub(crate) struct Routing<'a> {
    pub handlers: &'a RwLock<HandlerTable>,
    pub events: &'a UnboundedSender<ServerEvent>,
    pub max_request_size: usize,
}

/// I/O-thread side of one connection
pub(crate) struct Connection {
    link: Arc<ConnectionLink>,
    buffer: BytesMut,
    last_activity: Instant,
    assembler: MessageAssembler,
    ping_sent: bool,
    handle: Option<RawHandle>,
}

impl Connection {
    pub fn new(link: Arc<ConnectionLink>) -> Self {
        let handle = link.with_socket(|socket| socket.poll_handle());
        Self {
            link,
            buffer: BytesMut::with_capacity(READ_BURST),
            last_activity: Instant::now(),
            assembler: MessageAssembler::new(DEFAULT_MAX_MESSAGE_SIZE),
            ping_sent: false,
            handle,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id
    }

    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    /// OS handle captured at accept time, still valid after close
    pub fn handle(&self) -> Option<RawHandle> {
        self.handle
    }

    /// Whether the socket has closed or a close was requested
    pub fn is_finished(&self) -> bool {
        !self.link.is_open()
    }

    /// Read everything available, process it, and flush outbound data
    pub fn service(&mut self, routing: &Routing<'_>, now: Instant) {
        if self.read_available(routing.max_request_size) {
            self.last_activity = now;
            self.ping_sent = false;
        }

        if let Err(e) = self.process(routing) {
            debug!(connection_id = self.id(), error = %e, "Protocol error, dropping connection");
            self.link.with_socket(|socket| socket.close());
            return;
        }

        self.link.with_socket(|socket| {
            socket.send_send_queue();
        });
    }

    /// Returns `true` if any bytes were read
    fn read_available(&mut self, max_request_size: usize) -> bool {
        let mut burst = [0u8; READ_BURST];
        let mut any = false;
        // Stop once a full request's worth is buffered; the rest stays in the
        // kernel until the buffer drains.
        while self.buffer.len() <= max_request_size.max(DEFAULT_MAX_MESSAGE_SIZE) {
            let n = self.link.with_socket(|socket| socket.receive(&mut burst));
            if n == 0 {
                break;
            }
            trace!(connection_id = self.id(), bytes = n, "Received");
            self.buffer.extend_from_slice(&burst[..n]);
            any = true;
        }
        any
    }

    fn process(&mut self, routing: &Routing<'_>) -> Result<(), ProtocolError> {
        while self.link.state() == ConnectionState::HttpRequest && !self.link.reply_pending() {
            let Some((request, used)) = parse_request(&self.buffer, routing.max_request_size)?
            else {
                return Ok(());
            };
            self.buffer.advance(used);
            self.route(request, routing);
            if self.is_finished() {
                return Ok(());
            }
        }

        if self.link.state() == ConnectionState::Websocket {
            self.process_frames(routing)?;
        }
        Ok(())
    }

    fn route(&mut self, request: Request, routing: &Routing<'_>) {
        debug!(
            connection_id = self.id(),
            method = %request.method,
            path = %request.path,
            "Request"
        );

        let handlers = routing.handlers.read();

        if handlers.has_url_handler(&request.path) {
            drop(handlers);
            self.link.set_reply_pending(true);
            self.emit(routing, ServerEvent::HttpRequest {
                id: self.id(),
                request,
            });
            return;
        }

        if is_websocket_upgrade(&request) {
            let has_handler = handlers.has_websocket_handler(&request.path);
            drop(handlers);
            if has_handler {
                self.upgrade(request, routing);
            } else {
                warn!(path = %request.path, "WebSocket upgrade for path without handler");
                self.link.send(&not_found_reply());
            }
            return;
        }

        let root = handlers.static_file_path().cloned();
        drop(handlers);

        let reply = root
            .as_deref()
            .and_then(|root| read_static_file(root, &request.path))
            .map(|(body, mimetype)| chunked_reply(200, mimetype, &body, STATIC_CHUNK_SIZE));
        match reply {
            Some(reply) => self.link.send(&reply),
            None => {
                warn!(path = %request.path, "File not found");
                self.link.send(&not_found_reply());
            }
        }
    }

    fn upgrade(&mut self, request: Request, routing: &Routing<'_>) {
        let reply = match upgrade_response(&request) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(connection_id = self.id(), error = %e, "Rejected upgrade");
                self.link.send(&not_found_reply());
                return;
            }
        };

        // Bound to the path before the client can observe the 101
        self.link.mark_websocket(&request.path);
        self.link.send(reply.as_bytes());
        info!(connection_id = self.id(), path = %request.path, "WebSocket opened");
        self.emit(routing, ServerEvent::WebsocketOpened {
            id: self.id(),
            path: request.path,
        });
    }

    fn process_frames(&mut self, routing: &Routing<'_>) -> Result<(), ProtocolError> {
        let path = self.link.websocket_path().unwrap_or_default();

        while let Some((frame, used)) =
            decode_frame(&self.buffer, Role::Server, DEFAULT_MAX_MESSAGE_SIZE)?
        {
            self.buffer.advance(used);
            trace!(
                connection_id = self.id(),
                opcode = %frame.opcode,
                bytes = frame.payload.len(),
                "Frame"
            );

            match frame.opcode {
                Opcode::Ping => self.link.send_frame(Opcode::Pong, &frame.payload),
                Opcode::Pong => {}
                Opcode::Close => {
                    let code = (frame.payload.len() >= 2)
                        .then(|| u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
                    debug!(connection_id = self.id(), code = ?code, "Close frame");
                    self.link.with_socket(|socket| {
                        socket.send(&Frame::close(code).encode(None));
                        socket.send_send_queue();
                        socket.close();
                    });
                    return Ok(());
                }
                _ => {
                    if let Some(message) = self.assembler.push(frame)? {
                        self.emit(routing, ServerEvent::WebsocketMessage {
                            id: self.id(),
                            path: path.clone(),
                            message,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply the idle policy; returns `false` when the connection should go
    ///
    /// HTTP connections are dropped after one idle period. WebSockets get a
    /// ping first and are dropped only if the next period is silent too.
    pub fn check_idle(&mut self, now: Instant, idle_timeout: Duration) -> bool {
        if self.link.reply_pending() {
            self.last_activity = now;
            return true;
        }
        if now.duration_since(self.last_activity) < idle_timeout {
            return true;
        }

        match self.link.state() {
            ConnectionState::HttpRequest => {
                debug!(connection_id = self.id(), "Idle HTTP connection dropped");
                false
            }
            ConnectionState::Websocket if !self.ping_sent => {
                trace!(connection_id = self.id(), "Idle WebSocket, sending ping");
                self.link.send_frame(Opcode::Ping, &[]);
                self.ping_sent = true;
                self.last_activity = now;
                true
            }
            ConnectionState::Websocket => {
                debug!(connection_id = self.id(), "WebSocket did not answer ping");
                false
            }
        }
    }

    fn emit(&self, routing: &Routing<'_>, event: ServerEvent) {
        if routing.events.send(event).is_err() {
            trace!(connection_id = self.id(), "Event dropped, server shutting down");
        }
    }
}

/// Read a file below `root` for a request path
///
/// Paths containing `..` are refused. A trailing `/` maps to `index.html`.
pub fn read_static_file(root: &Path, path: &str) -> Option<(Vec<u8>, Option<&'static str>)> {
    if path.contains("..") {
        return None;
    }

    let mut relative = path.trim_start_matches('/').to_string();
    if relative.is_empty() || relative.ends_with('/') {
        relative.push_str("index.html");
    }

    match std::fs::read(root.join(&relative)) {
        Ok(body) => Some((body, mimetype_for(&relative))),
        Err(e) => {
            trace!(path = %relative, error = %e, "Static file read failed");
            None
        }
    }
}
