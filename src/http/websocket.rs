//! Synchronous WebSocket client
//!
//! The TCP (or TLS) connect is blocking; after the upgrade request is sent the
//! socket switches to non-blocking and the handshake completes while the
//! caller polls (`receive`, `is_connected`, `wait_until_connected`).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, info, trace};

use super::request::Scheme;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::net::{Address, Selector, SocketState, TcpSocket};
use crate::protocol::handshake::{
    client_request, generate_key, host_header, validate_upgrade_response, WsUrl,
};
use crate::protocol::http::{parse_response_head, READ_BURST};
use crate::protocol::websocket::{
    decode_frame, encode_frame, Message, MessageAssembler, Opcode, Role,
    DEFAULT_MAX_MESSAGE_SIZE,
};

/// Largest handshake response accepted before giving up
const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebsocketState {
    Disconnected,
    /// Upgrade request sent, waiting for `101`
    Connecting,
    Operational,
}

/// WebSocket client connection
pub struct WebsocketClient {
    socket: TcpSocket,
    state: WebsocketState,
    /// Extra headers for the upgrade request
    headers: Vec<(String, String)>,
    key: String,
    buffer: BytesMut,
    assembler: MessageAssembler,
    inbox: VecDeque<Message>,
}

impl WebsocketClient {
    pub fn new() -> Self {
        Self {
            socket: TcpSocket::tcp(),
            state: WebsocketState::Disconnected,
            headers: Vec::new(),
            key: String::new(),
            buffer: BytesMut::new(),
            assembler: MessageAssembler::new(DEFAULT_MAX_MESSAGE_SIZE),
            inbox: VecDeque::new(),
        }
    }

    /// Add a header to future upgrade requests
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(header) => header.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Connect to a `ws://` or `wss://` URL
    pub fn connect(&mut self, url: &str) -> Result<()> {
        let url = WsUrl::parse(url)?;
        let scheme = if url.tls { Scheme::Tls } else { Scheme::Plain };
        self.connect_to(&url.host, url.port, &url.path, scheme)
    }

    /// Open the connection and send the upgrade request
    ///
    /// Returns once the request is sent; the state is then `Connecting`.
    pub fn connect_to(&mut self, host: &str, port: u16, path: &str, scheme: Scheme) -> Result<()> {
        self.close();

        let tls = scheme.is_tls(port);
        let address = Address::resolve(host);
        if address.is_empty() {
            return Err(NetworkError::Unresolved(host.to_string()).into());
        }
        if tls {
            self.socket.connect_tls(host, &address, port)?;
        } else {
            self.socket.connect(&address, port)?;
        }

        self.key = generate_key();
        let request = client_request(&host_header(host, port, tls), path, &self.key, &self.headers);
        self.socket.send(request.as_bytes());
        self.socket.set_blocking(false);
        self.state = WebsocketState::Connecting;

        debug!(host, port, path, tls, "WebSocket upgrade sent");
        Ok(())
    }

    pub fn state(&self) -> WebsocketState {
        self.state
    }

    pub fn is_connected(&mut self) -> bool {
        self.pump();
        self.state == WebsocketState::Operational
    }

    pub fn is_connecting(&mut self) -> bool {
        self.pump();
        self.state == WebsocketState::Connecting
    }

    /// Block until the handshake completes, fails, or `timeout` passes
    pub fn wait_until_connected(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            match self.state {
                WebsocketState::Operational => return true,
                WebsocketState::Disconnected => return false,
                WebsocketState::Connecting => {}
            }
            if !self.wait_readable(deadline) {
                return self.is_connected();
            }
        }
    }

    /// Send a text message; returns `false` unless operational
    pub fn send_text(&mut self, text: &str) -> bool {
        self.send(Opcode::Text, text.as_bytes())
    }

    /// Send a binary message; returns `false` unless operational
    pub fn send_binary(&mut self, data: &[u8]) -> bool {
        self.send(Opcode::Binary, data)
    }

    fn send(&mut self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_frame(opcode, payload);
        true
    }

    fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) {
        let mask: [u8; 4] = rand::random();
        self.socket.send(&encode_frame(true, opcode, payload, Some(mask)));
    }

    /// Next complete message, if one has arrived
    pub fn receive(&mut self) -> Option<Message> {
        self.pump();
        self.inbox.pop_front()
    }

    /// Next complete message as text (lossy UTF-8)
    pub fn receive_text(&mut self) -> Option<String> {
        self.receive().map(|message| message.text())
    }

    /// Wait up to `timeout` for the next message
    pub fn receive_timeout(&mut self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.receive() {
                return Some(message);
            }
            if self.state == WebsocketState::Disconnected || !self.wait_readable(deadline) {
                return self.receive();
            }
        }
    }

    /// Send a close frame (when operational) and drop the connection
    pub fn close(&mut self) {
        if self.state == WebsocketState::Operational {
            self.send_frame(Opcode::Close, &[]);
            self.socket.send_send_queue();
        }
        if self.state != WebsocketState::Disconnected {
            debug!("WebSocket client closed");
        }
        self.disconnect();
        self.inbox.clear();
    }

    fn disconnect(&mut self) {
        self.socket.close();
        self.state = WebsocketState::Disconnected;
        self.buffer.clear();
        self.assembler.reset();
    }

    /// Returns `false` once `deadline` has passed
    fn wait_readable(&mut self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let mut selector = Selector::new();
        selector.add(&self.socket);
        if selector.wait(deadline - now).is_err() {
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Move received bytes through the handshake and frame decoder
    fn pump(&mut self) {
        if self.state == WebsocketState::Disconnected {
            return;
        }

        let mut burst = [0u8; READ_BURST];
        loop {
            let n = self.socket.receive(&mut burst);
            if n == 0 {
                break;
            }
            trace!(bytes = n, "WebSocket client received");
            self.buffer.extend_from_slice(&burst[..n]);
        }

        let result = match self.state {
            WebsocketState::Connecting => self.finish_handshake(),
            WebsocketState::Operational => self.process_frames(),
            WebsocketState::Disconnected => Ok(()),
        };
        if let Err(e) = result {
            debug!(error = %e, "WebSocket client protocol error");
            self.disconnect();
            return;
        }

        if self.state != WebsocketState::Disconnected
            && self.socket.state() == SocketState::Closed
        {
            debug!("WebSocket connection closed by peer");
            self.disconnect();
        }
    }

    fn finish_handshake(&mut self) -> std::result::Result<(), ProtocolError> {
        let Some((head, used)) = parse_response_head(&self.buffer)? else {
            if self.buffer.len() > MAX_HANDSHAKE_SIZE {
                return Err(ProtocolError::InvalidHandshake("response too large".into()));
            }
            return Ok(());
        };
        validate_upgrade_response(&head, &self.key)?;

        self.buffer.advance(used);
        self.state = WebsocketState::Operational;
        info!("WebSocket connected");
        self.process_frames()
    }

    fn process_frames(&mut self) -> std::result::Result<(), ProtocolError> {
        while let Some((frame, used)) =
            decode_frame(&self.buffer, Role::Client, DEFAULT_MAX_MESSAGE_SIZE)?
        {
            self.buffer.advance(used);
            match frame.opcode {
                Opcode::Ping => self.send_frame(Opcode::Pong, &frame.payload),
                Opcode::Pong => {}
                Opcode::Close => {
                    debug!("Close frame from server");
                    self.send_frame(Opcode::Close, &frame.payload[..frame.payload.len().min(2)]);
                    self.socket.send_send_queue();
                    self.disconnect();
                    return Ok(());
                }
                _ => {
                    if let Some(message) = self.assembler.push(frame)? {
                        self.inbox.push_back(message);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for WebsocketClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WebsocketClient {
    fn drop(&mut self) {
        self.close();
    }
}
