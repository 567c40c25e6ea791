//! Embeddable HTTP + WebSocket server
//!
//! [`Server`] owns a background I/O thread and a queue of completed work. The
//! host application calls [`Server::update`] once per frame; every handler
//! runs inside that call, on the caller's thread.
//!
//! Handlers may register further handlers or broadcast through a
//! [`ServerHandle`] while they run. The handler table lock is never held
//! across a handler call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use super::connection::ServerEvent;
use super::handler::{HandlerTable, Reply, WebsocketConnection, WebsocketHandler};
use super::registry::{ConnectionId, ConnectionRegistry};
use super::worker::IoWorker;
use crate::config::ServerConfig;
use crate::error::{GamewireError, Result};
use crate::net::TcpListener;
use crate::protocol::http::{chunked_reply, not_found_reply, Request};
use crate::protocol::websocket::Message;
use crate::update::Updatable;

/// State shared between the I/O thread, the update thread and handles
pub(crate) struct ServerShared {
    pub registry: Arc<ConnectionRegistry>,
    pub handlers: RwLock<HandlerTable>,
}

/// Cloneable handle for configuring a running server
///
/// Safe to use from inside handlers.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    /// Serve files below `path` for requests no handler claims
    pub fn set_static_file_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        info!(path = %path.display(), "Static file path set");
        self.shared.handlers.write().set_static_file_path(Some(path));
    }

    /// Stop serving static files
    pub fn clear_static_file_path(&self) {
        self.shared.handlers.write().set_static_file_path(None);
    }

    /// Answer HTTP requests for `url` with `handler`
    pub fn add_url_handler<F, R>(&self, url: &str, handler: F)
    where
        F: Fn(&Request) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        debug!(url = %url, "URL handler added");
        self.shared
            .handlers
            .write()
            .set_url_handler(url, Arc::new(move |request: &Request| handler(request).into()));
    }

    /// Deliver every WebSocket message on `url` to `handler`
    pub fn add_simple_websocket_handler<F>(&self, url: &str, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        debug!(url = %url, "Simple WebSocket handler added");
        self.shared
            .handlers
            .write()
            .set_simple_websocket_handler(url, Arc::new(handler));
    }

    /// Create one handler per WebSocket connection on `url` with `factory`
    pub fn add_advanced_websocket_handler<F, H>(&self, url: &str, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: WebsocketHandler + 'static,
    {
        debug!(url = %url, "Advanced WebSocket handler added");
        self.shared.handlers.write().set_advanced_websocket_handler(
            url,
            Arc::new(move || Box::new(factory()) as Box<dyn WebsocketHandler>),
        );
    }

    /// Send `data` as a text message to every open WebSocket on `url`
    ///
    /// Returns the number of connections addressed.
    pub fn broadcast_to_websockets(&self, url: &str, data: &str) -> usize {
        self.shared.registry.broadcast(url, data.as_bytes())
    }

    /// Number of live connections, HTTP and WebSocket
    pub fn connection_count(&self) -> usize {
        self.shared.registry.count()
    }

    pub fn websocket_count(&self) -> usize {
        self.shared.registry.websocket_count()
    }
}

/// HTTP + WebSocket server
pub struct Server {
    handle: ServerHandle,
    events: UnboundedReceiver<ServerEvent>,
    websocket_handlers: HashMap<ConnectionId, Box<dyn WebsocketHandler>>,
    running: Arc<AtomicBool>,
    io_thread: Option<JoinHandle<()>>,
    port: u16,
}

impl Server {
    /// Listen on `port` with default settings
    pub fn new(port: u16) -> Result<Self> {
        Self::with_config(ServerConfig::with_port(port))
    }

    /// Listen and start the I/O thread
    ///
    /// Fails if the configuration is invalid or the port cannot be bound.
    pub fn with_config(config: ServerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| GamewireError::Config(e.to_string()))?;

        let mut listener = TcpListener::new();
        listener.listen(config.port)?;
        let port = listener.local_port().unwrap_or(config.port);

        let shared = Arc::new(ServerShared {
            registry: Arc::new(ConnectionRegistry::new()),
            handlers: RwLock::new(HandlerTable::new(config.static_file_path.clone())),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let worker = IoWorker::new(
            listener,
            port,
            shared.clone(),
            event_tx,
            config,
            running.clone(),
        );
        let io_thread = std::thread::Builder::new()
            .name(format!("gamewire-io-{}", port))
            .spawn(move || worker.run())?;

        info!(port, "Server started");

        Ok(Self {
            handle: ServerHandle { shared },
            events: event_rx,
            websocket_handlers: HashMap::new(),
            running,
            io_thread: Some(io_thread),
            port,
        })
    }

    /// A cloneable handle for use inside handlers or other threads
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Port the server is bound to
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    pub fn set_static_file_path(&self, path: impl Into<PathBuf>) {
        self.handle.set_static_file_path(path);
    }

    pub fn add_url_handler<F, R>(&self, url: &str, handler: F)
    where
        F: Fn(&Request) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        self.handle.add_url_handler(url, handler);
    }

    pub fn add_simple_websocket_handler<F>(&self, url: &str, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handle.add_simple_websocket_handler(url, handler);
    }

    pub fn add_advanced_websocket_handler<F, H>(&self, url: &str, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: WebsocketHandler + 'static,
    {
        self.handle.add_advanced_websocket_handler(url, factory);
    }

    pub fn broadcast_to_websockets(&self, url: &str, data: &str) -> usize {
        self.handle.broadcast_to_websockets(url, data)
    }

    /// Dispatch all work completed by the I/O thread since the last call
    pub fn update(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: ServerEvent) {
        let shared = &self.handle.shared;
        match event {
            ServerEvent::HttpRequest { id, request } => {
                let handler = shared.handlers.read().url_handler(&request.path);
                let reply = handler.map(|handler| handler(&request));

                let Some(link) = shared.registry.get(id) else {
                    debug!(connection_id = id, "Reply dropped, connection gone");
                    return;
                };
                match reply {
                    Some(reply) => link.send(&chunked_reply(
                        200,
                        reply.mimetype.as_deref(),
                        &reply.body,
                        reply.body.len(),
                    )),
                    None => {
                        warn!(path = %request.path, "URL handler removed before reply");
                        link.send(&not_found_reply());
                    }
                }
                link.set_reply_pending(false);
            }
            ServerEvent::WebsocketOpened { id, path } => {
                let factory = shared.handlers.read().websocket_handler_factory(&path);
                if let Some(factory) = factory {
                    let connection = WebsocketConnection::new(id, shared.registry.clone());
                    let mut handler = factory();
                    handler.on_connect(&connection);
                    self.websocket_handlers.insert(id, handler);
                }
            }
            ServerEvent::WebsocketMessage { id, path, message } => {
                if let Some(handler) = self.websocket_handlers.get_mut(&id) {
                    let connection = WebsocketConnection::new(id, shared.registry.clone());
                    handler.on_message(&connection, &message);
                    return;
                }
                let handler = shared.handlers.read().simple_websocket_handler(&path);
                match handler {
                    Some(handler) => handler(&message),
                    None => debug!(connection_id = id, path = %path, "Message without handler"),
                }
            }
            ServerEvent::WebsocketClosed { id, .. } => {
                if let Some(mut handler) = self.websocket_handlers.remove(&id) {
                    let connection = WebsocketConnection::new(id, shared.registry.clone());
                    handler.on_disconnect(&connection);
                }
            }
        }
    }

    /// Stop the I/O thread and close every connection
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.io_thread.take() {
            if thread.join().is_err() {
                warn!(port = self.port, "I/O thread panicked");
            }
            self.handle.shared.registry.clear();
            info!(port = self.port, "Server stopped");
        }
    }
}

impl Updatable for Server {
    fn update(&mut self, _delta: Duration) {
        Server::update(self);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    fn pump_until(server: &mut Server, mut done: impl FnMut(&mut Server) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            server.update();
            if done(server) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_listen_on_ephemeral_port() {
        let server = Server::new(0).unwrap();
        assert_ne!(server.local_port(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_port_in_use_fails() {
        let first = Server::new(0).unwrap();
        assert!(Server::new(first.local_port()).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServerConfig {
            port: 0,
            poll_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::with_config(config),
            Err(GamewireError::Config(_))
        ));
    }

    #[test]
    fn test_url_handler_reply() {
        let mut server = Server::new(0).unwrap();
        server.add_url_handler("/ping", |_| "pong");

        let mut stream = TcpStream::connect(("127.0.0.1", server.local_port())).unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        let mut received = Vec::new();
        pump_until(&mut server, |_| {
            let mut buf = [0u8; 256];
            if let Ok(n) = stream.read(&mut buf) {
                received.extend_from_slice(&buf[..n]);
            }
            received.ends_with(b"0\r\n\r\n")
        });

        let text = String::from_utf8(received).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("4\r\npong\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_handler_can_register_from_inside() {
        let mut server = Server::new(0).unwrap();
        let handle = server.handle();
        server.add_url_handler("/register", move |_| {
            handle.add_url_handler("/late", |_| "late");
            "ok"
        });

        let mut stream = TcpStream::connect(("127.0.0.1", server.local_port())).unwrap();
        stream
            .write_all(b"GET /register HTTP/1.1\r\n\r\n")
            .unwrap();

        pump_until(&mut server, |server| {
            server
                .handle
                .shared
                .handlers
                .read()
                .has_url_handler("/late")
        });
    }
}
