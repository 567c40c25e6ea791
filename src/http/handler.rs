//! Application handlers
//!
//! Three kinds of handler can be bound to a URL, and a URL has at most one of
//! them at a time:
//! - URL handlers answer plain HTTP requests with a [`Reply`]
//! - Simple WebSocket handlers receive every message sent to the URL
//! - Advanced WebSocket handlers get one [`WebsocketHandler`] instance per
//!   connection, created by a factory when the socket opens
//!
//! All handlers run on the update thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use super::registry::{ConnectionId, ConnectionRegistry};
use crate::protocol::http::Request;
use crate::protocol::websocket::{Message, Opcode};

/// Body and content type returned by a URL handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub body: Bytes,
    pub mimetype: Option<String>,
}

impl Reply {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            mimetype: None,
        }
    }

    /// Set the `Content-Type` of the reply
    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    /// JSON reply with `application/json` content type
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(value.to_string()).with_mimetype("application/json")
    }
}

impl From<String> for Reply {
    fn from(body: String) -> Self {
        Self::new(body)
    }
}

impl From<&str> for Reply {
    fn from(body: &str) -> Self {
        Self::new(body.to_string())
    }
}

impl From<Vec<u8>> for Reply {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

/// Per-connection WebSocket handler
///
/// Callbacks for one connection are delivered in order: `on_connect`, any
/// number of `on_message`, then `on_disconnect` once the connection is gone.
pub trait WebsocketHandler: Send {
    fn on_connect(&mut self, _connection: &WebsocketConnection) {}

    fn on_message(&mut self, connection: &WebsocketConnection, message: &Message);

    fn on_disconnect(&mut self, _connection: &WebsocketConnection) {}
}

/// Narrow handle to one WebSocket connection, given to handlers
///
/// Holds only the connection id; every operation looks the connection up in
/// the registry, so a handle to a closed connection is harmless.
#[derive(Clone)]
pub struct WebsocketConnection {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl WebsocketConnection {
    pub(crate) fn new(id: ConnectionId, registry: Arc<ConnectionRegistry>) -> Self {
        Self { id, registry }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send a text message; returns `false` if the connection is gone
    pub fn send(&self, text: &str) -> bool {
        self.send_frame(Opcode::Text, text.as_bytes())
    }

    /// Send a binary message; returns `false` if the connection is gone
    pub fn send_binary(&self, data: &[u8]) -> bool {
        self.send_frame(Opcode::Binary, data)
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> bool {
        match self.registry.get(self.id) {
            Some(link) if link.is_open() => {
                link.send_frame(opcode, payload);
                true
            }
            _ => false,
        }
    }

    /// Ask the server to close the connection
    pub fn close(&self) {
        if let Some(link) = self.registry.get(self.id) {
            link.request_close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.registry.get(self.id).is_some_and(|link| link.is_open())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.registry.get(self.id)?.peer_addr()
    }

    /// Path the WebSocket was opened on
    pub fn path(&self) -> Option<String> {
        self.registry.get(self.id)?.websocket_path()
    }
}

impl std::fmt::Debug for WebsocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketConnection")
            .field("id", &self.id)
            .finish()
    }
}

/// Handler answering plain HTTP requests
pub type UrlHandler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Handler receiving every message on a WebSocket URL
pub type SimpleWebsocketHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Factory creating one advanced handler per WebSocket connection
pub type WebsocketHandlerFactory = Arc<dyn Fn() -> Box<dyn WebsocketHandler> + Send + Sync>;

/// Handler tables plus the static file root
#[derive(Default)]
pub struct HandlerTable {
    http: HashMap<String, UrlHandler>,
    simple: HashMap<String, SimpleWebsocketHandler>,
    advanced: HashMap<String, WebsocketHandlerFactory>,
    static_file_path: Option<PathBuf>,
}

impl HandlerTable {
    pub fn new(static_file_path: Option<PathBuf>) -> Self {
        Self {
            static_file_path,
            ..Default::default()
        }
    }

    fn unbind(&mut self, url: &str) {
        self.http.remove(url);
        self.simple.remove(url);
        self.advanced.remove(url);
    }

    /// Bind a URL handler, replacing any handler on `url`
    pub fn set_url_handler(&mut self, url: &str, handler: UrlHandler) {
        self.unbind(url);
        self.http.insert(url.to_string(), handler);
    }

    /// Bind a simple WebSocket handler, replacing any handler on `url`
    pub fn set_simple_websocket_handler(&mut self, url: &str, handler: SimpleWebsocketHandler) {
        self.unbind(url);
        self.simple.insert(url.to_string(), handler);
    }

    /// Bind an advanced WebSocket handler factory, replacing any handler on `url`
    pub fn set_advanced_websocket_handler(&mut self, url: &str, factory: WebsocketHandlerFactory) {
        self.unbind(url);
        self.advanced.insert(url.to_string(), factory);
    }

    pub fn set_static_file_path(&mut self, path: Option<PathBuf>) {
        self.static_file_path = path;
    }

    pub fn static_file_path(&self) -> Option<&PathBuf> {
        self.static_file_path.as_ref()
    }

    pub fn url_handler(&self, url: &str) -> Option<UrlHandler> {
        self.http.get(url).cloned()
    }

    pub fn simple_websocket_handler(&self, url: &str) -> Option<SimpleWebsocketHandler> {
        self.simple.get(url).cloned()
    }

    pub fn websocket_handler_factory(&self, url: &str) -> Option<WebsocketHandlerFactory> {
        self.advanced.get(url).cloned()
    }

    pub fn has_url_handler(&self, url: &str) -> bool {
        self.http.contains_key(url)
    }

    /// Whether either kind of WebSocket handler is bound to `url`
    pub fn has_websocket_handler(&self, url: &str) -> bool {
        self.simple.contains_key(url) || self.advanced.contains_key(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(usize);

    impl WebsocketHandler for Counter {
        fn on_message(&mut self, _connection: &WebsocketConnection, _message: &Message) {
            self.0 += 1;
        }
    }

    #[test]
    fn test_reply_conversions() {
        let reply: Reply = "pong".into();
        assert_eq!(reply.body, Bytes::from("pong"));
        assert_eq!(reply.mimetype, None);

        let reply = Reply::from(String::from("<p>")).with_mimetype("text/html");
        assert_eq!(reply.mimetype.as_deref(), Some("text/html"));

        let reply = Reply::json(&serde_json::json!({ "ok": true }));
        assert_eq!(reply.body, Bytes::from(r#"{"ok":true}"#));
        assert_eq!(reply.mimetype.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_handler_kinds_exclusive() {
        let mut table = HandlerTable::default();
        table.set_url_handler("/x", Arc::new(|_: &Request| Reply::from("a")));
        assert!(table.has_url_handler("/x"));

        table.set_simple_websocket_handler("/x", Arc::new(|_: &Message| {}));
        assert!(!table.has_url_handler("/x"));
        assert!(table.has_websocket_handler("/x"));
        assert!(table.simple_websocket_handler("/x").is_some());

        table.set_advanced_websocket_handler(
            "/x",
            Arc::new(|| Box::new(Counter(0)) as Box<dyn WebsocketHandler>),
        );
        assert!(table.simple_websocket_handler("/x").is_none());
        assert!(table.websocket_handler_factory("/x").is_some());
        assert!(table.url_handler("/y").is_none());
    }

    #[test]
    fn test_connection_handle_for_missing_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let connection = WebsocketConnection::new(42, registry);
        assert!(!connection.is_open());
        assert!(!connection.send("hello"));
        assert_eq!(connection.path(), None);
        connection.close();
    }
}
