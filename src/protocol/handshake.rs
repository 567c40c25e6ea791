//! WebSocket opening handshake
//!
//! Handles the HTTP Upgrade exchange that turns a connection into a
//! WebSocket:
//! - Server side: recognising upgrade requests and building the `101` reply
//! - Client side: building the upgrade request and validating the reply
//! - `ws://` / `wss://` URL parsing

use rand::RngCore;
use url::{Host, Url};

use super::http::{Request, ResponseHead};
use crate::crypto::{base64, Sha1};
use crate::error::ProtocolError;

/// RFC 6455 GUID appended to the client key
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken
pub const WEBSOCKET_VERSION: &str = "13";

/// Subprotocol offered by the client
pub const DEFAULT_SUBPROTOCOL: &str = "chat";

/// `Sec-WebSocket-Accept` value for a client key
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    hasher.finalize().to_base64()
}

/// Fresh random `Sec-WebSocket-Key` (16 random bytes, Base64)
pub fn generate_key() -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    base64::encode(&key)
}

/// Whether a request asks to be upgraded to a WebSocket
///
/// Requires `GET`, `Upgrade: websocket`, a `Connection` header containing
/// `upgrade`, version 13 and a key.
pub fn is_websocket_upgrade(request: &Request) -> bool {
    let header_is = |name: &str, expected: &str| {
        request
            .header(name)
            .is_some_and(|value| value.trim().eq_ignore_ascii_case(expected))
    };

    request.method == "GET"
        && header_is("upgrade", "websocket")
        && request
            .header("connection")
            .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"))
        && header_is("sec-websocket-version", WEBSOCKET_VERSION)
        && request
            .header("sec-websocket-key")
            .is_some_and(|key| !key.trim().is_empty())
}

/// Build the `101 Switching Protocols` reply for an upgrade request
///
/// The first subprotocol the client offered is echoed back.
pub fn upgrade_response(request: &Request) -> Result<String, ProtocolError> {
    let key = request
        .header("sec-websocket-key")
        .ok_or_else(|| ProtocolError::InvalidHandshake("missing Sec-WebSocket-Key".into()))?;

    let mut reply = String::from("HTTP/1.1 101 Switching Protocols\r\n");
    reply.push_str("Upgrade: websocket\r\n");
    reply.push_str("Connection: Upgrade\r\n");
    reply.push_str(&format!(
        "Sec-WebSocket-Accept: {}\r\n",
        compute_accept_key(key)
    ));
    if let Some(protocol) = request
        .header("sec-websocket-protocol")
        .and_then(|offered| offered.split(',').map(str::trim).find(|p| !p.is_empty()))
    {
        reply.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    reply.push_str("Expires: 0\r\n");
    reply.push_str("Cache-Control: max-age=0, no-cache, must-revalidate, proxy-revalidate\r\n");
    reply.push_str("\r\n");
    Ok(reply)
}

/// Build a client upgrade request
///
/// `extra_headers` are sent verbatim after the standard ones.
pub fn client_request(
    host_header: &str,
    path: &str,
    key: &str,
    extra_headers: &[(String, String)],
) -> String {
    let mut request = format!("GET {} HTTP/1.1\r\n", path);
    request.push_str(&format!("Host: {}\r\n", host_header));
    request.push_str("Connection: Upgrade\r\n");
    request.push_str("Upgrade: websocket\r\n");
    request.push_str(&format!("Sec-WebSocket-Version: {}\r\n", WEBSOCKET_VERSION));
    request.push_str(&format!("Sec-WebSocket-Key: {}\r\n", key));
    request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", DEFAULT_SUBPROTOCOL));
    request.push_str("Pragma: no-cache\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Cache-Control: no-cache, no-store, must-revalidate\r\n");
    request.push_str("\r\n");
    request
}

/// Check a server's reply to our upgrade request
pub fn validate_upgrade_response(head: &ResponseHead, key: &str) -> Result<(), ProtocolError> {
    if head.status != 101 {
        return Err(ProtocolError::InvalidHandshake(format!(
            "expected status 101, got {}",
            head.status
        )));
    }

    let upgrade = head
        .header("upgrade")
        .ok_or_else(|| ProtocolError::InvalidHandshake("missing Upgrade header".into()))?;
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return Err(ProtocolError::InvalidHandshake(format!(
            "Upgrade header is '{}'",
            upgrade
        )));
    }

    let connection = head
        .header("connection")
        .ok_or_else(|| ProtocolError::InvalidHandshake("missing Connection header".into()))?;
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return Err(ProtocolError::InvalidHandshake(format!(
            "Connection header is '{}'",
            connection
        )));
    }

    let accept = head.header("sec-websocket-accept").ok_or_else(|| {
        ProtocolError::InvalidHandshake("missing Sec-WebSocket-Accept header".into())
    })?;
    let expected = compute_accept_key(key);
    if accept.trim() != expected {
        return Err(ProtocolError::InvalidHandshake(format!(
            "Sec-WebSocket-Accept mismatch: expected {}, got {}",
            expected, accept
        )));
    }

    Ok(())
}

/// A parsed `ws://` or `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Host name or IP address, without IPv6 brackets
    pub host: String,
    pub port: u16,
    /// Path plus query string
    pub path: String,
    /// `wss://`
    pub tls: bool,
}

impl WsUrl {
    /// Parse a WebSocket URL; the port defaults to 80 / 443
    pub fn parse(url: &str) -> Result<Self, ProtocolError> {
        let parsed =
            Url::parse(url).map_err(|e| ProtocolError::InvalidUrl(format!("{}: {}", url, e)))?;

        let tls = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(ProtocolError::InvalidUrl(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };

        let host = match parsed.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ProtocolError::InvalidUrl(format!("{}: missing host", url))),
        };
        let port = parsed
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    /// Value for the `Host` header (port omitted when it is the default)
    pub fn host_header(&self) -> String {
        host_header(&self.host, self.port, self.tls)
    }
}

/// `Host` header for a host and port, bracketing IPv6 literals
pub fn host_header(host: &str, port: u16, tls: bool) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let default_port = if tls { 443 } else { 80 };
    if port == default_port {
        host
    } else {
        format!("{}:{}", host, port)
    }
}
