//! Synchronous HTTP client
//!
//! One [`HttpClient`] keeps one connection open across requests and only
//! reconnects when the socket has closed or the `Host` header changed.

use tracing::{debug, trace};

use crate::net::{Address, SocketState, TcpSocket};
use crate::protocol::handshake::host_header;
use crate::protocol::http::{build_request, encode_form, read_response, Response};

/// Receive timeout applied to new connections
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Transport security for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// TLS on port 443, plain otherwise
    #[default]
    Auto,
    Plain,
    Tls,
}

impl Scheme {
    /// Whether this scheme means TLS on `port`
    pub fn is_tls(self, port: u16) -> bool {
        match self {
            Scheme::Auto => port == 443,
            Scheme::Plain => false,
            Scheme::Tls => true,
        }
    }
}

/// Blocking HTTP/1.1 client over a reusable connection
pub struct HttpClient {
    host: String,
    port: u16,
    tls: bool,
    /// Request headers in send order; `Host` first
    headers: Vec<(String, String)>,
    socket: TcpSocket,
    timeout_ms: u64,
}

impl HttpClient {
    pub fn new(host: &str, port: u16, scheme: Scheme) -> Self {
        let tls = scheme.is_tls(port);
        Self {
            host: host.to_string(),
            port,
            tls,
            headers: vec![("Host".to_string(), host_header(host, port, tls))],
            socket: TcpSocket::tcp(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Set a request header, replacing any header with the same name
    ///
    /// Setting `Host` retargets the client and drops the open connection.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("host") {
            self.host = value.to_string();
            self.socket.close();
        }
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(header) => header.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Receive timeout in milliseconds; 0 waits forever
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
        self.socket.set_timeout(timeout_ms);
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn get(&mut self, path: &str) -> Response {
        self.request("GET", path, b"")
    }

    pub fn post(&mut self, path: &str, data: &str) -> Response {
        self.request("POST", path, data.as_bytes())
    }

    /// POST URL-encoded form fields
    pub fn post_form(&mut self, path: &str, fields: &[(&str, &str)]) -> Response {
        let body = encode_form(fields.iter().copied());
        self.request("POST", path, body.as_bytes())
    }

    /// Send one request and wait for the complete response
    ///
    /// Connection failures and truncated responses come back with
    /// `success == false`.
    pub fn request(&mut self, method: &str, path: &str, data: &[u8]) -> Response {
        if self.socket.state() == SocketState::Closed && !self.connect() {
            return Response::failed(0);
        }

        let request = build_request(method, path, &self.headers, data);
        trace!(method, path, bytes = request.len(), "Sending request");
        self.socket.send(&request);

        let response = read_response(&mut self.socket);
        let close = !response.success
            || response
                .header("connection")
                .is_some_and(|value| value.eq_ignore_ascii_case("close"));
        if close {
            self.socket.close();
        }

        debug!(
            method,
            path,
            status = response.status,
            success = response.success,
            "Response"
        );
        response
    }

    fn connect(&mut self) -> bool {
        let address = Address::resolve(&self.host);
        let result = if self.tls {
            self.socket.connect_tls(&self.host, &address, self.port)
        } else {
            self.socket.connect(&address, self.port)
        };

        match result {
            Ok(()) => {
                self.socket.set_timeout(self.timeout_ms);
                true
            }
            Err(e) => {
                debug!(host = %self.host, port = self.port, error = %e, "HTTP connect failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .finish()
    }
}
