//! TCP transport and listener
//!
//! [`TcpTransport`] is a client or accepted TCP connection, optionally wrapped
//! in a rustls client session. [`TcpListener`] is a dual-stack, non-blocking
//! listening socket. [`TcpSocket`] is the framed socket used everywhere else.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use super::address::Address;
use super::selector::Pollable;
use super::stream::StreamSocket;
use super::transport::{RawHandle, SocketState, Transport};
use crate::error::NetworkError;

/// Pending connections the OS queues before `accept`
pub const LISTEN_BACKLOG: i32 = 8;

/// Framed TCP socket
pub type TcpSocket = StreamSocket<TcpTransport>;

/// Underlying stream, plain or TLS
enum TcpStreamKind {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl TcpStreamKind {
    fn tcp(&self) -> &TcpStream {
        match self {
            TcpStreamKind::Plain(stream) => stream,
            TcpStreamKind::Tls(stream) => stream.get_ref(),
        }
    }
}

/// A TCP connection with configurable blocking mode and timeouts
pub struct TcpTransport {
    stream: Option<TcpStreamKind>,
    state: SocketState,
    blocking: bool,
    timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpTransport {
    /// Create an unconnected, blocking transport
    pub fn new() -> Self {
        Self {
            stream: None,
            state: SocketState::Closed,
            blocking: true,
            timeout: None,
            nodelay: false,
        }
    }

    /// Adopt an already connected stream (e.g. from `accept`)
    pub fn from_stream(stream: TcpStream) -> Self {
        let mut transport = Self::new();
        transport.stream = Some(TcpStreamKind::Plain(stream));
        transport.state = SocketState::Connected;
        transport.apply_options();
        transport
    }

    /// Connect to the first reachable endpoint of `address`
    ///
    /// In non-blocking mode the transport is left `Connecting` and becomes
    /// `Connected` once the OS reports the connection established.
    pub fn connect(&mut self, address: &Address, port: u16) -> Result<(), NetworkError> {
        self.close();
        if address.is_empty() {
            return Err(NetworkError::Unresolved(format!("no endpoints for port {}", port)));
        }

        let mut last_error: Option<io::Error> = None;
        for addr in address.socket_addrs(port) {
            match self.connect_one(addr) {
                Ok(state) => {
                    debug!(peer = %addr, state = %state, "TCP connect");
                    return Ok(());
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "TCP connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => map_connect_error(e),
            None => NetworkError::Refused,
        })
    }

    /// Connect and perform a TLS client handshake against `hostname`
    ///
    /// The handshake always runs in blocking mode; the configured blocking
    /// mode applies afterwards.
    pub fn connect_tls(
        &mut self,
        hostname: &str,
        address: &Address,
        port: u16,
    ) -> Result<(), NetworkError> {
        let blocking = self.blocking;
        self.blocking = true;
        let connected = self.connect(address, port);
        self.blocking = blocking;
        connected?;

        let Some(TcpStreamKind::Plain(tcp)) = self.stream.take() else {
            self.close();
            return Err(NetworkError::NotConnected);
        };
        match tls_handshake(hostname, tcp) {
            Ok(stream) => {
                self.stream = Some(TcpStreamKind::Tls(Box::new(stream)));
                self.apply_options();
                info!(host = %hostname, port, "TLS session established");
                Ok(())
            }
            Err(e) => {
                self.state = SocketState::Closed;
                Err(e)
            }
        }
    }

    fn connect_one(&mut self, addr: SocketAddr) -> io::Result<SocketState> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        let state = if self.blocking {
            match self.timeout {
                Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
                None => socket.connect(&addr.into())?,
            }
            SocketState::Connected
        } else {
            socket.set_nonblocking(true)?;
            match socket.connect(&addr.into()) {
                Ok(()) => SocketState::Connected,
                Err(e) if connect_in_progress(&e) => SocketState::Connecting,
                Err(e) => return Err(e),
            }
        };

        self.stream = Some(TcpStreamKind::Plain(socket.into()));
        self.state = state;
        self.apply_options();
        Ok(state)
    }

    /// Switch between blocking and non-blocking I/O
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
        self.apply_options();
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Read/write timeout for blocking mode; `None` waits forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self.apply_options();
    }

    /// Enable or disable Nagle's algorithm
    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.nodelay = nodelay;
        self.apply_options();
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref()?.tcp().peer_addr().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref()?.tcp().local_addr().ok()
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Some(TcpStreamKind::Tls(_)))
    }

    fn apply_options(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let tcp = stream.tcp();
        let results = [
            tcp.set_nonblocking(!self.blocking),
            tcp.set_read_timeout(self.timeout),
            tcp.set_write_timeout(self.timeout),
            tcp.set_nodelay(self.nodelay),
        ];
        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "Failed to apply socket option");
            }
        }
    }

    fn refresh_connecting(&mut self) -> SocketState {
        let Some(stream) = self.stream.as_ref() else {
            self.state = SocketState::Closed;
            return self.state;
        };
        let tcp = stream.tcp();

        match tcp.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                debug!(error = %e, "Non-blocking connect failed");
                self.close();
                return SocketState::Closed;
            }
        }

        match tcp.peer_addr() {
            Ok(peer) => {
                debug!(peer = %peer, "Non-blocking connect completed");
                self.state = SocketState::Connected;
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => {
                debug!(error = %e, "Non-blocking connect failed");
                self.close();
            }
        }
        self.state
    }

    fn ready_stream(&mut self) -> io::Result<&mut TcpStreamKind> {
        if self.state() == SocketState::Connecting {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.ready_stream()? {
            TcpStreamKind::Plain(stream) => stream.read(buf),
            TcpStreamKind::Tls(stream) => stream.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.ready_stream()? {
            TcpStreamKind::Plain(stream) => stream.write(buf),
            TcpStreamKind::Tls(stream) => write_accepted(&mut **stream, buf),
        }
    }

    fn state(&mut self) -> SocketState {
        match self.state {
            SocketState::Connecting => self.refresh_connecting(),
            state => state,
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            match stream {
                TcpStreamKind::Plain(tcp) => {
                    let _ = tcp.shutdown(Shutdown::Both);
                }
                TcpStreamKind::Tls(mut tls) => {
                    tls.conn.send_close_notify();
                    let _ = tls.flush();
                    let _ = tls.sock.shutdown(Shutdown::Both);
                }
            }
        }
        self.state = SocketState::Closed;
    }

    fn poll_handle(&self) -> Option<RawHandle> {
        self.stream.as_ref().map(|stream| raw_handle(stream.tcp()))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("state", &self.state)
            .field("peer", &self.peer_addr())
            .field("tls", &self.is_tls())
            .field("blocking", &self.blocking)
            .finish()
    }
}

/// Connection helpers on the framed TCP socket
impl StreamSocket<TcpTransport> {
    /// Create an unconnected TCP socket
    pub fn tcp() -> Self {
        Self::new(TcpTransport::new())
    }

    /// Close any current connection, then connect to `address:port`
    pub fn connect(&mut self, address: &Address, port: u16) -> Result<(), NetworkError> {
        self.close();
        self.transport_mut().connect(address, port)
    }

    /// Close any current connection, then connect over TLS
    pub fn connect_tls(
        &mut self,
        hostname: &str,
        address: &Address,
        port: u16,
    ) -> Result<(), NetworkError> {
        self.close();
        self.transport_mut().connect_tls(hostname, address, port)
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.transport_mut().set_blocking(blocking);
    }

    /// Receive/send timeout in milliseconds; 0 waits forever
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        self.transport_mut().set_timeout(timeout);
    }

    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.transport_mut().set_nodelay(nodelay);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport().peer_addr()
    }
}

/// Non-blocking, dual-stack listening socket
#[derive(Debug, Default)]
pub struct TcpListener {
    inner: Option<std::net::TcpListener>,
}

impl TcpListener {
    /// Create a listener that is not yet listening
    pub fn new() -> Self {
        Self { inner: None }
    }

    /// Bind and listen on `port` (0 picks a free port)
    ///
    /// Prefers an IPv6 socket accepting IPv4-mapped peers and falls back to
    /// plain IPv4. On failure the listener stays closed and may be retried.
    pub fn listen(&mut self, port: u16) -> Result<(), NetworkError> {
        self.close();

        let socket = match bind_listener(Domain::IPV6, port) {
            Ok(socket) => socket,
            Err(e) => {
                debug!(port, error = %e, "IPv6 listen failed, falling back to IPv4");
                bind_listener(Domain::IPV4, port).map_err(|e| NetworkError::Bind {
                    port,
                    reason: e.to_string(),
                })?
            }
        };

        let listener: std::net::TcpListener = socket.into();
        let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
        info!(port = bound, "Listening");
        self.inner = Some(listener);
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.inner.is_some()
    }

    /// Port actually bound, if listening
    pub fn local_port(&self) -> Option<u16> {
        self.inner
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!("Listener closed");
        }
    }

    /// Accept one pending connection
    ///
    /// Returns `None` when nothing is pending. Errors other than transient
    /// ones close the listener.
    pub fn accept(&mut self) -> Option<TcpSocket> {
        self.accept_transport().map(StreamSocket::new)
    }

    /// Accept one pending connection into `socket`, closing its previous
    /// connection first
    pub fn accept_into(&mut self, socket: &mut TcpSocket) -> bool {
        match self.accept_transport() {
            Some(transport) => {
                socket.replace_transport(transport);
                true
            }
            None => false,
        }
    }

    fn accept_transport(&mut self) -> Option<TcpTransport> {
        let listener = self.inner.as_ref()?;
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                Some(TcpTransport::from_stream(stream))
            }
            Err(e) if accept_is_transient(&e) => None,
            Err(e) => {
                warn!(error = %e, "Accept failed, closing listener");
                self.close();
                None
            }
        }
    }
}

impl Pollable for TcpListener {
    fn poll_handle(&self) -> Option<RawHandle> {
        self.inner.as_ref().map(raw_listener_handle)
    }
}

fn bind_listener(domain: Domain, port: u16) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    let addr: SocketAddr = if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn accept_is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn map_connect_error(err: io::Error) -> NetworkError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => NetworkError::Refused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkError::Timeout,
        io::ErrorKind::InvalidInput => NetworkError::InvalidAddress(err.to_string()),
        _ => NetworkError::ConnectFailed(err.to_string()),
    }
}

/// Shared client configuration trusting the platform's root certificates
fn tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            let result = rustls_native_certs::load_native_certs();
            for err in &result.errors {
                warn!(error = %err, "Error loading native certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(result.certs);
            debug!(added, ignored, "Loaded native root certificates");

            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

fn tls_handshake(
    hostname: &str,
    mut tcp: TcpStream,
) -> Result<StreamOwned<ClientConnection, TcpStream>, NetworkError> {
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", hostname, e)))?;
    let mut conn = ClientConnection::new(tls_config(), server_name)
        .map_err(|e| NetworkError::Tls(e.to_string()))?;

    while conn.is_handshaking() {
        if let Err(e) = conn.complete_io(&mut tcp) {
            let _ = tcp.shutdown(Shutdown::Both);
            return Err(NetworkError::Tls(e.to_string()));
        }
    }
    Ok(StreamOwned::new(conn, tcp))
}

#[cfg(unix)]
fn raw_handle(stream: &TcpStream) -> RawHandle {
    use std::os::fd::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(windows)]
fn raw_handle(stream: &TcpStream) -> RawHandle {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket()
}

#[cfg(unix)]
fn raw_listener_handle(listener: &std::net::TcpListener) -> RawHandle {
    use std::os::fd::AsRawFd;
    listener.as_raw_fd()
}

#[cfg(windows)]
fn raw_listener_handle(listener: &std::net::TcpListener) -> RawHandle {
    use std::os::windows::io::AsRawSocket;
    listener.as_raw_socket()
}

/// Write `buf`, then push out as much as the socket takes
///
/// Once `write` has accepted bytes they are owned by the TLS session; a
/// flush that would block leaves them buffered for the next read or write.
fn write_accepted<W: Write>(stream: &mut W, buf: &[u8]) -> io::Result<usize> {
    let n = stream.write(buf)?;
    match stream.flush() {
        Ok(()) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            trace!(bytes = n, "TLS flush deferred");
            Ok(n)
        }
        Err(e) if n > 0 => {
            debug!(error = %e, "TLS flush failed after write");
            Ok(n)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn listening() -> (TcpListener, u16) {
        let mut listener = TcpListener::new();
        listener.listen(0).unwrap();
        let port = listener.local_port().unwrap();
        (listener, port)
    }

    fn accept_blocking(listener: &mut TcpListener) -> TcpSocket {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(socket) = listener.accept() {
                return socket;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Takes every write but cannot flush
    struct BlockedFlush {
        accepted: Vec<u8>,
    }

    impl Write for BlockedFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.accepted.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_blocked_flush_keeps_accepted_bytes() {
        let mut stream = BlockedFlush {
            accepted: Vec::new(),
        };
        assert_eq!(write_accepted(&mut stream, b"frame-one").unwrap(), 9);
        assert_eq!(write_accepted(&mut stream, b"frame-two").unwrap(), 9);
        assert_eq!(stream.accepted, b"frame-oneframe-two");
    }

    #[test]
    fn test_listen_and_accept() {
        let (mut listener, port) = listening();
        assert!(listener.is_listening());
        assert!(listener.accept().is_none());

        let mut client = TcpSocket::tcp();
        client.connect(&Address::resolve("127.0.0.1"), port).unwrap();
        assert_eq!(client.state(), SocketState::Connected);

        let mut server = accept_blocking(&mut listener);
        assert!(server.peer_addr().is_some());

        client.send_packet(b"over tcp").unwrap();
        server.set_blocking(true);
        server.set_timeout(2000);
        let mut packet = None;
        for _ in 0..100 {
            packet = server.receive_packet();
            if packet.is_some() {
                break;
            }
        }
        assert_eq!(packet.as_deref(), Some(&b"over tcp"[..]));
    }

    #[test]
    fn test_accept_into_replaces_connection() {
        let (mut listener, port) = listening();
        let address = Address::resolve("127.0.0.1");

        let mut first = TcpSocket::tcp();
        first.connect(&address, port).unwrap();
        let mut accepted = accept_blocking(&mut listener);

        let mut second = TcpSocket::tcp();
        second.connect(&address, port).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !listener.accept_into(&mut accepted) {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            accepted.peer_addr().map(|a| a.port()),
            second.transport().local_addr().map(|a| a.port())
        );

        // The first connection was closed by the replacement
        first.set_timeout(2000);
        let mut buf = [0u8; 4];
        assert_eq!(first.receive(&mut buf), 0);
        assert_eq!(first.state(), SocketState::Closed);
    }

    #[test]
    fn test_connect_refused() {
        let (mut listener, port) = listening();
        listener.close();
        assert!(!listener.is_listening());
        assert!(listener.accept().is_none());

        let mut client = TcpSocket::tcp();
        let result = client.connect(&Address::resolve("127.0.0.1"), port);
        assert!(result.is_err());
        assert_eq!(client.state(), SocketState::Closed);
    }

    #[test]
    fn test_connect_empty_address() {
        let mut client = TcpSocket::tcp();
        assert!(matches!(
            client.connect(&Address::default(), 80),
            Err(NetworkError::Unresolved(_))
        ));
    }

    #[test]
    fn test_non_blocking_connect() {
        let (mut listener, port) = listening();
        let mut client = TcpSocket::tcp();
        client.set_blocking(false);
        client.connect(&Address::resolve("127.0.0.1"), port).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.state() == SocketState::Connecting {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.state(), SocketState::Connected);
        accept_blocking(&mut listener);
    }

    #[test]
    fn test_listen_port_in_use() {
        let (_listener, port) = listening();
        let mut second = TcpListener::new();
        if second.listen(port).is_err() {
            assert!(!second.is_listening());
            second.listen(0).unwrap();
            assert!(second.is_listening());
        }
    }
}
