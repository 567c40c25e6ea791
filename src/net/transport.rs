//! Transport abstraction module
//!
//! Provides a unified interface over raw byte transports (TCP sockets, TLS
//! client streams and in-process pipes), so that packet framing and the HTTP /
//! WebSocket protocol code can run over any of them.

use std::io;

/// Raw OS handle used for readiness polling
#[cfg(unix)]
pub type RawHandle = std::os::fd::RawFd;

/// Raw OS handle used for readiness polling
#[cfg(windows)]
pub type RawHandle = std::os::windows::io::RawSocket;

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    /// No connection (never connected, closed locally, or reset by the peer)
    Closed,
    /// A non-blocking connect is still in progress
    Connecting,
    /// Ready for reads and writes
    Connected,
}

impl SocketState {
    /// Get a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            SocketState::Closed => "Closed",
            SocketState::Connecting => "Connecting",
            SocketState::Connected => "Connected",
        }
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transport trait for abstracting over byte-stream connections
///
/// `read` returning `Ok(0)` for a non-empty buffer means the peer closed the
/// stream. Transports in non-blocking mode report "no progress possible right
/// now" as [`io::ErrorKind::WouldBlock`].
pub trait Transport: Send {
    /// Read available bytes into `buf`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the transport accepts
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Current connection state
    fn state(&mut self) -> SocketState;

    /// Close the transport; idempotent
    fn close(&mut self);

    /// OS handle for readiness polling, if the transport has one
    fn poll_handle(&self) -> Option<RawHandle> {
        None
    }
}

/// Outcome of a single raw read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoProgress {
    /// This many bytes were moved
    Done(usize),
    /// Nothing could be moved without blocking (or a receive timeout expired)
    Pending,
    /// The transport is gone; the caller must reset its state
    Closed,
}

/// Classify errors that only mean "try again later"
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Read once from a transport, closing it on fatal errors or end of stream
pub(crate) fn read_once<T: Transport + ?Sized>(transport: &mut T, buf: &mut [u8]) -> IoProgress {
    if buf.is_empty() {
        return IoProgress::Done(0);
    }
    match transport.read(buf) {
        Ok(0) => {
            transport.close();
            IoProgress::Closed
        }
        Ok(n) => IoProgress::Done(n),
        Err(e) if is_transient(&e) => IoProgress::Pending,
        Err(e) => {
            tracing::debug!(error = %e, "Transport read failed, closing");
            transport.close();
            IoProgress::Closed
        }
    }
}

/// Write once to a transport, closing it on fatal errors
pub(crate) fn write_once<T: Transport + ?Sized>(transport: &mut T, buf: &[u8]) -> IoProgress {
    if buf.is_empty() {
        return IoProgress::Done(0);
    }
    match transport.write(buf) {
        Ok(0) => IoProgress::Pending,
        Ok(n) => IoProgress::Done(n),
        Err(e) if is_transient(&e) => IoProgress::Pending,
        Err(e) => {
            tracing::debug!(error = %e, "Transport write failed, closing");
            transport.close();
            IoProgress::Closed
        }
    }
}
