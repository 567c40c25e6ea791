//! Readiness polling
//!
//! [`Selector`] keeps a flat list of registered handles and asks the OS which
//! of them are readable with `poll` (unix) or `WSAPoll` (windows). Hang-ups and
//! errors are reported as readable so that the next read observes the close.

use std::io;
use std::time::Duration;

use tracing::trace;

use super::transport::RawHandle;

/// Anything with an OS handle that can be registered with a [`Selector`]
pub trait Pollable {
    /// OS handle, or `None` when the object is closed or has no handle
    fn poll_handle(&self) -> Option<RawHandle>;
}

impl Pollable for RawHandle {
    fn poll_handle(&self) -> Option<RawHandle> {
        Some(*self)
    }
}

#[cfg(unix)]
mod sys {
    use std::io;

    use super::RawHandle;

    pub type PollFd = libc::pollfd;

    pub fn entry(handle: RawHandle) -> PollFd {
        libc::pollfd {
            fd: handle,
            events: libc::POLLIN,
            revents: 0,
        }
    }

    pub fn handle(entry: &PollFd) -> RawHandle {
        entry.fd
    }

    pub fn is_readable(entry: &PollFd) -> bool {
        entry.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    }

    pub fn poll(entries: &mut [PollFd], timeout_ms: i32) -> io::Result<usize> {
        // SAFETY: `entries` is a valid, exclusively borrowed pollfd array.
        let rc = unsafe {
            libc::poll(
                entries.as_mut_ptr(),
                entries.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::io;

    use windows_sys::Win32::Networking::WinSock::{
        POLLERR, POLLHUP, POLLIN, SOCKET, SOCKET_ERROR, WSAPOLLFD, WSAPoll,
    };

    use super::RawHandle;

    pub type PollFd = WSAPOLLFD;

    pub fn entry(handle: RawHandle) -> PollFd {
        WSAPOLLFD {
            fd: handle as SOCKET,
            events: POLLIN,
            revents: 0,
        }
    }

    pub fn handle(entry: &PollFd) -> RawHandle {
        entry.fd as RawHandle
    }

    pub fn is_readable(entry: &PollFd) -> bool {
        (entry.revents as i32 & (POLLIN | POLLERR | POLLHUP) as i32) != 0
    }

    pub fn poll(entries: &mut [PollFd], timeout_ms: i32) -> io::Result<usize> {
        // SAFETY: `entries` is a valid, exclusively borrowed WSAPOLLFD array.
        let rc = unsafe { WSAPoll(entries.as_mut_ptr(), entries.len() as u32, timeout_ms) };
        if rc == SOCKET_ERROR {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

/// Set of handles polled together for read readiness
pub struct Selector {
    entries: Vec<sys::PollFd>,
}

impl Selector {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a handle; registering twice is a no-op
    pub fn add<P: Pollable + ?Sized>(&mut self, socket: &P) {
        let Some(handle) = socket.poll_handle() else {
            return;
        };
        if self.position(handle).is_none() {
            self.entries.push(sys::entry(handle));
        }
    }

    /// Unregister a handle; removing an unknown handle is a no-op
    pub fn remove<P: Pollable + ?Sized>(&mut self, socket: &P) {
        if let Some(handle) = socket.poll_handle() {
            self.remove_handle(handle);
        }
    }

    /// Unregister by raw handle (for sockets that have already been closed)
    pub fn remove_handle(&mut self, handle: RawHandle) {
        if let Some(index) = self.position(handle) {
            self.entries.swap_remove(index);
        }
    }

    /// Drop every registration
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block until a registered handle is readable or `timeout` elapses
    ///
    /// Returns the number of ready handles. With nothing registered this just
    /// sleeps for `timeout`.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        for entry in &mut self.entries {
            entry.revents = 0;
        }

        if self.entries.is_empty() {
            std::thread::sleep(timeout);
            return Ok(0);
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        match sys::poll(&mut self.entries, timeout_ms) {
            Ok(ready) => {
                trace!(ready, registered = self.entries.len(), "Selector woke");
                Ok(ready)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Whether the last [`wait`](Self::wait) saw `socket` readable
    pub fn is_ready<P: Pollable + ?Sized>(&self, socket: &P) -> bool {
        socket
            .poll_handle()
            .and_then(|handle| self.position(handle))
            .map(|index| sys::is_readable(&self.entries[index]))
            .unwrap_or(false)
    }

    fn position(&self, handle: RawHandle) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| sys::handle(entry) == handle)
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("registered", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    #[cfg(unix)]
    fn handle_of(stream: &TcpStream) -> RawHandle {
        use std::os::fd::AsRawFd;
        stream.as_raw_fd()
    }

    #[cfg(windows)]
    fn handle_of(stream: &TcpStream) -> RawHandle {
        use std::os::windows::io::AsRawSocket;
        stream.as_raw_socket()
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_add_remove_idempotent() {
        let (client, _server) = pair();
        let handle = handle_of(&client);
        let mut selector = Selector::new();

        selector.add(&handle);
        selector.add(&handle);
        assert_eq!(selector.len(), 1);

        selector.remove(&handle);
        selector.remove(&handle);
        assert!(selector.is_empty());
    }

    #[test]
    fn test_wait_reports_readable() {
        let (client, mut server) = pair();
        let handle = handle_of(&client);
        let mut selector = Selector::new();
        selector.add(&handle);

        selector.wait(Duration::from_millis(10)).unwrap();
        assert!(!selector.is_ready(&handle));

        server.write_all(b"hi").unwrap();
        let ready = selector.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(ready, 1);
        assert!(selector.is_ready(&handle));
    }

    #[test]
    fn test_hangup_surfaces_as_readable() {
        let (client, server) = pair();
        let handle = handle_of(&client);
        let mut selector = Selector::new();
        selector.add(&handle);

        drop(server);
        selector.wait(Duration::from_secs(2)).unwrap();
        assert!(selector.is_ready(&handle));
    }

    #[test]
    fn test_empty_wait_sleeps() {
        let mut selector = Selector::new();
        let start = Instant::now();
        assert_eq!(selector.wait(Duration::from_millis(20)).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_unregistered_not_ready() {
        let (client, _server) = pair();
        let selector = Selector::new();
        assert!(!selector.is_ready(&handle_of(&client)));
    }
}
