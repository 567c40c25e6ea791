//! UDP datagram socket
//!
//! [`UdpSocket`] is an IPv4 datagram socket with broadcast enabled. It is
//! created lazily on first use, so a socket that only sends never needs
//! [`UdpSocket::bind`]. Multicast groups live in the organization-local
//! `239.192.0.0/16` range and are addressed by a 16-bit group number.
//!
//! Packet variants carry the same 4-byte length header as the stream framing,
//! so a datagram cut short by a small receive buffer is detected and dropped.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, Bytes};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, trace, warn};

use super::address::Address;
use super::selector::Pollable;
use super::stream::{frame_packet, HEADER_SIZE};
use super::transport::RawHandle;
use crate::error::{NetworkError, ProtocolError};

/// Receive buffer used by [`UdpSocket::receive_packet_from`]
pub const PACKET_RECEIVE_SIZE: usize = 4096;

/// IPv4 multicast address for a group number
pub fn multicast_group(group: u16) -> Ipv4Addr {
    let [high, low] = group.to_be_bytes();
    Ipv4Addr::new(239, 192, high, low)
}

/// Connectionless datagram socket
pub struct UdpSocket {
    inner: Option<std::net::UdpSocket>,
    blocking: bool,
    timeout: Option<Duration>,
}

impl UdpSocket {
    /// Create a blocking socket with no OS handle yet
    pub fn new() -> Self {
        Self {
            inner: None,
            blocking: true,
            timeout: None,
        }
    }

    /// Bind to `port` on every interface; 0 picks an ephemeral port
    pub fn bind(&mut self, port: u16) -> Result<(), NetworkError> {
        self.close();
        let socket = create_socket().map_err(|e| NetworkError::Bind {
            port,
            reason: e.to_string(),
        })?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        if let Err(e) = socket.bind(&addr.into()) {
            return Err(NetworkError::Bind {
                port,
                reason: e.to_string(),
            });
        }

        self.inner = Some(socket.into());
        self.apply_options();
        debug!(port = self.local_port().unwrap_or(port), "UDP socket bound");
        Ok(())
    }

    /// Port the socket is bound to, once it has one
    pub fn local_port(&self) -> Option<u16> {
        self.inner.as_ref()?.local_addr().ok().map(|addr| addr.port())
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
        self.apply_options();
    }

    /// Receive timeout for blocking mode; `None` waits forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self.apply_options();
    }

    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            trace!("UDP socket closed");
        }
    }

    /// Send one datagram to the first IPv4 endpoint of `address`
    ///
    /// Returns `false` if `address` has no IPv4 endpoint or the datagram was
    /// not sent whole.
    pub fn send_to(&mut self, data: &[u8], address: &Address, port: u16) -> bool {
        let Some(ip) = address.iter().find_map(|entry| match entry.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }) else {
            debug!(port, "No IPv4 endpoint to send to");
            return false;
        };
        self.send_raw(data, SocketAddr::from((ip, port)))
    }

    /// Receive one datagram into `buf`
    ///
    /// Returns the byte count with the sender's address and port, or `None`
    /// when nothing is pending (non-blocking), the timeout expired, or the
    /// socket is closed. A datagram larger than `buf` is truncated.
    pub fn receive_from(&mut self, buf: &mut [u8]) -> Option<(usize, Address, u16)> {
        let socket = self.inner.as_ref()?;
        match socket.recv_from(buf) {
            Ok((n, from)) => {
                trace!(peer = %from, bytes = n, "Datagram received");
                Some((n, Address::from_ips([from.ip()]), from.port()))
            }
            Err(e) if is_transient(&e) => None,
            Err(e) => {
                debug!(error = %e, "UDP receive failed");
                None
            }
        }
    }

    /// Send `packet` with a length header as one datagram
    pub fn send_packet_to(
        &mut self,
        packet: &[u8],
        address: &Address,
        port: u16,
    ) -> Result<bool, ProtocolError> {
        let framed = frame_packet(packet)?;
        Ok(self.send_to(&framed, address, port))
    }

    /// Receive one length-prefixed packet
    ///
    /// Datagrams whose header disagrees with their size are dropped.
    pub fn receive_packet_from(&mut self) -> Option<(Bytes, Address, u16)> {
        let mut buf = vec![0u8; PACKET_RECEIVE_SIZE];
        let (n, address, port) = self.receive_from(&mut buf)?;
        buf.truncate(n);

        let mut datagram = Bytes::from(buf);
        if datagram.len() < HEADER_SIZE {
            debug!(peer_port = port, bytes = n, "Datagram shorter than packet header");
            return None;
        }
        let size = datagram.get_u32_le() as usize;
        if size != datagram.len() {
            debug!(
                peer_port = port,
                declared = size,
                actual = datagram.len(),
                "Datagram does not match packet header"
            );
            return None;
        }
        Some((datagram, address, port))
    }

    /// Join multicast `group` on every local IPv4 interface
    ///
    /// Falls back to the default interface when no IPv4 interface is up.
    /// Returns `false` if any join failed.
    pub fn join_multicast(&mut self, group: u16) -> bool {
        let multiaddr = multicast_group(group);
        let Some(socket) = self.socket() else {
            return false;
        };

        let mut interfaces = local_ipv4_interfaces();
        if interfaces.is_empty() {
            interfaces.push(Ipv4Addr::UNSPECIFIED);
        }

        let mut success = true;
        for interface in interfaces {
            if let Err(e) = socket.join_multicast_v4(&multiaddr, &interface) {
                warn!(
                    group = %multiaddr,
                    interface = %interface,
                    error = %e,
                    "Multicast join failed"
                );
                success = false;
            }
        }
        success
    }

    /// Send `data` to multicast `group` out of every local IPv4 interface
    ///
    /// Returns `true` if the datagram left on at least one interface.
    pub fn send_multicast(&mut self, data: &[u8], group: u16, port: u16) -> bool {
        let target = SocketAddr::from((multicast_group(group), port));
        let Some(socket) = self.socket() else {
            return false;
        };

        let mut interfaces = local_ipv4_interfaces();
        if interfaces.is_empty() {
            interfaces.push(Ipv4Addr::UNSPECIFIED);
        }

        let mut success = false;
        for interface in interfaces {
            if let Err(e) = SockRef::from(socket).set_multicast_if_v4(&interface) {
                debug!(
                    interface = %interface,
                    error = %e,
                    "Failed to select multicast interface"
                );
                continue;
            }
            success |= send_whole(socket, data, target);
        }
        success
    }

    /// Send `packet` with a length header to multicast `group`
    pub fn send_multicast_packet(
        &mut self,
        packet: &[u8],
        group: u16,
        port: u16,
    ) -> Result<bool, ProtocolError> {
        let framed = frame_packet(packet)?;
        Ok(self.send_multicast(&framed, group, port))
    }

    /// Send `data` to the IPv4 limited broadcast address
    pub fn send_broadcast(&mut self, data: &[u8], port: u16) -> bool {
        self.send_raw(data, SocketAddr::from((Ipv4Addr::BROADCAST, port)))
    }

    fn send_raw(&mut self, data: &[u8], target: SocketAddr) -> bool {
        match self.socket() {
            Some(socket) => send_whole(socket, data, target),
            None => false,
        }
    }

    /// The OS socket, created unbound on first use
    fn socket(&mut self) -> Option<&std::net::UdpSocket> {
        if self.inner.is_none() {
            match create_socket() {
                Ok(socket) => {
                    self.inner = Some(socket.into());
                    self.apply_options();
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create UDP socket");
                    return None;
                }
            }
        }
        self.inner.as_ref()
    }

    fn apply_options(&self) {
        let Some(socket) = self.inner.as_ref() else {
            return;
        };
        let results = [
            socket.set_nonblocking(!self.blocking),
            socket.set_read_timeout(self.timeout),
        ];
        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "Failed to apply socket option");
            }
        }
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Pollable for UdpSocket {
    fn poll_handle(&self) -> Option<RawHandle> {
        self.inner.as_ref().map(raw_udp_handle)
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("port", &self.local_port())
            .field("blocking", &self.blocking)
            .finish()
    }
}

fn create_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

fn send_whole(socket: &std::net::UdpSocket, data: &[u8], target: SocketAddr) -> bool {
    match socket.send_to(data, target) {
        Ok(n) if n == data.len() => {
            trace!(peer = %target, bytes = n, "Datagram sent");
            true
        }
        Ok(n) => {
            debug!(peer = %target, sent = n, bytes = data.len(), "Datagram truncated");
            false
        }
        Err(e) => {
            debug!(peer = %target, error = %e, "UDP send failed");
            false
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn local_ipv4_interfaces() -> Vec<Ipv4Addr> {
    Address::local_addresses()
        .iter()
        .filter_map(|entry| match entry.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect()
}

#[cfg(unix)]
fn raw_udp_handle(socket: &std::net::UdpSocket) -> RawHandle {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_udp_handle(socket: &std::net::UdpSocket) -> RawHandle {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket()
}
