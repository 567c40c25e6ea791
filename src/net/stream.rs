//! Length-prefixed packet framing over any [`Transport`]
//!
//! Every packet on the wire is a 4-byte little-endian length followed by
//! exactly that many payload bytes. Outbound data that the transport cannot
//! take right away is kept in an ordered send queue; inbound data is
//! reassembled across arbitrarily small reads by an explicit state machine.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use super::selector::Pollable;
use super::transport::{read_once, write_once, IoProgress, RawHandle, SocketState, Transport};
use crate::error::ProtocolError;

/// Size of the packet length header in bytes
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted or sent as a single packet (16 MiB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Inbound packet state
#[derive(Debug)]
enum ReceiveState {
    /// Collecting the length header, possibly across several reads
    AwaitingHeader {
        header: [u8; HEADER_SIZE],
        filled: usize,
    },
    /// Collecting `expected` payload bytes, `received` of which have arrived
    AwaitingBody {
        body: BytesMut,
        expected: usize,
        received: usize,
    },
}

impl ReceiveState {
    fn new() -> Self {
        ReceiveState::AwaitingHeader {
            header: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Result of one step of the receive state machine
enum ReceiveStep {
    Continue,
    Packet(Bytes),
    Pending,
    Closed,
    TooLarge(usize),
}

/// Packet-framing socket generic over its raw transport
pub struct StreamSocket<T: Transport> {
    transport: T,
    send_queue: BytesMut,
    receive_state: ReceiveState,
}

impl<T: Transport> StreamSocket<T> {
    /// Wrap a transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            send_queue: BytesMut::new(),
            receive_state: ReceiveState::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Replace the transport, discarding all queued and partial data
    pub fn replace_transport(&mut self, transport: T) {
        self.transport.close();
        self.transport = transport;
        self.reset();
    }

    /// Current connection state of the transport
    pub fn state(&mut self) -> SocketState {
        self.transport.state()
    }

    pub fn is_connected(&mut self) -> bool {
        self.state() == SocketState::Connected
    }

    /// Close the transport and drop all queued and partially received data
    pub fn close(&mut self) {
        self.transport.close();
        self.reset();
    }

    /// Bytes waiting in the send queue
    pub fn queued_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Write raw bytes now, queueing whatever the transport does not accept
    ///
    /// When data is already queued the new bytes go behind it so ordering is
    /// preserved.
    pub fn send(&mut self, data: &[u8]) {
        match self.transport.state() {
            SocketState::Closed => return,
            SocketState::Connecting => {
                self.send_queue.extend_from_slice(data);
                return;
            }
            SocketState::Connected => {}
        }

        if !self.send_queue.is_empty() {
            self.send_queue.extend_from_slice(data);
            self.send_send_queue();
            return;
        }

        let mut offset = 0;
        while offset < data.len() {
            match write_once(&mut self.transport, &data[offset..]) {
                IoProgress::Done(n) => {
                    trace!(bytes = n, "Sent");
                    offset += n;
                }
                IoProgress::Pending => {
                    self.send_queue.extend_from_slice(&data[offset..]);
                    trace!(queued = data.len() - offset, "Transport busy, queued remainder");
                    return;
                }
                IoProgress::Closed => {
                    self.reset();
                    return;
                }
            }
        }
    }

    /// Frame and send one packet
    pub fn send_packet(&mut self, packet: &[u8]) -> Result<(), ProtocolError> {
        let framed = frame_packet(packet)?;
        self.send(&framed);
        Ok(())
    }

    /// Append raw bytes to the send queue without writing
    pub fn queue(&mut self, data: &[u8]) {
        self.send_queue.extend_from_slice(data);
    }

    /// Frame one packet onto the send queue without writing
    pub fn queue_packet(&mut self, packet: &[u8]) -> Result<(), ProtocolError> {
        check_packet_size(packet.len())?;
        self.send_queue.reserve(HEADER_SIZE + packet.len());
        self.send_queue.put_u32_le(packet.len() as u32);
        self.send_queue.extend_from_slice(packet);
        Ok(())
    }

    /// Write as much of the send queue as the transport accepts
    ///
    /// Returns `true` while data remains queued.
    pub fn send_send_queue(&mut self) -> bool {
        if self.send_queue.is_empty() {
            return false;
        }
        if self.transport.state() != SocketState::Connected {
            return !self.send_queue.is_empty();
        }

        while !self.send_queue.is_empty() {
            match write_once(&mut self.transport, &self.send_queue) {
                IoProgress::Done(n) => {
                    trace!(bytes = n, remaining = self.send_queue.len() - n, "Flushed");
                    self.send_queue.advance(n);
                }
                IoProgress::Pending => break,
                IoProgress::Closed => {
                    self.reset();
                    break;
                }
            }
        }
        !self.send_queue.is_empty()
    }

    /// Read raw bytes, flushing the send queue first
    ///
    /// Returns 0 when nothing is available or the transport is closed.
    pub fn receive(&mut self, buf: &mut [u8]) -> usize {
        self.send_send_queue();
        if self.transport.state() != SocketState::Connected {
            return 0;
        }
        match read_once(&mut self.transport, buf) {
            IoProgress::Done(n) => n,
            IoProgress::Pending => 0,
            IoProgress::Closed => {
                self.reset();
                0
            }
        }
    }

    /// Return the next complete packet, if one has fully arrived
    ///
    /// Partial headers and bodies are kept across calls. An oversized length
    /// header closes the socket.
    pub fn receive_packet(&mut self) -> Option<Bytes> {
        self.send_send_queue();
        if self.transport.state() != SocketState::Connected {
            return None;
        }

        loop {
            match self.receive_step() {
                ReceiveStep::Continue => continue,
                ReceiveStep::Packet(packet) => return Some(packet),
                ReceiveStep::Pending => return None,
                ReceiveStep::Closed => {
                    self.reset();
                    return None;
                }
                ReceiveStep::TooLarge(size) => {
                    warn!(
                        size,
                        max = MAX_PACKET_SIZE,
                        "Oversized packet header, closing socket"
                    );
                    self.close();
                    return None;
                }
            }
        }
    }

    fn receive_step(&mut self) -> ReceiveStep {
        match &mut self.receive_state {
            ReceiveState::AwaitingHeader { header, filled } => {
                match read_once(&mut self.transport, &mut header[*filled..]) {
                    IoProgress::Done(n) => *filled += n,
                    IoProgress::Pending => return ReceiveStep::Pending,
                    IoProgress::Closed => return ReceiveStep::Closed,
                }
                if *filled < HEADER_SIZE {
                    return ReceiveStep::Continue;
                }

                let expected = u32::from_le_bytes(*header) as usize;
                if expected > MAX_PACKET_SIZE {
                    return ReceiveStep::TooLarge(expected);
                }
                if expected == 0 {
                    self.receive_state = ReceiveState::new();
                    return ReceiveStep::Packet(Bytes::new());
                }

                self.receive_state = ReceiveState::AwaitingBody {
                    body: BytesMut::zeroed(expected),
                    expected,
                    received: 0,
                };
                ReceiveStep::Continue
            }
            ReceiveState::AwaitingBody {
                body,
                expected,
                received,
            } => {
                match read_once(&mut self.transport, &mut body[*received..]) {
                    IoProgress::Done(n) => *received += n,
                    IoProgress::Pending => return ReceiveStep::Pending,
                    IoProgress::Closed => return ReceiveStep::Closed,
                }
                if *received < *expected {
                    return ReceiveStep::Continue;
                }

                let packet = std::mem::take(body).freeze();
                self.receive_state = ReceiveState::new();
                ReceiveStep::Packet(packet)
            }
        }
    }

    fn reset(&mut self) {
        self.send_queue.clear();
        self.receive_state = ReceiveState::new();
    }
}

impl<T: Transport> io::Read for StreamSocket<T> {
    /// Raw read; would-block and receive timeouts surface as
    /// [`io::ErrorKind::WouldBlock`], a closed transport as `Ok(0)`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.send_send_queue();
        if buf.is_empty() {
            return Ok(0);
        }
        match read_once(&mut self.transport, buf) {
            IoProgress::Done(n) => Ok(n),
            IoProgress::Pending => Err(io::ErrorKind::WouldBlock.into()),
            IoProgress::Closed => {
                self.reset();
                Ok(0)
            }
        }
    }
}

impl<T: Transport> Pollable for StreamSocket<T> {
    fn poll_handle(&self) -> Option<RawHandle> {
        self.transport.poll_handle()
    }
}

impl<T: Transport> std::fmt::Debug for StreamSocket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSocket")
            .field("queued", &self.send_queue.len())
            .field("receive_state", &self.receive_state)
            .finish()
    }
}

fn check_packet_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(())
}

/// Prefix a payload with its length header
pub fn frame_packet(packet: &[u8]) -> Result<Bytes, ProtocolError> {
    check_packet_size(packet.len())?;
    let mut framed = BytesMut::with_capacity(HEADER_SIZE + packet.len());
    framed.put_u32_le(packet.len() as u32);
    framed.extend_from_slice(packet);
    Ok(framed.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::MemoryTransport;
    use pretty_assertions::assert_eq;

    fn socket_pair() -> (StreamSocket<MemoryTransport>, StreamSocket<MemoryTransport>) {
        let (a, b) = MemoryTransport::pair();
        (StreamSocket::new(a), StreamSocket::new(b))
    }

    #[test]
    fn test_packet_round_trip() {
        let (mut a, mut b) = socket_pair();
        a.send_packet(b"hello").unwrap();
        a.send_packet(b"").unwrap();
        a.send_packet(b"world").unwrap();

        assert_eq!(b.receive_packet().as_deref(), Some(&b"hello"[..]));
        assert_eq!(b.receive_packet().as_deref(), Some(&b""[..]));
        assert_eq!(b.receive_packet().as_deref(), Some(&b"world"[..]));
        assert_eq!(b.receive_packet(), None);
    }

    #[test]
    fn test_split_header_is_kept() {
        let (mut a, mut b) = socket_pair();
        let framed = frame_packet(b"abcdef").unwrap();

        a.send(&framed[..2]);
        assert_eq!(b.receive_packet(), None);
        a.send(&framed[2..5]);
        assert_eq!(b.receive_packet(), None);
        a.send(&framed[5..]);
        assert_eq!(b.receive_packet().as_deref(), Some(&b"abcdef"[..]));
    }

    #[test]
    fn test_back_pressure_preserves_order() {
        let (a, b) = MemoryTransport::pair_with_capacity(8);
        let (mut a, mut b) = (StreamSocket::new(a), StreamSocket::new(b));

        a.send_packet(b"first packet").unwrap();
        a.send_packet(b"second").unwrap();
        assert!(a.queued_len() > 0);

        let mut received = Vec::new();
        for _ in 0..100 {
            a.send_send_queue();
            while let Some(packet) = b.receive_packet() {
                received.push(packet);
            }
            if received.len() == 2 {
                break;
            }
        }
        assert_eq!(received, vec![Bytes::from("first packet"), Bytes::from("second")]);
        assert!(!a.send_send_queue());
    }

    #[test]
    fn test_queue_then_flush() {
        let (mut a, mut b) = socket_pair();
        a.queue_packet(b"queued").unwrap();
        a.queue(b"raw");
        assert_eq!(b.receive_packet(), None);

        assert!(!a.send_send_queue());
        assert_eq!(b.receive_packet().as_deref(), Some(&b"queued"[..]));
        let mut buf = [0u8; 8];
        assert_eq!(b.receive(&mut buf), 3);
        assert_eq!(&buf[..3], b"raw");
    }

    #[test]
    fn test_oversized_header_closes() {
        let (mut a, mut b) = socket_pair();
        a.send(&((MAX_PACKET_SIZE as u32) + 1).to_le_bytes());

        assert_eq!(b.receive_packet(), None);
        assert_eq!(b.state(), SocketState::Closed);
    }

    #[test]
    fn test_oversized_send_rejected() {
        let (mut a, _b) = socket_pair();
        let big = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(
            a.send_packet(&big),
            Err(ProtocolError::PacketTooLarge { .. })
        ));
        assert_eq!(a.queued_len(), 0);
    }

    #[test]
    fn test_close_clears_state() {
        let (a, b) = MemoryTransport::pair_with_capacity(4);
        let (mut a, mut b) = (StreamSocket::new(a), StreamSocket::new(b));
        a.send_packet(b"larger than capacity").unwrap();
        assert!(a.queued_len() > 0);

        a.close();
        assert_eq!(a.queued_len(), 0);
        assert_eq!(a.state(), SocketState::Closed);

        // The peer drains what arrived, then sees the close
        assert_eq!(b.receive_packet(), None);
        assert_eq!(b.state(), SocketState::Closed);
    }

    #[test]
    fn test_receive_on_closed_returns_zero() {
        let (mut a, _b) = socket_pair();
        a.close();
        let mut buf = [0u8; 4];
        assert_eq!(a.receive(&mut buf), 0);
        a.send(b"ignored");
        assert_eq!(a.queued_len(), 0);
    }
}
