//! In-process transport
//!
//! A [`MemoryTransport`] pair behaves like a connected non-blocking socket
//! pair: bounded buffers, would-block when full or empty, and end-of-stream
//! once the peer has closed and its data has been drained. Chunk limits on
//! each end force reads and writes to fragment, which makes it a good stand-in
//! for message-oriented peer-to-peer links in tests.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;

use super::transport::{SocketState, Transport};

/// Default buffer capacity per direction (256 KiB)
pub const DEFAULT_CAPACITY: usize = 256 * 1024;

/// One direction of a pair
#[derive(Debug)]
struct Pipe {
    buffer: BytesMut,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            buffer: BytesMut::new(),
            capacity,
            writer_closed: false,
            reader_closed: false,
        }))
    }
}

/// One end of an in-process byte stream
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
    closed: bool,
    max_write_chunk: usize,
    max_read_chunk: usize,
}

impl MemoryTransport {
    /// Create a connected pair with the default capacity
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a connected pair whose buffers hold at most `capacity` bytes
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let a_to_b = Pipe::new(capacity);
        let b_to_a = Pipe::new(capacity);
        (
            Self::new(b_to_a.clone(), a_to_b.clone()),
            Self::new(a_to_b, b_to_a),
        )
    }

    fn new(inbound: Arc<Mutex<Pipe>>, outbound: Arc<Mutex<Pipe>>) -> Self {
        Self {
            inbound,
            outbound,
            closed: false,
            max_write_chunk: usize::MAX,
            max_read_chunk: usize::MAX,
        }
    }

    /// Limit how many bytes a single `write` accepts
    pub fn set_max_write_chunk(&mut self, max: usize) {
        self.max_write_chunk = max.max(1);
    }

    /// Limit how many bytes a single `read` returns
    pub fn set_max_read_chunk(&mut self, max: usize) {
        self.max_read_chunk = max.max(1);
    }

    /// Bytes waiting to be read on this end
    pub fn pending(&self) -> usize {
        self.inbound.lock().buffer.len()
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut pipe = self.inbound.lock();
        if pipe.buffer.is_empty() {
            return if pipe.writer_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let n = buf.len().min(pipe.buffer.len()).min(self.max_read_chunk);
        buf[..n].copy_from_slice(&pipe.buffer[..n]);
        pipe.buffer.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut pipe = self.outbound.lock();
        if pipe.reader_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let space = pipe.capacity.saturating_sub(pipe.buffer.len());
        if space == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(space).min(self.max_write_chunk);
        pipe.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn state(&mut self) -> SocketState {
        if self.closed {
            SocketState::Closed
        } else {
            SocketState::Connected
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outbound.lock().writer_closed = true;
        let mut inbound = self.inbound.lock();
        inbound.reader_closed = true;
        inbound.buffer.clear();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
