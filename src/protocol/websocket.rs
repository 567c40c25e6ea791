//! WebSocket frame codec (RFC 6455)
//!
//! Frames are decoded from the front of a receive buffer and encoded into
//! contiguous byte strings. Client-to-server frames must be masked and
//! server-to-client frames must not be; the decoding [`Role`] enforces this.
//! Fragmented data frames are stitched back together by [`MessageAssembler`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest payload (or reassembled message) accepted by default (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;
const LENGTH_16BIT: u8 = 126;
const LENGTH_64BIT: u8 = 127;

/// WebSocket frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Convert the low nibble of a frame's first byte
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ProtocolError::InvalidOpcode(value)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, Ping and Pong
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Continuation => "Continuation",
            Self::Text => "Text",
            Self::Binary => "Binary",
            Self::Close => "Close",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:x})", self.name(), self.as_u8())
    }
}

/// Which end of the connection is decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decoding frames sent by a server (must be unmasked)
    Client,
    /// Decoding frames sent by a client (must be masked)
    Server,
}

/// One decoded (and unmasked) frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Close frame, optionally carrying a status code
    pub fn close(code: Option<u16>) -> Self {
        let payload = match code {
            Some(code) => Bytes::copy_from_slice(&code.to_be_bytes()),
            None => Bytes::new(),
        };
        Self::new(Opcode::Close, payload)
    }

    /// Encode this frame, masking the payload when `mask` is given
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Bytes {
        encode_frame(self.fin, self.opcode, &self.payload, mask)
    }
}

/// A complete (possibly reassembled) data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `Text` or `Binary`
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Message {
    pub fn is_text(&self) -> bool {
        self.opcode == Opcode::Text
    }

    /// Payload as UTF-8 text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// XOR `payload` in place with the repeating 4-byte `mask`
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encode a frame header plus payload
///
/// Payload lengths use the 7-bit, 16-bit or 64-bit form as required.
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Bytes {
    let len = payload.len();
    let mut frame = BytesMut::with_capacity(14 + len);

    let mut first = opcode.as_u8();
    if fin {
        first |= FIN_BIT;
    }
    frame.put_u8(first);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len < LENGTH_16BIT as usize {
        frame.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        frame.put_u8(mask_bit | LENGTH_16BIT);
        frame.put_u16(len as u16);
    } else {
        frame.put_u8(mask_bit | LENGTH_64BIT);
        frame.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            frame.put_slice(&key);
            let start = frame.len();
            frame.put_slice(payload);
            apply_mask(&mut frame[start..], key);
        }
        None => frame.put_slice(payload),
    }
    frame.freeze()
}

/// Decode one frame from the front of `buf`
///
/// Returns the unmasked frame and the number of bytes it occupied, or `None`
/// if the frame is not complete yet.
pub fn decode_frame(
    buf: &[u8],
    role: Role,
    max_payload: usize,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (first, second) = (buf[0], buf[1]);

    if first & RSV_BITS != 0 {
        return Err(ProtocolError::ReservedBits);
    }
    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::from_u8(first & OPCODE_MASK)?;

    let masked = second & MASK_BIT != 0;
    match role {
        Role::Server if !masked => return Err(ProtocolError::UnmaskedClientFrame),
        Role::Client if masked => return Err(ProtocolError::MaskedServerFrame),
        _ => {}
    }

    let mut pos = 2;
    let len = match second & LENGTH_MASK {
        LENGTH_16BIT => {
            if buf.len() < pos + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as u64;
            pos += 2;
            len
        }
        LENGTH_64BIT => {
            if buf.len() < pos + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[pos..pos + 8]);
            pos += 8;
            u64::from_be_bytes(raw)
        }
        short => short as u64,
    };

    if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD as u64) {
        return Err(ProtocolError::InvalidControlFrame(opcode.name().to_string()));
    }
    if len > max_payload as u64 {
        return Err(ProtocolError::PacketTooLarge {
            size: usize::try_from(len).unwrap_or(usize::MAX),
            max: max_payload,
        });
    }
    let len = len as usize;

    let mask = if masked {
        if buf.len() < pos + 4 {
            return Ok(None);
        }
        let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < pos + len {
        return Ok(None);
    }
    let mut payload = BytesMut::from(&buf[pos..pos + len]);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        },
        pos + len,
    )))
}

/// Reassembles fragmented data frames into messages
#[derive(Debug)]
pub struct MessageAssembler {
    /// Opcode of the message being assembled, if any
    opcode: Option<Opcode>,
    buffer: BytesMut,
    max_size: usize,
}

impl MessageAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            opcode: None,
            buffer: BytesMut::new(),
            max_size,
        }
    }

    /// Whether a fragmented message is in progress
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Feed a data frame; returns the message once its final fragment arrives
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match (frame.opcode, self.opcode) {
            (Opcode::Continuation, None) => return Err(ProtocolError::UnexpectedContinuation),
            (Opcode::Continuation, Some(_)) => {}
            (Opcode::Text | Opcode::Binary, None) => {
                if frame.fin {
                    return Ok(Some(Message {
                        opcode: frame.opcode,
                        payload: frame.payload,
                    }));
                }
                self.opcode = Some(frame.opcode);
            }
            (Opcode::Text | Opcode::Binary, Some(_)) => {
                self.reset();
                return Err(ProtocolError::UnexpectedContinuation);
            }
            (opcode, _) => return Err(ProtocolError::InvalidOpcode(opcode.as_u8())),
        }

        let size = self.buffer.len() + frame.payload.len();
        if size > self.max_size {
            self.reset();
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: self.max_size,
            });
        }
        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }
        let opcode = self.opcode.take().unwrap_or(Opcode::Binary);
        Ok(Some(Message {
            opcode,
            payload: std::mem::take(&mut self.buffer).freeze(),
        }))
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.opcode = None;
        self.buffer.clear();
    }
}
