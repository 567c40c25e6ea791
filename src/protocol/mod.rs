//! Protocol module
//!
//! Pure wire-format code with no I/O of its own:
//! - HTTP/1.1 request and response parsing, chunked transfer-encoding
//! - WebSocket frame encoding, decoding and message reassembly
//! - WebSocket opening handshake (both sides) and URL parsing

pub mod handshake;
pub mod http;
pub mod websocket;

pub use handshake::{compute_accept_key, WsUrl};
pub use http::{Request, Response};
pub use websocket::{Frame, Message, Opcode, Role};
