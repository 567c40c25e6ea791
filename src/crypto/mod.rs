//! Cryptography module
//!
//! Pure codecs used by the WebSocket handshake:
//! - SHA-1 digest for `Sec-WebSocket-Accept`
//! - Base64 for keys and accept values

pub mod base64;
pub mod sha1;

// Re-export commonly used types
pub use sha1::{Digest, Sha1};
