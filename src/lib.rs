//! Gamewire Library
//!
//! Network transport and application-protocol stack for embedding an HTTP and
//! WebSocket server, plus matching synchronous clients, inside a game.
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `crypto` - SHA-1 and Base64 for the WebSocket handshake
//! - `error` - Error types and result definitions
//! - `http` - Server, HTTP client and WebSocket client
//! - `net` - Addresses, readiness polling, transports and packet framing
//! - `protocol` - HTTP/1.1 and WebSocket wire formats
//! - `update` - Frame-driven update contract

pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod net;
pub mod protocol;
pub mod update;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{GamewireError, Result};
pub use http::{HttpClient, Reply, Scheme, Server, ServerHandle, WebsocketClient};
pub use update::Updatable;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
