//! HTTP and WebSocket endpoints
//!
//! - `server` - embeddable server with a background I/O thread and
//!   frame-driven handler dispatch
//! - `request` - synchronous HTTP client
//! - `websocket` - synchronous WebSocket client

mod connection;
pub mod handler;
pub mod registry;
pub mod request;
pub mod server;
pub mod websocket;
mod worker;

pub use connection::STATIC_CHUNK_SIZE;
pub use handler::{Reply, WebsocketConnection, WebsocketHandler};
pub use registry::{ConnectionId, ConnectionState};
pub use request::{HttpClient, Scheme};
pub use server::{Server, ServerHandle};
pub use websocket::{WebsocketClient, WebsocketState};
