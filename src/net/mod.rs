//! Networking module
//!
//! Transport-level building blocks shared by the server and the clients:
//! - Address resolution and local interface listing
//! - Readiness polling over socket handles
//! - The `Transport` abstraction with TCP and in-process implementations
//! - UDP datagrams with unicast, broadcast and multicast delivery
//! - Length-prefixed packet framing with an outbound send queue

pub mod address;
pub mod memory;
pub mod selector;
pub mod stream;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use address::{AddrInfo, Address, AddressFamily};
pub use memory::MemoryTransport;
pub use selector::{Pollable, Selector};
pub use stream::{StreamSocket, MAX_PACKET_SIZE};
pub use tcp::{TcpListener, TcpSocket, TcpTransport};
pub use transport::{RawHandle, SocketState, Transport};
pub use udp::{multicast_group, UdpSocket};
