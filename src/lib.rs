//! ecla - external convergence layer adapter client
//!
//! Attaches an external transport module to a DTN bundle-protocol daemon over
//! a persistent WebSocket. The session registers the module, then relays
//! beacons and forwarded bundle payloads between the daemon and the caller,
//! reconnecting according to its configuration.

// Transports
pub mod transport;

// Core types
pub mod packet;
pub mod error;
pub mod command;
pub mod config;
pub mod callbacks;

// Session
mod actor;
pub mod client;

pub use callbacks::{Callbacks, EventSink};
pub use client::{Ecla, EclaBuilder};
pub use command::{ConnectionState, SessionStatus};
pub use config::EclaConfig;
pub use error::EclaError;
pub use packet::{
    BeaconPacket, Decoded, ErrorPacket, ForwardDataPacket, Packet, RegisterPacket, RegisteredPacket,
};
pub use transport::{Connector, FrameTransport, MemoryConnector, MemoryPeer, WebSocketConnector};

pub type Result<T> = std::result::Result<T, EclaError>;
