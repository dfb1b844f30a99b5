//! Framed duplex transports
//!
//! The drive loop only needs four operations from a transport: open (via a
//! [`Connector`]), read one frame, write one frame, and start the close
//! handshake.

use async_trait::async_trait;

use crate::error::EclaError;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryFrame, MemoryPeer};
pub use websocket::{WebSocketConnector, WebSocketTransport, DEFAULT_RESOURCE_PATH};

/// An open, full-duplex text-framed channel
#[async_trait]
pub trait FrameTransport: Send + 'static {
    /// Read the next text frame.
    ///
    /// Must be cancel-safe: the drive loop races it against its command
    /// channel and drops the future when a command wins.
    async fn read_frame(&mut self) -> Result<String, EclaError>;

    /// Write one complete text frame
    async fn write_frame(&mut self, frame: String) -> Result<(), EclaError>;

    /// Send a close control frame. The peer's answer surfaces as a read
    /// failure on a later `read_frame`.
    async fn close(&mut self) -> Result<(), EclaError>;
}

/// Opens transports to a daemon address
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, addr: &str) -> Result<Box<dyn FrameTransport>, EclaError>;
}
