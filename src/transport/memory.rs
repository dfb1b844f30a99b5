//! In-process transport
//!
//! [`MemoryConnector`] hands out channel-backed transports and gives the
//! daemon side of each one to the caller as a [`MemoryPeer`]. Opens can be
//! scripted to fail, which makes reconnect behavior observable without
//! sockets.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Connector, FrameTransport};
use crate::error::EclaError;
use crate::packet::{self, Decoded, Packet, RegisterPacket, RegisteredPacket};

/// Unit exchanged over a memory transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryFrame {
    Text(String),
    /// Close control frame
    Close,
}

#[derive(Debug)]
struct ConnectorState {
    failures_remaining: usize,
    attempts: usize,
    addresses: Vec<String>,
    echo_close: bool,
}

/// Connector producing in-memory transports
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    /// Create a connector and the stream of daemon-side peers it produces,
    /// one per successful open
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(Mutex::new(ConnectorState {
                failures_remaining: 0,
                attempts: 0,
                addresses: Vec::new(),
                echo_close: true,
            })),
            peers_tx,
        };
        (connector, peers_rx)
    }

    /// Whether transports answer their own close frame immediately.
    /// When disabled a closed transport keeps blocking in `read_frame`
    /// until the peer closes or goes away.
    pub fn with_close_echo(self, enabled: bool) -> Self {
        self.state.lock().echo_close = enabled;
        self
    }

    /// Make the next `count` opens fail
    pub fn fail_next(&self, count: usize) {
        self.state.lock().failures_remaining = count;
    }

    /// Number of open attempts so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Addresses passed to `open`, in order
    pub fn dialed_addresses(&self) -> Vec<String> {
        self.state.lock().addresses.clone()
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, addr: &str) -> Result<Box<dyn FrameTransport>, EclaError> {
        let echo_close = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.addresses.push(addr.to_string());
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(EclaError::transport_open(addr, "connection refused"));
            }
            state.echo_close
        };

        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_adapter_tx, to_adapter_rx) = mpsc::unbounded_channel();

        let _ = self.peers_tx.send(MemoryPeer {
            inbound: to_peer_rx,
            outbound: to_adapter_tx,
        });

        Ok(Box::new(MemoryTransport {
            inbound: to_adapter_rx,
            outbound: to_peer_tx,
            echo_close,
            closed: false,
        }))
    }
}

/// Adapter side of a memory transport
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<MemoryFrame>,
    outbound: mpsc::UnboundedSender<MemoryFrame>,
    echo_close: bool,
    closed: bool,
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn read_frame(&mut self) -> Result<String, EclaError> {
        if self.closed {
            return Err(EclaError::frame_read("transport closed"));
        }

        match self.inbound.recv().await {
            Some(MemoryFrame::Text(text)) => Ok(text),
            Some(MemoryFrame::Close) => {
                self.closed = true;
                Err(EclaError::frame_read("closed by peer"))
            }
            None => Err(EclaError::frame_read("peer went away")),
        }
    }

    async fn write_frame(&mut self, frame: String) -> Result<(), EclaError> {
        if self.closed {
            return Err(EclaError::frame_write("transport closed"));
        }

        self.outbound
            .send(MemoryFrame::Text(frame))
            .map_err(|_| EclaError::frame_write("peer went away"))
    }

    async fn close(&mut self) -> Result<(), EclaError> {
        let sent = self.outbound.send(MemoryFrame::Close);
        if self.echo_close {
            self.closed = true;
        }
        sent.map_err(|_| EclaError::frame_write("peer went away"))
    }
}

/// Daemon side of a memory transport
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<MemoryFrame>,
    outbound: mpsc::UnboundedSender<MemoryFrame>,
}

impl MemoryPeer {
    /// Send a packet to the adapter
    pub fn send(&self, packet: &Packet) -> Result<(), EclaError> {
        self.send_raw(packet::encode(packet)?)
    }

    /// Send an arbitrary text frame to the adapter
    pub fn send_raw(&self, frame: impl Into<String>) -> Result<(), EclaError> {
        self.outbound
            .send(MemoryFrame::Text(frame.into()))
            .map_err(|_| EclaError::frame_write("adapter went away"))
    }

    /// Send a close control frame to the adapter
    pub fn close(&self) {
        let _ = self.outbound.send(MemoryFrame::Close);
    }

    /// Next frame written by the adapter; `None` once the adapter side is gone
    pub async fn recv(&mut self) -> Option<MemoryFrame> {
        self.inbound.recv().await
    }

    /// Frame already written by the adapter, without waiting
    pub fn try_recv(&mut self) -> Option<MemoryFrame> {
        self.inbound.try_recv().ok()
    }

    /// Next decodable packet written by the adapter; `None` on close
    pub async fn recv_packet(&mut self) -> Option<Packet> {
        loop {
            match self.recv().await? {
                MemoryFrame::Text(text) => {
                    if let Ok(Decoded::Packet(packet)) = packet::decode(&text) {
                        return Some(packet);
                    }
                }
                MemoryFrame::Close => return None,
            }
        }
    }

    /// Wait for the adapter's `RegisterPacket` and acknowledge it
    pub async fn accept_registration(
        &mut self,
        registered: RegisteredPacket,
    ) -> Option<RegisterPacket> {
        loop {
            if let Packet::Register(register) = self.recv_packet().await? {
                self.send(&Packet::Registered(registered)).ok()?;
                return Some(register);
            }
        }
    }
}

impl std::fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer").finish_non_exhaustive()
    }
}
