//! Public session handle
//!
//! ```no_run
//! use ecla::{Ecla, EclaError};
//!
//! # async fn run() -> Result<(), EclaError> {
//! let ecla = Ecla::builder("NATS", true)
//!     .reconnect(true)
//!     .on_beacon(|beacon| println!("beacon from {}", beacon.addr))
//!     .build()?;
//!
//! let driver = ecla.clone();
//! let drive = tokio::spawn(async move { driver.dial("127.0.0.1:3000").await });
//!
//! // ... later
//! ecla.close().await?;
//! # let _ = drive.await;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::{
    actor::DriveLoop,
    callbacks::{Callbacks, EventSink},
    command::{ConnectionState, SessionCommand, SessionStatus},
    config::EclaConfig,
    error::EclaError,
    packet::{self, BeaconPacket, ForwardDataPacket, Packet, RegisteredPacket},
    transport::{Connector, WebSocketConnector},
};

/// Builder for [`Ecla`] sessions
///
/// Everything is fixed at `build`; a running session cannot be reconfigured.
pub struct EclaBuilder {
    config: EclaConfig,
    callbacks: Callbacks,
    sink: Option<Arc<dyn EventSink>>,
    connector: Option<Arc<dyn Connector>>,
}

impl EclaBuilder {
    pub fn new(module_name: impl Into<String>, enable_beacon: bool) -> Self {
        Self {
            config: EclaConfig::new(module_name, enable_beacon),
            callbacks: Callbacks::new(),
            sink: None,
            connector: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EclaConfig) -> Self {
        self.config = config;
        self
    }

    /// Reconnect after the transport drops while connected
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Keep retrying the first open instead of failing `dial`
    pub fn initial_reconnect(mut self, enabled: bool) -> Self {
        self.config.initial_reconnect = enabled;
        self
    }

    /// Reconnect when the transport drops before registration completes
    pub fn retry_registration(mut self, enabled: bool) -> Self {
        self.config.retry_registration = enabled;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    pub fn on_registered<F>(mut self, handler: F) -> Self
    where
        F: Fn(RegisteredPacket) + Send + Sync + 'static,
    {
        self.callbacks.on_registered = Some(Arc::new(handler));
        self
    }

    pub fn on_beacon<F>(mut self, handler: F) -> Self
    where
        F: Fn(BeaconPacket) + Send + Sync + 'static,
    {
        self.callbacks.on_beacon = Some(Arc::new(handler));
        self
    }

    pub fn on_forward_data<F>(mut self, handler: F) -> Self
    where
        F: Fn(ForwardDataPacket) + Send + Sync + 'static,
    {
        self.callbacks.on_forward_data = Some(Arc::new(handler));
        self
    }

    /// Identity stamped onto inbound beacons and forward-data packets
    pub fn id_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.callbacks.id_provider = Some(Arc::new(provider));
        self
    }

    /// Use an [`EventSink`] implementation instead of closures
    pub fn event_sink<S: EventSink>(mut self, sink: S) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Transport connector, WebSocket by default
    pub fn connector<C: Connector>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn build(self) -> Result<Ecla, EclaError> {
        self.config.validate()?;

        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => {
                if !self.callbacks.is_empty() {
                    return Err(EclaError::config_error(
                        "event_sink",
                        "closure callbacks and an event sink are mutually exclusive",
                    ));
                }
                sink
            }
            None => Arc::new(self.callbacks),
        };

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));

        Ok(Ecla::from_parts(self.config, sink, connector))
    }
}

struct EclaInner {
    config: Arc<EclaConfig>,
    sink: Arc<dyn EventSink>,
    connector: Arc<dyn Connector>,
    default_id: String,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    /// Taken by the one drive loop this session may ever run
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionCommand>>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
}

/// ECLA client session
///
/// Cheap to clone; all clones share one session. `dial` runs the drive loop
/// on the calling task, so it is usually spawned from a clone while other
/// clones insert packets or close the session.
#[derive(Clone)]
pub struct Ecla {
    inner: Arc<EclaInner>,
}

impl Ecla {
    /// Session with default configuration over WebSocket
    pub fn new(module_name: impl Into<String>, enable_beacon: bool) -> Result<Self, EclaError> {
        Self::builder(module_name, enable_beacon).build()
    }

    pub fn builder(module_name: impl Into<String>, enable_beacon: bool) -> EclaBuilder {
        EclaBuilder::new(module_name, enable_beacon)
    }

    fn from_parts(config: EclaConfig, sink: Arc<dyn EventSink>, connector: Arc<dyn Connector>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SessionStatus::default());

        Self {
            inner: Arc::new(EclaInner {
                config: Arc::new(config),
                sink,
                connector,
                default_id: rand::random::<u64>().to_string(),
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                status_tx: Arc::new(status_tx),
            }),
        }
    }

    /// Connect to the daemon at `addr` (`host:port`) and drive the session.
    ///
    /// Returns `Ok(())` after a graceful close, the daemon's reason when it
    /// rejects the module, or the transport error when the reconnect policy
    /// gives up. Once the first open has succeeded (or is being retried) the
    /// session cannot be dialed again; a dial that failed its first open
    /// leaves the session dialable.
    pub async fn dial(&self, addr: impl Into<String>) -> Result<(), EclaError> {
        let command_rx = self
            .inner
            .command_rx
            .lock()
            .take()
            .ok_or(EclaError::AlreadyDialing)?;

        let finished = DriveLoop::new(
            addr.into(),
            self.inner.config.clone(),
            self.inner.connector.clone(),
            self.inner.sink.clone(),
            self.inner.default_id.clone(),
            command_rx,
            self.inner.status_tx.clone(),
        )
        .run()
        .await;

        if let Some(command_rx) = finished.command_rx {
            *self.inner.command_rx.lock() = Some(command_rx);
        }
        finished.result
    }

    /// Send a beacon to the daemon, best effort
    pub fn insert_beacon(&self, packet: BeaconPacket) {
        self.insert(Packet::Beacon(packet));
    }

    /// Send a bundle payload to the daemon, best effort
    pub fn insert_forward_data(&self, packet: ForwardDataPacket) {
        self.insert(Packet::ForwardData(packet));
    }

    fn insert(&self, packet: Packet) {
        if !self.inner.status_tx.borrow().transport_open {
            tracing::trace!("no transport open, dropping {}", packet.kind());
            return;
        }

        match packet::encode(&packet) {
            Ok(frame) => {
                let _ = self.inner.command_tx.send(SessionCommand::Write(frame));
            }
            Err(e) => tracing::debug!("failed to encode {}: {}", packet.kind(), e),
        }
    }

    /// Close the session gracefully.
    ///
    /// Sends a close frame and waits up to the configured close timeout for
    /// the drive loop to finish. On timeout the loop is left running.
    pub async fn close(&self) -> Result<(), EclaError> {
        if self.inner.command_rx.lock().is_some() {
            tracing::debug!("close on a session that was never dialed");
            return Ok(());
        }

        let _ = self.inner.command_tx.send(SessionCommand::Close);

        let duration = self.inner.config.close_timeout;
        let mut status = self.inner.status_tx.subscribe();
        let finished = tokio::time::timeout(duration, status.wait_for(|s| s.terminated))
            .await
            .is_ok();

        if finished {
            tracing::info!("closed");
            Ok(())
        } else {
            Err(EclaError::CloseTimeout { duration })
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status_tx.borrow().state.clone()
    }

    /// Consistent snapshot of state, transport presence and last error
    pub fn status(&self) -> SessionStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn last_error(&self) -> Option<EclaError> {
        self.inner.status_tx.borrow().last_error.clone()
    }

    /// Receiver notified on every status change
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Random identity used when no id provider is configured
    pub fn local_id(&self) -> &str {
        &self.inner.default_id
    }

    pub fn config(&self) -> &EclaConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Ecla {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecla")
            .field("module_name", &self.inner.config.module_name)
            .field("local_id", &self.inner.default_id)
            .field("state", &self.state())
            .finish()
    }
}
