//! Session drive loop
//!
//! One [`DriveLoop`] runs per session. It owns the transport, the connection
//! state and the last error exclusively; handles reach it only through the
//! command channel, and observers only through the published
//! [`SessionStatus`].

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::{
    callbacks::EventSink,
    command::{ConnectionState, SessionCommand, SessionStatus},
    config::EclaConfig,
    error::EclaError,
    packet::{self, Decoded, Packet, RegisterPacket},
    transport::{Connector, FrameTransport},
};

/// What the loop does after a state handler returns
enum Step {
    Continue,
    Exit(Result<(), EclaError>),
}

/// Result of waiting for the next inbound frame
enum Inbound {
    Frame(String),
    ReadFailed(EclaError),
    /// A close was requested and no transport remains to finish it on
    Closed,
}

/// How a drive loop ended
pub(crate) struct Finished {
    pub(crate) result: Result<(), EclaError>,
    /// Returned when the session may be dialed again
    pub(crate) command_rx: Option<mpsc::UnboundedReceiver<SessionCommand>>,
}

/// Connection state machine for one session
pub(crate) struct DriveLoop {
    addr: String,
    config: Arc<EclaConfig>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    default_id: String,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    transport: Option<Box<dyn FrameTransport>>,
    state: ConnectionState,
    last_error: Option<EclaError>,
    closing: bool,
}

impl DriveLoop {
    pub(crate) fn new(
        addr: String,
        config: Arc<EclaConfig>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn EventSink>,
        default_id: String,
        command_rx: mpsc::UnboundedReceiver<SessionCommand>,
        status_tx: Arc<watch::Sender<SessionStatus>>,
    ) -> Self {
        Self {
            addr,
            config,
            connector,
            sink,
            default_id,
            command_rx,
            status_tx,
            transport: None,
            state: ConnectionState::BeforeOpen,
            last_error: None,
            closing: false,
        }
    }

    /// Drive the session until it fails, is closed, or policy gives up
    pub(crate) async fn run(mut self) -> Finished {
        tracing::info!("ECLA module '{}' dialing {}", self.config.module_name, self.addr);

        let result = loop {
            if self.closing && self.transport.is_none() {
                break Ok(());
            }

            let step = match self.state {
                ConnectionState::BeforeOpen => self.open_transport(false).await,
                ConnectionState::Reconnecting => self.open_transport(true).await,
                ConnectionState::AwaitingRegistration => self.await_registration().await,
                ConnectionState::Connected => self.dispatch_next().await,
                ConnectionState::Failed(_) => Step::Exit(Err(self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| EclaError::protocol("session failed")))),
            };

            if let Step::Exit(result) = step {
                break result;
            }
        };

        self.transport = None;

        // a failed first open never started the session
        if result.is_err() && self.state == ConnectionState::BeforeOpen && !self.close_pending() {
            tracing::warn!("ECLA open of {} failed, session can be dialed again", self.addr);
            return Finished {
                result,
                command_rx: Some(self.command_rx),
            };
        }

        self.status_tx.send_modify(|status| {
            status.transport_open = false;
            status.terminated = true;
        });

        match &result {
            Ok(()) => tracing::info!("ECLA drive loop for {} closed", self.addr),
            Err(e) => tracing::warn!("ECLA drive loop for {} ended: {}", self.addr, e),
        }

        Finished {
            result,
            command_rx: None,
        }
    }

    /// Drain queued commands, reporting whether a close was among them
    fn close_pending(&mut self) -> bool {
        let mut close = self.closing;
        while let Ok(command) = self.command_rx.try_recv() {
            close |= matches!(command, SessionCommand::Close);
        }
        close
    }

    /// BeforeOpen and Reconnecting: open, register, or back off
    async fn open_transport(&mut self, reconnecting: bool) -> Step {
        match self.connector.open(&self.addr).await {
            Ok(transport) => {
                self.set_transport(Some(transport));
                self.send_register().await;
                self.transition(ConnectionState::AwaitingRegistration);
                Step::Continue
            }
            Err(e) => {
                self.record_error(e.clone());

                if !reconnecting && !self.config.initial_reconnect {
                    return Step::Exit(Err(e));
                }

                tracing::warn!(
                    "{} unsuccessful ({})... trying again in {:?}",
                    if reconnecting { "reconnecting" } else { "connecting" },
                    e,
                    self.config.backoff
                );

                if self.backoff().await {
                    Step::Continue
                } else {
                    Step::Exit(Ok(()))
                }
            }
        }
    }

    async fn await_registration(&mut self) -> Step {
        let frame = match self.next_inbound().await {
            Inbound::Frame(frame) => frame,
            Inbound::Closed => return Step::Exit(Ok(())),
            Inbound::ReadFailed(e) => {
                return self.on_read_failure(e, self.config.retry_registration);
            }
        };

        match packet::decode(&frame) {
            Ok(Decoded::Packet(Packet::Registered(registered))) => {
                tracing::info!("registered to {}", registered.node_id);
                self.sink.on_registered(registered);
                self.transition(ConnectionState::Connected);
            }
            Ok(Decoded::Packet(Packet::Error(error))) => self.fail(error.reason),
            Ok(Decoded::Packet(other)) => {
                tracing::warn!("wrong packet received before registration ({})", other.kind());
            }
            Ok(Decoded::Unknown(kind)) => {
                tracing::warn!("unknown packet received before registration ({})", kind);
            }
            Err(e) => tracing::warn!("dropping undecodable frame: {}", e),
        }

        Step::Continue
    }

    /// Connected: read and dispatch one frame
    async fn dispatch_next(&mut self) -> Step {
        let frame = match self.next_inbound().await {
            Inbound::Frame(frame) => frame,
            Inbound::Closed => return Step::Exit(Ok(())),
            Inbound::ReadFailed(e) => return self.on_read_failure(e, self.config.reconnect),
        };

        match packet::decode(&frame) {
            Ok(Decoded::Packet(Packet::Error(error))) => self.fail(error.reason),
            Ok(Decoded::Packet(Packet::Beacon(mut beacon))) => {
                beacon.addr = self.local_id();
                self.sink.on_beacon(beacon);
            }
            Ok(Decoded::Packet(Packet::ForwardData(mut forward))) => {
                forward.src = self.local_id();
                self.sink.on_forward_data(forward);
            }
            Ok(Decoded::Packet(other)) => {
                tracing::debug!("ignoring {} while connected", other.kind());
            }
            Ok(Decoded::Unknown(kind)) => tracing::debug!("ignoring unknown packet type {}", kind),
            Err(e) => tracing::warn!("dropping undecodable frame: {}", e),
        }

        Step::Continue
    }

    fn on_read_failure(&mut self, error: EclaError, reconnect: bool) -> Step {
        self.set_transport(None);

        if self.closing {
            return Step::Exit(Ok(()));
        }

        tracing::warn!("read failed in {}: {}", self.state, error);
        self.record_error(error.clone());

        if reconnect {
            self.transition(ConnectionState::Reconnecting);
            Step::Continue
        } else {
            Step::Exit(Err(error))
        }
    }

    /// Wait for the next frame while serving commands
    ///
    /// The read is raced against the command channel, so outbound writes
    /// never wait for a slow peer.
    async fn next_inbound(&mut self) -> Inbound {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return if self.closing {
                    Inbound::Closed
                } else {
                    Inbound::ReadFailed(EclaError::frame_read("no transport"))
                };
            };

            tokio::select! {
                command = self.command_rx.recv(), if !self.closing => self.handle_command(command).await,
                result = transport.read_frame() => {
                    return match result {
                        Ok(frame) => Inbound::Frame(frame),
                        Err(e) => Inbound::ReadFailed(e),
                    };
                }
            }
        }
    }

    /// Sleep for the backoff while serving commands.
    /// Returns `false` when a close arrived meanwhile.
    async fn backoff(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.backoff);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.command_rx.recv() => {
                    self.handle_command(command).await;
                    if self.closing {
                        return false;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Option<SessionCommand>) {
        match command {
            Some(SessionCommand::Write(frame)) => self.write(frame).await,
            Some(SessionCommand::Close) | None => {
                if self.closing {
                    return;
                }
                self.closing = true;

                if let Some(transport) = self.transport.as_mut() {
                    tracing::debug!("sending close frame to {}", self.addr);
                    if let Err(e) = transport.close().await {
                        tracing::debug!("close frame not delivered: {}", e);
                        self.set_transport(None);
                    } else {
                        // nothing more is written once the close frame is out
                        self.status_tx.send_modify(|status| status.transport_open = false);
                    }
                }
            }
        }
    }

    /// Best-effort write; dropped silently when no transport is open
    async fn write(&mut self, frame: String) {
        match self.transport.as_mut() {
            Some(transport) => {
                if let Err(e) = transport.write_frame(frame).await {
                    tracing::debug!("outbound frame dropped: {}", e);
                }
            }
            None => tracing::trace!("no transport open, outbound frame dropped"),
        }
    }

    async fn send_register(&mut self) {
        let register = Packet::Register(RegisterPacket::new(
            self.config.module_name.clone(),
            self.config.enable_beacon,
        ));

        match packet::encode(&register) {
            Ok(frame) => self.write(frame).await,
            Err(e) => tracing::warn!("failed to encode register packet: {}", e),
        }
    }

    fn local_id(&self) -> String {
        self.sink
            .local_id()
            .unwrap_or_else(|| self.default_id.clone())
    }

    fn fail(&mut self, reason: String) {
        tracing::warn!("daemon reported error: {}", reason);
        self.record_error(EclaError::protocol(reason.clone()));
        self.transition(ConnectionState::Failed(reason));
    }

    fn transition(&mut self, new_state: ConnectionState) {
        tracing::debug!("moving from '{}' to '{}'", self.state.name(), new_state.name());
        self.state = new_state.clone();
        self.status_tx.send_modify(|status| status.state = new_state);
    }

    fn set_transport(&mut self, transport: Option<Box<dyn FrameTransport>>) {
        let open = transport.is_some();
        self.transport = transport;
        self.status_tx.send_modify(|status| status.transport_open = open);
    }

    fn record_error(&mut self, error: EclaError) {
        self.last_error = Some(error.clone());
        self.status_tx.send_modify(|status| status.last_error = Some(error));
    }
}
