use std::sync::Arc;

use crate::packet::{BeaconPacket, ForwardDataPacket, RegisteredPacket};

pub type OnRegisteredHandler = Arc<dyn Fn(RegisteredPacket) + Send + Sync>;
pub type OnBeaconHandler = Arc<dyn Fn(BeaconPacket) + Send + Sync>;
pub type OnForwardDataHandler = Arc<dyn Fn(ForwardDataPacket) + Send + Sync>;
pub type IdProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Hooks invoked by the drive loop
///
/// All methods run synchronously on the drive loop, in frame arrival order.
/// Slow hooks delay processing of subsequent frames.
pub trait EventSink: Send + Sync + 'static {
    /// Registration acknowledged by the daemon
    fn on_registered(&self, _packet: RegisteredPacket) {}

    /// Beacon received; `addr` already carries the local id
    fn on_beacon(&self, _packet: BeaconPacket) {}

    /// Bundle payload received; `src` already carries the local id
    fn on_forward_data(&self, _packet: ForwardDataPacket) {}

    /// Identity stamped onto inbound beacons and forward-data packets.
    /// `None` falls back to the session's random id.
    fn local_id(&self) -> Option<String> {
        None
    }
}

/// Closure backed [`EventSink`]
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_registered: Option<OnRegisteredHandler>,
    pub on_beacon: Option<OnBeaconHandler>,
    pub on_forward_data: Option<OnForwardDataHandler>,
    pub id_provider: Option<IdProvider>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.on_registered.is_none()
            && self.on_beacon.is_none()
            && self.on_forward_data.is_none()
            && self.id_provider.is_none()
    }
}

impl EventSink for Callbacks {
    fn on_registered(&self, packet: RegisteredPacket) {
        if let Some(handler) = &self.on_registered {
            handler(packet);
        }
    }

    fn on_beacon(&self, packet: BeaconPacket) {
        if let Some(handler) = &self.on_beacon {
            handler(packet);
        }
    }

    fn on_forward_data(&self, packet: ForwardDataPacket) {
        if let Some(handler) = &self.on_forward_data {
            handler(packet);
        }
    }

    fn local_id(&self) -> Option<String> {
        self.id_provider.as_ref().map(|provider| provider())
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_registered", &self.on_registered.is_some())
            .field("on_beacon", &self.on_beacon.is_some())
            .field("on_forward_data", &self.on_forward_data.is_some())
            .field("id_provider", &self.id_provider.is_some())
            .finish()
    }
}
