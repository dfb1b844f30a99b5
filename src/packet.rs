//! ECLA wire packets
//!
//! Every frame is a JSON object whose `type` field selects the variant.
//! Decoding happens in two phases: the discriminator is sniffed on its own,
//! then the full shape for that discriminator is decoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EclaError;

pub const REGISTER_PACKET_TYPE: &str = "RegisterPacket";
pub const REGISTERED_PACKET_TYPE: &str = "RegisteredPacket";
pub const ERROR_PACKET_TYPE: &str = "ErrorPacket";
pub const BEACON_PACKET_TYPE: &str = "Beacon";
pub const FORWARD_DATA_PACKET_TYPE: &str = "ForwardDataPacket";

/// Sent by the adapter right after the transport opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPacket {
    pub name: String,
    pub enable_beacon: bool,
}

impl RegisterPacket {
    pub fn new(name: impl Into<String>, enable_beacon: bool) -> Self {
        Self {
            name: name.into(),
            enable_beacon,
        }
    }
}

/// Daemon acknowledgement of a successful registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPacket {
    #[serde(default)]
    pub eid: Value,
    #[serde(rename = "nodeid")]
    pub node_id: String,
}

/// Daemon rejection; always fatal for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPacket {
    pub reason: String,
}

/// Neighbor discovery announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconPacket {
    pub addr: String,
    #[serde(default)]
    pub eid: Value,
    pub service_block: String,
}

impl BeaconPacket {
    pub fn new(addr: impl Into<String>, eid: Value, service_block: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            eid,
            service_block: service_block.into(),
        }
    }
}

/// Opaque bundle payload exchanged with the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardDataPacket {
    pub src: String,
    pub dst: String,
    #[serde(rename = "data")]
    pub payload: String,
}

impl ForwardDataPacket {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            payload: payload.into(),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Register(RegisterPacket),
    Registered(RegisteredPacket),
    Error(ErrorPacket),
    Beacon(BeaconPacket),
    ForwardData(ForwardDataPacket),
}

impl Packet {
    /// Wire discriminator of this packet
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Register(_) => REGISTER_PACKET_TYPE,
            Packet::Registered(_) => REGISTERED_PACKET_TYPE,
            Packet::Error(_) => ERROR_PACKET_TYPE,
            Packet::Beacon(_) => BEACON_PACKET_TYPE,
            Packet::ForwardData(_) => FORWARD_DATA_PACKET_TYPE,
        }
    }
}

impl From<RegisterPacket> for Packet {
    fn from(packet: RegisterPacket) -> Self {
        Packet::Register(packet)
    }
}

impl From<BeaconPacket> for Packet {
    fn from(packet: BeaconPacket) -> Self {
        Packet::Beacon(packet)
    }
}

impl From<ForwardDataPacket> for Packet {
    fn from(packet: ForwardDataPacket) -> Self {
        Packet::ForwardData(packet)
    }
}

/// Outcome of a successful decode
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Recognized discriminator with a well-formed body
    Packet(Packet),
    /// Well-formed frame with a discriminator this adapter does not know
    Unknown(String),
}

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Serialization view that puts the discriminator in front of the body
#[derive(Serialize)]
#[serde(tag = "type")]
enum Envelope<'a> {
    #[serde(rename = "RegisterPacket")]
    Register(&'a RegisterPacket),
    #[serde(rename = "RegisteredPacket")]
    Registered(&'a RegisteredPacket),
    #[serde(rename = "ErrorPacket")]
    Error(&'a ErrorPacket),
    #[serde(rename = "Beacon")]
    Beacon(&'a BeaconPacket),
    #[serde(rename = "ForwardDataPacket")]
    ForwardData(&'a ForwardDataPacket),
}

impl<'a> From<&'a Packet> for Envelope<'a> {
    fn from(packet: &'a Packet) -> Self {
        match packet {
            Packet::Register(p) => Envelope::Register(p),
            Packet::Registered(p) => Envelope::Registered(p),
            Packet::Error(p) => Envelope::Error(p),
            Packet::Beacon(p) => Envelope::Beacon(p),
            Packet::ForwardData(p) => Envelope::ForwardData(p),
        }
    }
}

/// Encode a packet into a text frame
pub fn encode(packet: &Packet) -> Result<String, EclaError> {
    Ok(serde_json::to_string(&Envelope::from(packet))?)
}

/// Decode a text frame
///
/// Malformed JSON, a missing `type` or a known type with missing fields is a
/// decode error. An unrecognized `type` is reported as [`Decoded::Unknown`].
pub fn decode(frame: &str) -> Result<Decoded, EclaError> {
    let probe: TypeProbe = serde_json::from_str(frame)?;
    let kind = probe
        .kind
        .ok_or_else(|| EclaError::decode("frame has no type discriminator"))?;

    let packet = match kind.as_str() {
        REGISTER_PACKET_TYPE => Packet::Register(serde_json::from_str(frame)?),
        REGISTERED_PACKET_TYPE => Packet::Registered(serde_json::from_str(frame)?),
        ERROR_PACKET_TYPE => Packet::Error(serde_json::from_str(frame)?),
        BEACON_PACKET_TYPE => Packet::Beacon(serde_json::from_str(frame)?),
        FORWARD_DATA_PACKET_TYPE => Packet::ForwardData(serde_json::from_str(frame)?),
        _ => return Ok(Decoded::Unknown(kind)),
    };

    Ok(Decoded::Packet(packet))
}
