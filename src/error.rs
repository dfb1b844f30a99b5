use std::time::Duration;

/// Unified adapter error type
///
/// Only `TransportOpen` (when initial retries are disabled), `FrameRead` (when
/// reconnect-after-drop is disabled), `Protocol`, `AlreadyDialing`,
/// `Configuration` and `CloseTimeout` are ever returned to callers. The other
/// variants are logged by the drive loop and absorbed.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EclaError {
    /// Opening the transport failed (initial dial or reconnect)
    #[error("failed to open transport to {addr}: {reason}")]
    TransportOpen {
        addr: String,
        reason: String,
    },

    /// Reading a frame from an open transport failed
    #[error("frame read failed: {reason}")]
    FrameRead {
        reason: String,
    },

    /// Writing a frame to an open transport failed
    #[error("frame write failed: {reason}")]
    FrameWrite {
        reason: String,
    },

    /// A frame could not be decoded
    #[error("decode error: {reason}")]
    Decode {
        reason: String,
    },

    /// The daemon sent an `ErrorPacket`; displays as the peer's reason verbatim
    #[error("{reason}")]
    Protocol {
        reason: String,
    },

    /// Graceful shutdown did not complete within the bound
    #[error("close did not complete within {duration:?}")]
    CloseTimeout {
        duration: Duration,
    },

    /// `dial` was called while a drive loop is (or was) already running
    #[error("session is already dialing")]
    AlreadyDialing,

    /// Invalid configuration value
    #[error("configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },
}

impl EclaError {
    /// Whether the drive loop may retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            EclaError::TransportOpen { .. } => true,
            EclaError::FrameRead { .. } => true,
            EclaError::FrameWrite { .. } => true,
            EclaError::Decode { .. } => true,
            EclaError::Protocol { .. } => false,
            EclaError::CloseTimeout { .. } => false,
            EclaError::AlreadyDialing => false,
            EclaError::Configuration { .. } => false,
        }
    }

    /// Stable error code, handy for log aggregation
    pub fn error_code(&self) -> &'static str {
        match self {
            EclaError::TransportOpen { .. } => "TRANSPORT_OPEN_ERROR",
            EclaError::FrameRead { .. } => "FRAME_READ_ERROR",
            EclaError::FrameWrite { .. } => "FRAME_WRITE_ERROR",
            EclaError::Decode { .. } => "DECODE_ERROR",
            EclaError::Protocol { .. } => "PROTOCOL_ERROR",
            EclaError::CloseTimeout { .. } => "CLOSE_TIMEOUT",
            EclaError::AlreadyDialing => "ALREADY_DIALING",
            EclaError::Configuration { .. } => "CONFIG_ERROR",
        }
    }
}

/// Convenience constructors
impl EclaError {
    pub fn transport_open(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::TransportOpen {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn frame_read(reason: impl ToString) -> Self {
        Self::FrameRead {
            reason: reason.to_string(),
        }
    }

    pub fn frame_write(reason: impl ToString) -> Self {
        Self::FrameWrite {
            reason: reason.to_string(),
        }
    }

    pub fn decode(reason: impl ToString) -> Self {
        Self::Decode {
            reason: reason.to_string(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for EclaError {
    fn from(error: serde_json::Error) -> Self {
        EclaError::decode(error)
    }
}
