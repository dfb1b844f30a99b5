//! Session configuration
//!
//! An [`EclaConfig`] is fixed once the session is built; the drive loop only
//! ever reads it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EclaError;

/// Default pause between failed open attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Default bound on the graceful close handshake
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Adapter session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EclaConfig {
    /// Module name announced in the `RegisterPacket`
    pub module_name: String,
    /// Whether the daemon should route beacons to this module
    pub enable_beacon: bool,
    /// Re-open the transport after it drops while connected
    pub reconnect: bool,
    /// Keep retrying the very first open instead of failing `dial`
    pub initial_reconnect: bool,
    /// Re-open the transport when it drops before registration completes.
    /// When disabled the read error is returned from `dial`.
    pub retry_registration: bool,
    /// Pause between failed open attempts
    pub backoff: Duration,
    /// Bound on the graceful close handshake
    pub close_timeout: Duration,
}

impl Default for EclaConfig {
    fn default() -> Self {
        Self {
            module_name: String::new(),
            enable_beacon: false,
            reconnect: false,
            initial_reconnect: false,
            retry_registration: true,
            backoff: DEFAULT_BACKOFF,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl EclaConfig {
    pub fn new(module_name: impl Into<String>, enable_beacon: bool) -> Self {
        Self {
            module_name: module_name.into(),
            enable_beacon,
            ..Self::default()
        }
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub fn with_initial_reconnect(mut self, enabled: bool) -> Self {
        self.initial_reconnect = enabled;
        self
    }

    pub fn with_retry_registration(mut self, enabled: bool) -> Self {
        self.retry_registration = enabled;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), EclaError> {
        if self.module_name.trim().is_empty() {
            return Err(EclaError::config_error("module_name", "must not be empty"));
        }

        if self.backoff.is_zero() {
            return Err(EclaError::config_error("backoff", "must be > 0"));
        }

        if self.close_timeout.is_zero() {
            return Err(EclaError::config_error("close_timeout", "must be > 0"));
        }

        Ok(())
    }
}
