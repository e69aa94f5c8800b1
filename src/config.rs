//! Connection parameters and adapter-wide tunables.
//!
//! [`ConnectionParameters`] is what the higher-level client hands to
//! `connect()`.  It is copied into the session and never mutated afterwards.
//! Values can be provisioned into NVS (see
//! [`NvsAdapter`](crate::adapters::nvs::NvsAdapter)) as a postcard blob.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum destination host name length (bytes).
pub const MAX_HOST_LEN: usize = 128;

/// Maximum logical name length in the certificate store (bytes).
pub const MAX_NAME_LEN: usize = 32;

/// Default MQTT-over-TLS broker port.
pub const DEFAULT_PORT: u16 = 8883;

/// Default handshake timeout (milliseconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u32 = 5_000;

/// Record read timeout once the session is established (milliseconds).
///
/// Short so that `read()` polls the deadline often; the handshake uses the
/// caller's (longer) handshake timeout instead.
pub const STEADY_STATE_READ_TIMEOUT_MS: u32 = 10;

/// Accepted handshake timeout range (milliseconds).
const HANDSHAKE_TIMEOUT_RANGE_MS: core::ops::RangeInclusive<u32> = 100..=120_000;

/// Logical name of a blob in the certificate store.
pub type LogicalName = heapless::String<MAX_NAME_LEN>;

/// Everything `connect()` needs to reach and authenticate a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Destination host name (also used for SNI and hostname verification).
    pub host: heapless::String<MAX_HOST_LEN>,
    /// Destination port.
    pub port: u16,
    /// Root CA used as trust anchor.  `None` disables peer verification.
    pub root_ca: Option<LogicalName>,
    /// Device certificate presented to the broker.
    pub device_cert: Option<LogicalName>,
    /// Private key matching `device_cert`.
    pub device_key: Option<LogicalName>,
    /// Record read timeout during the handshake and overall handshake budget.
    pub handshake_timeout_ms: u32,
    /// Require the peer chain to verify against `root_ca`.
    pub verify_peer: bool,
}

impl ConnectionParameters {
    /// Parameters for `host:port` with no identity material and the default
    /// handshake timeout.
    pub fn new(host: &str, port: u16) -> Result<Self, ConfigError> {
        let params = Self {
            host: bounded(host, "host must be at most 128 bytes")?,
            port,
            root_ca: None,
            device_cert: None,
            device_key: None,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            verify_peer: true,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_root_ca(mut self, name: &str) -> Result<Self, ConfigError> {
        self.root_ca = Some(bounded(name, "root_ca name must be at most 32 bytes")?);
        Ok(self)
    }

    /// Device certificate and the matching private key.
    pub fn with_device_identity(mut self, cert: &str, key: &str) -> Result<Self, ConfigError> {
        self.device_cert = Some(bounded(cert, "device_cert name must be at most 32 bytes")?);
        self.device_key = Some(bounded(key, "device_key name must be at most 32 bytes")?);
        Ok(self)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        self.handshake_timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.validate()?;
        Ok(self)
    }

    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.handshake_timeout_ms))
    }

    /// Range- and content-check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::ValidationFailed("host must not be empty"));
        }
        if !is_printable_ascii(&self.host) || self.host.contains(' ') {
            return Err(ConfigError::ValidationFailed(
                "host must be printable ASCII without spaces",
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationFailed("port must be non-zero"));
        }
        if !HANDSHAKE_TIMEOUT_RANGE_MS.contains(&self.handshake_timeout_ms) {
            return Err(ConfigError::ValidationFailed(
                "handshake_timeout_ms must be 100..=120000",
            ));
        }
        let names = [
            self.root_ca.as_ref(),
            self.device_cert.as_ref(),
            self.device_key.as_ref(),
        ];
        if names
            .into_iter()
            .flatten()
            .any(|n| n.is_empty() || !is_printable_ascii(n))
        {
            return Err(ConfigError::ValidationFailed(
                "store names must be non-empty printable ASCII",
            ));
        }
        Ok(())
    }

    /// Encode for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::IoError)
    }

    /// Decode a persisted blob and validate it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let params: Self = postcard::from_bytes(bytes).map_err(|_| ConfigError::Corrupted)?;
        params.validate()?;
        Ok(params)
    }
}

fn bounded<const N: usize>(
    s: &str,
    too_long: &'static str,
) -> Result<heapless::String<N>, ConfigError> {
    let mut out = heapless::String::new();
    out.push_str(s)
        .map_err(|()| ConfigError::ValidationFailed(too_long))?;
    Ok(out)
}

/// Returns `true` if every byte of `s` is in the printable ASCII range
/// `0x20..=0x7E`.
fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}
