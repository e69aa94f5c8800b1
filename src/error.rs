//! Unified error types for the secure transport adapter.
//!
//! Every variant is `Copy` so a failure can be stored in the session state
//! (`SessionState::Failed`) and handed back to the caller without allocation.
//! Callers are expected to branch on the specific kind: the retry policy
//! after a DNS failure is not the same as after a rejected certificate.

use core::fmt;

use crate::tls::EngineError;

// ---------------------------------------------------------------------------
// Raw transport connect errors
// ---------------------------------------------------------------------------

/// Why the raw (pre-TLS) transport could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnectError {
    /// A socket could not be created (local resource exhaustion).
    SocketFailed,
    /// The destination host name did not resolve.
    HostUnknown,
    /// The peer refused the connection or it could not be established.
    ConnectFailed,
}

impl fmt::Display for TransportConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketFailed => write!(f, "socket creation failed"),
            Self::HostUnknown => write!(f, "host name did not resolve"),
            Self::ConnectFailed => write!(f, "connection refused or failed"),
        }
    }
}

impl core::error::Error for TransportConnectError {}

// ---------------------------------------------------------------------------
// Handshake failures
// ---------------------------------------------------------------------------

/// Why the TLS handshake did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The engine reported a non-retryable protocol or record error.
    Protocol(EngineError),
    /// The peer certificate chain was rejected.  Carries the engine's
    /// verification bitmask (see [`VerifyFlags`](crate::tls::VerifyFlags)).
    PeerVerificationFailed(u32),
    /// Retries or a record read exhausted the handshake timeout.
    TimedOut,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error ({e})"),
            Self::PeerVerificationFailed(flags) => {
                write!(f, "peer verification failed (flags=0x{flags:05x})")
            }
            Self::TimedOut => write!(f, "handshake timed out"),
        }
    }
}

impl core::error::Error for HandshakeFailure {}

// ---------------------------------------------------------------------------
// connect() errors
// ---------------------------------------------------------------------------

/// Fatal conditions raised by `connect()`.
///
/// Each one leaves the session in `Failed`; `destroy()` must run before the
/// session is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The DRBG could not be seeded from the hardware entropy source.
    EntropySeedFailed,
    /// The root CA could not be loaded or parsed.
    RootCertParseError,
    /// The device certificate could not be loaded or parsed.
    DeviceCertParseError,
    /// The device private key could not be loaded or parsed.
    PrivateKeyParseError,
    /// The raw transport connection could not be opened.
    TransportConnectFailed(TransportConnectError),
    /// A TLS configuration or setup call failed.
    ConfigurationError,
    /// The handshake failed.
    HandshakeFailed(HandshakeFailure),
    /// Parameters were rejected before any resource was acquired.
    InvalidParameters(&'static str),
    /// A previous session still holds resources; call `destroy()` first.
    SessionInUse,
}

/// Retry policy hint derived from a [`ConnectError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient; retry right away.
    Immediate,
    /// Retry with the normal backoff.
    Backoff,
    /// Name resolution failed; back off longer than for local failures.
    LongBackoff,
    /// Retrying with the same parameters cannot succeed.
    Reconfigure,
    /// Trust failure; treat as a security incident, do not retry blindly.
    Never,
}

impl ConnectError {
    /// `true` when the failure is a trust decision rather than a network or
    /// protocol problem.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(HandshakeFailure::PeerVerificationFailed(_))
        )
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::SessionInUse => RetryClass::Immediate,
            Self::EntropySeedFailed
            | Self::ConfigurationError
            | Self::TransportConnectFailed(TransportConnectError::SocketFailed | TransportConnectError::ConnectFailed)
            | Self::HandshakeFailed(HandshakeFailure::Protocol(_) | HandshakeFailure::TimedOut) => {
                RetryClass::Backoff
            }
            Self::TransportConnectFailed(TransportConnectError::HostUnknown) => RetryClass::LongBackoff,
            Self::RootCertParseError
            | Self::DeviceCertParseError
            | Self::PrivateKeyParseError
            | Self::InvalidParameters(_) => RetryClass::Reconfigure,
            Self::HandshakeFailed(HandshakeFailure::PeerVerificationFailed(_)) => RetryClass::Never,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntropySeedFailed => write!(f, "entropy seeding failed"),
            Self::RootCertParseError => write!(f, "root CA certificate parse error"),
            Self::DeviceCertParseError => write!(f, "device certificate parse error"),
            Self::PrivateKeyParseError => write!(f, "device private key parse error"),
            Self::TransportConnectFailed(e) => write!(f, "transport connect failed: {e}"),
            Self::ConfigurationError => write!(f, "TLS configuration error"),
            Self::HandshakeFailed(e) => write!(f, "TLS handshake failed: {e}"),
            Self::InvalidParameters(msg) => write!(f, "invalid parameters: {msg}"),
            Self::SessionInUse => write!(f, "session still holds resources"),
        }
    }
}

impl core::error::Error for ConnectError {}

impl From<TransportConnectError> for ConnectError {
    fn from(e: TransportConnectError) -> Self {
        Self::TransportConnectFailed(e)
    }
}

impl From<HandshakeFailure> for ConnectError {
    fn from(e: HandshakeFailure) -> Self {
        Self::HandshakeFailed(e)
    }
}

// ---------------------------------------------------------------------------
// Timed I/O errors
// ---------------------------------------------------------------------------

/// Non-success outcomes of a deadline-bounded write or read.
///
/// None of these tear the session down; the caller decides whether to
/// retry, reconnect or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The session is not established.
    NotConnected,
    /// The engine reported a hard write error after `written` bytes.
    WriteError { written: usize },
    /// The deadline elapsed with only this many bytes sent.
    WriteTimeout(usize),
    /// The engine reported a hard read error after `read` bytes.
    ReadError { read: usize },
    /// The deadline elapsed with this many bytes read (fewer than requested).
    ReadTimeout(usize),
    /// The deadline elapsed with nothing read.  An idle channel is normal.
    NothingToRead,
}

impl IoError {
    /// Bytes moved before the operation stopped.
    pub fn transferred(&self) -> usize {
        match *self {
            Self::WriteError { written } => written,
            Self::ReadError { read } => read,
            Self::WriteTimeout(n) | Self::ReadTimeout(n) => n,
            Self::NotConnected | Self::NothingToRead => 0,
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "session not established"),
            Self::WriteError { written } => write!(f, "write error after {written} bytes"),
            Self::WriteTimeout(n) => write!(f, "write timed out after {n} bytes"),
            Self::ReadError { read } => write!(f, "read error after {read} bytes"),
            Self::ReadTimeout(n) => write!(f, "read timed out after {n} bytes"),
            Self::NothingToRead => write!(f, "nothing to read"),
        }
    }
}

impl core::error::Error for IoError {}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from building, validating or persisting connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A field failed validation; the message names the field.
    ValidationFailed(&'static str),
    /// No parameters stored yet (first boot).
    NotFound,
    /// The stored blob could not be decoded.
    Corrupted,
    /// Generic I/O error from the storage backend.
    IoError,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            Self::NotFound => write!(f, "parameters not found"),
            Self::Corrupted => write!(f, "stored parameters corrupted"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl core::error::Error for ConfigError {}

impl From<ConfigError> for ConnectError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::ValidationFailed(msg) => Self::InvalidParameters(msg),
            _ => Self::InvalidParameters("parameters unavailable"),
        }
    }
}
