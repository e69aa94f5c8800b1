//! Port traits: the boundary between the adapter core and its collaborators.
//!
//! ```text
//!   CertificateStore ─┐
//!   RawTransport ─────┼──▶ SecureTransport ──▶ TlsEngine
//!   Clock ────────────┘
//! ```
//!
//! Concrete collaborators live in [`adapters`](crate::adapters); tests drive
//! the core through mock implementations of the same traits.

use core::fmt;
use core::time::Duration;

use crate::config::ConnectionParameters;
use crate::error::{ConfigError, TransportConnectError};

// ───────────────────────────────────────────────────────────────
// Certificate store (read-only)
// ───────────────────────────────────────────────────────────────

/// Read-only store of certificate and key blobs, addressed by logical name.
pub trait CertificateStore {
    /// Copy the blob called `name` into `buf`.
    /// Returns the number of bytes written.
    fn load(&self, name: &str, buf: &mut [u8]) -> Result<usize, StoreError>;
}

/// Errors from [`CertificateStore`] lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No blob under this name.
    NotFound,
    /// The blob does not fit the caller's buffer.
    TooLarge { size: usize },
    /// Backend read failure.
    Io,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "blob not found"),
            Self::TooLarge { size } => write!(f, "blob too large ({size}B)"),
            Self::Io => write!(f, "store I/O error"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Raw transport (TCP-equivalent, below TLS)
// ───────────────────────────────────────────────────────────────

/// Opens raw byte-stream connections to a host.
pub trait RawTransport {
    type Connection: RawConnection;

    fn connect(&mut self, host: &str, port: u16) -> Result<Self::Connection, TransportConnectError>;
}

/// An open raw connection.  Dropping it releases the underlying socket.
pub trait RawConnection {
    /// Send up to `data.len()` bytes.  Returns the number accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize, BioError>;

    /// Receive into `buf`, waiting at most `timeout`.
    /// A zero `timeout` waits indefinitely.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, BioError>;

    /// Shut the connection down.  Must be safe to call more than once.
    fn close(&mut self) {}
}

/// Outcomes of a raw send/receive other than progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioError {
    /// Not ready yet; retry.
    WouldBlock,
    /// `receive` waited for its full timeout without data.
    Timeout,
    /// The peer closed the connection.
    Closed,
    /// Any other socket failure.
    Failed,
}

// ───────────────────────────────────────────────────────────────
// Monotonic clock
// ───────────────────────────────────────────────────────────────

/// Monotonic time source used to evaluate deadlines.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed origin.  Never decreases.
    fn now(&self) -> Duration;
}

// ───────────────────────────────────────────────────────────────
// Configuration port
// ───────────────────────────────────────────────────────────────

/// Loads and persists provisioned [`ConnectionParameters`].
///
/// Implementations MUST validate before persisting.
pub trait ConfigPort {
    /// Returns [`ConfigError::NotFound`] if nothing was provisioned yet.
    fn load(&self) -> Result<ConnectionParameters, ConfigError>;

    fn save(&mut self, params: &ConnectionParameters) -> Result<(), ConfigError>;
}
