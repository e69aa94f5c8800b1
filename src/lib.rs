//! iotls: secure transport adapter for constrained IoT clients.
//!
//! Lets an MQTT-style client exchange bytes with a broker over a mutually
//! authenticated TLS channel on a device with a hardware RNG, a read-only
//! certificate store and no OS sockets of its own.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │  TcpTransport   RofsCertStore   NvsAdapter   MonotonicClock  │
//! │  (RawTransport) (CertStore)     (Cert+Config) (Clock)        │
//! │  MbedTlsEngine (TlsEngine)      EspHardwareRng (RngCore)     │
//! │                                                              │
//! │  ──────────────── Port Trait Boundary ───────────────────    │
//! │                                                              │
//! │  SecureTransport ─▶ handshake driver ─▶ Session              │
//! │        │                 │                                   │
//! │        └─ timed I/O      └─ identity loader · entropy bridge │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All ESP-IDF-specific code is guarded by `#[cfg(target_os = "espidf")]`
//! within each module; everything else builds and tests on the host.

#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod entropy;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod ports;
pub mod session;
pub mod timed_io;
pub mod tls;
pub mod transport;

pub use config::ConnectionParameters;
pub use error::{ConnectError, HandshakeFailure, IoError, RetryClass, TransportConnectError};
pub use session::{Phase, SessionState, SkipReason, Verification};
pub use timed_io::Deadline;
pub use transport::SecureTransport;
