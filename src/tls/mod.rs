//! TLS engine seam.
//!
//! The TLS engine (record layer, cipher suites, X.509 parsing) is an external
//! library.  [`TlsEngine`] mirrors its manual life cycle so the handshake
//! driver can sequence it and the session can guarantee a single
//! `init`/`free` pair:
//!
//! ```text
//! init ─▶ seed ─▶ parse_* ─▶ configure ─▶ setup ─▶ handshake_step* ─▶
//!   verify_result ─▶ (write | read)* ─▶ close_notify ─▶ free
//! ```
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: [`esp_impl::MbedTlsEngine`] over the
//!   ESP-IDF mbedTLS build.
//! - **all other targets**: no engine is bundled; tests drive the adapter
//!   through a scripted engine.

use core::fmt;
use core::time::Duration;

use log::debug;

use crate::entropy::EntropyPoll;
use crate::ports::RawConnection;

mod verify;

pub use verify::VerifyFlags;

#[cfg(target_os = "espidf")]
pub mod esp_impl;

// ───────────────────────────────────────────────────────────────
// Engine results
// ───────────────────────────────────────────────────────────────

/// Non-success results reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// Needs more input from the transport before it can progress.
    WantRead,
    /// Needs the transport to accept more output before it can progress.
    WantWrite,
    /// A receive-with-timeout expired without data.
    Timeout,
    /// The peer certificate chain failed verification during the handshake.
    CertVerifyFailed,
    /// The peer sent a close notification.
    PeerClosed,
    /// Any other engine error code.
    Code(i32),
}

impl EngineError {
    /// The only retryable handshake/write results.
    pub fn is_would_block(self) -> bool {
        matches!(self, Self::WantRead | Self::WantWrite)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WantRead => write!(f, "want read"),
            Self::WantWrite => write!(f, "want write"),
            Self::Timeout => write!(f, "read timeout"),
            Self::CertVerifyFailed => write!(f, "certificate verification failed"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Code(rc) if *rc < 0 => write!(f, "rc=-0x{:04x}", rc.unsigned_abs()),
            Self::Code(rc) => write!(f, "rc={rc}"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Configuration handed to the engine
// ───────────────────────────────────────────────────────────────

/// Endpoint role.  This adapter only ever acts as a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
}

/// Record transport flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
}

/// Security preset (cipher suites, curves, hashes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Default,
}

/// How the engine treats the peer certificate chain during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Abort the handshake if the chain does not verify.
    Required,
    /// Verify and record the result, but let the handshake finish.
    Optional,
}

/// One certificate of the peer chain, as seen by the verification callback.
#[derive(Debug, Clone, Copy)]
pub struct PeerCertificate<'a> {
    /// Position in the chain (0 = peer leaf).
    pub depth: u32,
    /// Flags accumulated so far for this certificate.
    pub flags: VerifyFlags,
    /// Engine-formatted certificate summary (subject, issuer, validity).
    pub info: &'a str,
}

/// Diagnostic hook invoked for every certificate of the peer chain.
///
/// It cannot influence the trust decision: engines call it with a copy of
/// the flags and ignore anything it does.
pub type VerifyCallback = fn(&PeerCertificate<'_>);

/// Everything the driver configures on the engine in one go.
#[derive(Debug, Clone, Copy)]
pub struct TlsSettings {
    pub role: Role,
    pub transport: TransportKind,
    pub preset: Preset,
    pub auth_mode: AuthMode,
    /// Install the parsed root CA as trust anchor.
    pub install_trust_anchors: bool,
    /// Install the parsed device certificate and key.
    pub install_own_certificate: bool,
    /// Record read timeout for receive-with-timeout.
    pub read_timeout: Duration,
    pub verify_callback: Option<VerifyCallback>,
}

/// Parameters agreed during the handshake, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: heapless::String<16>,
    pub ciphersuite: heapless::String<64>,
    /// Bytes of overhead per record, if the engine can tell.
    pub record_expansion: Option<usize>,
}

/// Logs every certificate offered by the peer.  Never touches the flags.
pub fn log_peer_certificate(cert: &PeerCertificate<'_>) {
    debug!("TLS: verify requested for depth {}", cert.depth);
    for line in cert.info.lines() {
        debug!("TLS:   {}", line);
    }
    if cert.flags.is_clean() {
        debug!("TLS:   this certificate has no flags");
    } else {
        debug!("TLS:   ! {}", cert.flags);
    }
}

// ───────────────────────────────────────────────────────────────
// Engine trait
// ───────────────────────────────────────────────────────────────

/// A client-side TLS engine instance with manual resource management.
///
/// The session calls [`init`](Self::init) exactly once before anything else
/// and [`free`](Self::free) exactly once on teardown.  Calls that move
/// records take the raw connection explicitly; the engine never keeps it.
pub trait TlsEngine {
    /// Initialise every sub-object (DRBG, entropy pool, contexts, config,
    /// certificate and key holders).
    fn init(&mut self);

    /// Register `entropy` as a strong source and seed the DRBG with
    /// `personalization`.  The engine keeps the source until `free`.
    fn seed(
        &mut self,
        entropy: Box<dyn EntropyPoll + Send>,
        personalization: &[u8],
    ) -> Result<(), EngineError>;

    /// Parse a root CA (PEM must include its NUL terminator, DER must not).
    fn parse_trust_anchor(&mut self, material: &[u8]) -> Result<(), EngineError>;

    /// Parse the device certificate.
    fn parse_own_certificate(&mut self, material: &[u8]) -> Result<(), EngineError>;

    /// Parse the device private key.
    fn parse_private_key(&mut self, material: &[u8], passphrase: &[u8]) -> Result<(), EngineError>;

    /// Apply `settings` to the configuration object.
    fn configure(&mut self, settings: &TlsSettings) -> Result<(), EngineError>;

    /// Bind the context to the configuration and set the expected server name.
    fn setup(&mut self, server_name: &str) -> Result<(), EngineError>;

    /// Change the record read timeout used by receive-with-timeout.
    fn set_read_timeout(&mut self, timeout: Duration);

    /// Advance the handshake.  `Ok(())` once it is complete.
    fn handshake_step(&mut self, link: &mut dyn RawConnection) -> Result<(), EngineError>;

    /// Aggregated verification bitmask of the peer chain.
    fn verify_result(&self) -> u32;

    /// Protocol and ciphersuite after a completed handshake.
    fn negotiated(&self) -> Option<Negotiated> {
        None
    }

    /// Write application data.  Returns bytes consumed (may be fewer than
    /// `data.len()`).
    fn write(&mut self, link: &mut dyn RawConnection, data: &[u8]) -> Result<usize, EngineError>;

    /// Read application data.  `Ok(0)` means no data was produced.
    fn read(&mut self, link: &mut dyn RawConnection, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Send a close notification alert.
    fn close_notify(&mut self, link: &mut dyn RawConnection) -> Result<(), EngineError>;

    /// Release every sub-object, including the registered entropy source.
    fn free(&mut self);
}
