//! Lifecycle manager: the public face of the adapter.
//!
//! [`SecureTransport`] owns one [`Session`] and the collaborators needed to
//! (re)build it.  Calls must be serialized by the caller; there is no
//! internal locking.
//!
//! ```text
//!  connect() ──▶ write()/read() ──▶ disconnect() ──▶ destroy() ──▶ connect() …
//!      │                                                ▲
//!      └────────────── Err(ConnectError) ───────────────┘
//! ```

use core::time::Duration;

use log::{debug, info, warn};
use rand_core::{CryptoRng, RngCore};

use crate::config::ConnectionParameters;
use crate::entropy::SharedRng;
use crate::error::{ConnectError, IoError};
use crate::handshake;
use crate::ports::{CertificateStore, Clock, RawTransport};
use crate::session::{Session, SessionState, Verification};
use crate::timed_io::{self, Deadline};
use crate::tls::{EngineError, TlsEngine};

/// Upper bound on close-notify attempts while the transport reports
/// would-block-on-write.
pub const CLOSE_NOTIFY_MAX_RETRIES: u32 = 100;

/// Secure transport adapter over one TLS engine instance.
pub struct SecureTransport<E, N, S, R, K>
where
    E: TlsEngine,
    N: RawTransport,
{
    session: Session<E, N::Connection>,
    transport: N,
    store: S,
    entropy: SharedRng<R>,
    clock: K,
    params: Option<ConnectionParameters>,
}

impl<E, N, S, R, K> SecureTransport<E, N, S, R, K>
where
    E: TlsEngine,
    N: RawTransport,
    S: CertificateStore,
    R: RngCore + CryptoRng + Send + 'static,
    K: Clock,
{
    /// `entropy` is owned for the adapter's lifetime; every session seeds
    /// from its running state.
    pub fn new(engine: E, transport: N, store: S, entropy: R, clock: K) -> Self {
        Self {
            session: Session::new(engine),
            transport,
            store,
            entropy: SharedRng::new(entropy),
            clock,
            params: None,
        }
    }

    /// Establish a TLS session with `params`.
    ///
    /// Parameters are validated before any resource is acquired.  A session
    /// left over from a previous attempt must be destroyed first.
    pub fn connect(&mut self, params: &ConnectionParameters) -> Result<Verification, ConnectError> {
        params.validate()?;
        if self.session.holds_resources() {
            warn!("STA: connect() while the previous session still holds resources");
            return Err(ConnectError::SessionInUse);
        }

        info!("STA: connecting to {}:{}", params.host, params.port);
        self.params = Some(params.clone());
        handshake::connect(
            &mut self.session,
            &mut self.transport,
            &self.store,
            self.entropy.clone(),
            &self.clock,
            params,
        )
    }

    /// Only session-level state: no liveness probe of the transport.
    pub fn is_connected(&self) -> bool {
        matches!(self.session.state, SessionState::Established { .. })
    }

    /// Write all of `data` within `timeout`.
    pub fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, IoError> {
        let deadline = Deadline::after(&self.clock, timeout);
        self.write_until(data, deadline)
    }

    /// Write all of `data` before an absolute deadline.
    pub fn write_until(&mut self, data: &[u8], deadline: Deadline) -> Result<usize, IoError> {
        if !self.is_connected() {
            return Err(IoError::NotConnected);
        }
        let (engine, link) = self.session.channel().ok_or(IoError::NotConnected)?;
        timed_io::write(engine, link, &self.clock, data, deadline)
    }

    /// Fill `buf` within `timeout`.
    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, IoError> {
        let deadline = Deadline::after(&self.clock, timeout);
        self.read_until(buf, deadline)
    }

    /// Fill `buf` before an absolute deadline.
    pub fn read_until(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, IoError> {
        if !self.is_connected() {
            return Err(IoError::NotConnected);
        }
        let (engine, link) = self.session.channel().ok_or(IoError::NotConnected)?;
        timed_io::read(engine, link, &self.clock, buf, deadline)
    }

    /// Send a close notification.  Never fails: only would-block-on-write is
    /// retried, everything else is ignored.
    pub fn disconnect(&mut self) {
        if matches!(self.session.state, SessionState::Idle) {
            return;
        }
        if let Some((engine, link)) = self.session.channel() {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match engine.close_notify(link) {
                    Err(EngineError::WantWrite) if attempts < CLOSE_NOTIFY_MAX_RETRIES => {}
                    Err(EngineError::WantWrite) => {
                        warn!("STA: close notify still blocked after {} attempts", attempts);
                        break;
                    }
                    Err(e) => {
                        debug!("STA: close notify ignored ({})", e);
                        break;
                    }
                    Ok(()) => break,
                }
            }
        }
        self.session.state = SessionState::Closed;
        info!("STA: disconnected");
    }

    /// Release everything the session acquired.  Safe in any state,
    /// idempotent.
    pub fn destroy(&mut self) {
        self.session.destroy();
    }

    pub fn session(&self) -> &Session<E, N::Connection> {
        &self.session
    }

    /// Parameters of the last `connect()` attempt.
    pub fn params(&self) -> Option<&ConnectionParameters> {
        self.params.as_ref()
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }
}
