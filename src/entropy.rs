//! Entropy bridge: hardware RNG to TLS entropy source.
//!
//! The engine polls its entropy sources through [`EntropyPoll`].  The bridge
//! wraps any `rand_core` generator (on ESP32, the TRNG behind
//! `adapters::hardware_rng::EspHardwareRng`) and guarantees that a
//! poll either fills the whole request or fails hard, which aborts the
//! handshake at the seeding step.
//!
//! The adapter builds one bridge per session but owns a single generator.
//! Each bridge draws from it through a [`SharedRng`] handle, so every
//! session advances the same state instead of replaying a copy of it.

use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{trace, warn};
use rand_core::{CryptoRng, RngCore};

/// Hard failure of the entropy source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntropyError;

impl fmt::Display for EntropyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entropy source failed")
    }
}

/// Engine-facing entropy source contract.
pub trait EntropyPoll {
    /// Fill `out` completely.  Returns the number of bytes written, which is
    /// always `out.len()` on success.
    fn poll(&mut self, out: &mut [u8]) -> Result<usize, EntropyError>;

    /// Whether the engine may count this source towards its strong-source
    /// threshold.
    fn is_strong(&self) -> bool {
        true
    }
}

/// Adapts a cryptographic RNG to [`EntropyPoll`].
pub struct EntropyBridge<R> {
    source: R,
    bytes_polled: u64,
}

impl<R: RngCore + CryptoRng> EntropyBridge<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            bytes_polled: 0,
        }
    }

    /// Fill `out` from the hardware source.
    pub fn fill(&mut self, out: &mut [u8]) -> Result<usize, EntropyError> {
        if let Err(e) = self.source.try_fill_bytes(out) {
            warn!("STA: entropy source failed ({})", e);
            return Err(EntropyError);
        }
        self.bytes_polled += out.len() as u64;
        trace!("STA: entropy poll {}B (total {}B)", out.len(), self.bytes_polled);
        Ok(out.len())
    }

    /// Total bytes handed out so far.
    pub fn bytes_polled(&self) -> u64 {
        self.bytes_polled
    }
}

impl<R: RngCore + CryptoRng> EntropyPoll for EntropyBridge<R> {
    fn poll(&mut self, out: &mut [u8]) -> Result<usize, EntropyError> {
        self.fill(out)
    }
}

/// Cloneable handle to one generator.
///
/// Clones share state: bytes drawn through one handle are never handed out
/// again through another.
pub struct SharedRng<R>(Arc<Mutex<R>>);

impl<R> SharedRng<R> {
    pub fn new(source: R) -> Self {
        Self(Arc::new(Mutex::new(source)))
    }

    // A poisoned generator still yields fresh output.
    fn lock(&self) -> MutexGuard<'_, R> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R> Clone for SharedRng<R> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<R: RngCore> RngCore for SharedRng<R> {
    fn next_u32(&mut self) -> u32 {
        self.lock().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.lock().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.lock().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.lock().try_fill_bytes(dest)
    }
}

impl<R: CryptoRng> CryptoRng for SharedRng<R> {}
