//! ESP32 hardware RNG as a `rand_core` generator.
//!
//! `esp_fill_random()` reads the TRNG, which draws on RF noise while WiFi or
//! Bluetooth is enabled and falls back to the bootloader entropy otherwise.
//! It never fails, so `try_fill_bytes` always succeeds.

use rand_core::{CryptoRng, Error, RngCore};

/// Hardware random number generator.  Stateless, so it is cheap to clone
/// into every session.
#[derive(Debug, Clone, Copy, Default)]
pub struct EspHardwareRng;

impl EspHardwareRng {
    pub fn new() -> Self {
        Self
    }
}

impl RngCore for EspHardwareRng {
    fn next_u32(&mut self) -> u32 {
        // SAFETY: esp_random has no preconditions.
        unsafe { esp_idf_svc::sys::esp_random() }
    }

    fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if dest.is_empty() {
            return;
        }
        // SAFETY: dest is a valid, writable buffer of dest.len() bytes.
        unsafe { esp_idf_svc::sys::esp_fill_random(dest.as_mut_ptr().cast(), dest.len()) }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for EspHardwareRng {}
