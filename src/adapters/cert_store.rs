//! Read-only certificate store backed by blobs linked into flash.
//!
//! The firmware image carries its trust anchors and device identity as
//! `&'static [u8]` (typically `include_bytes!` of PEM or DER files), looked
//! up by logical name:
//!
//! ```ignore
//! static CERTS: RofsCertStore = RofsCertStore::new(&[
//!     ("ca.pem", include_bytes!("../certs/AmazonRootCA1.pem")),
//!     ("device.crt", include_bytes!("../certs/device.crt")),
//!     ("device.key", include_bytes!("../certs/device.key")),
//! ]);
//! ```
//!
//! For blobs provisioned at runtime see
//! [`NvsAdapter`](super::nvs::NvsAdapter).  [`RofsCertStore::or_else`]
//! layers the two: the on-device binary ships a compiled-in root CA and reads
//! the per-device identity from NVS.

use log::{debug, warn};

use crate::ports::{CertificateStore, StoreError};

/// Named blob in the store.
pub type Entry = (&'static str, &'static [u8]);

/// Certificate store over a static table.
pub struct RofsCertStore {
    entries: &'static [Entry],
}

impl RofsCertStore {
    pub const fn new(entries: &'static [Entry]) -> Self {
        Self { entries }
    }

    /// Direct access to a blob without copying.
    pub fn get(&self, name: &str) -> Option<&'static [u8]> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, blob)| *blob)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }

    /// Consult `fallback` for names missing from the flash table.
    pub fn or_else<S: CertificateStore>(self, fallback: S) -> Layered<S> {
        Layered {
            flash: self,
            fallback,
        }
    }
}

impl CertificateStore for RofsCertStore {
    fn load(&self, name: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let Some(blob) = self.get(name) else {
            debug!("CertStore: '{}' not in flash table", name);
            return Err(StoreError::NotFound);
        };
        if blob.len() > buf.len() {
            warn!(
                "CertStore: '{}' is {}B, buffer holds {}B",
                name,
                blob.len(),
                buf.len()
            );
            return Err(StoreError::TooLarge { size: blob.len() });
        }
        buf[..blob.len()].copy_from_slice(blob);
        Ok(blob.len())
    }
}

/// Flash table first, then a runtime store.
///
/// Only `NotFound` falls through: a flash blob that does not fit is an error,
/// not a reason to pick a different certificate.
pub struct Layered<S> {
    flash: RofsCertStore,
    fallback: S,
}

impl<S: CertificateStore> CertificateStore for Layered<S> {
    fn load(&self, name: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        match self.flash.load(name, buf) {
            Err(StoreError::NotFound) => self.fallback.load(name, buf),
            found => found,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
