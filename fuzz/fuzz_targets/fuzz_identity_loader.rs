//! Fuzz target: `IdentityLoader::load`
//!
//! Feeds arbitrary blobs through the loader the handshake driver uses for
//! root CAs, device certificates and keys.
//!
//! Invariants checked:
//! - No panics under any byte sequence
//! - `content()` is the stored blob, byte for byte
//! - `parse_len()` is `len() + 1` exactly when a terminator was appended,
//!   and the appended byte is NUL
//! - Blobs that cannot take their terminator are refused, not truncated
//!
//! cargo fuzz run fuzz_identity_loader

#![no_main]

use iotls::identity::{IdentityLoader, LoadError, MAX_IDENTITY_BLOB};
use iotls::ports::{CertificateStore, StoreError};
use libfuzzer_sys::fuzz_target;

struct OneBlob<'a>(&'a [u8]);

impl CertificateStore for OneBlob<'_> {
    fn load(&self, name: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        if name != "blob" {
            return Err(StoreError::NotFound);
        }
        if self.0.len() > buf.len() {
            return Err(StoreError::TooLarge { size: self.0.len() });
        }
        buf[..self.0.len()].copy_from_slice(self.0);
        Ok(self.0.len())
    }
}

fuzz_target!(|data: &[u8]| {
    let store = OneBlob(data);
    let mut loader = IdentityLoader::new(&store);

    match loader.load("blob") {
        Ok(material) => {
            assert_eq!(material.content(), data);
            if material.terminator_appended() {
                assert_eq!(material.parse_len(), data.len() + 1);
                assert_eq!(material.parse_input().last(), Some(&0));
                assert!(material.is_pem());
            } else {
                assert_eq!(material.parse_len(), data.len());
            }
        }
        Err(LoadError::TooLarge { size }) => {
            assert!(size > MAX_IDENTITY_BLOB || data.len() == MAX_IDENTITY_BLOB);
        }
        Err(e) => panic!("unexpected load error: {e}"),
    }

    // The loader must be reusable after any outcome.
    assert_eq!(loader.load("missing"), Err(LoadError::NotFound));
});
