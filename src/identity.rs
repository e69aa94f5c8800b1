//! Identity loader: certificate and key blobs from the store.
//!
//! The loader owns a fixed read buffer.  Each [`load`](IdentityLoader::load)
//! overwrites it, and the returned [`IdentityMaterial`] borrows it, so the
//! borrow checker keeps callers from holding on to material past the parse
//! call that consumes it.
//!
//! PEM parsers need the text NUL-terminated and the terminator counted in the
//! length handed to them; DER parsers need the exact length.  The loader
//! appends the terminator when a PEM blob lacks one and records that it did.

use core::fmt;

use log::{debug, warn};

use crate::ports::{CertificateStore, StoreError};

/// Largest blob the loader can hold (bytes), terminator included.
pub const MAX_IDENTITY_BLOB: usize = 4096;

const PEM_MARKER: &[u8] = b"-----BEGIN ";

/// Errors from [`IdentityLoader::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The store has no blob under this name.
    NotFound,
    /// The blob (plus terminator) does not fit the loader buffer.
    TooLarge { size: usize },
    /// The store failed to read the blob.
    Store,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::TooLarge { size } => {
                write!(f, "{size}B exceeds the {MAX_IDENTITY_BLOB}B identity buffer")
            }
            Self::Store => write!(f, "certificate store read failed"),
        }
    }
}

impl core::error::Error for LoadError {}

impl From<StoreError> for LoadError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            StoreError::TooLarge { size } => Self::TooLarge { size },
            StoreError::Io => Self::Store,
        }
    }
}

/// One loaded blob, valid until the next load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMaterial<'a> {
    bytes: &'a [u8],
    content_len: usize,
    terminator_appended: bool,
}

impl<'a> IdentityMaterial<'a> {
    /// The blob exactly as stored.
    pub fn content(&self) -> &'a [u8] {
        &self.bytes[..self.content_len]
    }

    /// What the parser gets: the stored bytes plus the appended terminator,
    /// if any.
    pub fn parse_input(&self) -> &'a [u8] {
        self.bytes
    }

    /// Stored length.
    pub fn len(&self) -> usize {
        self.content_len
    }

    pub fn is_empty(&self) -> bool {
        self.content_len == 0
    }

    /// Length handed to the parser (`len() + 1` when a terminator was
    /// appended).
    pub fn parse_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn terminator_appended(&self) -> bool {
        self.terminator_appended
    }

    pub fn is_pem(&self) -> bool {
        is_pem(self.content())
    }
}

/// Reads named blobs from a [`CertificateStore`] into its own buffer.
pub struct IdentityLoader<'s, S> {
    store: &'s S,
    buf: heapless::Vec<u8, MAX_IDENTITY_BLOB>,
}

impl<'s, S: CertificateStore> IdentityLoader<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self {
            store,
            buf: heapless::Vec::new(),
        }
    }

    /// Load the blob called `name`.
    pub fn load(&mut self, name: &str) -> Result<IdentityMaterial<'_>, LoadError> {
        self.buf.clear();
        // The loader buffer is statically sized; expose all of it to the
        // store and shrink to the reported length afterwards.
        self.buf
            .resize_default(MAX_IDENTITY_BLOB)
            .map_err(|()| LoadError::Store)?;

        let n = match self.store.load(name, &mut self.buf) {
            Ok(n) => n,
            Err(e) => {
                self.buf.clear();
                let err = LoadError::from(e);
                if err != LoadError::NotFound {
                    warn!("STA: identity '{}' load failed: {}", name, err);
                }
                return Err(err);
            }
        };
        if n > MAX_IDENTITY_BLOB {
            self.buf.clear();
            return Err(LoadError::TooLarge { size: n });
        }
        self.buf.truncate(n);

        let mut terminator_appended = false;
        if is_pem(&self.buf) && self.buf.last() != Some(&0) {
            self.buf
                .push(0)
                .map_err(|_| LoadError::TooLarge { size: n + 1 })?;
            terminator_appended = true;
        }

        debug!(
            "STA: identity '{}' loaded ({}B{})",
            name,
            n,
            if terminator_appended { " + NUL" } else { "" }
        );

        Ok(IdentityMaterial {
            bytes: &self.buf,
            content_len: n,
            terminator_appended,
        })
    }
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes.windows(PEM_MARKER.len()).any(|w| w == PEM_MARKER)
}
