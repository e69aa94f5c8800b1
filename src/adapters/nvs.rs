//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements [`ConfigPort`] (connection parameters, namespace `iotls`) and
//! [`CertificateStore`] (provisioned certificate/key blobs, namespace
//! `certs`).
//!
//! # Security
//!
//! - Parameters are validated before persistence and after decoding.
//! - Encrypted NVS: on ESP32, enable `CONFIG_NVS_ENCRYPTION` so the `certs`
//!   namespace (which holds the device private key) is AES-XTS encrypted at
//!   rest.  The simulation backend is plaintext (dev/test only).
//! - Atomic writes: ESP-IDF NVS commits are atomic per `nvs_commit()`.

use log::{debug, info};

use crate::config::ConnectionParameters;
use crate::error::ConfigError;
use crate::identity::MAX_IDENTITY_BLOB;
use crate::ports::{CertificateStore, ConfigPort, StoreError};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

#[cfg(target_os = "espidf")]
use log::warn;

const CONFIG_NAMESPACE: &str = "iotls";
const CONFIG_KEY: &str = "params";
const CERT_NAMESPACE: &str = "certs";

/// NVS keys and namespaces are limited to 15 characters.
const NVS_KEY_MAX: usize = 15;

const MAX_CONFIG_BLOB: usize = 512;

/// Errors from provisioning calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvsError {
    /// Key empty or longer than 15 bytes.
    KeyTooLong,
    /// Blob exceeds the identity loader buffer.
    BlobTooLarge { size: usize },
    /// ESP-IDF error code.
    Esp(i32),
}

impl core::fmt::Display for NvsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::KeyTooLong => write!(f, "NVS key must be 1-{NVS_KEY_MAX} bytes"),
            Self::BlobTooLarge { size } => {
                write!(f, "blob of {size}B exceeds {MAX_IDENTITY_BLOB}B")
            }
            Self::Esp(rc) => write!(f, "ESP-IDF error {rc}"),
        }
    }
}

pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: HashMap<String, Vec<u8>>,
}

impl NvsAdapter {
    /// Create a new NvsAdapter and initialise NVS flash.
    ///
    /// On first boot or after a version mismatch the NVS partition is erased
    /// and re-initialised automatically.
    pub fn new() -> Result<Self, ConfigError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init / nvs_flash_erase are called from the
            // single main-task context before any concurrent NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("NVS: erasing and re-initialising flash partition");
                if unsafe { nvs_flash_erase() } != ESP_OK {
                    return Err(ConfigError::IoError);
                }
                if unsafe { nvs_flash_init() } != ESP_OK {
                    return Err(ConfigError::IoError);
                }
            } else if ret != ESP_OK {
                return Err(ConfigError::IoError);
            }
            info!("NvsAdapter: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("NvsAdapter: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: HashMap::new(),
        })
    }

    /// Provision a certificate or key blob under `name` in the `certs`
    /// namespace.
    pub fn store_blob(&mut self, name: &str, data: &[u8]) -> Result<(), NvsError> {
        if data.len() > MAX_IDENTITY_BLOB {
            return Err(NvsError::BlobTooLarge { size: data.len() });
        }
        self.write_raw(CERT_NAMESPACE, name, data)?;
        info!("NvsAdapter: stored '{}' ({}B)", name, data.len());
        Ok(())
    }

    /// Remove a provisioned blob.  Removing a missing blob is not an error.
    pub fn remove_blob(&mut self, name: &str) -> Result<(), NvsError> {
        self.erase_raw(CERT_NAMESPACE, name)
    }

    #[cfg(not(target_os = "espidf"))]
    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }

    /// NUL-terminated copy of an NVS key or namespace.
    fn nvs_key(key: &str) -> Result<[u8; NVS_KEY_MAX + 1], NvsError> {
        let bytes = key.as_bytes();
        if bytes.is_empty() || bytes.len() > NVS_KEY_MAX {
            return Err(NvsError::KeyTooLong);
        }
        let mut buf = [0u8; NVS_KEY_MAX + 1];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(buf)
    }

    /// Open an NVS namespace, execute a closure with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let ns = Self::nvs_key(namespace).map_err(|_| ESP_ERR_NVS_INVALID_NAME as esp_err_t)?;
        let mut handle: nvs_handle_t = 0;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let ret = unsafe { nvs_open(ns.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }

        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }

    // ── Raw blob access ──────────────────────────────────────

    #[cfg(not(target_os = "espidf"))]
    fn read_raw(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        Self::nvs_key(key).map_err(|_| StoreError::NotFound)?;
        let data = self
            .store
            .get(&Self::composite_key(namespace, key))
            .ok_or(StoreError::NotFound)?;
        if data.len() > buf.len() {
            return Err(StoreError::TooLarge { size: data.len() });
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    #[cfg(target_os = "espidf")]
    fn read_raw(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let key_buf = Self::nvs_key(key).map_err(|_| StoreError::NotFound)?;
        let result = Self::with_nvs_handle(namespace, false, |handle| {
            // First call: get size
            let mut size: usize = 0;
            let ret = unsafe {
                nvs_get_blob(
                    handle,
                    key_buf.as_ptr() as *const _,
                    core::ptr::null_mut(),
                    &mut size,
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            if size > buf.len() {
                return Ok(Err(size));
            }
            let ret = unsafe {
                nvs_get_blob(
                    handle,
                    key_buf.as_ptr() as *const _,
                    buf.as_mut_ptr() as *mut _,
                    &mut size,
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(Ok(size))
        });
        match result {
            Ok(Ok(size)) => Ok(size),
            Ok(Err(size)) => Err(StoreError::TooLarge { size }),
            Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Err(StoreError::NotFound),
            Err(e) => {
                warn!("NvsAdapter: read '{}::{}' failed ({})", namespace, key, e);
                Err(StoreError::Io)
            }
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn write_raw(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), NvsError> {
        Self::nvs_key(key)?;
        self.store
            .insert(Self::composite_key(namespace, key), data.to_vec());
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn write_raw(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), NvsError> {
        let key_buf = Self::nvs_key(key)?;
        Self::with_nvs_handle(namespace, true, |handle| {
            let ret = unsafe {
                nvs_set_blob(
                    handle,
                    key_buf.as_ptr() as *const _,
                    data.as_ptr() as *const _,
                    data.len(),
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        })
        .map_err(|e| {
            warn!("NvsAdapter: write '{}::{}' failed ({})", namespace, key, e);
            NvsError::Esp(e)
        })
    }

    #[cfg(not(target_os = "espidf"))]
    fn erase_raw(&mut self, namespace: &str, key: &str) -> Result<(), NvsError> {
        Self::nvs_key(key)?;
        self.store.remove(&Self::composite_key(namespace, key));
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn erase_raw(&mut self, namespace: &str, key: &str) -> Result<(), NvsError> {
        let key_buf = Self::nvs_key(key)?;
        Self::with_nvs_handle(namespace, true, |handle| {
            let ret = unsafe { nvs_erase_key(handle, key_buf.as_ptr() as *const _) };
            if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        })
        .map_err(NvsError::Esp)
    }
}

impl CertificateStore for NvsAdapter {
    fn load(&self, name: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let n = self.read_raw(CERT_NAMESPACE, name, buf)?;
        debug!("NvsAdapter: '{}' read ({}B)", name, n);
        Ok(n)
    }
}

impl ConfigPort for NvsAdapter {
    fn load(&self) -> Result<ConnectionParameters, ConfigError> {
        let mut buf = [0u8; MAX_CONFIG_BLOB];
        let n = match self.read_raw(CONFIG_NAMESPACE, CONFIG_KEY, &mut buf) {
            Ok(n) => n,
            Err(StoreError::NotFound) => {
                info!("NvsAdapter: no stored connection parameters");
                return Err(ConfigError::NotFound);
            }
            Err(StoreError::TooLarge { .. }) => return Err(ConfigError::Corrupted),
            Err(StoreError::Io) => return Err(ConfigError::IoError),
        };
        let params = ConnectionParameters::from_bytes(&buf[..n])?;
        info!("NvsAdapter: loaded connection parameters ({} bytes)", n);
        Ok(params)
    }

    fn save(&mut self, params: &ConnectionParameters) -> Result<(), ConfigError> {
        params.validate()?;
        let bytes = params.to_bytes()?;
        self.write_raw(CONFIG_NAMESPACE, CONFIG_KEY, &bytes)
            .map_err(|_| ConfigError::IoError)?;
        info!("NvsAdapter: connection parameters saved ({} bytes)", bytes.len());
        Ok(())
    }
}
