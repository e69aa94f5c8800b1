//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter        | Implements        | Connects to                  |
//! |----------------|-------------------|------------------------------|
//! | `cert_store`   | CertificateStore  | Blobs linked into flash      |
//! | `nvs`          | CertificateStore  | NVS `certs` namespace        |
//! |                | ConfigPort        | NVS `iotls` namespace        |
//! | `tcp`          | RawTransport      | lwIP / host TCP via std::net |
//! | `time`         | Clock             | ESP32 system timer           |
//! | `hardware_rng` | RngCore           | ESP32 TRNG                   |
//!
//! The TLS engine adapter lives in [`tls::esp_impl`](crate::tls).

pub mod cert_store;
#[cfg(target_os = "espidf")]
pub mod hardware_rng;
pub mod nvs;
pub mod tcp;
pub mod time;
