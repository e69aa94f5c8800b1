//! iotls-probe: on-device connectivity check.
//!
//! Brings up WiFi, loads the provisioned connection parameters from NVS
//! (falling back to the compiled-in broker), opens a TLS session, reports
//! the trust outcome and negotiated parameters, then tears everything down.
//!
//! Certificates come from the flash table first and from NVS otherwise, so
//! a build can pin the broker's root CA while the device identity stays
//! per-unit.
//!
//! Build-time settings:
//!
//! | Variable            | Meaning                                   |
//! |---------------------|-------------------------------------------|
//! | `IOTLS_WIFI_SSID`   | WiFi network name                         |
//! | `IOTLS_WIFI_PASS`   | WiFi WPA2 passphrase                      |
//! | `IOTLS_BROKER_HOST` | Fallback broker host name                 |
//! | `IOTLS_ROOT_CA_PEM` | Root CA PEM text, linked in as `ca.pem`   |
#![deny(unused_must_use)]

use anyhow::{Result, anyhow};
use log::{error, info, warn};

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::prelude::Peripherals;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};

use iotls::adapters::cert_store::{Entry, RofsCertStore};
use iotls::adapters::hardware_rng::EspHardwareRng;
use iotls::adapters::nvs::NvsAdapter;
use iotls::adapters::tcp::TcpTransport;
use iotls::adapters::time::MonotonicClock;
use iotls::config::DEFAULT_PORT;
use iotls::ports::ConfigPort;
use iotls::tls::TlsEngine;
use iotls::tls::esp_impl::MbedTlsEngine;
use iotls::{ConnectionParameters, SecureTransport, Verification};

const WIFI_SSID: &str = match option_env!("IOTLS_WIFI_SSID") {
    Some(s) => s,
    None => "",
};
const WIFI_PASS: &str = match option_env!("IOTLS_WIFI_PASS") {
    Some(s) => s,
    None => "",
};
const BROKER_HOST: &str = match option_env!("IOTLS_BROKER_HOST") {
    Some(s) => s,
    None => "broker.example",
};
const ROOT_CA_PEM: &str = match option_env!("IOTLS_ROOT_CA_PEM") {
    Some(s) => s,
    None => "",
};

static FLASH_CERTS: [Entry; 1] = [("ca.pem", ROOT_CA_PEM.as_bytes())];

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;
    info!("iotls-probe v{}", env!("CARGO_PKG_VERSION"));

    // ── 2. WiFi station ───────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sysloop.clone(), Some(nvs_partition))?,
        sysloop,
    )?;
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: WIFI_SSID
            .try_into()
            .map_err(|()| anyhow!("SSID longer than 32 bytes"))?,
        password: WIFI_PASS
            .try_into()
            .map_err(|()| anyhow!("WiFi passphrase longer than 64 bytes"))?,
        auth_method: AuthMethod::WPA2Personal,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.connect()?;
    wifi.wait_netif_up()?;
    info!("WiFi: connected to '{}'", WIFI_SSID);

    // ── 3. Connection parameters ──────────────────────────────
    let nvs = NvsAdapter::new()?;
    let params = match nvs.load() {
        Ok(p) => p,
        Err(e) => {
            warn!("Using compiled-in broker ({})", e);
            ConnectionParameters::new(BROKER_HOST, DEFAULT_PORT)?
                .with_root_ca("ca.pem")?
                .with_device_identity("device.crt", "device.key")?
        }
    };

    // ── 4. Secure session ─────────────────────────────────────
    let flash: &'static [Entry] = if ROOT_CA_PEM.is_empty() {
        &[]
    } else {
        info!("Root CA: compiled-in ({}B)", ROOT_CA_PEM.len());
        &FLASH_CERTS
    };
    let certs = RofsCertStore::new(flash).or_else(nvs);

    let mut sta = SecureTransport::new(
        MbedTlsEngine::new(),
        TcpTransport::default(),
        certs,
        EspHardwareRng::new(),
        MonotonicClock::new(),
    );

    let outcome = sta.connect(&params);
    match outcome {
        Ok(Verification::Verified) => info!("Probe: connected, peer verified"),
        Ok(Verification::Skipped(reason)) => warn!("Probe: connected UNVERIFIED ({:?})", reason),
        Err(e) if e.is_trust_failure() => {
            error!("Probe: broker certificate rejected: {}", e);
        }
        Err(e) => error!("Probe: connect failed: {} (retry: {:?})", e, e.retry_class()),
    }
    if let Some(n) = sta.session().engine().negotiated() {
        info!(
            "Probe: {} / {} (record expansion {:?})",
            n.protocol, n.ciphersuite, n.record_expansion
        );
    }

    sta.disconnect();
    sta.destroy();
    outcome.map(|_| ()).map_err(anyhow::Error::from)
}
