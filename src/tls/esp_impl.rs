//! mbedTLS engine for ESP-IDF.
//!
//! This module is compiled only for `target_os = "espidf"`.  Every mbedTLS
//! struct is heap-allocated (they are large, and mbedTLS keeps pointers to
//! them across calls, so their addresses must not move).
//!
//! The raw connection is never stored: each call that moves records binds
//! the BIO to a pointer to the caller's `&mut dyn RawConnection` for the
//! duration of that call and unbinds it afterwards.

use core::ffi::{CStr, c_char, c_int, c_void};
use core::time::Duration;
use std::ffi::CString;

use log::{debug, warn};

use esp_idf_svc::sys::{
    MBEDTLS_ENTROPY_SOURCE_STRONG, MBEDTLS_ERR_SSL_PEER_CLOSE_NOTIFY, MBEDTLS_ERR_SSL_TIMEOUT,
    MBEDTLS_ERR_SSL_WANT_READ, MBEDTLS_ERR_SSL_WANT_WRITE, MBEDTLS_ERR_X509_CERT_VERIFY_FAILED,
    MBEDTLS_SSL_IS_CLIENT, MBEDTLS_SSL_PRESET_DEFAULT, MBEDTLS_SSL_TRANSPORT_STREAM,
    MBEDTLS_SSL_VERIFY_OPTIONAL, MBEDTLS_SSL_VERIFY_REQUIRED, mbedtls_ctr_drbg_context,
    mbedtls_ctr_drbg_free, mbedtls_ctr_drbg_init, mbedtls_ctr_drbg_random, mbedtls_ctr_drbg_seed,
    mbedtls_entropy_add_source, mbedtls_entropy_context, mbedtls_entropy_free,
    mbedtls_entropy_func, mbedtls_entropy_init, mbedtls_pk_context, mbedtls_pk_free,
    mbedtls_pk_init, mbedtls_pk_parse_key, mbedtls_ssl_close_notify, mbedtls_ssl_conf_authmode,
    mbedtls_ssl_conf_ca_chain, mbedtls_ssl_conf_own_cert, mbedtls_ssl_conf_read_timeout,
    mbedtls_ssl_conf_rng, mbedtls_ssl_conf_verify, mbedtls_ssl_config,
    mbedtls_ssl_config_defaults, mbedtls_ssl_config_free, mbedtls_ssl_config_init,
    mbedtls_ssl_context, mbedtls_ssl_free, mbedtls_ssl_get_ciphersuite,
    mbedtls_ssl_get_record_expansion, mbedtls_ssl_get_verify_result, mbedtls_ssl_get_version,
    mbedtls_ssl_handshake, mbedtls_ssl_init, mbedtls_ssl_read, mbedtls_ssl_set_bio,
    mbedtls_ssl_set_hostname, mbedtls_ssl_setup, mbedtls_ssl_write, mbedtls_x509_crt,
    mbedtls_x509_crt_free, mbedtls_x509_crt_info, mbedtls_x509_crt_init, mbedtls_x509_crt_parse,
};

use super::{
    AuthMode, EngineError, Negotiated, PeerCertificate, TlsEngine, TlsSettings, VerifyCallback,
    VerifyFlags,
};
use crate::entropy::EntropyPoll;
use crate::ports::{BioError, RawConnection};

/// `MBEDTLS_ERR_NET_RECV_FAILED` (net_sockets.h is not part of the bindings).
const ERR_NET_RECV_FAILED: c_int = -0x004C;
/// `MBEDTLS_ERR_NET_SEND_FAILED`
const ERR_NET_SEND_FAILED: c_int = -0x004E;
/// `MBEDTLS_ERR_NET_CONN_RESET`
const ERR_NET_CONN_RESET: c_int = -0x0050;
/// `MBEDTLS_ERR_ENTROPY_SOURCE_FAILED`
const ERR_ENTROPY_SOURCE_FAILED: c_int = -0x003C;

/// Bytes the entropy source must deliver before the pool counts as seeded.
const ENTROPY_THRESHOLD: usize = 32;

/// Size of the buffer the diagnostic callback formats a certificate into.
const CERT_INFO_LEN: usize = 1024;

fn engine_error(rc: c_int) -> EngineError {
    match rc {
        MBEDTLS_ERR_SSL_WANT_READ => EngineError::WantRead,
        MBEDTLS_ERR_SSL_WANT_WRITE => EngineError::WantWrite,
        MBEDTLS_ERR_SSL_TIMEOUT => EngineError::Timeout,
        MBEDTLS_ERR_X509_CERT_VERIFY_FAILED => EngineError::CertVerifyFailed,
        MBEDTLS_ERR_SSL_PEER_CLOSE_NOTIFY => EngineError::PeerClosed,
        rc => EngineError::Code(rc),
    }
}

fn check(rc: c_int, what: &str) -> Result<(), EngineError> {
    if rc == 0 {
        return Ok(());
    }
    warn!("TLS(espidf): {} failed (rc=-0x{:04x})", what, rc.unsigned_abs());
    Err(engine_error(rc))
}

// ── Callbacks ─────────────────────────────────────────────────────────────────
//
// The BIO context is a pointer to a `&mut dyn RawConnection` living on the
// stack of the engine call that bound it.

type LinkRef<'a> = &'a mut dyn RawConnection;

/// mbedTLS send BIO callback.
///
/// # Safety
///
/// `ctx` must point to a live `LinkRef` (see [`MbedTlsEngine::with_bio`]).
unsafe extern "C" fn bio_send(ctx: *mut c_void, buf: *const u8, len: usize) -> c_int {
    // SAFETY: ctx was bound by with_bio and outlives this call; mbedTLS
    // serialises BIO calls within one engine call.
    let link = unsafe { &mut **(ctx as *mut LinkRef<'_>) };
    // SAFETY: mbedTLS hands us `len` readable bytes.
    let data = unsafe { core::slice::from_raw_parts(buf, len) };
    match link.send(data) {
        Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
        Err(BioError::WouldBlock | BioError::Timeout) => MBEDTLS_ERR_SSL_WANT_WRITE,
        Err(BioError::Closed) => ERR_NET_CONN_RESET,
        Err(BioError::Failed) => ERR_NET_SEND_FAILED,
    }
}

/// mbedTLS receive-with-timeout BIO callback.  `timeout_ms == 0` waits
/// indefinitely.
///
/// # Safety
///
/// Same invariants as `bio_send`.
unsafe extern "C" fn bio_recv_timeout(
    ctx: *mut c_void,
    buf: *mut u8,
    len: usize,
    timeout_ms: u32,
) -> c_int {
    // SAFETY: see bio_send.
    let link = unsafe { &mut **(ctx as *mut LinkRef<'_>) };
    // SAFETY: mbedTLS hands us `len` writable bytes.
    let out = unsafe { core::slice::from_raw_parts_mut(buf, len) };
    match link.receive(out, Duration::from_millis(u64::from(timeout_ms))) {
        Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
        Err(BioError::WouldBlock) => MBEDTLS_ERR_SSL_WANT_READ,
        Err(BioError::Timeout) => MBEDTLS_ERR_SSL_TIMEOUT,
        Err(BioError::Closed) => ERR_NET_CONN_RESET,
        Err(BioError::Failed) => ERR_NET_RECV_FAILED,
    }
}

/// Entropy source callback.
///
/// # Safety
///
/// `data` must point to the `Box<dyn EntropyPoll + Send>` owned by the engine.
unsafe extern "C" fn entropy_source(
    data: *mut c_void,
    output: *mut u8,
    len: usize,
    olen: *mut usize,
) -> c_int {
    // SAFETY: data is the heap slot registered in `seed`, freed only in `free`.
    let source = unsafe { &mut *(data as *mut Box<dyn EntropyPoll + Send>) };
    // SAFETY: mbedTLS hands us `len` writable bytes and a valid `olen`.
    let out = unsafe { core::slice::from_raw_parts_mut(output, len) };
    match source.poll(out) {
        Ok(n) => {
            unsafe { *olen = n };
            0
        }
        Err(_) => {
            unsafe { *olen = 0 };
            ERR_ENTROPY_SOURCE_FAILED
        }
    }
}

/// Certificate verification callback.  Diagnostic only: the flags are read,
/// never modified.
///
/// # Safety
///
/// `ctx` must point to the `VerifyCallback` slot owned by the engine.
unsafe extern "C" fn verify_hook(
    ctx: *mut c_void,
    crt: *mut mbedtls_x509_crt,
    depth: c_int,
    flags: *mut u32,
) -> c_int {
    // SAFETY: ctx is the boxed callback registered in `configure`.
    let callback = unsafe { *(ctx as *const VerifyCallback) };
    let mut info = [0u8; CERT_INFO_LEN];
    // SAFETY: buffer and prefix are valid; crt is provided by mbedTLS.
    let n = unsafe {
        mbedtls_x509_crt_info(
            info.as_mut_ptr() as *mut c_char,
            info.len() - 1,
            c"".as_ptr(),
            crt,
        )
    };
    let len = usize::try_from(n).unwrap_or(0).min(info.len() - 1);
    let text = core::str::from_utf8(&info[..len]).unwrap_or("<non-UTF-8 certificate info>");
    let cert = PeerCertificate {
        depth: u32::try_from(depth).unwrap_or(0),
        // SAFETY: flags is a valid pointer for the duration of the callback.
        flags: VerifyFlags(unsafe { *flags }),
        info: text,
    };
    callback(&cert);
    0
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// mbedTLS client engine (heap-allocated contexts).
pub struct MbedTlsEngine {
    ssl: Box<mbedtls_ssl_context>,
    conf: Box<mbedtls_ssl_config>,
    entropy: Box<mbedtls_entropy_context>,
    drbg: Box<mbedtls_ctr_drbg_context>,
    ca: Box<mbedtls_x509_crt>,
    own_cert: Box<mbedtls_x509_crt>,
    own_key: Box<mbedtls_pk_context>,
    source: Option<Box<Box<dyn EntropyPoll + Send>>>,
    verify_callback: Option<Box<VerifyCallback>>,
    live: bool,
}

// SAFETY: the engine is only ever used from one task at a time; mbedTLS
// contexts carry no thread affinity.
unsafe impl Send for MbedTlsEngine {}

impl Default for MbedTlsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MbedTlsEngine {
    pub fn new() -> Self {
        Self {
            ssl: Box::new(mbedtls_ssl_context::default()),
            conf: Box::new(mbedtls_ssl_config::default()),
            entropy: Box::new(mbedtls_entropy_context::default()),
            drbg: Box::new(mbedtls_ctr_drbg_context::default()),
            ca: Box::new(mbedtls_x509_crt::default()),
            own_cert: Box::new(mbedtls_x509_crt::default()),
            own_key: Box::new(mbedtls_pk_context::default()),
            source: None,
            verify_callback: None,
            live: false,
        }
    }

    /// Bind the BIO to `link` for the duration of `f`.
    fn with_bio<T>(
        &mut self,
        link: &mut dyn RawConnection,
        f: impl FnOnce(*mut mbedtls_ssl_context) -> T,
    ) -> T {
        let mut link_ref: LinkRef<'_> = link;
        let ctx = core::ptr::addr_of_mut!(link_ref) as *mut c_void;
        let ssl = self.ssl.as_mut() as *mut mbedtls_ssl_context;
        // SAFETY: ctx points to link_ref, which outlives the engine call in
        // `f`; the BIO is unbound before link_ref goes out of scope.
        unsafe {
            mbedtls_ssl_set_bio(ssl, ctx, Some(bio_send), None, Some(bio_recv_timeout));
        }
        let out = f(ssl);
        unsafe {
            mbedtls_ssl_set_bio(ssl, core::ptr::null_mut(), None, None, None);
        }
        out
    }
}

impl TlsEngine for MbedTlsEngine {
    fn init(&mut self) {
        // SAFETY: all pointers come from Box::as_mut(), valid and exclusively
        // owned.  init on a zeroed struct has no preconditions.
        unsafe {
            mbedtls_ssl_init(self.ssl.as_mut());
            mbedtls_ssl_config_init(self.conf.as_mut());
            mbedtls_ctr_drbg_init(self.drbg.as_mut());
            mbedtls_x509_crt_init(self.ca.as_mut());
            mbedtls_x509_crt_init(self.own_cert.as_mut());
            mbedtls_pk_init(self.own_key.as_mut());
            mbedtls_entropy_init(self.entropy.as_mut());
        }
        self.live = true;
    }

    fn seed(
        &mut self,
        entropy: Box<dyn EntropyPoll + Send>,
        personalization: &[u8],
    ) -> Result<(), EngineError> {
        let strong = entropy.is_strong();
        let slot = self.source.insert(Box::new(entropy));
        let data = slot.as_mut() as *mut Box<dyn EntropyPoll + Send> as *mut c_void;

        // SAFETY: `data` is a stable heap address kept alive until `free`.
        let rc = unsafe {
            mbedtls_entropy_add_source(
                self.entropy.as_mut(),
                Some(entropy_source),
                data,
                ENTROPY_THRESHOLD,
                if strong { MBEDTLS_ENTROPY_SOURCE_STRONG as c_int } else { 0 },
            )
        };
        check(rc, "entropy_add_source")?;

        // SAFETY: entropy and drbg are initialised and heap-pinned.
        let rc = unsafe {
            mbedtls_ctr_drbg_seed(
                self.drbg.as_mut(),
                Some(mbedtls_entropy_func),
                self.entropy.as_mut() as *mut _ as *mut c_void,
                personalization.as_ptr(),
                personalization.len(),
            )
        };
        check(rc, "ctr_drbg_seed")
    }

    fn parse_trust_anchor(&mut self, material: &[u8]) -> Result<(), EngineError> {
        // SAFETY: material is a valid slice; ca is initialised.
        let rc = unsafe { mbedtls_x509_crt_parse(self.ca.as_mut(), material.as_ptr(), material.len()) };
        check(rc, "x509_crt_parse(ca)")
    }

    fn parse_own_certificate(&mut self, material: &[u8]) -> Result<(), EngineError> {
        // SAFETY: as above.
        let rc = unsafe {
            mbedtls_x509_crt_parse(self.own_cert.as_mut(), material.as_ptr(), material.len())
        };
        check(rc, "x509_crt_parse(device)")
    }

    fn parse_private_key(&mut self, material: &[u8], passphrase: &[u8]) -> Result<(), EngineError> {
        let (pwd, pwd_len) = if passphrase.is_empty() {
            (core::ptr::null(), 0)
        } else {
            (passphrase.as_ptr(), passphrase.len())
        };
        // SAFETY: material/passphrase are valid slices; own_key is initialised.
        let rc = unsafe {
            mbedtls_pk_parse_key(
                self.own_key.as_mut(),
                material.as_ptr(),
                material.len(),
                pwd,
                pwd_len,
                Some(mbedtls_ctr_drbg_random),
                self.drbg.as_mut() as *mut _ as *mut c_void,
            )
        };
        check(rc, "pk_parse_key")
    }

    fn configure(&mut self, settings: &TlsSettings) -> Result<(), EngineError> {
        let conf = self.conf.as_mut() as *mut mbedtls_ssl_config;
        // The only role/transport/preset values are client, stream, default.
        // SAFETY: conf is initialised; every registered pointer (drbg, ca,
        // own cert/key, callback slot) is heap-pinned and lives until `free`.
        let rc = unsafe {
            mbedtls_ssl_config_defaults(
                conf,
                MBEDTLS_SSL_IS_CLIENT as _,
                MBEDTLS_SSL_TRANSPORT_STREAM as _,
                MBEDTLS_SSL_PRESET_DEFAULT as _,
            )
        };
        check(rc, "ssl_config_defaults")?;

        if let Some(callback) = settings.verify_callback {
            let slot = self.verify_callback.insert(Box::new(callback));
            let ctx = slot.as_mut() as *mut VerifyCallback as *mut c_void;
            unsafe { mbedtls_ssl_conf_verify(conf, Some(verify_hook), ctx) };
        }

        let authmode = match settings.auth_mode {
            AuthMode::Required => MBEDTLS_SSL_VERIFY_REQUIRED,
            AuthMode::Optional => MBEDTLS_SSL_VERIFY_OPTIONAL,
        };
        unsafe {
            mbedtls_ssl_conf_authmode(conf, authmode as _);
            mbedtls_ssl_conf_rng(
                conf,
                Some(mbedtls_ctr_drbg_random),
                self.drbg.as_mut() as *mut _ as *mut c_void,
            );
        }

        if settings.install_trust_anchors {
            unsafe { mbedtls_ssl_conf_ca_chain(conf, self.ca.as_mut(), core::ptr::null_mut()) };
        }
        if settings.install_own_certificate {
            let rc = unsafe {
                mbedtls_ssl_conf_own_cert(conf, self.own_cert.as_mut(), self.own_key.as_mut())
            };
            check(rc, "ssl_conf_own_cert")?;
        }

        self.set_read_timeout(settings.read_timeout);
        Ok(())
    }

    fn setup(&mut self, server_name: &str) -> Result<(), EngineError> {
        // SAFETY: ssl and conf are initialised; conf outlives ssl.
        let rc = unsafe { mbedtls_ssl_setup(self.ssl.as_mut(), self.conf.as_ref()) };
        check(rc, "ssl_setup")?;

        let name = CString::new(server_name).map_err(|_| {
            warn!("TLS(espidf): server name contains NUL");
            EngineError::Code(-1)
        })?;
        // SAFETY: name is NUL-terminated; mbedTLS copies it.
        let rc = unsafe { mbedtls_ssl_set_hostname(self.ssl.as_mut(), name.as_ptr()) };
        check(rc, "ssl_set_hostname")
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        // SAFETY: conf is initialised.
        unsafe { mbedtls_ssl_conf_read_timeout(self.conf.as_mut(), ms) };
        debug!("TLS(espidf): read timeout {} ms", ms);
    }

    fn handshake_step(&mut self, link: &mut dyn RawConnection) -> Result<(), EngineError> {
        // SAFETY: ssl is set up; the BIO is bound for this call only.
        let rc = self.with_bio(link, |ssl| unsafe { mbedtls_ssl_handshake(ssl) });
        if rc == 0 { Ok(()) } else { Err(engine_error(rc)) }
    }

    fn verify_result(&self) -> u32 {
        // SAFETY: ssl is initialised.
        unsafe { mbedtls_ssl_get_verify_result(self.ssl.as_ref()) }
    }

    fn negotiated(&self) -> Option<Negotiated> {
        // SAFETY: ssl is initialised; the returned strings are static.
        let (version, suite, expansion) = unsafe {
            let version = mbedtls_ssl_get_version(self.ssl.as_ref());
            let suite = mbedtls_ssl_get_ciphersuite(self.ssl.as_ref());
            if version.is_null() || suite.is_null() {
                return None;
            }
            (
                CStr::from_ptr(version),
                CStr::from_ptr(suite),
                mbedtls_ssl_get_record_expansion(self.ssl.as_ref()),
            )
        };
        let mut n = Negotiated {
            protocol: heapless::String::new(),
            ciphersuite: heapless::String::new(),
            record_expansion: usize::try_from(expansion).ok(),
        };
        let _ = n.protocol.push_str(version.to_str().unwrap_or("?"));
        let _ = n.ciphersuite.push_str(suite.to_str().unwrap_or("?"));
        Some(n)
    }

    fn write(&mut self, link: &mut dyn RawConnection, data: &[u8]) -> Result<usize, EngineError> {
        // SAFETY: data is a valid slice; the BIO is bound for this call only.
        let rc = self.with_bio(link, |ssl| unsafe {
            mbedtls_ssl_write(ssl, data.as_ptr(), data.len())
        });
        usize::try_from(rc).map_err(|_| engine_error(rc))
    }

    fn read(&mut self, link: &mut dyn RawConnection, buf: &mut [u8]) -> Result<usize, EngineError> {
        // SAFETY: buf is a valid mutable slice; the BIO is bound for this call.
        let rc = self.with_bio(link, |ssl| unsafe {
            mbedtls_ssl_read(ssl, buf.as_mut_ptr(), buf.len())
        });
        usize::try_from(rc).map_err(|_| engine_error(rc))
    }

    fn close_notify(&mut self, link: &mut dyn RawConnection) -> Result<(), EngineError> {
        let rc = self.with_bio(link, |ssl| unsafe { mbedtls_ssl_close_notify(ssl) });
        if rc == 0 { Ok(()) } else { Err(engine_error(rc)) }
    }

    fn free(&mut self) {
        if !self.live {
            return;
        }
        // SAFETY: every context was initialised in `init` and is freed
        // exactly once here (guarded by `live`).
        unsafe {
            mbedtls_x509_crt_free(self.own_cert.as_mut());
            mbedtls_x509_crt_free(self.ca.as_mut());
            mbedtls_pk_free(self.own_key.as_mut());
            mbedtls_ssl_free(self.ssl.as_mut());
            mbedtls_ssl_config_free(self.conf.as_mut());
            mbedtls_ctr_drbg_free(self.drbg.as_mut());
            mbedtls_entropy_free(self.entropy.as_mut());
        }
        self.source = None;
        self.verify_callback = None;
        self.live = false;
    }
}

impl Drop for MbedTlsEngine {
    fn drop(&mut self) {
        self.free();
    }
}
