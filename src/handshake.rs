//! Handshake driver: from an idle session to an established channel.
//!
//! Phases run strictly in order; each one records itself in the session
//! state before touching anything, so a failure is always attributed to the
//! phase that raised it:
//!
//! 1. **Seeding**: init every engine sub-object, register the entropy bridge
//!    as a strong source, seed the DRBG with [`PERSONALIZATION`].
//! 2. **LoadingTrust**: parse the root CA, if one was named.  Without one the
//!    peer check is skipped for this session.
//! 3. **LoadingIdentity**: parse the device certificate, then its key (empty
//!    passphrase).  The key is only looked up when a certificate is named.
//! 4. **TransportConnecting**: open the raw connection to `host:port`.
//! 5. **ConfiguringTls**: client role, stream transport, default preset,
//!    diagnostic verify callback, auth mode, trust anchors, own identity,
//!    handshake read timeout; then bind the context and set the server name.
//! 6. **Handshaking**: step the engine until done.  Only `WantRead` and
//!    `WantWrite` are retried, until the handshake timeout elapses.
//! 7. **VerifyingPeer**: a non-zero verification bitmask is fatal.
//!
//! On success the record read timeout drops to the steady-state value.

use core::time::Duration;

use log::{debug, info, warn};
use rand_core::{CryptoRng, RngCore};

use crate::config::{ConnectionParameters, STEADY_STATE_READ_TIMEOUT_MS};
use crate::entropy::EntropyBridge;
use crate::error::{ConnectError, HandshakeFailure};
use crate::identity::IdentityLoader;
use crate::ports::{CertificateStore, Clock, RawConnection, RawTransport};
use crate::session::{Phase, Session, SessionState, SkipReason, Verification};
use crate::timed_io::Deadline;
use crate::tls::{
    AuthMode, EngineError, Preset, Role, TlsEngine, TlsSettings, TransportKind, VerifyFlags,
    log_peer_certificate,
};

/// DRBG personalization string.
pub const PERSONALIZATION: &[u8] = b"iotls_secure_transport";

/// Run every phase on `session`.
///
/// On failure the session is left in [`SessionState::Failed`] with whatever
/// it acquired so far; the caller must `destroy()` it.
pub fn connect<E, N, S, R, K>(
    session: &mut Session<E, N::Connection>,
    transport: &mut N,
    store: &S,
    entropy: R,
    clock: &K,
    params: &ConnectionParameters,
) -> Result<Verification, ConnectError>
where
    E: TlsEngine,
    N: RawTransport,
    S: CertificateStore,
    R: RngCore + CryptoRng + Send + 'static,
    K: Clock,
{
    match drive(session, transport, store, entropy, clock, params) {
        Ok(verification) => {
            session.state = SessionState::Established { verification };
            Ok(verification)
        }
        Err(reason) => {
            let phase = match session.state {
                SessionState::Connecting(phase) => phase,
                _ => Phase::Seeding,
            };
            warn!("STA: connect to {}:{} failed in {}: {}", params.host, params.port, phase, reason);
            session.state = SessionState::Failed { phase, reason };
            Err(reason)
        }
    }
}

fn enter<E: TlsEngine, C: RawConnection>(session: &mut Session<E, C>, phase: Phase) {
    debug!("STA: {}", phase);
    session.state = SessionState::Connecting(phase);
}

fn drive<E, N, S, R, K>(
    session: &mut Session<E, N::Connection>,
    transport: &mut N,
    store: &S,
    entropy: R,
    clock: &K,
    params: &ConnectionParameters,
) -> Result<Verification, ConnectError>
where
    E: TlsEngine,
    N: RawTransport,
    S: CertificateStore,
    R: RngCore + CryptoRng + Send + 'static,
    K: Clock,
{
    // ── Seeding ─────────────────────────────────────────────────
    enter(session, Phase::Seeding);
    session.init_engine();
    session
        .engine
        .seed(Box::new(EntropyBridge::new(entropy)), PERSONALIZATION)
        .map_err(|e| {
            warn!("STA: DRBG seed failed ({})", e);
            ConnectError::EntropySeedFailed
        })?;

    let mut loader = IdentityLoader::new(store);

    // ── LoadingTrust ────────────────────────────────────────────
    enter(session, Phase::LoadingTrust);
    let has_trust_anchor = match params.root_ca.as_deref() {
        Some(name) => {
            let ca = loader.load(name).map_err(|e| {
                warn!("STA: root CA '{}': {}", name, e);
                ConnectError::RootCertParseError
            })?;
            session.engine.parse_trust_anchor(ca.parse_input()).map_err(|e| {
                warn!("STA: root CA '{}' parse failed ({})", name, e);
                ConnectError::RootCertParseError
            })?;
            true
        }
        None => {
            info!("STA: no root CA supplied, peer verification disabled");
            false
        }
    };
    let verification = match (has_trust_anchor, params.verify_peer) {
        (true, true) => Verification::Verified,
        (true, false) => {
            warn!("STA: root CA loaded but verification turned off by caller");
            Verification::Skipped(SkipReason::CallerDisabled)
        }
        (false, _) => Verification::Skipped(SkipReason::NoTrustAnchor),
    };
    session.verify_peer = verification.is_verified();

    // ── LoadingIdentity ─────────────────────────────────────────
    enter(session, Phase::LoadingIdentity);
    let has_identity = match params.device_cert.as_deref() {
        Some(cert_name) => {
            let cert = loader.load(cert_name).map_err(|e| {
                warn!("STA: device cert '{}': {}", cert_name, e);
                ConnectError::DeviceCertParseError
            })?;
            session
                .engine
                .parse_own_certificate(cert.parse_input())
                .map_err(|e| {
                    warn!("STA: device cert '{}' parse failed ({})", cert_name, e);
                    ConnectError::DeviceCertParseError
                })?;

            let Some(key_name) = params.device_key.as_deref() else {
                warn!("STA: device cert '{}' has no matching key reference", cert_name);
                return Err(ConnectError::PrivateKeyParseError);
            };
            let key = loader.load(key_name).map_err(|e| {
                warn!("STA: device key '{}': {}", key_name, e);
                ConnectError::PrivateKeyParseError
            })?;
            debug!("STA: device key '{}' ({}B)", key_name, key.len());
            session
                .engine
                .parse_private_key(key.parse_input(), b"")
                .map_err(|e| {
                    warn!("STA: device key '{}' parse failed ({})", key_name, e);
                    ConnectError::PrivateKeyParseError
                })?;
            true
        }
        None => {
            if let Some(key_name) = params.device_key.as_deref() {
                warn!("STA: device key '{}' ignored without a device cert", key_name);
            }
            false
        }
    };

    // ── TransportConnecting ─────────────────────────────────────
    enter(session, Phase::TransportConnecting);
    let link = transport.connect(&params.host, params.port).map_err(|e| {
        warn!("STA: transport to {}:{}: {}", params.host, params.port, e);
        ConnectError::TransportConnectFailed(e)
    })?;
    session.link = Some(link);

    // ── ConfiguringTls ──────────────────────────────────────────
    enter(session, Phase::ConfiguringTls);
    let settings = TlsSettings {
        role: Role::Client,
        transport: TransportKind::Stream,
        preset: Preset::Default,
        auth_mode: if session.verify_peer {
            AuthMode::Required
        } else {
            AuthMode::Optional
        },
        install_trust_anchors: has_trust_anchor,
        install_own_certificate: has_identity,
        read_timeout: params.handshake_timeout(),
        verify_callback: Some(log_peer_certificate),
    };
    session.engine.configure(&settings).map_err(|e| {
        warn!("STA: TLS configuration failed ({})", e);
        ConnectError::ConfigurationError
    })?;
    session.engine.setup(&params.host).map_err(|e| {
        warn!("STA: TLS setup failed ({})", e);
        ConnectError::ConfigurationError
    })?;

    // ── Handshaking ─────────────────────────────────────────────
    enter(session, Phase::Handshaking);
    let deadline = Deadline::after(clock, params.handshake_timeout());
    let Some(link) = session.link.as_mut() else {
        return Err(ConnectError::ConfigurationError);
    };
    let mut steps = 0u32;
    loop {
        steps += 1;
        match session.engine.handshake_step(link) {
            Ok(()) => break,
            Err(e) if e.is_would_block() => {
                if deadline.has_expired(clock) {
                    warn!("STA: handshake still pending after {} steps", steps);
                    return Err(HandshakeFailure::TimedOut.into());
                }
            }
            Err(EngineError::Timeout) => return Err(HandshakeFailure::TimedOut.into()),
            Err(EngineError::CertVerifyFailed) => {
                let flags = if session.verify_peer {
                    session.engine.verify_result()
                } else {
                    0
                };
                session.verify_flags = flags;
                warn!("STA: peer certificate rejected: {}", VerifyFlags(flags));
                return Err(HandshakeFailure::PeerVerificationFailed(flags).into());
            }
            Err(e) => return Err(HandshakeFailure::Protocol(e).into()),
        }
    }
    debug!("STA: handshake complete after {} steps", steps);

    // ── VerifyingPeer ───────────────────────────────────────────
    enter(session, Phase::VerifyingPeer);
    if session.verify_peer {
        let flags = session.engine.verify_result();
        session.verify_flags = flags;
        if flags != 0 {
            warn!("STA: peer verification failed: {}", VerifyFlags(flags));
            return Err(HandshakeFailure::PeerVerificationFailed(flags).into());
        }
        debug!("STA: peer certificate verified");
    }

    session
        .engine
        .set_read_timeout(Duration::from_millis(u64::from(STEADY_STATE_READ_TIMEOUT_MS)));

    match session.engine.negotiated() {
        Some(n) => info!(
            "STA: established {}:{} ({}, {}{})",
            params.host,
            params.port,
            n.protocol,
            n.ciphersuite,
            if verification.is_verified() { "" } else { ", UNVERIFIED" }
        ),
        None => info!(
            "STA: established {}:{}{}",
            params.host,
            params.port,
            if verification.is_verified() { "" } else { " (UNVERIFIED)" }
        ),
    }
    Ok(verification)
}
