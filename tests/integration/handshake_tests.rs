//! Integration tests for the connect() phases, one failure per phase.

use std::time::Duration;

use iotls::error::TransportConnectError;
use iotls::session::{Phase, SessionState, SkipReason, Verification};
use iotls::tls::{AuthMode, EngineError, Role, TransportKind, VerifyFlags};
use iotls::{ConnectError, HandshakeFailure};

use crate::mock_tls::*;

/// Assert the session failed in `phase` with `reason`, then tear it down and
/// check that nothing leaked.
fn assert_failed_and_released<R>(mut h: Harness<R>, phase: Phase, reason: ConnectError)
where
    R: rand_core::RngCore + rand_core::CryptoRng + Send + 'static,
{
    assert_eq!(h.sta.session().state(), SessionState::Failed { phase, reason });
    assert!(!h.sta.is_connected());

    h.sta.destroy();
    h.sta.destroy();
    assert_eq!(h.sta.session().state(), SessionState::Closed);
    assert!(!h.sta.session().holds_resources());
    {
        let engine = h.engine.borrow();
        assert_eq!(engine.init, 1);
        assert!(engine.balanced(), "engine ledger unbalanced: {:?}", engine);
    }
    let link = h.link.borrow();
    assert!(link.released());
    assert_eq!(link.closed, link.opened);
}

// ── Success paths ─────────────────────────────────────────────

#[test]
fn server_auth_only_connects_verified() {
    let mut h = Harness::new(MockStore::new().with("ca.pem", CA_PEM));

    let outcome = h.sta.connect(&server_auth_params());

    assert_eq!(outcome, Ok(Verification::Verified));
    assert!(h.sta.is_connected());
    assert!(h.sta.session().verify_peer());
    assert_eq!(h.sta.session().verification(), Some(Verification::Verified));

    let engine = h.engine.borrow();
    assert_eq!(engine.trust_anchors, 1);
    assert_eq!(engine.own_certs, 0);
    assert_eq!(engine.keys, 0);
    assert_eq!(engine.verify_result_calls, 1);
    assert_eq!(engine.server_name.as_deref(), Some("broker.example"));
    let link = h.link.borrow();
    assert_eq!(link.connected_to, vec![("broker.example".to_owned(), 8883)]);
}

#[test]
fn established_session_moves_application_data() {
    let mut h = Harness::new(MockStore::new().with("ca.pem", CA_PEM));
    h.sta.connect(&server_auth_params()).unwrap();

    let publish = b"\x30\x0d\x00\x04test/topichello";
    assert_eq!(h.sta.write(publish, Duration::from_secs(1)), Ok(publish.len()));
    assert_eq!(h.link.borrow().sent_bytes(), publish.to_vec());

    h.link
        .borrow_mut()
        .recv_script
        .push_back(RecvStep::Data(vec![0x20, 0x02, 0x00, 0x00]));
    let mut connack = [0u8; 4];
    assert_eq!(h.sta.read(&mut connack, Duration::from_secs(1)), Ok(4));
    assert_eq!(connack, [0x20, 0x02, 0x00, 0x00]);
}

#[test]
fn mutual_auth_parses_identity_and_configures_client() {
    let h = Harness::established();

    let engine = h.engine.borrow();
    assert_eq!(engine.own_certs, 1);
    assert_eq!(engine.keys, 1);
    assert!(engine.entropy_polled > 0, "DRBG must be seeded from the entropy source");

    let settings = engine.settings.expect("configure() must run");
    assert_eq!(settings.role, Role::Client);
    assert_eq!(settings.transport, TransportKind::Stream);
    assert_eq!(settings.auth_mode, AuthMode::Required);
    assert!(settings.install_trust_anchors);
    assert!(settings.install_own_certificate);
    assert!(settings.verify_callback.is_some());
}

#[test]
fn read_timeout_drops_to_steady_state_after_handshake() {
    let h = Harness::established();

    let engine = h.engine.borrow();
    assert_eq!(
        engine.read_timeouts,
        vec![Duration::from_millis(5_000), Duration::from_millis(10)]
    );
}

#[test]
fn handshake_retries_want_read_and_want_write() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine.borrow_mut().handshake_script.extend([
        Err(EngineError::WantWrite),
        Err(EngineError::WantRead),
        Err(EngineError::WantRead),
    ]);

    assert_eq!(h.sta.connect(&mutual_params()), Ok(Verification::Verified));
    assert_eq!(h.engine.borrow().handshake_steps, 4);
}

#[test]
fn no_root_ca_skips_verification_entirely() {
    let mut h = Harness::new(MockStore::new());
    let params = iotls::ConnectionParameters::new("broker.example", 8883).unwrap();

    let outcome = h.sta.connect(&params);

    assert_eq!(outcome, Ok(Verification::Skipped(SkipReason::NoTrustAnchor)));
    assert!(!h.sta.session().verify_peer());
    let engine = h.engine.borrow();
    assert_eq!(engine.verify_result_calls, 0);
    let settings = engine.settings.unwrap();
    assert_eq!(settings.auth_mode, AuthMode::Optional);
    assert!(!settings.install_trust_anchors);
}

#[test]
fn no_root_ca_ignores_nonzero_verification_flags() {
    let mut h = Harness::new(MockStore::new());
    h.engine.borrow_mut().verify_flags = VerifyFlags::NOT_TRUSTED;
    let params = iotls::ConnectionParameters::new("broker.example", 8883).unwrap();

    assert!(h.sta.connect(&params).is_ok());
    assert_eq!(h.engine.borrow().verify_result_calls, 0);
}

#[test]
fn caller_can_disable_verification_with_root_ca() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine.borrow_mut().verify_flags = VerifyFlags::EXPIRED;
    let params = mutual_params().with_verify_peer(false);

    let outcome = h.sta.connect(&params);

    assert_eq!(outcome, Ok(Verification::Skipped(SkipReason::CallerDisabled)));
    let engine = h.engine.borrow();
    assert_eq!(engine.trust_anchors, 1);
    assert_eq!(engine.verify_result_calls, 0);
    assert_eq!(engine.settings.unwrap().auth_mode, AuthMode::Optional);
}

#[test]
fn key_without_certificate_is_ignored() {
    let mut h = Harness::new(MockStore::provisioned());
    let mut params = server_auth_params();
    params.device_key = Some("device.key".try_into().unwrap());

    assert_eq!(h.sta.connect(&params), Ok(Verification::Verified));
    let engine = h.engine.borrow();
    assert_eq!(engine.keys, 0);
    assert!(!engine.settings.unwrap().install_own_certificate);
}

// ── One failure per phase ─────────────────────────────────────

#[test]
fn seeding_fails_when_trng_faults() {
    let mut h = Harness::with_rng(MockStore::provisioned(), FailingRng);

    let outcome = h.sta.connect(&mutual_params());

    assert_eq!(outcome, Err(ConnectError::EntropySeedFailed));
    assert_eq!(h.link.borrow().opened, 0);
    assert_failed_and_released(h, Phase::Seeding, ConnectError::EntropySeedFailed);
}

#[test]
fn seeding_fails_when_drbg_rejects_seed() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine.borrow_mut().fail_at = Some(EngineStep::Seed);

    assert_eq!(h.sta.connect(&mutual_params()), Err(ConnectError::EntropySeedFailed));
    assert_failed_and_released(h, Phase::Seeding, ConnectError::EntropySeedFailed);
}

#[test]
fn unparsable_root_ca_fails_loading_trust() {
    let mut h = Harness::new(MockStore::provisioned().with("ca.pem", GARBAGE));

    assert_eq!(h.sta.connect(&mutual_params()), Err(ConnectError::RootCertParseError));
    assert_eq!(h.engine.borrow().own_certs, 0);
    assert_failed_and_released(h, Phase::LoadingTrust, ConnectError::RootCertParseError);
}

#[test]
fn missing_root_ca_fails_loading_trust() {
    let mut h = Harness::new(MockStore::new());

    assert_eq!(h.sta.connect(&server_auth_params()), Err(ConnectError::RootCertParseError));
    assert_failed_and_released(h, Phase::LoadingTrust, ConnectError::RootCertParseError);
}

#[test]
fn pem_root_ca_reaches_parser_with_terminator() {
    // The mock parser rejects PEM without its NUL, so a pass here means the
    // loader appended it.
    let mut h = Harness::new(MockStore::new().with("ca.pem", CA_PEM));
    assert!(h.sta.connect(&server_auth_params()).is_ok());
    assert_eq!(h.engine.borrow().trust_anchors, 1);
}

#[test]
fn unparsable_device_cert_fails_loading_identity() {
    let mut h = Harness::new(MockStore::provisioned().with("device.crt", GARBAGE));

    assert_eq!(h.sta.connect(&mutual_params()), Err(ConnectError::DeviceCertParseError));
    assert_eq!(h.engine.borrow().keys, 0);
    assert_failed_and_released(h, Phase::LoadingIdentity, ConnectError::DeviceCertParseError);
}

#[test]
fn unparsable_key_fails_loading_identity() {
    let mut h = Harness::new(MockStore::provisioned().with("device.key", GARBAGE));

    assert_eq!(h.sta.connect(&mutual_params()), Err(ConnectError::PrivateKeyParseError));
    assert_failed_and_released(h, Phase::LoadingIdentity, ConnectError::PrivateKeyParseError);
}

#[test]
fn certificate_without_key_fails_loading_identity() {
    let mut h = Harness::new(MockStore::provisioned());
    let mut params = mutual_params();
    params.device_key = None;

    assert_eq!(h.sta.connect(&params), Err(ConnectError::PrivateKeyParseError));
    assert_failed_and_released(h, Phase::LoadingIdentity, ConnectError::PrivateKeyParseError);
}

#[test]
fn unknown_host_fails_transport_connecting() {
    let mut h = Harness::new(MockStore::provisioned());
    h.link.borrow_mut().connect_error = Some(TransportConnectError::HostUnknown);
    let reason = ConnectError::TransportConnectFailed(TransportConnectError::HostUnknown);

    assert_eq!(h.sta.connect(&mutual_params()), Err(reason));
    assert!(!reason.is_trust_failure());
    assert_failed_and_released(h, Phase::TransportConnecting, reason);
}

#[test]
fn configure_failure_fails_configuring_tls() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine.borrow_mut().fail_at = Some(EngineStep::Configure);

    assert_eq!(h.sta.connect(&mutual_params()), Err(ConnectError::ConfigurationError));
    assert_eq!(h.link.borrow().opened, 1);
    assert_failed_and_released(h, Phase::ConfiguringTls, ConnectError::ConfigurationError);
}

#[test]
fn setup_failure_fails_configuring_tls() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine.borrow_mut().fail_at = Some(EngineStep::Setup);

    assert_eq!(h.sta.connect(&mutual_params()), Err(ConnectError::ConfigurationError));
    assert_failed_and_released(h, Phase::ConfiguringTls, ConnectError::ConfigurationError);
}

#[test]
fn protocol_error_fails_handshaking() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine
        .borrow_mut()
        .handshake_script
        .extend([Err(EngineError::WantRead), Err(EngineError::Code(-0x7780))]);
    let reason: ConnectError = HandshakeFailure::Protocol(EngineError::Code(-0x7780)).into();

    assert_eq!(h.sta.connect(&mutual_params()), Err(reason));
    assert_failed_and_released(h, Phase::Handshaking, reason);
}

#[test]
fn stalled_handshake_times_out() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine.borrow_mut().handshake_stalls = true;
    let params = mutual_params()
        .with_handshake_timeout(Duration::from_millis(200))
        .unwrap();
    let reason: ConnectError = HandshakeFailure::TimedOut.into();

    assert_eq!(h.sta.connect(&params), Err(reason));
    // The step clock advances 1 ms per reading.
    assert!(h.engine.borrow().handshake_steps >= 100);
    assert_failed_and_released(h, Phase::Handshaking, reason);
}

#[test]
fn record_read_timeout_fails_handshaking() {
    let mut h = Harness::new(MockStore::provisioned());
    h.engine
        .borrow_mut()
        .handshake_script
        .push_back(Err(EngineError::Timeout));
    let reason: ConnectError = HandshakeFailure::TimedOut.into();

    assert_eq!(h.sta.connect(&mutual_params()), Err(reason));
    assert_failed_and_released(h, Phase::Handshaking, reason);
}

#[test]
fn rejected_chain_during_handshake_reports_flags() {
    let mut h = Harness::new(MockStore::provisioned());
    {
        let mut engine = h.engine.borrow_mut();
        engine.verify_flags = VerifyFlags::CN_MISMATCH;
        engine
            .handshake_script
            .push_back(Err(EngineError::CertVerifyFailed));
    }
    let reason: ConnectError =
        HandshakeFailure::PeerVerificationFailed(VerifyFlags::CN_MISMATCH).into();

    assert_eq!(h.sta.connect(&mutual_params()), Err(reason));
    assert!(reason.is_trust_failure());
    assert_eq!(h.sta.session().verify_flags(), VerifyFlags::CN_MISMATCH);
    assert_failed_and_released(h, Phase::Handshaking, reason);
}

#[test]
fn nonzero_verification_bitmask_fails_verifying_peer() {
    let mut h = Harness::new(MockStore::provisioned());
    let flags = VerifyFlags::NOT_TRUSTED | VerifyFlags::EXPIRED;
    h.engine.borrow_mut().verify_flags = flags;
    let reason: ConnectError = HandshakeFailure::PeerVerificationFailed(flags).into();

    assert_eq!(h.sta.connect(&mutual_params()), Err(reason));
    assert!(reason.is_trust_failure());
    assert_eq!(h.engine.borrow().verify_result_calls, 1);
    assert_failed_and_released(h, Phase::VerifyingPeer, reason);
}

#[test]
fn every_phase_name_appears_in_failure_state() {
    let rendered: Vec<String> = Phase::ALL.iter().map(ToString::to_string).collect();
    assert_eq!(
        rendered,
        [
            "Seeding",
            "LoadingTrust",
            "LoadingIdentity",
            "TransportConnecting",
            "ConfiguringTLS",
            "Handshaking",
            "VerifyingPeer",
        ]
    );
}
