//! The adapter over a real loopback socket, with the scripted engine.

use std::net::TcpListener;
use std::rc::Rc;
use std::time::{Duration, Instant};

use iotls::adapters::tcp::TcpTransport;
use iotls::adapters::time::MonotonicClock;
use iotls::config::ConnectionParameters;
use iotls::transport::SecureTransport;
use iotls::{IoError, Verification};
use rand::SeedableRng;

use crate::mock_tls::*;

#[test]
fn write_to_stalled_peer_times_out_within_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = SharedEngine::default();
    let mut sta = SecureTransport::new(
        MockEngine::new(Rc::clone(&engine)),
        TcpTransport::new(Duration::from_secs(2)),
        MockStore::provisioned(),
        TestRng::seed_from_u64(3),
        MonotonicClock::new(),
    );
    let params = ConnectionParameters::new("127.0.0.1", port)
        .unwrap()
        .with_root_ca("ca.pem")
        .unwrap();
    assert_eq!(sta.connect(&params), Ok(Verification::Verified));
    // Accepted but never read from.
    let _peer = listener.accept().unwrap();

    let payload = vec![0x5Au8; 32 * 1024 * 1024];
    let started = Instant::now();
    let result = sta.write(&payload, Duration::from_millis(300));
    let elapsed = started.elapsed();

    match result {
        Err(IoError::WriteTimeout(n)) => assert!(n < payload.len()),
        other => panic!("expected WriteTimeout, got {other:?}"),
    }
    assert!(elapsed < Duration::from_secs(2), "write overran its deadline: {elapsed:?}");
    assert!(sta.is_connected());

    sta.destroy();
    assert!(engine.borrow().balanced());
}
