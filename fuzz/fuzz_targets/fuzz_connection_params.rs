//! Fuzz target: `ConnectionParameters::from_bytes`
//!
//! Persisted parameters come back from NVS, which may hold a blob written by
//! an older firmware or torn by a power cut.
//!
//! Invariants checked:
//! - No panics under any byte sequence
//! - Anything that decodes also passes `validate()`
//! - Decoded parameters re-encode to a blob that decodes to the same value
//!
//! cargo fuzz run fuzz_connection_params

#![no_main]

use iotls::ConnectionParameters;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(params) = ConnectionParameters::from_bytes(data) else {
        return;
    };
    assert!(params.validate().is_ok(), "decoded parameters must be valid");

    let bytes = params.to_bytes().expect("valid parameters must encode");
    let again = ConnectionParameters::from_bytes(&bytes).expect("re-encoded blob must decode");
    assert_eq!(params, again);
});
