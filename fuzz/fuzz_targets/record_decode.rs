//! Persisted records come from disk and may be anything.
//! Decoding must never panic, and whatever it accepts must re-encode to
//! the same bytes.

#![no_main]

use helm_state::{codec, DecodeLimits};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let limits = DecodeLimits::default();
    if let Ok(state) = codec::decode(data, &limits) {
        assert!(state.verify());
        assert_eq!(&codec::encode(&state)[..], data);
    }
});
