//! Fuzz harness for message normalization and the risk signals.
//!
//! Arbitrary bytes are lossily decoded and pushed through both normalizers
//! and every raw-text signal. Nothing may panic, and both canonical forms
//! must come out trimmed.

#![no_main]
use guarddog_core::normalize::{normalize, normalize_light};
use guarddog_core::risk::signals::{
    Penalties, caps_penalty, invisible_penalty, repetition_penalty, separator_penalty, substitution_penalty,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);

    let full = normalize(&raw);
    assert_eq!(full.trim(), full);
    let light = normalize_light(&raw);
    assert_eq!(light.trim(), light);

    let penalties = Penalties::default();
    let _ = caps_penalty(&raw);
    let _ = repetition_penalty(&raw, &penalties);
    let _ = separator_penalty(&raw);
    let _ = invisible_penalty(&raw, &penalties);
    let _ = substitution_penalty(&raw, &penalties);
});
