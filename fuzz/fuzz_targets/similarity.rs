//! Fuzz harness for the edit-distance similarity ratio.

#![no_main]
use guarddog_core::{edit_distance, similarity};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (&str, &str)| {
    let (a, b) = input;
    let s = similarity(a, b);
    assert!((0.0..=1.0).contains(&s));
    assert_eq!(s, similarity(b, a));
    assert!(edit_distance(a, b) <= a.chars().count().max(b.chars().count()));
});
