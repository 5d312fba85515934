//! `guarddog similarity`

use guarddog_core::normalize::{normalize, normalize_light};
use guarddog_core::{edit_distance, similarity};

/// Prints how both content filters see the pair.
pub fn run(a: &str, b: &str) {
    print_pair("light", &normalize_light(a), &normalize_light(b));
    print_pair("full", &normalize(a), &normalize(b));
}

fn print_pair(kind: &str, a: &str, b: &str) {
    println!("{kind}: {a:?} vs {b:?}");
    println!(
        "  distance={} similarity={:.3}",
        edit_distance(a, b),
        similarity(a, b)
    );
}
