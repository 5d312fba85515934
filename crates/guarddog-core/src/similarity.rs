//! Edit-distance similarity.
//!
//! Pure functions over Unicode scalar values. Callers are expected to pass
//! normalized text (see [`crate::normalize`]).

/// Levenshtein distance with unit costs.
///
/// Uses two rolling rows sized by the shorter input, so memory is
/// `O(min(|a|, |b|))`.
#[must_use]
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let (long, short) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };
    if short.is_empty() {
        return long.len();
    }

    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut curr = vec![0; short.len() + 1];

    for (i, lc) in long.iter().enumerate() {
        curr[0] = i + 1;
        for (j, sc) in short.iter().enumerate() {
            let cost = usize::from(lc != sc);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[short.len()]
}

/// Similarity in `[0, 1]`.
///
/// `1.0` for identical inputs (including two empty strings), `0.0` when only
/// one is empty, otherwise `1 - distance / max_len`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    1.0 - edit_distance(a, b) as f64 / max_len as f64
}
