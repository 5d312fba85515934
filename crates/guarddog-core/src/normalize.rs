//! Message normalization.
//!
//! Produces the canonical form used for similarity comparison. The output is
//! never shown to users.
//!
//! Two variants exist:
//!
//! - [`normalize`]: the full pipeline used by the risk scorer (markup
//!   stripping, lowercase, NFKC, confusable folding, separator removal,
//!   whitespace collapsing).
//! - [`normalize_light`]: the cheaper pipeline used by the similarity filter
//!   (markup stripping, lowercase, whitespace collapsing, leetspeak folding).
//!
//! Both map empty input to the empty string and never fail: a confusable
//! folder error falls back to the pre-folding text.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Longest input the built-in [`SkeletonTable`] will fold.
pub const MAX_SKELETON_INPUT_CHARS: usize = 4_096;

/// Punctuation removed after confusable folding.
const STRIPPED_PUNCTUATION: &[char] = &[
    '_', '-', '.', ',', ';', ':', '!', '?', '(', ')', '[', ']', '{', '}',
];

/// Error returned by a [`ConfusableFolder`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkeletonError {
    /// Input exceeds the folder's size limit.
    #[error("input too long for skeleton folding: {len} chars (max {max})")]
    InputTooLong {
        /// Input length in chars.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The folder could not process the input.
    #[error("skeleton folding failed: {0}")]
    Failed(String),
}

/// Maps homoglyphs to a representative skeleton.
pub trait ConfusableFolder: Send + Sync {
    /// Folds `input` to its skeleton.
    ///
    /// # Errors
    ///
    /// Implementations may refuse input they cannot process; callers fall
    /// back to the unfolded text.
    fn skeleton(&self, input: &str) -> Result<String, SkeletonError>;
}

/// Table-driven folder for the Cyrillic and Greek look-alikes most often used
/// to dodge chat filters.
///
/// Runs after lowercasing, so only lowercase forms are mapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkeletonTable;

impl ConfusableFolder for SkeletonTable {
    fn skeleton(&self, input: &str) -> Result<String, SkeletonError> {
        let len = input.chars().count();
        if len > MAX_SKELETON_INPUT_CHARS {
            return Err(SkeletonError::InputTooLong {
                len,
                max: MAX_SKELETON_INPUT_CHARS,
            });
        }
        Ok(input
            .chars()
            .map(|c| confusable_to_latin(c).unwrap_or(c))
            .collect())
    }
}

fn confusable_to_latin(c: char) -> Option<char> {
    cyrillic_to_latin(c).or_else(|| greek_to_latin(c))
}

fn cyrillic_to_latin(c: char) -> Option<char> {
    match c {
        '\u{0430}' => Some('a'), // а
        '\u{0432}' => Some('b'), // в
        '\u{0441}' => Some('c'), // с
        '\u{0501}' => Some('d'), // ԁ
        '\u{0435}' => Some('e'), // е
        '\u{04BB}' => Some('h'), // һ
        '\u{0456}' => Some('i'), // і
        '\u{0458}' => Some('j'), // ј
        '\u{043A}' => Some('k'), // к
        '\u{04CF}' => Some('l'), // ӏ
        '\u{043C}' => Some('m'), // м
        '\u{043D}' => Some('h'), // н
        '\u{043E}' => Some('o'), // о
        '\u{0440}' => Some('p'), // р
        '\u{051B}' => Some('q'), // ԛ
        '\u{0455}' => Some('s'), // ѕ
        '\u{0442}' => Some('t'), // т
        '\u{0445}' => Some('x'), // х
        '\u{0443}' => Some('y'), // у
        '\u{051D}' => Some('w'), // ԝ
        _ => None,
    }
}

fn greek_to_latin(c: char) -> Option<char> {
    match c {
        '\u{03B1}' => Some('a'), // α
        '\u{03B2}' => Some('b'), // β
        '\u{03B5}' => Some('e'), // ε
        '\u{03B9}' => Some('i'), // ι
        '\u{03BA}' => Some('k'), // κ
        '\u{03BD}' => Some('v'), // ν
        '\u{03BF}' => Some('o'), // ο
        '\u{03C1}' => Some('p'), // ρ
        '\u{03C4}' => Some('t'), // τ
        '\u{03C5}' => Some('u'), // υ
        '\u{03C7}' => Some('x'), // χ
        '\u{03B3}' => Some('y'), // γ
        _ => None,
    }
}

/// Normalizes with the built-in [`SkeletonTable`].
#[must_use]
pub fn normalize(raw: &str) -> String {
    normalize_with(raw, &SkeletonTable)
}

/// Full normalization with a caller-supplied confusable folder.
#[must_use]
pub fn normalize_with(raw: &str, folder: &dyn ConfusableFolder) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let stripped = strip_markup(raw).to_lowercase();
    // Compatibility forms can decompose to uppercase, so fold case again.
    let compat = stripped.nfkc().collect::<String>().to_lowercase();

    let folded = match folder.skeleton(&compat) {
        Ok(skeleton) => skeleton,
        Err(err) => {
            tracing::debug!(error = %err, "confusable folding failed, using unfolded text");
            compat
        },
    };

    let without_punctuation: String = folded
        .chars()
        .filter(|c| !STRIPPED_PUNCTUATION.contains(c))
        .collect();

    collapse_whitespace(&without_punctuation)
}

/// Lightweight normalization with leetspeak folding.
#[must_use]
pub fn normalize_light(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let lowered = strip_color_codes(raw, '§').to_lowercase();
    collapse_whitespace(&lowered)
        .chars()
        .map(fold_leet)
        .collect()
}

const fn fold_leet(c: char) -> char {
    match c {
        '0' => 'o',
        '1' => 'i',
        '3' => 'e',
        '4' => 'a',
        '5' => 's',
        '7' => 't',
        '8' => 'b',
        '@' => 'a',
        other => other,
    }
}

/// Strips `§x` / `&x` color escapes and `<...>` markup tags.
#[must_use]
pub fn strip_markup(raw: &str) -> String {
    let without_codes = strip_color_codes(&strip_color_codes(raw, '§'), '&');
    strip_tags(&without_codes)
}

const fn is_format_code(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), '0'..='9' | 'a'..='f' | 'k'..='o' | 'r')
}

fn strip_color_codes(raw: &str, marker: char) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == marker {
            if let Some(&next) = chars.peek() {
                if is_format_code(next) {
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Removes `<...>` tags. An unterminated `<` is kept as text.
fn strip_tags(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        match after.find('>') {
            Some(close) if !after[..close].contains('<') => {
                out.push_str(&rest[..open]);
                rest = &after[close + 1..];
            },
            _ => {
                out.push_str(&rest[..=open]);
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

/// Collapses whitespace runs to a single space and trims.
#[must_use]
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
