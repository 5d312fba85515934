//! Individual risk signals.
//!
//! Each function inspects one aspect of a message or its sender and returns
//! the points it contributes, with an optional human-readable reason. They are
//! pure so every rule can be tested on its own; [`super::RiskScorer`] sums
//! the enabled ones.

use serde::{Deserialize, Serialize};

use super::ProfileStats;

/// Characters counted by [`separator_penalty`].
pub const SEPARATOR_CHARS: &[char] = &['_', '-', '.', ',', ';', ':', '|', '/', '\\', '*', '+', '='];

/// Code points that render as nothing.
pub const INVISIBLE_CHARS: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{180E}', '\u{2060}', '\u{2061}', '\u{2062}',
    '\u{2063}', '\u{2064}',
];

/// Digits and symbols commonly standing in for letters.
const SUBSTITUTION_CHARS: &[char] = &['0', '3', '1', '4', '5', '7', '@', '$'];

/// Velocity windows.
const RAPID_WINDOW_MS: u64 = 1_000;
const QUICK_WINDOW_MS: u64 = 3_000;

/// Content-signal limits.
const CAPS_RATIO_LIMIT: f64 = 0.6;
const CAPS_SCALE: f64 = 50.0;
const SEPARATOR_RATIO_LIMIT: f64 = 0.3;
const SEPARATOR_SCALE: f64 = 30.0;
const SUBSTITUTION_RATIO_LIMIT: f64 = 0.3;
const MIN_RATIO_LENGTH: usize = 10;
const MIN_SUBSTITUTION_LENGTH: usize = 5;
const REPEAT_RUN: usize = 5;

/// Self-similarity points per unit of similarity above the threshold.
pub const SELF_SIMILARITY_SCALE: f64 = 200.0;
/// Global-similarity points per unit of similarity above the threshold.
pub const GLOBAL_SIMILARITY_SCALE: f64 = 300.0;

/// Points for each signal (`[antispam.penalties]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Penalties {
    /// Sender has not moved far enough since join.
    pub no_movement: u32,
    /// Little or unknown playtime.
    pub low_playtime: u32,
    /// No experience.
    pub no_levels: u32,
    /// Little mining or walking.
    pub no_activity: u32,
    /// Message under one second after the previous one.
    pub rapid_message: u32,
    /// Message under three seconds after the previous one.
    pub quick_message: u32,
    /// Run of identical characters.
    pub repetition: u32,
    /// Zero-width characters present.
    pub invisible: u32,
    /// Heavy digit/symbol substitution.
    pub substitution: u32,
}

impl Default for Penalties {
    fn default() -> Self {
        Self {
            no_movement: 30,
            low_playtime: 25,
            no_levels: 20,
            no_activity: 15,
            rapid_message: 25,
            quick_message: 10,
            repetition: 15,
            invisible: 20,
            substitution: 15,
        }
    }
}

/// Points contributed by one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Penalty {
    /// Points added to the score.
    pub points: u32,
    /// Shown to the sender when the score crosses a threshold.
    pub reason: Option<String>,
}

impl Penalty {
    fn with_reason(points: u32, reason: impl Into<String>) -> Self {
        Self {
            points,
            reason: Some(reason.into()),
        }
    }

    const fn silent(points: u32) -> Self {
        Self {
            points,
            reason: None,
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scaled(points: u32, factor: f64) -> u32 {
    (f64::from(points) * factor + FLOOR_TOLERANCE) as u32
}

/// Absorbs representation error so `(1.0 - 0.8) * 200` floors to 40, not 39.
pub(crate) const FLOOR_TOLERANCE: f64 = 1e-9;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn over_threshold(value: f64, threshold: f64, scale: f64) -> u32 {
    ((value - threshold) * scale + FLOOR_TOLERANCE).max(0.0) as u32
}

#[allow(clippy::cast_precision_loss)]
fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

// =============================================================================
// Sender signals
// =============================================================================

/// Experience sub-score. Three tiers: brand new, low level, established.
#[must_use]
pub fn experience_points(stats: &ProfileStats, penalties: &Penalties) -> u32 {
    if stats.level == 0 && stats.total_experience < 10 {
        penalties.no_levels
    } else if stats.level < 5 {
        scaled(penalties.no_levels, 0.5)
    } else {
        0
    }
}

/// Playtime sub-score. Unknown playtime counts as brand new.
#[must_use]
pub fn playtime_points(stats: &ProfileStats, penalties: &Penalties) -> u32 {
    match stats.playtime_minutes {
        None => penalties.low_playtime,
        Some(m) if m < 10 => penalties.low_playtime,
        Some(m) if m < 30 => scaled(penalties.low_playtime, 0.6),
        Some(m) if m < 60 => scaled(penalties.low_playtime, 0.3),
        Some(_) => 0,
    }
}

/// Activity sub-score from mining and walking counters.
#[must_use]
pub fn activity_points(stats: &ProfileStats, penalties: &Penalties) -> u32 {
    let full = penalties.no_activity;
    let mut points = match stats.blocks_mined {
        Some(n) if n >= 100 => 0,
        Some(n) if n >= 50 => scaled(full, 0.3),
        Some(n) if n >= 10 => scaled(full, 0.6),
        _ => full,
    };
    match stats.distance_walked_cm {
        Some(cm) if cm >= 100_000 => points = 0,
        Some(cm) if cm >= 50_000 => points = points.min(scaled(full, 0.5)),
        _ => {},
    }
    points
}

/// How new or inactive the sender looks.
#[must_use]
pub fn profile_penalty(stats: &ProfileStats, penalties: &Penalties) -> Option<Penalty> {
    let points = experience_points(stats, penalties)
        + playtime_points(stats, penalties)
        + activity_points(stats, penalties);
    (points > 0).then(|| Penalty::with_reason(points, format!("new/low-activity player (+{points} pts)")))
}

/// Sender has not yet walked far enough. `distance` is `None` when no
/// movement has been observed at all.
#[must_use]
pub fn movement_penalty(distance: Option<f64>, required: f64, penalties: &Penalties) -> Option<Penalty> {
    match distance {
        None => Some(Penalty::with_reason(penalties.no_movement, "no movement detected")),
        Some(d) if d < required => Some(Penalty::with_reason(penalties.no_movement, "insufficient movement")),
        Some(_) => None,
    }
}

/// Messages arriving in quick succession.
#[must_use]
pub fn velocity_penalty(since_last_ms: Option<u64>, penalties: &Penalties) -> Option<Penalty> {
    match since_last_ms? {
        ms if ms < RAPID_WINDOW_MS => Some(Penalty::with_reason(penalties.rapid_message, "rapid messaging")),
        ms if ms < QUICK_WINDOW_MS => Some(Penalty::silent(penalties.quick_message)),
        _ => None,
    }
}

// =============================================================================
// Similarity signals
// =============================================================================

/// Near-duplicate of the sender's own recent message.
#[must_use]
pub fn self_similarity_penalty(similarity: f64, threshold: f64) -> Penalty {
    Penalty::with_reason(
        over_threshold(similarity, threshold, SELF_SIMILARITY_SCALE),
        format!("repeated message ({:.0}% similar)", similarity * 100.0),
    )
}

/// Near-duplicate of anyone's recent message.
#[must_use]
pub fn global_similarity_penalty(similarity: f64, threshold: f64) -> Penalty {
    Penalty::with_reason(
        over_threshold(similarity, threshold, GLOBAL_SIMILARITY_SCALE),
        format!("similar to recent message ({:.0}% similar)", similarity * 100.0),
    )
}

// =============================================================================
// Content signals (raw text)
// =============================================================================

/// Uppercase share of letters.
#[must_use]
pub fn caps_ratio(raw: &str) -> f64 {
    let letters = raw.chars().filter(|c| c.is_alphabetic()).count();
    let caps = raw.chars().filter(|c| c.is_uppercase()).count();
    ratio(caps, letters)
}

/// Shouting.
#[must_use]
pub fn caps_penalty(raw: &str) -> Option<Penalty> {
    let caps = caps_ratio(raw);
    (caps > CAPS_RATIO_LIMIT && raw.chars().count() > MIN_RATIO_LENGTH).then(|| {
        Penalty::with_reason(
            over_threshold(caps, CAPS_RATIO_LIMIT, CAPS_SCALE),
            format!("excessive caps ({:.0}%)", caps * 100.0),
        )
    })
}

/// Longest run of one repeated character.
#[must_use]
pub fn longest_run(raw: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut last = None;
    for c in raw.chars() {
        if Some(c) == last {
            current += 1;
        } else {
            current = 1;
            last = Some(c);
        }
        longest = longest.max(current);
    }
    longest
}

/// `aaaaaa` or `!!!!!`.
#[must_use]
pub fn repetition_penalty(raw: &str, penalties: &Penalties) -> Option<Penalty> {
    (longest_run(raw) >= REPEAT_RUN)
        .then(|| Penalty::with_reason(penalties.repetition, "excessive character repetition"))
}

/// Separator share of all characters.
#[must_use]
pub fn separator_ratio(raw: &str) -> f64 {
    let separators = raw.chars().filter(|c| SEPARATOR_CHARS.contains(c)).count();
    ratio(separators, raw.chars().count())
}

/// `h_e_l_l_o` style spacing.
#[must_use]
pub fn separator_penalty(raw: &str) -> Option<Penalty> {
    let share = separator_ratio(raw);
    (share > SEPARATOR_RATIO_LIMIT && raw.chars().count() > MIN_RATIO_LENGTH).then(|| {
        Penalty::with_reason(
            over_threshold(share, SEPARATOR_RATIO_LIMIT, SEPARATOR_SCALE),
            format!("excessive separators ({:.0}%)", share * 100.0),
        )
    })
}

/// Returns `true` if `raw` contains any zero-width code point.
#[must_use]
pub fn has_invisible_chars(raw: &str) -> bool {
    raw.chars().any(|c| INVISIBLE_CHARS.contains(&c))
}

/// Zero-width characters used to split filtered words.
#[must_use]
pub fn invisible_penalty(raw: &str, penalties: &Penalties) -> Option<Penalty> {
    has_invisible_chars(raw).then(|| Penalty::with_reason(penalties.invisible, "invisible characters detected"))
}

/// Substitution characters with a letter on at least one side.
#[must_use]
pub fn substitution_count(raw: &str) -> usize {
    let chars: Vec<char> = raw.to_lowercase().chars().collect();
    chars
        .iter()
        .enumerate()
        .filter(|&(i, c)| {
            SUBSTITUTION_CHARS.contains(c)
                && ((i > 0 && chars[i - 1].is_alphabetic())
                    || chars.get(i + 1).is_some_and(|next| next.is_alphabetic()))
        })
        .count()
}

/// `d1sc0rd` style obfuscation.
#[must_use]
pub fn substitution_penalty(raw: &str, penalties: &Penalties) -> Option<Penalty> {
    let len = raw.chars().count();
    if len < MIN_SUBSTITUTION_LENGTH {
        return None;
    }
    (ratio(substitution_count(raw), len) > SUBSTITUTION_RATIO_LIMIT)
        .then(|| Penalty::with_reason(penalties.substitution, "excessive character substitutions"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(level: u32, exp: u32, minutes: Option<u64>, mined: Option<u64>, walked: Option<u64>) -> ProfileStats {
        ProfileStats {
            level,
            total_experience: exp,
            playtime_minutes: minutes,
            blocks_mined: mined,
            distance_walked_cm: walked,
        }
    }

    #[test]
    fn test_brand_new_profile_gets_every_penalty() {
        let p = Penalties::default();
        let penalty = profile_penalty(&ProfileStats::default(), &p).unwrap();

        assert_eq!(penalty.points, 20 + 25 + 15);
        assert_eq!(penalty.reason.as_deref(), Some("new/low-activity player (+60 pts)"));
    }

    #[test]
    fn test_veteran_profile_is_clean() {
        let p = Penalties::default();
        let veteran = stats(30, 5_000, Some(600), Some(5_000), Some(1_000_000));
        assert!(profile_penalty(&veteran, &p).is_none());
    }

    #[test]
    fn test_experience_tiers() {
        let p = Penalties::default();
        assert_eq!(experience_points(&stats(0, 9, None, None, None), &p), 20);
        assert_eq!(experience_points(&stats(0, 10, None, None, None), &p), 10);
        assert_eq!(experience_points(&stats(4, 100, None, None, None), &p), 10);
        assert_eq!(experience_points(&stats(5, 100, None, None, None), &p), 0);
    }

    #[test]
    fn test_playtime_tiers() {
        let p = Penalties::default();
        let at = |m| playtime_points(&stats(0, 0, m, None, None), &p);
        assert_eq!(at(None), 25);
        assert_eq!(at(Some(9)), 25);
        assert_eq!(at(Some(10)), 15);
        assert_eq!(at(Some(30)), 7);
        assert_eq!(at(Some(60)), 0);
    }

    #[test]
    fn test_activity_tiers() {
        let p = Penalties::default();
        let at = |mined, walked| activity_points(&stats(0, 0, None, mined, walked), &p);
        assert_eq!(at(None, None), 15);
        assert_eq!(at(Some(9), None), 15);
        assert_eq!(at(Some(10), None), 9);
        assert_eq!(at(Some(50), None), 4);
        assert_eq!(at(Some(100), None), 0);
        assert_eq!(at(None, Some(50_000)), 7);
        assert_eq!(at(Some(50), Some(50_000)), 4);
        assert_eq!(at(None, Some(100_000)), 0);
    }

    #[test]
    fn test_movement_penalty() {
        let p = Penalties::default();
        assert_eq!(
            movement_penalty(None, 2.0, &p).unwrap().reason.as_deref(),
            Some("no movement detected")
        );
        assert_eq!(movement_penalty(Some(1.0), 2.0, &p).unwrap().points, 30);
        assert!(movement_penalty(Some(2.0), 2.0, &p).is_none());
    }

    #[test]
    fn test_velocity_windows() {
        let p = Penalties::default();
        assert!(velocity_penalty(None, &p).is_none());
        assert_eq!(velocity_penalty(Some(999), &p).unwrap().points, 25);

        let quick = velocity_penalty(Some(1_000), &p).unwrap();
        assert_eq!(quick.points, 10);
        assert!(quick.reason.is_none());

        assert!(velocity_penalty(Some(3_000), &p).is_none());
    }

    #[test]
    fn test_similarity_penalties_scale() {
        let own = self_similarity_penalty(0.9, 0.8);
        assert_eq!(own.points, 20);
        assert_eq!(own.reason.as_deref(), Some("repeated message (90% similar)"));

        let global = global_similarity_penalty(0.95, 0.85);
        assert_eq!(global.points, 30);
        assert_eq!(global.reason.as_deref(), Some("similar to recent message (95% similar)"));
    }

    #[test]
    fn test_caps() {
        assert!(caps_penalty("HELLO").is_none(), "too short");
        assert!(caps_penalty("hello everyone").is_none());

        let shout = caps_penalty("HELLO EVERYONE").unwrap();
        assert_eq!(shout.points, 20);
        assert_eq!(shout.reason.as_deref(), Some("excessive caps (100%)"));
    }

    #[test]
    fn test_repetition() {
        let p = Penalties::default();
        assert_eq!(longest_run("heyyyy"), 4);
        assert!(repetition_penalty("heyyyy", &p).is_none());
        assert!(repetition_penalty("heyyyyy", &p).is_some());
        assert!(repetition_penalty("!!!!!", &p).is_some());
        assert_eq!(longest_run(""), 0);
    }

    #[test]
    fn test_separators() {
        assert!(separator_penalty("h_e_l_l_o").is_none(), "too short");
        let spaced = separator_penalty("f_r_e_e_i_t_e_m_s").unwrap();
        assert!(spaced.reason.unwrap().starts_with("excessive separators ("));
        assert!(separator_penalty("a normal sentence, really.").is_none());
    }

    #[test]
    fn test_invisible() {
        let p = Penalties::default();
        assert!(invisible_penalty("fr\u{200B}ee", &p).is_some());
        assert!(invisible_penalty("free", &p).is_none());
    }

    #[test]
    fn test_substitutions() {
        let p = Penalties::default();
        assert_eq!(substitution_count("d1sc0rd"), 2);
        assert!(substitution_penalty("d1sc0rd", &p).is_none());
        assert!(substitution_penalty("h3ll0 w0rld", &p).is_none());
        assert!(substitution_penalty("g00g13", &p).is_some());
        assert!(substitution_penalty("1234", &p).is_none());
        // Digits not touching letters do not count.
        assert_eq!(substitution_count("call 555 0000"), 0);
    }
}
