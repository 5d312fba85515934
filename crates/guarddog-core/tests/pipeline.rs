//! End-to-end tests for the message pipeline.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use guarddog_core::challenge::{FAILURE_MESSAGE, REISSUE_MESSAGE, SUCCESS_MESSAGE};
use guarddog_core::similarity_filter::BLOCK_MESSAGE;
use guarddog_core::{
    Challenge, ChallengeError, ChallengeSink, ChallengeState, ContentFilter, Decision, Gate, GuardDog,
    GuardDogConfig, IdentityId, ManualClock, MessageContext, Outcome, Position, ProfileStats, SideEffect,
};

const START_MS: u64 = 1_700_000_000_000;

fn addr(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
}

/// Defaults with trust kept in memory, so tests never share a trust file.
fn memory_only() -> GuardDogConfig {
    let mut config = GuardDogConfig::default();
    config.guarddog.captcha.persist = false;
    config
}

fn build(config: GuardDogConfig) -> (GuardDog, ManualClock) {
    let clock = ManualClock::new(START_MS);
    let guard = GuardDog::builder(config)
        .clock(Arc::new(clock.clone()))
        .seed(42)
        .build()
        .unwrap();
    (guard, clock)
}

/// Only the rate limiter and the content filter are active.
fn content_only(filter: ContentFilter) -> GuardDogConfig {
    let mut config = memory_only();
    config.guarddog.content_filter = filter;
    config.guarddog.captcha.enabled = false;
    config.guarddog.heuristics.enabled = false;
    config
}

fn send(guard: &GuardDog, id: &str, message: &str) -> Decision {
    guard.evaluate(&MessageContext::new(id, message, addr(1)))
}

fn rendered(decision: &Decision) -> Challenge {
    match &decision.side_effects[..] {
        [SideEffect::RenderChallenge { challenge }] => challenge.clone(),
        other => panic!("expected a challenge render, got {other:?}"),
    }
}

fn wrong(challenge: &Challenge) -> u32 {
    (challenge.correct_option + 1) % challenge.option_count
}

fn veteran() -> ProfileStats {
    ProfileStats {
        level: 30,
        total_experience: 5_000,
        playtime_minutes: Some(600),
        blocks_mined: Some(500),
        distance_walked_cm: Some(1_000_000),
    }
}

/// Established player that never mines or walks: only the activity signal
/// fires.
fn idle_veteran() -> ProfileStats {
    ProfileStats {
        blocks_mined: None,
        distance_walked_cm: None,
        ..veteran()
    }
}

/// Joins `id` and walks it far enough to satisfy every movement check.
fn join_and_walk(guard: &GuardDog, id: &IdentityId) {
    guard.on_join(id, Position::default());
    guard.on_move(id, Position::new(3.0, 0.0, 4.0));
}

// =============================================================================
// Full walkthrough
// =============================================================================

#[test]
fn test_new_player_walkthrough() {
    let (guard, clock) = build(memory_only());
    let id = IdentityId::from("steve");
    guard.on_join(&id, Position::default());

    let first = send(&guard, "steve", "hi all");
    assert_eq!(first.outcome, Outcome::Block);
    assert_eq!(first.gate, Some(Gate::Challenge));
    let challenge = rendered(&first);
    assert_eq!(first.reason.as_deref(), Some(challenge.prompt().as_str()));

    let again = send(&guard, "steve", "hi all");
    assert_eq!(again.reason.as_deref(), Some(REISSUE_MESSAGE));
    assert!(again.side_effects.is_empty());

    let retry = guard.respond_to_challenge(&id, wrong(&challenge)).unwrap();
    assert_eq!(retry.outcome, Outcome::Block);
    assert_eq!(rendered(&retry), challenge);

    let verified = guard.respond_to_challenge(&id, challenge.correct_option).unwrap();
    assert_eq!(verified.outcome, Outcome::Allow);
    assert_eq!(verified.reason.as_deref(), Some(SUCCESS_MESSAGE));
    assert_eq!(guard.challenge_state(&id), ChallengeState::None);

    let too_soon = send(&guard, "steve", "hi all");
    assert_eq!(too_soon.gate, Some(Gate::Behavior));
    assert_eq!(too_soon.reason.as_deref(), Some("Please wait 5 more second(s) before chatting."));

    clock.advance(Duration::from_secs(5));
    let standing = send(&guard, "steve", "hi all");
    assert_eq!(standing.gate, Some(Gate::Behavior));
    assert_eq!(standing.reason.as_deref(), Some("Please move around (2.0 blocks remaining)."));

    guard.on_move(&id, Position::new(0.0, 0.0, 2.5));
    assert_eq!(send(&guard, "steve", "hi all").outcome, Outcome::Allow);

    let repeat = send(&guard, "steve", "hi all");
    assert_eq!(repeat.outcome, Outcome::Block);
    assert_eq!(repeat.gate, Some(Gate::Similarity));
    assert_eq!(repeat.reason.as_deref(), Some(BLOCK_MESSAGE));
}

// =============================================================================
// Challenge
// =============================================================================

#[test]
fn test_three_wrong_answers_disconnect() {
    let (guard, _clock) = build(memory_only());
    let id = IdentityId::from("bot");
    let challenge = rendered(&send(&guard, "bot", "buy now"));

    for remaining in [2, 1] {
        let retry = guard.respond_to_challenge(&id, wrong(&challenge)).unwrap();
        assert_eq!(retry.reason, Some(format!("✗ Wrong item! {remaining} attempts remaining.")));
    }

    let failed = guard.respond_to_challenge(&id, wrong(&challenge)).unwrap();
    assert_eq!(failed.outcome, Outcome::Block);
    assert_eq!(
        failed.side_effects,
        vec![SideEffect::Disconnect {
            reason: FAILURE_MESSAGE.to_string()
        }]
    );
    assert_eq!(
        guard.respond_to_challenge(&id, challenge.correct_option),
        Err(ChallengeError::NoActiveSession {
            identity: "bot".to_string()
        })
    );

    guard.on_disconnect(&id);
    let fresh = send(&guard, "bot", "buy now");
    assert_eq!(fresh.gate, Some(Gate::Challenge));
    assert_eq!(guard.challenge_state(&id), ChallengeState::Challenged { attempts: 0 });
}

#[test]
fn test_verified_address_covers_other_identities() {
    let mut config = memory_only();
    config.guarddog.heuristics.enabled = false;
    let (guard, _clock) = build(config);

    let alice = IdentityId::from("alice");
    let challenge = rendered(&send(&guard, "alice", "hello"));
    guard.respond_to_challenge(&alice, challenge.correct_option).unwrap();

    assert_eq!(send(&guard, "bob", "same house, different account").outcome, Outcome::Allow);
    assert!(guard.trust().is_verified(addr(1)));
    assert!(!guard.trust().is_verified(addr(2)));
}

#[test]
fn test_trust_expires_after_duration() {
    let mut config = memory_only();
    config.guarddog.heuristics.enabled = false;
    let (guard, clock) = build(config);

    let challenge = rendered(&send(&guard, "alice", "hello"));
    guard
        .respond_to_challenge(&"alice".into(), challenge.correct_option)
        .unwrap();

    clock.advance(Duration::from_secs(24 * 3600) - Duration::from_millis(1));
    assert_eq!(send(&guard, "bob", "still trusted").outcome, Outcome::Allow);

    clock.advance(Duration::from_millis(2));
    assert_eq!(send(&guard, "carol", "expired now").gate, Some(Gate::Challenge));
}

#[test]
fn test_trust_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = memory_only();
    config.guarddog.heuristics.enabled = false;
    config.guarddog.captcha.persist = true;
    config.guarddog.captcha.store_path = dir.path().join("verified.json");

    {
        let (guard, _clock) = build(config.clone());
        let challenge = rendered(&send(&guard, "alice", "hello"));
        guard
            .respond_to_challenge(&"alice".into(), challenge.correct_option)
            .unwrap();
        guard.trust().flush();
    }

    let (restarted, _clock) = build(config);
    assert!(restarted.trust().is_verified(addr(1)));
    assert_eq!(send(&restarted, "alice", "back again").outcome, Outcome::Allow);
}

#[derive(Debug, Default)]
struct RecordingSink {
    renders: Mutex<Vec<IdentityId>>,
}

impl ChallengeSink for RecordingSink {
    fn render_challenge(&self, id: &IdentityId, _challenge: &Challenge) {
        self.renders.lock().unwrap().push(id.clone());
    }

    fn notify(&self, _id: &IdentityId, _message: &str) {}
}

#[tokio::test(start_paused = true)]
async fn test_dismissed_challenge_is_reissued() {
    let sink = Arc::new(RecordingSink::default());
    let guard = GuardDog::builder(memory_only())
        .clock(Arc::new(ManualClock::new(START_MS)))
        .sink(Arc::clone(&sink) as Arc<dyn ChallengeSink>)
        .seed(3)
        .build()
        .unwrap();
    let id = IdentityId::from("steve");

    send(&guard, "steve", "hello");
    assert!(guard.dismiss_challenge(&id));
    assert!(sink.renders.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(*sink.renders.lock().unwrap(), vec![id.clone()]);
    assert_eq!(guard.challenge_state(&id), ChallengeState::Challenged { attempts: 0 });
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_reissue() {
    let sink = Arc::new(RecordingSink::default());
    let guard = GuardDog::builder(memory_only())
        .clock(Arc::new(ManualClock::new(START_MS)))
        .sink(Arc::clone(&sink) as Arc<dyn ChallengeSink>)
        .build()
        .unwrap();
    let id = IdentityId::from("steve");

    send(&guard, "steve", "hello");
    assert!(guard.dismiss_challenge(&id));
    guard.on_disconnect(&id);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(sink.renders.lock().unwrap().is_empty());
}

// =============================================================================
// Rate limit and similarity
// =============================================================================

#[test]
fn test_rate_limit_burst_then_refill() {
    let (guard, clock) = build(content_only(ContentFilter::Similarity));

    for message in ["one", "two two", "three three three"] {
        assert_eq!(send(&guard, "p", message).outcome, Outcome::Allow);
    }
    let limited = send(&guard, "p", "four is too many");
    assert_eq!(limited.gate, Some(Gate::RateLimit));
    assert_eq!(
        limited.reason.as_deref(),
        Some("Slow down! Wait 2s before chatting again.")
    );

    clock.advance(Duration::from_secs(2));
    assert_eq!(send(&guard, "p", "four is too many").outcome, Outcome::Allow);
}

#[test]
fn test_similarity_filter_remembers_only_accepted_messages() {
    let (guard, clock) = build(content_only(ContentFilter::Similarity));

    for message in ["alpha", "bravo bravo", "charlie charlie charlie"] {
        send(&guard, "p", message);
    }
    assert_eq!(send(&guard, "p", "delta delta delta delta").gate, Some(Gate::RateLimit));

    clock.advance(Duration::from_secs(2));
    assert_eq!(send(&guard, "p", "delta delta delta delta").outcome, Outcome::Allow);
}

#[test]
fn test_similarity_catches_copy_from_other_identity() {
    let (guard, _clock) = build(content_only(ContentFilter::Similarity));

    assert_eq!(send(&guard, "a", "join my server at example.net").outcome, Outcome::Allow);
    let copy = send(&guard, "b", "JOIN my server at example.net");
    assert_eq!(copy.gate, Some(Gate::Similarity));
}

#[test]
fn test_bypass_messages_feed_history() {
    let (guard, _clock) = build(content_only(ContentFilter::Similarity));

    let op = MessageContext::new("op", "server restarts in five minutes", addr(9)).with_bypass(true);
    for _ in 0..5 {
        assert_eq!(guard.evaluate(&op), Decision::allow());
    }

    let echo = send(&guard, "p", "server restarts in five minutes");
    assert_eq!(echo.gate, Some(Gate::Similarity));
}

// =============================================================================
// Risk filter
// =============================================================================

#[test]
fn test_risk_blocks_repeated_message() {
    let (guard, clock) = build(content_only(ContentFilter::Risk));
    let id = IdentityId::from("p");
    join_and_walk(&guard, &id);

    let ctx = MessageContext::new("p", "hello world", addr(1)).with_profile(veteran());
    assert_eq!(guard.evaluate(&ctx), Decision::allow());

    clock.advance(Duration::from_secs(5));
    let repeat = guard.evaluate(&ctx);
    assert_eq!(repeat.outcome, Outcome::Block);
    assert_eq!(repeat.gate, Some(Gate::Risk));
    assert!(repeat.reason.unwrap().contains("repeated message"));
    assert_eq!(guard.risk_score(&id), 85);
}

#[test]
fn test_risk_records_blocked_messages() {
    let (guard, clock) = build(content_only(ContentFilter::Risk));

    let newbie = MessageContext::new("newbie", "free diamonds here", addr(1));
    assert_eq!(guard.evaluate(&newbie).outcome, Outcome::Block);

    clock.advance(Duration::from_secs(5));
    let id = IdentityId::from("regular");
    join_and_walk(&guard, &id);
    let regular = MessageContext::new("regular", "free diamonds here", addr(2)).with_profile(idle_veteran());

    let decision = guard.evaluate(&regular);
    assert_eq!(decision.outcome, Outcome::Warn);
    assert!(decision.is_delivered());
    assert!(decision.reason.unwrap().starts_with("Warning: "));
}

#[test]
fn test_risk_score_decays_between_messages() {
    let (guard, clock) = build(content_only(ContentFilter::Risk));
    let id = IdentityId::from("p");

    let newbie = MessageContext::new("p", "first message", addr(1));
    guard.evaluate(&newbie);
    let after_first = guard.risk_score(&id);
    assert!(after_first >= 75);

    join_and_walk(&guard, &id);
    clock.advance(Duration::from_secs(10));
    let calm = MessageContext::new("p", "something else entirely", addr(1)).with_profile(veteran());
    guard.evaluate(&calm);

    assert_eq!(guard.risk_score(&id), after_first * 7 / 10);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_reload_keeps_trust_and_clears_limits() {
    let mut config = memory_only();
    config.guarddog.heuristics.enabled = false;
    let (guard, _clock) = build(config.clone());

    let challenge = rendered(&send(&guard, "p", "hello"));
    guard
        .respond_to_challenge(&"p".into(), challenge.correct_option)
        .unwrap();
    for message in ["one", "two two", "three three three"] {
        send(&guard, "p", message);
    }
    assert_eq!(send(&guard, "p", "limited").gate, Some(Gate::RateLimit));

    config.guarddog.ratelimit.max_burst = 5;
    guard.reload(config).unwrap();

    assert!(guard.trust().is_verified(addr(1)));
    assert_eq!(guard.remaining_tokens(&"p".into()), 5);
    assert_eq!(send(&guard, "p", "three three three").outcome, Outcome::Allow);
}

#[test]
fn test_reload_switches_content_filter() {
    let (guard, _clock) = build(content_only(ContentFilter::Similarity));
    guard
        .reload(content_only(ContentFilter::Risk))
        .unwrap();

    let decision = send(&guard, "newbie", "hello there");
    assert_eq!(decision.gate, Some(Gate::Risk));
}

#[test]
fn test_disconnect_purges_identity() {
    let (guard, _clock) = build(memory_only());
    let id = IdentityId::from("p");
    join_and_walk(&guard, &id);
    send(&guard, "p", "hello");
    assert!(guard.is_tracked(&id));

    guard.on_disconnect(&id);

    assert!(!guard.is_tracked(&id));
    assert_eq!(guard.challenge_state(&id), ChallengeState::None);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_identities_evaluated_concurrently() {
    let mut config = content_only(ContentFilter::Similarity);
    config.guarddog.similarity.check_global_chat = false;
    let (guard, _clock) = build(config);
    let guard = Arc::new(guard);

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                let id = format!("player-{n}");
                (0..5)
                    .map(|m| {
                        let text = ["apples", "bicycle kick", "cloudy weather today", "dig", "emerald trade"][m];
                        guard.evaluate(&MessageContext::new(id.as_str(), text, addr(1))).outcome
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        let outcomes = handle.join().unwrap();
        let allowed = outcomes.iter().filter(|o| **o == Outcome::Allow).count();
        assert_eq!(allowed, 3);
    }
}

#[test]
fn test_same_identity_never_overspends() {
    let mut config = content_only(ContentFilter::Similarity);
    config.guarddog.similarity.enabled = false;
    let (guard, _clock) = build(config);
    let guard = Arc::new(guard);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                (0..4)
                    .filter(|_| send(&guard, "shared", "same text").outcome == Outcome::Allow)
                    .count()
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 3);
}
