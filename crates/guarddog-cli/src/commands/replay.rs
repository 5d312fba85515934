//! `guarddog replay`
//!
//! Drives the engine from newline-delimited JSON events and prints one JSON
//! line per observable result. Time is virtual: the engine clock starts at
//! the wall clock and only moves on `sleep` events, and the runtime is paused
//! so challenge re-issue timers fire as soon as enough virtual time passes.
//!
//! ```text
//! {"event":"join","identity":"steve","position":{"x":0,"z":0}}
//! {"event":"chat","identity":"steve","message":"hi","address":"203.0.113.7"}
//! {"event":"respond","identity":"steve","option":4}
//! {"event":"dismiss","identity":"steve"}
//! {"event":"move","identity":"steve","position":{"x":3,"z":0}}
//! {"event":"sleep","ms":5000}
//! {"event":"quit","identity":"steve"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use guarddog_core::{
    Challenge, ChallengeSink, Clock, GuardDog, GuardDogConfig, IdentityId, ManualClock, MessageContext, Position,
    SystemClock,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One input line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Identity connected.
    Join {
        /// Who joined.
        identity: IdentityId,
        /// Spawn point.
        #[serde(default)]
        position: Position,
    },
    /// Position update.
    Move {
        /// Who moved.
        identity: IdentityId,
        /// New position.
        position: Position,
    },
    /// Chat message.
    Chat(MessageContext),
    /// Challenge answer.
    Respond {
        /// Who answered.
        identity: IdentityId,
        /// Chosen option.
        option: u32,
    },
    /// Challenge closed without an answer.
    Dismiss {
        /// Who dismissed it.
        identity: IdentityId,
    },
    /// Identity disconnected.
    Quit {
        /// Who left.
        identity: IdentityId,
    },
    /// Advance virtual time.
    Sleep {
        /// Milliseconds to advance.
        ms: u64,
    },
}

/// Counters printed when the replay finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Events processed.
    pub events: usize,
    /// Chat messages delivered (allowed or warned).
    pub delivered: usize,
    /// Chat messages dropped.
    pub blocked: usize,
}

/// Serialized output shared by the replay loop and the challenge sink.
#[derive(Debug)]
pub struct Transcript<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> Transcript<W> {
    /// Wraps `out`.
    pub const fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    fn emit(&self, value: &serde_json::Value) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(out, "{value}") {
            tracing::warn!(error = %err, "failed to write replay output");
        }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> ChallengeSink for Transcript<W> {
    fn render_challenge(&self, id: &IdentityId, challenge: &Challenge) {
        self.emit(&json!({ "identity": id, "event": "render_challenge", "challenge": challenge }));
    }

    fn notify(&self, id: &IdentityId, message: &str) {
        self.emit(&json!({ "identity": id, "event": "notify", "message": message }));
    }
}

/// Entry point for the subcommand.
pub fn run(config: GuardDogConfig, file: Option<&Path>, seed: Option<u64>) -> Result<()> {
    let input: Box<dyn BufRead> = match file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .context("failed to build tokio runtime")?;

    let transcript = Arc::new(Transcript::new(io::stdout()));
    let summary = runtime.block_on(replay(config, input, seed, Arc::clone(&transcript)))?;
    eprintln!(
        "{} event(s), {} delivered, {} blocked",
        summary.events, summary.delivered, summary.blocked
    );
    Ok(())
}

/// Replays every event from `input`.
pub async fn replay<W>(
    config: GuardDogConfig,
    input: impl BufRead,
    seed: Option<u64>,
    transcript: Arc<Transcript<W>>,
) -> Result<Summary>
where
    W: Write + Send + 'static,
{
    let clock = ManualClock::new(SystemClock.now_ms());
    let mut builder = GuardDog::builder(config)
        .clock(Arc::new(clock.clone()))
        .sink(Arc::clone(&transcript) as Arc<dyn ChallengeSink>);
    if let Some(seed) = seed {
        builder = builder.seed(seed);
    }
    let guard = builder.build().context("failed to start engine")?;

    let mut summary = Summary::default();
    for (index, line) in input.lines().enumerate() {
        let line = line.context("failed to read event")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: Event =
            serde_json::from_str(line).with_context(|| format!("line {}: invalid event", index + 1))?;
        apply(&guard, &clock, event, &transcript, &mut summary).await;
        summary.events += 1;
    }

    guard.trust().flush();
    Ok(summary)
}

async fn apply<W: Write + Send>(
    guard: &GuardDog,
    clock: &ManualClock,
    event: Event,
    transcript: &Transcript<W>,
    summary: &mut Summary,
) {
    match event {
        Event::Join { identity, position } => guard.on_join(&identity, position),
        Event::Move { identity, position } => guard.on_move(&identity, position),
        Event::Chat(ctx) => {
            let decision = guard.evaluate(&ctx);
            if decision.is_delivered() {
                summary.delivered += 1;
            } else {
                summary.blocked += 1;
            }
            transcript.emit(&json!({ "identity": ctx.identity, "event": "chat", "decision": decision }));
        },
        Event::Respond { identity, option } => match guard.respond_to_challenge(&identity, option) {
            Ok(decision) => {
                transcript.emit(&json!({ "identity": identity, "event": "respond", "decision": decision }));
            },
            Err(err) => {
                transcript.emit(&json!({ "identity": identity, "event": "respond", "error": err.to_string() }));
            },
        },
        Event::Dismiss { identity } => {
            let scheduled = guard.dismiss_challenge(&identity);
            transcript.emit(&json!({ "identity": identity, "event": "dismiss", "scheduled": scheduled }));
        },
        Event::Quit { identity } => guard.on_disconnect(&identity),
        Event::Sleep { ms } => {
            let step = Duration::from_millis(ms);
            clock.advance(step);
            tokio::time::sleep(step).await;
        },
    }
}
