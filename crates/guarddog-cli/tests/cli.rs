//! Black-box tests against the built `guarddog` binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn guarddog_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_guarddog"))
}

fn run(args: &[&str]) -> Output {
    Command::new(guarddog_bin())
        .args(args)
        .env_remove("GUARDDOG_CONFIG")
        .output()
        .expect("run guarddog")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("guarddog.toml");
    std::fs::write(&path, body).unwrap();
    path
}

fn now_ms() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis(),
    )
    .unwrap()
}

#[test]
fn test_check_config_prints_defaults() {
    let output = run(&["check-config"]);

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("[guarddog.ratelimit]"));
    assert!(text.contains("max_burst = 3"));
    assert!(text.contains("[antispam.penalties]"));
}

#[test]
fn test_check_config_rejects_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[guarddog.ratelimit]\nmax_burst = 0\n");

    let output = run(&["--config", config.to_str().unwrap(), "check-config"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_burst"));
}

#[test]
fn test_similarity_reports_both_forms() {
    let output = run(&["similarity", "Hello World", "hello world!!"]);

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("light:"));
    assert!(text.contains("full: \"hello world\" vs \"hello world\""));
    assert!(text.contains("similarity=1.000"));
}

#[test]
fn test_trust_requires_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[guarddog.captcha]\npersist = false\n");

    let output = run(&["--config", config.to_str().unwrap(), "trust", "list"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("persist"));
}

#[test]
fn test_trust_list_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("verified.json");
    let fresh = now_ms() - 60_000;
    let stale = now_ms() - 48 * 3_600_000;
    std::fs::write(
        &store,
        format!(r#"{{"203.0.113.7": {fresh}, "198.51.100.2": {stale}}}"#),
    )
    .unwrap();
    let config = write_config(
        dir.path(),
        &format!("[guarddog.captcha]\nstore_path = {:?}\n", store.to_str().unwrap()),
    );
    let config = config.to_str().unwrap();

    let listed = run(&["--config", config, "trust", "list"]);
    assert!(listed.status.success());
    let text = stdout(&listed);
    assert!(text.contains("203.0.113.7"));
    assert!(!text.contains("198.51.100.2"));

    let cleared = run(&["--config", config, "trust", "clear"]);
    assert!(cleared.status.success());

    let after = run(&["--config", config, "trust", "list"]);
    assert!(after.status.success());
    assert!(stdout(&after).trim().is_empty());
}

#[test]
fn test_replay_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "[guarddog.captcha]\nenabled = false\npersist = false\n\n[guarddog.heuristics]\nenabled = false\n",
    );
    let events = dir.path().join("events.jsonl");
    std::fs::write(
        &events,
        concat!(
            r#"{"event":"chat","identity":"steve","message":"hello","address":"203.0.113.7"}"#,
            "\n",
            r#"{"event":"chat","identity":"alex","message":"hello","address":"203.0.113.8"}"#,
            "\n",
        ),
    )
    .unwrap();

    let output = run(&[
        "--config",
        config.to_str().unwrap(),
        "replay",
        events.to_str().unwrap(),
    ]);

    assert!(output.status.success());
    let decisions: Vec<serde_json::Value> = stdout(&output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0]["decision"]["outcome"], "allow");
    assert_eq!(decisions[1]["decision"]["gate"], "similarity");
}
