//! Stdio host tests: run the binary, feed envelopes on stdin and read the
//! lines it writes before exiting.

use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::{json, Value};

/// Feed `frames` to a fresh in-memory host, close stdin and collect the
/// JSON lines it wrote to stdout.
fn run_host(frames: &[Value]) -> Vec<Value> {
    let mut child = Command::new(env!("CARGO_BIN_EXE_keystead"))
        .env_remove("DATA_DIR")
        .env("KDF_MEMORY_KB", "64")
        .env("KDF_ITERATIONS", "1")
        .env("AUTO_LOCK_MINUTES", "0")
        .env("DEV_MODE", "true")
        .env("LOG_LEVEL", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("host starts");

    {
        let mut stdin = child.stdin.take().expect("stdin piped");
        for frame in frames {
            writeln!(stdin, "{frame}").expect("write frame");
        }
        // dropping stdin sends EOF
    }

    let output = child.wait_with_output().expect("host exits");
    assert!(output.status.success(), "host exited with {}", output.status);
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line is JSON"))
        .collect()
}

fn replies(lines: &[Value]) -> Vec<&Value> {
    lines.iter().filter(|line| line.get("response").is_some()).collect()
}

fn frame(id: u64, method: &str, payload: Value) -> Value {
    json!({
        "id": id,
        "method": method,
        "payload": payload,
        "meta": { "origin": "https://app.example" }
    })
}

#[test]
fn test_every_call_is_answered_before_exit() {
    let lines = run_host(&[
        frame(1, "get-status", Value::Null),
        frame(2, "setup-password", json!({ "password": "hunter2" })),
        frame(3, "get-status", Value::Null),
    ]);

    let replies = replies(&lines);
    assert_eq!(replies.len(), 3, "got {lines:?}");
    let mut ids: Vec<u64> = replies.iter().filter_map(|r| r["id"].as_u64()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
    let setup = replies.iter().find(|r| r["id"] == json!(2)).expect("setup reply");
    assert_eq!(setup["response"], json!([null, true]));
}

#[test]
fn test_parked_consent_request_is_rejected_at_exit() {
    let lines = run_host(&[frame(7, "dummy-request", json!({ "message": "hi" }))]);

    let replies = replies(&lines);
    assert_eq!(replies.len(), 1, "got {lines:?}");
    assert_eq!(replies[0]["id"], json!(7));
    assert_eq!(
        replies[0]["response"],
        json!([null, { "decision": "rejected", "data": null }])
    );
}

#[test]
fn test_malformed_line_gets_error_reply() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_keystead"))
        .env_remove("DATA_DIR")
        .env("AUTO_LOCK_MINUTES", "0")
        .env("LOG_LEVEL", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("host starts");
    {
        let mut stdin = child.stdin.take().expect("stdin piped");
        writeln!(stdin, "not json").expect("write line");
    }

    let output = child.wait_with_output().expect("host exits");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<Value> = stdout.lines().filter_map(|l| serde_json::from_str(l).ok()).collect();
    assert_eq!(lines.len(), 1, "got {stdout}");
    assert_eq!(lines[0]["id"], Value::Null);
    assert!(lines[0]["response"][0]
        .as_str()
        .is_some_and(|m| m.starts_with("Malformed envelope")));
}
