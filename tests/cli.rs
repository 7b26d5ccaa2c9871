//! End-to-end CLI runs against the built binary.
//!
//! These drive a real shell (`bash --norc` with `PS1="$ "`) and assert
//! the exact CLI output contract: `Success!` and exit 0 on a match, a
//! side-by-side diff plus the final screen dump and exit 1 on a
//! mismatch.

use std::path::Path;
use std::process::{Command, Output};

fn write_transcript(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("transcript.txt");
    std::fs::write(&path, contents).unwrap();
    path
}

fn run_repltest(transcript: &Path, extra_args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_repltest"))
        .arg("--entrypoint")
        .arg("bash --norc")
        .arg("--timeout")
        .arg("30s")
        .args(extra_args)
        .arg(transcript)
        .env("PS1", "$ ")
        .output()
        .unwrap()
}

#[test]
fn matching_transcript_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let transcript = write_transcript(dir.path(), "$ echo hiya\nhiya\n$ exit\nexit\n");

    let output = run_repltest(&transcript, &[]);

    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "Success! The test session matched the transcript.\n",
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr),
    );
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn mismatched_transcript_renders_a_diff() {
    let dir = tempfile::tempdir().unwrap();
    let transcript =
        write_transcript(dir.path(), "$ echo hiya\nthis is wrong\n$ exit\nexit\n");

    let output = run_repltest(&transcript, &[]);

    assert_eq!(output.status.code(), Some(1));
    // Annotation rows pad out to the panel width, trailing spaces
    // included.
    let expected = [
        "Error: Found a discrepancy. See diff below:",
        "+- Expected --+    +-- Actual ---+",
        "|$ echo hiya  |    |$ echo hiya  |",
        "|this is wrong|    |hiya         |",
        " ---- -- -----      ++++ ++ +++++ ",
        "|$ exit       |    |$ \u{2588}          |",
        "|exit         |    |             |",
        "+-------------+    +-------------+",
        "Final state of screen:",
        "+-------------+",
        "|$ echo hiya  |",
        "|hiya         |",
        "|$ \u{2588}          |",
        "|             |",
        "+-------------+",
        "",
    ]
    .join("\n");
    assert_eq!(String::from_utf8_lossy(&output.stderr), expected);
}

#[test]
fn incomplete_last_command_is_a_discrepancy() {
    let dir = tempfile::tempdir().unwrap();
    // The shell still echoes "exit" on its way out; a transcript that
    // stops before that line cannot match.
    let transcript = write_transcript(dir.path(), "$ echo hiya\nhiya\n$ exit\n");

    let output = run_repltest(&transcript, &[]);

    assert_eq!(output.status.code(), Some(1));
    let expected = [
        "Error: Found a discrepancy. See diff below:",
        "+ Expected -+    +- Actual --+",
        "|$ echo hiya|    |$ echo hiya|",
        "|hiya       |    |hiya       |",
        "|$ exit     |    |$ exit     |",
        "|           |    |exit       |",
        " ----             ++++        ",
        "|           |    |\u{2588}          |",
        "+-----------+    +-----------+",
        "Final state of screen:",
        "+-----------+",
        "|$ echo hiya|",
        "|hiya       |",
        "|$ exit     |",
        "|exit       |",
        "|\u{2588}          |",
        "+-----------+",
        "",
    ]
    .join("\n");
    assert_eq!(String::from_utf8_lossy(&output.stderr), expected);
}

#[test]
fn nonzero_exit_is_an_issue_when_checked() {
    let dir = tempfile::tempdir().unwrap();
    let transcript = write_transcript(dir.path(), "$ exit 3\nexit\n");

    let output = run_repltest(&transcript, &["--check-exit-code"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("'bash --norc' exited with nonzero exit code: 3"),
        "stderr: {stderr}"
    );
}

#[test]
fn nonzero_exit_is_ignored_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let transcript = write_transcript(dir.path(), "$ exit 3\nexit\n");

    let output = run_repltest(&transcript, &[]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr),
    );
}

#[test]
fn timeout_is_reported_and_the_child_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let transcript = write_transcript(dir.path(), "$ sleep 5\n$ exit\nexit\n");

    let output = run_repltest(
        &transcript,
        &["--timeout", "200ms", "--cleanup-term-after", "0s", "--cleanup-kill-after", "1s"],
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("session timed out"), "stderr: {stderr}");
}

#[test]
fn missing_transcript_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_repltest"))
        .args(["--entrypoint", "bash", "/nonexistent/transcript.txt"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn bad_flag_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_repltest"))
        .args(["--entrypoint", "bash", "--timeout", "10lightyears", "t.txt"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
