use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::duration::parse_duration;

/// Verify that a terminal transcript can be reproduced by driving the
/// given entrypoint.
#[derive(Parser, Debug)]
#[command(name = "repltest")]
pub struct Cli {
    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Command to drive, split with shell quoting rules
    #[arg(long)]
    pub entrypoint: String,

    /// Treat a nonzero child exit code as a failure
    #[arg(long, overrides_with = "no_check_exit_code")]
    pub check_exit_code: bool,

    /// Ignore the child's exit code (the default)
    #[arg(long, overrides_with = "check_exit_code")]
    pub no_check_exit_code: bool,

    /// How long the test session is allowed to execute for
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// When cleaning up after a test session, how long to wait after
    /// SIGHUP before sending a SIGTERM to the child process
    #[arg(long, value_parser = parse_duration)]
    pub cleanup_term_after: Option<Duration>,

    /// When cleaning up after a test session, how long to wait after
    /// SIGTERM before sending a SIGKILL to the child process
    #[arg(long, value_parser = parse_duration)]
    pub cleanup_kill_after: Option<Duration>,

    /// Transcript file to reproduce
    pub transcript: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn minimal_invocation() {
        let cli = parse(&["repltest", "--entrypoint", "sh", "t.txt"]);
        assert_eq!(cli.entrypoint, "sh");
        assert_eq!(cli.transcript, PathBuf::from("t.txt"));
        assert!(!cli.check_exit_code);
        assert_eq!(cli.verbose, 0);
        assert!(cli.timeout.is_none());
    }

    #[test]
    fn durations_and_verbosity() {
        let cli = parse(&[
            "repltest",
            "-vv",
            "--entrypoint",
            "sh",
            "--timeout",
            "5s",
            "--cleanup-kill-after",
            "100ms",
            "t.txt",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.timeout, Some(Duration::from_secs(5)));
        assert_eq!(cli.cleanup_kill_after, Some(Duration::from_millis(100)));
    }

    #[test]
    fn exit_code_toggle_pair() {
        let cli = parse(&["repltest", "--entrypoint", "sh", "--check-exit-code", "t.txt"]);
        assert!(cli.check_exit_code);

        // The later flag wins.
        let cli = parse(&[
            "repltest",
            "--entrypoint",
            "sh",
            "--check-exit-code",
            "--no-check-exit-code",
            "t.txt",
        ]);
        assert!(!cli.check_exit_code);

        // In either order.
        let cli = parse(&[
            "repltest",
            "--entrypoint",
            "sh",
            "--no-check-exit-code",
            "--check-exit-code",
            "t.txt",
        ]);
        assert!(cli.check_exit_code);
    }

    #[test]
    fn bad_duration_is_a_usage_error() {
        let err = Cli::try_parse_from([
            "repltest",
            "--entrypoint",
            "sh",
            "--timeout",
            "42parsecs",
            "t.txt",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("bad unit"), "got: {err}");
    }

    #[test]
    fn missing_entrypoint_is_a_usage_error() {
        assert!(Cli::try_parse_from(["repltest", "t.txt"]).is_err());
    }
}
