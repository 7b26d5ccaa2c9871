use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use repltest::cli::Cli;
use repltest::verify::{Transcript, VerifyOptions, verify_transcript};

/// Usage errors exit 2, like any other argument problem.
const USAGE_EXIT_CODE: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let entrypoint = match shell_words::split(&cli.entrypoint) {
        Ok(entrypoint) if !entrypoint.is_empty() => entrypoint,
        Ok(_) => {
            eprintln!("repltest: --entrypoint must not be empty");
            std::process::exit(USAGE_EXIT_CODE);
        }
        Err(e) => {
            eprintln!("repltest: bad --entrypoint: {e}");
            std::process::exit(USAGE_EXIT_CODE);
        }
    };

    let transcript_text = match std::fs::read_to_string(&cli.transcript) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("repltest: cannot read {}: {e}", cli.transcript.display());
            std::process::exit(USAGE_EXIT_CODE);
        }
    };
    let transcript = match Transcript::new(&transcript_text) {
        Ok(transcript) => transcript,
        Err(e) => {
            eprintln!("repltest: {}: {e}", cli.transcript.display());
            std::process::exit(USAGE_EXIT_CODE);
        }
    };

    let result = verify_transcript(
        &transcript,
        VerifyOptions {
            entrypoint,
            check_exit_code: cli.check_exit_code,
            timeout: cli.timeout,
            cleanup_term_after: cli.cleanup_term_after,
            cleanup_kill_after: cli.cleanup_kill_after,
        },
    )
    .await;

    match result {
        Ok(result) if result.issues.is_empty() => {
            println!("Success! The test session matched the transcript.");
        }
        Ok(result) => {
            eprintln!(
                "Error: {}\nFinal state of screen:\n{}",
                result.issues.join("\n"),
                result.final_screen,
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "verification failed");
            eprintln!("repltest: {e}");
            std::process::exit(1);
        }
    }
}
