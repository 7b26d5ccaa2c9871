//! Drive interactive terminal programs and verify their output.
//!
//! A child process runs on a freshly allocated pseudoterminal while its
//! rendered screen is emulated in memory. Two driving strategies decide
//! when to type the next line of input:
//!
//! - [`driver::scrape::ReplDriver`] infers prompts from the emulated
//!   screen (and refuses to type while local echo is on), and
//! - [`driver::instrumented::InstrumentedDriver`] runs the child under a
//!   seccomp user-notify filter and injects input exactly when the child
//!   blocks trying to read its controlling TTY.
//!
//! [`verify`] builds the transcript checker on top of the scraping
//! driver; the `repltest` binary is its CLI.
//!
//! Linux only: pseudoterminals, seccomp user-notify, `kcmp`, and
//! `/proc/<pid>/mem` are all load-bearing.

pub mod child;
pub mod cli;
pub mod driver;
pub mod duration;
pub mod intercept;
pub mod verify;
