//! Screen-scraping driver.
//!
//! Emulates the child's terminal and infers prompts from the rendered
//! screen: a prompt is a nonempty row prefix the cursor has come to rest
//! on, on a row where no prompt was answered yet. Input is typed only
//! while local echo is disabled — a cooked-mode read would echo our
//! bytes before the child ever saw them, so a child that reads with echo
//! on is deliberately left waiting (and the session times out).

use std::collections::HashMap;
use std::time::Duration;

use nix::pty::Winsize;
use tokio::time::Instant;

use crate::child::{Event, RunningChild};

use super::screen::Screen;
use super::{CallbackError, DriveError, is_echo_enabled, write_input};

/// Configuration for a screen-scraping drive.
pub struct ReplDriverConfig {
    pub entrypoint: Vec<String>,
    /// Environment for the child; `None` inherits ours.
    pub env: Option<HashMap<String, String>>,
    pub columns: u16,
    pub lines: u16,
    /// Wall-clock budget for the whole session.
    pub timeout: Option<Duration>,
    pub cleanup_term_after: Option<Duration>,
    pub cleanup_kill_after: Option<Duration>,
    /// Fail the drive if the child exits nonzero.
    pub check_exit_code: bool,
}

/// Drives a REPL by watching its emulated screen.
///
/// The screen and the child's exit code remain available after
/// [`drive`](Self::drive) returns, successfully or not — the transcript
/// verifier renders both.
pub struct ReplDriver {
    config: ReplDriverConfig,
    screen: Screen,
    exit_code: Option<i32>,
    last_prompt_y: Option<u16>,
    started: bool,
    done: bool,
}

/// Decides what to type at a detected prompt. `Ok(None)` ends the
/// session; an `Err` aborts the drive.
pub type InputCallback<'a> =
    &'a mut dyn FnMut(&Screen, &str) -> Result<Option<Vec<u8>>, CallbackError>;

/// Observes raw output after it has been fed to the screen.
pub type OutputCallback<'a> = &'a mut dyn FnMut(&Screen, &[u8]);

impl ReplDriver {
    pub fn new(config: ReplDriverConfig) -> Self {
        let screen = Screen::new(config.columns, config.lines);
        Self {
            config,
            screen,
            exit_code: None,
            last_prompt_y: None,
            started: false,
            done: false,
        }
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    /// The child's exit code; recorded once the drive has finished.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Run the session to completion.
    ///
    /// The child is always shut down before this returns, whatever the
    /// outcome of the drive itself.
    pub async fn drive(
        &mut self,
        input_callback: InputCallback<'_>,
        on_output: OutputCallback<'_>,
    ) -> Result<(), DriveError> {
        assert!(!self.started, "cannot drive a driver twice");
        self.started = true;

        // The PTY window size is deliberately left unset: announcing the
        // transcript's (often tiny) dimensions would make line editors
        // wrap and redraw at those widths, diverging from the emulator.
        // The emulator alone defines the screen geometry.
        let winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let mut child = RunningChild::spawn(
            &self.config.entrypoint,
            self.config.env.as_ref(),
            &winsize,
            None,
        )?;

        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let loop_result = self.run(&mut child, deadline, input_callback, on_output).await;

        let exit_code = child
            .shutdown(self.config.cleanup_term_after, self.config.cleanup_kill_after)
            .await?;
        self.exit_code = Some(exit_code);

        loop_result?;

        if self.config.check_exit_code && exit_code != 0 {
            return Err(DriveError::Process {
                entrypoint: shell_words::join(self.config.entrypoint.iter()),
                code: exit_code,
            });
        }
        Ok(())
    }

    async fn run(
        &mut self,
        child: &mut RunningChild,
        deadline: Option<Instant>,
        input_callback: InputCallback<'_>,
        on_output: OutputCallback<'_>,
    ) -> Result<(), DriveError> {
        while !self.done {
            match child.next_event(deadline).await? {
                Event::Deadline => return Err(DriveError::Timeout),
                Event::Output(output) => {
                    self.handle_output(child, &output, input_callback, on_output)?;
                }
                Event::SubsidiaryClosed => {
                    // No process is attached to the terminal anymore;
                    // there is nothing left to drive.
                    self.done = true;
                }
                Event::Exited(_) => {
                    // Keep reading: output can still be buffered in the
                    // PTY, and the manager reports EIO once it runs dry.
                }
                Event::Notified(_) | Event::StaleNotify => {
                    unreachable!("screen-scraping child is not instrumented")
                }
            }
        }
        Ok(())
    }

    fn handle_output(
        &mut self,
        child: &RunningChild,
        output: &[u8],
        input_callback: InputCallback<'_>,
        on_output: OutputCallback<'_>,
    ) -> Result<(), DriveError> {
        self.screen.feed(output);
        on_output(&self.screen, output);

        let Some(prompt) = self.current_prompt() else {
            return Ok(());
        };
        // A cooked-mode read would echo whatever we type before the
        // child saw it; only line-editing children (echo off) are safe
        // to type into.
        if is_echo_enabled(child.manager_fd())? {
            return Ok(());
        }
        self.handle_prompt(child, &prompt, input_callback)
    }

    /// The row prefix under the cursor, if it looks like a fresh prompt.
    fn current_prompt(&self) -> Option<String> {
        let cursor = self.screen.cursor();

        // Don't rediscover the prompt we already answered: once we have
        // typed at "$ ", the row reading "$ ls" is not a new prompt.
        if Some(cursor.y) == self.last_prompt_y {
            return None;
        }
        // A prompt must have some characters.
        if cursor.x == 0 {
            return None;
        }
        Some(self.screen.row_prefix(cursor.y, cursor.x))
    }

    fn handle_prompt(
        &mut self,
        child: &RunningChild,
        prompt: &str,
        input_callback: InputCallback<'_>,
    ) -> Result<(), DriveError> {
        tracing::debug!(prompt = ?prompt, "child is prompting");

        let payload = input_callback(&self.screen, prompt).map_err(DriveError::Callback)?;
        let Some(payload) = payload else {
            // End of session: stop driving and let teardown hang up the
            // terminal.
            self.done = true;
            return Ok(());
        };

        write_input(child.manager_fd(), &payload)?;
        self.last_prompt_y = Some(self.screen.cursor().y);
        Ok(())
    }
}
