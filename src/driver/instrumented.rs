//! Syscall-aware driver.
//!
//! Rather than guessing at prompts, this driver knows when the child
//! wants input: the child runs under a seccomp user-notify filter, and a
//! blocked `read`/`poll`/`pselect6` aimed at its controlling TTY is the
//! signal to inject the next line. That makes it possible to drive
//! programs with no prompt at all (`cat`) and programs that poll
//! readiness before reading (readline).
//!
//! The subtle part is telling the child's echo apart from its real
//! output. After injecting a line the driver expects the cooked-mode
//! echo (terminated by `\r\n`) first, then output; notifications that
//! arrive in between may belong to a read racing our own write, so they
//! are answered CONTINUE but otherwise ignored. A read continued that
//! way blocks silently in the kernel, so once the state machine is back
//! to awaiting input, the foreground process group gets a SIGSTOP+
//! SIGCONT kick: the restarted syscall re-enters the filter and
//! notifies again.

use std::collections::HashMap;
use std::time::Duration;

use nix::pty::Winsize;
use tokio::time::Instant;

use crate::child::{Event, Instrument, RunningChild};
use crate::intercept::{Notification, READ_INTENT_SYSCALLS};

use super::{DriveError, write_input};

/// Configuration for a syscall-aware drive.
pub struct InstrumentedDriverConfig {
    pub entrypoint: Vec<String>,
    /// Environment for the child; `None` inherits ours.
    pub env: Option<HashMap<String, String>>,
    /// Syscall names to intercept; defaults to the read-intent set.
    pub syscalls: Vec<String>,
    /// Wall-clock budget for the whole session.
    pub timeout: Option<Duration>,
    pub cleanup_term_after: Option<Duration>,
    pub cleanup_kill_after: Option<Duration>,
    /// Fail the drive if the child exits nonzero.
    pub check_exit_code: bool,
}

impl InstrumentedDriverConfig {
    pub fn new(entrypoint: Vec<String>) -> Self {
        Self {
            entrypoint,
            env: None,
            syscalls: READ_INTENT_SYSCALLS.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            cleanup_term_after: None,
            cleanup_kill_after: None,
            check_exit_code: true,
        }
    }
}

/// Where the drive currently stands in the inject/echo/output cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveState {
    /// Waiting for the child to express intent to read its TTY.
    AwaitingStdinRead,
    /// Input written; the cooked-mode echo has not come back yet.
    SentInputAwaitingCrlf,
    /// Echo observed; waiting for the child to produce output.
    SentInputAwaitingOutput,
    /// Subsidiary closed or child reaped; the session is over.
    Done,
}

/// Decides the next input line. `None` ends the session.
pub type InputCallback<'a> = &'a mut dyn FnMut() -> Option<Vec<u8>>;

/// Observes raw output bytes.
pub type OutputCallback<'a> = &'a mut dyn FnMut(&[u8]);

/// Drives a REPL by observing its syscalls.
pub struct InstrumentedDriver {
    config: InstrumentedDriverConfig,
    state: DriveState,
    /// A notification was ignored while awaiting echo/output; the child
    /// may be silently blocked and needs a kick.
    skipped_notify: bool,
    /// Output accumulated since the last injection, while waiting for
    /// the echo terminator. The `\r\n` can arrive split across reads.
    pending_echo: Vec<u8>,
    exit_code: Option<i32>,
    started: bool,
}

impl InstrumentedDriver {
    pub fn new(config: InstrumentedDriverConfig) -> Self {
        Self {
            config,
            state: DriveState::AwaitingStdinRead,
            skipped_notify: false,
            pending_echo: Vec::new(),
            exit_code: None,
            started: false,
        }
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

        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let mut child = RunningChild::spawn(
            &self.config.entrypoint,
            self.config.env.as_ref(),
            &winsize,
            Some(Instrument {
                syscalls: self.config.syscalls.clone(),
            }),
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
        while self.state != DriveState::Done {
            match child.next_event(deadline).await? {
                Event::Deadline => return Err(DriveError::Timeout),
                Event::Output(output) => {
                    on_output(&output);
                    self.observe_output(child, &output)?;
                }
                Event::SubsidiaryClosed | Event::Exited(_) => {
                    self.state = DriveState::Done;
                }
                Event::StaleNotify => {}
                Event::Notified(notification) => {
                    self.handle_notification(child, notification, input_callback, on_output)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Advance the state machine on observed output.
    fn observe_output(&mut self, child: &RunningChild, output: &[u8]) -> Result<(), DriveError> {
        match self.state {
            DriveState::SentInputAwaitingCrlf => {
                // The echo terminator can arrive split across reads;
                // carry unmatched bytes into the next chunk.
                self.pending_echo.extend_from_slice(output);
                match scan_echo(&self.pending_echo) {
                    EchoScan::Partial => {}
                    EchoScan::EchoComplete => {
                        self.pending_echo.clear();
                        self.state = DriveState::SentInputAwaitingOutput;
                    }
                    EchoScan::EchoAndMore => {
                        // Echo plus more: the child already produced
                        // output (or redrew its prompt) — it is reading
                        // again.
                        self.pending_echo.clear();
                        self.transition_to_awaiting(child)?;
                    }
                }
            }
            DriveState::SentInputAwaitingOutput => {
                self.transition_to_awaiting(child)?;
            }
            DriveState::AwaitingStdinRead | DriveState::Done => {}
        }
        Ok(())
    }

    /// Return to `AwaitingStdinRead`, kicking the child if we skipped a
    /// notification on the way here.
    fn transition_to_awaiting(&mut self, child: &RunningChild) -> Result<(), DriveError> {
        self.state = DriveState::AwaitingStdinRead;
        if self.skipped_notify {
            self.skipped_notify = false;
            child.kick_foreground()?;
        }
        Ok(())
    }

    async fn handle_notification(
        &mut self,
        child: &mut RunningChild,
        notification: Notification,
        input_callback: InputCallback<'_>,
        on_output: OutputCallback<'_>,
    ) -> Result<(), DriveError> {
        if self.state != DriveState::AwaitingStdinRead {
            // Could be a read racing the input we just wrote; answering
            // without injecting keeps the child honest. If it blocks
            // silently we kick it after the next transition.
            tracing::debug!(syscall = %notification.syscall, state = ?self.state, "ignoring notification");
            self.skipped_notify = true;
            child.respond_continue(notification)?;
            return Ok(());
        }

        let wants_stdin = match notification
            .syscall
            .indicates_desire_to_read_fd(child.subsidiary_fd())
        {
            Ok(wants) => wants,
            Err(e) => {
                // Unblock the child before surfacing the failure.
                child.respond_continue(notification)?;
                return Err(e.into());
            }
        };
        if !wants_stdin {
            child.respond_continue(notification)?;
            return Ok(());
        }

        // The child is committed to reading its TTY and blocked until we
        // respond: flush anything it printed first (the prompt), then
        // feed it a line. On any failure the child still gets its
        // CONTINUE before the error surfaces.
        let drained = match child.drain_output().await {
            Ok(drained) => drained,
            Err(e) => {
                child.respond_continue(notification)?;
                return Err(e.into());
            }
        };
        if !drained.is_empty() {
            on_output(&drained);
        }

        match input_callback() {
            None => {
                child.respond_continue(notification)?;
                self.state = DriveState::Done;
            }
            Some(payload) => {
                if let Err(e) = write_input(child.manager_fd(), &payload) {
                    child.respond_continue(notification)?;
                    return Err(e.into());
                }
                child.respond_continue(notification)?;
                self.pending_echo.clear();
                self.state = DriveState::SentInputAwaitingCrlf;
            }
        }
        Ok(())
    }
}

/// What the output accumulated since an injection says about the echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoScan {
    /// No complete `\r\n` yet; keep accumulating.
    Partial,
    /// The accumulated bytes end exactly at the echo terminator.
    EchoComplete,
    /// Bytes follow the echo terminator.
    EchoAndMore,
}

fn scan_echo(pending: &[u8]) -> EchoScan {
    match find_crlf(pending) {
        None => EchoScan::Partial,
        Some(pos) if pos + 2 == pending.len() => EchoScan::EchoComplete,
        Some(_) => EchoScan::EchoAndMore,
    }
}

/// Position of the first `\r\n` in `bytes`.
fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\r\n")
}
