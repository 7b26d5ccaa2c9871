//! Child lifecycle and the shared event-loop substrate.
//!
//! A [`RunningChild`] owns every descriptor tied to one spawned child:
//! the PTY manager, the SIGCHLD stream, and (in instrumented mode) the
//! seccomp notify fd plus a retained subsidiary duplicate. Both driving
//! strategies pump events out of it one at a time with
//! [`next_event`](RunningChild::next_event) and tear it down with
//! [`shutdown`](RunningChild::shutdown).

mod spawn;

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use nix::libc;
use nix::pty::Winsize;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, Pid};
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{Signal as SignalStream, SignalKind, signal as signal_stream};
use tokio::time::Instant;

use crate::intercept::{self, InterceptError, Notification, NotifyFd, Received};

pub use spawn::Instrument;

/// Child lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("PTY allocation failed: {0}")]
    PtyAlloc(nix::Error),
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("terminal error: {0}")]
    Terminal(nix::Error),
    #[error("wait failed: {0}")]
    Wait(nix::Error),
    #[error("signal error: {0}")]
    Signal(nix::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Intercept(#[from] InterceptError),
}

/// One event out of the readiness wait.
#[derive(Debug)]
pub enum Event {
    /// The child (or the line discipline) wrote bytes to the PTY.
    Output(Vec<u8>),
    /// The subsidiary side of the PTY closed — no process is attached
    /// to the terminal anymore.
    SubsidiaryClosed,
    /// The child was reaped; the exit code is now recorded.
    Exited(i32),
    /// An intercepted syscall is blocked awaiting a response.
    Notified(Notification),
    /// A notification went stale before we could receive it.
    StaleNotify,
    /// The deadline passed before anything became ready.
    Deadline,
}

/// A spawned child plus every parent-side resource tied to it.
///
/// Dropping a `RunningChild` whose exit code was never recorded kills
/// the child outright — the backstop for panic paths. Orderly teardown
/// goes through [`shutdown`](Self::shutdown).
pub struct RunningChild {
    pid: Pid,
    manager: Option<AsyncFd<OwnedFd>>,
    sigchld: SignalStream,
    notify: Option<NotifyFd>,
    subsidiary: Option<OwnedFd>,
    exit_code: Option<i32>,
    subsidiary_closed: bool,
}

impl RunningChild {
    /// Fork `command` under a fresh PTY.
    ///
    /// The SIGCHLD stream is installed before the fork so an instant
    /// exit cannot be missed. With `instrument`, the child loads the
    /// seccomp filter and the parent blocks until the notify descriptor
    /// arrives over the handshake socketpair.
    pub fn spawn(
        command: &[String],
        env: Option<&HashMap<String, String>>,
        winsize: &Winsize,
        instrument: Option<Instrument>,
    ) -> Result<Self, ChildError> {
        let sigchld = signal_stream(SignalKind::child())?;

        let spawned = spawn::spawn_child(command, env, winsize, instrument.as_ref())?;
        tracing::info!(pid = spawned.pid.as_raw(), command = ?command, "spawned child");

        let notify = match spawned.handshake {
            Some(handshake) => {
                let notify_fd = intercept::receive_notify_fd(&handshake)?;
                Some(NotifyFd::attach(notify_fd)?)
            }
            None => None,
        };

        Ok(Self {
            pid: spawned.pid,
            manager: Some(AsyncFd::new(spawned.manager)?),
            sigchld,
            notify,
            subsidiary: spawned.subsidiary,
            exit_code: None,
            subsidiary_closed: false,
        })
    }

    /// The recorded exit code, if the child has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Borrow the manager descriptor for writes (input injection).
    pub fn manager_fd(&self) -> BorrowedFd<'_> {
        self.manager.as_ref().expect("manager closed").get_ref().as_fd()
    }

    /// Borrow the retained subsidiary duplicate (instrumented mode).
    pub fn subsidiary_fd(&self) -> BorrowedFd<'_> {
        self.subsidiary
            .as_ref()
            .expect("no subsidiary retained for this child")
            .as_fd()
    }

    /// Wait for the next event, bounded by `deadline`.
    ///
    /// Readiness is consumed in a fixed priority order: manager output
    /// first, then SIGCHLD, then syscall notifications, then the
    /// deadline. Output and exit processing must precede notification
    /// handling because the classifier reads `/proc/<pid>/mem` and
    /// wants the rest of the world already settled.
    pub async fn next_event(&mut self, deadline: Option<Instant>) -> Result<Event, ChildError> {
        loop {
            let manager = self.manager.as_ref().expect("manager closed");
            let sigchld = &mut self.sigchld;
            let notify = &mut self.notify;

            tokio::select! {
                biased;

                guard = manager.readable() => {
                    assert!(!self.subsidiary_closed, "manager readable after subsidiary closed");
                    let mut guard = guard?;
                    let mut buf = [0u8; 1024];
                    match guard.try_io(|inner| nix_read(inner.get_ref().as_fd(), &mut buf)) {
                        Ok(Ok(n)) => {
                            // A PTY manager read never succeeds empty.
                            assert!(n > 0, "zero-length manager read");
                            tracing::debug!(bytes = ?String::from_utf8_lossy(&buf[..n]), "manager output");
                            return Ok(Event::Output(buf[..n].to_vec()));
                        }
                        Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                            // EIO when the last process dropped the
                            // subsidiary side.
                            tracing::debug!("subsidiary side of the TTY closed");
                            self.subsidiary_closed = true;
                            return Ok(Event::SubsidiaryClosed);
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_would_block) => continue,
                    }
                }

                _ = sigchld.recv() => {
                    if let Some(code) = self.reap()? {
                        return Ok(Event::Exited(code));
                    }
                    // Stop/continue wakeups (e.g. from the kick) land
                    // here; nothing to report.
                    continue;
                }

                received = next_notification(notify) => {
                    return Ok(match received? {
                        Received::Notification(n) => Event::Notified(n),
                        Received::Stale => Event::StaleNotify,
                    });
                }

                () = sleep_until_opt(deadline) => {
                    return Ok(Event::Deadline);
                }
            }
        }
    }

    /// Reap the child if it exited. Records the exit code exactly once.
    fn reap(&mut self) -> Result<Option<i32>, ChildError> {
        if self.exit_code.is_some() {
            // The process-wide SIGCHLD stream wakes for any child, not
            // just ours; once our exit is recorded there is nothing
            // left to reap.
            return Ok(None);
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(ChildError::Wait)? {
            WaitStatus::StillAlive => Ok(None),
            WaitStatus::Exited(pid, code) => {
                assert_eq!(pid, self.pid, "reaped an unexpected child");
                tracing::debug!(pid = pid.as_raw(), code, "child exited");
                self.exit_code = Some(code);
                Ok(self.exit_code)
            }
            WaitStatus::Signaled(pid, sig, _) => {
                assert_eq!(pid, self.pid, "reaped an unexpected child");
                let code = 128 + sig as i32;
                tracing::debug!(pid = pid.as_raw(), signal = %sig, code, "child killed by signal");
                self.exit_code = Some(code);
                Ok(self.exit_code)
            }
            _ => Ok(None),
        }
    }

    /// Answer an intercepted syscall with CONTINUE.
    pub fn respond_continue(&self, notification: Notification) -> Result<(), ChildError> {
        let notify = self.notify.as_ref().expect("child is not instrumented");
        Ok(notify.respond_continue(notification)?)
    }

    /// Drain all output the child may already have emitted.
    ///
    /// PTY output carries no "no more data" signal, so we write a NUL
    /// byte into the subsidiary end and read the manager until it
    /// surfaces, then strip it. Relies on the child not emitting NUL
    /// bytes of its own; only meaningful while the child is blocked in
    /// an intercepted syscall (nothing else can be mid-write).
    pub async fn drain_output(&mut self) -> Result<Vec<u8>, ChildError> {
        let subsidiary = self
            .subsidiary
            .as_ref()
            .expect("drain requires a retained subsidiary");
        unistd::write(subsidiary, b"\0")
            .map_err(|e| ChildError::Io(io::Error::from_raw_os_error(e as i32)))?;

        let mut drained = Vec::new();
        loop {
            let manager = self.manager.as_ref().expect("manager closed");
            let mut guard = manager.readable().await?;
            let mut buf = [0u8; 1024];
            match guard.try_io(|inner| nix_read(inner.get_ref().as_fd(), &mut buf)) {
                Ok(Ok(n)) => {
                    let chunk = &buf[..n];
                    if let Some(pos) = chunk.iter().position(|&b| b == 0) {
                        // The child is blocked, so our sentinel is the
                        // last byte in flight.
                        assert_eq!(pos, n - 1, "output after the drain sentinel");
                        drained.extend_from_slice(&chunk[..pos]);
                        break;
                    }
                    drained.extend_from_slice(chunk);
                }
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    self.subsidiary_closed = true;
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
        tracing::debug!(bytes = drained.len(), "drained pending output");
        Ok(drained)
    }

    /// Interrupt the foreground process group with SIGSTOP+SIGCONT.
    ///
    /// A continued process restarts its blocked syscall, which re-enters
    /// the seccomp filter and produces a fresh notification — the escape
    /// hatch for a read whose notification we deliberately skipped.
    pub fn kick_foreground(&self) -> Result<(), ChildError> {
        let subsidiary = self
            .subsidiary
            .as_ref()
            .expect("kick requires a retained subsidiary");
        let pgrp = unistd::tcgetpgrp(subsidiary).map_err(ChildError::Terminal)?;
        tracing::debug!(pgrp = pgrp.as_raw(), "kicking foreground process group");
        let group = Pid::from_raw(-pgrp.as_raw());
        signal::kill(group, Signal::SIGSTOP).map_err(ChildError::Signal)?;
        signal::kill(group, Signal::SIGCONT).map_err(ChildError::Signal)?;
        Ok(())
    }

    /// Gracefully shut the child down and return its exit code.
    ///
    /// Closes the manager (the kernel hangs up the session), then
    /// escalates: wait `term_after` for a natural exit, SIGTERM, wait
    /// `kill_after`, SIGKILL, wait forever. `None` waits forever before
    /// escalating. A no-op returning the recorded code if the child
    /// already exited.
    pub async fn shutdown(
        &mut self,
        term_after: Option<Duration>,
        kill_after: Option<Duration>,
    ) -> Result<i32, ChildError> {
        // Teardown order is the reverse of acquisition.
        self.notify = None;
        self.subsidiary = None;
        self.manager = None;

        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        if let Some(code) = self.wait_exit(term_after).await? {
            return Ok(code);
        }
        tracing::info!(pid = self.pid.as_raw(), "child still running; sending SIGTERM");
        signal::kill(self.pid, Signal::SIGTERM).map_err(ChildError::Signal)?;

        if let Some(code) = self.wait_exit(kill_after).await? {
            return Ok(code);
        }
        tracing::warn!(pid = self.pid.as_raw(), "child ignored SIGTERM; sending SIGKILL");
        signal::kill(self.pid, Signal::SIGKILL).map_err(ChildError::Signal)?;

        let code = self.wait_exit(None).await?.expect("SIGKILL is unconditional");
        Ok(code)
    }

    /// Wait up to `limit` for the child to exit; `None` waits forever.
    async fn wait_exit(&mut self, limit: Option<Duration>) -> Result<Option<i32>, ChildError> {
        let deadline = limit.map(|l| Instant::now() + l);
        loop {
            // Check first: the exit may predate this call, with its
            // SIGCHLD already consumed by the event loop.
            if self.exit_code.is_none() {
                self.reap()?;
            }
            if let Some(code) = self.exit_code {
                tracing::debug!(pid = self.pid.as_raw(), code, "child terminated");
                return Ok(Some(code));
            }

            tokio::select! {
                _ = self.sigchld.recv() => {}
                () = sleep_until_opt(deadline) => return Ok(None),
            }
        }
    }
}

impl Drop for RunningChild {
    fn drop(&mut self) {
        // Panic-path backstop: never leak a running child.
        if self.exit_code.is_none() {
            tracing::warn!(pid = self.pid.as_raw(), "killing unreaped child on drop");
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Read from a borrowed fd, converting nix errors to `io::Error`.
fn nix_read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    unistd::read(fd, buf).map_err(|e| io::Error::from_raw_os_error(e as i32))
}

async fn next_notification(notify: &mut Option<NotifyFd>) -> Result<Received, InterceptError> {
    match notify.as_mut() {
        Some(notify) => notify.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
