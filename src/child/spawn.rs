//! Child process spawning — PTY allocation, fork, exec.
//!
//! Isolates the `unsafe` fork/exec code from the rest of the driver.
//! The child inherits a freshly allocated pseudoterminal as its
//! controlling TTY; in instrumented mode it additionally loads a seccomp
//! user-notify filter and hands the notify descriptor to the parent
//! before exec'ing.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::libc;
use nix::pty::{Winsize, openpty};
use nix::unistd::{ForkResult, Pid, execvp, execvpe, fork, setsid};

use crate::intercept;

use super::ChildError;

/// How a child should be instrumented, if at all.
pub struct Instrument {
    /// Syscall names the seccomp filter returns USER_NOTIF for.
    pub syscalls: Vec<String>,
}

/// A freshly forked child and the descriptors the parent retains.
#[derive(Debug)]
pub struct SpawnedChild {
    /// Child process PID.
    pub pid: Pid,
    /// Manager side of the PTY pair (non-blocking).
    pub manager: OwnedFd,
    /// Parent-side duplicate of the subsidiary. Retained only in
    /// instrumented mode: kcmp-based identity checks need a descriptor
    /// sharing the child's stdin file description, and a reopened
    /// `/dev/pts/<n>` would be a distinct one.
    pub subsidiary: Option<OwnedFd>,
    /// Parent end of the notify-fd handshake socketpair (instrumented
    /// mode only).
    pub handshake: Option<OwnedFd>,
}

/// Spawn a child process on a new PTY.
///
/// Allocates a PTY pair with the given dimensions, forks, sets the
/// subsidiary up as the child's controlling terminal, and execs the
/// command with `env` (or the inherited environment when `None`). The
/// manager fd is returned in non-blocking mode for async I/O.
///
/// # Safety
///
/// Uses `fork()` internally. The child branch sticks to
/// async-signal-safe operations, with one documented exception: in
/// instrumented mode the seccomp filter build allocates. That is sound
/// here because the parent runs a current-thread runtime — no other
/// thread can hold an allocator lock across the fork.
pub fn spawn_child(
    command: &[String],
    env: Option<&HashMap<String, String>>,
    winsize: &Winsize,
    instrument: Option<&Instrument>,
) -> Result<SpawnedChild, ChildError> {
    if command.is_empty() {
        return Err(ChildError::Exec("empty command".into()));
    }

    // Validate and prepare C strings before any resource allocation.
    // Reject arguments containing NUL bytes rather than silently
    // dropping them (which would mutate the effective argv).
    let c_args: Vec<CString> = command
        .iter()
        .map(|s| {
            CString::new(s.as_bytes())
                .map_err(|_| ChildError::Exec(format!("argument contains null byte: {s:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let c_env: Option<Vec<CString>> = match env {
        None => None,
        Some(env) => Some(
            env.iter()
                .map(|(k, v)| {
                    CString::new(format!("{k}={v}")).map_err(|_| {
                        ChildError::Exec(format!("environment entry contains null byte: {k:?}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
    };

    // The handshake socketpair must exist on both sides of the fork.
    let handshake = match instrument {
        Some(_) => Some(intercept::handshake_pair().map_err(ChildError::Intercept)?),
        None => None,
    };

    let pty = openpty(Some(winsize), None).map_err(ChildError::PtyAlloc)?;
    let manager = pty.master;
    let subsidiary = pty.slave;

    // Set the manager to non-blocking for tokio's AsyncFd.
    nix::fcntl::fcntl(
        &manager,
        nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
    )
    .map_err(ChildError::PtyAlloc)?;

    // SAFETY: see the function-level note. All heap allocation except
    // the instrumented filter build happens before fork.
    match unsafe { fork() }.map_err(ChildError::Fork)? {
        ForkResult::Parent { child } => {
            let (parent_handshake, retained_subsidiary) = match handshake {
                Some((parent_end, child_end)) => {
                    drop(child_end);
                    // Keep our duplicate of the subsidiary for identity
                    // checks, drain writes, and the foreground kick.
                    (Some(parent_end), Some(subsidiary))
                }
                None => {
                    drop(subsidiary);
                    (None, None)
                }
            };
            Ok(SpawnedChild {
                pid: child,
                manager,
                subsidiary: retained_subsidiary,
                handshake: parent_handshake,
            })
        }
        ForkResult::Child => {
            // -- Child branch --

            drop(manager);

            // New session, subsidiary as controlling terminal.
            if setsid().is_err() {
                unsafe { libc::_exit(1) };
            }
            let subsidiary_fd = subsidiary.as_raw_fd();
            if unsafe { libc::ioctl(subsidiary_fd, libc::TIOCSCTTY, 0) } < 0 {
                unsafe { libc::_exit(1) };
            }

            // Redirect stdin/stdout/stderr to the subsidiary. libc::dup2
            // directly — async-signal-safe, and nix's dup2 wants
            // `&mut OwnedFd` since 0.30.
            if unsafe { libc::dup2(subsidiary_fd, 0) } < 0
                || unsafe { libc::dup2(subsidiary_fd, 1) } < 0
                || unsafe { libc::dup2(subsidiary_fd, 2) } < 0
            {
                unsafe { libc::_exit(1) };
            }
            if subsidiary_fd > 2 {
                drop(subsidiary);
            } else {
                // The fd doubles as stdin/stdout/stderr now.
                std::mem::forget(subsidiary);
            }

            // Load the filter and hand the notify fd over before closing
            // stray descriptors (the handshake socket is one of them).
            if let (Some(instrument), Some((parent_end, child_end))) = (instrument, &handshake) {
                drop_parent_end_in_child(parent_end);
                if intercept::install_filter(&instrument.syscalls, child_end).is_err() {
                    unsafe { libc::_exit(1) };
                }
            }

            // Close all other inherited fds (best-effort).
            for fd in 3..1024 {
                unsafe { libc::close(fd) };
            }

            // Exec the command — replaces the process image.
            match &c_env {
                Some(c_env) => {
                    let _ = execvpe(&c_args[0], &c_args, c_env);
                }
                None => {
                    let _ = execvp(&c_args[0], &c_args);
                }
            }

            // Exec failed: 127 per the command-not-found convention.
            unsafe { libc::_exit(127) };
        }
    }
}

/// Close the parent's handshake end inside the child without running the
/// `OwnedFd` destructor twice (the parent still owns it).
fn drop_parent_end_in_child(parent_end: &OwnedFd) {
    unsafe { libc::close(parent_end.as_raw_fd()) };
}
