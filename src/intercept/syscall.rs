//! Intercepted syscall decoding and read-intent classification.
//!
//! A [`Syscall`] is a decoded seccomp notification. The classifier
//! answers one question: does this syscall express intent to read from a
//! file descriptor that aliases a given local descriptor? "Aliases"
//! means the same kernel open file description, checked with
//! `kcmp(KCMP_FILE)` — comparing paths under `/proc/<pid>/fd` is not
//! good enough because the same TTY can appear under different paths.
//!
//! Pointer arguments (`poll`'s fd array, `pselect6`'s fd_set) are read
//! from `/proc/<pid>/mem`. Callers must only classify while the child is
//! blocked in the intercepted call, so its memory and fd table are
//! stable.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::FileExt;

use libseccomp::ScmpNotifReq;
use nix::libc;
use nix::unistd;

use super::InterceptError;

/// From `include/uapi/linux/kcmp.h`.
const KCMP_FILE: libc::c_int = 0;

/// Syscalls that could express a desire to read from a file descriptor.
/// This is the default interception set for instrumented children.
pub const READ_INTENT_SYSCALLS: &[&str] = &["read", "poll", "pselect6"];

/// A decoded, currently-blocked child syscall.
///
/// Argument values are raw: pointers refer to the child's address space.
/// `pid` is the calling process (which may be a descendant of the child
/// we spawned — the filter is inherited across fork).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Read {
        pid: libc::pid_t,
        fd: i32,
        buf_ptr: u64,
        count: u64,
    },
    Poll {
        pid: libc::pid_t,
        fds_ptr: u64,
        nfds: u64,
        timeout: i32,
    },
    Pselect {
        pid: libc::pid_t,
        nfds: i32,
        readfds_ptr: u64,
        writefds_ptr: u64,
        exceptfds_ptr: u64,
        timeout_ptr: u64,
        sigmask_ptr: u64,
    },
}

impl Syscall {
    /// Decode a seccomp notification into a syscall variant.
    ///
    /// Panics on a syscall id outside the interception set: the filter
    /// only notifies for names we registered, so anything else is a
    /// protocol violation, not an error to recover from.
    pub fn from_notification(req: &ScmpNotifReq) -> Self {
        let pid = req.pid as libc::pid_t;
        let args = req.data.args;
        let name = req
            .data
            .syscall
            .get_name()
            .unwrap_or_else(|e| panic!("unresolvable syscall id in notification: {e}"));

        match name.as_str() {
            "read" => Syscall::Read {
                pid,
                fd: args[0] as i32,
                buf_ptr: args[1],
                count: args[2],
            },
            "poll" => Syscall::Poll {
                pid,
                fds_ptr: args[0],
                nfds: args[1],
                timeout: args[2] as i32,
            },
            "pselect6" => Syscall::Pselect {
                pid,
                nfds: args[0] as i32,
                readfds_ptr: args[1],
                writefds_ptr: args[2],
                exceptfds_ptr: args[3],
                timeout_ptr: args[4],
                sigmask_ptr: args[5],
            },
            other => panic!("notification for unrequested syscall: {other}"),
        }
    }

    /// Does this syscall express intent to read from a descriptor whose
    /// open file description is the same kernel object as `local_fd`?
    pub fn indicates_desire_to_read_fd(&self, local_fd: BorrowedFd<'_>) -> Result<bool, InterceptError> {
        let my_pid = unistd::getpid().as_raw();
        let my_fd = local_fd.as_raw_fd();

        match *self {
            Syscall::Read { pid, fd, .. } => {
                if fd < 0 {
                    return Ok(false);
                }
                same_file(my_pid, my_fd, pid, fd)
            }
            Syscall::Poll { pid, fds_ptr, nfds, .. } => {
                // Some processes wait to see that a descriptor is
                // readable before blocking in read().
                if nfds == 0 || fds_ptr == 0 {
                    return Ok(false);
                }
                for fd in read_poll_fds(pid, fds_ptr, nfds)? {
                    if fd >= 0 && same_file(my_pid, my_fd, pid, fd)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Syscall::Pselect {
                pid,
                nfds,
                readfds_ptr,
                ..
            } => {
                if nfds <= 0 || readfds_ptr == 0 {
                    return Ok(false);
                }
                for fd in read_fd_set(pid, readfds_ptr, nfds)? {
                    if same_file(my_pid, my_fd, pid, fd)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Syscall::Read { fd, buf_ptr, count, .. } => {
                write!(f, "read({fd}, {buf_ptr:#x}, {count})")
            }
            Syscall::Poll { fds_ptr, nfds, timeout, .. } => {
                write!(f, "poll({fds_ptr:#x}, {nfds}, {timeout})")
            }
            Syscall::Pselect { nfds, readfds_ptr, .. } => {
                write!(f, "pselect6({nfds}, {readfds_ptr:#x}, ...)")
            }
        }
    }
}

/// Check whether `(pid1, fd1)` and `(pid2, fd2)` refer to the same open
/// file description.
fn same_file(pid1: libc::pid_t, fd1: RawFd, pid2: libc::pid_t, fd2: RawFd) -> Result<bool, InterceptError> {
    // SAFETY: kcmp takes plain integer arguments and touches no memory.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_kcmp,
            pid1,
            pid2,
            KCMP_FILE,
            fd1 as libc::c_uint,
            fd2 as libc::c_uint,
        )
    };
    if rc == -1 {
        return Err(InterceptError::Kcmp(io::Error::last_os_error()));
    }
    Ok(rc == 0)
}

/// Read `len` bytes at `addr` in the child's address space.
fn read_child_mem(pid: libc::pid_t, addr: u64, len: usize) -> Result<Vec<u8>, InterceptError> {
    let mem = File::open(format!("/proc/{pid}/mem")).map_err(InterceptError::ChildMem)?;
    let mut buf = vec![0u8; len];
    mem.read_exact_at(&mut buf, addr)
        .map_err(InterceptError::ChildMem)?;
    Ok(buf)
}

/// Read the `fd` members of `nfds` `struct pollfd`s at `fds_ptr`.
///
/// `struct pollfd` is `{ int fd; short events; short revents; }` — see
/// poll(2).
fn read_poll_fds(pid: libc::pid_t, fds_ptr: u64, nfds: u64) -> Result<Vec<i32>, InterceptError> {
    const POLLFD_SIZE: usize = std::mem::size_of::<libc::pollfd>();
    let buf = read_child_mem(pid, fds_ptr, nfds as usize * POLLFD_SIZE)?;
    Ok(buf
        .chunks_exact(POLLFD_SIZE)
        .map(|chunk| i32::from_ne_bytes(chunk[..4].try_into().expect("pollfd starts with an int")))
        .collect())
}

/// fd_set geometry, fixed by the libc ABI: an array of long-sized
/// bitmasks totaling 1024 bits.
const FD_SETSIZE: usize = 1024;
const NFDBITS: usize = 8 * std::mem::size_of::<libc::c_long>();

/// Read the opaque fd_set bitmap at `readfds_ptr` and return the fds of
/// the set bits in positions `[0, nfds)`.
fn read_fd_set(pid: libc::pid_t, fds_ptr: u64, nfds: i32) -> Result<Vec<i32>, InterceptError> {
    let buf = read_child_mem(pid, fds_ptr, FD_SETSIZE / 8)?;
    let masks: Vec<libc::c_long> = buf
        .chunks_exact(std::mem::size_of::<libc::c_long>())
        .map(|chunk| libc::c_long::from_ne_bytes(chunk.try_into().expect("exact chunks")))
        .collect();

    let limit = (nfds as usize).min(FD_SETSIZE);
    let mut fds = Vec::new();
    for fd in 0..limit {
        let mask = masks[fd / NFDBITS];
        if (mask >> (fd % NFDBITS)) & 1 == 1 {
            fds.push(fd as i32);
        }
    }
    Ok(fds)
}
