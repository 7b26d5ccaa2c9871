//! Syscall interception via seccomp user-notify.
//!
//! The child installs a filter whose default action is ALLOW and which
//! returns USER_NOTIF for a configured set of syscall names, then hands
//! the notify descriptor to the parent over a Unix socketpair
//! (ancillary-fd transport). The parent receives notifications, decodes
//! them, and answers every one with CONTINUE so the kernel re-executes
//! the syscall — interception observes, it never alters.
//!
//! A notification can go stale if the blocked process is interrupted
//! before we answer; receive and respond then fail with ECANCELED or
//! ENOENT. Both are benign and skipped.

pub mod syscall;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libseccomp::error::SeccompError;
use libseccomp::{ScmpAction, ScmpFilterContext, ScmpNotifReq, ScmpNotifResp, ScmpSyscall};
use nix::libc;
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
};
use tokio::io::unix::AsyncFd;

pub use syscall::{READ_INTENT_SYSCALLS, Syscall};

/// From `include/uapi/linux/seccomp.h`.
const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

/// The handshake payload accompanying the notify descriptor.
const HANDSHAKE_PAYLOAD: &[u8] = b"notify_fd";

/// Interception errors.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("seccomp: {0}")]
    Seccomp(#[from] SeccompError),
    #[error("handshake failed: {0}")]
    Handshake(nix::Error),
    #[error("notify fd error: {0}")]
    Io(#[from] io::Error),
    #[error("reading child memory failed: {0}")]
    ChildMem(io::Error),
    #[error("kcmp failed: {0}")]
    Kcmp(io::Error),
}

fn is_stale(e: &SeccompError) -> bool {
    matches!(
        e.sysrawrc(),
        Some(rc) if rc == -libc::ECANCELED || rc == -libc::ENOENT
    )
}

/// Create the socketpair for the notify-fd handshake.
///
/// Returns `(parent, child)` ends. Close-on-exec is set on both: the
/// child end is used strictly between fork and exec.
pub fn handshake_pair() -> Result<(OwnedFd, OwnedFd), InterceptError> {
    socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(InterceptError::Handshake)
}

/// Child side, between fork and exec: build and load the filter, then
/// send the notify descriptor to the parent.
///
/// Loading the filter implies no-new-privs, which is what lets an
/// unprivileged process use user-notify in the first place. The notify
/// fd is close-on-exec, so nothing leaks into the exec'd image.
pub fn install_filter(syscalls: &[String], handshake: &OwnedFd) -> Result<(), InterceptError> {
    let mut ctx = ScmpFilterContext::new_filter(ScmpAction::Allow)?;
    for name in syscalls {
        ctx.add_rule(ScmpAction::Notify, ScmpSyscall::from_name(name)?)?;
    }
    ctx.load()?;
    let notify_fd = ctx.get_notify_fd()?;

    let iov = [io::IoSlice::new(HANDSHAKE_PAYLOAD)];
    let fds = [notify_fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    socket::sendmsg::<()>(
        handshake.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::empty(),
        None,
    )
    .map_err(InterceptError::Handshake)?;
    Ok(())
}

/// Parent side: receive the notify descriptor the child sent.
///
/// Panics on an unexpected payload — that is a wire-protocol violation,
/// not a condition to recover from.
pub fn receive_notify_fd(handshake: &OwnedFd) -> Result<OwnedFd, InterceptError> {
    let mut payload = [0u8; 64];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let (n, received_fd) = {
        let mut iov = [io::IoSliceMut::new(&mut payload)];
        let msg = socket::recvmsg::<()>(
            handshake.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(InterceptError::Handshake)?;

        let mut received_fd = None;
        for cmsg in msg.cmsgs().map_err(InterceptError::Handshake)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                assert_eq!(fds.len(), 1, "handshake must carry exactly one fd");
                // SAFETY: the kernel installed this fd into our table for
                // us; we are its sole owner.
                received_fd = Some(unsafe { OwnedFd::from_raw_fd(fds[0]) });
            }
        }
        (msg.bytes, received_fd)
    };

    assert_eq!(
        &payload[..n],
        HANDSHAKE_PAYLOAD,
        "unexpected handshake payload from child"
    );
    Ok(received_fd.expect("handshake must carry an ancillary fd"))
}

/// A received notification that has not been answered yet.
///
/// Every notification must be answered with CONTINUE before the event
/// loop moves on, or the child stays blocked forever. Dropping an
/// unanswered notification is therefore a bug.
#[derive(Debug)]
pub struct Notification {
    pub id: u64,
    pub syscall: Syscall,
    responded: bool,
}

impl Drop for Notification {
    fn drop(&mut self) {
        if !self.responded && !std::thread::panicking() {
            panic!("syscall notification dropped without a response; the child is still blocked");
        }
    }
}

/// What a receive on the notify fd produced.
#[derive(Debug)]
pub enum Received {
    Notification(Notification),
    /// The blocked process was interrupted before we could receive;
    /// nothing to respond to.
    Stale,
}

/// Parent-side handle to the child's seccomp notify descriptor.
pub struct NotifyFd {
    inner: AsyncFd<OwnedFd>,
}

impl NotifyFd {
    /// Wrap a notify descriptor received from the child.
    pub fn attach(fd: OwnedFd) -> Result<Self, InterceptError> {
        // Non-blocking, so a receive that races a cancellation surfaces
        // as EAGAIN instead of blocking the event loop.
        nix::fcntl::fcntl(&fd, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))
            .map_err(|e| InterceptError::Io(io::Error::from_raw_os_error(e as i32)))?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Wait for and receive the next notification.
    ///
    /// The corresponding child syscall is blocked until
    /// [`respond_continue`](Self::respond_continue) is called.
    pub async fn next(&mut self) -> Result<Received, InterceptError> {
        loop {
            let mut guard = self.inner.readable().await?;
            let outcome = guard.try_io(|inner| {
                match ScmpNotifReq::receive(inner.get_ref().as_raw_fd()) {
                    Ok(req) => Ok(Ok(req)),
                    Err(e) if e.sysrawrc() == Some(-libc::EAGAIN) => {
                        Err(io::Error::from(io::ErrorKind::WouldBlock))
                    }
                    Err(e) => Ok(Err(e)),
                }
            });
            match outcome {
                Ok(Ok(Ok(req))) => {
                    let syscall = Syscall::from_notification(&req);
                    tracing::debug!(%syscall, pid = req.pid, "syscall notification");
                    return Ok(Received::Notification(Notification {
                        id: req.id,
                        syscall,
                        responded: false,
                    }));
                }
                Ok(Ok(Err(e))) if is_stale(&e) => {
                    tracing::debug!("tried to receive a stale notify; ignoring");
                    return Ok(Received::Stale);
                }
                Ok(Ok(Err(e))) => return Err(e.into()),
                Ok(Err(e)) => return Err(InterceptError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Answer a notification with CONTINUE (value 0), letting the kernel
    /// re-execute the blocked syscall.
    ///
    /// A stale notification (process interrupted meanwhile) is not an
    /// error.
    pub fn respond_continue(&self, mut notification: Notification) -> Result<(), InterceptError> {
        notification.responded = true;
        let resp = ScmpNotifResp::new(notification.id, 0, 0, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
        match resp.respond(self.inner.get_ref().as_raw_fd()) {
            Ok(()) => Ok(()),
            Err(e) if is_stale(&e) => {
                tracing::debug!("tried to respond to a stale notify; ignoring");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
