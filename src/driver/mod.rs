//! REPL driving — shared plumbing for both strategies.
//!
//! Two drivers coexist on the same child-lifecycle substrate:
//! [`scrape::ReplDriver`] infers prompts from an emulated screen, while
//! [`instrumented::InstrumentedDriver`] observes the child's syscalls to
//! know when it genuinely wants input. This module holds what they
//! share: the error type, cooked-echo detection, and the input
//! injection rules.

pub mod instrumented;
pub mod scrape;
pub mod screen;

use std::collections::HashSet;
use std::error::Error;
use std::os::fd::BorrowedFd;

use nix::sys::termios::{self, LocalFlags, SpecialCharacterIndices};
use nix::unistd;

use crate::child::ChildError;
use crate::intercept::InterceptError;

/// Errors escaping a drive.
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error(transparent)]
    Child(#[from] ChildError),
    #[error(transparent)]
    Intercept(#[from] InterceptError),
    /// The wall-clock budget for the whole session ran out.
    #[error("session timed out")]
    Timeout,
    /// The child exited nonzero and the caller asked us to care.
    #[error("command '{entrypoint}' exited with nonzero exit code: {code}")]
    Process { entrypoint: String, code: i32 },
    /// The input callback failed; the session was torn down.
    #[error("input callback failed: {0}")]
    Callback(#[source] Box<dyn Error + Send + Sync>),
}

/// Callback-error channel: an `Err` aborts the drive and surfaces as
/// [`DriveError::Callback`].
pub type CallbackError = Box<dyn Error + Send + Sync>;

/// Is local echo enabled on this terminal?
///
/// Cooked-mode children leave echo on; line-editing children (readline)
/// turn it off while they read. The screen-scraping driver only types
/// while echo is off.
pub(crate) fn is_echo_enabled(tty: BorrowedFd<'_>) -> Result<bool, ChildError> {
    let attrs = termios::tcgetattr(tty).map_err(ChildError::Terminal)?;
    Ok(attrs.local_flags.contains(LocalFlags::ECHO))
}

/// The terminal's special-character byte values (`c_cc`), excluding the
/// VMIN/VTIME slots, which hold counts rather than characters.
pub(crate) fn special_char_vals(tty: BorrowedFd<'_>) -> Result<HashSet<u8>, ChildError> {
    let attrs = termios::tcgetattr(tty).map_err(ChildError::Terminal)?;
    let mut vals = HashSet::new();
    for (index, value) in attrs.control_chars.iter().enumerate() {
        if index == SpecialCharacterIndices::VMIN as usize
            || index == SpecialCharacterIndices::VTIME as usize
        {
            continue;
        }
        vals.insert(*value);
    }
    Ok(vals)
}

/// Inject an input payload into the child's terminal.
///
/// A payload containing any special character must be exactly that one
/// byte (the line discipline acts on it immediately); anything else must
/// be a newline-terminated line. One `write()` call — the payloads here
/// are far below the PTY buffer size, so a short write is a bug.
pub(crate) fn write_input(manager: BorrowedFd<'_>, payload: &[u8]) -> Result<(), ChildError> {
    assert!(!payload.is_empty(), "input must be longer than 0 bytes");

    let special = special_char_vals(manager)?;
    let has_special = payload.iter().any(|b| special.contains(b));
    if has_special {
        assert_eq!(
            payload.len(),
            1,
            "special characters must be sent exactly one at a time"
        );
    } else {
        assert!(
            payload.ends_with(b"\n"),
            "input without special characters must end in a newline"
        );
    }

    let written = unistd::write(manager, payload)
        .map_err(|e| ChildError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    assert_eq!(written, payload.len(), "short write injecting input");
    tracing::debug!(payload = ?String::from_utf8_lossy(payload), "wrote input");
    Ok(())
}

#[cfg(test)]
mod tests {
    use nix::pty::openpty;
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn fresh_pty_has_echo_enabled() {
        let pty = openpty(None, None).unwrap();
        assert!(is_echo_enabled(pty.master.as_fd()).unwrap());
    }

    #[test]
    fn special_chars_contain_eot_but_not_vmin_vtime_counts() {
        let pty = openpty(None, None).unwrap();
        let vals = special_char_vals(pty.master.as_fd()).unwrap();
        // VEOF defaults to ^D.
        assert!(vals.contains(&0x04));
        // A plain letter is never special.
        assert!(!vals.contains(&b'a'));
    }

    #[test]
    fn newline_terminated_input_is_written_whole() {
        let pty = openpty(None, None).unwrap();
        write_input(pty.master.as_fd(), b"hello\n").unwrap();
        let mut buf = [0u8; 64];
        // Echo comes back on the manager immediately.
        let n = unistd::read(pty.master.as_fd(), &mut buf).unwrap();
        assert!(n > 0);
    }

    #[test]
    #[should_panic(expected = "must end in a newline")]
    fn unterminated_input_rejected() {
        let pty = openpty(None, None).unwrap();
        let _ = write_input(pty.master.as_fd(), b"hello");
    }

    #[test]
    #[should_panic(expected = "one at a time")]
    fn special_char_mixed_with_text_rejected() {
        let pty = openpty(None, None).unwrap();
        let _ = write_input(pty.master.as_fd(), b"ab\x04\n");
    }
}
