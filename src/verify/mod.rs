//! Transcript verification.
//!
//! Drives an entrypoint with the screen-scraping driver, typing each
//! line the transcript says the user typed and checking at every prompt
//! that the screen so far matches the transcript. A final full-screen
//! comparison runs after the child exits. Mismatches render as
//! side-by-side bordered panels with `-`/`+` annotations.

pub mod display;

use std::time::Duration;

use crate::driver::scrape::{ReplDriver, ReplDriverConfig};
use crate::driver::screen::Screen;
use crate::driver::{CallbackError, DriveError};

use display::{Display, side_by_side};

/// The expected terminal contents, parsed from a transcript file.
///
/// Rows shorter than the widest row are implicitly space-padded out to
/// `width`; coordinates past the end of the transcript read as `None`,
/// which is how the drive knows the session script is exhausted.
pub struct Transcript {
    lines: Vec<Vec<char>>,
    width: usize,
    height: usize,
    /// `(line, column)` just past the last transcript character.
    last_coord: (usize, usize),
}

/// Transcript parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript must be non-empty")]
    Empty,
}

impl Transcript {
    pub fn new(text: &str) -> Result<Self, TranscriptError> {
        let lines: Vec<Vec<char>> = text.lines().map(|line| line.chars().collect()).collect();
        let width = lines.iter().map(Vec::len).max().unwrap_or(0);
        if lines.is_empty() || width == 0 {
            return Err(TranscriptError::Empty);
        }
        let height = lines.len();
        let last_coord = (height - 1, lines[height - 1].len());
        Ok(Self {
            lines,
            width,
            height,
            last_coord,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// The character the user should see at `(line, column)`.
    ///
    /// Rows shorter than `width` read as trailing spaces; coordinates
    /// past the end of the transcript read as `None`.
    pub fn char_at(&self, line: usize, column: usize) -> Option<char> {
        assert!(column < self.width, "column out of bounds");

        if (line, column) > self.last_coord {
            return None;
        }
        let row = &self.lines[line];
        Some(row.get(column).copied().unwrap_or(' '))
    }
}

/// How much of the screen a comparison covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    /// Row-major positions strictly before the cursor — the part of the
    /// session that has already played out.
    UntilCursor,
    /// Everything, cursor position notwithstanding.
    FullScreen,
}

/// The transcript disagreed with the screen; `diff` is the rendered
/// side-by-side comparison.
#[derive(Debug, thiserror::Error)]
#[error("transcript mismatch:\n{diff}")]
pub struct MismatchError {
    pub diff: String,
}

/// Compare transcript and screen, returning the rendered diff on
/// mismatch.
fn identify_mismatch(transcript: &Transcript, screen: &Screen, check: Check) -> Option<String> {
    assert_eq!(
        transcript.width(),
        screen.columns() as usize,
        "screen must be sized to the transcript"
    );
    let width = transcript.width();
    let height = transcript.height().max(screen.lines() as usize);
    let cursor = screen.cursor();

    let mut expected_display = Display::new(width, height, Some("Expected"));
    let mut actual_display = Display::new(width, height, Some("Actual"));

    let mut found_mismatch = false;
    for y in 0..height {
        for x in 0..width {
            let expected_char = transcript.char_at(y, x).unwrap_or(' ');
            let actual_char = screen.char_at(y as u16, x as u16);

            expected_display.set(y, x, expected_char);
            actual_display.set(y, x, actual_char);

            let should_check = match check {
                Check::UntilCursor => (y, x) < (cursor.y as usize, cursor.x as usize),
                Check::FullScreen => true,
            };
            if should_check && expected_char != actual_char {
                found_mismatch = true;
                expected_display.annotate(y, x, '-');
                actual_display.annotate(y, x, '+');
            }
        }
    }

    actual_display.set_cursor(cursor.y as usize, cursor.x as usize);

    if !found_mismatch {
        return None;
    }
    Some(side_by_side(&expected_display, &actual_display))
}

/// What a verification run concluded.
pub struct VerifyResult {
    /// Human-readable problems; empty means the transcript reproduced.
    pub issues: Vec<String>,
    /// Bordered dump of the screen as the session left it.
    pub final_screen: String,
}

/// Options for [`verify_transcript`].
pub struct VerifyOptions {
    /// The command, already split with shell quoting rules.
    pub entrypoint: Vec<String>,
    pub check_exit_code: bool,
    pub timeout: Option<Duration>,
    pub cleanup_term_after: Option<Duration>,
    pub cleanup_kill_after: Option<Duration>,
}

/// Drive `entrypoint` against `transcript` and report every issue found.
///
/// Hard failures (spawn errors, I/O trouble) escape as errors; expected
/// failure modes — mismatch, timeout, nonzero exit — come back as
/// issues so the caller can report them all at once.
pub async fn verify_transcript(
    transcript: &Transcript,
    options: VerifyOptions,
) -> Result<VerifyResult, DriveError> {
    let mut driver = ReplDriver::new(ReplDriverConfig {
        entrypoint: options.entrypoint.clone(),
        env: None,
        columns: transcript.width() as u16,
        lines: transcript.height() as u16,
        timeout: options.timeout,
        cleanup_term_after: options.cleanup_term_after,
        cleanup_kill_after: options.cleanup_kill_after,
        // Exit codes are reported as issues below, not as drive errors.
        check_exit_code: false,
    });

    let mut handle_input = |screen: &Screen, _prompt: &str| {
        // The session so far must match the transcript up to (but not
        // including) the cursor.
        if let Some(diff) = identify_mismatch(transcript, screen, Check::UntilCursor) {
            return Err(CallbackError::from(MismatchError { diff }));
        }

        // The rest of the cursor's transcript row is what the user
        // typed next.
        let cursor = screen.cursor();
        let line: String = (cursor.x as usize..transcript.width())
            .filter_map(|x| transcript.char_at(cursor.y as usize, x))
            .collect();
        if line.is_empty() {
            // Past the end of the transcript: the session is over.
            return Ok(None);
        }

        // The command rarely fills the row; drop the implied padding.
        let mut payload = line.trim_end().to_string();
        payload.push('\n');
        Ok(Some(payload.into_bytes()))
    };
    let mut handle_output = |_screen: &Screen, _output: &[u8]| {};

    let drive_result = driver.drive(&mut handle_input, &mut handle_output).await;

    let mut issues = Vec::new();
    let mut mismatch = None;
    match drive_result {
        Ok(()) => {
            // The drive matched along the way; the screen must now match
            // in full, cursor position notwithstanding.
            mismatch = identify_mismatch(transcript, driver.screen(), Check::FullScreen);
        }
        Err(DriveError::Callback(e)) => match e.downcast::<MismatchError>() {
            Ok(e) => mismatch = Some(e.diff),
            Err(other) => return Err(DriveError::Callback(other)),
        },
        Err(DriveError::Timeout) => issues.push("session timed out".to_string()),
        Err(other) => return Err(other),
    }

    let exit_code = driver.exit_code().expect("exit code recorded after drive");
    if options.check_exit_code && exit_code != 0 {
        issues.push(format!(
            "'{}' exited with nonzero exit code: {exit_code}",
            shell_words::join(options.entrypoint.iter()),
        ));
    }
    if let Some(diff) = mismatch {
        issues.push(format!("Found a discrepancy. See diff below:\n{diff}"));
    }

    Ok(VerifyResult {
        issues,
        final_screen: Display::from_screen(driver.screen()).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- Transcript --

    #[test]
    fn empty_transcript_rejected() {
        assert!(matches!(Transcript::new(""), Err(TranscriptError::Empty)));
        assert!(matches!(Transcript::new("\n"), Err(TranscriptError::Empty)));
    }

    #[test]
    fn dimensions_follow_the_widest_row() {
        let t = Transcript::new("$ echo hiya\nhiya\n").unwrap();
        assert_eq!(t.width(), 11);
        assert_eq!(t.height(), 2);
    }

    #[test]
    fn short_rows_read_as_trailing_spaces() {
        let t = Transcript::new("$ echo hiya\nhiya\n").unwrap();
        assert_eq!(t.char_at(0, 0), Some('$'));
        assert_eq!(t.char_at(1, 0), Some('h'));
        assert_eq!(t.char_at(1, 4), Some(' '));
        assert_eq!(t.char_at(1, 10), Some(' '));
    }

    #[test]
    fn coordinates_past_the_end_are_none() {
        let t = Transcript::new("ab\ncd\n").unwrap();
        // Just past the final character.
        assert_eq!(t.char_at(1, 1), Some('d'));
        assert_eq!(t.char_at(2, 0), None);
        assert_eq!(t.char_at(5, 1), None);
    }

    #[test]
    fn column_just_past_last_char_on_last_row_is_space() {
        // The last row is "cd": its length marks the last coordinate,
        // and that column itself still reads as padding.
        let t = Transcript::new("abc\ncd\n").unwrap();
        assert_eq!(t.char_at(1, 2), Some(' '));
    }

    #[test]
    #[should_panic(expected = "column out of bounds")]
    fn column_beyond_width_is_a_caller_bug() {
        let t = Transcript::new("ab\n").unwrap();
        let _ = t.char_at(0, 2);
    }

    // -- identify_mismatch --

    fn screen_with(content: &[u8], columns: u16, lines: u16) -> Screen {
        let mut screen = Screen::new(columns, lines);
        screen.feed(content);
        screen
    }

    #[test]
    fn matching_screen_produces_no_diff() {
        let t = Transcript::new("$ true\n").unwrap();
        let screen = screen_with(b"$ true", 6, 1);
        assert!(identify_mismatch(&t, &screen, Check::FullScreen).is_none());
    }

    #[test]
    fn mismatch_is_annotated_on_both_panels() {
        let t = Transcript::new("expect\n").unwrap();
        let screen = screen_with(b"actual", 6, 1);
        let diff = identify_mismatch(&t, &screen, Check::FullScreen).unwrap();
        assert!(diff.contains("Expected"), "diff was:\n{diff}");
        assert!(diff.contains("Actual"), "diff was:\n{diff}");
        assert!(diff.contains('-'), "diff was:\n{diff}");
        assert!(diff.contains('+'), "diff was:\n{diff}");
        assert!(diff.contains("expect"), "diff was:\n{diff}");
        assert!(diff.contains("actual"), "diff was:\n{diff}");
    }

    #[test]
    fn until_cursor_ignores_everything_at_and_after_the_cursor() {
        let t = Transcript::new("ab\nzz\n").unwrap();
        // Screen agrees on row 0 only; cursor just past row 0.
        let screen = screen_with(b"ab", 2, 2);
        assert!(identify_mismatch(&t, &screen, Check::UntilCursor).is_none());
        // The full-screen check does see the difference on row 1.
        assert!(identify_mismatch(&t, &screen, Check::FullScreen).is_some());
    }

    #[test]
    fn rows_beyond_the_transcript_must_be_blank() {
        let t = Transcript::new("ab\n").unwrap();
        let screen = screen_with(b"ab\r\ncd", 2, 2);
        let diff = identify_mismatch(&t, &screen, Check::FullScreen).unwrap();
        assert!(diff.contains('+'), "diff was:\n{diff}");
    }
}
