//! Bordered screen rendering for diffs and final-state dumps.
//!
//! A [`Display`] is a width × height character grid with an optional
//! title and per-cell annotations. Rendered, it becomes a bordered
//! panel; cells with annotations get an extra row beneath them, which is
//! how the diff marks mismatches (`-` under expected, `+` under actual).

use crate::driver::screen::Screen;

/// One cell: a character plus an optional annotation mark.
#[derive(Debug, Clone)]
struct DisplayCell {
    ch: char,
    annotation: Option<char>,
}

impl Default for DisplayCell {
    fn default() -> Self {
        Self {
            ch: ' ',
            annotation: None,
        }
    }
}

/// A renderable character grid.
pub struct Display {
    width: usize,
    height: usize,
    title: Option<String>,
    cells: Vec<Vec<DisplayCell>>,
}

impl Display {
    pub fn new(width: usize, height: usize, title: Option<&str>) -> Self {
        Self {
            width,
            height,
            title: title.map(str::to_owned),
            cells: vec![vec![DisplayCell::default(); width]; height],
        }
    }

    /// Snapshot a screen, cursor overlaid as `█`.
    pub fn from_screen(screen: &Screen) -> Self {
        let width = screen.columns() as usize;
        let height = screen.lines() as usize;
        let mut display = Self::new(width, height, None);
        for y in 0..height {
            for x in 0..width {
                display.set(y, x, screen.char_at(y as u16, x as u16));
            }
        }
        let cursor = screen.cursor();
        display.set_cursor(cursor.y as usize, cursor.x as usize);
        display
    }

    pub fn set(&mut self, y: usize, x: usize, ch: char) {
        self.cells[y][x].ch = ch;
    }

    pub fn annotate(&mut self, y: usize, x: usize, mark: char) {
        self.cells[y][x].annotation = Some(mark);
    }

    /// Overlay the cursor block, clamped into the grid (a cursor parked
    /// in the pending-wrap column still renders).
    pub fn set_cursor(&mut self, y: usize, x: usize) {
        let y = y.min(self.height - 1);
        let x = x.min(self.width - 1);
        self.set(y, x, '█');
    }

    fn horizontal_border(&self, description: Option<&str>) -> String {
        let max_len = self.width.saturating_sub(2);
        let desc = match description {
            None => String::new(),
            Some(d) => {
                let truncated: String = d.chars().take(max_len).collect();
                format!(" {truncated} ")
            }
        };
        // Center, extra dash on the right when the padding is odd.
        let margin = self.width.saturating_sub(desc.chars().count());
        let left = margin / 2;
        let right = margin - left;
        format!("+{}{}{}+", "-".repeat(left), desc, "-".repeat(right))
    }

    /// The panel, line by line: top border, rows (with annotation rows
    /// where present), bottom border.
    pub fn rendered_lines(&self) -> Vec<String> {
        let mut lines = vec![self.horizontal_border(self.title.as_deref())];

        for row in &self.cells {
            let content: String = row.iter().map(|cell| cell.ch).collect();
            lines.push(format!("|{content}|"));

            if row.iter().any(|cell| cell.annotation.is_some()) {
                let marks: String = row.iter().map(|cell| cell.annotation.unwrap_or(' ')).collect();
                lines.push(format!(" {marks} "));
            }
        }

        lines.push(self.horizontal_border(None));
        lines
    }
}

impl std::fmt::Display for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.rendered_lines().join("\n"))
    }
}

/// Join two panels of equal height line-by-line with a gutter.
pub fn side_by_side(left: &Display, right: &Display) -> String {
    let left_lines = left.rendered_lines();
    let right_lines = right.rendered_lines();
    debug_assert_eq!(
        left_lines.len(),
        right_lines.len(),
        "panels must annotate the same rows"
    );
    left_lines
        .iter()
        .zip(right_lines.iter())
        .map(|(l, r)| format!("{l}    {r}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_empty_grid_with_borders() {
        let display = Display::new(4, 2, None);
        assert_eq!(display.to_string(), "+----+\n|    |\n|    |\n+----+");
    }

    #[test]
    fn title_is_centered_with_dashes() {
        let display = Display::new(11, 1, Some("Expected"));
        let lines = display.rendered_lines();
        assert_eq!(lines[0], "+ Expected -+");
        // Bottom border carries no title.
        assert_eq!(lines.last().unwrap(), "+-----------+");
    }

    #[test]
    fn odd_margin_puts_extra_dash_right() {
        let display = Display::new(13, 1, Some("Expected"));
        assert_eq!(display.rendered_lines()[0], "+- Expected --+");
    }

    #[test]
    fn long_title_is_truncated() {
        let display = Display::new(6, 1, Some("Extremely long title"));
        let border = &display.rendered_lines()[0];
        assert_eq!(border.chars().count(), 8);
        assert!(border.starts_with('+') && border.ends_with('+'));
    }

    #[test]
    fn annotations_add_a_row() {
        let mut display = Display::new(5, 2, None);
        display.set(0, 0, 'a');
        display.set(0, 1, 'b');
        display.annotate(0, 1, '-');
        display.annotate(0, 3, '-');

        let lines = display.rendered_lines();
        assert_eq!(
            lines,
            vec![
                "+-----+".to_string(),
                "|ab   |".to_string(),
                "  - -  ".to_string(),
                "|     |".to_string(),
                "+-----+".to_string(),
            ]
        );
    }

    #[test]
    fn from_screen_overlays_cursor() {
        let mut screen = Screen::new(5, 2);
        screen.feed(b"hi");
        let display = Display::from_screen(&screen);
        assert_eq!(display.to_string(), "+-----+\n|hi█  |\n|     |\n+-----+");
    }

    #[test]
    fn side_by_side_joins_with_gutter() {
        let left = Display::new(3, 1, None);
        let right = Display::new(3, 1, None);
        assert_eq!(
            side_by_side(&left, &right),
            "+---+    +---+\n|   |    |   |\n+---+    +---+"
        );
    }
}
