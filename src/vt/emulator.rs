//! ANSI/VT parser + terminal emulator, §4.3.1. Built on `vte::Parser` +
//! `Perform`, the same split the pack uses in
//! `mike-lead-maestro/src-tauri/src/core/vte_backend.rs`'s `VteHandler`
//! (cursor motion, SGR, OSC-title, DEC private modes) — generalized
//! from that backend's cursor-tracking-only subset to the full §4.3.1
//! operation set: erase, scroll region, save/restore cursor, insert/
//! delete line/char, 256/24-bit SGR colors, alt-screen swap.

use std::time::Instant;

use vte::{Params, Parser, Perform};

use super::cell::{Attrs, Cell, Color};
use super::grid::Grid;

#[derive(Debug, Clone, Copy)]
struct SavedCursor {
    x: usize,
    y: usize,
    fg: Color,
    bg: Color,
    attrs: Attrs,
}

/// Owns the grid, cursor, scroll region, and current SGR state for one
/// session. Lives inside the Subscription Bus; torn down per §4.4.
pub struct TerminalEmulator {
    parser: Parser,
    grid: Grid,
    alt_grid: Option<Grid>,
    cursor_x: usize,
    cursor_y: usize,
    scroll_top: usize,
    scroll_bottom: usize,
    cur_fg: Color,
    cur_bg: Color,
    cur_attrs: Attrs,
    saved_cursor: Option<SavedCursor>,
    cursor_visible: bool,
    alt_screen: bool,
    alive: bool,
    /// Set when the last `put_char` filled the final column: the real
    /// wrap (and its newline) is deferred until the next printable
    /// character, so `cursor_x` never itself reaches `cols` (§4.3.1
    /// cursor invariant). Cleared by any explicit cursor move.
    pending_wrap: bool,
    pub last_update: Instant,
}

impl TerminalEmulator {
    pub fn new(cols: usize, rows: usize, scrollback_limit: usize) -> Self {
        Self {
            parser: Parser::new(),
            grid: Grid::new(cols, rows, scrollback_limit),
            alt_grid: None,
            cursor_x: 0,
            cursor_y: 0,
            scroll_top: 0,
            scroll_bottom: rows.saturating_sub(1),
            cur_fg: Color::Default,
            cur_bg: Color::Default,
            cur_attrs: Attrs::empty(),
            saved_cursor: None,
            cursor_visible: true,
            alt_screen: false,
            alive: true,
            pending_wrap: false,
            last_update: Instant::now(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let mut parser = std::mem::replace(&mut self.parser, Parser::new());
        {
            let mut performer = Performer { emu: self };
            for &b in bytes {
                parser.advance(&mut performer, b);
            }
        }
        self.parser = parser;
        self.last_update = Instant::now();
    }

    /// §4.3 Event handling, `"r"` events: right-pad or truncate, clamp
    /// cursor.
    pub fn resize(&mut self, cols: usize, rows: usize) {
        self.grid.resize(cols, rows);
        if let Some(alt) = &mut self.alt_grid {
            alt.resize(cols, rows);
        }
        self.cursor_x = self.cursor_x.min(cols.saturating_sub(1));
        self.cursor_y = self.cursor_y.min(rows.saturating_sub(1));
        self.scroll_top = 0;
        self.scroll_bottom = rows.saturating_sub(1);
        self.pending_wrap = false;
        self.last_update = Instant::now();
    }

    /// §4.3 Event handling, `"x"` events: stop tailing, keep serving
    /// the last buffer.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    pub const fn is_alive(&self) -> bool {
        self.alive
    }

    pub const fn cursor(&self) -> (usize, usize) {
        (self.cursor_x, self.cursor_y)
    }

    pub const fn cols(&self) -> usize {
        self.grid.cols()
    }

    pub const fn rows(&self) -> usize {
        self.grid.rows()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub const fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    fn active_grid_mut(&mut self) -> &mut Grid {
        if self.alt_screen {
            self.alt_grid.get_or_insert_with(|| {
                Grid::new(self.grid.cols(), self.grid.rows(), 0)
            })
        } else {
            &mut self.grid
        }
    }

    fn put_char(&mut self, ch: char) {
        if self.pending_wrap {
            self.newline();
            self.pending_wrap = false;
        }
        let cols = self.active_grid_mut().cols();
        let (x, y) = (self.cursor_x, self.cursor_y);
        let cell = Cell {
            ch,
            fg: self.cur_fg,
            bg: self.cur_bg,
            attrs: self.cur_attrs,
        };
        self.active_grid_mut().set(x, y, cell);
        if x + 1 >= cols {
            // Defer the wrap: a real terminal holds the cursor on the
            // last column until the next byte decides whether to wrap
            // or overwrite (e.g. after a later cursor move).
            self.pending_wrap = true;
        } else {
            self.cursor_x = x + 1;
        }
    }

    fn newline(&mut self) {
        self.cursor_x = 0;
        self.pending_wrap = false;
        if self.cursor_y >= self.scroll_bottom {
            let (top, bottom) = (self.scroll_top, self.scroll_bottom);
            self.active_grid_mut().scroll_up(top, bottom);
        } else {
            self.cursor_y += 1;
        }
    }

    fn carriage_return(&mut self) {
        self.cursor_x = 0;
        self.pending_wrap = false;
    }

    fn backspace(&mut self) {
        self.cursor_x = self.cursor_x.saturating_sub(1);
        self.pending_wrap = false;
    }

    fn tab(&mut self) {
        let cols = self.grid.cols();
        self.cursor_x = ((self.cursor_x / 8) + 1) * 8;
        if self.cursor_x >= cols {
            self.cursor_x = cols - 1;
        }
        self.pending_wrap = false;
    }

    fn move_cursor(&mut self, dx: isize, dy: isize) {
        let cols = self.grid.cols() as isize;
        let rows = self.grid.rows() as isize;
        self.cursor_x = (self.cursor_x as isize + dx).clamp(0, cols - 1) as usize;
        self.cursor_y = (self.cursor_y as isize + dy).clamp(0, rows - 1) as usize;
        self.pending_wrap = false;
    }

    fn set_cursor(&mut self, x: usize, y: usize) {
        self.cursor_x = x.min(self.grid.cols().saturating_sub(1));
        self.cursor_y = y.min(self.grid.rows().saturating_sub(1));
        self.pending_wrap = false;
    }

    fn erase_in_display(&mut self, mode: u16) {
        let (cols, rows) = (self.grid.cols(), self.grid.rows());
        let (cx, cy) = (self.cursor_x, self.cursor_y);
        match mode {
            0 => {
                self.erase_in_line(0);
                for y in (cy + 1)..rows {
                    self.active_grid_mut().clear_row(y);
                }
            }
            1 => {
                for y in 0..cy {
                    self.active_grid_mut().clear_row(y);
                }
                for x in 0..=cx.min(cols.saturating_sub(1)) {
                    self.active_grid_mut().set(x, cy, Cell::default());
                }
            }
            2 | 3 => self.active_grid_mut().clear_all(),
            _ => {}
        }
    }

    fn erase_in_line(&mut self, mode: u16) {
        let cols = self.grid.cols();
        let (cx, cy) = (self.cursor_x, self.cursor_y);
        match mode {
            0 => {
                for x in cx..cols {
                    self.active_grid_mut().set(x, cy, Cell::default());
                }
            }
            1 => {
                for x in 0..=cx.min(cols.saturating_sub(1)) {
                    self.active_grid_mut().set(x, cy, Cell::default());
                }
            }
            2 => {
                self.active_grid_mut().clear_row(cy);
            }
            _ => {}
        }
    }

    fn insert_lines(&mut self, n: usize) {
        let (top, bottom) = (self.cursor_y, self.scroll_bottom);
        for _ in 0..n {
            self.active_grid_mut().scroll_down(top, bottom);
        }
    }

    fn delete_lines(&mut self, n: usize) {
        let (top, bottom) = (self.cursor_y, self.scroll_bottom);
        for _ in 0..n {
            self.active_grid_mut().scroll_up(top, bottom);
        }
    }

    fn insert_chars(&mut self, n: usize) {
        let (cols, y) = (self.grid.cols(), self.cursor_y);
        let grid = self.active_grid_mut();
        let row = grid.row_mut(y).to_vec();
        let x = self.cursor_x;
        for i in (x..cols).rev() {
            let src = if i >= x + n { Some(i - n) } else { None };
            grid.row_mut(y)[i] = src.and_then(|s| row.get(s).copied()).unwrap_or_default();
        }
    }

    fn delete_chars(&mut self, n: usize) {
        let (cols, y) = (self.grid.cols(), self.cursor_y);
        let grid = self.active_grid_mut();
        let row = grid.row_mut(y).to_vec();
        let x = self.cursor_x;
        for i in x..cols {
            let src = i + n;
            grid.row_mut(y)[i] = row.get(src).copied().unwrap_or_default();
        }
    }

    fn set_scroll_region(&mut self, top: usize, bottom: usize) {
        let rows = self.grid.rows();
        self.scroll_top = top.min(rows.saturating_sub(1));
        self.scroll_bottom = bottom.min(rows.saturating_sub(1)).max(self.scroll_top);
    }

    fn save_cursor(&mut self) {
        self.saved_cursor = Some(SavedCursor {
            x: self.cursor_x,
            y: self.cursor_y,
            fg: self.cur_fg,
            bg: self.cur_bg,
            attrs: self.cur_attrs,
        });
    }

    fn restore_cursor(&mut self) {
        if let Some(s) = self.saved_cursor {
            self.cursor_x = s.x;
            self.cursor_y = s.y;
            self.cur_fg = s.fg;
            self.cur_bg = s.bg;
            self.cur_attrs = s.attrs;
        }
    }

    fn enter_alt_screen(&mut self) {
        if !self.alt_screen {
            self.alt_screen = true;
            self.alt_grid = Some(Grid::new(self.grid.cols(), self.grid.rows(), 0));
        }
    }

    fn exit_alt_screen(&mut self) {
        self.alt_screen = false;
        self.alt_grid = None;
    }

    fn set_dec_private_mode(&mut self, code: u16, enabled: bool) {
        match code {
            1049 => {
                if enabled {
                    self.enter_alt_screen();
                } else {
                    self.exit_alt_screen();
                }
            }
            25 => self.cursor_visible = enabled,
            // Bracketed paste (2004), application cursor keys (1) and
            // mouse modes: accepted and otherwise ignored, §4.3.1.
            _ => {}
        }
    }

    fn sgr(&mut self, params: &Params) {
        let values: Vec<Vec<u16>> = params.iter().map(<[u16]>::to_vec).collect();
        let mut i = 0;
        if values.is_empty() {
            self.cur_fg = Color::Default;
            self.cur_bg = Color::Default;
            self.cur_attrs = Attrs::empty();
            return;
        }
        while i < values.len() {
            let n = values[i].first().copied().unwrap_or(0);
            match n {
                0 => {
                    self.cur_fg = Color::Default;
                    self.cur_bg = Color::Default;
                    self.cur_attrs = Attrs::empty();
                }
                1 => self.cur_attrs.insert(Attrs::BOLD),
                2 => self.cur_attrs.insert(Attrs::DIM),
                3 => self.cur_attrs.insert(Attrs::ITALIC),
                4 => self.cur_attrs.insert(Attrs::UNDERLINE),
                7 => self.cur_attrs.insert(Attrs::INVERSE),
                8 => self.cur_attrs.insert(Attrs::INVISIBLE),
                9 => self.cur_attrs.insert(Attrs::STRIKETHROUGH),
                22 => {
                    self.cur_attrs.remove(Attrs::BOLD);
                    self.cur_attrs.remove(Attrs::DIM);
                }
                23 => self.cur_attrs.remove(Attrs::ITALIC),
                24 => self.cur_attrs.remove(Attrs::UNDERLINE),
                27 => self.cur_attrs.remove(Attrs::INVERSE),
                28 => self.cur_attrs.remove(Attrs::INVISIBLE),
                29 => self.cur_attrs.remove(Attrs::STRIKETHROUGH),
                30..=37 => self.cur_fg = Color::Palette((n - 30) as u8),
                39 => self.cur_fg = Color::Default,
                40..=47 => self.cur_bg = Color::Palette((n - 40) as u8),
                49 => self.cur_bg = Color::Default,
                90..=97 => self.cur_fg = Color::Palette((n - 90 + 8) as u8),
                100..=107 => self.cur_bg = Color::Palette((n - 100 + 8) as u8),
                38 | 48 => {
                    let (color, consumed) = Self::parse_extended_color(&values[i..]);
                    if let Some(color) = color {
                        if n == 38 {
                            self.cur_fg = color;
                        } else {
                            self.cur_bg = color;
                        }
                    }
                    i += consumed.saturating_sub(1);
                }
                _ => {}
            }
            i += 1;
        }
    }

    /// Parses `38;5;n` / `38;2;r;g;b` (and the `48;...` background
    /// forms), §4.3.1 SGR. `vte` gives each `;`-separated SGR group as
    /// its own `Params` slot, so `values[i]` is `[38]`, `values[i+1]`
    /// is `[5]` or `[2]`, and so on — not sub-params of one slot.
    fn parse_extended_color(values: &[Vec<u16>]) -> (Option<Color>, usize) {
        let Some(mode) = values.get(1).and_then(|v| v.first()) else {
            return (None, 1);
        };
        match mode {
            5 => {
                let idx = values.get(2).and_then(|v| v.first()).copied().unwrap_or(0);
                (Some(Color::Palette(idx as u8)), 3)
            }
            2 => {
                let r = values.get(2).and_then(|v| v.first()).copied().unwrap_or(0) as u8;
                let g = values.get(3).and_then(|v| v.first()).copied().unwrap_or(0) as u8;
                let b = values.get(4).and_then(|v| v.first()).copied().unwrap_or(0) as u8;
                (Some(Color::Rgb(r, g, b)), 5)
            }
            _ => (None, 1),
        }
    }
}

struct Performer<'a> {
    emu: &'a mut TerminalEmulator,
}

impl Perform for Performer<'_> {
    fn print(&mut self, c: char) {
        self.emu.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x08 => self.emu.backspace(),
            0x09 => self.emu.tab(),
            0x0A => self.emu.newline(),
            0x0D => self.emu.carriage_return(),
            0x07 => {} // bell, ignored per §4.3.1
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {
        // Title and similar OSCs: accepted and consumed, content
        // discarded, §4.3.1.
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let p = |idx: usize, default: u16| -> u16 {
            params
                .iter()
                .nth(idx)
                .and_then(|g| g.first().copied())
                .filter(|&v| v != 0)
                .unwrap_or(default)
        };
        let private = intermediates.first() == Some(&b'?');

        match action {
            'A' => self.emu.move_cursor(0, -(i64::from(p(0, 1)) as isize)),
            'B' => self.emu.move_cursor(0, i64::from(p(0, 1)) as isize),
            'C' => self.emu.move_cursor(i64::from(p(0, 1)) as isize, 0),
            'D' => self.emu.move_cursor(-(i64::from(p(0, 1)) as isize), 0),
            'H' | 'f' => {
                let row = p(0, 1).saturating_sub(1) as usize;
                let col = p(1, 1).saturating_sub(1) as usize;
                self.emu.set_cursor(col, row);
            }
            'J' => self.emu.erase_in_display(p(0, 0)),
            'K' => self.emu.erase_in_line(p(0, 0)),
            'L' => self.emu.insert_lines(p(0, 1) as usize),
            'M' => self.emu.delete_lines(p(0, 1) as usize),
            '@' => self.emu.insert_chars(p(0, 1) as usize),
            'P' => self.emu.delete_chars(p(0, 1) as usize),
            'm' => self.emu.sgr(params),
            'r' => {
                let top = p(0, 1).saturating_sub(1) as usize;
                let bottom = p(1, u16::try_from(self.emu.grid.rows()).unwrap_or(u16::MAX))
                    .saturating_sub(1) as usize;
                self.emu.set_scroll_region(top, bottom);
            }
            'n' => {} // DSR: device-status reports require a reply channel the core does not own.
            's' => self.emu.save_cursor(),
            'u' => self.emu.restore_cursor(),
            'h' | 'l' if private => {
                for group in params.iter() {
                    if let Some(&code) = group.first() {
                        self.emu.set_dec_private_mode(code, action == 'h');
                    }
                }
            }
            _ => {} // Unknown CSI: consumed, never inserted into the grid.
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        match (intermediates, byte) {
            ([], b'7') => self.emu.save_cursor(),
            ([], b'8') => self.emu.restore_cursor(),
            ([b'#'], b'8') => {} // DECALN, not in scope; consumed.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(emu: &TerminalEmulator, y: usize) -> String {
        emu.grid().row(y).iter().map(|c| c.ch).collect::<String>()
    }

    #[test]
    fn prints_and_wraps_text() {
        let mut emu = TerminalEmulator::new(5, 3, 100);
        emu.feed(b"hello\r\nworld");
        assert_eq!(text(&emu, 0).trim_end(), "hello");
        assert_eq!(text(&emu, 1).trim_end(), "world");
    }

    #[test]
    fn cursor_movement_sequences() {
        let mut emu = TerminalEmulator::new(10, 5, 100);
        emu.feed(b"\x1b[3;4H");
        assert_eq!(emu.cursor(), (3, 2));
    }

    #[test]
    fn sgr_sets_truecolor_fg() {
        let mut emu = TerminalEmulator::new(10, 2, 100);
        emu.feed(b"\x1b[38;2;10;20;30mX");
        let cell = emu.grid().get(0, 0);
        assert_eq!(cell.fg, Color::Rgb(10, 20, 30));
    }

    #[test]
    fn erase_in_display_clears_from_cursor() {
        let mut emu = TerminalEmulator::new(5, 2, 100);
        emu.feed(b"abcde\x1b[0;1H\x1b[J");
        assert!(emu.grid().get(0, 0).is_blank());
    }

    #[test]
    fn resize_right_pads_and_clamps_cursor() {
        let mut emu = TerminalEmulator::new(5, 2, 100);
        emu.feed(b"\x1b[1;5Hx");
        emu.resize(3, 2);
        assert_eq!(emu.cols(), 3);
        assert!(emu.cursor().0 < 3);
    }

    #[test]
    fn unknown_csi_is_dropped_without_corrupting_grid() {
        let mut emu = TerminalEmulator::new(5, 2, 100);
        emu.feed(b"\x1b[99zabc");
        assert_eq!(text(&emu, 0).trim_end(), "abc");
    }

    #[test]
    fn insert_chars_shifts_only_from_the_cursor_onward() {
        let mut emu = TerminalEmulator::new(10, 1, 100);
        emu.feed(b"0123456789\x1b[1;3H\x1b[3@");
        assert_eq!(text(&emu, 0), "01   23456");
    }

    #[test]
    fn cursor_stays_within_bounds_after_filling_last_column() {
        let mut emu = TerminalEmulator::new(5, 3, 100);
        emu.feed(b"alpha");
        let (x, _) = emu.cursor();
        assert!(x < emu.cols());
        assert_eq!(text(&emu, 0), "alpha");
        // The deferred wrap resolves on the next byte, not before.
        emu.feed(b"!");
        assert_eq!(text(&emu, 1).trim_end(), "!");
    }

    #[test]
    fn decsc_decrc_save_and_restore_cursor() {
        let mut emu = TerminalEmulator::new(10, 5, 100);
        emu.feed(b"\x1b[3;4H\x1b7\x1b[1;1H\x1b8");
        assert_eq!(emu.cursor(), (3, 2));
    }
}
