//! Binary snapshot encoder, §4.3.2. A stable wire contract: magic,
//! version, dimensions, cursor, then rows with run-length markers for
//! empty rows and elided trailing blanks per non-empty row.

use super::cell::{Attrs, Cell, Color};
use super::emulator::TerminalEmulator;

const MAGIC: [u8; 2] = [0x56, 0x54];
const VERSION: u8 = 1;

/// Serializes the current viewport of `emu`, §4.3.2.
pub fn encode(emu: &TerminalEmulator) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(0); // flags, reserved

    let cols = emu.cols() as u32;
    let rows = emu.rows() as u32;
    out.extend_from_slice(&cols.to_le_bytes());
    out.extend_from_slice(&rows.to_le_bytes());

    let viewport_y: i32 = 0; // the emulator does not scroll the viewport independently of the grid
    out.extend_from_slice(&viewport_y.to_le_bytes());

    let (cx, cy) = emu.cursor();
    out.extend_from_slice(&(cx as i32).to_le_bytes());
    out.extend_from_slice(&(cy as i32).to_le_bytes());

    out.extend_from_slice(&[0u8; 8]); // reserved

    let grid = emu.grid();
    let mut empty_run = 0u16;
    for y in 0..grid.rows() {
        let row = grid.row(y);
        if row.iter().all(Cell::is_blank) {
            empty_run += 1;
            if empty_run == 255 {
                out.push(0xFE);
                out.push(255);
                empty_run = 0;
            }
            continue;
        }
        if empty_run > 0 {
            out.push(0xFE);
            out.push(empty_run as u8);
            empty_run = 0;
        }
        encode_row(&mut out, row);
    }
    if empty_run > 0 {
        out.push(0xFE);
        out.push(empty_run as u8);
    }

    out
}

fn encode_row(out: &mut Vec<u8>, row: &[Cell]) {
    let last_non_blank = row.iter().rposition(|c| !c.is_blank());
    let Some(last) = last_non_blank else {
        // Caller only reaches here for rows with at least one
        // non-blank cell.
        out.push(0xFE);
        out.push(1);
        return;
    };
    let cells = &row[..=last];
    out.push(0xFD);
    out.extend_from_slice(&(cells.len() as u16).to_le_bytes());
    for cell in cells {
        encode_cell(out, cell);
    }
}

fn encode_cell(out: &mut Vec<u8>, cell: &Cell) {
    if cell.is_blank() {
        out.push(0x00);
        return;
    }

    let has_extended = !cell.attrs.is_empty() || cell.fg != Color::Default || cell.bg != Color::Default;
    let is_ascii = cell.ch.is_ascii();
    let has_fg = cell.fg != Color::Default;
    let has_bg = cell.bg != Color::Default;
    let fg_is_rgb = matches!(cell.fg, Color::Rgb(..));
    let bg_is_rgb = matches!(cell.bg, Color::Rgb(..));

    let mut type_byte = 0u8;
    if has_extended {
        type_byte |= 0x80;
    }
    if !is_ascii {
        type_byte |= 0x40;
    }
    if has_fg {
        type_byte |= 0x20;
    }
    if has_bg {
        type_byte |= 0x10;
    }
    if fg_is_rgb {
        type_byte |= 0x08;
    }
    if bg_is_rgb {
        type_byte |= 0x04;
    }
    type_byte |= if is_ascii { 0x01 } else { 0x02 };
    out.push(type_byte);

    if is_ascii {
        out.push(cell.ch as u8);
    } else {
        let mut buf = [0u8; 4];
        let s = cell.ch.encode_utf8(&mut buf);
        out.push(s.len() as u8);
        out.extend_from_slice(s.as_bytes());
    }

    if has_extended {
        out.push(cell.attrs.bits());
        if has_fg {
            encode_color(out, cell.fg);
        }
        if has_bg {
            encode_color(out, cell.bg);
        }
    }
}

fn encode_color(out: &mut Vec<u8>, color: Color) {
    match color {
        Color::Palette(p) => out.push(p),
        Color::Rgb(r, g, b) => out.extend_from_slice(&[r, g, b]),
        Color::Default => {}
    }
}

/// Decodes a snapshot back into row data, used by tests to assert
/// round-trip fidelity of the encoder.
#[cfg(test)]
pub fn decode_rows(bytes: &[u8]) -> Vec<Vec<Cell>> {
    assert_eq!(&bytes[0..2], &MAGIC);
    assert_eq!(bytes[2], VERSION);
    let cols = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    let rows = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;

    let mut out = Vec::new();
    let mut i = 32;
    while out.len() < rows {
        match bytes[i] {
            0xFE => {
                let count = bytes[i + 1];
                for _ in 0..count {
                    out.push(vec![Cell::default(); cols]);
                }
                i += 2;
            }
            0xFD => {
                let len = u16::from_le_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
                i += 4;
                let mut row = Vec::with_capacity(cols);
                for _ in 0..len {
                    let (cell, consumed) = decode_cell(&bytes[i..]);
                    row.push(cell);
                    i += consumed;
                }
                row.resize(cols, Cell::default());
                out.push(row);
            }
            _ => break,
        }
    }
    out
}

#[cfg(test)]
fn decode_cell(bytes: &[u8]) -> (Cell, usize) {
    let type_byte = bytes[0];
    if type_byte == 0x00 {
        return (Cell::default(), 1);
    }
    let mut i = 1;
    let is_ascii = type_byte & 0x01 != 0;
    let ch;
    if is_ascii {
        ch = bytes[i] as char;
        i += 1;
    } else {
        let len = bytes[i] as usize;
        i += 1;
        ch = std::str::from_utf8(&bytes[i..i + len]).unwrap().chars().next().unwrap();
        i += len;
    }
    let mut cell = Cell {
        ch,
        ..Cell::default()
    };
    if type_byte & 0x80 != 0 {
        cell.attrs = Attrs::from_bits(bytes[i]);
        i += 1;
        if type_byte & 0x20 != 0 {
            if type_byte & 0x08 != 0 {
                cell.fg = Color::Rgb(bytes[i], bytes[i + 1], bytes[i + 2]);
                i += 3;
            } else {
                cell.fg = Color::Palette(bytes[i]);
                i += 1;
            }
        }
        if type_byte & 0x10 != 0 {
            if type_byte & 0x04 != 0 {
                cell.bg = Color::Rgb(bytes[i], bytes[i + 1], bytes[i + 2]);
                i += 3;
            } else {
                cell.bg = Color::Palette(bytes[i]);
                i += 1;
            }
        }
    }
    (cell, i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_correct() {
        let emu = TerminalEmulator::new(80, 24, 100);
        let bytes = encode(&emu);
        assert_eq!(&bytes[0..2], &MAGIC);
        assert_eq!(bytes[2], VERSION);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 80);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 24);
    }

    #[test]
    fn blank_viewport_collapses_to_one_run() {
        let emu = TerminalEmulator::new(10, 5, 100);
        let bytes = encode(&emu);
        let body = &bytes[32..];
        assert_eq!(body[0], 0xFE);
        assert_eq!(body[1], 5);
    }

    #[test]
    fn text_round_trips_through_encode_decode() {
        let mut emu = TerminalEmulator::new(10, 3, 100);
        emu.feed(b"hi\r\nthere");
        let bytes = encode(&emu);
        let rows = decode_rows(&bytes);
        let line0: String = rows[0].iter().map(|c| c.ch).collect();
        assert!(line0.starts_with("hi"));
    }

    #[test]
    fn same_events_produce_identical_snapshots() {
        let mut a = TerminalEmulator::new(20, 5, 100);
        let mut b = TerminalEmulator::new(20, 5, 100);
        let data = b"\x1b[1;1Hhello \x1b[31mworld\x1b[0m\r\nsecond line";
        a.feed(data);
        b.feed(data);
        assert_eq!(encode(&a), encode(&b));
    }
}
