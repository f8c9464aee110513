//! Stream Follower + Terminal Emulator, §4.3: cell model, grid +
//! scrollback, the ANSI parser/emulator, and the binary snapshot codec.

pub mod cell;
pub mod emulator;
pub mod grid;
pub mod snapshot;

pub use cell::{Attrs, Cell, Color};
pub use emulator::TerminalEmulator;
