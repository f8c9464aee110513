//! PTY session host, asciinema-v2 stream recorder, ANSI/VT100 terminal
//! emulator, and subscriber fan-out bus.
//!
//! A [`manager::SessionManager`] owns zero or more
//! [`pty_host::SessionHost`]s, each a spawned PTY with a single-writer
//! stream-out recorder. A [`bus::SubscriptionBus`] tails those
//! recordings through [`follower::Follower`], replaying them into a
//! [`vt::TerminalEmulator`] per subscribed session and fanning out both
//! debounced "changed" notifications and raw output bytes.

pub mod bus;
pub mod config;
pub mod error;
pub mod follower;
pub mod keys;
pub mod manager;
pub mod protocol;
pub mod pty_host;
pub mod utils;
pub mod vt;

pub use config::Config;
pub use error::{CoreError, Result};
pub use manager::{CreateOptions, SessionManager};
