//! Session-host CLI (forward helper), §6: `fwd [--monitor-only] -- <cmd>
//! [args...]`. Creates a session wrapping `<cmd>`, prints its paths, then
//! either streams it interactively or monitors until the child exits.
//! Grounded on the teacher's `main.rs` argument parsing (`argument-parser`
//! `Parser::from_env`/`param`/`value`/`is_long`/`is_pos`).

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use argument_parser::Parser;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use signal_hook::consts::SIGWINCH;

use vt_core::config::Config;
use vt_core::follower::Follower;
use vt_core::manager::{CreateOptions, SessionManager};
use vt_core::protocol::{SessionStatus, StreamEvent};
use vt_core::utils::terminal_size;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("fwd: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let mut parser = Parser::from_env();
    let mut monitor_only = false;
    let mut cmdline = Vec::<OsString>::new();

    while let Some(param) = parser.param()? {
        match param {
            p if p.is_long("monitor-only") => monitor_only = true,
            p if p.is_long("help") => {
                println!("Usage: fwd [--monitor-only] -- <command> [args...]");
                return Ok(0);
            }
            p if p.is_pos() => cmdline.push(parser.value()?),
            _ => return Err(parser.unexpected().into()),
        }
    }

    if cmdline.is_empty() {
        return Err(anyhow!("no command given; usage: fwd [--monitor-only] -- <command> [args...]"));
    }
    let command: Vec<String> = cmdline
        .iter()
        .map(|s| s.to_string_lossy().into_owned())
        .collect();

    let config = Config::from_env();
    let manager = SessionManager::new(config).context("failed to initialize session manager")?;

    let basename = Path::new(&command[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| command[0].clone());
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let size = terminal_size();

    let info = manager
        .create(CreateOptions {
            command,
            working_dir: None,
            env: HashMap::new(),
            cols: Some(size.width),
            rows: Some(size.height),
            name: Some(format!("fwd_{basename}_{unix}")),
            term: std::env::var("TERM").ok(),
        })
        .context("failed to create session")?;

    println!("session-id: {}", info.id);
    println!("stream-out: {}", info.control_path.join("stream-out").display());
    println!("stdin: {}", info.control_path.join("stdin").display());
    println!("control: {}", info.control_path.join("control").display());

    if monitor_only {
        monitor(&manager, &info.id)
    } else {
        stream_interactive(&manager, &info)
    }
}

/// Blocks until the session exits, polling `get`, mirroring its exit code.
fn monitor(manager: &SessionManager, id: &str) -> anyhow::Result<i32> {
    loop {
        let info = manager.get(id)?;
        if info.status == SessionStatus::Exited {
            return Ok(info.exit_code.unwrap_or(1));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Restores the local terminal's attributes on drop, grounded on the
/// teacher's `tty_spawn.rs` `RestoreTerm` guard.
struct RestoreTerm(Termios);

impl Drop for RestoreTerm {
    fn drop(&mut self) {
        let _ = tcsetattr(std::io::stdin(), SetArg::TCSAFLUSH, &self.0);
    }
}

/// Forwards this process's stdin into the session and tails `stream-out`
/// to this process's stdout, until the session exits.
fn stream_interactive(manager: &SessionManager, info: &vt_core::protocol::SessionInfo) -> anyhow::Result<i32> {
    // Put the local terminal into raw, non-echoing mode so keystrokes
    // stream through one at a time instead of being line-buffered and
    // echoed twice (once locally, once by the remote PTY).
    let _restore_term = tcgetattr(std::io::stdin()).ok().map(|original| {
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        raw.local_flags.remove(LocalFlags::ECHO);
        let _ = tcsetattr(std::io::stdin(), SetArg::TCSAFLUSH, &raw);
        RestoreTerm(original)
    });

    let id = info.id.clone();
    let manager_for_stdin = manager.config().control_dir.clone();
    let id_for_stdin = id.clone();
    std::thread::spawn(move || {
        let stdin_path = manager_for_stdin.join(&id_for_stdin).join("stdin");
        let Ok(mut fifo) = std::fs::OpenOptions::new().write(true).open(&stdin_path) else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match std::io::stdin().read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if fifo.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
            }
        }
    });

    let got_winch = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGWINCH, Arc::clone(&got_winch)).ok();

    let stream_path = info.control_path.join("stream-out");
    let mut follower = Follower::open(&stream_path)?;
    let (_, events) = follower.replay()?;
    let mut stdout = std::io::stdout();
    for event in &events {
        if let StreamEvent::Output { data, .. } = event {
            stdout.write_all(data)?;
        }
    }
    stdout.flush()?;

    loop {
        if got_winch.swap(false, Ordering::Relaxed) {
            let size = terminal_size();
            manager.resize(&id, size.width, size.height).ok();
        }
        let info = manager.get(&id)?;
        match follower.poll() {
            Ok(events) => {
                for event in &events {
                    match event {
                        StreamEvent::Output { data, .. } => {
                            stdout.write_all(data)?;
                        }
                        StreamEvent::Exit { exit_code, .. } => {
                            stdout.flush()?;
                            return Ok(*exit_code);
                        }
                        StreamEvent::Resize { .. } => {}
                    }
                }
                stdout.flush()?;
            }
            Err(e) => return Err(e.into()),
        }
        if info.status == SessionStatus::Exited {
            return Ok(info.exit_code.unwrap_or(1));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
