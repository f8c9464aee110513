//! PTY Session Host, §4.1. Owns one child process on a PTY, its stream
//! recording, and reports its own exit — grounded on the teacher's
//! `tty_spawn.rs` (`openpty`/`fork`/`login_tty`/`select` loop, atomic
//! `session.json` rewrite, `RestoreTerm` guard), generalized from a
//! foreground terminal-passthrough tool into a headless session host:
//! the three activities of §5 (PTY-read, stdin-pipe-read, child-reap)
//! run as background threads instead of blocking the caller's terminal.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jiff::Timestamp;
use nix::errno::Errno;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
use nix::libc::login_tty;
use nix::libc::O_NONBLOCK;
use nix::pty::{openpty, Winsize};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::termios::Termios;
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execve, fork, mkfifo, read, write, ForkResult, Pid};

use crate::error::{CoreError, Result};
use crate::protocol::{SessionInfo, SessionStatus, StreamHeader, StreamWriter};

#[cfg(target_os = "linux")]
const TIOCSCTTY: u64 = 0x540E;

/// Default grace window between SIGTERM and SIGKILL escalation, §4.1.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit code recorded when a session is force-exited by §4.1 Failure
/// semantics (a `stream-out`/PTY I/O error) rather than by the child
/// actually terminating on its own.
const SYNTHETIC_IO_FAILURE_EXIT_CODE: i32 = -1;

/// Everything the caller hands in at `create`, §4.1.
pub struct SpawnRequest {
    pub id: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub name: Option<String>,
    pub term: String,
    pub control_path: PathBuf,
}

enum WriterMsg {
    Output(f64, Vec<u8>),
    Resize(f64, u32, u32),
    Exit(f64, i32),
}

/// One live child process on a PTY. Exists only while the child is
/// spawned and its background threads are running; a `session.json`
/// record outlives this (§3 Ownership & lifecycle).
pub struct SessionHost {
    info: Arc<Mutex<SessionInfo>>,
    child: Pid,
    master: Arc<OwnedFd>,
    writer_tx: std::sync::mpsc::Sender<WriterMsg>,
    header_started: Instant,
    do_not_allow_column_set: bool,
    shutdown: Arc<AtomicBool>,
}

impl SessionHost {
    /// Spawns `req.command` on a fresh PTY and starts the three §5
    /// background activities. `on_exit` is invoked exactly once, from
    /// the reaper thread, after `session.json` has been rewritten to
    /// `exited` (§9 design note: Host exposes `OnExit(cb)`, no upward
    /// pointer to the Manager/Bus).
    pub fn spawn(
        req: SpawnRequest,
        do_not_allow_column_set: bool,
        on_exit: impl FnOnce(i32) + Send + 'static,
    ) -> Result<(Self, SessionInfo)> {
        std::fs::create_dir_all(&req.control_path)
            .map_err(|e| CoreError::io(&req.control_path, e))?;

        let name = req
            .name
            .clone()
            .unwrap_or_else(|| SessionInfo::default_name(&req.command, &req.working_dir));

        let mut info = SessionInfo {
            id: req.id.clone(),
            name,
            command: req.command.clone(),
            working_dir: req.working_dir.clone(),
            status: SessionStatus::Starting,
            exit_code: None,
            started_at: Timestamp::now(),
            pid: 0,
            cols: req.cols,
            rows: req.rows,
            control_path: req.control_path.clone(),
        };
        if let Err(e) = info.persist() {
            let _ = std::fs::remove_dir_all(&req.control_path);
            return Err(e);
        }

        match Self::do_spawn(&req, &mut info) {
            Ok(mut host) => {
                host.do_not_allow_column_set = do_not_allow_column_set;
                let info_snapshot = info.clone();
                host.spawn_background_threads(on_exit);
                Ok((host, info_snapshot))
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&req.control_path);
                Err(CoreError::SpawnFailed(anyhow::anyhow!(e.to_string())))
            }
        }
    }

    fn do_spawn(req: &SpawnRequest, info: &mut SessionInfo) -> Result<Self> {
        let stdin_path = req.control_path.join("stdin");
        mkfifo_atomic(&stdin_path)?;
        let control_path = req.control_path.join("control");
        mkfifo_atomic(&control_path)?;

        let winsize = Winsize {
            ws_row: req.rows,
            ws_col: req.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let term_attrs: Option<Termios> = None;
        let pty = openpty(&Some(winsize), &term_attrs).map_err(CoreError::from)?;

        let mut env = req.env.clone();
        env.insert("TERM".to_string(), req.term.clone());

        match unsafe { fork() }.map_err(CoreError::from)? {
            ForkResult::Parent { child } => {
                drop(pty.slave);
                info.status = SessionStatus::Running;
                info.pid = child.as_raw();
                info.persist()?;

                let stream_path = req.control_path.join("stream-out");
                let header = StreamHeader {
                    version: 2,
                    width: u32::from(req.cols),
                    height: u32::from(req.rows),
                    timestamp: Timestamp::now().as_second(),
                    env,
                };
                let writer = StreamWriter::create(&stream_path, &header)?;
                let header_started = Instant::now();

                let shared_info = Arc::new(Mutex::new(info.clone()));
                let shutdown = Arc::new(AtomicBool::new(false));

                let (tx, rx) = std::sync::mpsc::channel::<WriterMsg>();
                {
                    let info = Arc::clone(&shared_info);
                    let shutdown = Arc::clone(&shutdown);
                    std::thread::spawn(move || writer_thread(writer, rx, child, info, shutdown));
                }

                Ok(Self {
                    info: shared_info,
                    child,
                    master: Arc::new(pty.master),
                    writer_tx: tx,
                    header_started,
                    do_not_allow_column_set: false,
                    shutdown,
                })
            }
            ForkResult::Child => {
                drop(pty.master);
                // Safety: single-threaded child image immediately before exec.
                unsafe {
                    if let Err(_e) = login_tty_compat(pty.slave.into_raw_fd()) {
                        std::process::exit(127);
                    }
                }
                if std::env::set_current_dir(&req.working_dir).is_err() {
                    std::process::exit(126);
                }

                let args: Vec<CString> = req
                    .command
                    .iter()
                    .filter_map(|s| CString::new(s.as_bytes()).ok())
                    .collect();
                let envp: Vec<CString> = env
                    .iter()
                    .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
                    .collect();
                if args.is_empty() {
                    std::process::exit(127);
                }
                let _ = execve(&args[0], &args, &envp);
                std::process::exit(127);
            }
        }
    }

    fn spawn_background_threads(&self, on_exit: impl FnOnce(i32) + Send + 'static) {
        let master = Arc::clone(&self.master);
        let tx = self.writer_tx.clone();
        let header_started = self.header_started;
        let child = self.child;
        let info = Arc::clone(&self.info);
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::spawn(move || pty_reader_thread(master, tx, header_started, child, info, shutdown));

        let master = Arc::clone(&self.master);
        let stdin_path = self.info.lock().unwrap().control_path.join("stdin");
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::spawn(move || stdin_reader_thread(&stdin_path, master, shutdown));

        let child = self.child;
        let info = Arc::clone(&self.info);
        let tx = self.writer_tx.clone();
        let header_started = self.header_started;
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::spawn(move || {
            reaper_thread(child, info, tx, header_started, shutdown, on_exit);
        });
    }

    pub fn info(&self) -> SessionInfo {
        self.info.lock().unwrap().clone()
    }

    /// Appends raw bytes to the PTY master, in call order (§4.1 Input
    /// operation, §8 ordering guarantee).
    pub fn send_input(&self, bytes: &[u8]) -> Result<()> {
        {
            let info = self.info.lock().unwrap();
            if info.status == SessionStatus::Exited {
                return Err(CoreError::AlreadyExited(info.id.clone()));
            }
        }
        write_all(self.master.as_fd(), bytes).map_err(CoreError::from)
    }

    /// Resizes the PTY, updates `session.json`, and emits an `"r"`
    /// event (§4.1 Resize operation).
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.do_not_allow_column_set {
            return Err(CoreError::ResizeDisabled);
        }
        let mut info = self.info.lock().unwrap();
        if info.status == SessionStatus::Exited {
            return Err(CoreError::AlreadyExited(info.id.clone()));
        }
        set_winsize(self.master.as_fd(), cols, rows).map_err(CoreError::from)?;
        info.cols = cols;
        info.rows = rows;
        info.persist()?;
        let t = self.header_started.elapsed().as_secs_f64();
        let _ = self
            .writer_tx
            .send(WriterMsg::Resize(t, u32::from(cols), u32::from(rows)));
        Ok(())
    }

    /// Sends SIGTERM; returns once delivered. A grace-window escalation
    /// to SIGKILL runs on a background timer (§4.1 Kill operation).
    pub fn kill(&self, grace: Duration) -> Result<()> {
        let pid = self.child;
        if kill(pid, Signal::SIGTERM).is_err() {
            // Already gone; the reaper will observe this on its own.
            return Ok(());
        }
        // `reaper_thread` sets `shutdown` the moment it reaps this pid
        // (before the kernel can recycle it), so the escalation checks
        // that instead of re-probing `kill(pid, None)` — a second probe
        // can't tell "still running" from "pid already reused by the OS".
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::spawn(move || {
            std::thread::sleep(grace);
            if !shutdown.load(Ordering::Relaxed) {
                let _ = kill(pid, Signal::SIGKILL);
            }
        });
        Ok(())
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn pty_reader_thread(
    master: Arc<OwnedFd>,
    tx: std::sync::mpsc::Sender<WriterMsg>,
    header_started: Instant,
    child: Pid,
    info: Arc<Mutex<SessionInfo>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 4096];
    while !shutdown.load(Ordering::Relaxed) {
        match read(master.as_fd(), &mut buf) {
            Ok(0) | Err(Errno::EIO) => break,
            Ok(n) => {
                let t = header_started.elapsed().as_secs_f64();
                if tx.send(WriterMsg::Output(t, buf[..n].to_vec())).is_err() {
                    // Writer thread is gone, almost certainly after its
                    // own stream-out failure already handled this; fail
                    // defensively in case it raced ahead of us.
                    fail_session(child, &info, &shutdown);
                    break;
                }
            }
            Err(Errno::EAGAIN | Errno::EINTR) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::warn!(error = %e, "pty read failed");
                fail_session(child, &info, &shutdown);
                break;
            }
        }
    }
}

/// §4.1 Failure semantics: an I/O error on `stream-out` (or the PTY
/// itself) is logged by the caller, marks the session `exited` with a
/// synthetic exit code, and signals the child — rather than leaving
/// the record stuck at `running` with nothing left to drain it.
fn fail_session(child: Pid, info: &Arc<Mutex<SessionInfo>>, shutdown: &Arc<AtomicBool>) {
    shutdown.store(true, Ordering::Relaxed);
    let _ = kill(child, Signal::SIGTERM);
    let mut info = info.lock().unwrap();
    if info.status != SessionStatus::Exited {
        info.status = SessionStatus::Exited;
        info.exit_code = Some(SYNTHETIC_IO_FAILURE_EXIT_CODE);
        if let Err(e) = info.persist() {
            tracing::warn!(error = %e, "failed to persist session after stream-out failure");
        }
    }
}

fn stdin_reader_thread(path: &Path, master: Arc<OwnedFd>, shutdown: Arc<AtomicBool>) {
    // Opened read-write + nonblocking so the read end never sees a
    // spurious EOF between writers, matching the teacher's rationale
    // in `tty_spawn.rs::stdin_path`.
    let file = match File::options()
        .read(true)
        .write(true)
        .custom_flags(O_NONBLOCK)
        .open(path)
    {
        Ok(f) => f,
        Err(_) => return,
    };
    let mut buf = [0u8; 4096];
    while !shutdown.load(Ordering::Relaxed) {
        let mut read_fds = FdSet::new();
        read_fds.insert(file.as_fd());
        let mut timeout = TimeVal::new(0, 100_000);
        match select(None, Some(&mut read_fds), None, None, Some(&mut timeout)) {
            Ok(0) => continue,
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Err(_) => break,
            Ok(_) => {}
        }
        match read(file.as_fd(), &mut buf) {
            Ok(0) | Err(Errno::EAGAIN | Errno::EINTR) => {}
            Ok(n) => {
                if write_all(master.as_fd(), &buf[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn reaper_thread(
    child: Pid,
    info: Arc<Mutex<SessionInfo>>,
    tx: std::sync::mpsc::Sender<WriterMsg>,
    header_started: Instant,
    shutdown: Arc<AtomicBool>,
    on_exit: impl FnOnce(i32) + Send + 'static,
) {
    let exit_code = loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => break 1,
        }
    };

    shutdown.store(true, Ordering::Relaxed);
    let t = header_started.elapsed().as_secs_f64();
    let _ = tx.send(WriterMsg::Exit(t, exit_code));

    {
        let mut info = info.lock().unwrap();
        info.status = SessionStatus::Exited;
        info.exit_code = Some(exit_code);
        if let Err(e) = info.persist() {
            tracing::warn!(error = %e, "failed to persist exited session status");
        }
    }

    // Reap any leftover zombie signal-only waits without blocking further.
    let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));

    on_exit(exit_code);
}

fn writer_thread(
    mut writer: StreamWriter,
    rx: std::sync::mpsc::Receiver<WriterMsg>,
    child: Pid,
    info: Arc<Mutex<SessionInfo>>,
    shutdown: Arc<AtomicBool>,
) {
    while let Ok(msg) = rx.recv() {
        let result = match msg {
            WriterMsg::Output(t, data) => writer.write_output(t, &data),
            WriterMsg::Resize(t, cols, rows) => writer.write_resize(t, cols, rows),
            WriterMsg::Exit(t, code) => {
                let r = writer.write_exit(t, code);
                // Final event: close out after writing it regardless of outcome.
                return if let Err(e) = r {
                    tracing::warn!(error = %e, "failed to write exit event");
                };
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "stream-out write failed, marking session exited");
            fail_session(child, &info, &shutdown);
            return;
        }
    }
}

/// Cross-platform `login_tty`: makes `fd` the controlling terminal and
/// duplicates it onto stdin/stdout/stderr.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
unsafe fn login_tty_compat(fd: i32) -> std::result::Result<(), ()> {
    if login_tty(fd) == 0 {
        Ok(())
    } else {
        Err(())
    }
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
unsafe fn login_tty_compat(fd: i32) -> std::result::Result<(), ()> {
    if libc::setsid() == -1 {
        return Err(());
    }
    #[cfg(target_os = "linux")]
    {
        if libc::ioctl(fd, TIOCSCTTY as libc::c_ulong, 0) == -1
            && libc::ioctl(fd, TIOCSCTTY as libc::c_ulong, 1) == -1
        {
            return Err(());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1
            && libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 1) == -1
        {
            return Err(());
        }
    }
    if libc::dup2(fd, 0) == -1 || libc::dup2(fd, 1) == -1 || libc::dup2(fd, 2) == -1 {
        return Err(());
    }
    if fd > 2 {
        libc::close(fd);
    }
    Ok(())
}

fn set_winsize(fd: BorrowedFd, cols: u16, rows: u16) -> std::result::Result<(), Errno> {
    nix::ioctl_write_ptr_bad!(_set_window_size, nix::libc::TIOCSWINSZ, Winsize);
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { _set_window_size(fd.as_raw_fd(), &winsize) }
}

fn write_all(fd: BorrowedFd, mut buf: &[u8]) -> std::result::Result<(), Errno> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) if n > 0 => buf = &buf[n..],
            Ok(_) => continue,
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn mkfifo_atomic(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn spawn_echo_and_observe_exit() {
        let dir = TempDir::new().unwrap();
        let control_path = dir.path().join("sess1");
        let req = SpawnRequest {
            id: "sess1".to_string(),
            command: vec!["/bin/echo".to_string(), "hello".to_string()],
            working_dir: PathBuf::from("/tmp"),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
            name: None,
            term: "xterm-256color".to_string(),
            control_path: control_path.clone(),
        };

        let exited = Arc::new((Mutex::new(None::<i32>), std::sync::Condvar::new()));
        let exited2 = Arc::clone(&exited);
        let (host, info) = SessionHost::spawn(req, false, move |code| {
            let (lock, cvar) = &*exited2;
            *lock.lock().unwrap() = Some(code);
            cvar.notify_all();
        })
        .unwrap();
        assert_eq!(info.status, SessionStatus::Running);

        let (lock, cvar) = &*exited;
        let mut code = lock.lock().unwrap();
        for _ in 0..50 {
            if code.is_some() {
                break;
            }
            let (guard, _) = cvar
                .wait_timeout(code, Duration::from_millis(200))
                .unwrap();
            code = guard;
        }
        assert_eq!(*code, Some(0));
        std::thread::sleep(Duration::from_millis(50));
        drop(host);

        let stream = std::fs::read_to_string(control_path.join("stream-out")).unwrap();
        assert!(stream.lines().count() >= 2);
        assert!(stream.contains("hello"));
    }
}
