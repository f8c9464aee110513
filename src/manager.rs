//! Session Manager, §4.2. A directory-backed registry: creates Hosts,
//! enumerates sessions from disk, reconciles zombies, and routes
//! control-plane calls to the right Host. Grounded on the teacher's
//! `sessions.rs` (`list_sessions`, `is_pid_alive`, `resize_session`,
//! `send_signal_to_session`, `cleanup_sessions`), generalized from a
//! flat "scan a directory of Unix sockets" model to the spec's
//! in-process `SessionHost` registry plus on-disk reconciliation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::protocol::{SessionInfo, SessionStatus};
use crate::pty_host::{SessionHost, SpawnRequest, DEFAULT_KILL_GRACE};

/// Options accepted by `SessionManager::create`, §4.1 Create operation.
#[derive(Default)]
pub struct CreateOptions {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub name: Option<String>,
    pub term: Option<String>,
}

/// Directory-backed registry over `Config::control_dir`. Safe for
/// concurrent calls: no global lock is held across sessions (§4.2
/// Concurrency) — only the in-memory map of live Hosts is
/// short-lock-guarded, and `session.json` updates are atomic renames.
pub struct SessionManager {
    config: Config,
    hosts: Arc<Mutex<HashMap<String, Arc<SessionHost>>>>,
}

impl SessionManager {
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.control_dir)
            .map_err(|e| CoreError::io(&config.control_dir, e))?;
        Ok(Self {
            config,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.config.control_dir.join(id)
    }

    /// `create(argv, opts) → SessionInfo`, §4.2.
    pub fn create(&self, opts: CreateOptions) -> Result<SessionInfo> {
        if self.config.no_spawn {
            return Err(CoreError::Other(anyhow::anyhow!(
                "create is disabled: noSpawn is set, use registerExternal"
            )));
        }
        let id = Uuid::new_v4().to_string();
        let working_dir = opts
            .working_dir
            .map(Ok)
            .unwrap_or_else(|| std::env::current_dir().map_err(CoreError::from))?;

        let req = SpawnRequest {
            id: id.clone(),
            command: opts.command,
            working_dir,
            env: opts.env,
            cols: opts.cols.unwrap_or(self.config.default_cols),
            rows: opts.rows.unwrap_or(self.config.default_rows),
            name: opts.name,
            term: opts.term.unwrap_or_else(|| "xterm-256color".to_string()),
            control_path: self.session_dir(&id),
        };

        let hosts = Arc::clone(&self.hosts);
        let id_for_exit = id.clone();
        let (host, info) = SessionHost::spawn(req, self.config.do_not_allow_column_set, move |exit_code| {
            tracing::info!(session_id = %id_for_exit, exit_code, "session exited");
            hosts.lock().unwrap().remove(&id_for_exit);
        })?;

        self.hosts.lock().unwrap().insert(id.clone(), Arc::new(host));
        Ok(info)
    }

    /// `get(id) → Session`, healing zombies before returning, §4.2.
    pub fn get(&self, id: &str) -> Result<SessionInfo> {
        let dir = self.session_dir(id);
        if !dir.is_dir() {
            return Err(CoreError::NotFound(id.to_string()));
        }
        let mut info = SessionInfo::load(&dir)?;
        heal_if_zombie(&mut info);
        Ok(info)
    }

    /// `list() → [Session]`, newest-first by `startedAt`, ties by `id`
    /// ascending, §4.2 Tie-breaks. Enumerates subdirectories in
    /// parallel, one thread per entry, since each `SessionInfo::load` +
    /// zombie check is an independent filesystem round-trip.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        let paths: Vec<PathBuf> = std::fs::read_dir(&self.config.control_dir)
            .map_err(|e| CoreError::io(&self.config.control_dir, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();

        let mut sessions = std::thread::scope(|scope| {
            let handles: Vec<_> = paths
                .iter()
                .map(|path| scope.spawn(move || match SessionInfo::load(path) {
                    Ok(mut info) => {
                        heal_if_zombie(&mut info);
                        Some(info)
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session directory");
                        None
                    }
                }))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap_or(None))
                .collect::<Vec<_>>()
        });

        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn host(&self, id: &str) -> Result<Arc<SessionHost>> {
        self.hosts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// `sendInput(id, bytes)`, §4.2.
    pub fn send_input(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.host(id)?.send_input(bytes)
    }

    /// `sendKey(id, name)`, §4.2 + §6 special-key table.
    pub fn send_key(&self, id: &str, name: &str) -> Result<()> {
        let bytes = crate::keys::resolve(name)?;
        self.host(id)?.send_input(bytes)
    }

    /// `resize(id, cols, rows)`, §4.2.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        if self.config.do_not_allow_column_set {
            return Err(CoreError::ResizeDisabled);
        }
        self.host(id)?.resize(cols, rows)
    }

    /// `kill(id)`, §4.2. Idempotent against a session that has already
    /// exited (its Host has already been removed from the registry).
    pub fn kill(&self, id: &str) -> Result<()> {
        match self.host(id) {
            Ok(host) => host.kill(DEFAULT_KILL_GRACE),
            Err(CoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `cleanup(id)`, §4.2: removes a session's directory. The session
    /// must already be exited.
    pub fn cleanup(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        let info = SessionInfo::load(&dir)?;
        if info.status != SessionStatus::Exited {
            return Err(CoreError::AlreadyExited(id.to_string()));
        }
        self.hosts.lock().unwrap().remove(id);
        std::fs::remove_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))
    }

    /// `cleanupExited() → count`, §4.2.
    pub fn cleanup_exited(&self) -> Result<usize> {
        let mut count = 0;
        for info in self.list()? {
            if info.status == SessionStatus::Exited && self.cleanup(&info.id).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// `registerExternal(id)`, §4.2: brings an externally-produced
    /// session directory (e.g. the `fwd` CLI) under management without
    /// spawning. Per §9 Open Question 3, the PID's owning user is not
    /// validated — see `DESIGN.md`.
    pub fn register_external(&self, id: &str) -> Result<SessionInfo> {
        let dir = self.session_dir(id);
        if !dir.is_dir() {
            return Err(CoreError::NotFound(id.to_string()));
        }
        for required in ["session.json", "stream-out", "stdin"] {
            if !dir.join(required).exists() {
                return Err(CoreError::StreamCorrupt {
                    session: id.to_string(),
                    reason: format!("missing required entry: {required}"),
                });
            }
        }
        let mut info = SessionInfo::load(&dir)?;
        heal_if_zombie(&mut info);
        Ok(info)
    }
}

/// Signal-0 liveness probe, §4.2 ("checked via `/proc/<pid>` or
/// equivalent signal-0 probe"). Rewrites `status` to `exited` in place
/// and persists best-effort if the record claims liveness the OS
/// disagrees with (§3 zombie invariant).
fn heal_if_zombie(info: &mut SessionInfo) {
    if info.status == SessionStatus::Exited {
        return;
    }
    if is_pid_alive(info.pid) {
        return;
    }
    info.status = SessionStatus::Exited;
    if let Err(e) = info.persist() {
        tracing::warn!(session_id = %info.id, error = %e, "failed to persist zombie reconciliation");
    }
}

/// Whether `pid` is a live, non-zombie process, via `kill(pid, 0)`.
pub fn is_pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SessionManager {
        let mut config = Config::default();
        config.control_dir = dir.path().to_path_buf();
        SessionManager::new(config).unwrap()
    }

    #[test]
    fn list_is_empty_on_fresh_control_dir() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert!(mgr.list().unwrap().is_empty());
    }

    #[test]
    fn get_unknown_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let err = mgr.get("nope").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn no_spawn_rejects_create() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.control_dir = dir.path().to_path_buf();
        config.no_spawn = true;
        let mgr = SessionManager::new(config).unwrap();
        let err = mgr
            .create(CreateOptions {
                command: vec!["/bin/echo".to_string()],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Other(_)));
    }

    #[test]
    fn create_and_wait_for_exit_then_list_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let info = mgr
            .create(CreateOptions {
                command: vec!["/bin/echo".to_string(), "hi".to_string()],
                working_dir: Some(PathBuf::from("/tmp")),
                ..Default::default()
            })
            .unwrap();

        let mut listed = None;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(100));
            let sessions = mgr.list().unwrap();
            if let Some(found) = sessions.iter().find(|s| s.id == info.id) {
                if found.status == SessionStatus::Exited {
                    listed = Some(found.clone());
                    break;
                }
            }
        }
        let listed = listed.expect("session should have exited");
        assert_eq!(listed.exit_code, Some(0));

        let count = mgr.cleanup_exited().unwrap();
        assert_eq!(count, 1);
        assert!(mgr.list().unwrap().is_empty());
    }
}
