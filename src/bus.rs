//! Subscription Bus, §4.4: per-session subscriber fan-out, debounced
//! "buffer changed" notifications, and raw live-stream fan-out.
//! Grounded on the teacher's bounded-channel SSE fan-out in
//! `api_server.rs` (`mpsc::sync_channel::<(String, StreamEvent)>`),
//! generalized from one multiplexed HTTP response into per-subscriber
//! channels with the §9 design note's `Lagged`-drop-slow-subscriber
//! semantics instead of blocking the producer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::follower::Follower;
use crate::protocol::{SessionInfo, StreamEvent};
use crate::vt::TerminalEmulator;

type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Bounded live-output channel capacity; a subscriber slower than this
/// many unconsumed chunks is dropped rather than stalling the
/// producer, §9.
const RAW_CHANNEL_CAPACITY: usize = 256;

/// Debounces repeated "buffer changed" signals into at-most-one
/// notification per window, never resetting an already-armed timer
/// (§4.4 Notification debouncing).
struct DebounceTimer {
    dirty: Mutex<bool>,
    cvar: Condvar,
    shutdown: AtomicBool,
}

impl DebounceTimer {
    fn spawn(interval: Duration, on_fire: ChangeCallback) -> Arc<Self> {
        let timer = Arc::new(Self {
            dirty: Mutex::new(false),
            cvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let t = Arc::clone(&timer);
        std::thread::spawn(move || loop {
            let mut dirty = t.dirty.lock().unwrap();
            while !*dirty && !t.shutdown.load(Ordering::Relaxed) {
                dirty = t.cvar.wait(dirty).unwrap();
            }
            if t.shutdown.load(Ordering::Relaxed) {
                return;
            }
            *dirty = false;
            drop(dirty);
            on_fire();
            std::thread::sleep(interval);
        });
        timer
    }

    fn arm(&self) {
        let mut dirty = self.dirty.lock().unwrap();
        if !*dirty {
            *dirty = true;
            self.cvar.notify_one();
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.cvar.notify_all();
    }
}

struct SessionEntry {
    emulator: Mutex<TerminalEmulator>,
    change_subscribers: Mutex<HashMap<u64, ChangeCallback>>,
    raw_subscribers: Mutex<HashMap<u64, SyncSender<Vec<u8>>>>,
    next_sub_id: AtomicU64,
    debounce: Arc<DebounceTimer>,
    follower_shutdown: Arc<AtomicBool>,
    last_update: Mutex<Instant>,
}

impl SessionEntry {
    fn subscriber_count(&self) -> usize {
        self.change_subscribers.lock().unwrap().len() + self.raw_subscribers.lock().unwrap().len()
    }
}

/// Opaque handle returned by `subscribe`/`subscribe_raw`. Dropping it
/// does *not* unsubscribe — call [`SubscriptionBus::unsubscribe`]
/// explicitly, matching §4.4's synchronous, idempotent unsubscribe.
pub struct Subscription {
    session_id: String,
    sub_id: u64,
    raw: bool,
}

/// Owns, per subscribed session, a lazily-created [`TerminalEmulator`]
/// plus its tailing thread and debounce timer. Torn down when the
/// subscriber count hits zero or the idle sweep evicts it (§4.4).
pub struct SubscriptionBus {
    config: Config,
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    sweep_shutdown: Arc<AtomicBool>,
}

impl SubscriptionBus {
    pub fn new(config: Config) -> Arc<Self> {
        let bus = Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            sweep_shutdown: Arc::new(AtomicBool::new(false)),
        });
        bus.spawn_idle_sweep();
        bus
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.config.control_dir.join(id)
    }

    /// `subscribe(sessionId, callback) → unsubscribe`, §4.4. The first
    /// subscriber for a session lazily creates the Emulator and starts
    /// tailing.
    pub fn subscribe(
        self: &Arc<Self>,
        session_id: &str,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let entry = self.entry_or_create(session_id)?;
        let sub_id = entry.next_sub_id.fetch_add(1, Ordering::Relaxed);
        entry
            .change_subscribers
            .lock()
            .unwrap()
            .insert(sub_id, Arc::new(callback));
        Ok(Subscription {
            session_id: session_id.to_string(),
            sub_id,
            raw: false,
        })
    }

    /// Raw live-stream subscription, §4.4: unbatched output bytes as
    /// they arrive, on a bounded channel.
    pub fn subscribe_raw(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<(Subscription, Receiver<Vec<u8>>)> {
        let entry = self.entry_or_create(session_id)?;
        let sub_id = entry.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = sync_channel(RAW_CHANNEL_CAPACITY);
        entry.raw_subscribers.lock().unwrap().insert(sub_id, tx);
        Ok((
            Subscription {
                session_id: session_id.to_string(),
                sub_id,
                raw: true,
            },
            rx,
        ))
    }

    /// Synchronous, idempotent unsubscribe, §4.4/§5. The last
    /// unsubscribe for a session tears down its Emulator.
    pub fn unsubscribe(&self, sub: Subscription) {
        let entry = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&sub.session_id).cloned()
        };
        let Some(entry) = entry else { return };
        if sub.raw {
            entry.raw_subscribers.lock().unwrap().remove(&sub.sub_id);
        } else {
            entry.change_subscribers.lock().unwrap().remove(&sub.sub_id);
        }
        if entry.subscriber_count() == 0 {
            self.teardown(&sub.session_id);
        }
    }

    /// Returns a binary snapshot of the current viewport, §4.3.2.
    pub fn snapshot(&self, session_id: &str) -> Result<Vec<u8>> {
        let entry = self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(session_id.to_string()))?;
        let emulator = entry.emulator.lock().unwrap();
        Ok(crate::vt::snapshot::encode(&emulator))
    }

    fn entry_or_create(self: &Arc<Self>, session_id: &str) -> Result<Arc<SessionEntry>> {
        {
            let sessions = self.sessions.lock().unwrap();
            if let Some(entry) = sessions.get(session_id) {
                return Ok(Arc::clone(entry));
            }
        }

        let dir = self.session_dir(session_id);
        let info = SessionInfo::load(&dir)?;
        let emulator = TerminalEmulator::new(
            info.cols as usize,
            info.rows as usize,
            self.config.scrollback_rows,
        );

        let bus = Arc::clone(self);
        let session_id_owned = session_id.to_string();
        let debounce = DebounceTimer::spawn(
            Duration::from_millis(self.config.notification_debounce_ms),
            Arc::new(move || bus.fire_change(&session_id_owned)),
        );

        let entry = Arc::new(SessionEntry {
            emulator: Mutex::new(emulator),
            change_subscribers: Mutex::new(HashMap::new()),
            raw_subscribers: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(0),
            debounce,
            follower_shutdown: Arc::new(AtomicBool::new(false)),
            last_update: Mutex::new(Instant::now()),
        });

        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), Arc::clone(&entry));

        self.spawn_follower(session_id.to_string(), Arc::clone(&entry));

        Ok(entry)
    }

    fn spawn_follower(self: &Arc<Self>, session_id: String, entry: Arc<SessionEntry>) {
        let stream_path = self.session_dir(&session_id).join("stream-out");
        let shutdown = Arc::clone(&entry.follower_shutdown);
        let bus = Arc::clone(self);

        std::thread::spawn(move || {
            let mut follower = match Follower::open(&stream_path) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "follower failed to open stream-out");
                    return;
                }
            };
            let events = match follower.replay() {
                Ok((_, events)) => events,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "follower failed initial replay");
                    return;
                }
            };
            bus.apply_events(&entry, &events);
            bus.arm_debounce(&session_id);

            let (watch_tx, watch_rx) = std::sync::mpsc::channel();
            let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = watch_tx.send(event);
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "failed to create stream watcher");
                    return;
                }
            };
            if let Err(e) = notify::Watcher::watch(&mut watcher, &stream_path, notify::RecursiveMode::NonRecursive) {
                tracing::warn!(session_id = %session_id, error = %e, "failed to watch stream-out");
                return;
            }

            while !shutdown.load(Ordering::Relaxed) {
                match watch_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(_) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                };
                match follower.poll() {
                    Ok(events) => {
                        if events.is_empty() {
                            continue;
                        }
                        bus.apply_events(&entry, &events);
                        bus.arm_debounce(&session_id);
                    }
                    Err(CoreError::NotFound(_)) => break,
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "stream-out corrupt, tailing stopped");
                        break;
                    }
                }
            }
        });
    }

    fn apply_events(&self, entry: &Arc<SessionEntry>, events: &[StreamEvent]) {
        let mut emulator = entry.emulator.lock().unwrap();
        for event in events {
            match event {
                StreamEvent::Output { data, .. } => {
                    emulator.feed(data);
                    drop_fanout_raw(entry, data);
                }
                StreamEvent::Resize { cols, rows, .. } => {
                    emulator.resize(*cols as usize, *rows as usize);
                }
                StreamEvent::Exit { .. } => {
                    emulator.mark_dead();
                }
            }
        }
        *entry.last_update.lock().unwrap() = Instant::now();
    }

    fn fire_change(&self, session_id: &str) {
        let entry = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(session_id).cloned()
        };
        let Some(entry) = entry else { return };
        // §5 Bus: callbacks must never run while the subscriber-list
        // lock is held, so clone the Arcs out and drop the lock first.
        let callbacks: Vec<ChangeCallback> = {
            let subs = entry.change_subscribers.lock().unwrap();
            subs.values().cloned().collect()
        };
        for cb in callbacks {
            cb();
        }
    }

    fn arm_debounce(&self, session_id: &str) {
        if let Some(entry) = self.sessions.lock().unwrap().get(session_id) {
            entry.debounce.arm();
        }
    }

    fn teardown(&self, session_id: &str) {
        let entry = self.sessions.lock().unwrap().remove(session_id);
        if let Some(entry) = entry {
            entry.follower_shutdown.store(true, Ordering::Relaxed);
            entry.debounce.shutdown();
        }
    }

    fn spawn_idle_sweep(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        let shutdown = Arc::clone(&self.sweep_shutdown);
        let idle_timeout = self.config.session_idle_timeout;
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_secs(5));
                let stale: Vec<String> = {
                    let sessions = bus.sessions.lock().unwrap();
                    sessions
                        .iter()
                        .filter(|(_, e)| e.last_update.lock().unwrap().elapsed() > idle_timeout)
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for id in stale {
                    tracing::info!(session_id = %id, "evicting idle emulator");
                    bus.teardown(&id);
                }
            }
        });
    }
}

impl Drop for SubscriptionBus {
    fn drop(&mut self) {
        self.sweep_shutdown.store(true, Ordering::Relaxed);
    }
}

fn drop_fanout_raw(entry: &SessionEntry, data: &[u8]) {
    let mut subs = entry.raw_subscribers.lock().unwrap();
    subs.retain(|_, tx| match tx.try_send(data.to_vec()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!("dropping lagged raw subscriber");
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_session(dir: &std::path::Path, id: &str) {
        let session_dir = dir.join(id);
        std::fs::create_dir_all(&session_dir).unwrap();
        let info = SessionInfo {
            id: id.to_string(),
            name: "test".to_string(),
            command: vec!["/bin/sh".to_string()],
            working_dir: std::path::PathBuf::from("/tmp"),
            status: crate::protocol::SessionStatus::Running,
            exit_code: None,
            started_at: jiff::Timestamp::now(),
            pid: 999_999,
            cols: 10,
            rows: 3,
            control_path: session_dir.clone(),
        };
        info.persist().unwrap();
        let mut file = std::fs::File::create(session_dir.join("stream-out")).unwrap();
        writeln!(file, r#"{{"version":2,"width":10,"height":3,"timestamp":1700000000,"env":{{}}}}"#).unwrap();
        writeln!(file, r#"[0.1,"o","hi"]"#).unwrap();
    }

    #[test]
    fn subscribe_replays_existing_output_into_snapshot() {
        let dir = TempDir::new().unwrap();
        make_session(dir.path(), "s1");
        let mut config = Config::default();
        config.control_dir = dir.path().to_path_buf();
        config.notification_debounce_ms = 10;
        let bus = SubscriptionBus::new(config);

        let (tx, rx) = std::sync::mpsc::channel();
        let sub = bus.subscribe("s1", move || {
            let _ = tx.send(());
        }).unwrap();

        let _ = rx.recv_timeout(Duration::from_secs(2));
        std::thread::sleep(Duration::from_millis(50));
        let snap = bus.snapshot("s1").unwrap();
        assert_eq!(&snap[0..2], &[0x56, 0x54]);

        bus.unsubscribe(sub);
        std::thread::sleep(Duration::from_millis(20));
        assert!(bus.snapshot("s1").is_err());
    }
}
