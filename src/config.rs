//! Runtime configuration, §6.
//!
//! A single typed record instead of the scattered `env::var` lookups the
//! teacher does inline (`TTY_FWD_CONTROL_DIR`, `HOME`, ...); each field
//! here has a documented default and an environment-variable override.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Default `$HOME/.vibetunnel/control`.
    pub control_dir: PathBuf,
    pub default_cols: u16,
    pub default_rows: u16,
    pub scrollback_rows: usize,
    pub session_idle_timeout: Duration,
    /// When set, `SessionManager::create` always fails; only
    /// `register_external` may add sessions.
    pub no_spawn: bool,
    /// When set, `resize` always fails with `ResizeDisabled`.
    pub do_not_allow_column_set: bool,
    pub notification_debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_dir: default_control_dir(),
            default_cols: 80,
            default_rows: 24,
            scrollback_rows: 10_000,
            session_idle_timeout: Duration::from_secs(30 * 60),
            no_spawn: false,
            do_not_allow_column_set: false,
            notification_debounce_ms: 50,
        }
    }
}

fn default_control_dir() -> PathBuf {
    std::env::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vibetunnel")
        .join("control")
}

impl Config {
    /// Builds a config from defaults overridden by environment variables.
    /// A variable that is absent, empty, or `"0"` (for numeric fields)
    /// means "use default", matching §6's "zero values mean use default".
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = env_nonempty("VIBETUNNEL_CONTROL_DIR") {
            cfg.control_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_u16("VIBETUNNEL_DEFAULT_COLS") {
            cfg.default_cols = v;
        }
        if let Some(v) = env_u16("VIBETUNNEL_DEFAULT_ROWS") {
            cfg.default_rows = v;
        }
        if let Some(v) = env_usize("VIBETUNNEL_SCROLLBACK_ROWS") {
            cfg.scrollback_rows = v;
        }
        if let Some(v) = env_u64("VIBETUNNEL_SESSION_IDLE_TIMEOUT_SECS") {
            cfg.session_idle_timeout = Duration::from_secs(v);
        }
        if env_bool("VIBETUNNEL_NO_SPAWN") {
            cfg.no_spawn = true;
        }
        if env_bool("VIBETUNNEL_DO_NOT_ALLOW_COLUMN_SET") {
            cfg.do_not_allow_column_set = true;
        }
        if let Some(v) = env_u64("VIBETUNNEL_NOTIFICATION_DEBOUNCE_MS") {
            cfg.notification_debounce_ms = v;
        }

        cfg
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u16(key: &str) -> Option<u16> {
    env_nonempty(key).and_then(|v| v.parse().ok()).filter(|&v| v != 0)
}

fn env_usize(key: &str) -> Option<usize> {
    env_nonempty(key).and_then(|v| v.parse().ok()).filter(|&v| v != 0)
}

fn env_u64(key: &str) -> Option<u64> {
    env_nonempty(key).and_then(|v| v.parse().ok()).filter(|&v| v != 0)
}

fn env_bool(key: &str) -> bool {
    matches!(
        env_nonempty(key).as_deref(),
        Some("1" | "true" | "TRUE" | "yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.default_cols, 80);
        assert_eq!(cfg.default_rows, 24);
        assert!(!cfg.no_spawn);
        assert!(!cfg.do_not_allow_column_set);
        assert_eq!(cfg.notification_debounce_ms, 50);
    }
}
