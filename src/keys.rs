//! Special-key name → byte sequence table, §6.

use crate::error::{CoreError, Result};

/// Resolves a logical key name to the exact bytes a session's PTY master
/// should receive. Unknown names are the caller's mistake, not ours —
/// returned as `UnknownKey` with no side effect.
pub fn resolve(name: &str) -> Result<&'static [u8]> {
    let bytes: &'static [u8] = match name {
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "escape" => b"\x1b",
        "enter" => b"\r",
        "ctrl_enter" => b"\n",
        "shift_enter" => b"\r\n",
        other => return Err(CoreError::UnknownKey(other.to_string())),
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_keys_resolve() {
        assert_eq!(resolve("arrow_up").unwrap(), b"\x1b[A");
        assert_eq!(resolve("arrow_down").unwrap(), b"\x1b[B");
        assert_eq!(resolve("arrow_right").unwrap(), b"\x1b[C");
        assert_eq!(resolve("arrow_left").unwrap(), b"\x1b[D");
        assert_eq!(resolve("escape").unwrap(), b"\x1b");
        assert_eq!(resolve("enter").unwrap(), b"\r");
        assert_eq!(resolve("ctrl_enter").unwrap(), b"\n");
        assert_eq!(resolve("shift_enter").unwrap(), b"\r\n");
    }

    #[test]
    fn unknown_key_fails_without_side_effect() {
        let err = resolve("bogus").unwrap_err();
        assert!(matches!(err, CoreError::UnknownKey(name) if name == "bogus"));
    }
}
