//! Stream Follower, §4.3: turns an append-only `stream-out` file into a
//! sequence of parsed events. Grounded on the teacher's `notify`-based
//! tailing in `api_server.rs` (`handle_multi_stream`'s session-discovery
//! watcher): a `notify::RecommendedWatcher` pushing into an `mpsc`
//! channel a background thread drains, generalized here from watching a
//! whole control directory to watching one session's `stream-out`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{CoreError, Result};
use crate::protocol::{StreamEvent, StreamHeader};

/// Bounded wait for `stream-out` to appear, §4.3 Startup.
const OPEN_WAIT: Duration = Duration::from_secs(5);
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tails one session's `stream-out`, handing back fully-parsed
/// [`StreamEvent`]s. Holds the file open and its last-known byte
/// offset; a shrink below that offset is `StreamCorrupt` (§9 Open
/// Question 1 resolution — never silently re-read from 0).
pub struct Follower {
    path: PathBuf,
    file: File,
    offset: u64,
    /// A trailing line with no terminating `\n` yet, carried across
    /// wakeups per §4.3 Tail loop.
    pending: Vec<u8>,
}

impl Follower {
    /// Opens `stream-out`, waiting up to 5s if it doesn't exist yet.
    pub fn open(stream_path: &Path) -> Result<Self> {
        let start = Instant::now();
        loop {
            match File::open(stream_path) {
                Ok(file) => {
                    return Ok(Self {
                        path: stream_path.to_path_buf(),
                        file,
                        offset: 0,
                        pending: Vec::new(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if start.elapsed() >= OPEN_WAIT {
                        return Err(CoreError::io(stream_path, e));
                    }
                    std::thread::sleep(OPEN_POLL_INTERVAL);
                }
                Err(e) => return Err(CoreError::io(stream_path, e)),
            }
        }
    }

    /// Reads from offset 0 to the current end, parsing the header and
    /// replaying every event, §4.3 Startup.
    pub fn replay(&mut self) -> Result<(StreamHeader, Vec<StreamEvent>)> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.offset = 0;
        let mut buf = Vec::new();
        self.file
            .read_to_end(&mut buf)
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.offset = buf.len() as u64;

        let mut lines = split_lines(&buf, &mut self.pending);
        if lines.is_empty() {
            return Err(CoreError::StreamCorrupt {
                session: self.path.display().to_string(),
                reason: "stream-out has no header line".to_string(),
            });
        }
        let header_line = lines.remove(0);
        let header: StreamHeader = serde_json::from_slice(&header_line).map_err(|e| {
            CoreError::StreamCorrupt {
                session: self.path.display().to_string(),
                reason: format!("invalid header: {e}"),
            }
        })?;

        let events = lines
            .iter()
            .map(|line| StreamEvent::parse_line(&String::from_utf8_lossy(line)))
            .collect::<Result<Vec<_>>>()?;
        Ok((header, events))
    }

    /// Reads newly-appended complete lines since the last call, §4.3
    /// Tail loop. A trailing partial line is buffered, not parsed.
    pub fn poll(&mut self) -> Result<Vec<StreamEvent>> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(self.path.display().to_string())
            } else {
                CoreError::io(&self.path, e)
            }
        })?;
        if metadata.len() < self.offset {
            return Err(CoreError::StreamCorrupt {
                session: self.path.display().to_string(),
                reason: format!(
                    "stream-out shrank from {} to {} bytes",
                    self.offset,
                    metadata.len()
                ),
            });
        }
        if metadata.len() == self.offset {
            return Ok(Vec::new());
        }

        self.file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| CoreError::io(&self.path, e))?;
        let mut chunk = Vec::new();
        self.file
            .read_to_end(&mut chunk)
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.offset += chunk.len() as u64;

        let lines = split_lines(&chunk, &mut self.pending);
        lines
            .iter()
            .map(|line| StreamEvent::parse_line(&String::from_utf8_lossy(line)))
            .collect()
    }
}

/// Splits `data` (prefixed by any carried-over `pending` bytes) on
/// `\n`, leaving a new trailing partial line in `pending`.
fn split_lines(data: &[u8], pending: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut buf = std::mem::take(pending);
    buf.extend_from_slice(data);

    let mut lines = Vec::new();
    let mut start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            lines.push(buf[start..i].to_vec());
            start = i + 1;
        }
    }
    *pending = buf[start..].to_vec();
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn replay_parses_header_and_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream-out");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"version":2,"width":80,"height":24,"timestamp":1700000000,"env":{{}}}}"#).unwrap();
        writeln!(file, r#"[0.1,"o","hi"]"#).unwrap();
        drop(file);

        let mut follower = Follower::open(&path).unwrap();
        let (header, events) = follower.replay().unwrap();
        assert_eq!(header.width, 80);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn poll_returns_only_newly_appended_complete_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream-out");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(file, r#"{{"version":2,"width":80,"height":24,"timestamp":1700000000,"env":{{}}}}"#).unwrap();

        let mut follower = Follower::open(&path).unwrap();
        follower.replay().unwrap();

        write!(file, r#"[0.1,"o","partial"#).unwrap(); // no trailing newline yet
        let events = follower.poll().unwrap();
        assert!(events.is_empty());

        writeln!(file, r#""]"#).unwrap();
        let events = follower.poll().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn shrink_is_stream_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream-out");
        std::fs::write(&path, b"line one\nline two\n").unwrap();
        let mut follower = Follower::open(&path).unwrap();
        follower.offset = 1000;
        let err = follower.poll().unwrap_err();
        assert!(matches!(err, CoreError::StreamCorrupt { .. }));
    }
}
