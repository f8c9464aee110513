//! On-disk data model, §3, and the asciinema-v2 stream wire format, §4.1.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// One of the three monotonic session lifecycle states, §3 invariant:
/// `starting → running → exited`, never reversed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// The persistent `session.json` record, §3 Data Model.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: Timestamp,
    pub pid: i32,
    pub cols: u16,
    pub rows: u16,
    pub control_path: PathBuf,
}

impl SessionInfo {
    /// `basename(cmd[0]) (abbrev(cwd))`, the §3 default name.
    pub fn default_name(command: &[String], working_dir: &Path) -> String {
        let base = command
            .first()
            .map(|c| {
                Path::new(c)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| c.clone())
            })
            .unwrap_or_else(|| "shell".to_string());
        format!("{base} ({})", abbreviate_path(working_dir))
    }

    /// Atomically (re-)writes this record to `<control_path>/session.json`
    /// via a temp file + rename, per §3's "written atomically" contract.
    pub fn persist(&self) -> Result<()> {
        let path = self.control_path.join("session.json");
        let json = serde_json::to_vec_pretty(self).map_err(|e| CoreError::io(&path, e.into()))?;
        let dir = self.control_path.clone();
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| CoreError::io(&dir, e))?;
        tmp.write_all(&json).map_err(|e| CoreError::io(&path, e))?;
        tmp.flush().map_err(|e| CoreError::io(&path, e))?;
        tmp.persist(&path)
            .map_err(|e| CoreError::io(&path, e.error))?;
        Ok(())
    }

    /// Reads `<control_path>/session.json`.
    pub fn load(control_path: &Path) -> Result<Self> {
        let path = control_path.join("session.json");
        let bytes = std::fs::read(&path).map_err(|e| CoreError::io(&path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::StreamCorrupt {
                session: control_path.display().to_string(),
                reason: format!("malformed session.json: {e}"),
            })
    }
}

fn abbreviate_path(path: &Path) -> String {
    let s = path.display().to_string();
    if let Some(home) = std::env::home_dir() {
        if let Ok(rest) = path.strip_prefix(&home) {
            return format!("~/{}", rest.display());
        }
    }
    s
}

/// Stream-out header line, §4.1: emitted once before the first event.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp: i64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One asciinema-v2 event line, `[elapsed_seconds, type, data]`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Output { t: f64, data: Vec<u8> },
    Resize { t: f64, cols: u32, rows: u32 },
    Exit { t: f64, exit_code: i32 },
}

impl StreamEvent {
    pub fn t(&self) -> f64 {
        match self {
            Self::Output { t, .. } | Self::Resize { t, .. } | Self::Exit { t, .. } => *t,
        }
    }

    /// Parses one JSON array line of the form `[t, "o"|"r"|"x", data]`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| CoreError::StreamCorrupt {
                session: String::new(),
                reason: format!("invalid event line: {e}"),
            })?;
        let arr = value.as_array().ok_or_else(|| CoreError::StreamCorrupt {
            session: String::new(),
            reason: "event line is not a JSON array".to_string(),
        })?;
        if arr.len() != 3 {
            return Err(CoreError::StreamCorrupt {
                session: String::new(),
                reason: format!("event line has {} elements, expected 3", arr.len()),
            });
        }
        let t = arr[0].as_f64().ok_or_else(|| CoreError::StreamCorrupt {
            session: String::new(),
            reason: "event timestamp is not a number".to_string(),
        })?;
        let kind = arr[1].as_str().ok_or_else(|| CoreError::StreamCorrupt {
            session: String::new(),
            reason: "event type is not a string".to_string(),
        })?;
        match kind {
            "o" => {
                let data = arr[2].as_str().ok_or_else(|| CoreError::StreamCorrupt {
                    session: String::new(),
                    reason: "output event data is not a string".to_string(),
                })?;
                Ok(Self::Output {
                    t,
                    data: data.as_bytes().to_vec(),
                })
            }
            "r" => {
                let spec = arr[2].as_str().ok_or_else(|| CoreError::StreamCorrupt {
                    session: String::new(),
                    reason: "resize event data is not a string".to_string(),
                })?;
                let (cols, rows) = spec.split_once('x').ok_or_else(|| CoreError::StreamCorrupt {
                    session: String::new(),
                    reason: format!("malformed resize spec: {spec}"),
                })?;
                let cols = cols.parse().map_err(|_| CoreError::StreamCorrupt {
                    session: String::new(),
                    reason: format!("malformed resize cols: {spec}"),
                })?;
                let rows = rows.parse().map_err(|_| CoreError::StreamCorrupt {
                    session: String::new(),
                    reason: format!("malformed resize rows: {spec}"),
                })?;
                Ok(Self::Resize { t, cols, rows })
            }
            "x" => {
                let exit_code = arr[2].as_i64().ok_or_else(|| CoreError::StreamCorrupt {
                    session: String::new(),
                    reason: "exit event data is not an integer".to_string(),
                })? as i32;
                Ok(Self::Exit { t, exit_code })
            }
            other => Err(CoreError::StreamCorrupt {
                session: String::new(),
                reason: format!("unknown event type: {other}"),
            }),
        }
    }
}

/// Serializes bytes the same lossy way the wire format requires: valid
/// UTF-8 passes through, invalid sequences become U+FFFD, matching §4.1
/// ("invalid sequences preserved byte-wise as replacement characters").
fn lossy_utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Single-writer appender for `stream-out`, owned exclusively by one
/// `SessionHost`. Every write is a full JSON line, flushed immediately
/// so tailers observe timely updates (§4.1: "flushed on every event").
pub struct StreamWriter {
    file: BufWriter<File>,
    header_timestamp: i64,
}

impl StreamWriter {
    /// Creates `stream-out`, writing the header line immediately.
    pub fn create(path: &Path, header: &StreamHeader) -> Result<Self> {
        let file = File::create(path).map_err(|e| CoreError::io(path, e))?;
        let mut file = BufWriter::new(file);
        let json = serde_json::to_string(header).map_err(|e| CoreError::io(path, e.into()))?;
        writeln!(file, "{json}").map_err(|e| CoreError::io(path, e))?;
        file.flush().map_err(|e| CoreError::io(path, e))?;
        Ok(Self {
            file,
            header_timestamp: header.timestamp,
        })
    }

    pub fn header_timestamp(&self) -> i64 {
        self.header_timestamp
    }

    fn write_line(&mut self, value: serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(&value).map_err(|e| CoreError::Other(e.into()))?;
        writeln!(self.file, "{json}").map_err(CoreError::from)?;
        self.file.flush().map_err(CoreError::from)?;
        Ok(())
    }

    pub fn write_output(&mut self, t: f64, chunk: &[u8]) -> Result<()> {
        self.write_line(serde_json::json!([t, "o", lossy_utf8(chunk)]))
    }

    pub fn write_resize(&mut self, t: f64, cols: u32, rows: u32) -> Result<()> {
        self.write_line(serde_json::json!([t, "r", format!("{cols}x{rows}")]))
    }

    /// Final event; the caller closes the file after this returns.
    pub fn write_exit(&mut self, t: f64, exit_code: i32) -> Result<()> {
        self.write_line(serde_json::json!([t, "x", exit_code]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_name_uses_basename_and_cwd() {
        let name = SessionInfo::default_name(
            &["/bin/bash".to_string()],
            Path::new("/tmp/project"),
        );
        assert!(name.starts_with("bash ("));
    }

    #[test]
    fn session_info_round_trips_through_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let info = SessionInfo {
            id: "abc123".to_string(),
            name: "bash (~/proj)".to_string(),
            command: vec!["/bin/bash".to_string()],
            working_dir: PathBuf::from("/tmp"),
            status: SessionStatus::Running,
            exit_code: None,
            started_at: Timestamp::now(),
            pid: 4242,
            cols: 80,
            rows: 24,
            control_path: dir.path().to_path_buf(),
        };
        info.persist().unwrap();
        let loaded = SessionInfo::load(dir.path()).unwrap();
        assert_eq!(loaded.id, "abc123");
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.cols, 80);
    }

    #[test]
    fn stream_event_parses_output_resize_exit() {
        let out = StreamEvent::parse_line(r#"[1.5,"o","hello\r\n"]"#).unwrap();
        assert_eq!(
            out,
            StreamEvent::Output {
                t: 1.5,
                data: b"hello\r\n".to_vec()
            }
        );

        let resize = StreamEvent::parse_line(r#"[2.0,"r","120x40"]"#).unwrap();
        assert_eq!(
            resize,
            StreamEvent::Resize {
                t: 2.0,
                cols: 120,
                rows: 40
            }
        );

        let exit = StreamEvent::parse_line(r#"[3.25,"x",0]"#).unwrap();
        assert_eq!(exit, StreamEvent::Exit { t: 3.25, exit_code: 0 });
    }

    #[test]
    fn stream_event_rejects_malformed_lines() {
        assert!(StreamEvent::parse_line("not json").is_err());
        assert!(StreamEvent::parse_line(r#"[1.0,"z","?"]"#).is_err());
        assert!(StreamEvent::parse_line(r#"[1.0,"r","bogus"]"#).is_err());
    }

    #[test]
    fn writer_emits_header_then_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream-out");
        let header = StreamHeader {
            version: 2,
            width: 80,
            height: 24,
            timestamp: 1_700_000_000,
            env: HashMap::new(),
        };
        let mut writer = StreamWriter::create(&path, &header).unwrap();
        writer.write_output(0.1, b"hello\r\n").unwrap();
        writer.write_resize(0.2, 120, 40).unwrap();
        writer.write_exit(0.3, 0).unwrap();
        drop(writer);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("\"version\":2"));
        let ev = StreamEvent::parse_line(lines[1]).unwrap();
        assert_eq!(ev, StreamEvent::Output { t: 0.1, data: b"hello\r\n".to_vec() });
    }
}
