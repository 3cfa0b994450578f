//! Dialogue Log - durable append-only JSONL log of every exchange
//!
//! One record per line. The record count is rebuilt from the file at
//! startup; a torn trailing line left by a crash is cut off before any
//! new record is appended behind it.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::DialogueRecord;

/// Line shape accepted on read; tolerates logs written without a turn index
/// and with epoch-seconds timestamps
#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    turn_index: Option<u64>,
    user: String,
    agent: String,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

impl LogLine {
    fn into_record(self, position: u64) -> DialogueRecord {
        if let Some(idx) = self.turn_index {
            if idx != position {
                warn!("Dialogue log line {} carries turn_index {}, using position", position, idx);
            }
        }
        DialogueRecord {
            turn_index: position,
            user_text: self.user,
            agent_text: self.agent,
            timestamp: parse_timestamp(self.timestamp.as_ref()),
        }
    }
}

fn parse_timestamp(value: Option<&serde_json::Value>) -> DateTime<Utc> {
    match value {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| {
                let nanos = (secs.fract() * 1e9) as u32;
                Utc.timestamp_opt(secs.trunc() as i64, nanos).single()
            })
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

/// Append-only dialogue log
pub struct DialogueLog {
    path: PathBuf,
    count: u64,
    /// Byte length of the complete records on disk
    len: u64,
}

/// Whether a raw log line holds a record; blank lines never count
fn is_record_line(line: &[u8]) -> bool {
    !String::from_utf8_lossy(line).trim().is_empty()
}

/// Complete lines of a log file, ignoring a torn tail
fn complete_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let complete_len = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |pos| pos + 1);
    bytes[..complete_len]
        .split(|&b| b == b'\n')
        .filter(|line| is_record_line(line))
}

/// Run `write` against `file`, cutting the file back to `len` if it fails
fn write_or_rollback<F>(file: &mut File, len: u64, write: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    if let Err(e) = write(file) {
        if let Err(rollback) = file.set_len(len).and_then(|_| file.sync_all()) {
            warn!("Could not roll back partial dialogue record: {}", rollback);
        }
        return Err(e);
    }
    Ok(())
}

impl DialogueLog {
    /// Open (or create) the log and rebuild the record count
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create dialogue log directory")?;
        }

        let (count, len) = if path.exists() {
            Self::recover(&path)?
        } else {
            (0, 0)
        };

        debug!("Opened dialogue log {} ({} records)", path.display(), count);
        Ok(Self { path, count, len })
    }

    /// Count complete records, truncating a torn tail if present
    fn recover(path: &Path) -> Result<(u64, u64)> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read dialogue log {}", path.display()))?;

        let complete_len = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |pos| pos + 1);
        if complete_len < bytes.len() {
            warn!(
                "Dialogue log {} has a torn trailing record ({} bytes), truncating",
                path.display(),
                bytes.len() - complete_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(complete_len as u64)?;
            file.sync_all()?;
        }

        let count = complete_lines(&bytes).count();
        Ok((count as u64, complete_len as u64))
    }

    /// Durably append one exchange and return its record
    ///
    /// A failed write is rolled back so the next record starts on a clean line.
    pub fn append(&mut self, user_text: &str, agent_text: &str) -> Result<DialogueRecord> {
        let record = DialogueRecord::new(self.count, user_text, agent_text);

        let mut line = serde_json::to_string(&record).context("Failed to serialize dialogue record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open dialogue log {}", self.path.display()))?;

        let on_disk = file.metadata()?.len();
        if on_disk > self.len {
            warn!(
                "Dialogue log {} has {} stray bytes after the last record, truncating",
                self.path.display(),
                on_disk - self.len
            );
            file.set_len(self.len)?;
        }

        write_or_rollback(&mut file, self.len, |file| {
            file.write_all(line.as_bytes())?;
            file.sync_data()
        })
        .context("Failed to write dialogue record")?;

        self.count += 1;
        self.len += line.len() as u64;
        Ok(record)
    }

    /// Number of durable records
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the first `n` records
    ///
    /// Only complete lines are read, so a concurrent append past position
    /// `n` is never observed. Blank lines are skipped the same way `open`
    /// skips them when counting.
    pub fn read_prefix(path: &Path, n: u64) -> Result<Vec<DialogueRecord>> {
        if n == 0 || !path.exists() {
            return Ok(Vec::new());
        }

        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read dialogue log {}", path.display()))?;

        let mut records = Vec::new();
        for (position, line) in complete_lines(&bytes).take(n as usize).enumerate() {
            let position = position as u64;
            match serde_json::from_slice::<LogLine>(line) {
                Ok(parsed) => records.push(parsed.into_record(position)),
                Err(e) => warn!("Skipping unreadable dialogue log line {}: {}", position, e),
            }
        }

        Ok(records)
    }

    /// Read every record currently in the log
    pub fn read_all(&self) -> Result<Vec<DialogueRecord>> {
        Self::read_prefix(&self.path, self.count)
    }
}
