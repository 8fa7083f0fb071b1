//! Durable bus contract and two implementations.
//!
//! The bus is an append-only log of addressed messages. Each reader identity
//! owns a cursor; the hub reads what is addressed to it and not yet
//! acknowledged, then acknowledges the consumed range. The cursor is opaque
//! to the hub: each implementation decides what it encodes.
//!
//! - [`MemoryBus`] keeps everything in process (embedding, tests).
//! - [`JsonlBus`] appends JSON lines to a file and keeps one cursor file per
//!   identity next to it.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Unique id assigned by the sender.
    pub id: String,
    /// When the entry was written.
    pub ts: DateTime<Utc>,
    /// Sender identity.
    pub from: String,
    /// Recipient identity.
    pub to: String,
    /// Entry kind (`ask`, `task_complete`, `answer`, `pm_hub.*`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl BusMessage {
    /// New entry with a fresh id and the current time.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Opaque read position owned by the bus implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusCursor(pub String);

/// Restricts which entry kinds a read returns. Empty means all kinds.
#[derive(Debug, Clone, Default)]
pub struct BusFilter {
    kinds: Vec<String>,
}

impl BusFilter {
    /// Accept every kind.
    pub fn all() -> Self {
        Self::default()
    }

    /// Accept only the listed kinds.
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `message` passes the filter.
    pub fn matches(&self, message: &BusMessage) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| *k == message.kind)
    }
}

/// Result of [`DurableBus::read_unacknowledged`].
#[derive(Debug, Clone, Default)]
pub struct UnackedBatch {
    /// Entries addressed to the reader that passed the filter.
    pub messages: Vec<BusMessage>,
    /// Position just past everything that was read.
    pub cursor: BusCursor,
}

/// Append-only message bus.
pub trait DurableBus: Send + Sync {
    /// Append an entry.
    fn send(&self, message: BusMessage) -> Result<()>;

    /// Entries addressed to `identity` past its acknowledged cursor.
    fn read_unacknowledged(&self, identity: &str, filter: &BusFilter) -> Result<UnackedBatch>;

    /// Mark everything up to `cursor` (and the listed ids) as consumed.
    fn acknowledge(&self, identity: &str, cursor: &BusCursor, ids: &[String]) -> Result<()>;

    /// Stored cursor for `identity`, if any.
    fn load_cursor(&self, identity: &str) -> Result<Option<BusCursor>>;

    /// Overwrite the stored cursor for `identity`.
    fn write_cursor(&self, identity: &str, cursor: &BusCursor) -> Result<()>;
}

fn parse_offset(cursor: &BusCursor) -> Result<u64> {
    cursor
        .0
        .parse()
        .with_context(|| format!("Invalid bus cursor: {:?}", cursor.0))
}

// =============================================================================
// MemoryBus
// =============================================================================

#[derive(Debug, Default)]
struct MemoryBusState {
    log: Vec<BusMessage>,
    cursors: HashMap<String, BusCursor>,
    acked: HashMap<String, HashSet<String>>,
}

/// In-process bus. Cursors are indexes into the log.
#[derive(Debug, Default)]
pub struct MemoryBus {
    state: Mutex<MemoryBusState>,
}

impl MemoryBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry ever sent, oldest first.
    pub fn messages(&self) -> Vec<BusMessage> {
        self.lock().log.clone()
    }

    /// Entries addressed to `identity`, oldest first.
    pub fn messages_to(&self, identity: &str) -> Vec<BusMessage> {
        self.lock()
            .log
            .iter()
            .filter(|m| m.to == identity)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurableBus for MemoryBus {
    fn send(&self, message: BusMessage) -> Result<()> {
        self.lock().log.push(message);
        Ok(())
    }

    fn read_unacknowledged(&self, identity: &str, filter: &BusFilter) -> Result<UnackedBatch> {
        let state = self.lock();
        let start = match state.cursors.get(identity) {
            Some(cursor) => usize::try_from(parse_offset(cursor)?)?,
            None => 0,
        };
        let acked = state.acked.get(identity);
        let messages = state
            .log
            .iter()
            .skip(start)
            .filter(|m| m.to == identity && filter.matches(m))
            .filter(|m| acked.map_or(true, |ids| !ids.contains(&m.id)))
            .cloned()
            .collect();
        Ok(UnackedBatch {
            messages,
            cursor: BusCursor(state.log.len().to_string()),
        })
    }

    fn acknowledge(&self, identity: &str, cursor: &BusCursor, ids: &[String]) -> Result<()> {
        parse_offset(cursor)?;
        let mut state = self.lock();
        state.cursors.insert(identity.to_string(), cursor.clone());
        state
            .acked
            .entry(identity.to_string())
            .or_default()
            .extend(ids.iter().cloned());
        Ok(())
    }

    fn load_cursor(&self, identity: &str) -> Result<Option<BusCursor>> {
        Ok(self.lock().cursors.get(identity).cloned())
    }

    fn write_cursor(&self, identity: &str, cursor: &BusCursor) -> Result<()> {
        parse_offset(cursor)?;
        self.lock()
            .cursors
            .insert(identity.to_string(), cursor.clone());
        Ok(())
    }
}

// =============================================================================
// JsonlBus
// =============================================================================

/// File-backed bus: one JSON entry per line. Cursors are byte offsets.
#[derive(Debug)]
pub struct JsonlBus {
    log_path: PathBuf,
    cursor_dir: PathBuf,
    // Serializes appends from concurrent tasks in this process.
    write_lock: Mutex<()>,
}

impl JsonlBus {
    /// Bus stored at `log_path`, cursors in `<log dir>/cursors/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(log_path: impl Into<PathBuf>) -> Result<Self> {
        let log_path = log_path.into();
        let parent = log_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let cursor_dir = parent.join("cursors");
        fs::create_dir_all(&cursor_dir)
            .with_context(|| format!("Failed to create bus directory: {}", cursor_dir.display()))?;
        Ok(Self {
            log_path,
            cursor_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn cursor_path(&self, identity: &str) -> PathBuf {
        let safe: String = identity
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.cursor_dir.join(format!("{safe}.json"))
    }
}

impl DurableBus for JsonlBus {
    fn send(&self, message: BusMessage) -> Result<()> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open bus log: {}", self.log_path.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn read_unacknowledged(&self, identity: &str, filter: &BusFilter) -> Result<UnackedBatch> {
        let start = match self.load_cursor(identity)? {
            Some(cursor) => parse_offset(&cursor)?,
            None => 0,
        };

        let file = match fs::File::open(&self.log_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UnackedBatch {
                    messages: Vec::new(),
                    cursor: BusCursor(start.to_string()),
                });
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open bus log: {}", self.log_path.display())
                })
            }
        };

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start))?;

        let mut offset = start;
        let mut messages = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            // Stop at EOF or at a line still being written.
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            offset += n as u64;

            match serde_json::from_str::<BusMessage>(line.trim_end()) {
                Ok(message) if message.to == identity && filter.matches(&message) => {
                    messages.push(message);
                }
                Ok(_) => {}
                Err(e) => log::warn!("[Bus] Skipping malformed entry at offset {}: {e}", offset),
            }
        }

        Ok(UnackedBatch {
            messages,
            cursor: BusCursor(offset.to_string()),
        })
    }

    fn acknowledge(&self, identity: &str, cursor: &BusCursor, ids: &[String]) -> Result<()> {
        log::debug!("[Bus] {} acknowledged {} entries up to {}", identity, ids.len(), cursor.0);
        self.write_cursor(identity, cursor)
    }

    fn load_cursor(&self, identity: &str) -> Result<Option<BusCursor>> {
        let path = self.cursor_path(identity);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content).with_context(|| {
                format!("Invalid cursor file: {}", path.display())
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read cursor: {}", path.display())),
        }
    }

    fn write_cursor(&self, identity: &str, cursor: &BusCursor) -> Result<()> {
        parse_offset(cursor)?;
        let path = self.cursor_path(identity);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(cursor)?)
            .with_context(|| format!("Failed to write cursor: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move cursor into place: {}", path.display()))?;
        Ok(())
    }
}
