//! Hub state file management and process discovery.
//!
//! A running hub advertises itself through a small JSON record so that
//! launchers and `pm-hub status` can find the port it ended up on.
//!
//! # File Layout
//!
//! ```text
//! {project_root}/.pm-hub/
//!   hub-state.json       # {"port": 3847, "pid": 1234, "started_at": "..."}
//!   sessions/            # one {session_id}.json per launched worker
//!   config.json          # optional overrides
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of the hub state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubStateRecord {
    /// Port the hub is listening on.
    pub port: u16,
    /// Process id of the hub.
    pub pid: u32,
    /// When the hub started listening.
    pub started_at: DateTime<Utc>,
}

impl HubStateRecord {
    /// Record for the current process.
    pub fn current(port: u16) -> Self {
        Self {
            port,
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

/// Write the state file, creating parent directories.
pub fn write_state_file(path: &Path, record: &HubStateRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(record)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write state file: {}", path.display()))?;
    log::info!(
        "[Hub] Wrote state file: {} (port={}, pid={})",
        path.display(),
        record.port,
        record.pid
    );
    Ok(())
}

/// Read the state file.
///
/// Returns `None` if the file doesn't exist or can't be parsed.
pub fn read_state_file(path: &Path) -> Option<HubStateRecord> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Remove the state file. Safe to call when it doesn't exist.
pub fn remove_state_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::info!("[Hub] Removed state file: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[Hub] Failed to remove state file {}: {e}", path.display()),
    }
}

/// Check whether a process is alive via `kill(pid, 0)`.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Read the state file and confirm its process is still running.
pub fn running_hub(path: &Path) -> Option<HubStateRecord> {
    read_state_file(path).filter(|record| is_process_alive(record.pid))
}
