//! Configuration loading.
//!
//! The hub reads `<project_root>/.pm-hub/config.json` when it exists and
//! then applies `PM_HUB_*` environment overrides. Everything has a default,
//! so a missing file is not an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Directory (relative to the project root) holding hub-owned files.
pub const HUB_DIR: &str = ".pm-hub";

/// Admission limiter settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of the short window in seconds.
    pub short_window_secs: u64,
    /// Requests allowed per short window.
    pub short_window_cap: u32,
    /// Length of the long window in seconds.
    pub long_window_secs: u64,
    /// Requests allowed per long window.
    pub long_window_cap: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            short_window_secs: constants::DEFAULT_SHORT_WINDOW.as_secs(),
            short_window_cap: constants::DEFAULT_SHORT_WINDOW_CAP,
            long_window_secs: constants::DEFAULT_LONG_WINDOW.as_secs(),
            long_window_cap: constants::DEFAULT_LONG_WINDOW_CAP,
        }
    }
}

/// Configuration for a hub instance.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HubConfig {
    /// Address to bind. Loopback by default.
    pub host: String,
    /// First port to try. `0` lets the OS pick.
    pub port: u16,
    /// Consecutive ports tried when the preferred one is taken.
    pub max_port_attempts: u16,
    /// Heartbeat silence (seconds) before a peer is reported stale.
    pub stale_threshold_secs: u64,
    /// Seconds between liveness sweeps.
    pub sweep_interval_secs: u64,
    /// Admission limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Cap on queued messages per peer.
    pub max_pending: usize,
    /// Root of the project the hub coordinates. Not persisted.
    #[serde(skip)]
    pub project_root: PathBuf,
    /// Hub state file, relative to `project_root` unless absolute.
    pub state_file: PathBuf,
    /// Directory of per-session records, relative to `project_root` unless absolute.
    pub sessions_dir: PathBuf,
    /// Durable bus log file. `None` runs without a bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_log: Option<PathBuf>,
    /// Task-graph tool binary. `None` disables the task routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_tool: Option<String>,
    /// Seconds to wait for the Brain before failing the question.
    pub brain_timeout_secs: u64,
    /// Seconds to wait for one task-tool call before failing it.
    pub task_tool_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: constants::DEFAULT_HOST.to_string(),
            port: constants::DEFAULT_PORT,
            max_port_attempts: constants::DEFAULT_MAX_PORT_ATTEMPTS,
            stale_threshold_secs: constants::DEFAULT_STALE_THRESHOLD.as_secs(),
            sweep_interval_secs: constants::DEFAULT_SWEEP_INTERVAL.as_secs(),
            rate_limit: RateLimitConfig::default(),
            max_pending: constants::DEFAULT_MAX_PENDING,
            project_root: PathBuf::from("."),
            state_file: Path::new(HUB_DIR).join("hub-state.json"),
            sessions_dir: Path::new(HUB_DIR).join("sessions"),
            bus_log: None,
            task_tool: Some(constants::DEFAULT_TASK_TOOL.to_string()),
            brain_timeout_secs: constants::DEFAULT_BRAIN_TIMEOUT.as_secs(),
            task_tool_timeout_secs: constants::DEFAULT_TASK_TOOL_TIMEOUT.as_secs(),
        }
    }
}

impl HubConfig {
    /// Load configuration for `project_root`: file first, then env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load(project_root: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(project_root)?;
        config.project_root = project_root.to_path_buf();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(HUB_DIR).join("config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config: {}", config_path.display()))
    }

    /// Apply `PM_HUB_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("PM_HUB_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PM_HUB_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(secs) = lookup("PM_HUB_STALE_SECS").and_then(|v| v.parse().ok()) {
            self.stale_threshold_secs = secs;
        }
        if let Some(secs) = lookup("PM_HUB_SWEEP_SECS").and_then(|v| v.parse().ok()) {
            self.sweep_interval_secs = secs;
        }
        if let Some(max) = lookup("PM_HUB_MAX_PENDING").and_then(|v| v.parse().ok()) {
            self.max_pending = max;
        }
        if let Some(cap) = lookup("PM_HUB_RATE_PER_MINUTE").and_then(|v| v.parse().ok()) {
            self.rate_limit.short_window_cap = cap;
        }
        if let Some(cap) = lookup("PM_HUB_RATE_PER_HOUR").and_then(|v| v.parse().ok()) {
            self.rate_limit.long_window_cap = cap;
        }
        if let Some(secs) = lookup("PM_HUB_BRAIN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.brain_timeout_secs = secs;
        }
        if let Some(secs) = lookup("PM_HUB_TASK_TOOL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.task_tool_timeout_secs = secs;
        }
        if let Some(tool) = lookup("PM_HUB_TASK_TOOL") {
            self.task_tool = if tool.is_empty() { None } else { Some(tool) };
        }
    }

    /// Staleness threshold as a `Duration`.
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Brain timeout as a `Duration`.
    pub fn brain_timeout(&self) -> Duration {
        Duration::from_secs(self.brain_timeout_secs.max(1))
    }

    /// Task-tool timeout as a `Duration`.
    pub fn task_tool_timeout(&self) -> Duration {
        Duration::from_secs(self.task_tool_timeout_secs.max(1))
    }

    /// Absolute path of the hub state file.
    pub fn state_file_path(&self) -> PathBuf {
        self.resolve(&self.state_file)
    }

    /// Absolute path of the session record directory.
    pub fn sessions_dir_path(&self) -> PathBuf {
        self.resolve(&self.sessions_dir)
    }

    /// Absolute path of the bus log, if configured.
    pub fn bus_log_path(&self) -> Option<PathBuf> {
        self.bus_log.as_deref().map(|p| self.resolve(p))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}
