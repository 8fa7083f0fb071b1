//! `pm-hub status`: report on a running hub.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::config::HubConfig;
use crate::hub::daemon;

/// Fetch the status document of the hub advertised under `project_root`.
///
/// # Errors
///
/// Fails when no state file exists, its process is gone, or the hub does
/// not answer.
pub fn fetch(project_root: &Path) -> Result<Value> {
    let config = HubConfig::load(project_root)?;
    let state_path = config.state_file_path();

    let Some(record) = daemon::read_state_file(&state_path) else {
        bail!("No hub state file at {}. Is the hub running?", state_path.display());
    };
    if !daemon::is_process_alive(record.pid) {
        bail!(
            "Hub process {} from {} is not running (stale state file)",
            record.pid,
            state_path.display()
        );
    }

    let url = format!("http://{}:{}/api/status", config.host, record.port);
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client.get(&url).send()?;
    if !response.status().is_success() {
        bail!("Hub answered {}: {}", url, response.status());
    }
    Ok(response.json()?)
}

/// Print the status document.
///
/// # Errors
///
/// See [`fetch`].
pub fn run(project_root: &Path) -> Result<()> {
    let status = fetch(project_root)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
