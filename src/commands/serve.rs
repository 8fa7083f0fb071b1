//! `pm-hub serve`: run the hub until Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::collab::{CommandTaskGraph, Collaborators, DurableBus, JsonlBus, SessionDir};
use crate::config::HubConfig;
use crate::hub::Hub;

/// Command-line overrides for `serve`. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Project the hub coordinates.
    pub project_root: PathBuf,
    /// First port to try.
    pub port: Option<u16>,
    /// Session record directory.
    pub sessions_dir: Option<PathBuf>,
    /// Durable bus log file.
    pub bus: Option<PathBuf>,
    /// Task-graph tool binary.
    pub task_tool: Option<String>,
}

/// Resolve configuration: file, then env, then command-line flags.
///
/// # Errors
///
/// Returns an error if the config file is invalid.
pub fn resolve_config(options: &ServeOptions) -> Result<HubConfig> {
    let mut config = HubConfig::load(&options.project_root)?;
    if let Some(port) = options.port {
        config.port = port;
    }
    if let Some(ref dir) = options.sessions_dir {
        config.sessions_dir = dir.clone();
    }
    if let Some(ref bus) = options.bus {
        config.bus_log = Some(bus.clone());
    }
    if let Some(ref tool) = options.task_tool {
        config.task_tool = Some(tool.clone()).filter(|t| !t.is_empty());
    }
    Ok(config)
}

/// Build the shipped collaborators for `config`. No Brain is wired in.
///
/// # Errors
///
/// Returns an error if the bus log directory cannot be created.
pub fn build_collaborators(config: &HubConfig) -> Result<Collaborators> {
    let mut collab =
        Collaborators::none().with_sessions(Arc::new(SessionDir::new(config.sessions_dir_path())));

    if let Some(path) = config.bus_log_path() {
        let bus = JsonlBus::open(&path)
            .with_context(|| format!("Failed to open bus log: {}", path.display()))?;
        log::info!("[Bus] Using bus log {}", path.display());
        collab = collab.with_bus(Arc::new(bus) as Arc<dyn DurableBus>);
    }
    if let Some(ref tool) = config.task_tool {
        collab = collab.with_tasks(Arc::new(
            CommandTaskGraph::new(tool.clone()).with_cwd(config.project_root.clone()),
        ));
    }
    Ok(collab)
}

/// Run the hub until interrupted, then shut it down cleanly.
///
/// # Errors
///
/// Returns an error if configuration, the runtime, or binding fails.
pub fn run(options: ServeOptions) -> Result<()> {
    let config = resolve_config(&options)?;
    let collab = build_collaborators(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    runtime.block_on(async move {
        let hub = Hub::new(config, collab);
        let running = hub.start().await?;
        println!("pm-hub listening on {}", running.local_addr());

        wait_for_shutdown_signal().await;
        log::info!("[Hub] Shutdown signal received");
        running.shutdown().await;
        Ok(())
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("[Hub] Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let options = ServeOptions {
            project_root: tmp.path().to_path_buf(),
            port: Some(0),
            sessions_dir: Some(PathBuf::from("/var/sessions")),
            bus: Some(PathBuf::from("bus/messages.jsonl")),
            task_tool: Some(String::new()),
        };
        let config = resolve_config(&options).unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.sessions_dir_path(), PathBuf::from("/var/sessions"));
        assert_eq!(
            config.bus_log_path(),
            Some(tmp.path().join("bus/messages.jsonl"))
        );
        assert_eq!(config.task_tool, None);

        let collab = build_collaborators(&config).unwrap();
        assert!(collab.bus.is_some());
        assert!(collab.sessions.is_some());
        assert!(collab.tasks.is_none());
        assert!(collab.brain.is_none());
    }
}
