//! Hub lifecycle: bind, background loops, shutdown.
//!
//! [`Hub::start`] binds the listener (trying successive ports from the
//! configured one), advertises the port in the state file and spawns:
//!
//! - the axum server (HTTP requests and live channel upgrades)
//! - the liveness sweep, every `sweep_interval`
//! - a single reconciliation pass against the durable bus
//!
//! Live channels run on tasks tracked by the hub itself. The returned
//! [`RunningHub`] tears all of that down on [`RunningHub::shutdown`] or, as
//! a fallback, on drop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{bridge, daemon, Hub};
use crate::socket::framing::close_code;
use crate::socket::server;

/// How long shutdown waits for the server to drain and for live channels
/// to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A hub that is bound and serving.
#[derive(Debug)]
pub struct RunningHub {
    hub: Hub,
    local_addr: SocketAddr,
    state_file: PathBuf,
    server: Option<JoinHandle<()>>,
    stop_server: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl Hub {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Fails if no port in the allowed range can be bound or the state file
    /// cannot be written.
    pub async fn start(&self) -> Result<RunningHub> {
        let config = self.config();
        let listener =
            server::bind_with_retry(&config.host, config.port, config.max_port_attempts).await?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        let state_file = config.state_file_path();
        daemon::write_state_file(&state_file, &daemon::HubStateRecord::current(local_addr.port()))?;
        self.set_listening(local_addr.port(), true);
        log::info!("[Hub] Listening on {}", local_addr);

        let (stop_server, stop) = oneshot::channel();
        let server = tokio::spawn(server::serve(listener, self.clone(), stop));

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(sweep_loop(self.clone())));

        if self.collaborators().bus.is_some() {
            let hub = self.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = bridge::reconcile(&hub).await {
                    log::warn!("[Bus] Reconciliation failed: {:#}", e);
                }
            }));
        }

        Ok(RunningHub {
            hub: self.clone(),
            local_addr,
            state_file,
            server: Some(server),
            stop_server: Some(stop_server),
            tasks,
            stopped: false,
        })
    }
}

async fn sweep_loop(hub: Hub) {
    let mut interval = tokio::time::interval(hub.config().sweep_interval());
    // First tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let evicted = hub.sweep();
        if !evicted.is_empty() {
            log::info!("[Sweep] Evicted {} peer(s)", evicted.len());
        }
    }
}

impl RunningHub {
    /// The hub being served.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Close live channels with 1001, remove the state file, then stop the
    /// server and the background tasks.
    pub async fn shutdown(mut self) {
        let closed = self.hub.close_all_channels(close_code::GOING_AWAY);
        log::info!("[Hub] Shutting down ({} live channel(s) closed)", closed);

        // The state file must be gone before the port is released.
        self.finish();

        if let Some(stop) = self.stop_server.take() {
            let _ = stop.send(());
        }
        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
                log::warn!("[Hub] Server did not drain within {:?}", SHUTDOWN_GRACE);
                server.abort();
                let _ = server.await;
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.hub.live_connections() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let aborted = self.hub.abort_live_tasks();
        if aborted > 0 {
            log::debug!("[Hub] Aborted {} lingering live channel task(s)", aborted);
        }
    }

    fn finish(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.hub.set_listening(self.local_addr.port(), false);
        daemon::remove_state_file(&self.state_file);
    }
}

impl Drop for RunningHub {
    fn drop(&mut self) {
        if !self.stopped {
            self.hub.close_all_channels(close_code::GOING_AWAY);
            self.finish();
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
        self.hub.abort_live_tasks();
    }
}
