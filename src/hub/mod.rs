//! Hub - coordination point for worker peers.
//!
//! The Hub owns every piece of runtime state: the peer table (sessions,
//! live bindings, pending queues), the admission limiter and the injected
//! collaborators. The socket and HTTP layers are thin adapters that decode
//! input and call into it.
//!
//! # Architecture
//!
//! ```text
//!     live channel (WS)        HTTP façade          durable bus
//!            │                      │                    │
//!            └──────────┬───────────┘                    │
//!                       ▼                                │
//!            ┌──────────────────────┐   mirror / replay  │
//!            │         Hub          │◄──────────────────►┘
//!            │  - PeerTable         │
//!            │  - AdmissionLimiter  │──► HubEvent broadcast
//!            │  - Collaborators     │
//!            └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let hub = Hub::new(config, Collaborators::none().with_bus(bus));
//! let running = hub.start().await?;
//! // ...
//! running.shutdown().await;
//! ```

pub mod bridge;
pub mod daemon;
pub mod events;
pub mod limiter;
pub mod messages;
pub mod registry;
pub mod run;

pub use bridge::ReconcileReport;
pub use events::{CompletionSource, DisconnectReason, HubEvent};
pub use limiter::{Admission, AdmissionLimiter, Window};
pub use registry::{
    parse_optional_session_id, parse_session_id, HeartbeatAttrs, LiveBinding, Outbound,
    PeerTable, PendingMessage, RegisterAttrs, RegisterError,
};
pub use run::RunningHub;

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::collab::{BrainReply, Collaborators, TaskGraphError};
use crate::config::HubConfig;
use crate::socket::framing::close_code;

/// Capacity of the lifecycle event channel. Slow subscribers lag.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A collaborator call that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    /// Collaborator not configured or could not be reached.
    #[error("{0}")]
    Unavailable(String),
    /// Collaborator ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl From<TaskGraphError> for CollabError {
    fn from(err: TaskGraphError) -> Self {
        if err.is_unavailable() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Failed(err.to_string())
        }
    }
}

struct HubInner {
    config: HubConfig,
    peers: Mutex<PeerTable>,
    limiter: AdmissionLimiter,
    collab: Collaborators,
    events: broadcast::Sender<HubEvent>,
    port: AtomicU16,
    listening: AtomicBool,
    next_conn_id: AtomicU64,
    live_connections: AtomicUsize,
    live_tasks: Mutex<JoinSet<()>>,
    handled_bus_ids: Mutex<HashSet<String>>,
    reconcile_gate: tokio::sync::Mutex<()>,
}

/// Shared handle to the hub. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("port", &self.port())
            .field("listening", &self.is_listening())
            .field("collaborators", &self.inner.collab)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Build a hub. Nothing is bound until [`Hub::start`].
    pub fn new(config: HubConfig, collab: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let limiter = AdmissionLimiter::from_config(&config.rate_limit);
        let peers = PeerTable::new(config.max_pending);
        Self {
            inner: Arc::new(HubInner {
                port: AtomicU16::new(config.port),
                config,
                peers: Mutex::new(peers),
                limiter,
                collab,
                events,
                listening: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
                live_connections: AtomicUsize::new(0),
                live_tasks: Mutex::new(JoinSet::new()),
                handled_bus_ids: Mutex::new(HashSet::new()),
                reconcile_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Injected collaborators.
    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collab
    }

    /// Admission limiter for the HTTP façade.
    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.inner.limiter
    }

    /// Port the hub is (or will be) listening on.
    pub fn port(&self) -> u16 {
        self.inner.port.load(Ordering::Relaxed)
    }

    /// Whether the server is listening.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Relaxed)
    }

    /// Open live channel connections.
    pub fn live_connections(&self) -> usize {
        self.inner.live_connections.load(Ordering::SeqCst)
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn set_listening(&self, port: u16, listening: bool) {
        self.inner.port.store(port, Ordering::Relaxed);
        self.inner.listening.store(listening, Ordering::Relaxed);
    }

    fn peers(&self) -> MutexGuard<'_, PeerTable> {
        self.inner
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stale_threshold(&self) -> TimeDelta {
        TimeDelta::from_std(self.inner.config.stale_threshold()).unwrap_or(TimeDelta::MAX)
    }

    // =========================================================================
    // Peer lifecycle
    // =========================================================================

    /// Register a session, optionally binding a live channel to it.
    ///
    /// With a binding, the `welcome` frame and any queued messages are pushed
    /// before the table lock is released, so they arrive ahead of anything
    /// sent afterwards. Returns the number of registered peers.
    ///
    /// # Errors
    ///
    /// Missing, malformed, or unknown session ids are refused. Without a
    /// session validator every well-formed id is accepted.
    pub fn register(
        &self,
        session_id: Option<&str>,
        attrs: RegisterAttrs,
        binding: Option<LiveBinding>,
    ) -> Result<usize, RegisterError> {
        let session_id = parse_session_id(session_id)?;
        if let Some(ref sessions) = self.inner.collab.sessions {
            if !sessions.exists(session_id) {
                return Err(RegisterError::UnknownSession(session_id.to_string()));
            }
        }

        let role = attrs.role.clone();
        let live = binding.is_some();
        let (registered, flushed) = {
            let mut peers = self.peers();
            peers.register(session_id, attrs, Utc::now());
            let mut flushed = 0;
            if let Some(binding) = binding {
                peers.bind(session_id, binding);
                let welcome = messages::welcome(self.port(), peers.len());
                peers.push_live(session_id, &welcome);
                flushed = peers.flush(session_id);
            }
            (peers.len(), flushed)
        };

        log::info!(
            "[Hub] Registered {} (role={}, live={}, flushed={})",
            session_id,
            role.as_deref().unwrap_or("-"),
            live,
            flushed
        );
        self.emit(HubEvent::AgentRegistered(events::AgentRegistered {
            session_id: session_id.to_string(),
            role,
            live,
        }));
        Ok(registered)
    }

    /// Record a liveness signal, creating the session when missing.
    ///
    /// # Errors
    ///
    /// Missing or malformed session ids are refused.
    pub fn heartbeat(&self, session_id: Option<&str>, attrs: HeartbeatAttrs) -> Result<(), RegisterError> {
        let session_id = parse_session_id(session_id)?;
        let task_id = attrs.task_id.clone();
        let created = self.peers().heartbeat(session_id, attrs, Utc::now());
        if created {
            log::info!("[Hub] Heartbeat created session {}", session_id);
        }
        self.emit(HubEvent::AgentHeartbeat(events::AgentHeartbeat {
            session_id: session_id.to_string(),
            task_id,
            created,
        }));
        Ok(())
    }

    /// Record a progress checkpoint.
    ///
    /// # Errors
    ///
    /// Missing or malformed session ids are refused.
    pub fn checkpoint(
        &self,
        session_id: Option<&str>,
        task_id: &str,
        step: Option<Value>,
        state: Value,
    ) -> Result<(), RegisterError> {
        let session_id = parse_session_id(session_id)?;
        self.peers().touch(session_id, Utc::now());
        self.emit(HubEvent::Checkpoint(events::Checkpoint {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            step,
            state,
        }));
        Ok(())
    }

    /// Publish a free-form request from a peer. The session id is optional.
    ///
    /// # Errors
    ///
    /// A malformed session id is refused.
    pub fn request(
        &self,
        session_id: Option<&str>,
        topic: &str,
        payload: Value,
    ) -> Result<(), RegisterError> {
        let session_id = parse_optional_session_id(session_id)?;
        if let Some(id) = session_id {
            self.peers().touch(id, Utc::now());
        }
        self.emit(HubEvent::AgentRequest(events::AgentRequest {
            session_id: session_id.map(str::to_string),
            topic: topic.to_string(),
            payload,
        }));
        Ok(())
    }

    /// Publish a report posted by a peer.
    ///
    /// # Errors
    ///
    /// Missing or malformed session ids are refused.
    pub fn report(&self, session_id: Option<&str>, payload: Value) -> Result<(), RegisterError> {
        let session_id = parse_session_id(session_id)?;
        self.peers().touch(session_id, Utc::now());
        self.emit(HubEvent::AgentReport(events::AgentReport {
            session_id: session_id.to_string(),
            payload,
        }));
        Ok(())
    }

    /// Called by a live channel on every exit path.
    pub(crate) fn connection_closed(&self, conn_id: u64) {
        let unbound = self.peers().unbind_conn(conn_id);
        self.inner.live_connections.fetch_sub(1, Ordering::SeqCst);
        for session_id in unbound {
            log::info!("[Live] Channel closed for {} (conn {})", session_id, conn_id);
            self.emit(HubEvent::AgentDisconnected(events::AgentDisconnected {
                session_id,
                reason: DisconnectReason::ChannelClosed,
            }));
        }
    }

    /// Allocate an id for a new live channel.
    pub(crate) fn connection_opened(&self) -> u64 {
        self.inner.live_connections.fetch_add(1, Ordering::SeqCst);
        self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a live channel on a tracked task.
    pub(crate) fn spawn_live<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self
            .inner
            .live_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Reap finished channels so the set only holds open ones.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Abort every live channel task that is still running.
    pub(crate) fn abort_live_tasks(&self) -> usize {
        let mut tasks = self
            .inner
            .live_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let remaining = tasks.len();
        tasks.abort_all();
        tasks.detach_all();
        remaining
    }

    /// Send a close frame on every live channel and drop all bindings.
    pub fn close_all_channels(&self, code: u16) -> usize {
        let bindings = self.peers().take_bindings();
        let count = bindings.len();
        for (_, binding) in bindings {
            let _ = binding.tx.send(Outbound::Close(code));
        }
        count
    }

    // =========================================================================
    // Tasks & questions
    // =========================================================================

    /// Claim a task through the task tool and tell the other live peers.
    ///
    /// # Errors
    ///
    /// `Unavailable` when no task tool is configured or it cannot start,
    /// `Failed` when it ran and failed or outlived the task tool timeout.
    pub async fn claim_task(&self, session_id: &str, task_id: &str) -> Result<Value, CollabError> {
        let tasks = self
            .inner
            .collab
            .tasks
            .clone()
            .ok_or_else(|| CollabError::Unavailable("Task tool unavailable".to_string()))?;

        let claim = within(
            self.inner.config.task_tool_timeout(),
            "Task tool",
            async { tasks.claim(task_id, session_id).await.map_err(CollabError::from) },
        );
        let result = claim.await.inspect_err(|e| {
            log::warn!("[Hub] Claim of {} by {} failed: {}", task_id, session_id, e);
        })?;

        let notified = {
            let mut peers = self.peers();
            peers.set_task(session_id, Some(task_id.to_string()));
            peers.touch(session_id, Utc::now());
            peers.broadcast(&messages::task_claimed(task_id, session_id), Some(session_id))
        };

        log::info!("[Hub] {} claimed {} ({} peers notified)", session_id, task_id, notified);
        self.emit(HubEvent::TaskClaimed(events::TaskClaimed {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            notified,
        }));
        Ok(result)
    }

    /// Record a task completion and clear the peer's current task.
    ///
    /// # Errors
    ///
    /// Missing or malformed session ids are refused.
    pub fn complete_task(
        &self,
        session_id: Option<&str>,
        task_id: &str,
        result: Option<Value>,
        source: CompletionSource,
    ) -> Result<(), RegisterError> {
        let session_id = parse_session_id(session_id)?;
        let previous = {
            let mut peers = self.peers();
            peers.touch(session_id, Utc::now());
            peers.clear_task(session_id)
        };
        if let Some(current) = previous.filter(|current| current != task_id) {
            log::debug!("[Hub] {} completed {} while on {}", session_id, task_id, current);
        }
        log::info!("[Hub] {} completed {} (via {:?})", session_id, task_id, source);
        self.emit(HubEvent::TaskCompleted(events::TaskCompleted {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            result,
            source,
        }));
        Ok(())
    }

    /// Tasks the task tool reports as ready.
    ///
    /// # Errors
    ///
    /// Same classification as [`Hub::claim_task`].
    pub async fn ready_tasks(&self) -> Result<Vec<Value>, CollabError> {
        let tasks = self
            .inner
            .collab
            .tasks
            .clone()
            .ok_or_else(|| CollabError::Unavailable("Task tool unavailable".to_string()))?;
        within(self.inner.config.task_tool_timeout(), "Task tool", async {
            tasks.ready_tasks().await.map_err(CollabError::from)
        })
        .await
    }

    /// Forward a question to the Brain. Never creates a session.
    ///
    /// # Errors
    ///
    /// `Unavailable` without a Brain, `Failed` with the Brain's message or
    /// when it does not answer within the configured timeout.
    pub async fn ask(
        &self,
        session_id: Option<&str>,
        question: &str,
        context: &Value,
    ) -> Result<BrainReply, CollabError> {
        let brain = self
            .inner
            .collab
            .brain
            .clone()
            .ok_or_else(|| CollabError::Unavailable("Brain unavailable".to_string()))?;

        if let Some(id) = session_id {
            self.peers().touch(id, Utc::now());
        }

        let outcome = within(self.inner.config.brain_timeout(), "Brain", async {
            brain.ask(session_id, question, context).await.map_err(|e| {
                log::error!("[Hub] Brain failed for {}: {:#}", session_id.unwrap_or("anonymous"), e);
                CollabError::Failed(e.to_string())
            })
        })
        .await;
        self.emit(HubEvent::QuestionAsked(events::QuestionAsked {
            session_id: session_id.map(str::to_string),
            question: question.to_string(),
            answered: outcome.is_ok(),
        }));
        outcome
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Push to a peer, or queue it. True if it went out live.
    pub fn send_to_agent(&self, session_id: &str, message: Value) -> bool {
        self.peers().send(session_id, message, Utc::now())
    }

    /// Push to every live peer except `exclude`. Returns the count reached.
    pub fn broadcast(&self, message: &Value, exclude: Option<&str>) -> usize {
        self.peers().broadcast(message, exclude)
    }

    /// Return and clear a peer's pending queue.
    ///
    /// # Errors
    ///
    /// Malformed session ids are refused.
    pub fn pull_messages(&self, session_id: &str) -> Result<Vec<PendingMessage>, RegisterError> {
        let session_id = parse_session_id(Some(session_id))?;
        Ok(self.peers().take_pending(session_id))
    }

    // =========================================================================
    // Status & liveness
    // =========================================================================

    /// Status document served at `GET /api/status`.
    pub fn status(&self) -> Value {
        let (count, agents) = {
            let peers = self.peers();
            (peers.len(), peers.snapshot(Utc::now(), self.stale_threshold()))
        };
        json!({
            "listening": self.is_listening(),
            "port": self.port(),
            "connectedAgents": count,
            "wsConnections": self.live_connections(),
            "agents": agents,
        })
    }

    /// Run one liveness sweep now.
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Utc::now())
    }

    /// Run one liveness sweep as if the time were `now`.
    ///
    /// Evicts silent peers, closes their channels with 1001 and prunes the
    /// admission limiter. Returns the evicted session ids.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let evictions = self.peers().sweep(now, self.stale_threshold());
        let pruned = self.inner.limiter.cleanup();
        if pruned > 0 {
            log::debug!("[Sweep] Pruned {} limiter entries", pruned);
        }

        evictions
            .into_iter()
            .map(|eviction| {
                log::warn!(
                    "[Sweep] Evicting {} (silent {}s)",
                    eviction.session_id,
                    eviction.silent_for.num_seconds()
                );
                if let Some(binding) = eviction.binding {
                    let _ = binding.tx.send(Outbound::Close(close_code::GOING_AWAY));
                }
                self.emit(HubEvent::AgentDisconnected(events::AgentDisconnected {
                    session_id: eviction.session_id.clone(),
                    reason: DisconnectReason::Evicted,
                }));
                eviction.session_id
            })
            .collect()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Publish an event and mirror it to the bus when audited.
    fn emit(&self, event: HubEvent) {
        if event.is_audited() {
            if let Some(ref bus) = self.inner.collab.bus {
                if let Err(e) = bus.send(event.to_bus_message()) {
                    log::warn!("[Bus] Failed to mirror {}: {:#}", event.name(), e);
                }
            }
        }
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Whether a bus entry was already acted on in this process.
    pub(crate) fn is_handled(&self, bus_id: &str) -> bool {
        self.inner
            .handled_bus_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(bus_id)
    }

    pub(crate) fn mark_handled(&self, bus_id: &str) {
        self.inner
            .handled_bus_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bus_id.to_string());
    }

    pub(crate) fn reconcile_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.inner.reconcile_gate
    }
}

/// Bound a collaborator call. An elapsed timer is a `Failed` outcome.
async fn within<T, F>(limit: Duration, what: &str, call: F) -> Result<T, CollabError>
where
    F: Future<Output = Result<T, CollabError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => {
            log::warn!("[Hub] {} timed out after {}s", what, limit.as_secs());
            Err(CollabError::Failed(format!(
                "{what} timed out after {}s",
                limit.as_secs()
            )))
        }
    }
}
