//! Peer table: registered sessions, live bindings and pending queues.
//!
//! Everything a peer owns lives in one [`PeerTable`] guarded by a single
//! mutex on the hub. Methods here never block and never await; the hub
//! takes the lock, calls one method (or a short sequence for register +
//! flush) and releases it.
//!
//! # Delivery model
//!
//! A peer with a [`LiveBinding`] gets messages pushed as text frames
//! through the binding's writer channel. Without a binding (or when the
//! writer is gone) messages go to a bounded FIFO and wait to be pulled over
//! HTTP or flushed on the next live registration.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::collab::is_valid_session_id;
use crate::socket::framing;

/// Bytes or a close request for a live channel's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-encoded frame to write as-is.
    Frame(Vec<u8>),
    /// Write a close frame with this code, then stop.
    Close(u16),
}

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// No session id supplied.
    #[error("sessionId is required")]
    Missing,
    /// Session id is not a `[A-Za-z0-9_-]+` token.
    #[error("invalid sessionId format")]
    Malformed,
    /// No session record exists for the id.
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Check a peer-supplied session id. Empty counts as missing.
///
/// # Errors
///
/// `Missing` when absent or empty, `Malformed` when not a plain token.
pub fn parse_session_id(session_id: Option<&str>) -> Result<&str, RegisterError> {
    let session_id = session_id
        .filter(|id| !id.is_empty())
        .ok_or(RegisterError::Missing)?;
    if !is_valid_session_id(session_id) {
        return Err(RegisterError::Malformed);
    }
    Ok(session_id)
}

/// Like [`parse_session_id`], but an absent or empty id is allowed.
///
/// # Errors
///
/// Returns [`RegisterError::Malformed`] for an id that is present but bad.
pub fn parse_optional_session_id(session_id: Option<&str>) -> Result<Option<&str>, RegisterError> {
    match session_id.filter(|id| !id.is_empty()) {
        Some(id) => parse_session_id(Some(id)).map(Some),
        None => Ok(None),
    }
}

/// One registered worker peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSession {
    /// Caller-supplied session id.
    pub session_id: String,
    /// Role reported at registration.
    pub role: Option<String>,
    /// Time of the most recent registration.
    pub registered_at: DateTime<Utc>,
    /// Time of the most recent liveness signal.
    pub last_heartbeat: DateTime<Utc>,
    /// Task currently being worked on.
    pub task_id: Option<String>,
    /// Opaque load report.
    pub pressure: Option<Value>,
    /// Capability tags.
    pub capabilities: Vec<String>,
}

impl PeerSession {
    fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: None,
            registered_at: now,
            last_heartbeat: now,
            task_id: None,
            pressure: None,
            capabilities: Vec::new(),
        }
    }

    /// Time since the last liveness signal.
    pub fn silent_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.last_heartbeat)
    }
}

/// Attributes supplied on register.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterAttrs {
    /// Peer role.
    pub role: Option<String>,
    /// Task in progress.
    pub task_id: Option<String>,
    /// Load report.
    pub pressure: Option<Value>,
    /// Capability tags.
    pub capabilities: Vec<String>,
}

/// Attributes supplied on heartbeat. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatAttrs {
    /// Task in progress.
    pub task_id: Option<String>,
    /// Load report.
    pub pressure: Option<Value>,
}

/// Writer side of a live channel, tagged with its connection id.
#[derive(Debug, Clone)]
pub struct LiveBinding {
    /// Connection that owns the binding.
    pub conn_id: u64,
    /// Writer task input.
    pub tx: UnboundedSender<Outbound>,
}

impl LiveBinding {
    /// Queue a text frame. False if the writer is gone.
    fn push_text(&self, text: &str) -> bool {
        self.tx
            .send(Outbound::Frame(framing::encode_text(text)))
            .is_ok()
    }
}

/// A message waiting for a peer without a live channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    /// The payload as it would have been pushed.
    pub message: Value,
    /// When it was queued.
    pub queued_at: DateTime<Utc>,
}

/// A peer removed by the liveness sweep.
#[derive(Debug)]
pub struct Eviction {
    /// Session that was removed.
    pub session_id: String,
    /// Silence at the time of the sweep.
    pub silent_for: TimeDelta,
    /// Binding that was dropped, if the peer still had one.
    pub binding: Option<LiveBinding>,
}

/// Sessions, bindings and pending queues.
#[derive(Debug)]
pub struct PeerTable {
    sessions: HashMap<String, PeerSession>,
    bindings: HashMap<String, LiveBinding>,
    pending: HashMap<String, VecDeque<PendingMessage>>,
    max_pending: usize,
}

impl PeerTable {
    /// Empty table with the given per-peer queue cap (at least 1).
    pub fn new(max_pending: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            bindings: HashMap::new(),
            pending: HashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create or overwrite a session. Identity and queue are preserved.
    pub fn register(&mut self, session_id: &str, attrs: RegisterAttrs, now: DateTime<Utc>) {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| PeerSession::new(session_id, now));
        session.role = attrs.role;
        session.task_id = attrs.task_id;
        session.pressure = attrs.pressure;
        session.capabilities = attrs.capabilities;
        session.registered_at = now;
        session.last_heartbeat = now;
    }

    /// Record a liveness signal. Creates the session when missing.
    ///
    /// Returns true if the session was created.
    pub fn heartbeat(&mut self, session_id: &str, attrs: HeartbeatAttrs, now: DateTime<Utc>) -> bool {
        let mut created = false;
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                created = true;
                PeerSession::new(session_id, now)
            });
        session.last_heartbeat = now;
        if let Some(task_id) = attrs.task_id {
            session.task_id = Some(task_id);
        }
        if let Some(pressure) = attrs.pressure {
            session.pressure = Some(pressure);
        }
        created
    }

    /// Set or clear a session's current task. No-op for unknown sessions.
    pub fn set_task(&mut self, session_id: &str, task_id: Option<String>) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.task_id = task_id;
        }
    }

    /// Clear the current task. Returns the task that was set, if any.
    pub fn clear_task(&mut self, session_id: &str) -> Option<String> {
        self.sessions
            .get_mut(session_id)
            .and_then(|session| session.task_id.take())
    }

    /// Refresh liveness without touching attributes. No-op for unknown sessions.
    pub fn touch(&mut self, session_id: &str, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_heartbeat = now;
        }
    }

    /// Look up a session.
    pub fn get(&self, session_id: &str) -> Option<&PeerSession> {
        self.sessions.get(session_id)
    }

    /// Whether a session exists.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    /// Attach a live channel, replacing any previous one.
    pub fn bind(&mut self, session_id: &str, binding: LiveBinding) -> Option<LiveBinding> {
        self.bindings.insert(session_id.to_string(), binding)
    }

    /// Drop the binding for `session_id` only if it belongs to `conn_id`.
    pub fn unbind(&mut self, session_id: &str, conn_id: u64) -> bool {
        if self
            .bindings
            .get(session_id)
            .is_some_and(|b| b.conn_id == conn_id)
        {
            self.bindings.remove(session_id);
            return true;
        }
        false
    }

    /// Drop every binding owned by `conn_id`. Returns the affected session ids.
    pub fn unbind_conn(&mut self, conn_id: u64) -> Vec<String> {
        let ids: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.bindings.remove(id);
        }
        ids
    }

    /// Whether `session_id` has a live channel.
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.bindings.contains_key(session_id)
    }

    /// Number of live-bound sessions.
    pub fn connected_count(&self) -> usize {
        self.bindings.len()
    }

    /// Remove and return every binding.
    pub fn take_bindings(&mut self) -> Vec<(String, LiveBinding)> {
        self.bindings.drain().collect()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Push over the live channel, or queue when there is none.
    ///
    /// Returns true if the message went to a live writer. A binding whose
    /// writer has gone away is dropped and the message queued.
    pub fn send(&mut self, session_id: &str, message: Value, now: DateTime<Utc>) -> bool {
        if self.push_live(session_id, &message) {
            return true;
        }
        self.enqueue(session_id, message, now);
        false
    }

    /// Push over the live channel only. A dead binding is dropped.
    pub fn push_live(&mut self, session_id: &str, message: &Value) -> bool {
        let Some(binding) = self.bindings.get(session_id) else {
            return false;
        };
        if binding.push_text(&message.to_string()) {
            return true;
        }
        log::debug!("[Hub] Writer for {} is gone, dropping binding", session_id);
        self.bindings.remove(session_id);
        false
    }

    /// Append to the pending queue, dropping the oldest entry at the cap.
    pub fn enqueue(&mut self, session_id: &str, message: Value, now: DateTime<Utc>) {
        let queue = self.pending.entry(session_id.to_string()).or_default();
        while queue.len() >= self.max_pending {
            queue.pop_front();
        }
        queue.push_back(PendingMessage {
            message,
            queued_at: now,
        });
    }

    /// Drain the pending queue over the live channel in FIFO order.
    ///
    /// Stops at the first failed write; the undelivered remainder stays
    /// queued. Returns the number delivered.
    pub fn flush(&mut self, session_id: &str) -> usize {
        let Some(mut queue) = self.pending.remove(session_id) else {
            return 0;
        };
        let mut delivered = 0;
        while let Some(entry) = queue.front() {
            if !self.push_live(session_id, &entry.message) {
                break;
            }
            queue.pop_front();
            delivered += 1;
        }
        if !queue.is_empty() {
            self.pending.insert(session_id.to_string(), queue);
        }
        delivered
    }

    /// Push to every live-bound session except `exclude`. Never queues.
    pub fn broadcast(&mut self, message: &Value, exclude: Option<&str>) -> usize {
        let text = message.to_string();
        let mut dead = Vec::new();
        let mut sent = 0;
        for (id, binding) in &self.bindings {
            if exclude == Some(id.as_str()) {
                continue;
            }
            if binding.push_text(&text) {
                sent += 1;
            } else {
                dead.push(id.clone());
            }
        }
        for id in dead {
            self.bindings.remove(&id);
        }
        sent
    }

    /// Remove and return the whole pending queue.
    pub fn take_pending(&mut self, session_id: &str) -> Vec<PendingMessage> {
        self.pending
            .remove(session_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Number of queued messages for `session_id`.
    pub fn pending_len(&self, session_id: &str) -> usize {
        self.pending.get(session_id).map_or(0, VecDeque::len)
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Remove sessions silent for more than twice `threshold`.
    ///
    /// Evicted sessions lose their binding and their pending queue. Queues
    /// for ids that never registered are dropped once their newest entry is
    /// older than the same limit.
    pub fn sweep(&mut self, now: DateTime<Utc>, threshold: TimeDelta) -> Vec<Eviction> {
        let limit = threshold.checked_mul(2).unwrap_or(TimeDelta::MAX);
        let orphaned = self.prune_orphan_queues(now, limit);
        if orphaned > 0 {
            log::debug!("[Sweep] Dropped {} queue(s) for ids that never registered", orphaned);
        }

        let expired: Vec<(String, TimeDelta)> = self
            .sessions
            .values()
            .map(|s| (s.session_id.clone(), s.silent_for(now)))
            .filter(|(_, silent)| *silent > limit)
            .collect();

        expired
            .into_iter()
            .map(|(session_id, silent_for)| {
                self.sessions.remove(&session_id);
                self.pending.remove(&session_id);
                let binding = self.bindings.remove(&session_id);
                Eviction {
                    session_id,
                    silent_for,
                    binding,
                }
            })
            .collect()
    }

    /// Drop queues with no session whose newest entry is older than `limit`.
    ///
    /// Returns the number of queues dropped.
    pub fn prune_orphan_queues(&mut self, now: DateTime<Utc>, limit: TimeDelta) -> usize {
        let sessions = &self.sessions;
        let before = self.pending.len();
        self.pending.retain(|id, queue| {
            sessions.contains_key(id)
                || queue
                    .back()
                    .is_some_and(|newest| now.signed_duration_since(newest.queued_at) <= limit)
        });
        before - self.pending.len()
    }

    /// Number of ids with a non-empty pending queue, registered or not.
    pub fn queued_ids(&self) -> usize {
        self.pending.values().filter(|q| !q.is_empty()).count()
    }

    /// Status view of every session, keyed by id.
    pub fn snapshot(&self, now: DateTime<Utc>, threshold: TimeDelta) -> Map<String, Value> {
        self.sessions
            .values()
            .map(|s| {
                let entry = serde_json::json!({
                    "role": s.role,
                    "taskId": s.task_id,
                    "stale": s.silent_for(now) > threshold,
                    "connected": self.bindings.contains_key(&s.session_id),
                    "pressure": s.pressure,
                    "capabilities": s.capabilities,
                    "lastHeartbeat": s.last_heartbeat,
                    "registeredAt": s.registered_at,
                    "pending": self.pending_len(&s.session_id),
                });
                (s.session_id.clone(), entry)
            })
            .collect()
    }
}
