//! Live-channel message schema.
//!
//! Inbound text frames decode once into [`Inbound`]; unknown `type` values
//! land in [`Inbound::Unknown`] and are ignored. Outbound messages are plain
//! JSON objects built by the functions below.

use serde::Deserialize;
use serde_json::{json, Map, Value};

/// A message received from a peer over the live channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Register this connection as a session.
    Register(RegisterMsg),
    /// Liveness signal.
    Heartbeat(HeartbeatMsg),
    /// Task finished.
    TaskComplete(TaskCompleteMsg),
    /// Question for the Brain.
    AskPm(AskMsg),
    /// Progress checkpoint.
    Checkpoint(CheckpointMsg),
    /// Free-form request.
    Request(RequestMsg),
    /// Any other `type`.
    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error for non-JSON text, a missing `type`, or a
    /// known type with missing required fields.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// `register`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct RegisterMsg {
    pub session_id: Option<String>,
    pub role: Option<String>,
    pub task_id: Option<String>,
    pub pressure: Option<Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `heartbeat`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct HeartbeatMsg {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub pressure: Option<Value>,
}

/// `task_complete`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TaskCompleteMsg {
    pub session_id: Option<String>,
    pub task_id: String,
    pub result: Option<Value>,
}

/// `ask_pm`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AskMsg {
    pub session_id: Option<String>,
    pub question: String,
    pub request_id: Option<Value>,
    #[serde(default)]
    pub context: Value,
}

/// `checkpoint`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct CheckpointMsg {
    pub session_id: Option<String>,
    pub task_id: String,
    pub step: Option<Value>,
    #[serde(default)]
    pub state: Value,
}

/// `request`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct RequestMsg {
    pub session_id: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

/// First frame after a live registration.
pub fn welcome(pm_port: u16, connected_agents: usize) -> Value {
    json!({
        "type": "welcome",
        "pmPort": pm_port,
        "connectedAgents": connected_agents,
    })
}

/// Error reply.
pub fn error(message: impl Into<String>) -> Value {
    json!({ "type": "error", "message": message.into() })
}

/// Reply to `ask_pm`, carrying either the Brain's fields or an `error`.
pub fn answer(request_id: Option<Value>, fields: Map<String, Value>) -> Value {
    let mut out = Map::new();
    out.insert("type".into(), "answer".into());
    out.insert("requestId".into(), request_id.unwrap_or(Value::Null));
    for (k, v) in fields {
        if k != "type" && k != "requestId" {
            out.insert(k, v);
        }
    }
    Value::Object(out)
}

/// Pushed to other live peers when a task is claimed.
pub fn task_claimed(task_id: &str, claimed_by: &str) -> Value {
    json!({
        "type": "task_claimed",
        "taskId": task_id,
        "claimedBy": claimed_by,
    })
}
