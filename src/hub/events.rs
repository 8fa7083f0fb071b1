//! Typed lifecycle events.
//!
//! Every state change the hub makes is published as a [`HubEvent`] on a
//! broadcast channel (see [`crate::hub::Hub::subscribe`]). A subset is also
//! mirrored to the durable bus under `pm_hub.<name>`.

use serde::Serialize;
use serde_json::Value;

use crate::collab::BusMessage;
use crate::constants::{AUDIT_EVENT_PREFIX, HUB_BUS_IDENTITY};

/// Bus recipient for mirrored events. Never read back by reconciliation.
pub const AUDIT_RECIPIENT: &str = "audit";

/// How a peer's live channel went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Removed by the liveness sweep.
    Evicted,
    /// The socket closed or errored.
    ChannelClosed,
}

/// Where a task completion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// Live channel `task_complete` frame.
    Live,
    /// `POST /api/tasks/complete`.
    Http,
    /// Replayed from the durable bus.
    Bus,
}

/// A peer registered (or re-registered).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AgentRegistered {
    pub session_id: String,
    pub role: Option<String>,
    pub live: bool,
}

/// A liveness signal arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AgentHeartbeat {
    pub session_id: String,
    pub task_id: Option<String>,
    pub created: bool,
}

/// A peer's live channel went away.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AgentDisconnected {
    pub session_id: String,
    pub reason: DisconnectReason,
}

/// A peer claimed a task through the task tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TaskClaimed {
    pub session_id: String,
    pub task_id: String,
    pub notified: usize,
}

/// A peer reported a task finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TaskCompleted {
    pub session_id: String,
    pub task_id: String,
    pub result: Option<Value>,
    pub source: CompletionSource,
}

/// A question was forwarded to the Brain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct QuestionAsked {
    pub session_id: Option<String>,
    pub question: String,
    pub answered: bool,
}

/// A peer recorded progress on a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Checkpoint {
    pub session_id: String,
    pub task_id: String,
    pub step: Option<Value>,
    pub state: Value,
}

/// A peer sent a free-form request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AgentRequest {
    pub session_id: Option<String>,
    pub topic: String,
    pub payload: Value,
}

/// A peer posted a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AgentReport {
    pub session_id: String,
    pub payload: Value,
}

/// Lifecycle event published by the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum HubEvent {
    AgentRegistered(AgentRegistered),
    AgentHeartbeat(AgentHeartbeat),
    AgentDisconnected(AgentDisconnected),
    TaskClaimed(TaskClaimed),
    TaskCompleted(TaskCompleted),
    QuestionAsked(QuestionAsked),
    Checkpoint(Checkpoint),
    AgentRequest(AgentRequest),
    AgentReport(AgentReport),
}

impl HubEvent {
    /// Snake-case event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentRegistered(_) => "agent_registered",
            Self::AgentHeartbeat(_) => "agent_heartbeat",
            Self::AgentDisconnected(e) => match e.reason {
                DisconnectReason::Evicted => "agent_evicted",
                DisconnectReason::ChannelClosed => "agent_disconnected",
            },
            Self::TaskClaimed(_) => "task_claimed",
            Self::TaskCompleted(_) => "task_completed",
            Self::QuestionAsked(_) => "question_asked",
            Self::Checkpoint(_) => "checkpoint",
            Self::AgentRequest(_) => "agent_request",
            Self::AgentReport(_) => "agent_report",
        }
    }

    /// Whether the event is mirrored to the durable bus.
    pub fn is_audited(&self) -> bool {
        matches!(
            self,
            Self::AgentRegistered(_)
                | Self::AgentDisconnected(_)
                | Self::TaskClaimed(_)
                | Self::TaskCompleted(_)
                | Self::QuestionAsked(_)
        )
    }

    /// Bus entry for this event.
    pub fn to_bus_message(&self) -> BusMessage {
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        BusMessage::new(
            HUB_BUS_IDENTITY,
            AUDIT_RECIPIENT,
            format!("{AUDIT_EVENT_PREFIX}.{}", self.name()),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audited_subset() {
        let registered = HubEvent::AgentRegistered(AgentRegistered {
            session_id: "a".into(),
            role: None,
            live: false,
        });
        let heartbeat = HubEvent::AgentHeartbeat(AgentHeartbeat {
            session_id: "a".into(),
            task_id: None,
            created: false,
        });
        assert!(registered.is_audited());
        assert!(!heartbeat.is_audited());
    }

    #[test]
    fn test_bus_message_shape() {
        let event = HubEvent::AgentDisconnected(AgentDisconnected {
            session_id: "agent-1".into(),
            reason: DisconnectReason::Evicted,
        });
        let msg = event.to_bus_message();
        assert_eq!(msg.from, "pm");
        assert_eq!(msg.to, AUDIT_RECIPIENT);
        assert_eq!(msg.kind, "pm_hub.agent_evicted");
        assert_eq!(msg.payload["sessionId"], "agent-1");
        assert_eq!(msg.payload["reason"], "evicted");
    }
}
