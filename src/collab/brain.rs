//! Brain collaborator contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the Brain returns for a question.
///
/// `guidance` is always present; anything else the Brain adds is carried
/// through untouched in `extra` and surfaced to the asker verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrainReply {
    /// Free-form guidance for the asking peer.
    pub guidance: String,
    /// Structured decision, when the Brain made one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Value>,
    /// Any additional fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BrainReply {
    /// Reply with guidance only.
    pub fn guidance(text: impl Into<String>) -> Self {
        Self {
            guidance: text.into(),
            ..Self::default()
        }
    }

    /// Flatten into a JSON object so it can be merged into a response.
    pub fn into_fields(self) -> Map<String, Value> {
        let mut fields = self.extra;
        fields.insert("guidance".to_string(), Value::String(self.guidance));
        if let Some(decision) = self.decision {
            fields.insert("decision".to_string(), decision);
        }
        fields
    }
}

/// Answers free-form questions from peers. May be slow.
#[async_trait]
pub trait Brain: Send + Sync {
    /// Ask a question on behalf of `session_id` (absent for anonymous callers).
    ///
    /// # Errors
    ///
    /// Any error is surfaced to the asker as a failure with its message.
    async fn ask(
        &self,
        session_id: Option<&str>,
        question: &str,
        context: &Value,
    ) -> anyhow::Result<BrainReply>;
}
