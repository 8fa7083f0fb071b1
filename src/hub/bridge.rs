//! Durable-bus reconciliation.
//!
//! While the hub is down, peers fall back to writing `ask` and
//! `task_complete` entries on the bus addressed to the hub identity. Once the
//! hub is listening it reads whatever is still unacknowledged, answers the
//! questions, replays the completions through the normal registry path, and
//! acknowledges the consumed range.
//!
//! Entries are remembered per process once acted on, so a failed
//! acknowledge never causes a second answer on the next pass.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{CompletionSource, Hub};
use crate::collab::{BusFilter, BusMessage};
use crate::constants::HUB_BUS_IDENTITY;

/// Bus entry kind for a question.
pub const ASK_KIND: &str = "ask";
/// Bus entry kind for a completion.
pub const TASK_COMPLETE_KIND: &str = "task_complete";
/// Bus entry kind for the hub's reply to a question.
pub const ANSWER_KIND: &str = "answer";

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Questions answered on the bus.
    pub answered: usize,
    /// Completions replayed into the registry.
    pub replayed: usize,
    /// Entries already handled or missing required fields.
    pub skipped: usize,
    /// Whether the consumed range was acknowledged.
    pub acknowledged: bool,
}

/// Run one reconciliation pass. No-op without a bus.
///
/// # Errors
///
/// Returns an error only if the bus cannot be read. Per-entry failures are
/// logged and leave the range unacknowledged.
pub async fn reconcile(hub: &Hub) -> Result<ReconcileReport> {
    let Some(bus) = hub.collaborators().bus.clone() else {
        return Ok(ReconcileReport::default());
    };
    let _gate = hub.reconcile_gate().lock().await;

    let batch = bus.read_unacknowledged(
        HUB_BUS_IDENTITY,
        &BusFilter::kinds([ASK_KIND, TASK_COMPLETE_KIND]),
    )?;
    let mut report = ReconcileReport::default();
    let mut delivery_failed = false;

    for entry in &batch.messages {
        if hub.is_handled(&entry.id) {
            report.skipped += 1;
            continue;
        }

        match entry.kind.as_str() {
            ASK_KIND => {
                let Some(question) = str_field(&entry.payload, "question") else {
                    log::warn!("[Bus] Ask {} from {} has no question", entry.id, entry.from);
                    hub.mark_handled(&entry.id);
                    report.skipped += 1;
                    continue;
                };
                let context = entry.payload.get("context").cloned().unwrap_or(Value::Null);

                let mut fields = match hub.ask(Some(entry.from.as_str()), question, &context).await {
                    Ok(reply) => reply.into_fields(),
                    Err(e) => {
                        let mut fields = Map::new();
                        fields.insert("error".to_string(), Value::String(e.to_string()));
                        fields
                    }
                };
                fields.insert("inReplyTo".to_string(), Value::String(entry.id.clone()));
                fields.insert(
                    "requestId".to_string(),
                    entry.payload.get("requestId").cloned().unwrap_or(Value::Null),
                );

                let reply = BusMessage::new(
                    HUB_BUS_IDENTITY,
                    entry.from.clone(),
                    ANSWER_KIND,
                    Value::Object(fields),
                );
                match bus.send(reply) {
                    Ok(()) => {
                        hub.mark_handled(&entry.id);
                        report.answered += 1;
                    }
                    Err(e) => {
                        log::warn!("[Bus] Failed to answer {} for {}: {:#}", entry.id, entry.from, e);
                        delivery_failed = true;
                    }
                }
            }
            TASK_COMPLETE_KIND => {
                let Some(task_id) = str_field(&entry.payload, "taskId") else {
                    log::warn!("[Bus] Completion {} from {} has no taskId", entry.id, entry.from);
                    hub.mark_handled(&entry.id);
                    report.skipped += 1;
                    continue;
                };
                let session_id = str_field(&entry.payload, "sessionId").unwrap_or(&entry.from);
                let completed = hub.complete_task(
                    Some(session_id),
                    task_id,
                    entry.payload.get("result").cloned(),
                    CompletionSource::Bus,
                );
                hub.mark_handled(&entry.id);
                match completed {
                    Ok(()) => report.replayed += 1,
                    Err(e) => {
                        log::warn!("[Bus] Completion {} from {} refused: {}", entry.id, entry.from, e);
                        report.skipped += 1;
                    }
                }
            }
            _ => report.skipped += 1,
        }
    }

    if delivery_failed {
        log::warn!(
            "[Bus] Leaving range unacknowledged; undelivered answers are retried on the next start"
        );
    } else {
        let ids: Vec<String> = batch.messages.iter().map(|m| m.id.clone()).collect();
        match bus.acknowledge(HUB_BUS_IDENTITY, &batch.cursor, &ids) {
            Ok(()) => report.acknowledged = true,
            Err(e) => log::warn!("[Bus] Acknowledge failed: {:#}", e),
        }
    }

    log::info!(
        "[Bus] Reconciled: {} answered, {} replayed, {} skipped, acknowledged={}",
        report.answered,
        report.replayed,
        report.skipped,
        report.acknowledged
    );
    Ok(report)
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
