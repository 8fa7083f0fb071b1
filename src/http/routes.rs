//! Request façade routes.
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /api/status` | [`Hub::status`] |
//! | `POST /api/register` | [`Hub::register`] |
//! | `POST /api/heartbeat` | [`Hub::heartbeat`] |
//! | `POST /api/ask` | [`Hub::ask`] |
//! | `POST /api/report` | [`Hub::report`] |
//! | `GET /api/tasks/ready` | [`Hub::ready_tasks`] |
//! | `POST /api/tasks/claim` | [`Hub::claim_task`] |
//! | `POST /api/tasks/complete` | [`Hub::complete_task`] |
//! | `GET /api/messages/{sessionId}` | [`Hub::pull_messages`] |
//! | `POST /api/send` | [`Hub::send_to_agent`] |

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use crate::hub::{
    parse_optional_session_id, parse_session_id, CollabError, CompletionSource, HeartbeatAttrs,
    Hub, RegisterAttrs, RegisterError,
};

/// Route failure, mapped to an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// 400
    #[error("{0}")]
    BadRequest(String),
    /// 403
    #[error("{0}")]
    Forbidden(String),
    /// 404
    #[error("Not found")]
    NotFound,
    /// 405
    #[error("Method not allowed")]
    MethodNotAllowed,
    /// 500
    #[error("{0}")]
    Internal(String),
    /// 503
    #[error("{0}")]
    Unavailable(String),
}

impl RouteError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn missing(field: &str) -> Self {
        Self::BadRequest(format!("{field} is required"))
    }
}

impl From<RegisterError> for RouteError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::Missing => Self::BadRequest(err.to_string()),
            RegisterError::Malformed | RegisterError::UnknownSession(_) => {
                Self::Forbidden(err.to_string())
            }
        }
    }
}

impl From<CollabError> for RouteError {
    fn from(err: CollabError) -> Self {
        match err {
            CollabError::Unavailable(msg) => Self::Unavailable(msg),
            CollabError::Failed(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        log::debug!("[Http] Request failed with {}: {}", self.status(), self);
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type Reply = Result<Json<Value>, RouteError>;

/// Request body as a JSON object; anything else reads as `{}`.
fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn str_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn required<'a>(body: &'a Value, key: &str) -> Result<&'a str, RouteError> {
    str_field(body, key).ok_or_else(|| RouteError::missing(key))
}

// ============================================================================
// Handlers
// ============================================================================

pub(crate) async fn status(State(hub): State<Hub>) -> Json<Value> {
    Json(hub.status())
}

pub(crate) async fn register(State(hub): State<Hub>, body: Bytes) -> Reply {
    let body = json_body(&body);
    let attrs = RegisterAttrs {
        role: str_field(&body, "role").map(str::to_string),
        task_id: str_field(&body, "taskId").map(str::to_string),
        pressure: body.get("pressure").filter(|v| !v.is_null()).cloned(),
        capabilities: body
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };
    let connected = hub.register(str_field(&body, "sessionId"), attrs, None)?;
    Ok(Json(json!({
        "success": true,
        "pmPort": hub.port(),
        "connectedAgents": connected,
    })))
}

pub(crate) async fn heartbeat(State(hub): State<Hub>, body: Bytes) -> Reply {
    let body = json_body(&body);
    let attrs = HeartbeatAttrs {
        task_id: str_field(&body, "taskId").map(str::to_string),
        pressure: body.get("pressure").filter(|v| !v.is_null()).cloned(),
    };
    hub.heartbeat(str_field(&body, "sessionId"), attrs)?;
    Ok(Json(json!({ "success": true })))
}

pub(crate) async fn ask(State(hub): State<Hub>, body: Bytes) -> Reply {
    let body = json_body(&body);
    let session_id = parse_optional_session_id(str_field(&body, "sessionId"))?;
    let question = required(&body, "question")?;
    let context = body.get("context").cloned().unwrap_or(Value::Null);
    let reply = hub.ask(session_id, question, &context).await?;

    let mut out = Map::new();
    out.insert("success".to_string(), Value::Bool(true));
    out.extend(reply.into_fields());
    Ok(Json(Value::Object(out)))
}

pub(crate) async fn report(State(hub): State<Hub>, body: Bytes) -> Reply {
    let mut payload = match json_body(&body) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let session_id = payload.remove("sessionId");
    hub.report(
        session_id.as_ref().and_then(Value::as_str),
        Value::Object(payload),
    )?;
    Ok(Json(json!({ "success": true })))
}

pub(crate) async fn ready(State(hub): State<Hub>) -> Json<Value> {
    match hub.ready_tasks().await {
        Ok(tasks) => Json(json!({ "tasks": tasks })),
        Err(e) => {
            log::warn!("[Http] Ready tasks unavailable: {}", e);
            Json(json!({ "tasks": [], "error": e.to_string() }))
        }
    }
}

pub(crate) async fn claim(State(hub): State<Hub>, body: Bytes) -> Reply {
    let body = json_body(&body);
    let session_id = parse_session_id(str_field(&body, "sessionId"))?;
    let task_id = required(&body, "taskId")?;
    let result = hub.claim_task(session_id, task_id).await?;
    Ok(Json(json!({
        "success": true,
        "taskId": task_id,
        "result": result,
    })))
}

pub(crate) async fn complete(State(hub): State<Hub>, body: Bytes) -> Reply {
    let body = json_body(&body);
    let session_id = parse_session_id(str_field(&body, "sessionId"))?;
    let task_id = required(&body, "taskId")?;
    hub.complete_task(
        Some(session_id),
        task_id,
        body.get("result").cloned(),
        CompletionSource::Http,
    )?;
    Ok(Json(json!({ "success": true })))
}

pub(crate) async fn messages(State(hub): State<Hub>, Path(session_id): Path<String>) -> Reply {
    let messages = hub.pull_messages(&session_id)?;
    Ok(Json(json!({ "messages": messages })))
}

pub(crate) async fn send(State(hub): State<Hub>, body: Bytes) -> Reply {
    let body = json_body(&body);
    let session_id = parse_session_id(str_field(&body, "sessionId"))?;
    let message = body
        .get("message")
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| RouteError::missing("message"))?;
    let delivered = hub.send_to_agent(session_id, message);
    Ok(Json(json!({ "success": true, "delivered": delivered })))
}

pub(crate) async fn not_found() -> RouteError {
    RouteError::NotFound
}

pub(crate) async fn method_not_allowed() -> RouteError {
    RouteError::MethodNotAllowed
}
