//! Per-IP admission for façade requests.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::hub::{Admission, Hub};
use crate::socket::handshake;

/// Check the caller's IP against the limiter before running the route.
///
/// Live channel upgrades pass straight through.
pub async fn admit(
    State(hub): State<Hub>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if handshake::upgrade_key(req.headers()).is_some() {
        return next.run(req).await;
    }

    match hub.limiter().check(&peer.ip().to_string()) {
        Admission::Allowed => next.run(req).await,
        Admission::Limited { retry_after } => {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            log::debug!("[Http] Rate limited {} for {}s", peer.ip(), secs);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(json!({ "error": "Too many requests", "retryAfter": secs })),
            )
                .into_response()
        }
    }
}
