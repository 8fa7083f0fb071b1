//! HTTP request façade.
//!
//! Served by axum on the same listener as the live channel. [`router`]
//! builds the whole service: the JSON routes in [`routes`], the WebSocket
//! upgrade at `/`, and the per-IP admission check in [`admission`] that
//! every non-upgrade request passes through.
//!
//! Every route speaks JSON. A body that does not parse as a JSON object is
//! treated as `{}`.

pub mod admission;
pub mod routes;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};

use crate::constants::MAX_BODY_BYTES;
use crate::hub::Hub;
use crate::socket::server::live_upgrade;

pub use routes::RouteError;

/// Full service for the hub's listener.
pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/", get(live_upgrade))
        .route("/api/status", get(routes::status))
        .route("/api/register", post(routes::register))
        .route("/api/heartbeat", post(routes::heartbeat))
        .route("/api/ask", post(routes::ask))
        .route("/api/report", post(routes::report))
        .route("/api/tasks/ready", get(routes::ready))
        .route("/api/tasks/claim", post(routes::claim))
        .route("/api/tasks/complete", post(routes::complete))
        .route("/api/messages/{session_id}", get(routes::messages))
        .route("/api/send", post(routes::send))
        .fallback(routes::not_found)
        .method_not_allowed_fallback(routes::method_not_allowed)
        .layer(middleware::from_fn_with_state(hub.clone(), admission::admit))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(hub)
}
