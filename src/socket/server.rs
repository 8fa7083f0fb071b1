//! TCP listener and the WebSocket upgrade handoff.
//!
//! Binds the configured address (moving to the next port when one is taken)
//! and serves [`crate::http::router`] on it. WebSocket upgrades at `/` are
//! completed here and continue on [`super::live_conn`].

use std::io::ErrorKind;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::{handshake, live_conn};
use crate::http::{self, RouteError};
use crate::hub::Hub;

/// Bind `host:port`, trying the next port on `AddrInUse`.
///
/// Port `0` asks the OS for a free port and is tried once.
///
/// # Errors
///
/// Fails on any bind error other than `AddrInUse`, or when every port in
/// the allowed range is taken.
pub async fn bind_with_retry(host: &str, port: u16, max_attempts: u16) -> Result<TcpListener> {
    let attempts = if port == 0 { 1 } else { max_attempts.max(1) };

    for offset in 0..attempts {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if offset > 0 {
                    log::info!("[Hub] Port {} in use, bound {} instead", port, candidate);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                log::debug!("[Hub] Port {} in use", candidate);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to bind {host}:{candidate}"));
            }
        }
    }

    bail!(
        "No free port on {host} in {}..{} ({} attempts)",
        port,
        port.saturating_add(attempts),
        attempts
    )
}

/// Serve the hub on `listener` until `stop` fires, then drain in-flight
/// requests.
pub(crate) async fn serve(listener: TcpListener, hub: Hub, stop: oneshot::Receiver<()>) {
    let app = http::router(hub).into_make_service_with_connect_info::<SocketAddr>();
    let shutdown = async move {
        // A dropped sender stops the server too.
        let _ = stop.await;
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        log::error!("[Hub] Server stopped: {e}");
    }
}

/// `GET /` with WebSocket upgrade headers: answer `101` and hand the raw
/// stream to a live channel once hyper releases it.
pub(crate) async fn live_upgrade(
    State(hub): State<Hub>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    let Some(key) = handshake::upgrade_key(req.headers()).map(str::to_string) else {
        return RouteError::NotFound.into_response();
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let live_hub = hub.clone();
    hub.spawn_live(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                log::debug!("[Live] Upgraded connection from {}", peer);
                live_conn::serve(TokioIo::new(upgraded), live_hub).await;
            }
            Err(e) => log::debug!("[Live] Upgrade from {} failed: {e}", peer),
        }
    });

    handshake::switching_protocols(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_zero_binds_once() {
        let listener = bind_with_retry("127.0.0.1", 0, 20).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_taken_port_moves_to_next() {
        let first = bind_with_retry("127.0.0.1", 0, 1).await.unwrap();
        let taken = first.local_addr().unwrap().port();

        // The next port may itself be taken on a busy machine; allow a few.
        let second = bind_with_retry("127.0.0.1", taken, 5).await.unwrap();
        assert!(second.local_addr().unwrap().port() > taken);
    }

    #[tokio::test]
    async fn test_bounded_attempts_fail_explicitly() {
        let first = bind_with_retry("127.0.0.1", 0, 1).await.unwrap();
        let taken = first.local_addr().unwrap().port();
        let err = bind_with_retry("127.0.0.1", taken, 1).await.unwrap_err();
        assert!(err.to_string().contains("No free port"));
    }
}
