//! WebSocket opening handshake (server side).
//!
//! hyper parses the upgrade request; this module recognises it and builds
//! the `101` reply. Frames after the handshake belong to [`super::framing`].

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Client key of a WebSocket upgrade request, if `headers` ask for one.
pub fn upgrade_key(headers: &HeaderMap) -> Option<&str> {
    let upgrade = headers.get(header::UPGRADE)?.to_str().ok()?;
    if !upgrade
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
    {
        return None;
    }
    headers
        .get(header::SEC_WEBSOCKET_KEY)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// `101 Switching Protocols` response completing the handshake.
pub fn switching_protocols(client_key: &str) -> Response {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(client_key))
        .body(Body::empty())
        .unwrap_or_else(|e| {
            log::warn!("[Live] Failed to build handshake response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_known_vector() {
        // RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_switching_protocols_headers() {
        let response = switching_protocols("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        let headers = response.headers();
        assert_eq!(headers[header::UPGRADE], "websocket");
        assert_eq!(headers[header::CONNECTION], "Upgrade");
        assert_eq!(headers[header::SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_upgrade_key_requires_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(header::SEC_WEBSOCKET_KEY, "abc==".parse().unwrap());
        assert_eq!(upgrade_key(&headers), None);

        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        assert_eq!(upgrade_key(&headers), None);

        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert_eq!(upgrade_key(&headers), Some("abc=="));

        headers.insert(header::SEC_WEBSOCKET_KEY, " ".parse().unwrap());
        assert_eq!(upgrade_key(&headers), None);
    }
}
