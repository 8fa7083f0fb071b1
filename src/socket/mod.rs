//! Network surface of the hub.
//!
//! One TCP listener carries both transports: discrete HTTP requests served
//! by axum, and WebSocket upgrades that hyper hands back as raw streams to
//! become long-lived live channels.
//!
//! # Architecture
//!
//! ```text
//! Peer process                              Hub process
//! ┌──────────────┐   HTTP/1.1 request   ┌──────────────────────┐
//! │ curl / SDK   │─────────────────────►│ axum http::router    │
//! └──────────────┘   JSON response      │   ├─ http::routes    │
//!                                       │   └─ live_upgrade ┐  │
//! ┌──────────────┐   WS text frames     │   live_conn ◄─────┘  │
//! │ worker agent │◄────────────────────►│   reader + writer    │
//! └──────────────┘                      └──────────┬───────────┘
//!                                                  ▼
//!                                                 Hub
//! ```
//!
//! # Wire Protocol
//!
//! RFC 6455 framing, text frames carrying JSON objects with a `type` field.
//! See [`framing`] for the codec and [`crate::hub::messages`] for the schema.

pub mod framing;
pub mod handshake;
pub mod live_conn;
pub mod server;
