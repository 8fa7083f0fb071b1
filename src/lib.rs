//! PM Hub - coordination hub for a fleet of coding-agent workers.
//!
//! Worker processes register with the hub, heartbeat, ask questions, claim
//! and complete tasks, and receive pushed messages. The hub serves them over
//! a hand-rolled WebSocket live channel and a plain HTTP façade on the same
//! port, and falls back to a durable bus when it was down.
//!
//! # Architecture
//!
//! - **Hub** - owns the peer table, limiter and collaborators; every state
//!   change goes through it
//! - **Socket** - TCP listener, WebSocket framing and per-connection tasks
//! - **HTTP** - request reader and JSON routes
//! - **Collaborators** - Brain, session validator, durable bus, task graph
//!
//! # Modules
//!
//! - [`hub`] - orchestrator, registry, delivery, limiter, reconciliation
//! - [`socket`] - frame codec, handshake, live channel, upgrade handoff
//! - [`http`] - request façade
//! - [`collab`] - collaborator traits and shipped implementations
//! - [`config`] - configuration loading

pub mod collab;
pub mod commands;
pub mod hub;
pub mod http;
pub mod socket;

pub mod config;
pub mod constants;

// Re-export commonly used types
pub use collab::{Brain, BrainReply, Collaborators, DurableBus, SessionValidator, TaskGraph};
pub use config::HubConfig;
pub use hub::{Hub, HubEvent, RunningHub};
