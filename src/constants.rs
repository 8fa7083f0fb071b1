//! Application-wide constants for pm-hub.
//!
//! Centralizes the defaults the hub is constructed with. Every value here
//! can be overridden through [`crate::config::HubConfig`]; these are only
//! the starting points.
//!
//! # Categories
//!
//! - **Network**: bind address and port fallback
//! - **Liveness**: staleness threshold and sweep cadence
//! - **Admission**: rate-limiter windows and caps
//! - **Delivery**: pending-queue bounds
//! - **Protocol**: frame and request size limits
//! - **Collaborators**: task tool and call timeouts

use std::time::Duration;

// ============================================================================
// Network
// ============================================================================

/// Loopback only. The hub has no transport security.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port the hub tries first.
pub const DEFAULT_PORT: u16 = 3847;

/// How many consecutive ports are tried before startup fails.
pub const DEFAULT_MAX_PORT_ATTEMPTS: u16 = 20;

/// Identity the hub uses on the durable bus, both as sender of mirrored
/// events and as the recipient peers address when the socket is down.
pub const HUB_BUS_IDENTITY: &str = "pm";

/// Namespace prefix for mirrored audit event names.
pub const AUDIT_EVENT_PREFIX: &str = "pm_hub";

// ============================================================================
// Liveness
// ============================================================================

/// Heartbeat silence after which a peer is reported stale.
///
/// Eviction happens at twice this value.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(60);

/// Interval between liveness sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Admission
// ============================================================================

/// Short admission window.
pub const DEFAULT_SHORT_WINDOW: Duration = Duration::from_secs(60);

/// Requests allowed per short window, per caller address.
pub const DEFAULT_SHORT_WINDOW_CAP: u32 = 120;

/// Long admission window.
pub const DEFAULT_LONG_WINDOW: Duration = Duration::from_secs(3600);

/// Requests allowed per long window, per caller address.
pub const DEFAULT_LONG_WINDOW_CAP: u32 = 3000;

// ============================================================================
// Delivery
// ============================================================================

/// Hard cap on queued messages per peer. Overflow drops the oldest entry.
pub const DEFAULT_MAX_PENDING: usize = 100;

// ============================================================================
// Protocol limits
// ============================================================================

/// Largest WebSocket payload accepted from a peer (16 MB).
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Largest HTTP request body accepted (1 MB).
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Read buffer size for live channel sockets.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Collaborators
// ============================================================================

/// Default binary for the external task-graph tool.
pub const DEFAULT_TASK_TOOL: &str = "bd";

/// Longest the hub waits for the Brain to answer one question.
pub const DEFAULT_BRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest the hub waits for one task-tool invocation.
pub const DEFAULT_TASK_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
