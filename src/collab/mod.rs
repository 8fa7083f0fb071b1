//! External collaborators the hub depends on.
//!
//! Each collaborator is a narrow trait injected at construction. Any of them
//! may be absent; call sites check for presence and fall back to an explicit
//! "unavailable" answer instead of failing the hub.
//!
//! - [`brain`] - answers free-form questions from peers
//! - [`session`] - validates session identifiers against local records
//! - [`bus`] - durable append-only message bus (audit + offline fallback)
//! - [`tasks`] - external task-graph tool (ready / claim)

pub mod brain;
pub mod bus;
pub mod session;
pub mod tasks;

use std::sync::Arc;

pub use brain::{Brain, BrainReply};
pub use bus::{BusCursor, BusFilter, BusMessage, DurableBus, JsonlBus, MemoryBus, UnackedBatch};
pub use session::{is_valid_session_id, SessionDir, SessionValidator};
pub use tasks::{CommandTaskGraph, TaskGraph, TaskGraphError};

/// The set of collaborators handed to a hub.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Question answering.
    pub brain: Option<Arc<dyn Brain>>,
    /// Session record lookup.
    pub sessions: Option<Arc<dyn SessionValidator>>,
    /// Durable bus.
    pub bus: Option<Arc<dyn DurableBus>>,
    /// Task-graph tool.
    pub tasks: Option<Arc<dyn TaskGraph>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("brain", &self.brain.is_some())
            .field("sessions", &self.sessions.is_some())
            .field("bus", &self.bus.is_some())
            .field("tasks", &self.tasks.is_some())
            .finish()
    }
}

impl Collaborators {
    /// No collaborators at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Set the Brain.
    pub fn with_brain(mut self, brain: Arc<dyn Brain>) -> Self {
        self.brain = Some(brain);
        self
    }

    /// Set the session validator.
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionValidator>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Set the durable bus.
    pub fn with_bus(mut self, bus: Arc<dyn DurableBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the task-graph tool.
    pub fn with_tasks(mut self, tasks: Arc<dyn TaskGraph>) -> Self {
        self.tasks = Some(tasks);
        self
    }
}
