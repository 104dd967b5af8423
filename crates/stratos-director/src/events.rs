//! Audit events for VM lifecycle actions.

use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DirectorError, DirectorResult};

/// Identifier of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user and task on whose behalf work is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Acting user.
    pub user: String,
    /// Task identifier.
    pub task_id: String,
}

impl TaskContext {
    /// Create a task context.
    #[must_use]
    pub fn new(user: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            task_id: task_id.into(),
        }
    }
}

/// An event to be recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Start event this one completes.
    pub parent_id: Option<EventId>,
    /// Acting user.
    pub user: String,
    /// Task identifier.
    pub task: String,
    /// Action name (`create`, `delete`, ...).
    pub action: String,
    /// Kind of object acted on (`vm`).
    pub object_type: String,
    /// Object name, e.g. the VM cid once known.
    pub object_name: Option<String>,
    /// Deployment name.
    pub deployment: String,
    /// Instance name, `job/uuid`.
    pub instance: String,
    /// Error category when the action failed.
    pub error: Option<String>,
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event id.
    pub id: EventId,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Event contents.
    #[serde(flatten)]
    pub event: NewEvent,
}

/// Sink for audit events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event and return its id.
    async fn record(&self, event: NewEvent) -> DirectorResult<EventId>;
}

/// In-memory event log.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded event, oldest first.
    pub fn events(&self) -> DirectorResult<Vec<Event>> {
        self.events
            .read()
            .map(|events| events.clone())
            .map_err(|_| DirectorError::internal("lock poisoned"))
    }
}

#[async_trait]
impl EventRecorder for MemoryEventLog {
    async fn record(&self, event: NewEvent) -> DirectorResult<EventId> {
        let mut events = self
            .events
            .write()
            .map_err(|_| DirectorError::internal("lock poisoned"))?;

        let next = u64::try_from(events.len())
            .map_err(|_| DirectorError::internal("event log overflow"))?
            + 1;
        let id = EventId::new(next);

        events.push(Event {
            id,
            timestamp: Utc::now(),
            event,
        });

        Ok(id)
    }
}
