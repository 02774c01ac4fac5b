//! Task domain events and the queues they travel on.
//!
//! Field names serialize in PascalCase (`TaskName`, `CreatedAt`, ...) so the
//! payloads interoperate with the other services on the bus.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Queue names.
pub mod queues {
    pub const TASK_CREATED: &str = "task-created";
    pub const TASK_UPDATED: &str = "task-updated";
    pub const TASK_ASSIGNED: &str = "task-assigned";
}

/// An event type bound to its queue.
pub trait TaskEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue this event is published to.
    const QUEUE: &'static str;

    /// One-line summary for logs.
    fn summary(&self) -> String;
}

/// Raised when a task is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskCreatedEvent {
    pub id: i32,
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: i32,
}

/// Raised when a task changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskUpdatedEvent {
    pub id: i32,
    #[serde(default)]
    pub task_name: String,
    /// New status of the task.
    #[serde(default)]
    pub status: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: String,
}

/// Raised when a task is assigned to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskAssignedEvent {
    pub id: i32,
    #[serde(default)]
    pub task_name: String,
    pub assignee_id: i32,
    #[serde(default)]
    pub assignee_name: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_by: String,
}

impl TaskEvent for TaskCreatedEvent {
    const QUEUE: &'static str = queues::TASK_CREATED;

    fn summary(&self) -> String {
        format!(
            "task {} '{}' created at {} (priority {})",
            self.id, self.task_name, self.created_at, self.priority
        )
    }
}

impl TaskEvent for TaskUpdatedEvent {
    const QUEUE: &'static str = queues::TASK_UPDATED;

    fn summary(&self) -> String {
        format!(
            "task {} '{}' set to {} by {} at {}",
            self.id, self.task_name, self.status, self.updated_by, self.updated_at
        )
    }
}

impl TaskEvent for TaskAssignedEvent {
    const QUEUE: &'static str = queues::TASK_ASSIGNED;

    fn summary(&self) -> String {
        format!(
            "task {} '{}' assigned to {} ({}) by {} at {}",
            self.id,
            self.task_name,
            self.assignee_name,
            self.assignee_id,
            self.assigned_by,
            self.assigned_at
        )
    }
}
