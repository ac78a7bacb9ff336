//! Task status and container state snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for admission
    Queued,

    /// Image is being resolved or pulled
    Pulling,

    /// Agent container is running
    Running,

    /// Finished with exit code 0
    Done,

    /// Chain exhausted, aborted or cancelled
    Failed,
}

impl TaskStatus {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Check if the task holds an admission slot
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pulling | TaskStatus::Running)
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Pulling => "Pulling",
            TaskStatus::Running => "Running",
            TaskStatus::Done => "Done",
            TaskStatus::Failed => "Failed",
        }
    }

    /// Get a symbol for the state (for terminal output)
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "◎",
            TaskStatus::Pulling => "⇣",
            TaskStatus::Running => "⟳",
            TaskStatus::Done => "✓",
            TaskStatus::Failed => "✗",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Phase of a single container attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Queued,
    Pulling,
    Running,
    Exited,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Queued => "queued",
            ContainerStatus::Pulling => "pulling",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
        }
    }
}

/// Raw container state snapshot relayed from a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub container_id: Option<String>,
    pub image: Option<String>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl ContainerState {
    pub fn new(status: ContainerStatus) -> Self {
        Self {
            status,
            container_id: None,
            image: None,
            exit_code: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn with_container(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
