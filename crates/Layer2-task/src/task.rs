//! Task definition and types

use crate::event::{RunOutcome, TaskEvent, TaskEventKind};
use crate::state::{ContainerStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Full identifier, suitable for container names and labels
    pub fn as_full(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A submitted prompt and everything known about its execution
///
/// Plain record: the external persistence layer stores it as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,

    pub prompt: String,

    /// Admission bucket
    pub environment_id: String,

    pub status: TaskStatus,

    pub exit_code: Option<i64>,

    /// Container of the latest attempt
    pub container_id: Option<String>,

    /// Error of the final outcome, if any
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Agent id of the latest attempt, once one has been reported
    #[serde(default)]
    pub agent_id: Option<String>,

    /// Agent CLI of the base configuration
    pub agent_cli: String,

    pub agent_cli_args: Vec<String>,

    // VCS pass-through fields
    pub repo_root: Option<PathBuf>,
    pub base_branch: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
}

impl Task {
    /// Create a new task
    pub fn new(prompt: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::new(),
            prompt: prompt.into(),
            environment_id: environment_id.into(),
            status: TaskStatus::Queued,
            exit_code: None,
            container_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            agent_id: None,
            agent_cli: String::new(),
            agent_cli_args: Vec::new(),
            repo_root: None,
            base_branch: None,
            branch: None,
            pr_url: None,
        }
    }

    pub fn with_agent(mut self, cli: impl Into<String>, args: Vec<String>) -> Self {
        self.agent_cli = cli.into();
        self.agent_cli_args = args;
        self
    }

    /// Mark task as admitted and pulling
    pub fn start(&mut self) {
        self.status = TaskStatus::Pulling;
        self.started_at.get_or_insert_with(Utc::now);
    }

    /// Fold one event into the record
    ///
    /// Events for other tasks and events after a terminal state are ignored.
    pub fn apply(&mut self, event: &TaskEvent) {
        if event.task_id != self.task_id || self.status.is_terminal() {
            return;
        }

        match &event.kind {
            TaskEventKind::State(state) => {
                if let Some(id) = &state.container_id {
                    self.container_id = Some(id.clone());
                }
                match state.status {
                    ContainerStatus::Queued | ContainerStatus::Pulling => {
                        self.status = TaskStatus::Pulling;
                        self.started_at.get_or_insert(event.at);
                    }
                    ContainerStatus::Running => self.status = TaskStatus::Running,
                    ContainerStatus::Exited => {
                        if state.exit_code.is_some() {
                            self.exit_code = state.exit_code;
                        }
                    }
                }
            }
            TaskEventKind::Prepared(checkout) => {
                self.repo_root = Some(checkout.repo_root.clone());
                self.base_branch = Some(checkout.base_branch.clone());
                self.branch = Some(checkout.branch.clone());
            }
            TaskEventKind::Retry { agent_id, .. } => self.agent_id = Some(agent_id.clone()),
            TaskEventKind::AgentSwitch { to, .. } => self.agent_id = Some(to.clone()),
            TaskEventKind::Done(outcome) => {
                match outcome {
                    RunOutcome::Succeeded { agent_id, .. } | RunOutcome::Failed { agent_id, .. } => {
                        self.agent_id = Some(agent_id.clone());
                    }
                    RunOutcome::Cancelled => {}
                }
                self.exit_code = Some(outcome.exit_code());
                self.error = outcome.error().map(str::to_string);
                self.status = if outcome.is_success() {
                    TaskStatus::Done
                } else {
                    TaskStatus::Failed
                };
                self.finished_at = Some(event.at);
            }
            TaskEventKind::Log(_) => {}
        }
    }

    /// Check if task is still active (queued or executing)
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Get execution duration if task has started
    pub fn duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).to_std().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ContainerState;
    use crate::vcs::VcsCheckout;

    fn event(task: &Task, kind: TaskEventKind) -> TaskEvent {
        TaskEvent {
            task_id: task.task_id,
            at: Utc::now(),
            kind,
        }
    }

    #[test]
    fn test_new_task_is_queued() {
        let task = Task::new("fix it", "default");
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.is_active());
        assert!(task.duration().is_none());
    }

    #[test]
    fn test_apply_lifecycle() {
        let mut task = Task::new("fix it", "default");

        task.apply(&event(&task, TaskEventKind::State(ContainerState::new(ContainerStatus::Pulling))));
        assert_eq!(task.status, TaskStatus::Pulling);
        assert!(task.started_at.is_some());

        let running = ContainerState::new(ContainerStatus::Running).with_container("c1");
        task.apply(&event(&task, TaskEventKind::State(running)));
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.container_id.as_deref(), Some("c1"));

        let done = RunOutcome::Succeeded {
            agent_id: "default".into(),
            pr: None,
        };
        task.apply(&event(&task, TaskEventKind::Done(done)));
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.exit_code, Some(0));
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_apply_tracks_latest_agent() {
        let mut task = Task::new("fix it", "default").with_agent("codex", vec![]);
        assert!(task.agent_id.is_none());

        let retry = TaskEventKind::Retry {
            attempt: 1,
            agent_id: "codex".into(),
            delay: Duration::from_secs(2),
        };
        task.apply(&event(&task, retry));
        assert_eq!(task.agent_id.as_deref(), Some("codex"));

        let switch = TaskEventKind::AgentSwitch {
            from: "codex".into(),
            to: "claude".into(),
        };
        task.apply(&event(&task, switch));
        assert_eq!(task.agent_id.as_deref(), Some("claude"));
        assert_eq!(task.agent_cli, "codex");

        let done = RunOutcome::Succeeded {
            agent_id: "claude".into(),
            pr: None,
        };
        task.apply(&event(&task, TaskEventKind::Done(done)));
        assert_eq!(task.agent_id.as_deref(), Some("claude"));
    }

    #[test]
    fn test_terminal_task_ignores_late_events() {
        let mut task = Task::new("p", "e");
        task.apply(&event(&task, TaskEventKind::Done(RunOutcome::Cancelled)));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("cancelled"));

        task.apply(&event(&task, TaskEventKind::State(ContainerState::new(ContainerStatus::Running))));
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn test_apply_prepared_copies_vcs_fields() {
        let mut task = Task::new("p", "e");
        let checkout = VcsCheckout {
            repo_root: PathBuf::from("/work/repo"),
            base_branch: "main".into(),
            branch: "caravel/abc".into(),
        };
        task.apply(&event(&task, TaskEventKind::Prepared(checkout)));

        assert_eq!(task.base_branch.as_deref(), Some("main"));
        assert_eq!(task.branch.as_deref(), Some("caravel/abc"));
    }

    #[test]
    fn test_foreign_events_ignored() {
        let mut task = Task::new("p", "e");
        let other = Task::new("q", "e");
        task.apply(&event(&other, TaskEventKind::Done(RunOutcome::Cancelled)));
        assert_eq!(task.status, TaskStatus::Queued);
    }
}
