//! Task events
//!
//! Every event of a run is emitted from that run's own tokio task, so a
//! single receiver observes them in strict chronological order per task.

use crate::state::ContainerState;
use crate::task::TaskId;
use crate::vcs::{PrMetadata, VcsCheckout};
use caravel_foundation::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Exit code reported for cancelled runs (SIGINT convention)
pub const CANCELLED_EXIT_CODE: i64 = 130;

/// Final outcome of a supervised run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Some agent exited 0
    Succeeded {
        agent_id: String,
        pr: Option<PrMetadata>,
    },

    /// Chain exhausted or aborted
    Failed {
        agent_id: String,
        exit_code: i64,
        error: String,
        class: ErrorClass,
    },

    /// `request_stop()` was honoured
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i64 {
        match self {
            RunOutcome::Succeeded { .. } => 0,
            RunOutcome::Failed { exit_code, .. } => *exit_code,
            RunOutcome::Cancelled => CANCELLED_EXIT_CODE,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded { .. } => None,
            RunOutcome::Failed { error, .. } => Some(error),
            RunOutcome::Cancelled => Some("cancelled"),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled)
    }
}

/// Event payloads relayed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskEventKind {
    /// Raw container state snapshot from the active worker
    State(ContainerState),

    /// One streamed log line
    Log(String),

    /// A transient failure will be retried on the same agent after `delay`
    Retry {
        attempt: u32,
        agent_id: String,
        delay: Duration,
    },

    /// Falling back to the next agent in the chain
    AgentSwitch { from: String, to: String },

    /// Repository preparation finished
    Prepared(VcsCheckout),

    /// Run finished; always the last event of a run
    Done(RunOutcome),
}

/// A task-scoped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub at: DateTime<Utc>,
    pub kind: TaskEventKind,
}

/// Sending half bound to one task
#[derive(Debug, Clone)]
pub struct EventSink {
    task_id: TaskId,
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl EventSink {
    pub fn new(task_id: TaskId, tx: mpsc::UnboundedSender<TaskEvent>) -> Self {
        Self { task_id, tx }
    }

    /// Sink whose events go nowhere
    pub fn detached(task_id: TaskId) -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { task_id, tx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Emit an event; a dropped receiver is not an error for the run
    pub fn emit(&self, kind: TaskEventKind) {
        let _ = self.tx.send(TaskEvent {
            task_id: self.task_id,
            at: Utc::now(),
            kind,
        });
    }

    pub fn state(&self, state: ContainerState) {
        self.emit(TaskEventKind::State(state));
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(TaskEventKind::Log(line.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        let ok = RunOutcome::Succeeded {
            agent_id: "a".into(),
            pr: None,
        };
        assert_eq!(ok.exit_code(), 0);
        assert!(ok.error().is_none());

        assert_eq!(RunOutcome::Cancelled.exit_code(), CANCELLED_EXIT_CODE);
        assert_eq!(RunOutcome::Cancelled.error(), Some("cancelled"));
    }

    #[test]
    fn test_sink_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(TaskId::new(), tx);

        sink.log("one");
        sink.log("two");
        sink.emit(TaskEventKind::Done(RunOutcome::Cancelled));

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::Log("one".into()),
                TaskEventKind::Log("two".into()),
                TaskEventKind::Done(RunOutcome::Cancelled),
            ]
        );
    }

    #[test]
    fn test_detached_sink_does_not_panic() {
        EventSink::detached(TaskId::new()).log("ignored");
    }
}
