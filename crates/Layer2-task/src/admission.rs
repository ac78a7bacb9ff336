//! Admission control - per-environment concurrency caps
//!
//! Submitted tasks start immediately while their environment is under its
//! cap and wait in a single FIFO queue otherwise. A finished task frees its
//! slot and the queue is scanned oldest-first, starting every task whose
//! environment now has room. All bookkeeping happens under one lock; tasks
//! are handed to the [`TaskLauncher`] after the lock is released.

use crate::agent::AgentSelection;
use crate::config::DockerRunnerConfig;
use crate::task::{Task, TaskId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// A task waiting for, or holding, an admission slot
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task: Task,
    pub config: DockerRunnerConfig,
    pub selection: Option<AgentSelection>,
}

impl TaskRequest {
    pub fn new(task: Task, config: DockerRunnerConfig) -> Self {
        Self {
            task,
            config,
            selection: None,
        }
    }

    pub fn with_selection(mut self, selection: AgentSelection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task.task_id
    }

    pub fn environment_id(&self) -> &str {
        &self.task.environment_id
    }
}

/// Starts admitted tasks
pub trait TaskLauncher: Send + Sync {
    /// Start `request` without blocking
    ///
    /// The slot is held until `ticket` is finished or dropped.
    fn launch(&self, request: TaskRequest, ticket: AdmissionTicket);
}

/// Result of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// Zero-based position in the queue
    Queued { position: usize },
}

/// Proof that a task holds a slot in its environment
///
/// Finishing or dropping the ticket releases the slot exactly once.
#[derive(Debug)]
pub struct AdmissionTicket {
    controller: Arc<AdmissionController>,
    task_id: TaskId,
    environment_id: String,
    released: bool,
}

impl AdmissionTicket {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    /// Release the slot
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release(self.task_id, &self.environment_id);
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
struct AdmissionState {
    limits: HashMap<String, i64>,
    default_limit: i64,
    running: HashMap<String, usize>,
    queue: VecDeque<TaskRequest>,
}

impl AdmissionState {
    fn limit(&self, environment_id: &str) -> i64 {
        self.limits
            .get(environment_id)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn running(&self, environment_id: &str) -> usize {
        self.running.get(environment_id).copied().unwrap_or(0)
    }

    /// Negative caps are unlimited; zero admits nothing
    fn can_start(&self, environment_id: &str) -> bool {
        let limit = self.limit(environment_id);
        limit < 0 || (self.running(environment_id) as i64) < limit
    }

    fn occupy(&mut self, environment_id: &str) {
        *self.running.entry(environment_id.to_string()).or_default() += 1;
    }

    /// Dequeue every task that may start now, oldest first
    fn promote(&mut self) -> Vec<TaskRequest> {
        let mut started = Vec::new();
        let mut index = 0;
        while index < self.queue.len() {
            let env = self.queue[index].environment_id().to_string();
            if self.can_start(&env) {
                if let Some(request) = self.queue.remove(index) {
                    self.occupy(&env);
                    started.push(request);
                }
            } else {
                index += 1;
            }
        }
        started
    }
}

/// Gate between task submission and execution
pub struct AdmissionController {
    state: Mutex<AdmissionState>,
    launcher: Arc<dyn TaskLauncher>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionController")
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl AdmissionController {
    /// Controller where every environment is unlimited unless capped later
    pub fn new(launcher: Arc<dyn TaskLauncher>) -> Arc<Self> {
        Self::with_limits(launcher, HashMap::new())
    }

    /// Controller with per-environment caps; unknown environments are unlimited
    pub fn with_limits(launcher: Arc<dyn TaskLauncher>, limits: HashMap<String, i64>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AdmissionState {
                limits,
                default_limit: -1,
                running: HashMap::new(),
                queue: VecDeque::new(),
            }),
            launcher,
        })
    }

    /// Whether a task in `environment_id` may start now
    pub fn can_start(&self, environment_id: &str) -> bool {
        self.state.lock().can_start(environment_id)
    }

    /// Start `request` or queue it behind older tasks
    pub fn on_task_submitted(self: &Arc<Self>, mut request: TaskRequest) -> Admission {
        let env = request.environment_id().to_string();

        let mut state = self.state.lock();
        let waiting_ahead = state.queue.iter().any(|queued| queued.environment_id() == env);
        if waiting_ahead || !state.can_start(&env) {
            request.task.status = crate::state::TaskStatus::Queued;
            let position = state.queue.len();
            info!(task_id = %request.task_id(), environment = %env, position, "Task queued");
            state.queue.push_back(request);
            return Admission::Queued { position };
        }
        state.occupy(&env);
        drop(state);

        self.launch(request);
        Admission::Started
    }

    /// Release the slot held by `ticket`
    pub fn on_task_finished(self: &Arc<Self>, ticket: AdmissionTicket) {
        ticket.finish();
    }

    /// Change the cap of one environment, starting queued tasks it now allows
    pub fn set_limit(self: &Arc<Self>, environment_id: impl Into<String>, limit: i64) {
        let started = {
            let mut state = self.state.lock();
            state.limits.insert(environment_id.into(), limit);
            state.promote()
        };
        self.launch_all(started);
    }

    /// Remove a queued task; running tasks are not affected
    pub fn cancel_queued(&self, task_id: TaskId) -> Option<TaskRequest> {
        let mut state = self.state.lock();
        let index = state.queue.iter().position(|r| r.task_id() == task_id)?;
        state.queue.remove(index)
    }

    /// Ids of queued tasks, oldest first
    pub fn queued(&self) -> Vec<TaskId> {
        self.state.lock().queue.iter().map(TaskRequest::task_id).collect()
    }

    pub fn running_count(&self, environment_id: &str) -> usize {
        self.state.lock().running(environment_id)
    }

    pub fn total_running(&self) -> usize {
        self.state.lock().running.values().sum()
    }

    fn release(self: &Arc<Self>, task_id: TaskId, environment_id: &str) {
        let started = {
            let mut state = self.state.lock();
            if let Some(count) = state.running.get_mut(environment_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.running.remove(environment_id);
                }
            }
            state.promote()
        };
        debug!(task_id = %task_id, environment = %environment_id, promoted = started.len(), "Slot released");
        self.launch_all(started);
    }

    fn launch_all(self: &Arc<Self>, requests: Vec<TaskRequest>) {
        for request in requests {
            self.launch(request);
        }
    }

    fn launch(self: &Arc<Self>, mut request: TaskRequest) {
        request.task.start();
        let ticket = AdmissionTicket {
            controller: Arc::clone(self),
            task_id: request.task_id(),
            environment_id: request.environment_id().to_string(),
            released: false,
        };
        info!(task_id = %ticket.task_id, environment = %ticket.environment_id, "Task admitted");
        self.launcher.launch(request, ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskStatus;

    /// Keeps tickets so tests decide when tasks finish
    #[derive(Default)]
    struct HoldingLauncher {
        running: Mutex<Vec<(TaskRequest, AdmissionTicket)>>,
    }

    impl TaskLauncher for HoldingLauncher {
        fn launch(&self, request: TaskRequest, ticket: AdmissionTicket) {
            self.running.lock().push((request, ticket));
        }
    }

    impl HoldingLauncher {
        fn started(&self) -> Vec<TaskId> {
            self.running.lock().iter().map(|(r, _)| r.task_id()).collect()
        }

        fn finish(&self, task_id: TaskId) {
            let entry = {
                let mut running = self.running.lock();
                let index = running.iter().position(|(r, _)| r.task_id() == task_id).unwrap();
                running.remove(index)
            };
            entry.1.finish();
        }
    }

    /// Finishes every task synchronously inside `launch`
    struct InstantLauncher {
        launched: Mutex<Vec<TaskId>>,
    }

    impl TaskLauncher for InstantLauncher {
        fn launch(&self, request: TaskRequest, ticket: AdmissionTicket) {
            self.launched.lock().push(request.task_id());
            drop(ticket);
        }
    }

    fn request(env: &str) -> TaskRequest {
        let task = Task::new("prompt", env);
        let config = DockerRunnerConfig::new(task.task_id, "img", "/w");
        TaskRequest::new(task, config)
    }

    fn setup(limits: &[(&str, i64)]) -> (Arc<HoldingLauncher>, Arc<AdmissionController>) {
        let launcher = Arc::new(HoldingLauncher::default());
        let limits = limits.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let controller = AdmissionController::with_limits(launcher.clone(), limits);
        (launcher, controller)
    }

    #[test]
    fn test_cap_queues_extra_task_until_finish() {
        let (launcher, controller) = setup(&[("web", 2)]);
        let requests: Vec<_> = (0..3).map(|_| request("web")).collect();
        let ids: Vec<_> = requests.iter().map(TaskRequest::task_id).collect();

        let admissions: Vec<_> = requests
            .into_iter()
            .map(|r| controller.on_task_submitted(r))
            .collect();

        assert_eq!(
            admissions,
            vec![Admission::Started, Admission::Started, Admission::Queued { position: 0 }]
        );
        assert_eq!(controller.running_count("web"), 2);
        assert_eq!(controller.queued(), vec![ids[2]]);

        launcher.finish(ids[0]);

        assert_eq!(launcher.started(), vec![ids[1], ids[2]]);
        assert_eq!(controller.running_count("web"), 2);
        assert!(controller.queued().is_empty());
    }

    #[test]
    fn test_environments_are_independent() {
        let (launcher, controller) = setup(&[("a", 1), ("b", 1)]);
        let a1 = request("a");
        let a2 = request("a");
        let b1 = request("b");
        let a2_id = a2.task_id();

        controller.on_task_submitted(a1);
        assert!(matches!(controller.on_task_submitted(a2), Admission::Queued { .. }));
        assert_eq!(controller.on_task_submitted(b1), Admission::Started);

        assert_eq!(launcher.started().len(), 2);
        assert_eq!(controller.queued(), vec![a2_id]);
    }

    #[test]
    fn test_unknown_and_negative_caps_are_unlimited() {
        let (launcher, controller) = setup(&[("free", -1)]);
        for _ in 0..5 {
            controller.on_task_submitted(request("free"));
            controller.on_task_submitted(request("unlisted"));
        }
        assert_eq!(launcher.started().len(), 10);
        assert_eq!(controller.total_running(), 10);
    }

    #[test]
    fn test_zero_cap_holds_until_raised() {
        let (launcher, controller) = setup(&[("paused", 0)]);
        controller.on_task_submitted(request("paused"));
        controller.on_task_submitted(request("paused"));
        assert!(launcher.started().is_empty());
        assert!(!controller.can_start("paused"));

        controller.set_limit("paused", 1);
        assert_eq!(launcher.started().len(), 1);
        assert_eq!(controller.queued().len(), 1);
    }

    #[test]
    fn test_finish_starts_all_eligible_oldest_first() {
        let (launcher, controller) = setup(&[("x", 1), ("y", 1)]);
        let x1 = request("x");
        let x1_id = x1.task_id();
        controller.on_task_submitted(x1);

        let y1 = request("y");
        let y1_id = y1.task_id();
        controller.on_task_submitted(y1);

        let queued: Vec<_> = [request("x"), request("y"), request("x")]
            .into_iter()
            .map(|r| {
                let id = r.task_id();
                controller.on_task_submitted(r);
                id
            })
            .collect();

        launcher.finish(y1_id);
        launcher.finish(x1_id);

        // y's slot went to queued[1]; x's slot to queued[0], the older x task.
        assert_eq!(launcher.started(), vec![queued[1], queued[0]]);
        assert_eq!(controller.queued(), vec![queued[2]]);
    }

    #[test]
    fn test_queued_task_keeps_fifo_within_environment() {
        let (launcher, controller) = setup(&[("web", 1)]);
        let first = request("web");
        let first_id = first.task_id();
        controller.on_task_submitted(first);
        controller.on_task_submitted(request("web"));

        controller.set_limit("web", 2);
        let late = request("web");
        assert!(matches!(controller.on_task_submitted(late), Admission::Queued { .. }));
        assert_eq!(launcher.started().len(), 2);

        launcher.finish(first_id);
        assert_eq!(launcher.started().len(), 2);
        assert!(controller.queued().is_empty());
    }

    #[test]
    fn test_cancel_queued() {
        let (launcher, controller) = setup(&[("web", 1)]);
        controller.on_task_submitted(request("web"));
        let waiting = request("web");
        let waiting_id = waiting.task_id();
        controller.on_task_submitted(waiting);

        let removed = controller.cancel_queued(waiting_id).unwrap();
        assert_eq!(removed.task.status, TaskStatus::Queued);
        assert!(controller.queued().is_empty());
        assert!(controller.cancel_queued(waiting_id).is_none());

        let running = launcher.started()[0];
        launcher.finish(running);
        assert_eq!(controller.running_count("web"), 0);
    }

    #[test]
    fn test_launched_task_is_marked_started() {
        let (launcher, controller) = setup(&[]);
        controller.on_task_submitted(request("e"));
        let status = launcher.running.lock()[0].0.task.status;
        assert_eq!(status, TaskStatus::Pulling);
    }

    #[test]
    fn test_synchronous_finish_does_not_deadlock() {
        let launcher = Arc::new(InstantLauncher {
            launched: Mutex::new(Vec::new()),
        });
        let limits = [("web".to_string(), 1)].into_iter().collect();
        let controller = AdmissionController::with_limits(launcher.clone(), limits);

        for _ in 0..3 {
            assert_eq!(controller.on_task_submitted(request("web")), Admission::Started);
        }
        assert_eq!(launcher.launched.lock().len(), 3);
        assert_eq!(controller.total_running(), 0);
    }

    #[test]
    fn test_dropped_ticket_releases_once() {
        let (launcher, controller) = setup(&[("web", 1)]);
        controller.on_task_submitted(request("web"));
        let (_, ticket) = launcher.running.lock().pop().unwrap();

        controller.on_task_finished(ticket);
        assert_eq!(controller.running_count("web"), 0);
        assert!(controller.can_start("web"));
    }
}
