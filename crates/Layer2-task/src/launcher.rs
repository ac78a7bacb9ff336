//! Launcher that runs admitted tasks under a [`TaskSupervisor`]

use crate::admission::{AdmissionTicket, TaskLauncher, TaskRequest};
use crate::agent::AgentRotation;
use crate::cache::PhaseImageCache;
use crate::container::ContainerBackend;
use crate::event::{EventSink, TaskEvent};
use crate::supervisor::{SupervisorConfig, SupervisorHandle, TaskSupervisor};
use crate::task::TaskId;
use crate::vcs::{PrMetadataSource, VcsPreparer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Spawns one supervisor per admitted task on the current tokio runtime
pub struct SupervisorLauncher {
    backend: Arc<dyn ContainerBackend>,
    cache: Arc<PhaseImageCache>,
    config: SupervisorConfig,
    rotation: Arc<AgentRotation>,
    events: mpsc::UnboundedSender<TaskEvent>,
    vcs: Option<Arc<dyn VcsPreparer>>,
    pr_source: Option<Arc<dyn PrMetadataSource>>,
    active: Arc<Mutex<HashMap<TaskId, SupervisorHandle>>>,
}

impl SupervisorLauncher {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        cache: Arc<PhaseImageCache>,
        config: SupervisorConfig,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        Self {
            backend,
            cache,
            config,
            rotation: Arc::new(AgentRotation::new()),
            events,
            vcs: None,
            pr_source: None,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_vcs(mut self, preparer: Arc<dyn VcsPreparer>) -> Self {
        self.vcs = Some(preparer);
        self
    }

    pub fn with_pr_source(mut self, source: Arc<dyn PrMetadataSource>) -> Self {
        self.pr_source = Some(source);
        self
    }

    pub fn rotation(&self) -> &AgentRotation {
        &self.rotation
    }

    /// Handle of a running task
    pub fn handle(&self, task_id: TaskId) -> Option<SupervisorHandle> {
        self.active.lock().get(&task_id).cloned()
    }

    /// Ask every running task to stop
    pub fn stop_all(&self) -> usize {
        let active = self.active.lock();
        for handle in active.values() {
            handle.request_stop();
        }
        active.len()
    }

    pub fn running(&self) -> usize {
        self.active.lock().len()
    }
}

impl TaskLauncher for SupervisorLauncher {
    fn launch(&self, request: TaskRequest, ticket: AdmissionTicket) {
        let task_id = request.task_id();
        let selection = request.selection.map(|s| self.rotation.assign(s));

        let mut supervisor = TaskSupervisor::new(
            request.config,
            selection.as_ref(),
            self.config.clone(),
            self.backend.clone(),
            self.cache.clone(),
            EventSink::new(task_id, self.events.clone()),
        );
        if let Some(vcs) = &self.vcs {
            supervisor = supervisor.with_vcs(vcs.clone());
        }
        if let Some(source) = &self.pr_source {
            supervisor = supervisor.with_pr_source(source.clone());
        }

        self.active.lock().insert(task_id, supervisor.handle());
        let active = self.active.clone();

        tokio::spawn(async move {
            let outcome = supervisor.run().await;
            debug!(task_id = %task_id, success = outcome.is_success(), "Supervisor finished");
            active.lock().remove(&task_id);
            ticket.finish();
        });
    }
}
