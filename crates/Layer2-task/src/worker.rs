//! Container worker - executes one attempt of a task
//!
//! A worker pulls the base image if needed, resolves cached phase images,
//! creates and starts the agent container, relays its output line by line
//! and reports the exit code. Unbaked phases run inside the agent container
//! before the agent itself, in phase order.
//!
//! The worker is consumed by [`ContainerWorker::run`], so each attempt
//! produces exactly one result.

use crate::cache::PhaseImageCache;
use crate::config::{DockerRunnerConfig, Phase};
use crate::container::{
    ContainerBackend, ContainerError, ContainerSpec, LineBuffer, VolumeMount, LABEL_ROLE, LABEL_TASK,
};
use crate::event::EventSink;
use crate::state::{ContainerState, ContainerStatus};
use crate::vcs::VcsCheckout;
use caravel_foundation::AgentKind;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mount point of the host working directory
pub const WORKSPACE_DIR: &str = "/workspace";

/// Output lines kept for failure classification
pub const OUTPUT_TAIL_LINES: usize = 50;

/// Grace period given to the agent on stop before it is killed
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Upper bound for stop plus removal after cancellation
const CLEANUP_BUDGET: Duration = Duration::from_secs(30);

/// Why an attempt produced no exit code
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// Unknown agent, malformed mount, missing config directory, bad flags
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Exit of a container that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptExit {
    pub exit_code: i64,
    /// Last [`OUTPUT_TAIL_LINES`] output lines
    pub output: Vec<String>,
}

/// Shared view of a running worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    cancel: CancellationToken,
    container_id: Mutex<Option<String>>,
    checkout: Mutex<Option<VcsCheckout>>,
}

impl WorkerHandle {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancel,
                container_id: Mutex::new(None),
                checkout: Mutex::new(None),
            }),
        }
    }

    /// Ask the worker to stop; idempotent
    pub fn request_stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Id of the agent container, once created
    pub fn container_id(&self) -> Option<String> {
        self.inner.container_id.lock().clone()
    }

    pub fn checkout(&self) -> Option<VcsCheckout> {
        self.inner.checkout.lock().clone()
    }

    fn set_container_id(&self, id: &str) {
        *self.inner.container_id.lock() = Some(id.to_string());
    }
}

/// Runs one agent attempt in a container
pub struct ContainerWorker {
    config: DockerRunnerConfig,
    backend: Arc<dyn ContainerBackend>,
    cache: Arc<PhaseImageCache>,
    events: EventSink,
    handle: WorkerHandle,
}

impl ContainerWorker {
    pub fn new(
        config: DockerRunnerConfig,
        backend: Arc<dyn ContainerBackend>,
        cache: Arc<PhaseImageCache>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            backend,
            cache,
            events,
            handle: WorkerHandle::new(cancel),
        }
    }

    /// Attach the repository checkout this attempt works in
    pub fn with_checkout(self, checkout: Option<VcsCheckout>) -> Self {
        *self.handle.inner.checkout.lock() = checkout;
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &DockerRunnerConfig {
        &self.config
    }

    /// Execute the attempt
    pub async fn run(self) -> Result<AttemptExit, WorkerError> {
        info!(
            task_id = %self.config.task_id,
            agent = %self.config.agent_cli,
            image = %self.config.image,
            "Starting container attempt"
        );
        self.events
            .state(ContainerState::new(ContainerStatus::Queued).with_image(&self.config.image));

        let kind = AgentKind::from_cli(&self.config.agent_cli)
            .map_err(|e| WorkerError::Config(e.to_string()))?;
        let volumes = self.volumes(kind)?;
        self.check_cancelled()?;

        self.events
            .state(ContainerState::new(ContainerStatus::Pulling).with_image(&self.config.image));
        self.ensure_base_image().await?;

        let (image, pending) = self.resolve_phases().await?;
        self.check_cancelled()?;

        let spec = self.container_spec(kind, &image, &pending, volumes);
        let id = self.backend.create_container(&spec).await?;
        self.handle.set_container_id(&id);

        let result = self.attach(&id, &image).await;

        match &result {
            Err(WorkerError::Cancelled) => {
                self.stop_and_remove(&id).await;
                self.events.state(
                    ContainerState::new(ContainerStatus::Exited)
                        .with_container(&id)
                        .with_error("stopped"),
                );
            }
            Err(e) => {
                self.events.state(
                    ContainerState::new(ContainerStatus::Exited)
                        .with_container(&id)
                        .with_error(e.to_string()),
                );
                self.remove(&id).await;
            }
            Ok(exit) => {
                self.events.state(
                    ContainerState::new(ContainerStatus::Exited)
                        .with_container(&id)
                        .with_exit_code(exit.exit_code),
                );
                self.remove(&id).await;
            }
        }

        result
    }

    fn check_cancelled(&self) -> Result<(), WorkerError> {
        if self.handle.is_stop_requested() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn volumes(&self, kind: AgentKind) -> Result<Vec<VolumeMount>, WorkerError> {
        let mut volumes = vec![VolumeMount::new(&self.config.host_workdir, WORKSPACE_DIR)];

        if let Some(dir) = &self.config.host_config_dir {
            if !dir.is_dir() {
                return Err(WorkerError::Config(format!(
                    "config directory {} does not exist",
                    dir.display()
                )));
            }
            volumes.push(VolumeMount::new(dir, kind.capabilities().config_mount));
        }

        for spec in &self.config.extra_mounts {
            let mount = VolumeMount::parse(spec).map_err(|e| WorkerError::Config(e.to_string()))?;
            volumes.push(mount);
        }
        Ok(volumes)
    }

    async fn ensure_base_image(&self) -> Result<(), WorkerError> {
        let image = &self.config.image;
        if self.backend.image_exists(image).await? {
            return Ok(());
        }

        let cancel = self.handle.inner.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            pulled = self.backend.pull_image(image) => Ok(pulled?),
        }
    }

    /// Final image plus the phases that still have to run at startup
    async fn resolve_phases(&self) -> Result<(String, Vec<Phase>), WorkerError> {
        let mut image = self.config.image.clone();
        let mut pending = Vec::new();

        for phase in Phase::ORDER {
            if !self.config.phase_enabled(phase) {
                continue;
            }
            let Some(script) = self.config.preflight.get(phase) else {
                continue;
            };

            // A phase cannot be baked on top of an image missing an earlier one.
            if !pending.is_empty() || !self.config.phase_cached(phase) {
                pending.push(phase);
                continue;
            }

            let baked = self
                .cache
                .ensure_phase_image_until(&image, phase.as_str(), script, &self.handle.inner.cancel)
                .await
                .ok_or(WorkerError::Cancelled)?;
            if baked == image {
                self.events.log(format!(
                    "[caravel] {} preflight could not be cached; running it at startup",
                    phase
                ));
                pending.push(phase);
            } else {
                debug!(phase = %phase, image = %baked, "Using cached phase image");
                image = baked;
            }
        }

        Ok((image, pending))
    }

    fn command(&self, kind: AgentKind, pending: &[Phase]) -> Vec<String> {
        let agent = kind.render_command(&self.config.agent_cli_args, &self.config.prompt);
        if pending.is_empty() {
            return agent;
        }

        let mut script = String::from("set -e\n");
        for phase in pending {
            script.push_str(&format!("echo '[caravel] running {} preflight'\n", phase));
            script.push_str(self.config.preflight.get(*phase).unwrap_or_default());
            script.push('\n');
        }
        script.push_str("exec \"$@\"\n");

        let mut command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script,
            "caravel-agent".to_string(),
        ];
        command.extend(agent);
        command
    }

    fn container_spec(
        &self,
        kind: AgentKind,
        image: &str,
        pending: &[Phase],
        volumes: Vec<VolumeMount>,
    ) -> ContainerSpec {
        let task = self.config.task_id.as_full();
        let suffix = uuid::Uuid::new_v4().simple().to_string();

        let mut spec = ContainerSpec::new(image)
            .with_name(format!("caravel-{}-{}", &task[..12], &suffix[..8]))
            .with_command(self.command(kind, pending))
            .with_working_dir(WORKSPACE_DIR)
            .with_env("CARAVEL_TASK_ID", &task)
            .with_label(LABEL_TASK, &task)
            .with_label(LABEL_ROLE, "agent")
            .with_label("caravel.agent", kind.cli_name());

        for (key, value) in &self.config.env_vars {
            spec = spec.with_env(key, value);
        }
        spec.volumes = volumes;
        spec
    }

    /// Start the container, relay output and wait for the exit code
    async fn attach(&self, id: &str, image: &str) -> Result<AttemptExit, WorkerError> {
        let cancel = self.handle.inner.cancel.clone();

        self.backend.start_container(id).await?;
        self.events.state(
            ContainerState::new(ContainerStatus::Running)
                .with_container(id)
                .with_image(image),
        );

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut lines = LineBuffer::default();
        let mut logs = self.backend.log_stream(id);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                chunk = logs.next() => match chunk {
                    Some(Ok(chunk)) => {
                        for line in lines.push(&chunk.text) {
                            self.relay(line, &mut tail);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(container_id = %id, error = %e, "Log stream interrupted");
                        break;
                    }
                    None => break,
                },
            }
        }
        if let Some(rest) = lines.finish() {
            self.relay(rest, &mut tail);
        }

        let exit_code = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            code = self.backend.wait_container(id) => code?,
        };

        info!(task_id = %self.config.task_id, container_id = %id, exit_code, "Container exited");
        Ok(AttemptExit {
            exit_code,
            output: tail.into(),
        })
    }

    fn relay(&self, line: String, tail: &mut VecDeque<String>) {
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
        self.events.log(line);
    }

    async fn stop_and_remove(&self, id: &str) {
        let cleanup = async {
            if let Err(e) = self.backend.stop_container(id, STOP_GRACE).await {
                debug!(container_id = %id, error = %e, "Stop failed");
            }
            self.remove(id).await;
        };
        if tokio::time::timeout(CLEANUP_BUDGET, cleanup).await.is_err() {
            warn!(container_id = %id, "Container cleanup timed out");
        }
    }

    async fn remove(&self, id: &str) {
        if let Err(e) = self.backend.remove_container(id, true).await {
            debug!(container_id = %id, error = %e, "Failed to remove container");
        }
    }
}

/// Host paths mounted into an attempt, for display
pub fn describe_mounts(config: &DockerRunnerConfig) -> Vec<(PathBuf, String)> {
    let mut mounts = vec![(config.host_workdir.clone(), WORKSPACE_DIR.to_string())];
    if let Some(dir) = &config.host_config_dir {
        let target = AgentKind::from_cli(&config.agent_cli)
            .map(|kind| kind.capabilities().config_mount.to_string())
            .unwrap_or_else(|_| "?".to_string());
        mounts.push((dir.clone(), target));
    }
    mounts
}
