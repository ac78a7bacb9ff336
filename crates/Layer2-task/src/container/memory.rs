//! Scripted in-memory backend
//!
//! Agent containers consume [`ScriptedRun`]s in submission order; when the
//! script is empty they exit 0 without output. Phase-build containers
//! (labelled `caravel.role=phase-build`) succeed unless builds are set to
//! fail, after an optional build time.

use super::{ContainerBackend, ContainerError, ContainerSpec, LogChunk, LABEL_ROLE};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Exit code reported for containers killed by `stop_container`
const KILLED_EXIT_CODE: i64 = 137;

/// Behaviour of one agent container
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub exit_code: i64,
    pub logs: Vec<String>,
    /// How long the container runs before exiting
    pub runtime: Duration,
    /// Run until stopped
    pub hang: bool,
    /// Fail `create_container` with this error instead of running
    pub create_error: Option<ContainerError>,
}

impl ScriptedRun {
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn create_error(error: ContainerError) -> Self {
        Self {
            create_error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_logs<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.logs = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }
}

struct MemContainer {
    spec: ContainerSpec,
    run: ScriptedRun,
    stopped: Arc<Notify>,
    removed: bool,
}

#[derive(Default)]
struct MemoryState {
    images: HashSet<String>,
    pull_failures: HashMap<String, u32>,
    fail_builds: bool,
    build_time: Duration,
    script: VecDeque<ScriptedRun>,
    containers: HashMap<String, MemContainer>,
    next_id: u64,
    created: Vec<ContainerSpec>,
    pulls: Vec<String>,
    commits: Vec<(String, String)>,
    stops: Vec<String>,
}

/// In-memory [`ContainerBackend`]
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `image` as present locally
    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.state.lock().images.insert(image.into());
        self
    }

    /// Queue agent container behaviours
    pub fn with_script(self, runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        self.state.lock().script.extend(runs);
        self
    }

    /// Fail the next `times` pulls of `image`
    pub fn fail_pulls(&self, image: impl Into<String>, times: u32) {
        self.state.lock().pull_failures.insert(image.into(), times);
    }

    /// Make every phase build exit non-zero
    pub fn fail_builds(&self, fail: bool) {
        self.state.lock().fail_builds = fail;
    }

    /// Make every phase build take `build_time` before exiting
    pub fn slow_builds(&self, build_time: Duration) {
        self.state.lock().build_time = build_time;
    }

    pub fn push_run(&self, run: ScriptedRun) {
        self.state.lock().script.push_back(run);
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().images.contains(image)
    }

    /// Specs of every container created so far
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().created.clone()
    }

    /// Specs of created agent containers
    pub fn agent_runs(&self) -> Vec<ContainerSpec> {
        self.created()
            .into_iter()
            .filter(|spec| spec.label(LABEL_ROLE) != Some("phase-build"))
            .collect()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }

    /// `(container id, image)` pairs of successful commits
    pub fn commits(&self) -> Vec<(String, String)> {
        self.state.lock().commits.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().stops.clone()
    }

    /// Containers created and not yet removed
    pub fn live_containers(&self) -> usize {
        self.state.lock().containers.values().filter(|c| !c.removed).count()
    }

    fn container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MemContainer) -> T,
    ) -> Result<T, ContainerError> {
        let mut state = self.state.lock();
        match state.containers.get_mut(id) {
            Some(container) if !container.removed => Ok(f(container)),
            _ => Err(ContainerError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        Ok(self.has_image(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        let mut state = self.state.lock();
        state.pulls.push(image.to_string());

        if let Some(remaining) = state.pull_failures.get_mut(image) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ContainerError::PullFailed {
                    image: image.to_string(),
                    message: "registry unreachable".to_string(),
                });
            }
        }

        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let mut state = self.state.lock();

        let run = if spec.label(LABEL_ROLE) == Some("phase-build") {
            ScriptedRun::exit(if state.fail_builds { 1 } else { 0 }).with_runtime(state.build_time)
        } else {
            state.script.pop_front().unwrap_or_default()
        };

        if let Some(error) = run.create_error.clone() {
            return Err(error);
        }
        if !state.images.contains(&spec.image) {
            return Err(ContainerError::NotFound(spec.image.clone()));
        }

        state.next_id += 1;
        let id = format!("mem-{:04}", state.next_id);
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            MemContainer {
                spec: spec.clone(),
                run,
                stopped: Arc::new(Notify::new()),
                removed: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        self.container(id, |_| ())
    }

    fn log_stream(&self, id: &str) -> BoxStream<'static, Result<LogChunk, ContainerError>> {
        match self.container(id, |c| c.run.logs.clone()) {
            Ok(lines) => stream::iter(
                lines
                    .into_iter()
                    .map(|line| Ok(LogChunk::stdout(format!("{}\n", line)))),
            )
            .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ContainerError> {
        let (run, stopped) = self.container(id, |c| (c.run.clone(), c.stopped.clone()))?;

        if run.hang {
            stopped.notified().await;
            return Ok(KILLED_EXIT_CODE);
        }

        tokio::select! {
            _ = tokio::time::sleep(run.runtime) => Ok(run.exit_code),
            _ = stopped.notified() => Ok(KILLED_EXIT_CODE),
        }
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), ContainerError> {
        let stopped = self.container(id, |c| c.stopped.clone())?;
        self.state.lock().stops.push(id.to_string());
        stopped.notify_one();
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), ContainerError> {
        let stopped = self.container(id, |c| {
            c.removed = true;
            c.stopped.clone()
        })?;
        stopped.notify_one();
        Ok(())
    }

    async fn commit_container(&self, id: &str, reference: &str) -> Result<(), ContainerError> {
        let image = self.container(id, |c| c.spec.image.clone())?;
        let mut state = self.state.lock();
        state.images.insert(reference.to_string());
        state.commits.push((id.to_string(), reference.to_string()));
        tracing::debug!(base = %image, image = %reference, "Committed in-memory image");
        Ok(())
    }
}
