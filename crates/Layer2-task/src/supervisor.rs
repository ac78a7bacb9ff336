//! Task supervisor - retry, backoff and agent fallback for one task
//!
//! The supervisor owns a task's run from start to finish. It walks the
//! agent chain, runs one [`ContainerWorker`] per attempt, classifies each
//! failure and either retries the same agent after a backoff, falls back to
//! the next agent or gives up. Every run ends with exactly one
//! [`TaskEventKind::Done`] event.

use crate::agent::{AgentInstance, AgentSelection, DEFAULT_AGENT_ID};
use crate::cache::PhaseImageCache;
use crate::classify::{AttemptFailure, ErrorClassifier, NO_EXIT_CODE};
use crate::config::DockerRunnerConfig;
use crate::container::ContainerBackend;
use crate::event::{EventSink, RunOutcome, TaskEventKind};
use crate::vcs::{PrMetadataSource, VcsCheckout, VcsPreparer};
use crate::worker::{AttemptExit, ContainerWorker, WorkerError, WorkerHandle};
use caravel_foundation::{ErrorClass, Result, SupervisorSettings};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry and fallback policy
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Retries per agent after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any delay
    pub max_delay: Duration,

    /// Fraction in `[0, 1]`
    pub jitter: f64,

    /// How often a backoff sleep checks for a stop request
    pub poll_interval: Duration,

    /// Whether a `Fatal` failure ends the whole run
    pub fatal_aborts_chain: bool,

    pub classifier: ErrorClassifier,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let settings = SupervisorSettings::default();
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.backoff_base_ms),
            max_delay: Duration::from_millis(settings.backoff_cap_ms),
            jitter: settings.jitter,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            fatal_aborts_chain: settings.fatal_aborts_chain,
            classifier: ErrorClassifier::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &SupervisorSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.backoff_base_ms),
            max_delay: Duration::from_millis(settings.backoff_cap_ms),
            jitter: settings.jitter,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            fatal_aborts_chain: settings.fatal_aborts_chain,
            classifier: ErrorClassifier::from_settings(settings)?,
        })
    }

    /// Create a config with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate delay before retry number `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay, self.max_delay, self.jitter)
    }
}

/// Exponential backoff with symmetric jitter
///
/// `base * 2^(attempt-1)` clamped to `cap`, scaled by a random factor in
/// `[1 - jitter, 1 + jitter]` and clamped to `[0, cap]` again.
pub fn calculate_backoff(attempt: u32, base: Duration, cap: Duration, jitter: f64) -> Duration {
    let sample = rand::thread_rng().gen::<f64>();
    backoff_with_sample(attempt, base, cap, jitter, sample)
}

/// [`calculate_backoff`] with the random sample supplied; `sample` in `[0, 1)`
fn backoff_with_sample(attempt: u32, base: Duration, cap: Duration, jitter: f64, sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(62) as i32;
    let cap_secs = cap.as_secs_f64();
    let raw = (base.as_secs_f64() * 2f64.powi(exponent)).min(cap_secs);

    // NaN or infinite jitter means no jitter.
    let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
    let factor = 1.0 + jitter * (2.0 * sample - 1.0);
    let delay = (raw * factor).clamp(0.0, cap_secs);

    Duration::try_from_secs_f64(delay).unwrap_or(cap)
}

/// Resolve the ordered agents one run may use
///
/// Without a selection (or with an empty one) the chain is a single
/// synthetic agent running the base config's agent CLI. Otherwise it starts
/// at the pinned agent, or the first one, and follows fallback edges until
/// an edge is missing or would revisit an agent.
pub fn initialize_agent_chain(
    selection: Option<&AgentSelection>,
    base: &DockerRunnerConfig,
) -> Vec<AgentInstance> {
    let default_chain = || vec![AgentInstance::new(DEFAULT_AGENT_ID, &base.agent_cli)];

    let Some(selection) = selection.filter(|s| !s.is_empty()) else {
        return default_chain();
    };

    let start = selection
        .pinned_agent_id()
        .and_then(|id| selection.get(id))
        .or_else(|| selection.agents().first());

    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut current = start;
    while let Some(agent) = current {
        if !visited.insert(agent.agent_id.as_str()) {
            debug!(agent_id = %agent.agent_id, "Fallback cycle detected; chain ends");
            break;
        }
        chain.push(agent.clone());
        current = selection.fallback_for(&agent.agent_id);
    }

    if chain.is_empty() {
        default_chain()
    } else {
        chain
    }
}

/// Per-agent config derived from the base config
///
/// Only the agent fields change: the CLI always, the host config directory
/// when the agent names one and the arguments when the agent has flags.
pub fn build_agent_config(
    base: &DockerRunnerConfig,
    agent: &AgentInstance,
) -> std::result::Result<DockerRunnerConfig, WorkerError> {
    let mut config = base.clone();
    config.agent_cli = agent.agent_cli.clone();

    if !agent.config_dir.trim().is_empty() {
        config.host_config_dir = Some(PathBuf::from(agent.config_dir.trim()));
    }

    if !agent.cli_flags.trim().is_empty() {
        config.agent_cli_args = shlex::split(&agent.cli_flags).ok_or_else(|| {
            WorkerError::Config(format!(
                "cannot parse cli flags of agent {}: {}",
                agent.agent_id, agent.cli_flags
            ))
        })?;
    }

    Ok(config)
}

/// Shared view of a running supervisor
#[derive(Debug, Clone, Default)]
pub struct SupervisorHandle {
    inner: Arc<SupervisorShared>,
}

#[derive(Debug, Default)]
struct SupervisorShared {
    cancel: CancellationToken,
    active: Mutex<Option<WorkerHandle>>,
}

impl SupervisorHandle {
    /// Stop the run: the active worker is stopped and no further attempt,
    /// retry or fallback starts. Idempotent.
    pub fn request_stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Container of the active attempt
    pub fn container_id(&self) -> Option<String> {
        self.active().and_then(|w| w.container_id())
    }

    pub fn gh_repo_root(&self) -> Option<PathBuf> {
        self.active().and_then(|w| w.checkout()).map(|c| c.repo_root)
    }

    pub fn gh_base_branch(&self) -> Option<String> {
        self.active().and_then(|w| w.checkout()).map(|c| c.base_branch)
    }

    pub fn gh_branch(&self) -> Option<String> {
        self.active().and_then(|w| w.checkout()).map(|c| c.branch)
    }

    fn active(&self) -> Option<WorkerHandle> {
        self.inner.active.lock().clone()
    }

    fn set_active(&self, worker: Option<WorkerHandle>) {
        *self.inner.active.lock() = worker;
    }

    fn child_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }
}

/// Supervises one task run
pub struct TaskSupervisor {
    base: DockerRunnerConfig,
    chain: Vec<AgentInstance>,
    config: SupervisorConfig,
    backend: Arc<dyn ContainerBackend>,
    cache: Arc<PhaseImageCache>,
    events: EventSink,
    vcs: Option<Arc<dyn VcsPreparer>>,
    pr_source: Option<Arc<dyn PrMetadataSource>>,
    handle: SupervisorHandle,
}

impl TaskSupervisor {
    pub fn new(
        base: DockerRunnerConfig,
        selection: Option<&AgentSelection>,
        config: SupervisorConfig,
        backend: Arc<dyn ContainerBackend>,
        cache: Arc<PhaseImageCache>,
        events: EventSink,
    ) -> Self {
        let chain = initialize_agent_chain(selection, &base);
        Self {
            base,
            chain,
            config,
            backend,
            cache,
            events,
            vcs: None,
            pr_source: None,
            handle: SupervisorHandle::default(),
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

    /// Agents this run may use, in order
    pub fn chain(&self) -> &[AgentInstance] {
        &self.chain
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn request_stop(&self) {
        self.handle.request_stop();
    }

    pub fn container_id(&self) -> Option<String> {
        self.handle.container_id()
    }

    pub fn gh_repo_root(&self) -> Option<PathBuf> {
        self.handle.gh_repo_root()
    }

    pub fn gh_base_branch(&self) -> Option<String> {
        self.handle.gh_base_branch()
    }

    pub fn gh_branch(&self) -> Option<String> {
        self.handle.gh_branch()
    }

    /// Run to completion and report the outcome
    ///
    /// The outcome is also emitted as the final [`TaskEventKind::Done`].
    pub async fn run(self) -> RunOutcome {
        let task_id = self.base.task_id;
        info!(
            task_id = %task_id,
            agents = ?self.chain.iter().map(|a| a.agent_id.as_str()).collect::<Vec<_>>(),
            "Starting supervised run"
        );

        let outcome = self.supervise().await;

        match &outcome {
            RunOutcome::Succeeded { agent_id, .. } => {
                info!(task_id = %task_id, agent_id = %agent_id, "Task succeeded")
            }
            RunOutcome::Failed {
                agent_id,
                exit_code,
                class,
                error,
            } => warn!(
                task_id = %task_id,
                agent_id = %agent_id,
                exit_code,
                class = %class,
                error = %error,
                "Task failed"
            ),
            RunOutcome::Cancelled => info!(task_id = %task_id, "Task cancelled"),
        }

        self.events.emit(TaskEventKind::Done(outcome.clone()));
        outcome
    }

    async fn supervise(&self) -> RunOutcome {
        let checkout = match self.prepare_repository().await {
            Ok(checkout) => checkout,
            Err(outcome) => return outcome,
        };

        let mut last_failure = None;
        for (index, agent) in self.chain.iter().enumerate() {
            match self.run_agent(agent, checkout.as_ref()).await {
                ControlFlow::Break(outcome) => return outcome,
                ControlFlow::Continue(failure) => last_failure = Some(failure),
            }

            if let Some(next) = self.chain.get(index + 1) {
                if self.handle.is_stop_requested() {
                    return RunOutcome::Cancelled;
                }
                info!(
                    task_id = %self.base.task_id,
                    from = %agent.agent_id,
                    to = %next.agent_id,
                    "Falling back to next agent"
                );
                self.events.emit(TaskEventKind::AgentSwitch {
                    from: agent.agent_id.clone(),
                    to: next.agent_id.clone(),
                });
            }
        }

        last_failure.unwrap_or_else(|| self.fatal(DEFAULT_AGENT_ID, "no agents configured".into()))
    }

    /// Attempts on one agent; `Continue` carries the failure to fall back from
    async fn run_agent(
        &self,
        agent: &AgentInstance,
        checkout: Option<&VcsCheckout>,
    ) -> ControlFlow<RunOutcome, RunOutcome> {
        let mut attempt = 1u32;

        loop {
            if self.handle.is_stop_requested() {
                return ControlFlow::Break(RunOutcome::Cancelled);
            }

            let result = match build_agent_config(&self.base, agent) {
                Ok(config) => self.attempt(config, checkout).await,
                Err(e) => Err(e),
            };

            let failure = match result {
                Ok(exit) if exit.exit_code == 0 => {
                    return ControlFlow::Break(self.succeeded(agent, checkout));
                }
                Ok(exit) => AttemptFailure::Exit(exit),
                Err(WorkerError::Cancelled) => return ControlFlow::Break(RunOutcome::Cancelled),
                Err(e) => AttemptFailure::Error(e),
            };

            // A stop that raced with the failure wins over retry or fallback.
            if self.handle.is_stop_requested() {
                return ControlFlow::Break(RunOutcome::Cancelled);
            }

            let class = self.config.classifier.classify(&failure);
            warn!(
                task_id = %self.base.task_id,
                agent_id = %agent.agent_id,
                attempt,
                class = %class,
                error = %failure,
                "Attempt failed"
            );

            let outcome = RunOutcome::Failed {
                agent_id: agent.agent_id.clone(),
                exit_code: failure.exit_code(),
                error: failure.to_string(),
                class,
            };

            match class {
                ErrorClass::Transient if attempt <= self.config.max_retries => {
                    let delay = self.config.delay_for_attempt(attempt);
                    self.events.emit(TaskEventKind::Retry {
                        attempt,
                        agent_id: agent.agent_id.clone(),
                        delay,
                    });
                    if !self.backoff(delay).await {
                        return ControlFlow::Break(RunOutcome::Cancelled);
                    }
                    attempt += 1;
                }
                ErrorClass::Fatal if self.config.fatal_aborts_chain => {
                    return ControlFlow::Break(outcome);
                }
                _ => return ControlFlow::Continue(outcome),
            }
        }
    }

    async fn attempt(
        &self,
        mut config: DockerRunnerConfig,
        checkout: Option<&VcsCheckout>,
    ) -> std::result::Result<AttemptExit, WorkerError> {
        if let Some(checkout) = checkout {
            config.host_workdir = checkout.repo_root.clone();
        }

        let worker = ContainerWorker::new(
            config,
            self.backend.clone(),
            self.cache.clone(),
            self.events.clone(),
            self.handle.child_token(),
        )
        .with_checkout(checkout.cloned());

        self.handle.set_active(Some(worker.handle()));
        let result = worker.run().await;
        self.handle.set_active(None);
        result
    }

    /// Sleep for `delay`, waking every poll interval to honour a stop
    ///
    /// Returns false when stopped.
    async fn backoff(&self, delay: Duration) -> bool {
        debug!(task_id = %self.base.task_id, ?delay, "Backing off");
        let deadline = Instant::now() + delay;
        loop {
            if self.handle.is_stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(self.config.poll_interval)).await;
        }
    }

    async fn prepare_repository(&self) -> std::result::Result<Option<VcsCheckout>, RunOutcome> {
        let Some(request) = &self.base.vcs else {
            return Ok(None);
        };
        let first_agent = self
            .chain
            .first()
            .map(|a| a.agent_id.as_str())
            .unwrap_or(DEFAULT_AGENT_ID);

        let Some(preparer) = &self.vcs else {
            return Err(self.fatal(first_agent, "repository preparation requested without a preparer".into()));
        };
        if self.handle.is_stop_requested() {
            return Err(RunOutcome::Cancelled);
        }

        info!(task_id = %self.base.task_id, repo = %request.repo, "Preparing repository");
        let cancel = self.handle.child_token();
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunOutcome::Cancelled),
            prepared = preparer.prepare(request, &self.base.host_workdir) => prepared,
        };

        match prepared {
            Ok(checkout) => {
                self.events.emit(TaskEventKind::Prepared(checkout.clone()));
                Ok(Some(checkout))
            }
            Err(e) => Err(self.fatal(first_agent, format!("repository preparation failed: {}", e))),
        }
    }

    fn succeeded(&self, agent: &AgentInstance, checkout: Option<&VcsCheckout>) -> RunOutcome {
        let pr = match (checkout, &self.pr_source) {
            (Some(checkout), Some(source)) => source.read(checkout),
            _ => None,
        };
        RunOutcome::Succeeded {
            agent_id: agent.agent_id.clone(),
            pr,
        }
    }

    fn fatal(&self, agent_id: &str, error: String) -> RunOutcome {
        RunOutcome::Failed {
            agent_id: agent_id.to_string(),
            exit_code: NO_EXIT_CODE,
            error,
            class: ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use caravel_foundation::SelectionMode;
    use std::collections::BTreeMap;

    fn base() -> DockerRunnerConfig {
        DockerRunnerConfig::new(TaskId::new(), "img", "/w").with_agent("codex", vec!["--x".into()])
    }

    fn ids(chain: &[AgentInstance]) -> Vec<&str> {
        chain.iter().map(|a| a.agent_id.as_str()).collect()
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);

        let delays: Vec<_> = (1..=8).map(|n| backoff_with_sample(n, base, cap, 0.0, 0.5)).collect();

        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[4], Duration::from_secs(32));
        assert_eq!(delays[5], cap);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(60);

        let low = backoff_with_sample(1, base, cap, 0.2, 0.0);
        let high = backoff_with_sample(1, base, cap, 0.2, 0.999_999);
        assert_eq!(low, Duration::from_secs(8));
        assert!(high > Duration::from_millis(11_999) && high <= Duration::from_secs(12));

        // Jitter never pushes past the cap.
        assert_eq!(backoff_with_sample(10, base, cap, 1.0, 0.999), cap);
        assert_eq!(backoff_with_sample(1, base, cap, 1.0, 0.0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_random_stays_in_range() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        for attempt in 1..20 {
            let delay = calculate_backoff(attempt, base, cap, 0.5);
            assert!(delay <= cap);
        }
    }

    #[test]
    fn test_backoff_huge_attempt_does_not_overflow() {
        let delay = backoff_with_sample(u32::MAX, Duration::from_secs(1), Duration::from_secs(5), 0.0, 0.0);
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_non_finite_jitter_is_ignored() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_with_sample(1, base, cap, f64::NAN, 0.9), base);
        assert_eq!(backoff_with_sample(2, base, cap, f64::INFINITY, 0.1), Duration::from_secs(4));
        assert_eq!(calculate_backoff(3, base, cap, f64::NAN), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_with_maximal_cap_does_not_panic() {
        let base = Duration::from_secs(u64::MAX / 2);
        assert_eq!(backoff_with_sample(10, base, Duration::MAX, 0.0, 0.5), Duration::MAX);
    }

    #[test]
    fn test_chain_without_selection_uses_default_agent() {
        let chain = initialize_agent_chain(None, &base());
        assert_eq!(chain, vec![AgentInstance::new(DEFAULT_AGENT_ID, "codex")]);

        let empty = AgentSelection::chained(Vec::new());
        assert_eq!(ids(&initialize_agent_chain(Some(&empty), &base())), vec![DEFAULT_AGENT_ID]);
    }

    #[test]
    fn test_chain_follows_fallbacks_from_pin() {
        let agents = vec![
            AgentInstance::new("a", "codex"),
            AgentInstance::new("b", "claude"),
            AgentInstance::new("c", "gemini"),
        ];
        let fallbacks: BTreeMap<_, _> = [("b", "c"), ("c", "a")]
            .iter()
            .map(|(x, y)| (x.to_string(), y.to_string()))
            .collect();
        let selection = AgentSelection::new(agents, SelectionMode::Fallback, fallbacks, Some("b".into()));

        assert_eq!(ids(&initialize_agent_chain(Some(&selection), &base())), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_chain_stops_at_cycle() {
        let agents = vec![AgentInstance::new("a", "codex"), AgentInstance::new("b", "claude")];
        let fallbacks: BTreeMap<_, _> = [("a", "b"), ("b", "a")]
            .iter()
            .map(|(x, y)| (x.to_string(), y.to_string()))
            .collect();
        let selection = AgentSelection::new(agents, SelectionMode::Fallback, fallbacks, None);

        assert_eq!(ids(&initialize_agent_chain(Some(&selection), &base())), vec!["a", "b"]);
    }

    #[test]
    fn test_build_agent_config_overrides_agent_fields_only() {
        let base = base();
        let agent = AgentInstance::new("c", "claude")
            .with_config_dir("/home/me/.claude")
            .with_cli_flags("--model 'opus 4' --verbose");

        let config = build_agent_config(&base, &agent).unwrap();

        assert_eq!(config.agent_cli, "claude");
        assert_eq!(config.host_config_dir, Some(PathBuf::from("/home/me/.claude")));
        assert_eq!(config.agent_cli_args, vec!["--model", "opus 4", "--verbose"]);
        assert_eq!(config.image, base.image);
        assert_eq!(config.task_id, base.task_id);
    }

    #[test]
    fn test_build_agent_config_keeps_base_when_agent_fields_empty() {
        let mut base = base();
        base.host_config_dir = Some(PathBuf::from("/base/cfg"));

        let config = build_agent_config(&base, &AgentInstance::new("d", "gemini")).unwrap();

        assert_eq!(config.agent_cli, "gemini");
        assert_eq!(config.host_config_dir, base.host_config_dir);
        assert_eq!(config.agent_cli_args, base.agent_cli_args);
    }

    #[test]
    fn test_unbalanced_flags_are_config_error() {
        let agent = AgentInstance::new("x", "codex").with_cli_flags("--name 'unterminated");
        assert!(matches!(
            build_agent_config(&base(), &agent),
            Err(WorkerError::Config(_))
        ));
    }

    #[test]
    fn test_config_from_settings_rejects_bad_rule() {
        let mut settings = SupervisorSettings::default();
        settings.message_rules.push(caravel_foundation::MessageRule {
            pattern: "(".into(),
            class: ErrorClass::Fatal,
        });
        assert!(SupervisorConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn test_handle_proxies_are_none_without_worker() {
        let handle = SupervisorHandle::default();
        assert!(handle.container_id().is_none());
        assert!(handle.gh_repo_root().is_none());
        assert!(handle.gh_branch().is_none());

        handle.request_stop();
        handle.request_stop();
        assert!(handle.is_stop_requested());
    }
}
