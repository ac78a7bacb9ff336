//! Non-interactive run mode

use caravel_foundation::{AgentKind, EnvironmentSettings, Settings};
use caravel_task::worker::describe_mounts;
use caravel_task::{
    Admission, AdmissionController, AgentInstance, AgentSelection, ContainerBackend,
    DockerBackend, DockerRunnerConfig, MemoryBackend, PhaseImageCache, RunOutcome,
    SupervisorConfig, SupervisorLauncher, Task, TaskEvent, TaskEventKind, TaskId, TaskRequest,
    CANCELLED_EXIT_CODE,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Environment id used when `--env` is not given
const DEFAULT_ENVIRONMENT: &str = "default";

/// Options of `caravel run`
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub prompts: Vec<String>,
    pub environment: Option<String>,
    pub agents: Vec<String>,
    pub dry_run: bool,
    pub json: bool,
}

/// Submit every prompt and print events until all tasks are finished
///
/// Returns the process exit code: 0 when every task succeeded, otherwise
/// the code of the first task that did not.
pub async fn run(settings: &Settings, options: RunOptions) -> anyhow::Result<i32> {
    let env = match options.environment.as_deref() {
        Some(id) => Some(
            settings
                .environment(id)
                .ok_or_else(|| anyhow::anyhow!("unknown environment: {}", id))?,
        ),
        None => None,
    };
    let environment_id = env.map(|e| e.id.as_str()).unwrap_or(DEFAULT_ENVIRONMENT);

    let backend = connect(options.dry_run).await?;
    let supervisor = SupervisorConfig::from_settings(&settings.supervisor)?;
    let cache = Arc::new(PhaseImageCache::new(backend.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(SupervisorLauncher::new(backend, cache, supervisor, tx));
    let controller = AdmissionController::with_limits(launcher.clone(), settings.environment_limits());

    let selection = selection(settings, &options.agents)?;

    let mut tasks = HashMap::new();
    for prompt in &options.prompts {
        let (task_id, request) = request(settings, env, environment_id, prompt, selection.as_ref());
        if !options.json {
            for (host, target) in describe_mounts(&request.config) {
                println!("[{}] mount {} -> {}", task_id, host.display(), target);
            }
        }
        tasks.insert(task_id, request.task.clone());

        match controller.on_task_submitted(request) {
            Admission::Started => {
                if let Some(task) = tasks.get_mut(&task_id) {
                    task.start();
                }
            }
            Admission::Queued { position } => {
                if !options.json {
                    println!("[{}] queued in {} at position {}", task_id, environment_id, position + 1);
                }
            }
        }
    }

    let mut remaining = tasks.len();
    let mut exit_code = 0i64;
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while remaining > 0 {
        tokio::select! {
            signal = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if let Err(e) = signal {
                    warn!(error = %e, "Cannot listen for Ctrl-C");
                    continue;
                }

                for task_id in controller.queued() {
                    if controller.cancel_queued(task_id).is_some() {
                        remaining -= 1;
                        tasks.remove(&task_id);
                        if exit_code == 0 {
                            exit_code = CANCELLED_EXIT_CODE;
                        }
                    }
                }
                let stopped = launcher.stop_all();
                eprintln!("\nInterrupted: stopping {} running task(s)", stopped);
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Some(task) = tasks.get_mut(&event.task_id) else { continue };
                task.apply(&event);

                if options.json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    render(task, &event);
                }

                if let TaskEventKind::Done(outcome) = &event.kind {
                    remaining -= 1;
                    if exit_code == 0 {
                        exit_code = outcome.exit_code();
                    }
                }
            }
        }
    }

    info!(tasks = tasks.len(), exit_code, "All tasks finished");
    Ok(i32::try_from(exit_code).unwrap_or(1))
}

async fn connect(dry_run: bool) -> anyhow::Result<Arc<dyn ContainerBackend>> {
    let backend: Arc<dyn ContainerBackend> = if dry_run {
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(DockerBackend::connect()?)
    };

    if !backend.is_available().await {
        anyhow::bail!("container runtime ({}) is not reachable", backend.name());
    }
    info!(backend = backend.name(), "Container backend ready");
    Ok(backend)
}

/// Agent selection from `--agent` flags, falling back to settings
fn selection(settings: &Settings, agents: &[String]) -> anyhow::Result<Option<AgentSelection>> {
    if agents.is_empty() {
        let selection = AgentSelection::from_settings(&settings.agents);
        return Ok((!selection.is_empty()).then_some(selection));
    }

    let instances = agents
        .iter()
        .map(|cli| {
            let kind = AgentKind::from_cli(cli)?;
            Ok(AgentInstance::new(kind.cli_name(), kind.cli_name()))
        })
        .collect::<caravel_foundation::Result<Vec<_>>>()?;
    Ok(Some(AgentSelection::chained(instances)))
}

fn request(
    settings: &Settings,
    env: Option<&EnvironmentSettings>,
    environment_id: &str,
    prompt: &str,
    selection: Option<&AgentSelection>,
) -> (TaskId, TaskRequest) {
    let task = Task::new(prompt, environment_id);
    let config = DockerRunnerConfig::from_settings(task.task_id, prompt, settings, env);
    let task = task.with_agent(config.agent_cli.clone(), config.agent_cli_args.clone());
    let task_id = task.task_id;

    let mut request = TaskRequest::new(task, config);
    if let Some(selection) = selection {
        request = request.with_selection(selection.clone());
    }
    (task_id, request)
}

fn render(task: &Task, event: &TaskEvent) {
    let id = task.task_id;
    match &event.kind {
        TaskEventKind::State(state) => {
            let container = state.container_id.as_deref().map(short).unwrap_or("-");
            println!("[{}] {} {} ({})", id, task.status.symbol(), state.status.as_str(), container);
        }
        TaskEventKind::Log(line) => println!("[{}] {}", id, line),
        TaskEventKind::Retry {
            attempt,
            agent_id,
            delay,
        } => println!("[{}] ↻ {} attempt {} failed, retrying in {:.1?}", id, agent_id, attempt, delay),
        TaskEventKind::AgentSwitch { from, to } => println!("[{}] ⇢ {} → {}", id, from, to),
        TaskEventKind::Prepared(checkout) => println!(
            "[{}] branch {} from {} at {}",
            id,
            checkout.branch,
            checkout.base_branch,
            checkout.repo_root.display()
        ),
        TaskEventKind::Done(outcome) => {
            match outcome {
                RunOutcome::Succeeded { agent_id, pr } => {
                    println!("[{}] {} done by {}", id, task.status.symbol(), agent_id);
                    if let Some(title) = pr.as_ref().and_then(|p| p.title.as_deref()) {
                        println!("[{}] PR: {}", id, title);
                    }
                }
                RunOutcome::Failed {
                    agent_id,
                    exit_code,
                    error,
                    class,
                } => println!(
                    "[{}] {} failed on {} ({} error, exit {}): {}",
                    id,
                    task.status.symbol(),
                    agent_id,
                    class,
                    exit_code,
                    error
                ),
                RunOutcome::Cancelled => println!("[{}] {} cancelled", id, task.status.symbol()),
            }
            if let Some(duration) = task.duration() {
                println!("[{}] took {:.1?}", id, duration);
            }
        }
    }
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
