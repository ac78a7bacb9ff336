//! # caravel-task
//!
//! Task supervision and container execution for Caravel.
//! Runs AI coding agents inside containers with retry, fallback and
//! per-environment admission control.
//!
//! ## Features
//!
//! - Agent chains with classified-error retry and exponential backoff
//! - One-container-per-attempt workers with streamed logs
//! - Content-addressed caching of provisioning phase images
//! - Per-environment concurrency caps with a FIFO queue
//! - **Docker backend (bollard) and a scripted in-memory backend**

pub mod admission;
pub mod agent;
pub mod cache;
pub mod classify;
pub mod config;
pub mod container;
pub mod environment;
pub mod event;
pub mod launcher;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod vcs;
pub mod worker;

// Task model
pub use state::{ContainerState, ContainerStatus, TaskStatus};
pub use task::{Task, TaskId};
pub use event::{EventSink, RunOutcome, TaskEvent, TaskEventKind, CANCELLED_EXIT_CODE};

// Agents
pub use agent::{AgentInstance, AgentRotation, AgentSelection, DEFAULT_AGENT_ID};

// Run configuration
pub use config::{DockerRunnerConfig, Phase, PreflightScripts};
pub use caravel_foundation::EnvironmentSettings as Environment;
pub use environment::{probe_git_dir, RepoProbeCache};

// Container system
pub use container::{
    ContainerBackend, ContainerError, ContainerSpec, DockerBackend, LogChunk, MemoryBackend,
    ScriptedRun, VolumeMount,
};
pub use cache::{PhaseImageCache, PhaseKey};
pub use worker::{AttemptExit, ContainerWorker, WorkerError, WorkerHandle, WORKSPACE_DIR};

// Supervision
pub use classify::{AttemptFailure, ErrorClassifier};
pub use supervisor::{
    build_agent_config, calculate_backoff, initialize_agent_chain, SupervisorConfig,
    SupervisorHandle, TaskSupervisor,
};

// Admission
pub use admission::{Admission, AdmissionController, AdmissionTicket, TaskLauncher, TaskRequest};
pub use launcher::SupervisorLauncher;

// VCS collaborators
pub use vcs::{PrMetadata, PrMetadataSource, VcsCheckout, VcsError, VcsPreparer, VcsRequest};
