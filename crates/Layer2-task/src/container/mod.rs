//! Container runtime access
//!
//! The worker and the phase-image cache talk to the container engine only
//! through [`ContainerBackend`]. [`DockerBackend`] drives a real daemon via
//! bollard; [`MemoryBackend`] is a scripted stand-in used by tests and by
//! `caravel run --dry-run`.

mod docker;
mod memory;

pub use docker::DockerBackend;
pub use memory::{MemoryBackend, ScriptedRun};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Label key carrying the full task id
pub const LABEL_TASK: &str = "caravel.task";

/// Label key describing why a container exists (`agent` or `phase-build`)
pub const LABEL_ROLE: &str = "caravel.role";

/// Container runtime errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed to pull {image}: {message}")]
    PullFailed { image: String, message: String },

    #[error("no such container or image: {0}")]
    NotFound(String),

    #[error("invalid mount '{0}'")]
    InvalidMount(String),

    #[error("container runtime timed out: {0}")]
    Timeout(String),

    #[error("connection to container runtime failed: {0}")]
    Connection(String),

    #[error("container runtime returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

/// Volume mount configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path
    pub host_path: PathBuf,
    /// Container path
    pub container_path: PathBuf,
    /// Read-only mount
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Parse `host:container[:ro|rw]`
    ///
    /// Both sides must be non-empty and the container side must be absolute.
    pub fn parse(spec: &str) -> Result<Self, ContainerError> {
        let invalid = || ContainerError::InvalidMount(spec.to_string());

        let parts: Vec<&str> = spec.split(':').collect();
        let (host, container, read_only) = match parts.as_slice() {
            [host, container] => (*host, *container, false),
            [host, container, "ro"] => (*host, *container, true),
            [host, container, "rw"] => (*host, *container, false),
            _ => return Err(invalid()),
        };

        if host.trim().is_empty() || !container.starts_with('/') {
            return Err(invalid());
        }

        let mount = Self::new(host, container);
        Ok(if read_only { mount.read_only() } else { mount })
    }

    /// Docker bind string
    pub fn to_bind(&self) -> String {
        let ro = if self.read_only { ":ro" } else { "" };
        format!(
            "{}:{}{}",
            self.host_path.to_string_lossy(),
            self.container_path.to_string_lossy(),
            ro
        )
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container image
    pub image: String,
    /// Container name (engine-assigned if None)
    pub name: Option<String>,
    /// Command to run
    pub command: Vec<String>,
    /// Working directory in container
    pub working_dir: Option<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Volume mounts
    pub volumes: Vec<VolumeMount>,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// `KEY=value` pairs in key order
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn binds(&self) -> Vec<String> {
        self.volumes.iter().map(VolumeMount::to_bind).collect()
    }
}

/// One chunk of container output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stderr: bool,
    pub text: String,
}

impl LogChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stderr: false,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stderr: true,
            text: text.into(),
        }
    }
}

/// Container engine operations used by the core
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Check if the engine answers
    async fn is_available(&self) -> bool;

    /// Whether `image` is present locally
    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError>;

    /// Pull an image
    async fn pull_image(&self, image: &str) -> Result<(), ContainerError>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    async fn start_container(&self, id: &str) -> Result<(), ContainerError>;

    /// Follow stdout and stderr until the container exits
    fn log_stream(&self, id: &str) -> BoxStream<'static, Result<LogChunk, ContainerError>>;

    /// Wait for the container to stop and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i64, ContainerError>;

    /// Stop a container, killing it after `timeout`
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), ContainerError>;

    /// Remove a container
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ContainerError>;

    /// Commit a stopped container's filesystem as `reference` (`repo:tag`)
    async fn commit_container(&self, id: &str, reference: &str) -> Result<(), ContainerError>;
}

/// Splits output chunks into complete lines
///
/// Chunks from the engine do not respect line boundaries; partial lines are
/// held until the next newline or [`LineBuffer::finish`].
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Remaining partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_mount() {
        let mount = VolumeMount::new("/host/path", "/container/path").read_only();
        assert!(mount.read_only);
        assert_eq!(mount.to_bind(), "/host/path:/container/path:ro");
    }

    #[test]
    fn test_parse_mount() {
        let rw = VolumeMount::parse("/data:/mnt/data").unwrap();
        assert_eq!(rw, VolumeMount::new("/data", "/mnt/data"));

        let ro = VolumeMount::parse("/cache:/root/.cache:ro").unwrap();
        assert!(ro.read_only);

        let explicit = VolumeMount::parse("./src:/src:rw").unwrap();
        assert!(!explicit.read_only);
    }

    #[test]
    fn test_parse_mount_rejects_malformed() {
        for spec in ["/only-one", ":/x", "/a:relative", "/a:/b:rx", "/a:/b:ro:extra", ""] {
            assert!(
                matches!(VolumeMount::parse(spec), Err(ContainerError::InvalidMount(_))),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn test_spec_builder() {
        let spec = ContainerSpec::new("ubuntu:22.04")
            .with_command(vec!["echo".to_string(), "hello".to_string()])
            .with_env("B", "2")
            .with_env("A", "1")
            .with_volume(VolumeMount::new("/w", "/workspace"))
            .with_label(LABEL_ROLE, "agent");

        assert_eq!(spec.env_list(), vec!["A=1", "B=2"]);
        assert_eq!(spec.binds(), vec!["/w:/workspace"]);
        assert_eq!(spec.label(LABEL_ROLE), Some("agent"));
    }

    #[test]
    fn test_line_buffer_joins_partial_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push("hel").is_empty());
        assert_eq!(buffer.push("lo\nwor"), vec!["hello"]);
        assert_eq!(buffer.push("ld\r\n\n"), vec!["world", ""]);
        assert_eq!(buffer.push("tail"), Vec::<String>::new());
        assert_eq!(buffer.finish().as_deref(), Some("tail"));
        assert!(buffer.finish().is_none());
    }
}
