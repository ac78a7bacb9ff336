//! Per-run configuration

use crate::task::TaskId;
use crate::vcs::VcsRequest;
use caravel_foundation::{EnvironmentSettings, PhaseCaching, Settings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Provisioning phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    System,
    Desktop,
    Settings,
    Environment,
}

impl Phase {
    /// Fixed provisioning order
    pub const ORDER: [Phase; 4] = [Phase::System, Phase::Desktop, Phase::Settings, Phase::Environment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::System => "system",
            Phase::Desktop => "desktop",
            Phase::Settings => "settings",
            Phase::Environment => "environment",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preflight scripts per phase; `None` or blank means the phase is skipped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightScripts {
    pub system: Option<String>,
    pub desktop: Option<String>,
    pub settings: Option<String>,
    pub environment: Option<String>,
}

impl PreflightScripts {
    pub fn get(&self, phase: Phase) -> Option<&str> {
        let script = match phase {
            Phase::System => &self.system,
            Phase::Desktop => &self.desktop,
            Phase::Settings => &self.settings,
            Phase::Environment => &self.environment,
        };
        script.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Immutable parameters of one run
///
/// Per-attempt configs are derived from this by overriding the agent fields
/// only; see `supervisor::build_agent_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerRunnerConfig {
    pub task_id: TaskId,
    pub image: String,
    pub host_config_dir: Option<PathBuf>,
    pub host_workdir: PathBuf,
    pub agent_cli: String,
    pub agent_cli_args: Vec<String>,
    pub prompt: String,
    pub env_vars: BTreeMap<String, String>,
    /// `host:container[:ro|rw]`
    pub extra_mounts: Vec<String>,
    pub preflight: PreflightScripts,
    pub caching: PhaseCaching,
    pub desktop_enabled: bool,
    pub vcs: Option<VcsRequest>,
}

impl DockerRunnerConfig {
    pub fn new(task_id: TaskId, image: impl Into<String>, host_workdir: impl Into<PathBuf>) -> Self {
        Self {
            task_id,
            image: image.into(),
            host_config_dir: None,
            host_workdir: host_workdir.into(),
            agent_cli: "codex".to_string(),
            agent_cli_args: Vec::new(),
            prompt: String::new(),
            env_vars: BTreeMap::new(),
            extra_mounts: Vec::new(),
            preflight: PreflightScripts::default(),
            caching: PhaseCaching::default(),
            desktop_enabled: false,
            vcs: None,
        }
    }

    /// Base config for a task in `env`, using global settings as defaults
    pub fn from_settings(
        task_id: TaskId,
        prompt: impl Into<String>,
        settings: &Settings,
        env: Option<&EnvironmentSettings>,
    ) -> Self {
        let image = env
            .and_then(|e| e.image.clone())
            .unwrap_or_else(|| settings.default_image.clone());
        let workdir = env
            .and_then(|e| e.host_workdir.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::new(task_id, image, workdir).with_prompt(prompt);
        config.host_config_dir = settings.host_config_dir.clone();
        config.caching = settings.caching;
        config.preflight = PreflightScripts {
            system: settings.system_preflight.clone(),
            desktop: settings.desktop_preflight.clone(),
            settings: settings.settings_preflight.clone(),
            environment: env.and_then(|e| e.preflight.clone()),
        };
        if let Some(env) = env {
            config.desktop_enabled = env.desktop_enabled;
            config.env_vars = env.env_vars.clone();
            config.extra_mounts = env.extra_mounts.clone();
        }
        config
    }

    pub fn with_agent(mut self, cli: impl Into<String>, args: Vec<String>) -> Self {
        self.agent_cli = cli.into();
        self.agent_cli_args = args;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_mount(mut self, spec: impl Into<String>) -> Self {
        self.extra_mounts.push(spec.into());
        self
    }

    pub fn with_preflight(mut self, phase: Phase, script: impl Into<String>) -> Self {
        let slot = match phase {
            Phase::System => &mut self.preflight.system,
            Phase::Desktop => &mut self.preflight.desktop,
            Phase::Settings => &mut self.preflight.settings,
            Phase::Environment => &mut self.preflight.environment,
        };
        *slot = Some(script.into());
        self
    }

    pub fn with_caching(mut self, caching: PhaseCaching) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_vcs(mut self, request: VcsRequest) -> Self {
        self.vcs = Some(request);
        self
    }

    /// Whether `phase` runs at all for this config
    pub fn phase_enabled(&self, phase: Phase) -> bool {
        if phase == Phase::Desktop && !self.desktop_enabled {
            return false;
        }
        self.preflight.get(phase).is_some()
    }

    /// Whether `phase` may be baked into a cached image
    pub fn phase_cached(&self, phase: Phase) -> bool {
        match phase {
            Phase::System => self.caching.system,
            Phase::Desktop => self.caching.desktop,
            Phase::Settings => self.caching.settings,
            Phase::Environment => self.caching.environment,
        }
    }
}
