//! Settings - 실행 설정
//!
//! Immutable once built. Construct one per run from a migrated JSON document
//! and hand out `&Settings`.

use super::migrate::{migrate, CURRENT_VERSION};
use crate::error::ErrorClass;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_image() -> String {
    "ghcr.io/caravel-dev/agent-base:latest".to_string()
}

fn default_unlimited() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Settings (통합)
// ============================================================================

/// Caravel 통합 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// 기본 컨테이너 이미지
    #[serde(default = "default_image")]
    pub default_image: String,

    /// 호스트의 에이전트 설정 디렉토리
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_config_dir: Option<PathBuf>,

    /// System phase preflight script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_preflight: Option<String>,

    /// Settings phase preflight script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_preflight: Option<String>,

    /// Desktop phase preflight script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_preflight: Option<String>,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub caching: PhaseCaching,

    #[serde(default)]
    pub agents: AgentSettings,

    #[serde(default)]
    pub environments: Vec<EnvironmentSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            default_image: default_image(),
            host_config_dir: None,
            system_preflight: None,
            settings_preflight: None,
            desktop_preflight: None,
            supervisor: SupervisorSettings::default(),
            caching: PhaseCaching::default(),
            agents: AgentSettings::default(),
            environments: Vec::new(),
        }
    }
}

impl Settings {
    /// Parse, migrate and validate a settings document
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    /// Migrate and validate an already-parsed settings document
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let settings: Settings = serde_json::from_value(migrate(value)?)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_image.trim().is_empty() {
            return Err(Error::Config("defaultImage must not be empty".into()));
        }
        self.supervisor.validate()?;

        let mut seen = std::collections::HashSet::new();
        for env in &self.environments {
            if env.id.trim().is_empty() {
                return Err(Error::Config("environment id must not be empty".into()));
            }
            if !seen.insert(env.id.as_str()) {
                return Err(Error::Config(format!("duplicate environment id: {}", env.id)));
            }
        }
        Ok(())
    }

    pub fn environment(&self, id: &str) -> Option<&EnvironmentSettings> {
        self.environments.iter().find(|env| env.id == id)
    }

    /// Per-environment concurrency caps (negative = unlimited)
    pub fn environment_limits(&self) -> HashMap<String, i64> {
        self.environments
            .iter()
            .map(|env| (env.id.clone(), env.max_agents_running))
            .collect()
    }
}

// ============================================================================
// Supervisor Settings
// ============================================================================

/// Retry/backoff knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSettings {
    /// Retries per agent after the first attempt
    #[serde(default = "SupervisorSettings::default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "SupervisorSettings::default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "SupervisorSettings::default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Fraction in `[0, 1]`
    #[serde(default = "SupervisorSettings::default_jitter")]
    pub jitter: f64,

    #[serde(default = "SupervisorSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_true")]
    pub fatal_aborts_chain: bool,

    /// Exit code → class overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exit_code_rules: BTreeMap<i64, ErrorClass>,

    /// Ordered message pattern rules, first match wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_rules: Vec<MessageRule>,
}

impl SupervisorSettings {
    fn default_max_retries() -> u32 {
        2
    }

    fn default_backoff_base_ms() -> u64 {
        2_000
    }

    fn default_backoff_cap_ms() -> u64 {
        60_000
    }

    fn default_jitter() -> f64 {
        0.2
    }

    fn default_poll_interval_ms() -> u64 {
        100
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(format!(
                "supervisor.jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(Error::Config(
                "supervisor.backoffBaseMs must not exceed backoffCapMs".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("supervisor.pollIntervalMs must be positive".into()));
        }
        Ok(())
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            backoff_cap_ms: Self::default_backoff_cap_ms(),
            jitter: Self::default_jitter(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            fatal_aborts_chain: true,
            exit_code_rules: BTreeMap::new(),
            message_rules: Vec::new(),
        }
    }
}

/// Regex rule mapping an error message to a class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRule {
    pub pattern: String,
    pub class: ErrorClass,
}

// ============================================================================
// Phase Caching
// ============================================================================

/// Which provisioning phases may be baked into cached images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCaching {
    #[serde(default = "default_true")]
    pub system: bool,
    #[serde(default = "default_true")]
    pub desktop: bool,
    #[serde(default = "default_true")]
    pub settings: bool,
    #[serde(default = "default_true")]
    pub environment: bool,
}

impl Default for PhaseCaching {
    fn default() -> Self {
        Self {
            system: true,
            desktop: true,
            settings: true,
            environment: true,
        }
    }
}

impl PhaseCaching {
    pub fn disabled() -> Self {
        Self {
            system: false,
            desktop: false,
            settings: false,
            environment: false,
        }
    }
}

// ============================================================================
// Agents
// ============================================================================

/// How the starting agent is chosen for each new task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    RoundRobin,
    LeastUsed,
    #[default]
    Fallback,
}

/// One configured agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    pub cli: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cli_flags: String,
}

/// Agent selection as stored in settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    #[serde(default)]
    pub mode: SelectionMode,
    #[serde(default)]
    pub entries: Vec<AgentEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fallbacks: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<String>,
}

// ============================================================================
// Environments
// ============================================================================

/// A named execution environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSettings {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Concurrency cap; negative means unlimited
    #[serde(default = "default_unlimited")]
    pub max_agents_running: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_workdir: Option<PathBuf>,

    /// Overrides `Settings::default_image`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Environment phase preflight script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<String>,

    #[serde(default)]
    pub desktop_enabled: bool,

    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    #[serde(default)]
    pub extra_mounts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let settings = Settings::from_json_str("{}").unwrap();

        assert_eq!(settings.version, CURRENT_VERSION);
        assert_eq!(settings.supervisor.max_retries, 2);
        assert_eq!(settings.supervisor.poll_interval_ms, 100);
        assert!(settings.supervisor.fatal_aborts_chain);
        assert!(settings.caching.system);
        assert_eq!(settings.agents.mode, SelectionMode::Fallback);
    }

    #[test]
    fn test_legacy_document_loads() {
        let raw = r#"{
            "maxRetries": 4,
            "environments": [{"id": "web", "maxAgents": 1}],
            "agents": {
                "mode": "round-robin",
                "entries": [{"id": "a", "cli": "codex"}, {"id": "b", "cli": "claude"}],
                "fallbacks": {"a": "b"}
            }
        }"#;

        let settings = Settings::from_json_str(raw).unwrap();

        assert_eq!(settings.supervisor.max_retries, 4);
        assert_eq!(settings.environment("web").unwrap().max_agents_running, 1);
        assert_eq!(settings.agents.mode, SelectionMode::RoundRobin);
        assert_eq!(settings.agents.fallbacks.get("a").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_unlimited_by_default() {
        let settings = Settings::from_json_str(r#"{"environments": [{"id": "x"}]}"#).unwrap();
        assert_eq!(settings.environment_limits().get("x"), Some(&-1));
    }

    #[test]
    fn test_rules_deserialize() {
        let raw = r#"{"version": 3, "supervisor": {
            "exitCodeRules": {"137": "transient"},
            "messageRules": [{"pattern": "quota", "class": "fatal"}]
        }}"#;
        let settings = Settings::from_json_str(raw).unwrap();

        assert_eq!(settings.supervisor.exit_code_rules.get(&137), Some(&ErrorClass::Transient));
        assert_eq!(settings.supervisor.message_rules[0].class, ErrorClass::Fatal);
    }

    #[test]
    fn test_validation_errors() {
        assert!(Settings::from_json_str(r#"{"supervisor": {"jitter": 1.5}}"#).is_err());
        assert!(Settings::from_json_str(
            r#"{"environments": [{"id": "a"}, {"id": "a"}]}"#
        )
        .is_err());
        assert!(Settings::from_json_str(
            r#"{"version": 3, "supervisor": {"backoffBaseMs": 10, "backoffCapMs": 5}}"#
        )
        .is_err());
    }
}
