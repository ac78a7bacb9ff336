//! Agent instances and selections
//!
//! An [`AgentSelection`] is validated once, at construction: fallback edges
//! and pins that point at unknown agents are dropped there, so every later
//! lookup can trust the table.

use caravel_foundation::{AgentSettings, SelectionMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Agent id of the synthetic agent used when no selection is configured
pub const DEFAULT_AGENT_ID: &str = "default";

/// One configured agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Unique within the owning selection
    pub agent_id: String,

    /// Which agent program to invoke
    pub agent_cli: String,

    /// Host config directory override; empty inherits the base config
    pub config_dir: String,

    /// Extra arguments, shell-quoted
    pub cli_flags: String,
}

impl AgentInstance {
    pub fn new(agent_id: impl Into<String>, agent_cli: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_cli: agent_cli.into(),
            config_dir: String::new(),
            cli_flags: String::new(),
        }
    }

    pub fn with_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn with_cli_flags(mut self, flags: impl Into<String>) -> Self {
        self.cli_flags = flags.into();
        self
    }
}

/// Ordered agents plus fallback edges
///
/// Deserialization goes through [`AgentSelection::new`], so a decoded
/// selection is validated like a constructed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawAgentSelection")]
pub struct AgentSelection {
    agents: Vec<AgentInstance>,
    mode: SelectionMode,
    fallbacks: BTreeMap<String, String>,
    pinned_agent_id: Option<String>,
}

/// Wire form of [`AgentSelection`] before validation
#[derive(Deserialize)]
struct RawAgentSelection {
    agents: Vec<AgentInstance>,
    #[serde(default)]
    mode: SelectionMode,
    #[serde(default)]
    fallbacks: BTreeMap<String, String>,
    #[serde(default)]
    pinned_agent_id: Option<String>,
}

impl From<RawAgentSelection> for AgentSelection {
    fn from(raw: RawAgentSelection) -> Self {
        Self::new(raw.agents, raw.mode, raw.fallbacks, raw.pinned_agent_id)
    }
}

impl AgentSelection {
    /// Build a selection, dropping duplicate ids and dangling references
    pub fn new(
        agents: Vec<AgentInstance>,
        mode: SelectionMode,
        fallbacks: BTreeMap<String, String>,
        pinned_agent_id: Option<String>,
    ) -> Self {
        let mut seen = HashSet::new();
        let agents: Vec<AgentInstance> = agents
            .into_iter()
            .filter(|agent| {
                let fresh = seen.insert(agent.agent_id.clone());
                if !fresh {
                    warn!(agent_id = %agent.agent_id, "Dropping duplicate agent id");
                }
                fresh
            })
            .collect();

        let fallbacks = fallbacks
            .into_iter()
            .filter(|(from, to)| {
                let valid = seen.contains(from) && seen.contains(to);
                if !valid {
                    debug!(from = %from, to = %to, "Dropping dangling fallback");
                }
                valid
            })
            .collect();

        let pinned_agent_id = pinned_agent_id.filter(|id| seen.contains(id));

        Self {
            agents,
            mode,
            fallbacks,
            pinned_agent_id,
        }
    }

    /// Agents in order, each falling back to the next one
    pub fn chained(agents: Vec<AgentInstance>) -> Self {
        let fallbacks = agents
            .windows(2)
            .map(|pair| (pair[0].agent_id.clone(), pair[1].agent_id.clone()))
            .collect();
        Self::new(agents, SelectionMode::Fallback, fallbacks, None)
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        let agents = settings
            .entries
            .iter()
            .map(|entry| {
                AgentInstance::new(&entry.id, &entry.cli)
                    .with_config_dir(&entry.config_dir)
                    .with_cli_flags(&entry.cli_flags)
            })
            .collect();
        Self::new(
            agents,
            settings.mode,
            settings.fallbacks.clone(),
            settings.pinned.clone(),
        )
    }

    pub fn agents(&self) -> &[AgentInstance] {
        &self.agents
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn fallbacks(&self) -> &BTreeMap<String, String> {
        &self.fallbacks
    }

    pub fn pinned_agent_id(&self) -> Option<&str> {
        self.pinned_agent_id.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentInstance> {
        self.agents.iter().find(|agent| agent.agent_id == agent_id)
    }

    /// Fallback target of `agent_id`, if any
    pub fn fallback_for(&self, agent_id: &str) -> Option<&AgentInstance> {
        self.fallbacks.get(agent_id).and_then(|to| self.get(to))
    }

    /// Copy with a different pin; unknown ids clear the pin
    pub fn with_pinned(mut self, agent_id: Option<String>) -> Self {
        self.pinned_agent_id = agent_id.filter(|id| self.get(id).is_some());
        self
    }
}

/// Chooses the starting agent for successive submissions
///
/// An explicit pin always wins. Otherwise `RoundRobin` cycles through the
/// agents, `LeastUsed` picks the agent started the fewest times (ties go to
/// list order) and `Fallback` keeps the first agent.
#[derive(Debug, Default)]
pub struct AgentRotation {
    inner: Mutex<RotationState>,
}

#[derive(Debug, Default)]
struct RotationState {
    cursor: usize,
    starts: HashMap<String, u64>,
}

impl AgentRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the starting agent for one submission and record its use
    pub fn assign(&self, selection: AgentSelection) -> AgentSelection {
        if selection.is_empty() {
            return selection;
        }

        let mut state = self.inner.lock();
        let chosen = match (selection.pinned_agent_id(), selection.mode()) {
            (Some(pinned), _) => pinned.to_string(),
            (None, SelectionMode::Fallback) => selection.agents()[0].agent_id.clone(),
            (None, SelectionMode::RoundRobin) => {
                let index = state.cursor % selection.agents().len();
                state.cursor = state.cursor.wrapping_add(1);
                selection.agents()[index].agent_id.clone()
            }
            (None, SelectionMode::LeastUsed) => selection
                .agents()
                .iter()
                .enumerate()
                .min_by_key(|(index, agent)| {
                    (state.starts.get(&agent.agent_id).copied().unwrap_or(0), *index)
                })
                .map(|(_, agent)| agent.agent_id.clone())
                .unwrap_or_default(),
        };

        *state.starts.entry(chosen.clone()).or_default() += 1;
        drop(state);

        selection.with_pinned(Some(chosen))
    }

    /// Number of runs started with `agent_id`
    pub fn starts(&self, agent_id: &str) -> u64 {
        self.inner.lock().starts.get(agent_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(ids: &[&str]) -> Vec<AgentInstance> {
        ids.iter().map(|id| AgentInstance::new(*id, "codex")).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_dangling_references_dropped_at_construction() {
        let selection = AgentSelection::new(
            agents(&["a", "b"]),
            SelectionMode::Fallback,
            edges(&[("a", "b"), ("b", "ghost"), ("ghost", "a")]),
            Some("nobody".into()),
        );

        assert_eq!(selection.fallbacks(), &edges(&[("a", "b")]));
        assert!(selection.pinned_agent_id().is_none());
    }

    #[test]
    fn test_deserialized_selection_is_validated() {
        let json = r#"{
            "agents": [
                {"agent_id": "a", "agent_cli": "codex", "config_dir": "", "cli_flags": ""},
                {"agent_id": "a", "agent_cli": "claude", "config_dir": "", "cli_flags": ""}
            ],
            "mode": "fallback",
            "fallbacks": {"a": "ghost", "ghost": "a"},
            "pinned_agent_id": "nobody"
        }"#;

        let selection: AgentSelection = serde_json::from_str(json).unwrap();

        assert_eq!(selection.agents().len(), 1);
        assert_eq!(selection.agents()[0].agent_cli, "codex");
        assert!(selection.fallbacks().is_empty());
        assert!(selection.pinned_agent_id().is_none());
    }

    #[test]
    fn test_serialized_selection_decodes_unchanged() {
        let selection = AgentSelection::chained(agents(&["a", "b"])).with_pinned(Some("b".into()));
        let json = serde_json::to_string(&selection).unwrap();
        let decoded: AgentSelection = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, selection);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let mut list = agents(&["a", "a"]);
        list[1].agent_cli = "claude".into();
        let selection = AgentSelection::new(list, SelectionMode::Fallback, BTreeMap::new(), None);

        assert_eq!(selection.agents().len(), 1);
        assert_eq!(selection.agents()[0].agent_cli, "codex");
    }

    #[test]
    fn test_chained() {
        let selection = AgentSelection::chained(agents(&["a", "b", "c"]));
        assert_eq!(selection.fallback_for("a").unwrap().agent_id, "b");
        assert_eq!(selection.fallback_for("b").unwrap().agent_id, "c");
        assert!(selection.fallback_for("c").is_none());
    }

    #[test]
    fn test_round_robin_rotation() {
        let rotation = AgentRotation::new();
        let selection =
            AgentSelection::new(agents(&["a", "b", "c"]), SelectionMode::RoundRobin, BTreeMap::new(), None);

        let picks: Vec<_> = (0..4)
            .map(|_| {
                rotation
                    .assign(selection.clone())
                    .pinned_agent_id()
                    .map(str::to_string)
            })
            .collect();

        assert_eq!(
            picks,
            vec![Some("a".into()), Some("b".into()), Some("c".into()), Some("a".into())]
        );
    }

    #[test]
    fn test_least_used_rotation() {
        let rotation = AgentRotation::new();
        let base = AgentSelection::new(agents(&["a", "b"]), SelectionMode::LeastUsed, BTreeMap::new(), None);

        // An explicit pin counts as a use of that agent.
        rotation.assign(base.clone().with_pinned(Some("a".into())));

        let pick = rotation.assign(base.clone());
        assert_eq!(pick.pinned_agent_id(), Some("b"));
        assert_eq!(rotation.starts("a"), 1);
        assert_eq!(rotation.starts("b"), 1);

        let pick = rotation.assign(base);
        assert_eq!(pick.pinned_agent_id(), Some("a"));
    }

    #[test]
    fn test_fallback_mode_starts_first() {
        let rotation = AgentRotation::new();
        let selection = AgentSelection::chained(agents(&["x", "y"]));
        for _ in 0..3 {
            assert_eq!(rotation.assign(selection.clone()).pinned_agent_id(), Some("x"));
        }
    }
}
