use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Placeholder token replaced by the agent's extra CLI arguments
pub const ARGS_TOKEN: &str = "{args}";

/// Placeholder token replaced by the task prompt
pub const PROMPT_TOKEN: &str = "{prompt}";

/// 에이전트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Codex,
    Claude,
    Copilot,
    Gemini,
}

/// 에이전트 기능 테이블 항목
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentCapabilities {
    /// 표시 이름
    pub display_name: &'static str,
    /// 프로젝트 URL
    pub url: &'static str,
    /// 기본 명령 템플릿 (`{args}`, `{prompt}` 치환)
    pub command_template: &'static [&'static str],
    /// 컨테이너 내부 설정 디렉토리
    pub config_mount: &'static str,
}

const CODEX: AgentCapabilities = AgentCapabilities {
    display_name: "Codex",
    url: "https://github.com/openai/codex",
    command_template: &["codex", "exec", "--skip-git-repo-check", ARGS_TOKEN, PROMPT_TOKEN],
    config_mount: "/home/agent/.codex",
};

const CLAUDE: AgentCapabilities = AgentCapabilities {
    display_name: "Claude",
    url: "https://docs.anthropic.com/en/docs/claude-code",
    command_template: &["claude", ARGS_TOKEN, "-p", PROMPT_TOKEN],
    config_mount: "/home/agent/.claude",
};

const COPILOT: AgentCapabilities = AgentCapabilities {
    display_name: "GitHub Copilot",
    url: "https://github.com/github/copilot-cli",
    command_template: &["copilot", ARGS_TOKEN, "-p", PROMPT_TOKEN],
    config_mount: "/home/agent/.copilot",
};

const GEMINI: AgentCapabilities = AgentCapabilities {
    display_name: "Gemini",
    url: "https://github.com/google-gemini/gemini-cli",
    command_template: &["gemini", ARGS_TOKEN, "-p", PROMPT_TOKEN],
    config_mount: "/home/agent/.gemini",
};

impl AgentKind {
    /// All supported agents, in display order
    pub const ALL: [AgentKind; 4] = [Self::Codex, Self::Claude, Self::Copilot, Self::Gemini];

    /// CLI 이름
    pub fn cli_name(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Copilot => "copilot",
            Self::Gemini => "gemini",
        }
    }

    /// 기능 테이블 조회
    pub fn capabilities(&self) -> &'static AgentCapabilities {
        match self {
            Self::Codex => &CODEX,
            Self::Claude => &CLAUDE,
            Self::Copilot => &COPILOT,
            Self::Gemini => &GEMINI,
        }
    }

    /// 표시 이름
    pub fn display_name(&self) -> &'static str {
        self.capabilities().display_name
    }

    /// Parse an agent CLI name (case-insensitive, surrounding whitespace ignored)
    pub fn from_cli(name: &str) -> Result<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.cli_name() == normalized)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))
    }

    /// Render the container command for this agent
    ///
    /// `{args}` expands to zero or more arguments in place; `{prompt}` becomes
    /// a single argument.
    pub fn render_command(&self, args: &[String], prompt: &str) -> Vec<String> {
        let mut command = Vec::with_capacity(self.capabilities().command_template.len() + args.len());
        for token in self.capabilities().command_template {
            match *token {
                ARGS_TOKEN => command.extend(args.iter().cloned()),
                PROMPT_TOKEN => command.push(prompt.to_string()),
                other => command.push(other.to_string()),
            }
        }
        command
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cli_name())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_cli(s)
    }
}

impl Default for AgentKind {
    fn default() -> Self {
        Self::Codex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cli() {
        assert_eq!(AgentKind::from_cli("Claude ").unwrap(), AgentKind::Claude);
        assert_eq!("codex".parse::<AgentKind>().unwrap(), AgentKind::Codex);
        assert!(matches!(
            AgentKind::from_cli("aider"),
            Err(Error::UnknownAgent(name)) if name == "aider"
        ));
    }

    #[test]
    fn test_render_command_splices_args() {
        let args = vec!["--model".to_string(), "o3".to_string()];
        let command = AgentKind::Codex.render_command(&args, "fix the bug");

        assert_eq!(
            command,
            vec!["codex", "exec", "--skip-git-repo-check", "--model", "o3", "fix the bug"]
        );
    }

    #[test]
    fn test_render_command_without_args() {
        let command = AgentKind::Claude.render_command(&[], "hello world");
        assert_eq!(command, vec!["claude", "-p", "hello world"]);
    }

    #[test]
    fn test_catalog_is_complete() {
        for kind in AgentKind::ALL {
            let caps = kind.capabilities();
            assert!(!caps.display_name.is_empty());
            assert!(caps.url.starts_with("https://"));
            assert!(caps.config_mount.starts_with('/'));
            assert!(caps.command_template.contains(&PROMPT_TOKEN));
        }
    }
}
