//! Registry - 정적 카탈로그
//!
//! - `agent_kind` - 지원 에이전트 종류와 기능 테이블

pub mod agent_kind;

pub use agent_kind::{AgentCapabilities, AgentKind, ARGS_TOKEN, PROMPT_TOKEN};
