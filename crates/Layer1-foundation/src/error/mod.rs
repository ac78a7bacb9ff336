//! Error types for Caravel
//!
//! 모든 에러를 중앙에서 관리

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy used for retry/fallback decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Retry on the same agent, then fall back
    Transient,
    /// Never retried on the same agent; fall back immediately
    Config,
    /// Not agent-specific; abort the whole chain
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Config => "config",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Caravel 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported settings version {found} (newest known is {latest})")]
    UnsupportedVersion { found: u32, latest: u32 },

    #[error("Settings migration v{from} failed: {message}")]
    Migration { from: u32, message: String },

    // ========================================================================
    // Agent 관련
    // ========================================================================
    #[error("Unknown agent CLI: {0}")]
    UnknownAgent(String),

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 설정 문제로 인한 에러인지 확인
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::UnsupportedVersion { .. }
                | Error::Migration { .. }
                | Error::UnknownAgent(_)
                | Error::InvalidInput(_)
        )
    }

    /// Migration 에러 생성 헬퍼
    pub fn migration(from: u32, message: impl Into<String>) -> Self {
        Error::Migration {
            from,
            message: message.into(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
