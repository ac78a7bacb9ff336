//! # caravel-foundation
//!
//! Foundation layer for Caravel:
//! - Error: 공통 에러 타입과 실패 분류 (Transient / Config / Fatal)
//! - Config: 불변 Settings + 버전별 마이그레이션
//! - Registry: 에이전트 종류와 정적 기능 테이블
//! - Cache: 콘텐츠 해시, 외부 메모이제이션

pub mod cache;
pub mod config;
pub mod error;
pub mod registry;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, ErrorClass, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    migrate, AgentEntry, AgentSettings, EnvironmentSettings, MessageRule, PhaseCaching,
    SelectionMode, Settings, SupervisorSettings, CURRENT_VERSION,
};

// ============================================================================
// Registry (레지스트리)
// ============================================================================
pub use registry::{AgentCapabilities, AgentKind};

// ============================================================================
// Cache (캐시)
// ============================================================================
pub use cache::{content_hash, short_hash, CompositeKey, MemoCache};
