//! Config - 통합 설정 관리
//!
//! - `settings.rs` - 불변 Settings 구조체
//! - `migrate.rs` - 버전별 스키마 마이그레이션

mod migrate;
mod settings;

pub use migrate::{migrate, CURRENT_VERSION};
pub use settings::{
    AgentEntry, AgentSettings, EnvironmentSettings, MessageRule, PhaseCaching, SelectionMode,
    Settings, SupervisorSettings,
};
